//! PS/2 scan code set 1 to ASCII.

const EXTENDED_PREFIX: u8 = 0xE0;
const RELEASE_BIT: u8 = 0x80;

const LSHIFT: u8 = 0x2A;
const RSHIFT: u8 = 0x36;
const CTRL: u8 = 0x1D;
const ALT: u8 = 0x38;
const CAPS_LOCK: u8 = 0x3A;

/// Unshifted bytes for make codes 0x00..=0x39; 0 marks no printable key.
const PLAIN: [u8; 0x3A] = [
    0, 0x1B, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

const SHIFTED: [u8; 0x3A] = [
    0, 0x1B, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0x08, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ',
];

/// Modifier state carried between scan codes.
#[derive(Debug, Default)]
pub struct ScancodeDecoder {
    shift: bool,
    ctrl: bool,
    alt: bool,
    caps_lock: bool,
    extended: bool,
}

impl ScancodeDecoder {
    pub const fn new() -> Self {
        ScancodeDecoder {
            shift: false,
            ctrl: false,
            alt: false,
            caps_lock: false,
            extended: false,
        }
    }

    /// Feeds one scan code. Returns the byte a key press produced, if any;
    /// releases, modifiers and extended keys (arrows, keypad) produce none.
    pub fn feed(&mut self, scancode: u8) -> Option<u8> {
        if scancode == EXTENDED_PREFIX {
            self.extended = true;
            return None;
        }
        let extended = core::mem::take(&mut self.extended);
        let released = scancode & RELEASE_BIT != 0;
        let code = scancode & !RELEASE_BIT;

        match code {
            LSHIFT | RSHIFT if !extended => {
                self.shift = !released;
                return None;
            }
            CTRL => {
                self.ctrl = !released;
                return None;
            }
            ALT => {
                self.alt = !released;
                return None;
            }
            CAPS_LOCK => {
                if !released {
                    self.caps_lock = !self.caps_lock;
                }
                return None;
            }
            _ => {}
        }
        if released || extended || self.alt {
            return None;
        }

        let plain = *PLAIN.get(code as usize)?;
        if plain == 0 {
            return None;
        }
        if plain.is_ascii_lowercase() {
            if self.ctrl {
                return Some(plain - b'a' + 1);
            }
            let upper = self.shift != self.caps_lock;
            return Some(if upper { plain.to_ascii_uppercase() } else { plain });
        }
        Some(if self.shift { SHIFTED[code as usize] } else { plain })
    }
}
