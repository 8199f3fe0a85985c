pub mod scancodes;

use scancodes::ScancodeDecoder;

/// Character input used by `read` on descriptor 0.
pub trait Keyboard {
    /// Next input byte. `None` means no more input will arrive for this
    /// request, which ends the read early.
    fn read_char(&mut self) -> Option<u8>;
}

#[cfg(target_arch = "x86_64")]
pub use ps2::Ps2Keyboard;

#[cfg(target_arch = "x86_64")]
mod ps2 {
    use super::{Keyboard, ScancodeDecoder};
    use x86_64::instructions::port::Port;

    const DATA_PORT: u16 = 0x60;
    const STATUS_PORT: u16 = 0x64;
    const OUTPUT_FULL: u8 = 0x01;

    /// 8042 controller read by polling; the keyboard IRQ stays masked.
    pub struct Ps2Keyboard {
        data: Port<u8>,
        status: Port<u8>,
        decoder: ScancodeDecoder,
    }

    impl Ps2Keyboard {
        /// # Safety
        /// The 8042 controller must sit at the standard ports.
        pub unsafe fn new() -> Ps2Keyboard {
            let mut keyboard = Ps2Keyboard {
                data: Port::new(DATA_PORT),
                status: Port::new(STATUS_PORT),
                decoder: ScancodeDecoder::new(),
            };
            // Discard whatever the controller latched during boot.
            while keyboard.status.read() & OUTPUT_FULL != 0 {
                let _ = keyboard.data.read();
            }
            crate::log_info!("PS/2 keyboard ready (polled)");
            keyboard
        }

        fn poll_scancode(&mut self) -> Option<u8> {
            unsafe {
                if self.status.read() & OUTPUT_FULL == 0 {
                    return None;
                }
                Some(self.data.read())
            }
        }
    }

    impl Keyboard for Ps2Keyboard {
        /// Spins until a key press decodes to a byte.
        fn read_char(&mut self) -> Option<u8> {
            loop {
                if let Some(byte) = self.poll_scancode().and_then(|sc| self.decoder.feed(sc)) {
                    return Some(byte);
                }
                core::hint::spin_loop();
            }
        }
    }
}
