use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::flat::FlatImage;

/// Named-image lookup the loader reads executables through.
pub trait ImageSource {
    /// Raw image bytes, borrowed for the duration of one load.
    fn read_image(&self, name: &str) -> Option<&[u8]>;
}

/// In-memory image store.
#[derive(Default)]
pub struct RamDisk {
    images: BTreeMap<String, Vec<u8>>,
}

/// Names the built-in image answers to.
pub const BUILTIN_NAMES: [&str; 4] = ["init", "/bin/init", "hello", "/bin/hello"];

pub const HELLO_MESSAGE: &[u8] = b"Hello from user space!\n";

/// `write(1, msg, 23); exit(0)` through `int 0x80`, msg in the data section.
const HELLO_CODE: [u8; 44] = [
    0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1      ; write
    0x48, 0xC7, 0xC7, 0x01, 0x00, 0x00, 0x00, // mov rdi, 1      ; stdout
    0x48, 0xC7, 0xC6, 0x00, 0x10, 0x40, 0x00, // mov rsi, 0x401000
    0x48, 0xC7, 0xC2, 0x17, 0x00, 0x00, 0x00, // mov rdx, 23
    0xCD, 0x80,                               // int 0x80
    0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, // mov rax, 0      ; exit
    0x48, 0x31, 0xFF,                         // xor rdi, rdi
    0xCD, 0x80,                               // int 0x80
    0xEB, 0xFE,                               // jmp $
];

/// The canned user program: prints [`HELLO_MESSAGE`] and exits with 0.
pub fn hello_image() -> Vec<u8> {
    FlatImage::new(&HELLO_CODE, HELLO_MESSAGE).encode()
}

impl RamDisk {
    pub fn new() -> RamDisk {
        RamDisk::default()
    }

    /// Disk with the hello program under every [`BUILTIN_NAMES`] entry.
    pub fn builtin() -> RamDisk {
        let mut disk = RamDisk::new();
        let image = hello_image();
        for name in BUILTIN_NAMES {
            disk.insert(name, image.clone());
        }
        disk
    }

    /// Adds or replaces an image.
    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.images.insert(String::from(name), bytes);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ImageSource for RamDisk {
    fn read_image(&self, name: &str) -> Option<&[u8]> {
        self.images.get(name).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::USER_CODE_BASE;

    #[test]
    fn test_builtin_names_resolve() {
        let disk = RamDisk::builtin();
        for name in BUILTIN_NAMES {
            assert!(disk.read_image(name).is_some(), "{}", name);
        }
        assert!(disk.read_image("/bin/ls").is_none());
    }

    #[test]
    fn test_hello_image_is_loadable() {
        let bytes = hello_image();
        let image = FlatImage::parse(&bytes, &KernelConfig::DEFAULT).unwrap();
        assert_eq!(image.data, HELLO_MESSAGE);
        assert_eq!(HELLO_MESSAGE.len(), 0x17);
        // The message pointer baked into the code is the data page.
        let rsi = u32::from_le_bytes(HELLO_CODE[17..21].try_into().unwrap()) as u64;
        assert_eq!(rsi, USER_CODE_BASE + 0x1000);
    }
}
