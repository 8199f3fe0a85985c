use alloc::vec::Vec;
use bitflags::bitflags;

use super::LoadError;
use crate::config::KernelConfig;
use crate::memory::{pages_for, PAGE_SIZE};

// ══════════════════════════════════════════════════════════════
//  Flat binary constants
// ══════════════════════════════════════════════════════════════

pub const FLAT_MAGIC: [u8; 4] = *b"RFLT";
pub const FLAT_HEADER_SIZE: usize = 28;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlatFlags: u32 {
        const EXECUTABLE = 1 << 0;
        /// Data section mapped without write permission.
        const READ_ONLY  = 1 << 1;
    }
}

// ══════════════════════════════════════════════════════════════
//  Header
// ══════════════════════════════════════════════════════════════

/// On-disk header, all fields little-endian, followed by `code_size`
/// bytes of code and `data_size` bytes of initialised data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatHeader {
    pub entry_offset: u32,
    pub code_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub stack_size: u32,
    pub flags: FlatFlags,
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl FlatHeader {
    /// Decodes the header; the magic is checked before anything else.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() >= 4 && bytes[0..4] != FLAT_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if bytes.len() < FLAT_HEADER_SIZE {
            return Err(LoadError::Truncated);
        }
        Ok(FlatHeader {
            entry_offset: le_u32(bytes, 4),
            code_size: le_u32(bytes, 8),
            data_size: le_u32(bytes, 12),
            bss_size: le_u32(bytes, 16),
            stack_size: le_u32(bytes, 20),
            flags: FlatFlags::from_bits_retain(le_u32(bytes, 24)),
        })
    }

    pub fn to_bytes(&self) -> [u8; FLAT_HEADER_SIZE] {
        let mut out = [0u8; FLAT_HEADER_SIZE];
        out[0..4].copy_from_slice(&FLAT_MAGIC);
        let fields = [
            self.entry_offset,
            self.code_size,
            self.data_size,
            self.bss_size,
            self.stack_size,
            self.flags.bits(),
        ];
        for (i, field) in fields.iter().enumerate() {
            out[4 + i * 4..8 + i * 4].copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// Page-rounded code + data + bss.
    pub fn image_bytes(&self) -> u64 {
        [self.code_size, self.data_size, self.bss_size]
            .iter()
            .map(|&size| (pages_for(size as usize) * PAGE_SIZE) as u64)
            .sum()
    }

    /// User stack the image asks for, falling back to the configured default.
    pub fn stack_bytes(&self, config: &KernelConfig) -> usize {
        match self.stack_size {
            0 => config.default_user_stack,
            n => n as usize,
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  Image
// ══════════════════════════════════════════════════════════════

/// A validated image borrowing its sections from the raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct FlatImage<'a> {
    pub header: FlatHeader,
    pub code: &'a [u8],
    pub data: &'a [u8],
}

impl<'a> FlatImage<'a> {
    /// Executable image with entry offset 0, no bss and the default stack.
    pub fn new(code: &'a [u8], data: &'a [u8]) -> FlatImage<'a> {
        FlatImage {
            header: FlatHeader {
                entry_offset: 0,
                code_size: code.len() as u32,
                data_size: data.len() as u32,
                bss_size: 0,
                stack_size: 0,
                flags: FlatFlags::EXECUTABLE,
            },
            code,
            data,
        }
    }

    pub fn with_entry(mut self, offset: u32) -> Self {
        self.header.entry_offset = offset;
        self
    }

    pub fn with_bss(mut self, size: u32) -> Self {
        self.header.bss_size = size;
        self
    }

    pub fn with_stack(mut self, size: u32) -> Self {
        self.header.stack_size = size;
        self
    }

    pub fn with_flags(mut self, flags: FlatFlags) -> Self {
        self.header.flags = flags;
        self
    }

    /// Validates `bytes` completely against `config`. Nothing is mapped.
    pub fn parse(bytes: &'a [u8], config: &KernelConfig) -> Result<Self, LoadError> {
        let header = FlatHeader::parse(bytes)?;
        if !header.flags.contains(FlatFlags::EXECUTABLE) {
            return Err(LoadError::NotExecutable);
        }
        if header.code_size == 0 || header.entry_offset >= header.code_size {
            return Err(LoadError::BadEntry);
        }

        let code_end = FLAT_HEADER_SIZE as u64 + header.code_size as u64;
        let data_end = code_end + header.data_size as u64;
        if (bytes.len() as u64) < data_end {
            return Err(LoadError::Truncated);
        }
        if header.image_bytes() > config.user_image_limit as u64 {
            return Err(LoadError::TooLarge);
        }
        if header.stack_bytes(config) > config.max_user_stack {
            return Err(LoadError::TooLarge);
        }

        Ok(FlatImage {
            header,
            code: &bytes[FLAT_HEADER_SIZE..code_end as usize],
            data: &bytes[code_end as usize..data_end as usize],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.code_size = self.code.len() as u32;
        header.data_size = self.data.len() as u32;
        let mut out = Vec::with_capacity(FLAT_HEADER_SIZE + self.code.len() + self.data.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(self.code);
        out.extend_from_slice(self.data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KernelConfig {
        KernelConfig::DEFAULT
    }

    #[test]
    fn test_header_field_offsets() {
        let bytes = FlatImage::new(&[0xC3; 5], b"abc")
            .with_entry(2)
            .with_bss(0x1000)
            .with_stack(0x2000)
            .encode();
        assert_eq!(&bytes[0..4], b"RFLT");
        assert_eq!(le_u32(&bytes, 4), 2);
        assert_eq!(le_u32(&bytes, 8), 5);
        assert_eq!(le_u32(&bytes, 12), 3);
        assert_eq!(le_u32(&bytes, 16), 0x1000);
        assert_eq!(le_u32(&bytes, 20), 0x2000);
        assert_eq!(le_u32(&bytes, 24), 1);
        assert_eq!(bytes.len(), FLAT_HEADER_SIZE + 8);

        let image = FlatImage::parse(&bytes, &config()).unwrap();
        assert_eq!(image.code, &[0xC3; 5]);
        assert_eq!(image.data, b"abc");
    }

    #[test]
    fn test_rejections() {
        let cfg = config();
        let good = FlatImage::new(&[0x90; 4], b"xy").encode();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'E';
        assert_eq!(FlatImage::parse(&bad_magic, &cfg).err(), Some(LoadError::BadMagic));

        assert_eq!(FlatImage::parse(&good[..20], &cfg).err(), Some(LoadError::Truncated));
        assert_eq!(
            FlatImage::parse(&good[..good.len() - 1], &cfg).err(),
            Some(LoadError::Truncated)
        );

        let entry_past_code = FlatImage::new(&[0x90; 4], &[]).with_entry(4).encode();
        assert_eq!(FlatImage::parse(&entry_past_code, &cfg).err(), Some(LoadError::BadEntry));

        let empty_code = FlatImage::new(&[], b"data").encode();
        assert_eq!(FlatImage::parse(&empty_code, &cfg).err(), Some(LoadError::BadEntry));

        let not_exec = FlatImage::new(&[0x90], &[]).with_flags(FlatFlags::empty()).encode();
        assert_eq!(FlatImage::parse(&not_exec, &cfg).err(), Some(LoadError::NotExecutable));

        let huge_bss = FlatImage::new(&[0x90], &[]).with_bss(cfg.user_image_limit as u32).encode();
        assert_eq!(FlatImage::parse(&huge_bss, &cfg).err(), Some(LoadError::TooLarge));

        let huge_stack = FlatImage::new(&[0x90], &[])
            .with_stack(cfg.max_user_stack as u32 + 1)
            .encode();
        assert_eq!(FlatImage::parse(&huge_stack, &cfg).err(), Some(LoadError::TooLarge));
    }

    #[test]
    fn test_image_bytes_rounds_each_section() {
        let header = FlatImage::new(&[0x90; 10], &[1; 4097]).with_bss(1).header;
        assert_eq!(header.image_bytes(), (1 + 2 + 1) * PAGE_SIZE as u64);
        assert_eq!(header.stack_bytes(&config()), config().default_user_stack);
    }
}
