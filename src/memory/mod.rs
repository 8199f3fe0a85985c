//! Virtual memory contract used by the loader and the syscall layer.
//!
//! A process owns one [`AddressSpace`]. Everything above this module sees
//! page-granular mappings only; the backend decides where frames come from
//! (heap pages in [`soft`], physical frames and 4-level tables on x86_64).

pub mod soft;

#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod frame_allocator;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod heap;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod paging;

use alloc::boxed::Box;
use bitflags::bitflags;

use crate::error::{KResult, KernelError};

pub const PAGE_SIZE: usize = 4096;

/// Base of the user image window. Code lands here, data and bss follow.
pub const USER_CODE_BASE: u64 = 0x0040_0000;
/// Stacks grow down from here.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// First user-accessible address; page zero stays unmapped to catch null.
pub const USER_SPACE_START: u64 = 0x1000;
/// End of the lower canonical half.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

bitflags! {
    /// Protection of one mapped page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
        /// Writable in principle but sharing its frame; WRITE is withheld
        /// until the first write duplicates or reclaims the frame.
        const COW   = 1 << 4;
    }
}

impl PageFlags {
    pub const USER_CODE: PageFlags = PageFlags::READ.union(PageFlags::EXEC).union(PageFlags::USER);
    pub const USER_DATA: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::USER);
    pub const USER_RODATA: PageFlags = PageFlags::READ.union(PageFlags::USER);

    /// Whether a kernel copy on behalf of user space may touch this page.
    pub fn permits(self, access: Access) -> bool {
        if !self.contains(PageFlags::USER) {
            return false;
        }
        match access {
            Access::Read => self.contains(PageFlags::READ),
            Access::Write => self.intersects(PageFlags::WRITE | PageFlags::COW),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// `[ptr, ptr + len)` lies entirely in the user half and does not wrap.
pub fn is_user_range(ptr: u64, len: usize) -> bool {
    match ptr.checked_add(len as u64) {
        Some(end) => ptr >= USER_SPACE_START && end <= USER_SPACE_END,
        None => false,
    }
}

/// Page-granular mapping contract of one user address space.
///
/// `read_bytes`/`write_bytes` are raw accessors that only require the
/// pages to be mapped; the provided `copy_*_user` methods add the user
/// permission checks and copy-on-write breaking the syscalls rely on.
pub trait AddressSpace: Send {
    /// Maps a fresh zeroed frame at `vaddr` (page aligned) and fills it
    /// with `contents` (at most one page). Fails if already mapped.
    fn map_page(&mut self, vaddr: u64, flags: PageFlags, contents: &[u8]) -> KResult<()>;

    fn unmap_page(&mut self, vaddr: u64) -> KResult<()>;

    /// Flags of the page containing `vaddr`, if mapped.
    fn query(&self, vaddr: u64) -> Option<PageFlags>;

    fn page_count(&self) -> usize;

    /// Identity of the frame backing `vaddr`. Two spaces report the same
    /// value exactly when they share storage.
    fn backing(&self, vaddr: u64) -> Option<u64>;

    /// Child space sharing every frame with `self`. Writable pages become
    /// copy-on-write on both sides.
    fn fork_cow(&mut self) -> KResult<Box<dyn AddressSpace>>;

    /// Gives the page containing `vaddr` back its write permission,
    /// duplicating the frame first if another space still shares it.
    fn resolve_write_fault(&mut self, vaddr: u64) -> KResult<()>;

    fn read_bytes(&self, vaddr: u64, dst: &mut [u8]) -> KResult<()>;

    fn write_bytes(&mut self, vaddr: u64, src: &[u8]) -> KResult<()>;

    /// Makes this the translation used by the CPU.
    fn activate(&self);

    fn validate_user_pointer(&self, ptr: u64, len: usize, access: Access) -> bool {
        if !is_user_range(ptr, len) {
            return false;
        }
        let end = ptr + len as u64;
        let mut page = page_align_down(ptr);
        while page < end {
            match self.query(page) {
                Some(flags) if flags.permits(access) => {}
                _ => return false,
            }
            page += PAGE_SIZE as u64;
        }
        true
    }

    fn copy_from_user(&self, dst: &mut [u8], src: u64) -> KResult<()> {
        if !self.validate_user_pointer(src, dst.len(), Access::Read) {
            return Err(KernelError::Fault);
        }
        self.read_bytes(src, dst)
    }

    fn copy_to_user(&mut self, dst: u64, src: &[u8]) -> KResult<()> {
        if !self.validate_user_pointer(dst, src.len(), Access::Write) {
            return Err(KernelError::Fault);
        }
        let end = dst + src.len() as u64;
        let mut page = page_align_down(dst);
        while page < end {
            if self.query(page).is_some_and(|f| f.contains(PageFlags::COW)) {
                self.resolve_write_fault(page)?;
            }
            page += PAGE_SIZE as u64;
        }
        self.write_bytes(dst, src)
    }
}

/// Creates empty user address spaces.
pub trait VmProvider {
    fn create_address_space(&self) -> KResult<Box<dyn AddressSpace>>;
}

/// Reads a NUL-terminated string of at most `max` bytes (terminator
/// excluded) from user memory, one page-bounded chunk at a time.
pub fn copy_c_string_from_user(
    space: &dyn AddressSpace,
    ptr: u64,
    max: usize,
) -> KResult<alloc::string::String> {
    let mut bytes = alloc::vec::Vec::new();
    let mut cursor = ptr;
    loop {
        let page_left = PAGE_SIZE - (cursor as usize & (PAGE_SIZE - 1));
        let want = page_left.min(max + 1 - bytes.len());
        let mut chunk = [0u8; 256];
        let want = want.min(chunk.len());
        space.copy_from_user(&mut chunk[..want], cursor)?;
        if let Some(nul) = chunk[..want].iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            break;
        }
        bytes.extend_from_slice(&chunk[..want]);
        if bytes.len() > max {
            return Err(KernelError::InvalidArgument);
        }
        cursor += want as u64;
    }
    alloc::string::String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)
}

/// Reads a NULL-terminated array of user pointers (at most `max` entries).
pub fn copy_pointer_array_from_user(
    space: &dyn AddressSpace,
    ptr: u64,
    max: usize,
) -> KResult<alloc::vec::Vec<u64>> {
    let mut out = alloc::vec::Vec::new();
    let mut cursor = ptr;
    loop {
        let mut raw = [0u8; 8];
        space.copy_from_user(&mut raw, cursor)?;
        let value = u64::from_le_bytes(raw);
        if value == 0 {
            return Ok(out);
        }
        if out.len() == max {
            return Err(KernelError::InvalidArgument);
        }
        out.push(value);
        cursor = cursor.checked_add(8).ok_or(KernelError::Fault)?;
    }
}
