//! Heap-backed address spaces.
//!
//! Frames are reference-counted heap pages drawn from a shared
//! [`FramePool`], so copy-on-write sharing, frame exhaustion and release
//! accounting behave like the hardware backend without touching page
//! tables. Used for hosted runs and throughout the unit tests.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{page_align_down, AddressSpace, PageFlags, VmProvider, PAGE_SIZE};
use crate::error::{KResult, KernelError};

/// Frame budget and live-frame accounting shared by every space of a VM.
pub struct FramePool {
    limit: Option<usize>,
    live: AtomicUsize,
    next_id: AtomicU64,
    spaces_created: AtomicUsize,
}

impl FramePool {
    fn allocate(self: &Arc<Self>) -> KResult<Frame> {
        let reserved = self.live.fetch_add(1, Ordering::SeqCst);
        if self.limit.is_some_and(|limit| reserved >= limit) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(KernelError::OutOfResources);
        }
        Ok(Frame {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            bytes: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            pool: Arc::clone(self),
        })
    }
}

struct Frame {
    id: u64,
    bytes: Box<[u8]>,
    pool: Arc<FramePool>,
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Mapping {
    flags: PageFlags,
    frame: Arc<Frame>,
}

/// [`VmProvider`] handing out [`SoftAddressSpace`]s over one frame pool.
pub struct SoftVm {
    pool: Arc<FramePool>,
}

impl SoftVm {
    pub fn new() -> SoftVm {
        Self::build(None)
    }

    /// Fails every allocation beyond `frames` live frames.
    pub fn with_frame_limit(frames: usize) -> SoftVm {
        Self::build(Some(frames))
    }

    fn build(limit: Option<usize>) -> SoftVm {
        SoftVm {
            pool: Arc::new(FramePool {
                limit,
                live: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                spaces_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Frames currently allocated across all spaces.
    pub fn live_frames(&self) -> usize {
        self.pool.live.load(Ordering::SeqCst)
    }

    pub fn spaces_created(&self) -> usize {
        self.pool.spaces_created.load(Ordering::SeqCst)
    }

    /// Another handle on the same pool, for tests that keep an eye on the
    /// accounting after handing the VM to a kernel.
    pub fn handle(&self) -> SoftVm {
        SoftVm { pool: Arc::clone(&self.pool) }
    }
}

impl Default for SoftVm {
    fn default() -> Self {
        Self::new()
    }
}

impl VmProvider for SoftVm {
    fn create_address_space(&self) -> KResult<Box<dyn AddressSpace>> {
        self.pool.spaces_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SoftAddressSpace {
            pool: Arc::clone(&self.pool),
            pages: BTreeMap::new(),
        }))
    }
}

pub struct SoftAddressSpace {
    pool: Arc<FramePool>,
    pages: BTreeMap<u64, Mapping>,
}

impl SoftAddressSpace {
    fn mapping(&self, vaddr: u64) -> KResult<&Mapping> {
        self.pages.get(&page_align_down(vaddr)).ok_or(KernelError::Fault)
    }
}

impl AddressSpace for SoftAddressSpace {
    fn map_page(&mut self, vaddr: u64, flags: PageFlags, contents: &[u8]) -> KResult<()> {
        if vaddr % PAGE_SIZE as u64 != 0 || contents.len() > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if self.pages.contains_key(&vaddr) {
            return Err(KernelError::InvalidArgument);
        }
        let mut frame = self.pool.allocate()?;
        frame.bytes[..contents.len()].copy_from_slice(contents);
        self.pages.insert(vaddr, Mapping { flags, frame: Arc::new(frame) });
        Ok(())
    }

    fn unmap_page(&mut self, vaddr: u64) -> KResult<()> {
        self.pages
            .remove(&page_align_down(vaddr))
            .map(|_| ())
            .ok_or(KernelError::NotFound)
    }

    fn query(&self, vaddr: u64) -> Option<PageFlags> {
        self.pages.get(&page_align_down(vaddr)).map(|m| m.flags)
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn backing(&self, vaddr: u64) -> Option<u64> {
        self.pages.get(&page_align_down(vaddr)).map(|m| m.frame.id)
    }

    fn fork_cow(&mut self) -> KResult<Box<dyn AddressSpace>> {
        let mut child = BTreeMap::new();
        for (&vaddr, mapping) in self.pages.iter_mut() {
            if mapping.flags.contains(PageFlags::WRITE) {
                mapping.flags.remove(PageFlags::WRITE);
                mapping.flags.insert(PageFlags::COW);
            }
            child.insert(
                vaddr,
                Mapping { flags: mapping.flags, frame: Arc::clone(&mapping.frame) },
            );
        }
        self.pool.spaces_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SoftAddressSpace { pool: Arc::clone(&self.pool), pages: child }))
    }

    fn resolve_write_fault(&mut self, vaddr: u64) -> KResult<()> {
        let pool = Arc::clone(&self.pool);
        let mapping = self
            .pages
            .get_mut(&page_align_down(vaddr))
            .ok_or(KernelError::Fault)?;
        if !mapping.flags.contains(PageFlags::COW) {
            return Err(KernelError::Fault);
        }
        if Arc::strong_count(&mapping.frame) > 1 {
            let mut copy = pool.allocate()?;
            copy.bytes.copy_from_slice(&mapping.frame.bytes);
            mapping.frame = Arc::new(copy);
        }
        mapping.flags.remove(PageFlags::COW);
        mapping.flags.insert(PageFlags::WRITE);
        Ok(())
    }

    fn read_bytes(&self, vaddr: u64, dst: &mut [u8]) -> KResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let addr = vaddr + done as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            let mapping = self.mapping(addr)?;
            dst[done..done + n].copy_from_slice(&mapping.frame.bytes[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    fn write_bytes(&mut self, vaddr: u64, src: &[u8]) -> KResult<()> {
        let mut done = 0;
        while done < src.len() {
            let addr = vaddr + done as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offset).min(src.len() - done);
            let mapping = self
                .pages
                .get_mut(&page_align_down(addr))
                .ok_or(KernelError::Fault)?;
            if !mapping.flags.contains(PageFlags::WRITE) {
                return Err(KernelError::Fault);
            }
            let frame = Arc::get_mut(&mut mapping.frame).ok_or(KernelError::Fault)?;
            frame.bytes[offset..offset + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn activate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Access;

    #[test]
    fn test_map_then_unmap_restores_state() {
        let vm = SoftVm::new();
        let mut space = vm.create_address_space().unwrap();
        space.map_page(0x40_0000, PageFlags::USER_CODE, &[0x90]).unwrap();
        let before = (space.page_count(), space.query(0x40_0000));

        space.map_page(0x40_1000, PageFlags::USER_DATA, &[1, 2, 3]).unwrap();
        space.unmap_page(0x40_1000).unwrap();

        assert_eq!((space.page_count(), space.query(0x40_0000)), before);
        assert_eq!(space.query(0x40_1000), None);
        assert_eq!(vm.live_frames(), 1);
    }

    #[test]
    fn test_double_map_rejected() {
        let vm = SoftVm::new();
        let mut space = vm.create_address_space().unwrap();
        space.map_page(0x1000, PageFlags::USER_DATA, &[]).unwrap();
        assert_eq!(
            space.map_page(0x1000, PageFlags::USER_DATA, &[]),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            space.map_page(0x1234, PageFlags::USER_DATA, &[]),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_frame_limit_reports_out_of_resources() {
        let vm = SoftVm::with_frame_limit(2);
        let mut space = vm.create_address_space().unwrap();
        space.map_page(0x1000, PageFlags::USER_DATA, &[]).unwrap();
        space.map_page(0x2000, PageFlags::USER_DATA, &[]).unwrap();
        assert_eq!(
            space.map_page(0x3000, PageFlags::USER_DATA, &[]),
            Err(KernelError::OutOfResources)
        );
        assert_eq!(vm.live_frames(), 2);
        drop(space);
        assert_eq!(vm.live_frames(), 0);
    }

    #[test]
    fn test_fork_shares_frames_until_written() {
        let vm = SoftVm::new();
        let mut parent = vm.create_address_space().unwrap();
        parent.map_page(0x40_0000, PageFlags::USER_CODE, &[0xCC]).unwrap();
        parent.map_page(0x40_1000, PageFlags::USER_DATA, b"parent").unwrap();

        let mut child = parent.fork_cow().unwrap();
        assert_eq!(vm.live_frames(), 2);
        assert_eq!(parent.backing(0x40_1000), child.backing(0x40_1000));
        assert_eq!(parent.backing(0x40_0000), child.backing(0x40_0000));
        for space in [&parent, &child] {
            let flags = space.query(0x40_1000).unwrap();
            assert!(flags.contains(PageFlags::COW));
            assert!(!flags.contains(PageFlags::WRITE));
            assert_eq!(space.query(0x40_0000), Some(PageFlags::USER_CODE));
        }

        child.copy_to_user(0x40_1000, b"child!").unwrap();
        assert_eq!(vm.live_frames(), 3);
        assert_ne!(parent.backing(0x40_1000), child.backing(0x40_1000));

        let mut buf = [0u8; 6];
        parent.copy_from_user(&mut buf, 0x40_1000).unwrap();
        assert_eq!(&buf, b"parent");
        child.copy_from_user(&mut buf, 0x40_1000).unwrap();
        assert_eq!(&buf, b"child!");

        // Parent is the sole owner now; no copy needed.
        parent.resolve_write_fault(0x40_1000).unwrap();
        assert_eq!(vm.live_frames(), 3);
        assert_eq!(parent.query(0x40_1000), Some(PageFlags::USER_DATA));
    }

    #[test]
    fn test_resolve_rejects_non_cow_page() {
        let vm = SoftVm::new();
        let mut space = vm.create_address_space().unwrap();
        space.map_page(0x40_0000, PageFlags::USER_CODE, &[]).unwrap();
        assert_eq!(space.resolve_write_fault(0x40_0000), Err(KernelError::Fault));
        assert_eq!(space.resolve_write_fault(0x50_0000), Err(KernelError::Fault));
    }

    #[test]
    fn test_copy_to_user_refuses_read_only() {
        let vm = SoftVm::new();
        let mut space = vm.create_address_space().unwrap();
        space.map_page(0x40_0000, PageFlags::USER_RODATA, b"const").unwrap();
        assert!(!space.validate_user_pointer(0x40_0000, 5, Access::Write));
        assert_eq!(space.copy_to_user(0x40_0000, b"xxxxx"), Err(KernelError::Fault));
        let mut buf = [0u8; 5];
        space.copy_from_user(&mut buf, 0x40_0000).unwrap();
        assert_eq!(&buf, b"const");
    }
}
