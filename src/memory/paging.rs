//! 4-level page table backend.
//!
//! The boot code identity-maps the first GiB with 2 MiB pages. Every user
//! space gets a private top-level table copied from the kernel's, with a
//! private copy of the first-GiB chain in which the 4-8 MiB user image
//! window is cleared. User pages therefore never share a table with kernel
//! mappings, and physical frames are reachable at their own address.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::VirtAddr;

use super::frame_allocator::FRAME_ALLOCATOR;
use super::{is_user_range, page_align_down, AddressSpace, PageFlags, VmProvider, PAGE_SIZE};
use crate::error::{KResult, KernelError};

/// 2 MiB slots of the first-GiB P2 table handed to user images.
const USER_WINDOW_P2: Range<usize> = 2..4;

/// Software copy-on-write marker in the hardware entry.
const COW_BIT: PageTableFlags = PageTableFlags::BIT_9;

const TABLE_FLAGS: PageTableFlags = PageTableFlags::from_bits_truncate(
    PageTableFlags::PRESENT.bits()
        | PageTableFlags::WRITABLE.bits()
        | PageTableFlags::USER_ACCESSIBLE.bits(),
);

static KERNEL_P4: AtomicU64 = AtomicU64::new(0);

/// Remembers the boot page table as the template for user spaces.
pub fn init() {
    let (frame, _) = Cr3::read();
    KERNEL_P4.store(frame.start_address().as_u64(), Ordering::SeqCst);
    crate::log_info!("paging: kernel P4 at {:#x}", frame.start_address().as_u64());
}

fn hardware_flags(flags: PageFlags) -> PageTableFlags {
    let mut hw = PageTableFlags::PRESENT;
    if flags.contains(PageFlags::USER) {
        hw |= PageTableFlags::USER_ACCESSIBLE;
    }
    if flags.contains(PageFlags::WRITE) {
        hw |= PageTableFlags::WRITABLE;
    }
    if flags.contains(PageFlags::COW) {
        hw |= COW_BIT;
    }
    hw
}

unsafe fn table_at(addr: u64) -> &'static mut PageTable {
    &mut *(addr as *mut PageTable)
}

/// # Safety
/// `p4` must be a live top-level table owned by the caller.
unsafe fn mapper(p4: PhysFrame) -> OffsetPageTable<'static> {
    OffsetPageTable::new(table_at(p4.start_address().as_u64()), VirtAddr::new(0))
}

fn page(vaddr: u64) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new(vaddr))
}

/// Hands the mapper fresh table frames and keeps them for the space.
struct TableFrames<'a> {
    owned: &'a mut Vec<PhysFrame>,
}

unsafe impl FrameAllocator<Size4KiB> for TableFrames<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = FRAME_ALLOCATOR.lock().allocate()?;
        self.owned.push(frame);
        Some(frame)
    }
}

pub struct PagingVm;

impl VmProvider for PagingVm {
    fn create_address_space(&self) -> KResult<Box<dyn AddressSpace>> {
        Ok(Box::new(X86AddressSpace::new()?))
    }
}

struct Mapping {
    frame: PhysFrame,
    flags: PageFlags,
}

pub struct X86AddressSpace {
    p4: PhysFrame,
    /// Table frames owned by this space, the private P4/P3/P2 included.
    tables: Vec<PhysFrame>,
    pages: BTreeMap<u64, Mapping>,
}

impl X86AddressSpace {
    pub fn new() -> KResult<X86AddressSpace> {
        let mut tables = Vec::with_capacity(8);
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            for _ in 0..3 {
                match frames.allocate() {
                    Some(frame) => tables.push(frame),
                    None => {
                        for frame in tables.drain(..) {
                            frames.release(frame);
                        }
                        return Err(KernelError::OutOfResources);
                    }
                }
            }
        }
        let (p4, p3, p2) = (tables[0], tables[1], tables[2]);

        unsafe {
            let kernel_p4 = table_at(KERNEL_P4.load(Ordering::SeqCst));
            let kernel_p3 = table_at(kernel_p4[0].addr().as_u64());
            let kernel_p2 = table_at(kernel_p3[0].addr().as_u64());
            let new_p4 = table_at(p4.start_address().as_u64());
            let new_p3 = table_at(p3.start_address().as_u64());
            let new_p2 = table_at(p2.start_address().as_u64());

            for (dst, src) in new_p4.iter_mut().zip(kernel_p4.iter()) {
                *dst = src.clone();
            }
            for (dst, src) in new_p3.iter_mut().zip(kernel_p3.iter()) {
                *dst = src.clone();
            }
            for (dst, src) in new_p2.iter_mut().zip(kernel_p2.iter()) {
                *dst = src.clone();
            }
            for index in USER_WINDOW_P2 {
                new_p2[index].set_unused();
            }
            // The kernel's 2 MiB pages keep USER clear, so opening the upper
            // levels exposes only what is mapped into the window.
            new_p3[0].set_addr(p2.start_address(), kernel_p3[0].flags() | TABLE_FLAGS);
            new_p4[0].set_addr(p3.start_address(), kernel_p4[0].flags() | TABLE_FLAGS);
        }

        Ok(X86AddressSpace { p4, tables, pages: BTreeMap::new() })
    }

    /// Maps an existing frame, adding an owner to it.
    fn map_frame(&mut self, vaddr: u64, frame: PhysFrame, flags: PageFlags) -> KResult<()> {
        FRAME_ALLOCATOR.lock().share(frame);
        let mut tables = TableFrames { owned: &mut self.tables };
        let mapped = unsafe {
            mapper(self.p4).map_to_with_table_flags(
                page(vaddr),
                frame,
                hardware_flags(flags),
                TABLE_FLAGS,
                &mut tables,
            )
        };
        match mapped {
            Ok(flush) => flush.flush(),
            Err(_) => {
                FRAME_ALLOCATOR.lock().release(frame);
                return Err(KernelError::OutOfResources);
            }
        }
        self.pages.insert(vaddr, Mapping { frame, flags });
        Ok(())
    }

    fn is_active(&self) -> bool {
        Cr3::read().0 == self.p4
    }
}

impl AddressSpace for X86AddressSpace {
    fn map_page(&mut self, vaddr: u64, flags: PageFlags, contents: &[u8]) -> KResult<()> {
        if vaddr % PAGE_SIZE as u64 != 0 || contents.len() > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if !is_user_range(vaddr, PAGE_SIZE) || self.pages.contains_key(&vaddr) {
            return Err(KernelError::InvalidArgument);
        }
        let frame = FRAME_ALLOCATOR.lock().allocate().ok_or(KernelError::OutOfResources)?;
        unsafe {
            let dst = frame.start_address().as_u64() as *mut u8;
            core::ptr::copy_nonoverlapping(contents.as_ptr(), dst, contents.len());
        }
        let result = self.map_frame(vaddr, frame, flags);
        // map_frame took its own reference.
        FRAME_ALLOCATOR.lock().release(frame);
        result
    }

    fn unmap_page(&mut self, vaddr: u64) -> KResult<()> {
        let vaddr = page_align_down(vaddr);
        let mapping = self.pages.remove(&vaddr).ok_or(KernelError::NotFound)?;
        if let Ok((_, flush)) = unsafe { mapper(self.p4) }.unmap(page(vaddr)) {
            flush.flush();
        }
        FRAME_ALLOCATOR.lock().release(mapping.frame);
        Ok(())
    }

    fn query(&self, vaddr: u64) -> Option<PageFlags> {
        self.pages.get(&page_align_down(vaddr)).map(|m| m.flags)
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn backing(&self, vaddr: u64) -> Option<u64> {
        self.pages.get(&page_align_down(vaddr)).map(|m| m.frame.start_address().as_u64())
    }

    fn fork_cow(&mut self) -> KResult<Box<dyn AddressSpace>> {
        let mut child = X86AddressSpace::new()?;
        let p4 = self.p4;
        for (&vaddr, mapping) in self.pages.iter_mut() {
            if mapping.flags.contains(PageFlags::WRITE) {
                mapping.flags.remove(PageFlags::WRITE);
                mapping.flags.insert(PageFlags::COW);
                let updated = unsafe { mapper(p4).update_flags(page(vaddr), hardware_flags(mapping.flags)) };
                updated.map_err(|_| KernelError::Fault)?.flush();
            }
            child.map_frame(vaddr, mapping.frame, mapping.flags)?;
        }
        Ok(Box::new(child))
    }

    fn resolve_write_fault(&mut self, vaddr: u64) -> KResult<()> {
        let vaddr = page_align_down(vaddr);
        let p4 = self.p4;
        let mapping = self.pages.get_mut(&vaddr).ok_or(KernelError::Fault)?;
        if !mapping.flags.contains(PageFlags::COW) {
            return Err(KernelError::Fault);
        }
        let mut flags = mapping.flags;
        flags.remove(PageFlags::COW);
        flags.insert(PageFlags::WRITE);

        let mut frames = FRAME_ALLOCATOR.lock();
        if frames.owners(mapping.frame) > 1 {
            let copy = frames.allocate().ok_or(KernelError::OutOfResources)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    mapping.frame.start_address().as_u64() as *const u8,
                    copy.start_address().as_u64() as *mut u8,
                    PAGE_SIZE,
                );
            }
            frames.release(mapping.frame);
            drop(frames);
            let mut mapper = unsafe { mapper(p4) };
            if let Ok((_, flush)) = mapper.unmap(page(vaddr)) {
                flush.flush();
            }
            // The leaf table already exists, so no table frame is needed.
            let mut tables = TableFrames { owned: &mut self.tables };
            let mapped = unsafe {
                mapper.map_to_with_table_flags(page(vaddr), copy, hardware_flags(flags), TABLE_FLAGS, &mut tables)
            };
            mapped.map_err(|_| KernelError::OutOfResources)?.flush();
            mapping.frame = copy;
        } else {
            drop(frames);
            let updated = unsafe { mapper(p4).update_flags(page(vaddr), hardware_flags(flags)) };
            updated.map_err(|_| KernelError::Fault)?.flush();
        }
        mapping.flags = flags;
        Ok(())
    }

    fn read_bytes(&self, vaddr: u64, dst: &mut [u8]) -> KResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let addr = vaddr + done as u64;
            let offset = (addr % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            let mapping = self.pages.get(&page_align_down(addr)).ok_or(KernelError::Fault)?;
            let src = mapping.frame.start_address().as_u64() + offset as u64;
            unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst[done..].as_mut_ptr(), n) };
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
            let mapping = self.pages.get(&page_align_down(addr)).ok_or(KernelError::Fault)?;
            if !mapping.flags.contains(PageFlags::WRITE) {
                return Err(KernelError::Fault);
            }
            let dst = mapping.frame.start_address().as_u64() + offset as u64;
            unsafe { core::ptr::copy_nonoverlapping(src[done..].as_ptr(), dst as *mut u8, n) };
            done += n;
        }
        Ok(())
    }

    fn activate(&self) {
        if !self.is_active() {
            unsafe { Cr3::write(self.p4, Cr3Flags::empty()) };
        }
    }
}

impl Drop for X86AddressSpace {
    fn drop(&mut self) {
        // Never free the tables the CPU is walking.
        if self.is_active() {
            let kernel = PhysFrame::containing_address(x86_64::PhysAddr::new(KERNEL_P4.load(Ordering::SeqCst)));
            unsafe { Cr3::write(kernel, Cr3Flags::empty()) };
        }
        let mut frames = FRAME_ALLOCATOR.lock();
        for mapping in core::mem::take(&mut self.pages).into_values() {
            frames.release(mapping.frame);
        }
        for table in self.tables.drain(..) {
            frames.release(table);
        }
    }
}
