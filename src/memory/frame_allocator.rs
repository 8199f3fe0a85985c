use alloc::collections::BTreeMap;
use lazy_static::lazy_static;
use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::{page_align_down, page_align_up, PAGE_SIZE};
use crate::error::{KResult, KernelError};

/// Frames below this belong to the kernel image, boot tables and heap.
pub const FRAME_POOL_START: u64 = 16 * 1024 * 1024;
/// End of the boot identity map; frames are only touched through it.
pub const FRAME_POOL_END: u64 = 1024 * 1024 * 1024;

const MAX_AREAS: usize = 16;

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<PhysFrameAllocator> = Mutex::new(PhysFrameAllocator::new());
}

/// Physical frames from the multiboot2 memory map: a bump pointer over the
/// usable areas plus a free list threaded through released frames.
///
/// A frame handed out has one owner. Copy-on-write sharing raises the count
/// with [`share`](Self::share); [`release`](Self::release) frees the frame
/// when the last owner lets go.
pub struct PhysFrameAllocator {
    areas: [(u64, u64); MAX_AREAS],
    area_count: usize,
    area_index: usize,
    next: u64,
    free_list: u64,
    shared: BTreeMap<u64, usize>,
    in_use: usize,
}

impl PhysFrameAllocator {
    pub fn new() -> Self {
        PhysFrameAllocator {
            areas: [(0, 0); MAX_AREAS],
            area_count: 0,
            area_index: 0,
            next: 0,
            free_list: 0,
            shared: BTreeMap::new(),
            in_use: 0,
        }
    }

    /// Records the available areas of the boot memory map, clipped to the
    /// frame pool window.
    ///
    /// # Safety
    /// `multiboot_info_addr` must point at a valid multiboot2 information
    /// structure, and the areas it lists must be unused.
    pub unsafe fn init(&mut self, multiboot_info_addr: usize) -> KResult<()> {
        let boot_info = BootInformation::load(multiboot_info_addr as *const BootInformationHeader)
            .map_err(|_| KernelError::InvalidArgument)?;
        let memory_map = boot_info.memory_map_tag().ok_or(KernelError::NotFound)?;

        for area in memory_map.memory_areas() {
            if MemoryAreaType::from(area.typ()) != MemoryAreaType::Available {
                continue;
            }
            let start = page_align_up(area.start_address().max(FRAME_POOL_START));
            let end = page_align_down(area.end_address().min(FRAME_POOL_END));
            if start >= end || self.area_count == MAX_AREAS {
                continue;
            }
            self.areas[self.area_count] = (start, end);
            self.area_count += 1;
        }
        if self.area_count == 0 {
            return Err(KernelError::OutOfResources);
        }
        self.next = self.areas[0].0;
        crate::log_info!(
            "frame allocator: {} usable areas, first at {:#x}",
            self.area_count,
            self.next
        );
        Ok(())
    }

    /// A zeroed frame, or `None` when physical memory is exhausted.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        let addr = if self.free_list != 0 {
            let addr = self.free_list;
            // The first word of a free frame links to the next one.
            self.free_list = unsafe { *(addr as *const u64) };
            addr
        } else {
            self.bump()?
        };
        unsafe { core::ptr::write_bytes(addr as *mut u8, 0, PAGE_SIZE) };
        self.in_use += 1;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    fn bump(&mut self) -> Option<u64> {
        while self.area_index < self.area_count {
            let (_, end) = self.areas[self.area_index];
            if self.next < end {
                let addr = self.next;
                self.next += PAGE_SIZE as u64;
                return Some(addr);
            }
            self.area_index += 1;
            if let Some(&(start, _)) = self.areas.get(self.area_index) {
                self.next = start;
            }
        }
        None
    }

    /// Adds an owner to `frame`.
    pub fn share(&mut self, frame: PhysFrame) {
        *self.shared.entry(frame.start_address().as_u64()).or_insert(1) += 1;
    }

    /// Number of owners of `frame`.
    pub fn owners(&self, frame: PhysFrame) -> usize {
        self.shared.get(&frame.start_address().as_u64()).copied().unwrap_or(1)
    }

    /// Drops one owner; the last one returns the frame to the free list.
    pub fn release(&mut self, frame: PhysFrame) {
        let addr = frame.start_address().as_u64();
        if let Some(count) = self.shared.get_mut(&addr) {
            *count -= 1;
            if *count == 1 {
                self.shared.remove(&addr);
            }
            return;
        }
        unsafe { *(addr as *mut u64) = self.free_list };
        self.free_list = addr;
        self.in_use -= 1;
    }

    pub fn frames_in_use(&self) -> usize {
        self.in_use
    }
}

unsafe impl FrameAllocator<Size4KiB> for PhysFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate()
    }
}
