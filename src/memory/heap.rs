use linked_list_allocator::LockedHeap;

/// The heap sits in the identity-mapped 8-16 MiB window, between the
/// kernel image and the frame pool.
pub const HEAP_START: usize = 8 * 1024 * 1024;
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// # Safety
/// Call once, before the first allocation, with the heap window unused.
pub unsafe fn init() {
    ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    crate::log_info!("kernel heap: {:#x}..{:#x}", HEAP_START, HEAP_START + HEAP_SIZE);
}

pub fn used() -> usize {
    ALLOCATOR.lock().used()
}
