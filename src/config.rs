//! Kernel capacity limits and sizes.
//!
//! Every bound the process layer enforces comes from a [`KernelConfig`];
//! tables grow on demand up to these limits and report `OutOfResources`
//! beyond them.

use crate::memory::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Live process-table slots (zombies included).
    pub max_processes: usize,
    pub max_threads_per_process: usize,
    pub max_open_files: usize,
    /// Size of the syscall table; valid numbers are `0..syscall_slots`.
    pub syscall_slots: usize,
    pub kernel_stack_size: usize,
    /// User stack used when an image header asks for zero bytes.
    pub default_user_stack: usize,
    pub max_user_stack: usize,
    /// Bounded kernel buffer used by `read`/`write`.
    pub io_chunk: usize,
    pub max_path: usize,
    pub max_args: usize,
    pub max_arg_len: usize,
    /// Budget for page-rounded code + data + bss.
    pub user_image_limit: usize,
}

impl KernelConfig {
    pub const DEFAULT: KernelConfig = KernelConfig {
        max_processes: 64,
        max_threads_per_process: 16,
        max_open_files: 16,
        syscall_slots: 64,
        kernel_stack_size: 4 * PAGE_SIZE,
        default_user_stack: 4 * PAGE_SIZE,
        max_user_stack: 256 * PAGE_SIZE,
        io_chunk: PAGE_SIZE,
        max_path: 256,
        max_args: 32,
        max_arg_len: 256,
        user_image_limit: 1024 * PAGE_SIZE,
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
