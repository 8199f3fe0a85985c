//! `int 0x80` system call table and dispatcher.
//!
//! The number arrives in `rax`, arguments in `rdi, rsi, rdx, r10, r8, r9`,
//! and the signed result goes back in `rax` (negative values are errnos).

pub mod handlers;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::process::context::CpuContext;
use crate::process::thread::Tid;
use crate::process::{Pid, Process};
use crate::sched::Cpu;
use crate::{log_debug, log_warn};

pub const SYS_EXIT: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_READ: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_OPEN: u64 = 4;
pub const SYS_CLOSE: u64 = 5;
pub const SYS_FORK: u64 = 6;
pub const SYS_EXEC: u64 = 7;
pub const SYS_WAIT: u64 = 8;
pub const SYS_BRK: u64 = 9;
pub const SYS_MMAP: u64 = 10;
pub const SYS_MUNMAP: u64 = 11;
pub const SYS_GETTIMEOFDAY: u64 = 12;
pub const SYS_SLEEP: u64 = 13;
pub const SYS_YIELD: u64 = 14;

/// A trapped call: number plus the six argument registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    pub number: u64,
    pub args: [u64; 6],
}

impl SyscallArgs {
    pub fn from_context(frame: &CpuContext) -> SyscallArgs {
        SyscallArgs { number: frame.syscall_number(), args: frame.syscall_args() }
    }

    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }
}

/// Everything a handler may touch. `pid`/`tid` name the caller, taken from
/// the CPU's current slot at dispatch time.
pub struct SyscallContext<'a> {
    pub kernel: &'a mut Kernel,
    pub cpu: &'a mut Cpu,
    pub frame: &'a mut CpuContext,
    pub pid: Pid,
    pub tid: Tid,
}

impl SyscallContext<'_> {
    pub fn process(&self) -> KResult<&Process> {
        self.kernel.table.get(self.pid).ok_or(KernelError::NoCurrentProcess)
    }

    pub fn process_mut(&mut self) -> KResult<&mut Process> {
        self.kernel.table.get_mut(self.pid).ok_or(KernelError::NoCurrentProcess)
    }
}

pub trait SyscallHandler {
    fn call(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize;
}

impl<F> SyscallHandler for F
where
    F: Fn(&mut SyscallContext<'_>, &SyscallArgs) -> isize,
{
    fn call(&self, ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
        self(ctx, args)
    }
}

/// Fixed number of slots; an empty slot rejects the call.
pub struct SyscallTable {
    slots: Vec<Option<Arc<dyn SyscallHandler>>>,
}

impl SyscallTable {
    pub fn new(slots: usize) -> SyscallTable {
        let mut table = Vec::with_capacity(slots);
        table.resize_with(slots, || None);
        SyscallTable { slots: table }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Installs `handler` at `number`, replacing whatever was there.
    pub fn register<H: SyscallHandler + 'static>(&mut self, number: u64, handler: H) -> KResult<()> {
        let slot = usize::try_from(number)
            .ok()
            .and_then(|n| self.slots.get_mut(n))
            .ok_or(KernelError::InvalidArgument)?;
        let handler: Box<dyn SyscallHandler> = Box::new(handler);
        *slot = Some(Arc::from(handler));
        Ok(())
    }

    pub fn unregister(&mut self, number: u64) {
        if let Some(slot) = usize::try_from(number).ok().and_then(|n| self.slots.get_mut(n)) {
            *slot = None;
        }
    }

    pub fn get(&self, number: u64) -> Option<Arc<dyn SyscallHandler>> {
        let index = usize::try_from(number).ok()?;
        self.slots.get(index)?.clone()
    }

    pub fn is_registered(&self, number: u64) -> bool {
        self.get(number).is_some()
    }
}

/// Runs the handler for the call in `frame` on behalf of the thread the
/// CPU is currently running. The caller stores the result in `rax`.
pub fn dispatch(kernel: &mut Kernel, cpu: &mut Cpu, frame: &mut CpuContext) -> isize {
    let args = SyscallArgs::from_context(frame);
    let Some((pid, tid)) = cpu.current() else {
        log_warn!("syscall {} with no current process", args.number);
        return KernelError::NoCurrentProcess.to_syscall_ret();
    };
    let Some(handler) = kernel.syscalls.get(args.number) else {
        log_warn!("process {}: unknown syscall {}", pid, args.number);
        return KernelError::NotImplemented.to_syscall_ret();
    };
    if let Some(process) = kernel.table.get_mut(pid) {
        process.usage.syscalls += 1;
    }
    log_debug!("process {} syscall {} {:x?}", pid, args.number, args.args);

    let mut ctx = SyscallContext { kernel, cpu, frame, pid, tid };
    handler.call(&mut ctx, &args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ENOSYS, ESRCH};
    use crate::loader::ramdisk::RamDisk;
    use crate::testing::Harness;

    fn answer(_: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
        args.arg(0) as isize + 1
    }

    fn refuse(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
        -7
    }

    fn echo_pid(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
        assert_eq!(args.args, [1, 2, 3, 4, 5, 6]);
        ctx.pid as isize * 100
    }

    #[test]
    fn test_register_rejects_out_of_range() {
        let mut table = SyscallTable::new(4);
        assert_eq!(table.register(4, answer), Err(KernelError::InvalidArgument));
        assert_eq!(table.register(u64::MAX, answer), Err(KernelError::InvalidArgument));
        assert!(table.register(3, answer).is_ok());
        assert!(table.is_registered(3));
        assert!(!table.is_registered(2));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let mut h = Harness::new(RamDisk::builtin());
        h.kernel.spawn("init", &["init"]).unwrap();
        h.start();
        h.kernel.syscalls.register(40, answer).unwrap();
        assert_eq!(h.syscall(40, [41, 0, 0, 0, 0, 0]), 42);
        h.kernel.syscalls.register(40, refuse).unwrap();
        assert_eq!(h.syscall(40, [41, 0, 0, 0, 0, 0]), -7);
    }

    #[test]
    fn test_unregistered_number_is_enosys() {
        let mut h = Harness::new(RamDisk::builtin());
        let pid = h.kernel.spawn("init", &["init"]).unwrap();
        h.start();
        assert_eq!(h.syscall(63, [0; 6]), -(ENOSYS as isize));
        assert_eq!(h.syscall(1 << 40, [0; 6]), -(ENOSYS as isize));
        h.kernel.syscalls.unregister(SYS_GETPID);
        assert_eq!(h.syscall(SYS_GETPID, [0; 6]), -(ENOSYS as isize));
        // Rejected calls are not counted.
        assert_eq!(h.kernel.table.get(pid).unwrap().usage.syscalls, 0);
    }

    #[test]
    fn test_no_current_process_is_esrch() {
        let mut h = Harness::new(RamDisk::builtin());
        h.kernel.spawn("init", &["init"]).unwrap();
        assert_eq!(h.syscall(SYS_GETPID, [0; 6]), -(ESRCH as isize));
    }

    #[test]
    fn test_dispatch_counts_calls_and_passes_arguments() {
        let mut h = Harness::new(RamDisk::builtin());
        let pid = h.kernel.spawn("init", &["init"]).unwrap();
        h.start();
        h.kernel.syscalls.register(20, echo_pid).unwrap();
        assert_eq!(h.syscall(20, [1, 2, 3, 4, 5, 6]), pid as isize * 100);
        assert_eq!(h.syscall(SYS_GETPID, [0; 6]), pid as isize);
        assert_eq!(h.kernel.table.get(pid).unwrap().usage.syscalls, 2);
    }
}
