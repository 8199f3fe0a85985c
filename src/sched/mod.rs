//! Per-CPU current slot, the ready queue and the ring-transition seam.

use alloc::collections::VecDeque;

use crate::process::context::CpuContext;
use crate::process::thread::Tid;
use crate::process::Pid;

/// A schedulable thread.
pub type ThreadRef = (Pid, Tid);

/// What one CPU is running. Written only by the scheduler; the syscall
/// dispatcher receives it by reference.
#[derive(Debug, Default)]
pub struct Cpu {
    pub id: usize,
    current: Option<ThreadRef>,
}

impl Cpu {
    pub const fn new(id: usize) -> Cpu {
        Cpu { id, current: None }
    }

    pub fn current(&self) -> Option<ThreadRef> {
        self.current
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current.map(|(pid, _)| pid)
    }

    pub(crate) fn set_current(&mut self, current: Option<ThreadRef>) {
        self.current = current;
    }
}

/// FIFO of ready threads.
#[derive(Debug, Default)]
pub struct RoundRobin {
    queue: VecDeque<ThreadRef>,
}

impl RoundRobin {
    pub fn new() -> RoundRobin {
        RoundRobin::default()
    }

    /// Appends `thread` unless it is already queued.
    pub fn push(&mut self, thread: ThreadRef) {
        if !self.queue.contains(&thread) {
            self.queue.push_back(thread);
        }
    }

    pub fn pop_next(&mut self) -> Option<ThreadRef> {
        self.queue.pop_front()
    }

    pub fn remove_process(&mut self, pid: Pid) {
        self.queue.retain(|&(p, _)| p != pid);
    }

    pub fn remove_thread(&mut self, thread: ThreadRef) {
        self.queue.retain(|&t| t != thread);
    }

    pub fn contains(&self, thread: ThreadRef) -> bool {
        self.queue.contains(&thread)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Privilege drop into user mode. Implemented with `iretq` on x86_64 and
/// by a recording mock in tests.
pub trait UserTransition {
    /// Loads `ctx` and resumes it in ring 3, trapping back onto
    /// `kernel_stack_top`.
    fn enter_user(&self, ctx: &CpuContext, kernel_stack_top: u64) -> !;

    /// Nothing runnable: wait for an interrupt forever.
    fn idle(&self) -> !;
}
