use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::context::CpuContext;
use super::Pid;

pub type Tid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Waiting,
    Sleeping,
    Terminated,
}

/// Ring-0 stack a thread traps onto. Owned by the thread and freed with it.
pub struct KernelStack {
    memory: Vec<u8>,
}

impl KernelStack {
    pub fn new(size: usize) -> KernelStack {
        KernelStack { memory: vec![0u8; size] }
    }

    /// 16-byte aligned top, loaded into TSS.rsp0 while the thread runs.
    pub fn top(&self) -> u64 {
        let end = self.memory.as_ptr() as u64 + self.memory.len() as u64;
        end & !0xF
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

/// User stack pages carved out for a thread, `[bottom, top)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub bottom: u64,
    pub top: u64,
}

pub struct Thread {
    pub tid: Tid,
    pub pid: Pid,
    pub name: String,
    pub state: ThreadState,
    pub priority: u8,
    pub entry: u64,
    pub arg: u64,
    pub context: CpuContext,
    pub kernel_stack: KernelStack,
    /// Private user stack. The main thread's stack belongs to the image
    /// and is released with the address space instead.
    pub user_stack: Option<StackRegion>,
}

impl Thread {
    pub fn new(tid: Tid, pid: Pid, name: &str, entry: u64, arg: u64, kernel_stack_size: usize) -> Thread {
        Thread {
            tid,
            pid,
            name: String::from(name),
            state: ThreadState::New,
            priority: 0,
            entry,
            arg,
            context: CpuContext::default(),
            kernel_stack: KernelStack::new(kernel_stack_size),
            user_stack: None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ThreadState::Ready | ThreadState::Running)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("rip", &format_args!("{:#x}", self.context.rip))
            .finish()
    }
}
