//! Processes: identity, memory regions, descriptors, threads and their
//! place in the parent/child tree.

pub mod context;
pub mod fd;
pub mod table;
pub mod thread;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::memory::AddressSpace;
use fd::FdTable;
use thread::{Thread, Tid};

pub type Pid = u64;

/// `wait` wildcard: any child.
pub const ANY_CHILD: Pid = 0;

/// Pid that inherits orphaned children.
pub const INIT_PID: Pid = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Sleeping,
    /// Exited, exit status not yet collected by the parent.
    Zombie,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessType {
    Native,
    Compat,
    System,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    Low,
    Normal,
    High,
    Realtime,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const SPAWN    = 1 << 0;
        const RAW_IO   = 1 << 1;
        const KILL_ANY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub capabilities: Capabilities,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0, capabilities: Capabilities::all() };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_memory_pages: usize,
    pub max_open_files: usize,
    pub max_threads: usize,
}

/// Counters reset at creation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub syscalls: u64,
    pub schedules: u64,
    pub cow_faults: u64,
}

/// Half-open virtual range `[start, end)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegions {
    pub code: Region,
    pub data: Region,
    pub bss: Region,
    pub heap: Region,
    pub stack: Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    /// Terminating signal, 0 for a voluntary exit.
    pub signal: u8,
}

pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub state: ProcessState,
    pub kind: ProcessType,
    pub priority: Priority,
    pub creds: Credentials,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub regions: MemoryRegions,
    pub entry: u64,
    pub fds: FdTable,
    pub threads: Vec<Thread>,
    pub main_thread: Tid,
    /// Children in fork order.
    pub children: Vec<Pid>,
    pub space: Option<Box<dyn AddressSpace>>,
    pub exit: Option<ExitStatus>,
    /// Orders zombies by exit time for wildcard waits.
    pub exit_seq: u64,
}

impl Process {
    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.tid == tid)
    }

    pub fn main(&self) -> Option<&Thread> {
        self.thread(self.main_thread)
    }

    pub fn main_mut(&mut self) -> Option<&mut Thread> {
        let tid = self.main_thread;
        self.thread_mut(tid)
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Zombie | ProcessState::Terminated)
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("threads", &self.threads.len())
            .field("children", &self.children)
            .field("exit", &self.exit)
            .finish()
    }
}
