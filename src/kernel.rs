//! The kernel aggregate: process table, run queue, syscall table and the
//! platform collaborators, plus the operations that hand the CPU away.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::config::KernelConfig;
use crate::drivers::{Console, Keyboard};
use crate::error::{KResult, KernelError};
use crate::loader::{self, ramdisk::ImageSource};
use crate::memory::{PageFlags, VmProvider};
use crate::process::context::CpuContext;
use crate::process::table::ProcessTable;
use crate::process::thread::{Thread, ThreadState, Tid};
use crate::process::{ExitStatus, Pid, Priority, ProcessState, ProcessType};
use crate::sched::{Cpu, RoundRobin, UserTransition};
use crate::syscall::{self, SyscallTable};
use crate::{log_error, log_info, log_warn};

pub const SIGILL: u8 = 4;
pub const SIGFPE: u8 = 8;
pub const SIGSEGV: u8 = 11;

/// Hardware (or mock) collaborators the kernel is built over.
pub struct Platform {
    pub images: Box<dyn ImageSource>,
    pub vm: Box<dyn VmProvider>,
    pub console: Box<dyn Console>,
    pub keyboard: Box<dyn Keyboard>,
    pub transition: Box<dyn UserTransition>,
}

/// Arguments of an `exec`, already copied out of user memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

pub struct Kernel {
    pub config: KernelConfig,
    pub table: ProcessTable,
    pub run_queue: RoundRobin,
    pub syscalls: SyscallTable,
    pub console: Box<dyn Console>,
    pub keyboard: Box<dyn Keyboard>,
    images: Box<dyn ImageSource>,
    vm: Box<dyn VmProvider>,
    transition: Box<dyn UserTransition>,
    /// Threads detached by exit/exec. Their kernel stacks may still be in
    /// use by the trap that detached them, so they are freed on the next
    /// kernel entry.
    retired: Vec<Thread>,
}

impl Kernel {
    pub fn new(config: KernelConfig, platform: Platform) -> KResult<Kernel> {
        let mut syscalls = SyscallTable::new(config.syscall_slots);
        syscall::handlers::install(&mut syscalls)?;
        Ok(Kernel {
            config,
            table: ProcessTable::new(config),
            run_queue: RoundRobin::new(),
            syscalls,
            console: platform.console,
            keyboard: platform.keyboard,
            images: platform.images,
            vm: platform.vm,
            transition: platform.transition,
            retired: Vec::new(),
        })
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Frees threads retired before the current kernel entry.
    pub fn reap_retired(&mut self) {
        self.retired.clear();
    }

    /// Loads `path` into a new ready process with `argv = args`.
    pub fn spawn(&mut self, path: &str, args: &[&str]) -> KResult<Pid> {
        let bytes = self.images.read_image(path).ok_or(KernelError::NotFound)?;
        let mut image = loader::prepare_image(&*self.vm, &self.config, bytes)?;
        let args: Vec<String> = args.iter().map(|&a| String::from(a)).collect();
        image.push_arguments(&args, &[])?;

        let pid = self
            .table
            .create(path, image.entry, 0, ProcessType::Native, Priority::Normal)?;
        let process = self.table.get_mut(pid).ok_or(KernelError::NotFound)?;
        image.attach(process);
        process.state = ProcessState::Ready;
        let main = process.main_thread;
        self.run_queue.push((pid, main));
        log_info!("spawned {} as process {}", path, pid);
        Ok(pid)
    }

    /// Adds a ready thread to `pid` running `entry(arg)`.
    pub fn create_thread(&mut self, pid: Pid, name: &str, entry: u64, arg: u64) -> KResult<Tid> {
        let tid = self.table.create_thread(pid, name, entry, arg)?;
        self.run_queue.push((pid, tid));
        Ok(tid)
    }

    /// Replaces the image of `pid` and enters it. Everything that can fail
    /// happens before the old image is touched, so an error leaves the
    /// caller intact.
    pub fn process_exec(
        &mut self,
        cpu: &mut Cpu,
        pid: Pid,
        request: ExecRequest,
    ) -> KResult<Infallible> {
        let bytes = self
            .images
            .read_image(&request.path)
            .ok_or(KernelError::NotFound)?;
        let mut image = loader::prepare_image(&*self.vm, &self.config, bytes)?;
        image.push_arguments(&request.args, &request.env)?;

        let detached = self.table.replace_image(pid, &request.path, image)?;
        drop(request);
        self.retired.extend(detached);
        self.run_queue.remove_process(pid);

        let tid = match self.table.get(pid) {
            Some(p) => p.main_thread,
            None => panic!("process {} vanished during exec", pid),
        };
        self.enter(cpu, pid, tid)
    }

    /// Terminates `pid` and gives the CPU to the next ready thread.
    pub fn process_exit(&mut self, cpu: &mut Cpu, pid: Pid, status: ExitStatus) -> ! {
        let detached = match self.table.exit(pid, status) {
            Ok(detached) => detached,
            Err(err) => panic!("exit of process {} failed: {}", pid, err),
        };
        self.retired.extend(detached);
        self.run_queue.remove_process(pid);
        if cpu.current_pid() == Some(pid) {
            cpu.set_current(None);
        }
        self.schedule(cpu)
    }

    /// Kills the current process with `signal`.
    pub fn kill_current(&mut self, cpu: &mut Cpu, signal: u8) -> ! {
        let Some(pid) = cpu.current_pid() else {
            panic!("signal {} raised with no current process", signal);
        };
        log_warn!("process {} killed by signal {}", pid, signal);
        let status = ExitStatus { code: 128 + signal as i32, signal };
        self.process_exit(cpu, pid, status)
    }

    /// Saves the running thread's trap frame (returning 0), requeues it
    /// behind every other ready thread and reschedules.
    pub fn yield_current(&mut self, cpu: &mut Cpu, frame: &CpuContext) -> ! {
        if let Some((pid, tid)) = cpu.current() {
            if let Some(process) = self.table.get_mut(pid) {
                process.state = ProcessState::Ready;
                if let Some(thread) = process.thread_mut(tid) {
                    thread.context = *frame;
                    thread.context.set_return(0);
                    thread.state = ThreadState::Ready;
                    self.run_queue.push((pid, tid));
                }
            }
        }
        self.schedule(cpu)
    }

    /// Enters the next ready thread, or idles when there is none.
    pub fn schedule(&mut self, cpu: &mut Cpu) -> ! {
        while let Some((pid, tid)) = self.run_queue.pop_next() {
            let ready = self.table.get(pid).is_some_and(|p| {
                p.is_alive() && p.thread(tid).is_some_and(|t| t.state == ThreadState::Ready)
            });
            if ready {
                self.enter(cpu, pid, tid);
            }
        }
        cpu.set_current(None);
        log_info!("no runnable threads, cpu {} idle", cpu.id);
        self.transition.idle()
    }

    fn enter(&mut self, cpu: &mut Cpu, pid: Pid, tid: Tid) -> ! {
        let Some(process) = self.table.get_mut(pid) else {
            panic!("entering missing process {}", pid);
        };
        process.state = ProcessState::Running;
        process.usage.schedules += 1;
        if let Some(thread) = process.thread_mut(tid) {
            thread.state = ThreadState::Running;
        }
        cpu.set_current(Some((pid, tid)));
        loader::jump_to_user_mode(&*self.transition, process, tid)
    }

    /// Trap-level syscall entry: the result goes into the frame's return
    /// register, which the trap exit restores.
    pub fn handle_syscall(&mut self, cpu: &mut Cpu, frame: &mut CpuContext) {
        self.reap_retired();
        let ret = syscall::dispatch(self, cpu, frame);
        frame.set_return(ret);
    }

    /// Page fault at `addr`. Returns when a copy-on-write write fault was
    /// resolved; otherwise the faulting process is killed. Faults in ring 0
    /// are fatal.
    pub fn handle_page_fault(
        &mut self,
        cpu: &mut Cpu,
        addr: u64,
        write: bool,
        present: bool,
        from_user: bool,
    ) {
        self.reap_retired();
        if !from_user {
            log_error!("kernel page fault at {:#x}", addr);
            panic!("kernel page fault at {:#x}", addr);
        }
        if let (true, true, Some(pid)) = (write, present, cpu.current_pid()) {
            if let Some(process) = self.table.get_mut(pid) {
                if let Some(space) = process.space.as_deref_mut() {
                    let cow = space.query(addr).is_some_and(|f| f.contains(PageFlags::COW));
                    if cow && space.resolve_write_fault(addr).is_ok() {
                        process.usage.cow_faults += 1;
                        return;
                    }
                }
            }
        }
        log_warn!(
            "user page fault at {:#x} ({}, {})",
            addr,
            if write { "write" } else { "read" },
            if present { "protection" } else { "not present" }
        );
        self.kill_current(cpu, SIGSEGV)
    }
}
