use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::context::CpuContext;
use super::fd::FdTable;
use super::thread::{StackRegion, Thread, ThreadState, Tid};
use super::{
    Credentials, ExitStatus, MemoryRegions, Pid, Priority, Process, ProcessState, ProcessType,
    ResourceLimits, ResourceUsage, ANY_CHILD, INIT_PID,
};
use crate::config::KernelConfig;
use crate::error::{KResult, KernelError};
use crate::loader::{self, LoadedImage};
use crate::memory::{pages_for, PAGE_SIZE};
use crate::{log_debug, log_info, log_warn};

/// Every process in the system, keyed by pid.
///
/// Pids and tids come from table-wide counters and are never reused.
pub struct ProcessTable {
    config: KernelConfig,
    procs: BTreeMap<Pid, Process>,
    next_pid: Pid,
    next_tid: Tid,
    exit_seq: u64,
}

impl ResourceLimits {
    pub fn from_config(config: &KernelConfig) -> ResourceLimits {
        ResourceLimits {
            max_memory_pages: pages_for(config.user_image_limit)
                + pages_for(config.max_user_stack) * config.max_threads_per_process,
            max_open_files: config.max_open_files,
            max_threads: config.max_threads_per_process,
        }
    }
}

impl ProcessTable {
    pub fn new(config: KernelConfig) -> ProcessTable {
        ProcessTable {
            config,
            procs: BTreeMap::new(),
            next_pid: 1,
            next_tid: 1,
            exit_seq: 0,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.procs.keys().copied()
    }

    pub fn thread_get_by_tid(&self, tid: Tid) -> Option<(Pid, &Thread)> {
        self.procs
            .values()
            .find_map(|p| p.thread(tid).map(|t| (p.pid, t)))
    }

    fn check_slot(&self) -> KResult<()> {
        if self.procs.len() >= self.config.max_processes {
            log_warn!("process table full ({} slots)", self.config.max_processes);
            return Err(KernelError::OutOfResources);
        }
        Ok(())
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// New process in state `New` with a main thread and the standard
    /// descriptors. It has no address space until an image is attached.
    pub fn create(
        &mut self,
        name: &str,
        entry: u64,
        arg: u64,
        kind: ProcessType,
        priority: Priority,
    ) -> KResult<Pid> {
        self.check_slot()?;
        let fds = FdTable::with_std_streams(self.config.max_open_files)?;
        let pid = self.alloc_pid();
        let tid = self.alloc_tid();

        let mut main = Thread::new(tid, pid, name, entry, arg, self.config.kernel_stack_size);
        main.context = CpuContext::for_user(entry, 0);
        main.context.rdi = arg;

        self.procs.insert(
            pid,
            Process {
                pid,
                parent: None,
                name: String::from(name),
                state: ProcessState::New,
                kind,
                priority,
                creds: Credentials::ROOT,
                limits: ResourceLimits::from_config(&self.config),
                usage: ResourceUsage::default(),
                regions: MemoryRegions::default(),
                entry,
                fds,
                threads: alloc::vec![main],
                main_thread: tid,
                children: Vec::new(),
                space: None,
                exit: None,
                exit_seq: 0,
            },
        );
        log_info!("process {} ({}) created", pid, name);
        Ok(pid)
    }

    /// Duplicates `parent_pid` from the register state in `frame`.
    ///
    /// The child's address space shares every frame copy-on-write, its
    /// descriptors point at the parent's open files, and its only thread
    /// resumes from `frame` with a return value of 0. The child is appended
    /// to the parent's children.
    pub fn fork(&mut self, parent_pid: Pid, parent_tid: Tid, frame: &CpuContext) -> KResult<Pid> {
        self.check_slot()?;
        let kernel_stack_size = self.config.kernel_stack_size;
        let pid = self.next_pid;
        let tid = self.next_tid;

        let parent = self
            .procs
            .get_mut(&parent_pid)
            .filter(|p| p.is_alive())
            .ok_or(KernelError::NotFound)?;
        let thread_name = parent
            .thread(parent_tid)
            .map(|t| t.name.clone())
            .ok_or(KernelError::NotFound)?;
        let space = parent
            .space
            .as_deref_mut()
            .ok_or(KernelError::InvalidArgument)?
            .fork_cow()?;

        let mut main = Thread::new(tid, pid, &thread_name, frame.rip, 0, kernel_stack_size);
        main.context = *frame;
        main.context.set_return(0);
        main.state = ThreadState::Ready;
        main.priority = parent.thread(parent_tid).map_or(0, |t| t.priority);

        let child = Process {
            pid,
            parent: Some(parent_pid),
            name: parent.name.clone(),
            state: ProcessState::Ready,
            kind: parent.kind,
            priority: parent.priority,
            creds: parent.creds,
            limits: parent.limits,
            usage: ResourceUsage::default(),
            regions: parent.regions,
            entry: parent.entry,
            fds: parent.fds.clone(),
            threads: alloc::vec![main],
            main_thread: tid,
            children: Vec::new(),
            space: Some(space),
            exit: None,
            exit_seq: 0,
        };
        parent.children.push(pid);
        self.next_pid += 1;
        self.next_tid += 1;
        self.procs.insert(pid, child);
        log_info!("process {} forked child {}", parent_pid, pid);
        Ok(pid)
    }

    /// Swaps in a freshly built image: old threads and descriptors are
    /// discarded, the standard descriptors reinstalled and a new main
    /// thread starts at the image entry. Returns the detached threads.
    pub fn replace_image(&mut self, pid: Pid, name: &str, image: LoadedImage) -> KResult<Vec<Thread>> {
        let fds = FdTable::with_std_streams(self.config.max_open_files)?;
        let kernel_stack_size = self.config.kernel_stack_size;
        if !self.procs.get(&pid).is_some_and(|p| p.is_alive()) {
            return Err(KernelError::NotFound);
        }
        let tid = self.alloc_tid();
        let process = self.procs.get_mut(&pid).ok_or(KernelError::NotFound)?;

        let mut detached: Vec<Thread> = process.threads.drain(..).collect();
        for thread in detached.iter_mut() {
            thread.state = ThreadState::Terminated;
        }
        process.fds = fds;
        process.name = String::from(name);
        process.threads.push(Thread::new(tid, pid, name, image.entry, 0, kernel_stack_size));
        process.main_thread = tid;
        image.attach(process);
        log_info!("process {} now running {} (main thread {})", pid, name, tid);
        Ok(detached)
    }

    fn release_resources(process: &mut Process) -> Vec<Thread> {
        process.fds.close_all();
        process.space = None;
        let mut detached: Vec<Thread> = process.threads.drain(..).collect();
        for thread in detached.iter_mut() {
            thread.state = ThreadState::Terminated;
        }
        detached
    }

    /// Hands `pid`'s children to init, or orphans them when there is no
    /// live init. Orphaned zombies are dropped since nobody can reap them.
    fn reparent_children(&mut self, pid: Pid) {
        let children = match self.procs.get_mut(&pid) {
            Some(p) => core::mem::take(&mut p.children),
            None => return,
        };
        let adopt = pid != INIT_PID && self.procs.get(&INIT_PID).is_some_and(|p| p.is_alive());
        for child in children {
            if adopt {
                if let Some(c) = self.procs.get_mut(&child) {
                    c.parent = Some(INIT_PID);
                }
                if let Some(init) = self.procs.get_mut(&INIT_PID) {
                    init.children.push(child);
                }
            } else if let Some(c) = self.procs.get_mut(&child) {
                c.parent = None;
                if c.is_zombie() {
                    self.procs.remove(&child);
                    log_debug!("dropped orphaned zombie {}", child);
                }
            }
        }
    }

    /// Turns `pid` into a zombie and releases its descriptors, address
    /// space and threads. Returns the threads so the caller can retire
    /// their kernel stacks once it is no longer running on one of them.
    pub fn exit(&mut self, pid: Pid, status: ExitStatus) -> KResult<Vec<Thread>> {
        self.exit_seq += 1;
        let seq = self.exit_seq;
        let process = self
            .procs
            .get_mut(&pid)
            .filter(|p| p.is_alive())
            .ok_or(KernelError::NotFound)?;

        process.exit = Some(status);
        process.exit_seq = seq;
        process.state = ProcessState::Zombie;
        let detached = Self::release_resources(process);
        let has_parent = process.parent.is_some();

        self.reparent_children(pid);
        if !has_parent {
            self.procs.remove(&pid);
            log_info!("process {} exited ({}) with no parent, slot freed", pid, status.code);
        } else {
            log_info!(
                "process {} exited with code {} signal {}",
                pid,
                status.code,
                status.signal
            );
        }
        Ok(detached)
    }

    /// Zombie child of `parent` matching `pid`, or the one that exited
    /// first when `pid` is [`ANY_CHILD`]. Never mutates anything.
    pub fn find_zombie_child(&self, parent: Pid, pid: Pid) -> KResult<Pid> {
        let p = self.procs.get(&parent).ok_or(KernelError::NotFound)?;
        let zombie = |c: &&Pid| self.procs.get(*c).is_some_and(|c| c.is_zombie());
        let found = if pid == ANY_CHILD {
            p.children
                .iter()
                .filter(zombie)
                .min_by_key(|c| self.procs.get(*c).map_or(u64::MAX, |c| c.exit_seq))
        } else {
            p.children.iter().filter(zombie).find(|&&c| c == pid)
        };
        found.copied().ok_or(KernelError::NoSuchChild)
    }

    /// Collects a zombie child: unlinks it from the parent and frees its slot.
    pub fn reap(&mut self, parent: Pid, child: Pid) -> KResult<(Pid, ExitStatus)> {
        let is_zombie_child = self.procs.get(&parent).is_some_and(|p| p.children.contains(&child))
            && self.procs.get(&child).is_some_and(|c| c.is_zombie());
        if !is_zombie_child {
            return Err(KernelError::NoSuchChild);
        }
        if let Some(p) = self.procs.get_mut(&parent) {
            p.children.retain(|&c| c != child);
        }
        let mut reaped = self.procs.remove(&child).ok_or(KernelError::NoSuchChild)?;
        reaped.state = ProcessState::Terminated;
        let status = reaped.exit.unwrap_or(ExitStatus { code: 0, signal: 0 });
        log_info!("process {} reaped child {}", parent, child);
        Ok((child, status))
    }

    /// Non-blocking wait: reaps a matching zombie or fails with
    /// `NoSuchChild` without touching the child list.
    pub fn wait(&mut self, parent: Pid, pid: Pid) -> KResult<(Pid, ExitStatus)> {
        let child = self.find_zombie_child(parent, pid)?;
        self.reap(parent, child)
    }

    /// Removes `pid` outright, whatever its state.
    pub fn destroy(&mut self, pid: Pid) -> KResult<Vec<Thread>> {
        let process = self.procs.get_mut(&pid).ok_or(KernelError::NotFound)?;
        let detached = Self::release_resources(process);
        let parent = process.parent;

        self.reparent_children(pid);
        if let Some(parent) = parent.and_then(|pp| self.procs.get_mut(&pp)) {
            parent.children.retain(|&c| c != pid);
        }
        self.procs.remove(&pid);
        log_info!("process {} destroyed", pid);
        Ok(detached)
    }

    /// Extra thread in `pid` sharing its address space, with a private user
    /// stack mapped below the lowest existing stack (one guard page apart).
    pub fn create_thread(&mut self, pid: Pid, name: &str, entry: u64, arg: u64) -> KResult<Tid> {
        let stack_size = self.config.default_user_stack;
        let kernel_stack_size = self.config.kernel_stack_size;
        let max_threads = self.config.max_threads_per_process;
        let tid = self.next_tid;

        let process = self
            .procs
            .get_mut(&pid)
            .filter(|p| p.is_alive())
            .ok_or(KernelError::NotFound)?;
        if process.threads.len() >= max_threads.min(process.limits.max_threads) {
            return Err(KernelError::OutOfResources);
        }
        let floor = process
            .threads
            .iter()
            .filter_map(|t| t.user_stack.map(|s| s.bottom))
            .chain(core::iter::once(process.regions.stack.start))
            .min()
            .ok_or(KernelError::InvalidArgument)?;
        let top = floor
            .checked_sub(PAGE_SIZE as u64)
            .ok_or(KernelError::OutOfResources)?;
        let space = process.space.as_deref_mut().ok_or(KernelError::InvalidArgument)?;
        loader::map_stack(space, top, stack_size)?;

        let mut thread = Thread::new(tid, pid, name, entry, arg, kernel_stack_size);
        thread.context = CpuContext::for_user(entry, top);
        thread.context.rdi = arg;
        thread.user_stack = Some(StackRegion {
            bottom: top - (pages_for(stack_size) * PAGE_SIZE) as u64,
            top,
        });
        thread.state = ThreadState::Ready;
        process.threads.push(thread);
        self.next_tid += 1;
        log_debug!("process {} thread {} created at {:#x}", pid, tid, entry);
        Ok(tid)
    }

    /// Removes a secondary thread and unmaps its user stack.
    pub fn destroy_thread(&mut self, pid: Pid, tid: Tid) -> KResult<Thread> {
        let process = self.procs.get_mut(&pid).ok_or(KernelError::NotFound)?;
        if tid == process.main_thread {
            return Err(KernelError::InvalidArgument);
        }
        let index = process
            .threads
            .iter()
            .position(|t| t.tid == tid)
            .ok_or(KernelError::NotFound)?;
        let mut thread = process.threads.remove(index);
        thread.state = ThreadState::Terminated;
        if let (Some(stack), Some(space)) = (thread.user_stack, process.space.as_deref_mut()) {
            loader::unmap_range(space, stack.bottom, stack.top);
        }
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;
    use crate::memory::soft::SoftVm;
    use crate::memory::{PageFlags, USER_STACK_TOP};
    use crate::testing;

    fn table_with_init(vm: &SoftVm) -> (ProcessTable, Pid) {
        let mut table = ProcessTable::new(KernelConfig::DEFAULT);
        let pid = table
            .create("init", 0, 0, ProcessType::System, Priority::Normal)
            .unwrap();
        let config = *table.config();
        let image = testing::image_with_code(&[0x90; 16], b"data", 64);
        loader::setup_user_address_space(vm, &config, table.get_mut(pid).unwrap(), &image)
            .unwrap();
        (table, pid)
    }

    fn frame_of(table: &ProcessTable, pid: Pid) -> (Tid, CpuContext) {
        let p = table.get(pid).unwrap();
        (p.main_thread, p.main().unwrap().context)
    }

    fn fork(table: &mut ProcessTable, parent: Pid) -> Pid {
        let (tid, frame) = frame_of(table, parent);
        table.fork(parent, tid, &frame).unwrap()
    }

    fn exit(table: &mut ProcessTable, pid: Pid, code: i32) {
        table.exit(pid, ExitStatus { code, signal: 0 }).unwrap();
    }

    #[test]
    fn test_create_assigns_increasing_pids() {
        let mut table = ProcessTable::new(KernelConfig::DEFAULT);
        let a = table.create("a", 0x40_0000, 0, ProcessType::Native, Priority::Normal).unwrap();
        let b = table.create("b", 0x40_0000, 0, ProcessType::Native, Priority::Normal).unwrap();
        assert!(b > a);
        let p = table.get(a).unwrap();
        assert_eq!(p.state, ProcessState::New);
        assert_eq!(p.threads.len(), 1);
        assert_eq!(p.fds.open_count(), 3);
        assert_eq!(p.usage, ResourceUsage::default());
        assert!(table.get(99).is_none());
        assert!(table.thread_get_by_tid(999).is_none());
        assert_eq!(table.thread_get_by_tid(p.main_thread).map(|(pid, _)| pid), Some(a));
    }

    #[test]
    fn test_create_fails_when_table_full() {
        let config = KernelConfig { max_processes: 2, ..KernelConfig::DEFAULT };
        let mut table = ProcessTable::new(config);
        table.create("a", 0, 0, ProcessType::Native, Priority::Normal).unwrap();
        table.create("b", 0, 0, ProcessType::Native, Priority::Normal).unwrap();
        assert_eq!(
            table.create("c", 0, 0, ProcessType::Native, Priority::Normal),
            Err(KernelError::OutOfResources)
        );
    }

    #[test]
    fn test_fork_appends_child_in_order() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let first = fork(&mut table, init);
        let second = fork(&mut table, init);
        assert_eq!(table.get(init).unwrap().children, [first, second]);

        let third = fork(&mut table, init);
        assert_eq!(table.get(init).unwrap().children, [first, second, third]);
        assert_eq!(table.get(third).unwrap().parent, Some(init));
    }

    #[test]
    fn test_fork_child_copies_frame_with_zero_return() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let (tid, mut frame) = frame_of(&table, init);
        frame.rax = 6;
        frame.rbx = 0xDEAD;
        let child = table.fork(init, tid, &frame).unwrap();

        let c = table.get(child).unwrap();
        let ctx = c.main().unwrap().context;
        assert_eq!(ctx.rax, 0);
        assert_eq!(ctx.rbx, 0xDEAD);
        assert_eq!(ctx.rip, frame.rip);
        assert_ne!(c.main_thread, tid);
        assert_eq!(c.state, ProcessState::Ready);
        assert_eq!(c.creds, table.get(init).unwrap().creds);
    }

    #[test]
    fn test_fork_shares_backing_frames() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let frames_before = vm.live_frames();
        let child = fork(&mut table, init);
        assert_eq!(vm.live_frames(), frames_before);

        let parent_space = table.get(init).unwrap().space.as_deref().unwrap();
        let child_space = table.get(child).unwrap().space.as_deref().unwrap();
        let data = table.get(init).unwrap().regions.data.start;
        assert_eq!(parent_space.backing(data), child_space.backing(data));
        assert!(child_space.query(data).unwrap().contains(PageFlags::COW));
        assert_eq!(parent_space.page_count(), child_space.page_count());
    }

    #[test]
    fn test_wait_on_running_child_fails_without_mutation() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let a = fork(&mut table, init);
        let b = fork(&mut table, init);
        assert_eq!(table.wait(init, a), Err(KernelError::NoSuchChild));
        assert_eq!(table.wait(init, ANY_CHILD), Err(KernelError::NoSuchChild));
        assert_eq!(table.get(init).unwrap().children, [a, b]);
    }

    #[test]
    fn test_wait_reaps_exactly_once() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let a = fork(&mut table, init);
        let b = fork(&mut table, init);
        let c = fork(&mut table, init);
        exit(&mut table, b, 7);
        assert!(table.get(b).unwrap().is_zombie());
        assert!(table.get(b).unwrap().space.is_none());

        assert_eq!(table.wait(init, b), Ok((b, ExitStatus { code: 7, signal: 0 })));
        assert_eq!(table.get(init).unwrap().children, [a, c]);
        assert!(table.get(b).is_none());
        assert_eq!(table.wait(init, b), Err(KernelError::NoSuchChild));
    }

    #[test]
    fn test_wildcard_wait_takes_oldest_zombie() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let a = fork(&mut table, init);
        let b = fork(&mut table, init);
        exit(&mut table, b, 2);
        exit(&mut table, a, 1);
        assert_eq!(table.wait(init, ANY_CHILD).unwrap().0, b);
        assert_eq!(table.wait(init, ANY_CHILD).unwrap().0, a);
        assert_eq!(table.wait(init, ANY_CHILD), Err(KernelError::NoSuchChild));
    }

    #[test]
    fn test_wait_ignores_other_parents_children() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let a = fork(&mut table, init);
        let grandchild = fork(&mut table, a);
        exit(&mut table, grandchild, 0);
        assert_eq!(table.wait(init, grandchild), Err(KernelError::NoSuchChild));
        assert!(table.wait(a, grandchild).is_ok());
    }

    #[test]
    fn test_exit_releases_frames_exactly_once() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let baseline = vm.live_frames();
        let child = fork(&mut table, init);
        {
            let space = table.get_mut(child).unwrap().space.as_deref_mut().unwrap();
            let data = crate::memory::USER_CODE_BASE + PAGE_SIZE as u64;
            space.copy_to_user(data, b"dirty").unwrap();
        }
        assert_eq!(vm.live_frames(), baseline + 1);

        exit(&mut table, child, 0);
        assert_eq!(vm.live_frames(), baseline);
        table.wait(init, child).unwrap();
        assert_eq!(vm.live_frames(), baseline);
    }

    #[test]
    fn test_exit_reparents_children_to_init() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let mid = fork(&mut table, init);
        let leaf = fork(&mut table, mid);
        exit(&mut table, mid, 0);

        assert_eq!(table.get(leaf).unwrap().parent, Some(INIT_PID));
        assert_eq!(table.get(init).unwrap().children, [mid, leaf]);
        exit(&mut table, leaf, 3);
        assert_eq!(table.wait(init, leaf).unwrap().1.code, 3);
    }

    #[test]
    fn test_exit_without_parent_frees_slot() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let child = fork(&mut table, init);
        let detached = table.exit(init, ExitStatus { code: 0, signal: 0 }).unwrap();
        assert_eq!(detached.len(), 1);
        assert!(detached.iter().all(|t| t.state == ThreadState::Terminated));
        assert!(table.get(init).is_none());
        assert_eq!(table.get(child).unwrap().parent, None);
        assert_eq!(table.exit(init, ExitStatus { code: 0, signal: 0 }).err(), Some(KernelError::NotFound));
    }

    #[test]
    fn test_destroy_unlinks_from_parent() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let a = fork(&mut table, init);
        let b = fork(&mut table, init);
        table.destroy(a).unwrap();
        assert_eq!(table.get(init).unwrap().children, [b]);
        assert!(table.get(a).is_none());
        assert_eq!(table.destroy(a).err(), Some(KernelError::NotFound));
    }

    #[test]
    fn test_threads_get_unique_ids_and_private_stacks() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        let t1 = table.create_thread(init, "worker", 0x40_0000, 11).unwrap();
        let t2 = table.create_thread(init, "worker", 0x40_0000, 12).unwrap();
        assert_ne!(t1, t2);

        let p = table.get(init).unwrap();
        let s1 = p.thread(t1).unwrap().user_stack.unwrap();
        let s2 = p.thread(t2).unwrap().user_stack.unwrap();
        assert!(s1.top < USER_STACK_TOP);
        assert!(s2.top <= s1.bottom - PAGE_SIZE as u64);
        let space = p.space.as_deref().unwrap();
        assert_eq!(space.query(s1.bottom), Some(PageFlags::USER_DATA));
        assert_eq!(space.query(s1.top), None);
        assert_eq!(p.thread(t2).unwrap().context.rdi, 12);

        let pages = space.page_count();
        let removed = table.destroy_thread(init, t1).unwrap();
        assert_eq!(removed.tid, t1);
        let p = table.get(init).unwrap();
        assert!(p.space.as_deref().unwrap().page_count() < pages);
        let main = p.main_thread;
        assert_eq!(table.destroy_thread(init, main).err(), Some(KernelError::InvalidArgument));
    }

    #[test]
    fn test_thread_limit() {
        let vm = SoftVm::new();
        let mut table = ProcessTable::new(KernelConfig {
            max_threads_per_process: 2,
            ..KernelConfig::DEFAULT
        });
        let pid = table.create("p", 0, 0, ProcessType::Native, Priority::Normal).unwrap();
        let config = *table.config();
        let image = testing::image_with_code(&[0x90], &[], 0);
        loader::setup_user_address_space(&vm, &config, table.get_mut(pid).unwrap(), &image)
            .unwrap();
        table.create_thread(pid, "t", 0x40_0000, 0).unwrap();
        assert_eq!(
            table.create_thread(pid, "t", 0x40_0000, 0),
            Err(KernelError::OutOfResources)
        );
    }

    #[test]
    fn test_replace_image_detaches_old_threads() {
        let vm = SoftVm::new();
        let (mut table, init) = table_with_init(&vm);
        table.create_thread(init, "worker", 0x40_0000, 0).unwrap();
        let old_main = table.get(init).unwrap().main_thread;

        let bytes = testing::image_with_code(&[0x90; 8], &[], 0);
        let image = loader::prepare_image(&vm, table.config(), &bytes).unwrap();
        let detached = table.replace_image(init, "/bin/other", image).unwrap();
        assert_eq!(detached.len(), 2);

        let p = table.get(init).unwrap();
        assert_eq!(p.threads.len(), 1);
        assert_ne!(p.main_thread, old_main);
        assert_eq!(p.name, "/bin/other");
        assert_eq!(p.main().unwrap().context.rip, crate::memory::USER_CODE_BASE);
        assert_eq!(p.fds.open_count(), 3);
    }
}
