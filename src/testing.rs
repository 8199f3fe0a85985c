//! Host-side stand-ins for the hardware seams, shared by the unit tests.

use std::boxed::Box;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::vec::Vec;

use spin::Mutex;

use crate::config::KernelConfig;
use crate::drivers::{Console, Keyboard};
use crate::error::KResult;
use crate::kernel::{Kernel, Platform};
use crate::loader::flat::FlatImage;
use crate::loader::ramdisk::RamDisk;
use crate::memory::soft::SoftVm;
use crate::memory::{Access, AddressSpace, PageFlags, VmProvider};
use crate::process::context::CpuContext;
use crate::sched::{Cpu, UserTransition};

/// Console that keeps everything written to it.
#[derive(Clone, Default)]
pub struct RecordingConsole {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl RecordingConsole {
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl Console for RecordingConsole {
    fn write(&mut self, bytes: &[u8]) {
        self.bytes.lock().extend_from_slice(bytes);
    }
}

/// Keyboard fed from a script; runs dry with `None`.
#[derive(Clone, Default)]
pub struct ScriptedKeyboard {
    state: Arc<Mutex<(VecDeque<u8>, usize)>>,
}

impl ScriptedKeyboard {
    pub fn push(&self, bytes: &[u8]) {
        self.state.lock().0.extend(bytes.iter().copied());
    }

    /// Number of `read_char` calls so far.
    pub fn reads(&self) -> usize {
        self.state.lock().1
    }
}

impl Keyboard for ScriptedKeyboard {
    fn read_char(&mut self) -> Option<u8> {
        let mut state = self.state.lock();
        state.1 += 1;
        state.0.pop_front()
    }
}

/// Where control would have gone instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    EnterUser { context: CpuContext, kernel_stack_top: u64 },
    Idle,
}

/// Unwinds with a [`Transition`] payload instead of leaving ring 0.
#[derive(Default)]
pub struct MockTransition;

impl MockTransition {
    pub fn new() -> MockTransition {
        MockTransition
    }
}

impl UserTransition for MockTransition {
    fn enter_user(&self, ctx: &CpuContext, kernel_stack_top: u64) -> ! {
        panic::panic_any(Transition::EnterUser { context: *ctx, kernel_stack_top })
    }

    fn idle(&self) -> ! {
        panic::panic_any(Transition::Idle)
    }
}

/// Runs `f`, which must end in a [`MockTransition`], and returns where it
/// went. Any other panic is propagated.
pub fn expect_transition<F: FnOnce()>(f: F) -> Transition {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("expected a transition, but the call returned"),
        Err(payload) => match payload.downcast::<Transition>() {
            Ok(transition) => *transition,
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyEvent {
    Validate { ptr: u64, len: usize },
    Read { vaddr: u64, len: usize },
    Write { vaddr: u64, len: usize },
}

#[derive(Clone, Default)]
pub struct SpyLog {
    events: Arc<Mutex<Vec<SpyEvent>>>,
}

impl SpyLog {
    pub fn events(&self) -> Vec<SpyEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: SpyEvent) {
        self.events.lock().push(event);
    }
}

/// Soft address spaces that log validation and user copies in order.
pub struct SpyVm {
    inner: SoftVm,
    log: SpyLog,
}

impl SpyVm {
    pub fn new(inner: SoftVm) -> (SpyVm, SpyLog) {
        let log = SpyLog::default();
        (SpyVm { inner, log: log.clone() }, log)
    }
}

impl VmProvider for SpyVm {
    fn create_address_space(&self) -> KResult<Box<dyn AddressSpace>> {
        let inner = self.inner.create_address_space()?;
        Ok(Box::new(SpySpace { inner, log: self.log.clone() }))
    }
}

struct SpySpace {
    inner: Box<dyn AddressSpace>,
    log: SpyLog,
}

impl AddressSpace for SpySpace {
    fn map_page(&mut self, vaddr: u64, flags: PageFlags, contents: &[u8]) -> KResult<()> {
        self.inner.map_page(vaddr, flags, contents)
    }

    fn unmap_page(&mut self, vaddr: u64) -> KResult<()> {
        self.inner.unmap_page(vaddr)
    }

    fn query(&self, vaddr: u64) -> Option<PageFlags> {
        self.inner.query(vaddr)
    }

    fn page_count(&self) -> usize {
        self.inner.page_count()
    }

    fn backing(&self, vaddr: u64) -> Option<u64> {
        self.inner.backing(vaddr)
    }

    fn fork_cow(&mut self) -> KResult<Box<dyn AddressSpace>> {
        let inner = self.inner.fork_cow()?;
        Ok(Box::new(SpySpace { inner, log: self.log.clone() }))
    }

    fn resolve_write_fault(&mut self, vaddr: u64) -> KResult<()> {
        self.inner.resolve_write_fault(vaddr)
    }

    fn read_bytes(&self, vaddr: u64, dst: &mut [u8]) -> KResult<()> {
        self.log.record(SpyEvent::Read { vaddr, len: dst.len() });
        self.inner.read_bytes(vaddr, dst)
    }

    fn write_bytes(&mut self, vaddr: u64, src: &[u8]) -> KResult<()> {
        self.log.record(SpyEvent::Write { vaddr, len: src.len() });
        self.inner.write_bytes(vaddr, src)
    }

    fn activate(&self) {}

    fn validate_user_pointer(&self, ptr: u64, len: usize, access: Access) -> bool {
        self.log.record(SpyEvent::Validate { ptr, len });
        self.inner.validate_user_pointer(ptr, len, access)
    }
}

/// Encoded executable flat image.
pub fn image_with_code(code: &[u8], data: &[u8], bss: u32) -> Vec<u8> {
    FlatImage::new(code, data).with_bss(bss).encode()
}

/// A kernel over mock hardware, plus the trap frame of whatever thread the
/// last transition entered.
pub struct Harness {
    pub kernel: Kernel,
    pub cpu: Cpu,
    pub console: RecordingConsole,
    pub keyboard: ScriptedKeyboard,
    pub vm: SoftVm,
    pub frame: CpuContext,
}

impl Harness {
    pub fn new(disk: RamDisk) -> Harness {
        let vm = SoftVm::new();
        Harness::build(disk, Box::new(vm.handle()), vm)
    }

    pub fn with_spy(disk: RamDisk) -> (Harness, SpyLog) {
        let vm = SoftVm::new();
        let (spy, log) = SpyVm::new(vm.handle());
        (Harness::build(disk, Box::new(spy), vm), log)
    }

    fn build(disk: RamDisk, provider: Box<dyn VmProvider>, vm: SoftVm) -> Harness {
        let console = RecordingConsole::default();
        let keyboard = ScriptedKeyboard::default();
        let platform = Platform {
            images: Box::new(disk),
            vm: provider,
            console: Box::new(console.clone()),
            keyboard: Box::new(keyboard.clone()),
            transition: Box::new(MockTransition::new()),
        };
        let kernel = Kernel::new(KernelConfig::DEFAULT, platform).unwrap();
        Harness { kernel, cpu: Cpu::new(0), console, keyboard, vm, frame: CpuContext::default() }
    }

    /// Runs `f`, which must leave for user mode or idle; an entered
    /// context becomes the frame for the next syscall.
    pub fn expect<F: FnOnce(&mut Harness)>(&mut self, f: F) -> Transition {
        let transition = expect_transition(|| f(self));
        if let Transition::EnterUser { context, .. } = &transition {
            self.frame = *context;
        }
        transition
    }

    pub fn start(&mut self) -> Transition {
        self.expect(|h| h.kernel.schedule(&mut h.cpu))
    }

    /// Traps with `number` from the current frame and returns `rax`.
    pub fn syscall(&mut self, number: u64, args: [u64; 6]) -> isize {
        self.load(number, args);
        self.kernel.handle_syscall(&mut self.cpu, &mut self.frame);
        self.frame.rax as isize
    }

    pub fn syscall_diverging(&mut self, number: u64, args: [u64; 6]) -> Transition {
        self.load(number, args);
        self.expect(|h| h.kernel.handle_syscall(&mut h.cpu, &mut h.frame))
    }

    fn load(&mut self, number: u64, args: [u64; 6]) {
        let f = &mut self.frame;
        f.rax = number;
        [f.rdi, f.rsi, f.rdx, f.r10, f.r8, f.r9] = args;
    }
}
