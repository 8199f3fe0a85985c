//! Trap entry stubs and the Rust-side trap handler.
//!
//! Every stub leaves the same frame: an error code (0 when the CPU pushes
//! none) and the vector on top of the CPU's interrupt frame. `trap_common`
//! spills the registers into a [`CpuContext`] below that, calls
//! [`trap_handler`] and resumes whatever the context then says.

use core::arch::naked_asm;
use core::cell::UnsafeCell;

use x86_64::registers::control::Cr2;
use x86_64::structures::idt::PageFaultErrorCode;

use crate::kernel::{Kernel, SIGFPE, SIGILL, SIGSEGV};
use crate::process::context::CpuContext;
use crate::sched::Cpu;

pub const DIVIDE_ERROR: u64 = 0;
pub const INVALID_OPCODE: u64 = 6;
pub const DOUBLE_FAULT: u64 = 8;
pub const GENERAL_PROTECTION: u64 = 13;
pub const PAGE_FAULT: u64 = 14;
pub const SYSCALL_VECTOR: u64 = 0x80;

macro_rules! trap_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
    ($name:ident, $vector:expr, error_code) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
}

trap_stub!(divide_error_stub, DIVIDE_ERROR);
trap_stub!(invalid_opcode_stub, INVALID_OPCODE);
trap_stub!(double_fault_stub, DOUBLE_FAULT, error_code);
trap_stub!(general_protection_stub, GENERAL_PROTECTION, error_code);
trap_stub!(page_fault_stub, PAGE_FAULT, error_code);
trap_stub!(syscall_stub, SYSCALL_VECTOR);

/// Stack on entry: vector, error code, then rip, cs, rflags, rsp, ss.
/// 168 bytes (the 160-byte context plus 8 of padding) keep the call
/// 16-byte aligned.
#[unsafe(naked)]
extern "C" fn trap_common() {
    naked_asm!(
        "sub rsp, 168",
        "mov [rsp + 0], rax",
        "mov [rsp + 8], rbx",
        "mov [rsp + 16], rcx",
        "mov [rsp + 24], rdx",
        "mov [rsp + 32], rsi",
        "mov [rsp + 40], rdi",
        "mov [rsp + 48], rbp",
        "mov [rsp + 64], r8",
        "mov [rsp + 72], r9",
        "mov [rsp + 80], r10",
        "mov [rsp + 88], r11",
        "mov [rsp + 96], r12",
        "mov [rsp + 104], r13",
        "mov [rsp + 112], r14",
        "mov [rsp + 120], r15",
        "mov rax, [rsp + 184]",
        "mov [rsp + 128], rax",
        "mov rax, [rsp + 192]",
        "mov [rsp + 144], rax",
        "mov rax, [rsp + 200]",
        "mov [rsp + 136], rax",
        "mov rax, [rsp + 208]",
        "mov [rsp + 56], rax",
        "mov rax, [rsp + 216]",
        "mov [rsp + 152], rax",

        "mov rdi, rsp",
        "mov rsi, [rsp + 168]",
        "mov rdx, [rsp + 176]",
        "call {handler}",

        // The handler may have rewritten the context; resume from it.
        "mov rax, [rsp + 128]",
        "mov [rsp + 184], rax",
        "mov rax, [rsp + 144]",
        "mov [rsp + 192], rax",
        "mov rax, [rsp + 136]",
        "mov [rsp + 200], rax",
        "mov rax, [rsp + 56]",
        "mov [rsp + 208], rax",
        "mov rax, [rsp + 152]",
        "mov [rsp + 216], rax",
        "mov rbx, [rsp + 8]",
        "mov rcx, [rsp + 16]",
        "mov rdx, [rsp + 24]",
        "mov rsi, [rsp + 32]",
        "mov rdi, [rsp + 40]",
        "mov rbp, [rsp + 48]",
        "mov r8, [rsp + 64]",
        "mov r9, [rsp + 72]",
        "mov r10, [rsp + 80]",
        "mov r11, [rsp + 88]",
        "mov r12, [rsp + 96]",
        "mov r13, [rsp + 104]",
        "mov r14, [rsp + 112]",
        "mov r15, [rsp + 120]",
        "mov rax, [rsp + 0]",
        "add rsp, 184",
        "iretq",
        handler = sym trap_handler,
    );
}

/// The kernel and the CPU slot of the only processor. Traps run with
/// interrupts off, so at most one trap touches it at a time; a trap that
/// leaves through the scheduler abandons its borrow along with its stack.
struct KernelCell(UnsafeCell<Option<(Kernel, Cpu)>>);

unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(None));

/// Publishes the booted kernel to the trap path.
///
/// # Safety
/// Call once, before the first entry to user mode.
pub unsafe fn install(kernel: Kernel) -> (&'static mut Kernel, &'static mut Cpu) {
    let slot = &mut *KERNEL.0.get();
    let (kernel, cpu) = slot.insert((kernel, Cpu::new(0)));
    (kernel, cpu)
}

extern "C" fn trap_handler(ctx: &mut CpuContext, vector: u64, error_code: u64) {
    let from_user = ctx.is_user_mode();
    let Some((kernel, cpu)) = (unsafe { &mut *KERNEL.0.get() }).as_mut() else {
        panic!("trap {} at {:#x} before the kernel was installed", vector, ctx.rip);
    };

    match vector {
        SYSCALL_VECTOR => kernel.handle_syscall(cpu, ctx),
        PAGE_FAULT => {
            let addr = Cr2::read().as_u64();
            let code = PageFaultErrorCode::from_bits_truncate(error_code);
            kernel.handle_page_fault(
                cpu,
                addr,
                code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
                code.contains(PageFaultErrorCode::PROTECTION_VIOLATION),
                from_user,
            );
        }
        DIVIDE_ERROR if from_user => kernel.kill_current(cpu, SIGFPE),
        INVALID_OPCODE if from_user => kernel.kill_current(cpu, SIGILL),
        GENERAL_PROTECTION if from_user => kernel.kill_current(cpu, SIGSEGV),
        DOUBLE_FAULT => panic!("EXCEPTION: DOUBLE FAULT\n{:#x?}", ctx),
        _ => panic!(
            "EXCEPTION {} in kernel mode at {:#x}, error code {:#x}",
            vector, ctx.rip, error_code
        ),
    }
}
