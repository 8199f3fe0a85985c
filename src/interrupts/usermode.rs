//! Ring 3 entry.

use core::arch::naked_asm;

use super::gdt;
use crate::process::context::CpuContext;
use crate::sched::UserTransition;

/// Enters user mode with `iretq` and parks the CPU with `hlt`.
pub struct X86Transition;

impl UserTransition for X86Transition {
    fn enter_user(&self, ctx: &CpuContext, kernel_stack_top: u64) -> ! {
        x86_64::instructions::interrupts::disable();
        gdt::set_tss_rsp0(kernel_stack_top);
        unsafe { restore_context(ctx) }
    }

    fn idle(&self) -> ! {
        crate::log_info!("no runnable threads, halting");
        loop {
            x86_64::instructions::interrupts::enable_and_hlt();
        }
    }
}

/// Builds an interrupt frame from `ctx` on the current stack, loads every
/// general register and returns into it.
#[unsafe(naked)]
unsafe extern "C" fn restore_context(ctx: *const CpuContext) -> ! {
    naked_asm!(
        "push qword ptr [rdi + 152]", // ss
        "push qword ptr [rdi + 56]",  // rsp
        "push qword ptr [rdi + 136]", // rflags
        "push qword ptr [rdi + 144]", // cs
        "push qword ptr [rdi + 128]", // rip
        "mov rax, [rdi + 0]",
        "mov rbx, [rdi + 8]",
        "mov rcx, [rdi + 16]",
        "mov rdx, [rdi + 24]",
        "mov rsi, [rdi + 32]",
        "mov rbp, [rdi + 48]",
        "mov r8, [rdi + 64]",
        "mov r9, [rdi + 72]",
        "mov r10, [rdi + 80]",
        "mov r11, [rdi + 88]",
        "mov r12, [rdi + 96]",
        "mov r13, [rdi + 104]",
        "mov r14, [rdi + 112]",
        "mov r15, [rdi + 120]",
        "mov rdi, [rdi + 40]",
        "iretq",
    );
}
