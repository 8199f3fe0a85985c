/// User code selector (GDT index 4, RPL 3).
pub const USER_CODE_SELECTOR: u64 = 0x23;
/// User data/stack selector (GDT index 3, RPL 3).
pub const USER_DATA_SELECTOR: u64 = 0x1B;

/// IF set, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

/// Saved register state of a thread.
///
/// The field order is fixed: the trap entry stubs store registers at these
/// offsets and the ring transition reloads them from the same layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

pub const CPU_CONTEXT_SIZE: usize = 20 * 8;

impl CpuContext {
    /// Fresh ring-3 context starting at `entry` with `rsp = stack_top`.
    pub fn for_user(entry: u64, stack_top: u64) -> CpuContext {
        CpuContext {
            rip: entry,
            rsp: stack_top,
            rflags: USER_RFLAGS,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            ..CpuContext::default()
        }
    }

    pub fn is_user_mode(&self) -> bool {
        self.cs & 3 == 3 && self.ss & 3 == 3
    }

    /// Syscall number register.
    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    /// Syscall argument registers in ABI order.
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn set_return(&mut self, value: isize) {
        self.rax = value as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<CpuContext>(), CPU_CONTEXT_SIZE);

    #[test]
    fn test_layout_matches_trap_stub_offsets() {
        assert_eq!(offset_of!(CpuContext, rax), 0);
        assert_eq!(offset_of!(CpuContext, rsp), 56);
        assert_eq!(offset_of!(CpuContext, r8), 64);
        assert_eq!(offset_of!(CpuContext, r15), 120);
        assert_eq!(offset_of!(CpuContext, rip), 128);
        assert_eq!(offset_of!(CpuContext, rflags), 136);
        assert_eq!(offset_of!(CpuContext, cs), 144);
        assert_eq!(offset_of!(CpuContext, ss), 152);
    }

    #[test]
    fn test_user_context_selectors() {
        let ctx = CpuContext::for_user(0x40_0000, 0x7FFF_FFFF_F000);
        assert!(ctx.is_user_mode());
        assert_eq!(ctx.rip, 0x40_0000);
        assert_eq!(ctx.rflags & 0x200, 0x200);
        assert!(!CpuContext::default().is_user_mode());
    }

    #[test]
    fn test_negative_return_sign_extends() {
        let mut ctx = CpuContext::default();
        ctx.set_return(-14);
        assert_eq!(ctx.rax as i64, -14);
    }
}
