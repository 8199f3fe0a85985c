use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::process::context::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Double-fault handler stack.
const DF_STACK_SIZE: usize = 4096 * 5;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

/// Ring-0 stack for traps taken before the first thread is entered.
const BOOT_TRAP_STACK_SIZE: usize = 4096 * 4;
static mut BOOT_TRAP_STACK: [u8; BOOT_TRAP_STACK_SIZE] = [0; BOOT_TRAP_STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let stack_start = VirtAddr::from_ptr(&raw const DF_STACK);
            stack_start + DF_STACK_SIZE as u64
        };
        // Replaced with the entered thread's kernel stack on every switch.
        tss.privilege_stack_table[0] = {
            let stack_start = VirtAddr::from_ptr(&raw const BOOT_TRAP_STACK);
            (stack_start + BOOT_TRAP_STACK_SIZE as u64).align_down(16u64)
        };
        tss
    };
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (gdt, Selectors { kernel_code, kernel_data, user_code, user_data, tss })
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
    // Saved contexts carry these selectors verbatim.
    assert_eq!(u64::from(GDT.1.user_code.0), USER_CODE_SELECTOR);
    assert_eq!(u64::from(GDT.1.user_data.0), USER_DATA_SELECTOR);
    crate::log_info!(
        "GDT loaded: user cs={:#x} ss={:#x}",
        GDT.1.user_code.0,
        GDT.1.user_data.0
    );
}

/// Points RSP0 at `kernel_stack_top`, where the CPU switches when user
/// mode traps.
pub fn set_tss_rsp0(kernel_stack_top: u64) {
    unsafe {
        // Only written with interrupts off, right before entering ring 3.
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
    }
}
