use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::gdt;
use super::trap;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

fn stub(entry: extern "C" fn()) -> VirtAddr {
    VirtAddr::new(entry as usize as u64)
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // The stubs build their own frame and return with iretq.
        unsafe {
            idt.divide_error.set_handler_addr(stub(trap::divide_error_stub));
            idt.invalid_opcode.set_handler_addr(stub(trap::invalid_opcode_stub));
            idt.double_fault
                .set_handler_addr(stub(trap::double_fault_stub))
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.general_protection_fault
                .set_handler_addr(stub(trap::general_protection_stub));
            idt.page_fault.set_handler_addr(stub(trap::page_fault_stub));
            idt[trap::SYSCALL_VECTOR as usize]
                .set_handler_addr(stub(trap::syscall_stub))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
    // Nothing is interrupt driven: remap the PICs off the exception vectors
    // and mask every line.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0xFF, 0xFF);
    }
    crate::log_info!("IDT loaded, int {:#x} open to ring 3", trap::SYSCALL_VECTOR);
}
