//! Descriptor tables, trap entry and the ring 3 transition.

pub mod gdt;
pub mod idt;
pub mod trap;
pub mod usermode;

pub fn init() {
    gdt::init();
    idt::init();
}
