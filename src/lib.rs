#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod config;
pub mod error;
pub mod memory;
pub mod loader;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod kernel;
pub mod drivers;

#[cfg(all(target_arch = "x86_64", not(test)))]
pub mod interrupts;

#[cfg(test)]
mod testing;

#[cfg(all(target_arch = "x86_64", not(test)))]
mod boot {
    use alloc::boxed::Box;
    use core::panic::PanicInfo;

    use crate::config::KernelConfig;
    use crate::drivers::console::SerialConsole;
    use crate::drivers::keyboard::Ps2Keyboard;
    use crate::interrupts::{self, trap, usermode::X86Transition};
    use crate::kernel::{Kernel, Platform};
    use crate::loader::ramdisk::RamDisk;
    use crate::memory::{frame_allocator::FRAME_ALLOCATOR, heap, paging::PagingVm};
    use crate::{log_error, log_info};

    /// Entered from the multiboot2 trampoline with the boot information
    /// address in `rdi`, interrupts off and the low 1 GiB identity mapped.
    #[no_mangle]
    pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
        crate::serial::init();
        log_info!("RaeenOS booting");
        interrupts::init();

        unsafe { heap::init() };
        if let Err(err) = unsafe { FRAME_ALLOCATOR.lock().init(multiboot_info_addr) } {
            halt_with(format_args!("no usable memory: {}", err));
        }
        crate::memory::paging::init();

        let platform = Platform {
            images: Box::new(RamDisk::builtin()),
            vm: Box::new(PagingVm),
            console: Box::new(SerialConsole),
            keyboard: Box::new(unsafe { Ps2Keyboard::new() }),
            transition: Box::new(X86Transition),
        };
        let kernel = match Kernel::new(KernelConfig::default(), platform) {
            Ok(kernel) => kernel,
            Err(err) => halt_with(format_args!("kernel setup failed: {}", err)),
        };
        let (kernel, cpu) = unsafe { trap::install(kernel) };

        if let Err(err) = kernel.spawn("init", &["init"]) {
            halt_with(format_args!("cannot start init: {}", err));
        }
        log_info!(
            "RaeenOS up: {} frames in use, {} heap bytes",
            FRAME_ALLOCATOR.lock().frames_in_use(),
            heap::used()
        );
        kernel.schedule(cpu)
    }

    fn halt_with(reason: core::fmt::Arguments) -> ! {
        log_error!("{}", reason);
        halt()
    }

    fn halt() -> ! {
        loop {
            x86_64::instructions::interrupts::disable();
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        log_error!("{}", info);
        halt()
    }
}
