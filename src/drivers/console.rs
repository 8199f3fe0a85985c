/// Byte sink behind descriptors 1 and 2.
pub trait Console {
    fn write(&mut self, bytes: &[u8]);
}

/// Console on COM1, shared with the kernel log.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub struct SerialConsole;

#[cfg(all(target_arch = "x86_64", not(test)))]
impl Console for SerialConsole {
    fn write(&mut self, bytes: &[u8]) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            crate::serial::SERIAL1.lock().send_bytes(bytes);
        });
    }
}
