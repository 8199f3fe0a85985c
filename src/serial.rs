use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// I/O base of the first UART.
pub const COM1_BASE: u16 = 0x3F8;

/// Line status register: transmitter holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;

/// 16550 UART driven through port I/O. Console output and all kernel
/// logging go through COM1.
pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    /// # Safety
    /// `base` must be the I/O base of a 16550-compatible UART.
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    /// 38400 baud, 8N1, FIFO on, receive interrupts off (the kernel polls).
    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);
            self.line_ctrl.write(0x80);
            self.data.write(0x03);
            self.int_en.write(0x00);
            self.line_ctrl.write(0x03);
            self.fifo_ctrl.write(0xC7);
            self.modem_ctrl.write(0x0B);
        }
    }

    fn wait_for_tx_empty(&mut self) {
        unsafe {
            while (self.line_sts.read() & LSR_THR_EMPTY) == 0 {
                core::hint::spin_loop();
            }
        }
    }

    pub fn send(&mut self, byte: u8) {
        self.wait_for_tx_empty();
        unsafe {
            self.data.write(byte);
        }
    }

    /// Raw bytes, no UTF-8 requirement. Used by the console for user output.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.send_bytes(s.as_bytes());
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(COM1_BASE) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
#[cfg(not(test))]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

// Host test builds never touch port I/O.
#[doc(hidden)]
#[cfg(test)]
pub fn _print(args: ::core::fmt::Arguments) {
    std::print!("{}", args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::serial::_print(format_args!("[INFO] {}\n", format_args!($($arg)*)));
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::serial::_print(format_args!("[WARN] {}\n", format_args!($($arg)*)));
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::serial::_print(format_args!("[ERROR] {}\n", format_args!($($arg)*)));
    }};
}

/// Compiled out unless the `log_debug` feature is on.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if cfg!(feature = "log_debug") {
            $crate::serial::_print(format_args!("[DEBUG] {}\n", format_args!($($arg)*)));
        }
    }};
}

pub fn init() {
    let _ = SERIAL1.lock();
}
