pub mod console;
pub mod keyboard;

pub use console::Console;
pub use keyboard::Keyboard;
