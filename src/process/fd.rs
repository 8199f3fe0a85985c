use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KResult, KernelError};

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;
pub const STDERR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Keyboard input.
    ConsoleIn,
    /// Serial console output.
    ConsoleOut,
}

/// An open file description. Descriptors duplicated by fork point at the
/// same description.
#[derive(Debug)]
pub struct OpenFile {
    pub kind: FileKind,
    pub readable: bool,
    pub writable: bool,
    /// Bytes moved through this description.
    pub transferred: u64,
}

impl OpenFile {
    pub fn console_in() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(OpenFile {
            kind: FileKind::ConsoleIn,
            readable: true,
            writable: false,
            transferred: 0,
        }))
    }

    pub fn console_out() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(OpenFile {
            kind: FileKind::ConsoleOut,
            readable: false,
            writable: true,
            transferred: 0,
        }))
    }
}

/// Per-process descriptor slots, growable up to `limit`.
#[derive(Clone)]
pub struct FdTable {
    slots: Vec<Option<Arc<Mutex<OpenFile>>>>,
    limit: usize,
}

impl FdTable {
    pub fn new(limit: usize) -> FdTable {
        FdTable { slots: Vec::new(), limit }
    }

    /// stdin, stdout and stderr on the console.
    pub fn with_std_streams(limit: usize) -> KResult<FdTable> {
        let mut table = FdTable::new(limit);
        table.install(OpenFile::console_in())?;
        let out = OpenFile::console_out();
        table.install(Arc::clone(&out))?;
        table.install(out)?;
        Ok(table)
    }

    /// Lowest free descriptor.
    pub fn install(&mut self, file: Arc<Mutex<OpenFile>>) -> KResult<usize> {
        if let Some(fd) = self.slots.iter().position(Option::is_none) {
            self.slots[fd] = Some(file);
            return Ok(fd);
        }
        if self.slots.len() >= self.limit {
            return Err(KernelError::OutOfResources);
        }
        self.slots.push(Some(file));
        Ok(self.slots.len() - 1)
    }

    pub fn get(&self, fd: usize) -> Option<&Arc<Mutex<OpenFile>>> {
        self.slots.get(fd).and_then(Option::as_ref)
    }

    pub fn close(&mut self, fd: usize) -> KResult<()> {
        match self.slots.get_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    pub fn close_all(&mut self) {
        self.slots.clear();
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
