use core::fmt;

/// Failure kinds shared by the loader, the process table and the syscalls.
///
/// Syscalls report these to user space as a negative errno in the return
/// register; see [`KernelError::to_syscall_ret`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Image, process, thread or descriptor not located.
    NotFound,
    /// `wait` found no zombie matching the request.
    NoSuchChild,
    /// A table is full or a frame/heap allocation failed.
    OutOfResources,
    InvalidArgument,
    BadFileDescriptor,
    /// User pointer outside the caller's mapped, permitted range.
    Fault,
    NotImplemented,
    /// Image present but not a loadable flat binary.
    BadExecutable,
    /// A syscall trapped while no process was current on the CPU.
    NoCurrentProcess,
}

pub const ENOENT: i32 = 2;
pub const ESRCH: i32 = 3;
pub const ENOEXEC: i32 = 8;
pub const EBADF: i32 = 9;
pub const ECHILD: i32 = 10;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const ENOSYS: i32 = 38;

impl KernelError {
    pub const fn errno(self) -> i32 {
        match self {
            KernelError::NotFound => ENOENT,
            KernelError::NoSuchChild => ECHILD,
            KernelError::OutOfResources => ENOMEM,
            KernelError::InvalidArgument => EINVAL,
            KernelError::BadFileDescriptor => EBADF,
            KernelError::Fault => EFAULT,
            KernelError::NotImplemented => ENOSYS,
            KernelError::BadExecutable => ENOEXEC,
            KernelError::NoCurrentProcess => ESRCH,
        }
    }

    /// Single-channel POSIX-style return: `-errno`.
    pub const fn to_syscall_ret(self) -> isize {
        -(self.errno() as isize)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::NotFound => write!(f, "No such file, process or descriptor"),
            KernelError::NoSuchChild => write!(f, "No child processes ready to reap"),
            KernelError::OutOfResources => write!(f, "Out of resources"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::BadFileDescriptor => write!(f, "Bad file descriptor"),
            KernelError::Fault => write!(f, "Bad address"),
            KernelError::NotImplemented => write!(f, "Function not implemented"),
            KernelError::BadExecutable => write!(f, "Exec format error"),
            KernelError::NoCurrentProcess => write!(f, "No current process"),
        }
    }
}

pub type KResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_ret_is_negative_errno() {
        assert_eq!(KernelError::Fault.to_syscall_ret(), -14);
        assert_eq!(KernelError::NotImplemented.to_syscall_ret(), -38);
        assert_eq!(KernelError::NoSuchChild.to_syscall_ret(), -10);
        assert_eq!(KernelError::BadFileDescriptor.to_syscall_ret(), -9);
    }

    #[test]
    fn test_every_kind_maps_to_distinct_errno() {
        let kinds = [
            KernelError::NotFound,
            KernelError::NoSuchChild,
            KernelError::OutOfResources,
            KernelError::InvalidArgument,
            KernelError::BadFileDescriptor,
            KernelError::Fault,
            KernelError::NotImplemented,
            KernelError::BadExecutable,
            KernelError::NoCurrentProcess,
        ];
        for (i, a) in kinds.iter().enumerate() {
            assert!(a.errno() > 0);
            for b in &kinds[i + 1..] {
                assert_ne!(a.errno(), b.errno(), "{} / {}", a, b);
            }
        }
    }
}
