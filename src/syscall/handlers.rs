//! The system calls installed at boot.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::*;
use crate::error::KResult;
use crate::kernel::ExecRequest;
use crate::memory::{copy_c_string_from_user, copy_pointer_array_from_user, Access};
use crate::process::fd::{STDERR, STDIN, STDOUT};
use crate::process::{ExitStatus, ANY_CHILD};

/// `wait` option accepted for compatibility; waiting never blocks anyway.
pub const WNOHANG: u64 = 1;

pub fn install(table: &mut SyscallTable) -> KResult<()> {
    table.register(SYS_EXIT, sys_exit)?;
    table.register(SYS_WRITE, sys_write)?;
    table.register(SYS_READ, sys_read)?;
    table.register(SYS_GETPID, sys_getpid)?;
    table.register(SYS_OPEN, sys_open)?;
    table.register(SYS_CLOSE, sys_close)?;
    table.register(SYS_FORK, sys_fork)?;
    table.register(SYS_EXEC, sys_exec)?;
    table.register(SYS_WAIT, sys_wait)?;
    table.register(SYS_BRK, sys_brk)?;
    table.register(SYS_MMAP, sys_mmap)?;
    table.register(SYS_MUNMAP, sys_munmap)?;
    table.register(SYS_GETTIMEOFDAY, sys_gettimeofday)?;
    table.register(SYS_SLEEP, sys_sleep)?;
    table.register(SYS_YIELD, sys_yield)?;
    Ok(())
}

fn ret(result: KResult<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(err) => err.to_syscall_ret(),
    }
}

fn sys_exit(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
    let status = ExitStatus { code: args.arg(0) as i32, signal: 0 };
    ctx.kernel.process_exit(ctx.cpu, ctx.pid, status)
}

fn sys_write(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
    ret(write(ctx, args.arg(0), args.arg(1), args.arg(2) as usize))
}

fn write(ctx: &mut SyscallContext<'_>, fd: u64, buf: u64, count: usize) -> KResult<usize> {
    let fd = fd as usize;
    if fd != STDOUT && fd != STDERR {
        return Err(KernelError::BadFileDescriptor);
    }
    let file = ctx.process()?.fds.get(fd).cloned().ok_or(KernelError::BadFileDescriptor)?;
    if !file.lock().writable {
        return Err(KernelError::BadFileDescriptor);
    }
    if count == 0 {
        return Err(KernelError::InvalidArgument);
    }

    let kernel = &mut *ctx.kernel;
    let space = kernel
        .table
        .get(ctx.pid)
        .and_then(|p| p.space.as_deref())
        .ok_or(KernelError::Fault)?;
    if !space.validate_user_pointer(buf, count, Access::Read) {
        return Err(KernelError::Fault);
    }

    // The console only ever sees this kernel copy.
    let mut chunk = vec![0u8; kernel.config.io_chunk.min(count)];
    let mut done = 0;
    while done < count {
        let n = (count - done).min(chunk.len());
        space.copy_from_user(&mut chunk[..n], buf + done as u64)?;
        kernel.console.write(&chunk[..n]);
        done += n;
    }
    file.lock().transferred += done as u64;
    Ok(done)
}

fn sys_read(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
    ret(read(ctx, args.arg(0), args.arg(1), args.arg(2) as usize))
}

fn read(ctx: &mut SyscallContext<'_>, fd: u64, buf: u64, count: usize) -> KResult<usize> {
    if fd as usize != STDIN {
        return Err(KernelError::BadFileDescriptor);
    }
    let file = ctx.process()?.fds.get(STDIN).cloned().ok_or(KernelError::BadFileDescriptor)?;
    if !file.lock().readable {
        return Err(KernelError::BadFileDescriptor);
    }
    if count == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let valid = ctx
        .process()?
        .space
        .as_deref()
        .is_some_and(|s| s.validate_user_pointer(buf, count, Access::Write));
    if !valid {
        return Err(KernelError::Fault);
    }

    let chunk_size = ctx.kernel.config.io_chunk.min(count);
    let mut chunk = Vec::with_capacity(chunk_size);
    let mut total = 0;
    let mut flushed = 0;
    while total < count {
        let Some(byte) = ctx.kernel.keyboard.read_char() else {
            break;
        };
        chunk.push(byte);
        total += 1;
        let newline = byte == b'\n';
        if chunk.len() == chunk_size || newline {
            flush(ctx, buf + flushed as u64, &chunk)?;
            flushed += chunk.len();
            chunk.clear();
        }
        if newline {
            break;
        }
    }
    if !chunk.is_empty() {
        flush(ctx, buf + flushed as u64, &chunk)?;
    }
    file.lock().transferred += total as u64;
    Ok(total)
}

fn flush(ctx: &mut SyscallContext<'_>, dst: u64, bytes: &[u8]) -> KResult<()> {
    let space = ctx.process_mut()?.space.as_deref_mut().ok_or(KernelError::Fault)?;
    space.copy_to_user(dst, bytes)
}

fn sys_getpid(ctx: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    ctx.pid as isize
}

fn sys_open(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    KernelError::NotImplemented.to_syscall_ret()
}

fn sys_close(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    KernelError::NotImplemented.to_syscall_ret()
}

fn sys_fork(ctx: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    let kernel = &mut *ctx.kernel;
    let child = match kernel.table.fork(ctx.pid, ctx.tid, ctx.frame) {
        Ok(child) => child,
        Err(err) => return err.to_syscall_ret(),
    };
    if let Some(main) = kernel.table.get(child).map(|p| p.main_thread) {
        kernel.run_queue.push((child, main));
    }
    child as isize
}

fn sys_exec(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
    let request = match copy_exec_request(ctx, args.arg(0), args.arg(1), args.arg(2)) {
        Ok(request) => request,
        Err(err) => return err.to_syscall_ret(),
    };
    match ctx.kernel.process_exec(ctx.cpu, ctx.pid, request) {
        Ok(never) => match never {},
        Err(err) => err.to_syscall_ret(),
    }
}

/// Copies everything exec needs out of the caller's memory.
fn copy_exec_request(
    ctx: &SyscallContext<'_>,
    path: u64,
    argv: u64,
    envp: u64,
) -> KResult<ExecRequest> {
    let config = ctx.kernel.config;
    let space = ctx.process()?.space.as_deref().ok_or(KernelError::Fault)?;
    let path = copy_c_string_from_user(space, path, config.max_path)?;
    let strings = |array: u64| -> KResult<Vec<String>> {
        copy_pointer_array_from_user(space, array, config.max_args)?
            .into_iter()
            .map(|ptr| copy_c_string_from_user(space, ptr, config.max_arg_len))
            .collect()
    };
    let args = if argv == 0 { vec![path.clone()] } else { strings(argv)? };
    let env = if envp == 0 { Vec::new() } else { strings(envp)? };
    Ok(ExecRequest { path, args, env })
}

fn sys_wait(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> isize {
    ret(wait(ctx, args.arg(0) as i64, args.arg(1), args.arg(2)))
}

fn wait(ctx: &mut SyscallContext<'_>, pid: i64, status: u64, options: u64) -> KResult<usize> {
    if options & !WNOHANG != 0 || pid < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pid = if pid == 0 { ANY_CHILD } else { pid as u64 };
    let table = &mut ctx.kernel.table;
    let child = table.find_zombie_child(ctx.pid, pid)?;
    if status != 0 {
        let code = table.get(child).and_then(|c| c.exit).map_or(0, |s| s.code);
        let space = table
            .get_mut(ctx.pid)
            .and_then(|p| p.space.as_deref_mut())
            .ok_or(KernelError::Fault)?;
        // A bad pointer fails here, before the zombie is collected.
        space.copy_to_user(status, &code.to_le_bytes())?;
    }
    let (reaped, _) = table.reap(ctx.pid, child)?;
    Ok(reaped as usize)
}

fn sys_brk(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    KernelError::NotImplemented.to_syscall_ret()
}

fn sys_mmap(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    KernelError::NotImplemented.to_syscall_ret()
}

/// Accepted and ignored.
fn sys_munmap(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    0
}

/// There is no clock source; the time is always zero.
fn sys_gettimeofday(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    0
}

fn sys_sleep(_: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    KernelError::NotImplemented.to_syscall_ret()
}

fn sys_yield(ctx: &mut SyscallContext<'_>, _: &SyscallArgs) -> isize {
    ctx.kernel.yield_current(ctx.cpu, ctx.frame)
}
