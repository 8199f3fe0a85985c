//! Flat binary loading and the user-space layout.
//!
//! ```text
//!   USER_CODE_BASE   code   (R X)
//!   next page        data   (R W, or R with FlatFlags::READ_ONLY)
//!   next page        bss    (R W, zeroed)
//!   next page        heap   (empty)
//!        ...
//!   USER_STACK_TOP - n pages   stack (R W, zeroed), grows down
//! ```

pub mod flat;
pub mod ramdisk;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::log_warn;
use crate::memory::{
    pages_for, AddressSpace, PageFlags, VmProvider, PAGE_SIZE, USER_CODE_BASE, USER_STACK_TOP,
};
use crate::process::context::CpuContext;
use crate::process::thread::{ThreadState, Tid};
use crate::process::{MemoryRegions, Process, Region};
use crate::sched::UserTransition;
use flat::{FlatFlags, FlatImage};
use ramdisk::ImageSource;

// ══════════════════════════════════════════════════════════════
//  LoadError
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    NotFound,
    BadMagic,
    Truncated,
    TooLarge,
    NotExecutable,
    BadEntry,
    MapFailed,
    NoAddressSpace,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::NotFound       => write!(f, "Image not found"),
            LoadError::BadMagic       => write!(f, "Invalid flat binary magic"),
            LoadError::Truncated      => write!(f, "Image shorter than its header claims"),
            LoadError::TooLarge       => write!(f, "Image exceeds the user address budget"),
            LoadError::NotExecutable  => write!(f, "Image not marked executable"),
            LoadError::BadEntry       => write!(f, "Entry point outside the code section"),
            LoadError::MapFailed      => write!(f, "Page mapping failed"),
            LoadError::NoAddressSpace => write!(f, "Could not create address space"),
        }
    }
}

impl From<LoadError> for KernelError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound => KernelError::NotFound,
            LoadError::BadMagic
            | LoadError::Truncated
            | LoadError::NotExecutable
            | LoadError::BadEntry => KernelError::BadExecutable,
            LoadError::TooLarge | LoadError::MapFailed | LoadError::NoAddressSpace => {
                KernelError::OutOfResources
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  Page mapping with rollback
// ══════════════════════════════════════════════════════════════

/// Unmaps every mapped page in `[start, end)`.
pub fn unmap_range(space: &mut dyn AddressSpace, start: u64, end: u64) {
    let mut page = start;
    while page < end {
        let _ = space.unmap_page(page);
        page += PAGE_SIZE as u64;
    }
}

/// Maps `pages` pages from `base`, filled from `contents` then zeroes.
/// On failure the pages mapped so far are unmapped again.
fn map_region(
    space: &mut dyn AddressSpace,
    base: u64,
    contents: &[u8],
    pages: usize,
    flags: PageFlags,
) -> Result<(), LoadError> {
    for i in 0..pages {
        let vaddr = base + (i * PAGE_SIZE) as u64;
        let start = (i * PAGE_SIZE).min(contents.len());
        let end = ((i + 1) * PAGE_SIZE).min(contents.len());
        if let Err(err) = space.map_page(vaddr, flags, &contents[start..end]) {
            log_warn!("loader: mapping {:#x} failed ({}), unwinding {} pages", vaddr, err, i);
            unmap_range(space, base, vaddr);
            return Err(LoadError::MapFailed);
        }
    }
    Ok(())
}

/// Maps a zeroed stack of `size` bytes (rounded up to whole pages) just
/// below `top` and returns `top`.
pub fn map_stack(space: &mut dyn AddressSpace, top: u64, size: usize) -> Result<u64, LoadError> {
    let pages = pages_for(size).max(1);
    let bottom = top
        .checked_sub((pages * PAGE_SIZE) as u64)
        .ok_or(LoadError::TooLarge)?;
    map_region(space, bottom, &[], pages, PageFlags::USER_DATA)?;
    Ok(top)
}

/// Main user stack: `ceil(size / PAGE_SIZE)` zeroed pages ending at
/// [`USER_STACK_TOP`]. Returns the initial stack pointer.
pub fn map_user_stack(
    space: &mut dyn AddressSpace,
    config: &KernelConfig,
    size: usize,
) -> Result<u64, LoadError> {
    if size > config.max_user_stack {
        return Err(LoadError::TooLarge);
    }
    map_stack(space, USER_STACK_TOP, size)
}

// ══════════════════════════════════════════════════════════════
//  Address space construction
// ══════════════════════════════════════════════════════════════

/// A fully built address space not yet attached to any process.
pub struct LoadedImage {
    pub space: Box<dyn AddressSpace>,
    pub entry: u64,
    pub regions: MemoryRegions,
    /// Initial register state of the main thread.
    pub context: CpuContext,
}

struct Segment<'a> {
    base: u64,
    contents: &'a [u8],
    pages: usize,
    flags: PageFlags,
}

impl Segment<'_> {
    fn end(&self) -> u64 {
        self.base + (self.pages * PAGE_SIZE) as u64
    }
}

/// Validates `bytes` and maps it into a fresh address space. Nothing is
/// created when validation fails; a mapping failure unmaps everything and
/// drops the space.
pub fn prepare_image(
    vm: &dyn VmProvider,
    config: &KernelConfig,
    bytes: &[u8],
) -> Result<LoadedImage, LoadError> {
    let image = FlatImage::parse(bytes, config)?;
    let header = image.header;
    let stack_size = header.stack_bytes(config);

    let data_flags = if header.flags.contains(FlatFlags::READ_ONLY) {
        PageFlags::USER_RODATA
    } else {
        PageFlags::USER_DATA
    };
    let code = Segment {
        base: USER_CODE_BASE,
        contents: image.code,
        pages: pages_for(header.code_size as usize),
        flags: PageFlags::USER_CODE,
    };
    let data = Segment {
        base: code.end(),
        contents: image.data,
        pages: pages_for(header.data_size as usize),
        flags: data_flags,
    };
    let bss = Segment {
        base: data.end(),
        contents: &[],
        pages: pages_for(header.bss_size as usize),
        flags: PageFlags::USER_DATA,
    };
    let stack_pages = pages_for(stack_size).max(1);
    let stack = Segment {
        base: USER_STACK_TOP - (stack_pages * PAGE_SIZE) as u64,
        contents: &[],
        pages: stack_pages,
        flags: PageFlags::USER_DATA,
    };

    let mut space = vm.create_address_space().map_err(|err| {
        log_warn!("loader: no address space: {}", err);
        LoadError::NoAddressSpace
    })?;
    let segments = [code, data, bss, stack];
    for (i, segment) in segments.iter().enumerate() {
        if let Err(err) =
            map_region(&mut *space, segment.base, segment.contents, segment.pages, segment.flags)
        {
            for done in &segments[..i] {
                unmap_range(&mut *space, done.base, done.end());
            }
            return Err(err);
        }
    }

    let [code, data, bss, stack] = segments;
    let entry = code.base + header.entry_offset as u64;
    Ok(LoadedImage {
        space,
        entry,
        regions: MemoryRegions {
            code: Region { start: code.base, end: code.base + header.code_size as u64 },
            data: Region { start: data.base, end: data.base + header.data_size as u64 },
            bss: Region { start: bss.base, end: bss.base + header.bss_size as u64 },
            heap: Region { start: bss.end(), end: bss.end() },
            stack: Region { start: stack.base, end: USER_STACK_TOP },
        },
        context: CpuContext::for_user(entry, USER_STACK_TOP),
    })
}

impl LoadedImage {
    /// Writes argument and environment strings to the top of the stack
    /// followed by the `argc, argv[], NULL, envp[], NULL` block, and points
    /// the initial registers at it (`rsp` at argc, `rdi` = argc,
    /// `rsi` = argv, `rdx` = envp).
    pub fn push_arguments(&mut self, args: &[String], env: &[String]) -> Result<(), LoadError> {
        let floor = self.regions.stack.start;
        let mut cursor = self.regions.stack.end;
        let mut place = |space: &mut dyn AddressSpace, s: &str| -> Result<u64, LoadError> {
            let len = s.len() as u64 + 1;
            cursor = cursor.checked_sub(len).filter(|&c| c >= floor).ok_or(LoadError::TooLarge)?;
            space.copy_to_user(cursor, s.as_bytes()).map_err(|_| LoadError::MapFailed)?;
            space.copy_to_user(cursor + s.len() as u64, &[0]).map_err(|_| LoadError::MapFailed)?;
            Ok(cursor)
        };

        let mut env_ptrs = Vec::with_capacity(env.len());
        for s in env {
            env_ptrs.push(place(&mut *self.space, s)?);
        }
        let mut arg_ptrs = Vec::with_capacity(args.len());
        for s in args {
            arg_ptrs.push(place(&mut *self.space, s)?);
        }

        let mut block: Vec<u64> = Vec::with_capacity(args.len() + env.len() + 3);
        block.push(args.len() as u64);
        block.extend_from_slice(&arg_ptrs);
        block.push(0);
        block.extend_from_slice(&env_ptrs);
        block.push(0);

        let block_bytes = (block.len() * 8) as u64;
        let rsp = cursor
            .checked_sub(block_bytes)
            .map(|c| c & !0xF)
            .filter(|&c| c >= floor)
            .ok_or(LoadError::TooLarge)?;
        let raw: Vec<u8> = block.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.space.copy_to_user(rsp, &raw).map_err(|_| LoadError::MapFailed)?;

        self.context.rsp = rsp;
        self.context.rdi = args.len() as u64;
        self.context.rsi = rsp + 8;
        self.context.rdx = rsp + 8 * (args.len() as u64 + 2);
        Ok(())
    }

    /// Makes this image the process's memory and main-thread state. Any
    /// previous address space is dropped.
    pub fn attach(self, process: &mut Process) {
        process.space = Some(self.space);
        process.regions = self.regions;
        process.entry = self.entry;
        if let Some(main) = process.main_mut() {
            main.entry = self.entry;
            main.context = self.context;
            main.state = ThreadState::Ready;
        }
    }
}

/// Builds the process's address space from `bytes` and resolves its entry
/// point (`USER_CODE_BASE + entry_offset`). The process is untouched on
/// failure.
pub fn setup_user_address_space(
    vm: &dyn VmProvider,
    config: &KernelConfig,
    process: &mut Process,
    bytes: &[u8],
) -> Result<u64, LoadError> {
    let image = prepare_image(vm, config, bytes)?;
    let entry = image.entry;
    image.attach(process);
    Ok(entry)
}

/// Looks `name` up in `source` and loads it into `process`.
pub fn load_flat_binary(
    source: &dyn ImageSource,
    vm: &dyn VmProvider,
    config: &KernelConfig,
    name: &str,
    process: &mut Process,
) -> Result<u64, LoadError> {
    let bytes = source.read_image(name).ok_or(LoadError::NotFound)?;
    setup_user_address_space(vm, config, process, bytes)
}

/// Drops to ring 3 in thread `tid` of `process`. Every switch to user
/// mode goes through here.
pub fn jump_to_user_mode(transition: &dyn UserTransition, process: &Process, tid: Tid) -> ! {
    let Some(space) = process.space.as_deref() else {
        panic!("process {} has no address space to enter", process.pid);
    };
    let Some(thread) = process.thread(tid) else {
        panic!("process {} has no thread {}", process.pid, tid);
    };
    if !thread.context.is_user_mode() {
        panic!("thread {} context is not a ring-3 context", tid);
    }
    space.activate();
    transition.enter_user(&thread.context, thread.kernel_stack.top())
}
