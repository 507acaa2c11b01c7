use core::fmt::Display;

use crate::exec::ExecError;
use crate::fs::FsError;
use crate::syscall::SyscallError;
use crate::virtio_disk::VirtioError;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Alloc,
    InvalidArgument,
    InvalidAddress,
    InvalidPage,
    InvalidPte,
    OutOfProc,
    Syscall(SyscallError),
    Fs(FsError),
    Exec(ExecError),
    VirtioError(VirtioError),
    Mmap(MmapError),
}

/// Errors specific to the demand-paged mapping subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    /// No free slot in the mapping table.
    OutOfArea,
    /// Requested range overlaps an existing mapping or falls outside `MMAPBASE`'s window.
    BadRange,
    /// `offset` or `length` wasn't page-aligned.
    Unaligned,
    /// Fault address doesn't fall inside any live mapping.
    NoSuchMapping,
    /// A write fault hit a mapping without `PROT_WRITE`.
    ProtectionViolation,
    /// Populating a page failed partway through and the mapping was rolled back.
    Populate,
}

impl Display for MmapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MmapError::OutOfArea => write!(f, "out of mmap areas"),
            MmapError::BadRange => write!(f, "bad mmap range"),
            MmapError::Unaligned => write!(f, "unaligned mmap offset or length"),
            MmapError::NoSuchMapping => write!(f, "no mapping at fault address"),
            MmapError::ProtectionViolation => write!(f, "mapping protection violation"),
            MmapError::Populate => write!(f, "failed to populate mapping"),
        }
    }
}

impl From<core::alloc::AllocError> for KernelError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::Alloc
    }
}

impl From<MmapError> for KernelError {
    fn from(value: MmapError) -> Self {
        Self::Mmap(value)
    }
}

impl From<MmapError> for SyscallError {
    fn from(value: MmapError) -> Self {
        match value {
            MmapError::OutOfArea => SyscallError::Mmap,
            MmapError::BadRange => SyscallError::Mmap,
            MmapError::Unaligned => SyscallError::Mmap,
            MmapError::NoSuchMapping => SyscallError::Mmap,
            MmapError::ProtectionViolation => SyscallError::Mmap,
            MmapError::Populate => SyscallError::Mmap,
        }
    }
}

impl From<SyscallError> for KernelError {
    fn from(value: SyscallError) -> Self {
        Self::Syscall(value)
    }
}

impl From<FsError> for KernelError {
    fn from(value: FsError) -> Self {
        Self::Fs(value)
    }
}

impl From<ExecError> for KernelError {
    fn from(value: ExecError) -> Self {
        Self::Exec(value)
    }
}

impl From<VirtioError> for KernelError {
    fn from(value: VirtioError) -> Self {
        Self::VirtioError(value)
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::Alloc => write!(f, "alloc error"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::InvalidAddress => write!(f, "invalid address"),
            KernelError::InvalidPage => write!(f, "invalid page"),
            KernelError::InvalidPte => write!(f, "invalid page table entry"),
            KernelError::OutOfProc => write!(f, "out of proc"),
            KernelError::Syscall(e) => write!(f, "syscall error: {}", e),
            KernelError::Fs(e) => write!(f, "filesystem error {}", e),
            KernelError::Exec(e) => write!(f, "exec error {}", e),
            KernelError::VirtioError(e) => write!(f, "virtio error {}", e),
            KernelError::Mmap(e) => write!(f, "mmap error: {}", e),
        }
    }
}

/// Return an error, logging file:line. Use instead of `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        #[cfg(debug_assertions)]
        {
            let _lock = $crate::proc::lock_current_cpu();
            #[allow(unused_unsafe)]
            let cpu_id = unsafe { $crate::proc::current_id() };
            $crate::println!(
                "! hart {} errored at {}:{}: {}",
                cpu_id,
                file!(),
                line!(),
                $e
            );
        }
        return Err($e.into());
    }};
}

/// Log error.
#[macro_export]
macro_rules! log {
    ($e:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                Err(e)
            }
        }
    };
}

/// Propagate error with location logging. Use instead of `?`.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}
