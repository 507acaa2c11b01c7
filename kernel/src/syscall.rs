use core::fmt::Display;

use alloc::string::String;

use crate::file::File;
use crate::fs::FsError;
use crate::param::NOFILE;
use crate::proc::{Proc, TrapFrame, current_proc, current_proc_and_data_mut};
use crate::sysfile::*;
use crate::sysproc::*;
use crate::vm::VA;

/// Syscall error codes returned to user space.
///
/// Kernel encodes `-(error_code as isize)` in the return register (`a0`); user space
/// only checks for `usize::MAX`-range failure and doesn't decode the code, so the
/// numeric values just need to be distinct and nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    NotPermitted,
    NoEntry,
    NoProcess,
    Interrupted,
    IoError,
    InvalidExecutable,
    BadDescriptor,
    NoChildren,
    ResourceUnavailable,
    OutOfMemory,
    BadAddress,
    AlreadyExists,
    CrossDeviceLink,
    NotDirectory,
    IsDirectory,
    InvalidArgument,
    FileTableFull,
    TooManyFiles,
    NoSpace,
    TooManyLinks,
    BrokenPipe,
    NameTooLong,
    NotImplemented,
    NotEmpty,
    Console,
    FetchArgument,
    File(&'static str),
    Proc(&'static str),
    Mmap,
    Read,
    Write,
}

impl SyscallError {
    /// Returns the error code encoded into `a0` on failure.
    pub fn as_code(self) -> u16 {
        match self {
            SyscallError::NotPermitted => 1,
            SyscallError::NoEntry => 2,
            SyscallError::NoProcess => 3,
            SyscallError::Interrupted => 4,
            SyscallError::IoError => 5,
            SyscallError::InvalidExecutable => 8,
            SyscallError::BadDescriptor => 9,
            SyscallError::NoChildren => 10,
            SyscallError::ResourceUnavailable => 11,
            SyscallError::OutOfMemory => 12,
            SyscallError::BadAddress => 14,
            SyscallError::AlreadyExists => 17,
            SyscallError::CrossDeviceLink => 18,
            SyscallError::NotDirectory => 20,
            SyscallError::IsDirectory => 21,
            SyscallError::InvalidArgument => 22,
            SyscallError::FileTableFull => 23,
            SyscallError::TooManyFiles => 24,
            SyscallError::NoSpace => 28,
            SyscallError::TooManyLinks => 31,
            SyscallError::BrokenPipe => 32,
            SyscallError::NameTooLong => 36,
            SyscallError::NotImplemented => 38,
            SyscallError::NotEmpty => 39,
            SyscallError::Console => 5,
            SyscallError::FetchArgument => 14,
            SyscallError::File(_) => 22,
            SyscallError::Proc(_) => 22,
            SyscallError::Mmap => 22,
            SyscallError::Read => 5,
            SyscallError::Write => 5,
        }
    }
}

impl Display for SyscallError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SyscallError::NotPermitted => write!(f, "operation not permitted"),
            SyscallError::NoEntry => write!(f, "no such file or directory"),
            SyscallError::NoProcess => write!(f, "no such process"),
            SyscallError::Interrupted => write!(f, "interrupted"),
            SyscallError::IoError => write!(f, "input/output error"),
            SyscallError::InvalidExecutable => write!(f, "exec format error"),
            SyscallError::BadDescriptor => write!(f, "bad file descriptor"),
            SyscallError::NoChildren => write!(f, "no child processes"),
            SyscallError::ResourceUnavailable => write!(f, "resource temporarily unavailable"),
            SyscallError::OutOfMemory => write!(f, "cannot allocate memory"),
            SyscallError::BadAddress => write!(f, "bad address"),
            SyscallError::AlreadyExists => write!(f, "file exists"),
            SyscallError::CrossDeviceLink => write!(f, "cross-device link"),
            SyscallError::NotDirectory => write!(f, "not a directory"),
            SyscallError::IsDirectory => write!(f, "is a directory"),
            SyscallError::InvalidArgument => write!(f, "invalid argument"),
            SyscallError::FileTableFull => write!(f, "too many open files in system"),
            SyscallError::TooManyFiles => write!(f, "too many open files"),
            SyscallError::NoSpace => write!(f, "no space left on device"),
            SyscallError::TooManyLinks => write!(f, "too many links"),
            SyscallError::BrokenPipe => write!(f, "broken pipe"),
            SyscallError::NameTooLong => write!(f, "file name too long"),
            SyscallError::NotImplemented => write!(f, "function not implemented"),
            SyscallError::NotEmpty => write!(f, "directory not empty"),
            SyscallError::Console => write!(f, "console error"),
            SyscallError::FetchArgument => write!(f, "failed to fetch argument"),
            SyscallError::File(ctx) => write!(f, "file error: {}", ctx),
            SyscallError::Proc(ctx) => write!(f, "proc error: {}", ctx),
            SyscallError::Mmap => write!(f, "mmap error"),
            SyscallError::Read => write!(f, "read error"),
            SyscallError::Write => write!(f, "write error"),
        }
    }
}

impl From<FsError> for SyscallError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::OutOfBlock | FsError::OutOfInode => SyscallError::NoSpace,
            FsError::OutOfFile | FsError::OutOfPipe => SyscallError::FileTableFull,
            FsError::OutOfRange => SyscallError::InvalidArgument,
            FsError::Read | FsError::Write => SyscallError::IoError,
            FsError::Create => SyscallError::NoSpace,
            FsError::Link => SyscallError::AlreadyExists,
            FsError::Resolve => SyscallError::NoEntry,
            FsError::Type => SyscallError::InvalidArgument,
            FsError::Copy => SyscallError::BadAddress,
        }
    }
}

/// Wrapper for extracting typed syscall arguments from trapframe.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    /// Creates a new SyscallArgs
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &Proc {
        self.proc
    }

    /// Returns the argument at the given index as a usize.
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.a0,
            1 => self.trapframe.a1,
            2 => self.trapframe.a2,
            3 => self.trapframe.a3,
            4 => self.trapframe.a4,
            5 => self.trapframe.a5,
            _ => panic!("invalid syscall argument index {}", index),
        }
    }

    /// Returns the argument at the given index as an isize.
    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// Returns the argument at the given index as a virtual address.
    ///
    /// Does not check for legality, since `copyin`/`copyout` will do that.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// Fetch the nth word-sized system call argument as a file descriptor and return both the
    /// descriptor and the corresponding `File`.
    pub fn get_file(&self, index: usize) -> Result<(usize, File), SyscallError> {
        let fd: usize = try_log!(
            self.get_int(index)
                .try_into()
                .or(Err(SyscallError::BadDescriptor))
        );

        if fd >= NOFILE {
            err!(SyscallError::BadDescriptor);
        }

        if let Some(file) = &current_proc().data().open_files[fd] {
            return Ok((fd, file.clone()));
        }

        err!(SyscallError::BadDescriptor);
    }

    /// Fetches a null-terminated string from user space.
    pub fn fetch_string(&self, addr: VA, max: usize) -> Result<String, SyscallError> {
        let (_proc, data) = current_proc_and_data_mut();

        let mut result = String::with_capacity(max);

        let mut buf = [0u8; 1];
        for i in 0..max {
            try_log!(
                data.pagetable_mut()
                    .copy_from(VA::from(addr.as_usize() + i), &mut buf)
                    .map_err(|_| SyscallError::BadAddress)
            );

            if buf[0] == 0 {
                return Ok(result);
            }

            result.push(buf[0] as char);
        }

        Ok(result)
    }
}

/// System call numbers
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
    GetNice = 22,
    SetNice = 23,
    GetPName = 24,
    Ps = 25,
    Mmap = 26,
    Munmap = 27,
    Freemem = 28,
}

impl TryFrom<usize> for Syscall {
    type Error = SyscallError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            4 => Ok(Syscall::Pipe),
            5 => Ok(Syscall::Read),
            6 => Ok(Syscall::Kill),
            7 => Ok(Syscall::Exec),
            8 => Ok(Syscall::Fstat),
            9 => Ok(Syscall::Chdir),
            10 => Ok(Syscall::Dup),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            15 => Ok(Syscall::Open),
            16 => Ok(Syscall::Write),
            17 => Ok(Syscall::Mknod),
            18 => Ok(Syscall::Unlink),
            19 => Ok(Syscall::Link),
            20 => Ok(Syscall::Mkdir),
            21 => Ok(Syscall::Close),
            22 => Ok(Syscall::GetNice),
            23 => Ok(Syscall::SetNice),
            24 => Ok(Syscall::GetPName),
            25 => Ok(Syscall::Ps),
            26 => Ok(Syscall::Mmap),
            27 => Ok(Syscall::Munmap),
            28 => Ok(Syscall::Freemem),
            _ => Err(SyscallError::NotImplemented),
        }
    }
}

/// Handle a system call.
///
/// # Safety
/// Called from `usertrap` in `trap.rs`.
#[unsafe(no_mangle)]
pub unsafe fn syscall(trapframe: &mut TrapFrame) {
    let proc = current_proc();
    let args = SyscallArgs::new(trapframe, proc);

    // #[cfg(debug_assertions)]
    // println!(
    //     "syscall {} called from proc {} ({})",
    //     trapframe.a7,
    //     *proc.inner.lock().pid,
    //     proc.data().name,
    // );

    let result = match Syscall::try_from(trapframe.a7) {
        Ok(syscall) => match syscall {
            Syscall::Fork => sys_fork(&args),
            Syscall::Exit => sys_exit(&args),
            Syscall::Wait => sys_wait(&args),
            Syscall::Pipe => sys_pipe(&args),
            Syscall::Read => sys_read(&args),
            Syscall::Kill => sys_kill(&args),
            Syscall::Exec => sys_exec(&args),
            Syscall::Fstat => sys_fstat(&args),
            Syscall::Chdir => sys_chdir(&args),
            Syscall::Dup => sys_dup(&args),
            Syscall::Getpid => sys_getpid(&args),
            Syscall::Sbrk => sys_sbrk(&args),
            Syscall::Sleep => sys_sleep(&args),
            Syscall::Uptime => sys_uptime(&args),
            Syscall::Open => sys_open(&args),
            Syscall::Write => sys_write(&args),
            Syscall::Mknod => sys_mknod(&args),
            Syscall::Unlink => sys_unlink(&args),
            Syscall::Link => sys_link(&args),
            Syscall::Mkdir => sys_mkdir(&args),
            Syscall::Close => sys_close(&args),
            Syscall::GetNice => sys_getnice(&args),
            Syscall::SetNice => sys_setnice(&args),
            Syscall::GetPName => sys_getpname(&args),
            Syscall::Ps => sys_ps(&args),
            Syscall::Mmap => sys_mmap(&args),
            Syscall::Munmap => sys_munmap(&args),
            Syscall::Freemem => sys_freemem(&args),
        },
        Err(e) => Err(e),
    };

    trapframe.a0 = match log!(result) {
        Ok(v) => v,
        Err(error) => {
            #[cfg(debug_assertions)]
            println!(
                "! syscall error ({}) from proc {} ({})",
                error,
                *proc.inner.lock().pid,
                proc.data().name,
            );
            (-(error.as_code() as isize)) as usize
        }
    };

    // #[cfg(debug_assertions)]
    // println!("syscall {} -> {}", trapframe.a7, trapframe.a0);
}
