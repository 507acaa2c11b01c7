use crate::kalloc;
use crate::mmap;
use crate::proc::{self, Channel, Pid, current_proc};
use crate::syscall::{SyscallArgs, SyscallError};
use crate::trap::TICKS_LOCK;
use crate::vm::VA;

pub fn sys_exit(args: &SyscallArgs) -> ! {
    let n = args.get_int(0);
    proc::exit(n);
}

pub fn sys_getpid(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.proc().inner.lock().pid;
    Ok(*pid)
}

pub fn sys_fork(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    match log!(proc::fork()) {
        Ok(pid) => Ok(*pid),
        Err(_) => Err(SyscallError::Proc("sys_fork")),
    }
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let addr = args.get_addr(0);
    match proc::wait(addr) {
        Some(pid) => Ok(*pid),
        None => err!(SyscallError::Proc("sys_wait")),
    }
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let size = args.get_int(0);
    let addr = args.proc().data().size;

    match unsafe { log!(proc::grow(size)) } {
        Ok(_) => Ok(addr),
        Err(_) => Err(SyscallError::Proc("sys_sbrk")),
    }
}

pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let duration = args.get_int(0).max(0) as usize;

    let mut ticks = TICKS_LOCK.lock();
    let ticks0 = *ticks;

    while *ticks - ticks0 < duration {
        if current_proc().is_killed() {
            return Err(SyscallError::Proc("sys_sleep"));
        }

        ticks = proc::sleep(Channel::Ticks, ticks);
    }

    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;

    Ok(proc::kill(unsafe { Pid::from_usize(pid) }) as usize)
}

pub fn sys_uptime(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    let ticks = *TICKS_LOCK.lock();
    Ok(ticks)
}

pub fn sys_getnice(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;
    match proc::get_nice(unsafe { Pid::from_usize(pid) }) {
        Some(nice) => Ok(nice as usize),
        None => err!(SyscallError::Proc("sys_getnice")),
    }
}

pub fn sys_setnice(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;
    let nice = args.get_int(1).max(0) as u32;

    if proc::set_nice(unsafe { Pid::from_usize(pid) }, nice) {
        Ok(0)
    } else {
        err!(SyscallError::Proc("sys_setnice"));
    }
}

pub fn sys_getpname(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;

    match proc::get_name(unsafe { Pid::from_usize(pid) }) {
        Some(name) => {
            println!("{}", name);
            Ok(0)
        }
        None => err!(SyscallError::Proc("sys_getpname")),
    }
}

pub fn sys_ps(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let pid = args.get_int(0).max(0) as usize;
    let target = if pid == 0 {
        None
    } else {
        Some(unsafe { Pid::from_usize(pid) })
    };

    proc::print_ps(target);
    Ok(0)
}

pub fn sys_mmap(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let addr = args.get_int(0).max(0) as usize;
    let length = args.get_int(1).max(0) as usize;
    let prot = args.get_int(2).max(0) as u32;
    let flags = args.get_int(3).max(0) as u32;
    let fd = args.get_int(4);
    let offset = args.get_int(5).max(0) as usize;

    let file = if fd < 0 {
        None
    } else {
        Some(try_log!(args.get_file(fd as usize)).1)
    };

    log!(mmap::mmap(addr, length, prot, flags, file, offset).map_err(SyscallError::from))
        .map(|va| va.as_usize())
}

pub fn sys_munmap(args: &SyscallArgs) -> Result<usize, SyscallError> {
    let addr = args.get_int(0).max(0) as usize;
    log!(mmap::munmap(VA::from(addr)).map_err(SyscallError::from)).map(|_| 0)
}

pub fn sys_freemem(_args: &SyscallArgs) -> Result<usize, SyscallError> {
    Ok(kalloc::free_pages())
}
