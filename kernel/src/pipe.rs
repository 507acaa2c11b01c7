use alloc::sync::Arc;

use crate::file::{FILE_TABLE, File, FileType};
use crate::fs::FsError;
use crate::proc::{self, Channel, current_proc_and_data_mut};
use crate::spinlock::SpinLock;
use crate::syscall::SyscallError;
use crate::vm::VA;

/// Bytes buffered between a pipe's read and write end before a writer blocks.
const PIPE_CAPACITY: usize = 512;

/// State shared by a pipe's read and write descriptors, protected by a single spinlock.
#[derive(Debug)]
pub struct PipeInner {
    buf: [u8; PIPE_CAPACITY],
    read_count: usize,
    write_count: usize,
    read_open: bool,
    write_open: bool,
}

/// An in-kernel FIFO byte pipe, referenced by both ends' `File` handles through an `Arc`.
#[derive(Debug)]
pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl Pipe {
    /// Allocates a pipe and a (read, write) pair of file descriptors for it.
    pub fn alloc() -> Result<(File, File), FsError> {
        let mut read_end = try_log!(File::alloc());

        let mut write_end = match log!(File::alloc()) {
            Ok(file) => file,
            Err(err) => {
                read_end.close();
                return Err(err);
            }
        };

        let Ok(pipe) = log!(Arc::try_new(Pipe {
            inner: SpinLock::new(
                PipeInner {
                    buf: [0; PIPE_CAPACITY],
                    read_count: 0,
                    write_count: 0,
                    read_open: true,
                    write_open: true,
                },
                "pipe",
            ),
        })) else {
            read_end.close();
            write_end.close();
            err!(FsError::OutOfPipe)
        };

        {
            let mut inner = FILE_TABLE.inner[read_end.id].lock();
            inner.r#type = FileType::Pipe {
                pipe: Arc::clone(&pipe),
            };
            inner.readable = true;
            inner.writeable = false;
        }

        {
            let mut inner = FILE_TABLE.inner[write_end.id].lock();
            inner.r#type = FileType::Pipe { pipe };
            inner.readable = false;
            inner.writeable = true;
        }

        Ok((read_end, write_end))
    }

    /// Identifies this pipe for `Channel::PipeRead`/`PipeWrite`. Stable and unique for the
    /// pipe's lifetime since it's the address of its own heap allocation.
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Marks one end of the pipe closed and wakes whoever is blocked on the other end. The
    /// `Arc` reclaims the buffer once both `File` handles drop their reference.
    pub fn close(&self, writeable: bool) {
        let mut inner = self.inner.lock();

        if writeable {
            inner.write_open = false;
            proc::wakeup(Channel::PipeRead(self.id()));
        } else {
            inner.read_open = false;
            proc::wakeup(Channel::PipeWrite(self.id()));
        }
    }

    /// Writes to the pipe from the user space
    pub fn write(&self, addr: VA, n: usize) -> Result<usize, SyscallError> {
        let (proc, data) = current_proc_and_data_mut();

        let mut inner = self.inner.lock();

        let mut i = 0;
        while i < n {
            if !inner.read_open || proc.is_killed() {
                err!(SyscallError::Write);
            }

            if inner.write_count == inner.read_count + PIPE_CAPACITY {
                // buffer full; wake any blocked reader and wait for room
                proc::wakeup(Channel::PipeRead(self.id()));
                inner = proc::sleep(Channel::PipeWrite(self.id()), inner);
            } else {
                let mut byte = [0u8];
                if log!(data.pagetable_mut().copy_from(addr + i, &mut byte)).is_err() {
                    break;
                }

                let slot = inner.write_count % PIPE_CAPACITY;
                inner.buf[slot] = byte[0];
                inner.write_count += 1;
                i += 1;
            }
        }

        proc::wakeup(Channel::PipeRead(self.id()));

        Ok(i)
    }

    /// Reads up to `n` bytes from the pipe into user memory at `addr`, blocking until at
    /// least one byte is available or the write end has closed.
    pub fn read(&self, addr: VA, n: usize) -> Result<usize, SyscallError> {
        let (proc, data) = current_proc_and_data_mut();

        let mut inner = self.inner.lock();

        while inner.read_count == inner.write_count && inner.write_open {
            if proc.is_killed() {
                err!(SyscallError::Read);
            }

            inner = proc::sleep(Channel::PipeRead(self.id()), inner);
        }

        let mut i = 0;
        while i < n {
            if inner.read_count == inner.write_count {
                break;
            }

            let byte = inner.buf[inner.read_count % PIPE_CAPACITY];
            if log!(data.pagetable_mut().copy_to(&[byte], addr + i)).is_err() {
                err!(SyscallError::Read);
            }

            inner.read_count += 1;
            i += 1;
        }

        proc::wakeup(Channel::PipeWrite(self.id()));

        Ok(i)
    }
}
