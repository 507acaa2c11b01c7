// Exports common ABI types and constants for use by userspace programs.
pub use crate::file::{CONSOLE, OpenFlag};
pub use crate::fs::{DIRSIZE, Directory, InodeType, Stat};
pub use crate::memlayout::MMAPBASE;
pub use crate::param::MAXPATH;
pub use crate::syscall::Syscall;

/// Mapping may be read.
pub const PROT_READ: u32 = 0x1;
/// Mapping may be written.
pub const PROT_WRITE: u32 = 0x2;

/// Mapping is not backed by a file; the page is zero-filled on first touch.
pub const MAP_ANONYMOUS: u32 = 0x1;
/// Populate every page of the mapping immediately instead of waiting for a fault.
pub const MAP_POPULATE: u32 = 0x2;
