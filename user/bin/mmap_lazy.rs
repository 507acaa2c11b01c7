#![no_std]
#![no_main]

use user::*;

const PATH: &str = "mmaplazy";
const CONTENT: &[u8] = b"lazy file mapping contents";

/// Maps a file without `MAP_POPULATE`, so the page is read in on first touch by the kernel's
/// page-fault handler rather than up front.
#[unsafe(no_mangle)]
fn main(_args: Args) {
    let fd = open(PATH, OpenFlag::READ_WRITE | OpenFlag::CREATE | OpenFlag::TRUNCATE)
        .unwrap_or_else(|_| exit_with_msg("mmap_lazy: create failed"));
    if write(fd, CONTENT).is_err() {
        exit_with_msg("mmap_lazy: write failed");
    }
    if close(fd).is_err() {
        exit_with_msg("mmap_lazy: close failed");
    }

    let fd = open(PATH, OpenFlag::READ_ONLY).unwrap_or_else(|_| exit_with_msg("mmap_lazy: reopen failed"));

    let before = freemem();

    let addr = mmap(0, 4096, PROT_READ, 0, Some(fd), 0)
        .unwrap_or_else(|_| exit_with_msg("mmap_lazy: mmap failed"));

    if freemem() != before {
        exit_with_msg("mmap_lazy: freemem changed before any access");
    }

    // first read faults the page in
    let mapped = unsafe { core::slice::from_raw_parts(addr as *const u8, CONTENT.len()) };
    if mapped != CONTENT {
        exit_with_msg("mmap_lazy: content mismatch");
    }

    if freemem() + 1 != before {
        exit_with_msg("mmap_lazy: freemem did not decrease by one page after fault-in");
    }

    if munmap(addr).is_err() {
        exit_with_msg("mmap_lazy: munmap failed");
    }

    if freemem() != before {
        exit_with_msg("mmap_lazy: freemem not restored after munmap");
    }

    if close(fd).is_err() {
        exit_with_msg("mmap_lazy: close failed");
    }
    let _ = unlink(PATH);

    println!("mmap_lazy: ok");
}
