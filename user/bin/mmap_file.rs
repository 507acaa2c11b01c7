#![no_std]
#![no_main]

use user::*;

const PATH: &str = "mmapdata";
const CONTENT: &[u8] = b"the quick brown fox jumps over the lazy dog";

#[unsafe(no_mangle)]
fn main(_args: Args) {
    let fd = open(PATH, OpenFlag::READ_WRITE | OpenFlag::CREATE | OpenFlag::TRUNCATE)
        .unwrap_or_else(|_| exit_with_msg("mmap_file: create failed"));
    if write(fd, CONTENT).is_err() {
        exit_with_msg("mmap_file: write failed");
    }
    if close(fd).is_err() {
        exit_with_msg("mmap_file: close failed");
    }

    let fd = open(PATH, OpenFlag::READ_ONLY).unwrap_or_else(|_| exit_with_msg("mmap_file: reopen failed"));

    let before = freemem();

    let addr = mmap(0, 4096, PROT_READ, MAP_POPULATE, Some(fd), 0)
        .unwrap_or_else(|_| exit_with_msg("mmap_file: mmap failed"));

    let mapped = unsafe { core::slice::from_raw_parts(addr as *const u8, CONTENT.len()) };
    if mapped != CONTENT {
        exit_with_msg("mmap_file: content mismatch");
    }

    if munmap(addr).is_err() {
        exit_with_msg("mmap_file: munmap failed");
    }

    if freemem() != before {
        exit_with_msg("mmap_file: freemem not restored after munmap");
    }

    if close(fd).is_err() {
        exit_with_msg("mmap_file: close failed");
    }
    let _ = unlink(PATH);

    println!("mmap_file: ok");
}
