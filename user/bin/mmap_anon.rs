#![no_std]
#![no_main]

use user::*;

const LENGTH: usize = 4096 * 4;

#[unsafe(no_mangle)]
fn main(_args: Args) {
    let before = freemem();

    let addr = mmap(0, LENGTH, PROT_READ | PROT_WRITE, MAP_ANONYMOUS | MAP_POPULATE, None, 0)
        .unwrap_or_else(|_| exit_with_msg("mmap_anon: mmap failed"));

    let buf = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, LENGTH) };

    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    for (i, &byte) in buf.iter().enumerate() {
        if byte != (i % 251) as u8 {
            exit_with_msg("mmap_anon: readback mismatch");
        }
    }

    if munmap(addr).is_err() {
        exit_with_msg("mmap_anon: munmap failed");
    }

    if freemem() != before {
        exit_with_msg("mmap_anon: freemem not restored after munmap");
    }

    println!("mmap_anon: ok");
}
