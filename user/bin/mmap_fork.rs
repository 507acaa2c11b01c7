#![no_std]
#![no_main]

use user::*;

const PATH: &str = "mmapforkdata";
const FILE_LEN: usize = 8192;

fn pattern(i: usize) -> u8 {
    (i % 199) as u8
}

/// Establishes the four-mapping layout from a fresh backing file, forks, and has the child
/// fault in and tear down every mapping independently of the parent.
#[unsafe(no_mangle)]
fn main(_args: Args) {
    let fd = open(PATH, OpenFlag::READ_WRITE | OpenFlag::CREATE | OpenFlag::TRUNCATE)
        .unwrap_or_else(|_| exit_with_msg("mmap_fork: create failed"));
    let mut content = [0u8; FILE_LEN];
    for (i, byte) in content.iter_mut().enumerate() {
        *byte = pattern(i);
    }
    if write(fd, &content).is_err() {
        exit_with_msg("mmap_fork: write failed");
    }
    if close(fd).is_err() {
        exit_with_msg("mmap_fork: close failed");
    }

    let fd = open(PATH, OpenFlag::READ_ONLY).unwrap_or_else(|_| exit_with_msg("mmap_fork: reopen failed"));

    let before = freemem();

    // file-backed, populated, read starting at file offset 1024
    let addr1 = mmap(0, 4096, PROT_READ, MAP_POPULATE, Some(fd), 1024)
        .unwrap_or_else(|_| exit_with_msg("mmap_fork: mmap 1 failed"));

    // anonymous, lazy
    let addr2 = mmap(0, 4096, PROT_READ | PROT_WRITE, MAP_ANONYMOUS, None, 0)
        .unwrap_or_else(|_| exit_with_msg("mmap_fork: mmap 2 failed"));

    // file-backed, lazy, two pages
    let addr3 = mmap(0, 8192, PROT_READ, 0, Some(fd), 0)
        .unwrap_or_else(|_| exit_with_msg("mmap_fork: mmap 3 failed"));

    // anonymous, populated
    let addr4 = mmap(0, 4096, PROT_READ | PROT_WRITE, MAP_ANONYMOUS | MAP_POPULATE, None, 0)
        .unwrap_or_else(|_| exit_with_msg("mmap_fork: mmap 4 failed"));

    if addr2 != addr1 + 4096 || addr3 != addr2 + 4096 || addr4 != addr3 + 8192 {
        exit_with_msg("mmap_fork: mappings not laid out contiguously");
    }

    let pid = fork().unwrap_or_else(|_| exit_with_msg("mmap_fork: fork failed"));

    if pid == 0 {
        let child_before = freemem();

        let m1 = unsafe { core::slice::from_raw_parts(addr1 as *const u8, 4096) };
        if m1 != &content[1024..1024 + 4096] {
            exit_with_msg("mmap_fork: child mapping 1 content mismatch");
        }

        let m2 = unsafe { core::slice::from_raw_parts_mut(addr2 as *mut u8, 4096) };
        if m2[0] != 0 {
            exit_with_msg("mmap_fork: child mapping 2 not zero before touch");
        }
        m2[0] = 0xEF;

        let m3 = unsafe { core::slice::from_raw_parts(addr3 as *const u8, 8192) };
        if m3 != &content[..8192] {
            exit_with_msg("mmap_fork: child mapping 3 content mismatch");
        }

        let m4 = unsafe { core::slice::from_raw_parts(addr4 as *const u8, 4096) };
        if m4.iter().any(|&b| b != 0) {
            exit_with_msg("mmap_fork: child mapping 4 not zero");
        }

        if munmap(addr1).is_err()
            || munmap(addr2).is_err()
            || munmap(addr3).is_err()
            || munmap(addr4).is_err()
        {
            exit_with_msg("mmap_fork: child munmap failed");
        }

        if freemem() != child_before {
            exit_with_msg("mmap_fork: child freemem not restored after unmap");
        }

        exit(0);
    }

    let _ = wait(&mut 0);

    if munmap(addr1).is_err()
        || munmap(addr2).is_err()
        || munmap(addr3).is_err()
        || munmap(addr4).is_err()
    {
        exit_with_msg("mmap_fork: parent munmap failed");
    }

    if freemem() != before {
        exit_with_msg("mmap_fork: parent freemem not restored after unmap");
    }

    if close(fd).is_err() {
        exit_with_msg("mmap_fork: close failed");
    }
    let _ = unlink(PATH);

    println!("mmap_fork: ok");
}
