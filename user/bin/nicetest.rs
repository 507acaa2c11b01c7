#![no_std]
#![no_main]

use user::*;

const NICE_VALUES: [u32; 3] = [0, 20, 39];
const RUN_TICKS: usize = 50;

#[unsafe(no_mangle)]
fn main(args: Args) {
    let run_ticks = args
        .args_as_str()
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(RUN_TICKS);

    for nice in NICE_VALUES {
        let pid = fork().unwrap_or_else(|_| exit_with_msg("nicetest: fork failed"));

        if pid == 0 {
            let pid = getpid();
            if setnice(pid, nice).is_err() {
                exit_with_msg("nicetest: setnice failed");
            }

            let deadline = uptime() + run_ticks;
            let mut spins: u64 = 0;
            while uptime() < deadline {
                spins = spins.wrapping_add(1);
            }

            println!("nicetest: pid {} nice {} spins {}", pid, nice, spins);
            exit(0);
        }
    }

    for _ in NICE_VALUES {
        let _ = wait(&mut 0);
    }

    if ps(0).is_err() {
        exit_with_msg("nicetest: ps failed");
    }
}
