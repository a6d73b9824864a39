//! Basic Strand example
//!
//! Spawns a handful of fibers on a reactor-backed scheduler, yields
//! between them and lets one of them sleep cooperatively.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG_LEVEL=debug` - set log level (off, error, warn, info, debug, trace)
//! - `STRAND_LOG_FLUSH=1` - flush log output immediately

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strand::{hook, Fiber, IoManager};

// STRAND_LOG_LEVEL=debug cargo run -p strand-basic
fn main() {
    println!("=== Strand Basic Example ===\n");

    let iom = IoManager::new(2, false, "basic");
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        iom.spawn(move || {
            for j in 0..3 {
                println!("[fiber {}] step {} (id={})", i, j, Fiber::current_id());
                Fiber::yield_to_ready();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // One fiber sleeps without holding a worker hostage.
    let c = completed.clone();
    iom.spawn(move || {
        println!("[sleeper] going down for 200ms");
        hook::sleep_ms(200);
        println!("[sleeper] back");
        c.fetch_add(1, Ordering::SeqCst);
    });

    // A timer on the reactor itself.
    let c = completed.clone();
    iom.add_timer(
        100,
        move || {
            println!("[timer] 100ms fired");
            c.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    while completed.load(Ordering::SeqCst) < 5 {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    iom.stop();

    println!(
        "\n=== {} units completed ===",
        completed.load(Ordering::SeqCst)
    );
}
