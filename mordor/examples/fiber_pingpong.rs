//! Two fibers bouncing control back and forth through a scheduler.
//!
//!     cargo run --example fiber_pingpong

use std::sync::Arc;

use mordor::{FiberEvent, Scheduler};

fn main() {
    let sched = Scheduler::hijack("pingpong", 1);

    let ping = Arc::new(FiberEvent::new(true));
    let pong = Arc::new(FiberEvent::new(true));

    {
        let ping = ping.clone();
        let pong = pong.clone();
        sched.schedule(move || {
            for i in 0..5 {
                println!("ping {i}");
                pong.set();
                ping.wait();
            }
            pong.set();
        });
    }
    {
        let ping = ping.clone();
        let pong = pong.clone();
        sched.schedule(move || {
            for i in 0..5 {
                pong.wait();
                println!("pong {i}");
                ping.set();
            }
        });
    }

    sched.stop();
}
