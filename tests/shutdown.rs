//! An idle runtime parks every thread, and retiring the last service
//! tears the whole thread set down promptly.

mod common;

use std::time::{Duration, Instant};

#[test]
fn idle_runtime_shuts_down_after_last_service_retires() {
    let mut config = colony::Config::new();
    config.thread = 4;
    let (rt, done) = common::launch(config);

    // Logger plus the pilot; everything else is asleep.
    common::wait_until("both services to come up", || rt.context_total() == 2);

    // A standalone runtime has no transport for other harbors.
    assert!(!rt.send(0, 0x0100_0001, colony::MessageKind::Text, 0, Vec::new()));

    // Give the pool a moment to go fully idle before pulling the plug.
    std::thread::sleep(Duration::from_millis(200));

    let begun = Instant::now();
    rt.retire_all();
    common::join(&done, 5);
    assert!(
        begun.elapsed() < Duration::from_secs(2),
        "threads took {:?} to wind down",
        begun.elapsed()
    );
    assert_eq!(rt.context_total(), 0);
}

#[test]
fn a_runtime_can_follow_another_in_the_same_process() {
    // Back-to-back runtimes exercise that nothing load-bearing hides in
    // process-global state.
    for _ in 0..2 {
        let mut config = colony::Config::new();
        config.thread = 2;
        let (rt, done) = common::launch(config);
        common::wait_until("services to come up", || rt.context_total() == 2);
        rt.retire_all();
        common::join(&done, 5);
    }
}
