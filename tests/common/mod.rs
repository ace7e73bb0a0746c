//! Shared harness: boot a runtime on its own thread and smuggle the
//! runtime handle out to the test through the bootstrap service's factory.
#![allow(dead_code)]

use colony::{Config, Error, Message, Runtime, Service, ServiceContext};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A service that ignores everything; useful as a bootstrap anchor.
pub struct Inert;

impl Service for Inert {
    fn message(&mut self, _rt: &Arc<Runtime>, _ctx: &ServiceContext, _msg: Message) {}
}

/// Register an inert `pilot` bootstrap service that hands the runtime
/// handle back, then run `colony::start` on a fresh thread.
pub fn launch(mut config: Config) -> (Arc<Runtime>, mpsc::Receiver<Result<(), Error>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (rt_tx, rt_rx) = mpsc::channel();
    let rt_tx = Mutex::new(rt_tx);
    config.register("pilot", move |rt, _args| {
        let _ = rt_tx.lock().unwrap().send(rt.clone());
        Ok(Box::new(Inert))
    });
    config.bootstrap = Some("pilot".to_string());
    let done = run(config);
    let rt = rt_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("runtime did not come up");
    (rt, done)
}

/// Run `colony::start` on a fresh thread, reporting its result on the
/// returned channel.
pub fn run(config: Config) -> mpsc::Receiver<Result<(), Error>> {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = done_tx.send(colony::start(config));
    });
    done_rx
}

/// Wait for `start` to return cleanly.
pub fn join(done: &mpsc::Receiver<Result<(), Error>>, secs: u64) {
    done.recv_timeout(Duration::from_secs(secs))
        .expect("runtime did not shut down in time")
        .expect("start returned an error");
}

/// Spin until `cond` holds, with a deadline.
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}
