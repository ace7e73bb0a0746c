//! Inject-to-reply latency under bursts of messages.
//!
//! Not a statistics suite: sends bursts at an echo service, waits for the
//! replies, and prints per-burst round-trip numbers.

use colony::{Config, Message, MessageKind, Runtime, Service, ServiceContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const BURSTS: usize = 200;
const BURST_SIZE: usize = 64;

struct Echo;

impl Service for Echo {
    fn message(&mut self, rt: &Arc<Runtime>, ctx: &ServiceContext, msg: Message) {
        if msg.kind == MessageKind::Text {
            rt.send(
                ctx.handle(),
                msg.source,
                MessageKind::Response,
                msg.session,
                msg.data,
            );
        }
    }
}

struct Counter {
    seen: Arc<AtomicUsize>,
}

impl Service for Counter {
    fn message(&mut self, _rt: &Arc<Runtime>, _ctx: &ServiceContext, msg: Message) {
        if msg.kind == MessageKind::Response {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn main() {
    let mut config = Config::new();
    config.thread = 4;
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_factory = seen.clone();
    config.register("echo", |_rt, _args| Ok(Box::new(Echo)));
    config.register("counter", move |_rt, _args| {
        Ok(Box::new(Counter {
            seen: seen_in_factory.clone(),
        }))
    });

    let (rt_tx, rt_rx) = mpsc::channel();
    let rt_tx = Mutex::new(rt_tx);
    config.register("pilot", move |rt, _args| {
        let _ = rt_tx.lock().unwrap().send(rt.clone());
        Ok(Box::new(Echo))
    });
    config.bootstrap = Some("pilot".to_string());

    let runner = thread::spawn(move || colony::start(config));
    let rt = rt_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let echo = rt.spawn_service("echo", "").unwrap();
    let counter = rt.spawn_service("counter", "").unwrap();

    let mut times = Vec::with_capacity(BURSTS);
    for burst in 0..BURSTS {
        let expected = (burst + 1) * BURST_SIZE;
        let begun = Instant::now();
        for i in 0..BURST_SIZE {
            rt.send(counter, echo, MessageKind::Text, i as i32 + 1, Vec::new());
        }
        while seen.load(Ordering::SeqCst) < expected {
            thread::yield_now();
        }
        times.push(begun.elapsed());
        thread::sleep(Duration::from_millis(2));
    }

    rt.retire_all();
    runner.join().unwrap().unwrap();

    times.sort();
    let total: Duration = times.iter().sum();
    let avg = total / times.len() as u32;
    let med = times[times.len() / 2];
    let best = times[0];
    let worst = times[times.len() - 1];
    println!(
        "{} bursts of {} => avg {:>9?}, med {:>9?}, range {:?}..{:?}",
        BURSTS, BURST_SIZE, avg, med, best, worst
    );
}
