//! The scheduler core: worker pool, auxiliary threads, startup and
//! shutdown.
//!
//! One control block ([`Pool`]) is shared by every thread:
//!
//! * *workers* pull a ready inbox and run one dispatch turn; with nothing
//!   ready they sleep on the pool condition,
//! * the *timer* thread advances the wall clock each tick and is the
//!   last-resort pacemaker that rouses a fully sleeping pool,
//! * the *fast-timer* thread paces the timer thread (one pulse every
//!   2.5 ms) and runs simulated-time compression,
//! * the *socket* thread blocks in the poller and wakes a worker per
//!   event burst,
//! * the *monitor* thread sweeps the liveness probes every five seconds,
//! * the optional *replay* thread drives execution from a record file in
//!   lockstep with the pool.
//!
//! Threads are named for their role; the names show up in log output and
//! thread listings. Lock order, where both are held: the fast-time gate
//! before the pool state (the fast-timer thread is the only such site).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::Config;
use crate::context;
use crate::daemon;
use crate::error::Error;
use crate::handle::{Handle, HANDLE_MASK};
use crate::monitor::Probe;
use crate::mq::{Inbox, Message, MessageKind};
use crate::record::Player;
use crate::runtime::Runtime;
use crate::service::split_cmdline;

/// Per-worker dispatch weights: the batch is one message for negative
/// weights, `2^weight` otherwise. Light workers keep latency low under
/// light load; heavy workers amortise locking under pressure. Workers
/// beyond the table get weight 0.
const WEIGHT: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, //
    1, 1, 1, 1, 1, 1, 1, 1, //
    2, 2, 2, 2, 2, 2, 2, 2, //
    3, 3, 3, 3, 3, 3, 3, 3,
];

/// The fast-timer pulse interval.
const TICK_PULSE: Duration = Duration::from_micros(2500);

/// SIGHUP latch: the handler may only touch this word; the timer thread
/// turns it into a `System` message for the logger.
static SIG: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(signal: libc::c_int) {
    if signal == libc::SIGHUP {
        SIG.store(true, Ordering::Relaxed);
    }
}

fn install_sighup() -> Result<(), Error> {
    let action = SigAction::new(SigHandler::Handler(on_sighup), SaFlags::SA_RESTART, SigSet::all());
    unsafe { sigaction(Signal::SIGHUP, &action) }
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

/// Gate between the timer thread and the fast-timer thread. Held for the
/// whole of a compression window, so fast-time requests cannot re-enter
/// and the ordinary tick is suspended while simulated time is compressed.
pub(crate) struct FastGate {
    pub(crate) state: Mutex<FastState>,
    /// Paces the timer thread; signalled by the fast-timer thread.
    pub(crate) tick: Condvar,
}

#[derive(Default)]
pub(crate) struct FastState {
    /// Target simulated epoch in centiseconds; 0 outside compression.
    pub(crate) fast_time: u64,
    /// Largest simulated-time increment per compression step.
    pub(crate) once_add: u32,
}

impl FastGate {
    pub(crate) fn new() -> FastGate {
        FastGate {
            state: Mutex::new(FastState::default()),
            tick: Condvar::new(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Workers currently blocked on `cond`. Always within `0..=count`.
    sleep: usize,
    /// Bumped by the last worker to fall asleep; drain waiters resume
    /// when it advances, so a spurious wakeup cannot release them early.
    drained: u64,
}

/// The shared control block.
struct Pool {
    count: usize,
    probes: Vec<Probe>,
    state: Mutex<PoolState>,
    /// Wakes sleeping workers.
    cond: Condvar,
    /// One-shot handshake: signalled when the pool has fully drained.
    workcond: Condvar,
    /// One-way latch; set once by the timer thread, never reverts.
    quit: AtomicBool,
}

impl Pool {
    fn new(count: usize) -> Pool {
        Pool {
            count,
            probes: (0..count).map(|_| Probe::new()).collect(),
            state: Mutex::new(PoolState::default()),
            cond: Condvar::new(),
            workcond: Condvar::new(),
            quit: AtomicBool::new(false),
        }
    }

    /// Rouse one sleeping worker, but only when fewer than `busy` workers
    /// are already up: with that many awake, new work will be found
    /// without spending a signal.
    fn wakeup(&self, busy: usize) {
        let state = self.state.lock().unwrap();
        if state.sleep >= self.count - busy {
            self.cond.notify_one();
        }
    }

    /// Flip the quit latch and release everyone.
    fn set_quit(&self) {
        let _state = self.state.lock().unwrap();
        self.quit.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Release the workers and wait until every one of them has gone back
    /// to sleep (or the runtime is quitting). Caller holds the state lock,
    /// which makes the release-and-wait atomic: no worker can complete a
    /// full wake/sleep cycle before we start waiting.
    fn drain<'a>(&self, state: MutexGuard<'a, PoolState>) -> MutexGuard<'a, PoolState> {
        let generation = state.drained;
        self.cond.notify_all();
        self.workcond
            .wait_while(state, |s| {
                s.drained == generation && !self.quit.load(Ordering::SeqCst)
            })
            .unwrap()
    }
}

/// Run a runtime to completion: startup order, the thread set, shutdown
/// order. Returns once every thread has joined.
pub fn start(mut config: Config) -> Result<(), Error> {
    install_sighup()?;

    let _daemon = match &config.daemon {
        Some(pidfile) => Some(daemon::init(pidfile)?),
        None => None,
    };

    let rt = Runtime::new(&mut config)?;

    let logger_args = config
        .logger
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let logger = rt
        .spawn_service(&config.logservice, &logger_args)
        .map_err(|e| Error::ServiceStart {
            name: config.logservice.clone(),
            reason: e.to_string(),
        })?;
    rt.name_service(logger, "logger");

    match config.recordfile.clone() {
        None => {
            if let Some(cmdline) = config.bootstrap.clone() {
                bootstrap(&rt, logger, &cmdline)?;
            }
            run(&rt, config.thread, None);
        }
        Some(path) => run(&rt, config.thread, Some(path)),
    }

    // The harbor may still need the socket layer on its way out, so it
    // exits first.
    rt.harbor().exit();
    rt.socket().free();
    rt.recorder().finish();
    Ok(())
}

/// Launch the first real service from its command line. On failure the
/// logger's inbox is flushed inline so the diagnostics are not lost with
/// the runtime.
fn bootstrap(rt: &Arc<Runtime>, logger: Handle, cmdline: &str) -> Result<Handle, Error> {
    let (name, args) = split_cmdline(cmdline);
    match rt.spawn_service(name, args) {
        Ok(handle) => {
            rt.record_bootstrap(handle, cmdline);
            Ok(handle)
        }
        Err(e) => {
            log::error!("bootstrap error: {}", cmdline);
            if let Some(ctx) = rt.context(logger) {
                context::dispatch_all(rt, &ctx);
            }
            Err(Error::Bootstrap(format!("{}: {}", cmdline, e)))
        }
    }
}

/// Spawn the thread set and block until it has joined. The pool outlives
/// every thread by construction: they are scoped children borrowing it.
fn run(rt: &Arc<Runtime>, threads: usize, recordfile: Option<PathBuf>) {
    let count = threads.max(1);
    let pool = Pool::new(count);
    let pool = &pool;
    thread::scope(|scope| {
        spawn(scope, "monitor", move || monitor_thread(rt, pool));
        spawn(scope, "timer", move || timer_thread(rt, pool));
        spawn(scope, "socket", move || socket_thread(rt, pool));
        spawn(scope, "fast-timer", move || fast_timer_thread(rt, pool));
        for id in 0..count {
            let weight = WEIGHT.get(id).copied().unwrap_or(0);
            spawn(scope, &format!("worker-{}", id), move || {
                worker_thread(rt, pool, id, weight)
            });
        }
        if let Some(path) = recordfile {
            spawn(scope, "replay", move || record_thread(rt, pool, &path));
        }
    });
}

fn spawn<'scope, F>(scope: &'scope thread::Scope<'scope, '_>, name: &str, f: F)
where
    F: FnOnce() + Send + 'scope,
{
    if let Err(e) = thread::Builder::new()
        .name(name.to_string())
        .spawn_scoped(scope, f)
    {
        // A half-started scheduler has no safe unwind path.
        log::error!("create thread {} failed: {}", name, e);
        std::process::exit(1);
    }
}

/// One worker: dispatch turns until nothing is ready, then the sleep
/// protocol. The last worker to fall asleep signals the drain handshake.
fn worker_thread(rt: &Arc<Runtime>, pool: &Pool, id: usize, weight: i32) {
    let probe = &pool.probes[id];
    let mut inbox: Option<Arc<Inbox>> = None;
    while !pool.quit.load(Ordering::SeqCst) {
        inbox = context::dispatch(rt, probe, inbox.take(), weight);
        if inbox.is_none() {
            let mut state = pool.state.lock().unwrap();
            state.sleep += 1;
            if state.sleep == pool.count {
                state.drained = state.drained.wrapping_add(1);
                pool.workcond.notify_one();
            }
            // Spurious wakeups are harmless: dispatch can be called at
            // any time and simply finds nothing ready.
            if !pool.quit.load(Ordering::SeqCst) {
                state = pool.cond.wait(state).unwrap();
            }
            state.sleep -= 1;
        }
    }
}

/// Wall-clock advancement and the SIGHUP relay. Breaks out once no
/// service contexts remain, then shuts the rest of the runtime down.
fn timer_thread(rt: &Arc<Runtime>, pool: &Pool) {
    loop {
        rt.timer().update(rt);
        rt.socket().updatetime(rt);
        if rt.context_total() == 0 {
            break;
        }
        pool.wakeup(pool.count - 1);
        if SIG.swap(false, Ordering::Relaxed) {
            signal_hup(rt);
        }
        // Paced by the fast-timer pulse; the timeout only covers the
        // window where the fast-timer thread exits first at shutdown.
        let gate = rt.gate().state.lock().unwrap();
        let _ = rt
            .gate()
            .tick
            .wait_timeout(gate, Duration::from_millis(10))
            .unwrap();
    }
    // Unblock the socket thread, then everyone else.
    rt.socket().exit();
    pool.set_quit();
}

/// Translate a caught SIGHUP into a log-reopen nudge for the logger.
fn signal_hup(rt: &Runtime) {
    if let Some(logger) = rt.find_service("logger") {
        rt.post(
            logger,
            Message {
                source: 0,
                session: 0,
                kind: MessageKind::System,
                data: Vec::new(),
            },
        );
    }
}

/// Idle mode: pulse the timer thread every 2.5 ms. Compression mode:
/// advance the simulated clock step by step, draining the pool between
/// steps so no worker is mid-turn while time jumps.
fn fast_timer_thread(rt: &Arc<Runtime>, pool: &Pool) {
    loop {
        if rt.context_total() == 0 {
            break;
        }
        {
            let mut gate = rt.gate().state.lock().unwrap();
            if gate.fast_time > 0 {
                let start_time = rt.start_time_centisec();
                log::info!(
                    "fast time begin: now = {}, target = {}, step = {}",
                    start_time + rt.timer().now(),
                    gate.fast_time,
                    gate.once_add
                );
                loop {
                    let now_time = start_time + rt.timer().now();
                    if now_time >= gate.fast_time {
                        break;
                    }
                    let remain = gate.fast_time - now_time;
                    let step = remain.min(gate.once_add as u64) as u32;
                    rt.timer().time_fast(step);
                    rt.timer().update(rt);
                    rt.socket().updatetime(rt);
                    let state = pool.state.lock().unwrap();
                    let _state = pool.drain(state);
                    if pool.quit.load(Ordering::SeqCst) {
                        break;
                    }
                }
                gate.fast_time = 0;
                gate.once_add = 0;
                log::info!("fast time end");
            }
        }
        rt.gate().tick.notify_one();
        thread::sleep(TICK_PULSE);
    }
}

/// Bridge the socket poller into the pool: every event burst wakes a
/// worker aggressively (new I/O usually means new work).
fn socket_thread(rt: &Arc<Runtime>, pool: &Pool) {
    loop {
        let r = rt.socket().poll(rt);
        if r == 0 {
            break;
        }
        if r < 0 {
            if rt.context_total() == 0 {
                break;
            }
            continue;
        }
        pool.wakeup(0);
    }
}

/// Sweep every liveness probe, every five seconds.
fn monitor_thread(rt: &Arc<Runtime>, pool: &Pool) {
    loop {
        if rt.context_total() == 0 {
            break;
        }
        for probe in &pool.probes {
            probe.check();
        }
        for _ in 0..5 {
            if rt.context_total() == 0 {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn record_thread(rt: &Arc<Runtime>, pool: &Pool, path: &Path) {
    match run_replay(rt, pool, path) {
        Ok(()) => log::info!("replay complete >>> {}", path.display()),
        Err(e) => log::error!("replay aborted: {}", e),
    }
}

/// Drive execution from a record file, one logical step at a time. The
/// pool lock is held while a step is assembled and installed, and the
/// drain handshake ensures every released message is fully processed
/// before the next step, reproducing the captured interleaving.
fn run_replay(rt: &Arc<Runtime>, pool: &Pool, path: &Path) -> Result<(), Error> {
    let mut player = Player::open(path)?;
    log::info!("replay begin >>> {} ({} bytes)", path.display(), player.len());
    let mut current: Handle = 0;
    let mut last_percent: u64 = 0;

    while !pool.quit.load(Ordering::SeqCst) {
        if player.peek_tag()?.is_none() {
            break;
        }
        let mut state = pool.state.lock().unwrap();

        let percent = player.pos() * 100 / player.len().max(1);
        if percent > last_percent {
            last_percent = percent;
            log::info!(
                "replay progress {}% ({} / {} bytes)",
                percent,
                player.pos(),
                player.len()
            );
        }

        // Assemble one step: a b/m/a record plus its trailing
        // deterministic-state records. Any other tag belongs to the next
        // step and is pushed back.
        let mut delivered = false;
        let mut boot: Option<(Handle, String)> = None;
        while let Some(tag) = player.next_tag()? {
            if (delivered || boot.is_some())
                && !matches!(tag, b's' | b'h' | b'k' | b'r' | b't' | b'n')
            {
                player.unread()?;
                break;
            }
            match tag {
                b'o' => {
                    let handle = player.read_handle()?;
                    log::debug!("replay: service {:08x} opened", handle);
                }
                b'c' => {
                    let handle = player.read_handle()?;
                    log::debug!("replay: service {:08x} closed", handle);
                }
                b'b' => {
                    let (handle, cmdline) = player.read_bootstrap()?;
                    current = handle;
                    boot = Some((handle, cmdline));
                }
                b'm' | b'a' => {
                    if current == 0 {
                        return Err(Error::Record("message record before any bootstrap".into()));
                    }
                    let msg = player.read_message()?;
                    rt.post_replay(current, msg);
                    delivered = true;
                }
                b's' => {
                    let session = player.read_i32()?;
                    match rt.context(current) {
                        Some(ctx) => ctx.pin_session(session),
                        None => log::error!("replay: session record with no service"),
                    }
                }
                b'h' => rt.handles().pin_index(player.read_u32()?),
                b'k' => rt.socket().pin_id(player.read_u32()?),
                b'r' => rt.reseed(player.read_u64()?),
                b't' => rt.timer().set_starttime(player.read_u32()?),
                b'n' => rt.timer().set_current(player.read_u64()?),
                other => {
                    return Err(Error::Record(format!(
                        "unknown record tag {:?}",
                        other as char
                    )))
                }
            }
        }

        if let Some((handle, cmdline)) = boot {
            rt.handles().pin_index(handle & HANDLE_MASK);
            let (name, args) = split_cmdline(&cmdline);
            let spawned = rt.spawn_service(name, args).map_err(|e| {
                Error::Record(format!("can't launch service {:?}: {}", name, e))
            })?;
            if spawned != handle {
                log::error!(
                    "replay: service {} came up as {:08x}, recorded {:08x}",
                    name,
                    spawned,
                    handle
                );
            }
            rt.set_record_handle(handle);
        }

        state = pool.drain(state);
        drop(state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_table_matches_the_standard_assignment() {
        assert_eq!(&WEIGHT[..4], &[-1; 4]);
        assert_eq!(&WEIGHT[4..8], &[0; 4]);
        assert_eq!(&WEIGHT[8..16], &[1; 8]);
        assert_eq!(&WEIGHT[16..24], &[2; 8]);
        assert_eq!(&WEIGHT[24..32], &[3; 8]);
        // Beyond the table every worker weighs 0.
        assert_eq!(WEIGHT.get(32).copied().unwrap_or(0), 0);
    }

    /// Minimal stand-in for the worker sleep protocol so the pool
    /// handshake can be exercised without a full runtime.
    fn sleeper(pool: &Pool, turns: &std::sync::atomic::AtomicUsize) {
        while !pool.quit.load(Ordering::SeqCst) {
            let mut state = pool.state.lock().unwrap();
            state.sleep += 1;
            assert!(state.sleep <= pool.count);
            if state.sleep == pool.count {
                state.drained = state.drained.wrapping_add(1);
                pool.workcond.notify_one();
            }
            if !pool.quit.load(Ordering::SeqCst) {
                state = pool.cond.wait(state).unwrap();
            }
            state.sleep -= 1;
            drop(state);
            turns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drain_resumes_only_after_the_pool_refills() {
        use std::sync::atomic::AtomicUsize;

        let pool = Pool::new(3);
        let pool = &pool;
        let turns = AtomicUsize::new(0);
        let turns = &turns;
        thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(move || sleeper(pool, turns));
            }
            // Wait for all three to be asleep.
            {
                let state = pool.state.lock().unwrap();
                let _state = pool
                    .workcond
                    .wait_while(state, |s| s.sleep < pool.count)
                    .unwrap();
            }
            for _ in 0..5 {
                let state = pool.state.lock().unwrap();
                let before = state.drained;
                let state = pool.drain(state);
                // The generation advanced: every worker completed a full
                // wake/sleep cycle.
                assert_ne!(state.drained, before);
                assert_eq!(state.sleep, pool.count);
            }
            pool.set_quit();
        });
        // Each of the 5 drains woke all 3 sleepers at least once.
        assert!(turns.load(Ordering::SeqCst) >= 15);
    }

    #[test]
    fn quit_latch_is_monotonic_and_releases_sleepers() {
        use std::sync::atomic::AtomicUsize;

        let pool = Pool::new(2);
        let pool = &pool;
        let turns = AtomicUsize::new(0);
        let turns = &turns;
        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(move || sleeper(pool, turns));
            }
            {
                let state = pool.state.lock().unwrap();
                let _state = pool
                    .workcond
                    .wait_while(state, |s| s.sleep < pool.count)
                    .unwrap();
            }
            pool.set_quit();
            // The latch never reverts.
            assert!(pool.quit.load(Ordering::SeqCst));
        });
        assert!(pool.quit.load(Ordering::SeqCst));
        assert_eq!(pool.state.lock().unwrap().sleep, 0);
    }
}
