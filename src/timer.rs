//! Centisecond timers on a four-level hierarchical wheel.
//!
//! The near ring holds the next 256 ticks; four cascade levels of 64 slots
//! each cover the rest of the 32-bit tick space. Expirations are delivered
//! as `Response` messages carrying the session the timeout was scheduled
//! with.
//!
//! The wheel runs on a *virtual* clock: the monotonic OS clock plus a fast
//! offset that time compression bumps. The wall anchor (`starttime`) and
//! the elapsed counter (`now`) can be overridden by a replay driver.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::time::{clock_gettime, ClockId};

use crate::handle::Handle;
use crate::mq::{Message, MessageKind};
use crate::runtime::Runtime;

const NEAR_SHIFT: u32 = 8;
const NEAR: u32 = 1 << NEAR_SHIFT;
const NEAR_MASK: u32 = NEAR - 1;
const LEVEL_SHIFT: u32 = 6;
const LEVEL: usize = 1 << LEVEL_SHIFT;
const LEVEL_MASK: u32 = LEVEL as u32 - 1;

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    expire: u32,
    handle: Handle,
    session: i32,
}

struct Wheel {
    near: Vec<Vec<TimerNode>>,
    level: [Vec<Vec<TimerNode>>; 4],
    time: u32,
}

impl Wheel {
    fn new() -> Wheel {
        Wheel {
            near: (0..NEAR).map(|_| Vec::new()).collect(),
            level: std::array::from_fn(|_| (0..LEVEL).map(|_| Vec::new()).collect()),
            time: 0,
        }
    }

    fn add(&mut self, node: TimerNode) {
        let expire = node.expire;
        let current = self.time;
        if (expire | NEAR_MASK) == (current | NEAR_MASK) {
            self.near[(expire & NEAR_MASK) as usize].push(node);
        } else {
            let mut mask = NEAR << LEVEL_SHIFT;
            let mut i = 0;
            while i < 3 {
                if (expire | (mask - 1)) == (current | (mask - 1)) {
                    break;
                }
                mask <<= LEVEL_SHIFT;
                i += 1;
            }
            let slot = (expire >> (NEAR_SHIFT + i as u32 * LEVEL_SHIFT)) & LEVEL_MASK;
            self.level[i][slot as usize].push(node);
        }
    }

    fn move_level(&mut self, level: usize, slot: usize) {
        let nodes = std::mem::take(&mut self.level[level][slot]);
        for node in nodes {
            self.add(node);
        }
    }

    /// Advance one tick, cascading outer levels whose window closed.
    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.move_level(3, 0);
        } else {
            let mut mask = NEAR;
            let mut time = ct >> NEAR_SHIFT;
            let mut i = 0;
            while (ct & (mask - 1)) == 0 {
                let slot = (time & LEVEL_MASK) as usize;
                if slot != 0 {
                    self.move_level(i, slot);
                    break;
                }
                mask <<= LEVEL_SHIFT;
                time >>= LEVEL_SHIFT;
                i += 1;
            }
        }
    }

    fn expired(&mut self, out: &mut Vec<TimerNode>) {
        let slot = (self.time & NEAR_MASK) as usize;
        out.append(&mut self.near[slot]);
    }
}

pub(crate) struct Timer {
    wheel: Mutex<Wheel>,
    /// Wall epoch (seconds) captured at init; replay may override.
    starttime: AtomicU32,
    /// Centiseconds elapsed since `starttime`.
    current: AtomicU64,
    /// Last virtual-clock sample the wheel has been advanced to.
    current_point: AtomicU64,
    /// Centiseconds added by time compression.
    fast_offset: AtomicU64,
}

impl Timer {
    pub(crate) fn new() -> Timer {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timer {
            wheel: Mutex::new(Wheel::new()),
            starttime: AtomicU32::new(wall.as_secs() as u32),
            current: AtomicU64::new((wall.subsec_millis() / 10) as u64),
            current_point: AtomicU64::new(Self::monotonic_centisec()),
            fast_offset: AtomicU64::new(0),
        }
    }

    fn monotonic_centisec() -> u64 {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => ts.tv_sec() as u64 * 100 + ts.tv_nsec() as u64 / 10_000_000,
            Err(e) => {
                log::error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", e);
                0
            }
        }
    }

    fn virtual_now(&self) -> u64 {
        Self::monotonic_centisec() + self.fast_offset.load(Ordering::Relaxed)
    }

    /// Wall epoch anchor, in seconds.
    pub(crate) fn starttime(&self) -> u32 {
        self.starttime.load(Ordering::Relaxed)
    }

    /// Centiseconds since the anchor.
    pub(crate) fn now(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Add to the simulated clock (time compression step).
    pub(crate) fn time_fast(&self, step: u32) {
        self.fast_offset.fetch_add(step as u64, Ordering::Relaxed);
    }

    /// Replay override for the wall anchor (`t` records).
    pub(crate) fn set_starttime(&self, secs: u32) {
        self.starttime.store(secs, Ordering::Relaxed);
    }

    /// Replay override for the elapsed counter (`n` records).
    pub(crate) fn set_current(&self, centisec: u64) {
        self.current.store(centisec, Ordering::Relaxed);
    }

    /// Schedule a timeout `ticks` centiseconds from now. Non-positive
    /// delays deliver immediately.
    pub(crate) fn timeout(&self, rt: &Runtime, handle: Handle, ticks: i32, session: i32) {
        if ticks <= 0 {
            deliver(rt, handle, session);
            return;
        }
        let mut wheel = self.wheel.lock().unwrap();
        let expire = wheel.time.wrapping_add(ticks as u32);
        wheel.add(TimerNode {
            expire,
            handle,
            session,
        });
    }

    /// Advance the wheel to the current virtual clock reading, firing
    /// everything that expired on the way.
    pub(crate) fn update(&self, rt: &Runtime) {
        let cp = self.virtual_now();
        let last = self.current_point.load(Ordering::Relaxed);
        if cp < last {
            log::error!("monotonic clock regressed: {} -> {}, re-anchoring", last, cp);
            self.current_point.store(cp, Ordering::Relaxed);
        } else if cp != last {
            let diff = cp - last;
            self.current_point.store(cp, Ordering::Relaxed);
            self.current.fetch_add(diff, Ordering::Relaxed);
            let mut fired = Vec::new();
            {
                let mut wheel = self.wheel.lock().unwrap();
                for _ in 0..diff {
                    wheel.expired(&mut fired);
                    wheel.shift();
                    wheel.expired(&mut fired);
                }
            }
            for node in fired {
                deliver(rt, node.handle, node.session);
            }
        }
    }
}

fn deliver(rt: &Runtime, handle: Handle, session: i32) {
    rt.post(
        handle,
        Message {
            source: 0,
            session,
            kind: MessageKind::Response,
            data: Vec::new(),
        },
    );
}
