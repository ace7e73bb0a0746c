//! Per-worker liveness probes.
//!
//! Each worker owns one `Probe` and bumps its version around every service
//! callback; the monitor thread sweeps all probes every five seconds. A
//! version seen unchanged across two sweeps while a destination is set
//! means that worker has been inside a single callback the whole time.
//!
//! Probes are single-writer (the owning worker) / single-reader (the
//! monitor thread), so relaxed atomics are enough: a torn or stale read
//! only delays the diagnosis by one sweep.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::handle::Handle;

pub struct Probe {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

impl Probe {
    pub fn new() -> Probe {
        Probe {
            version: AtomicU32::new(0),
            check_version: AtomicU32::new(0),
            source: AtomicU32::new(0),
            destination: AtomicU32::new(0),
        }
    }

    /// Called by the owning worker immediately before a callback (with the
    /// message endpoints) and immediately after (with zeros).
    pub(crate) fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source, Ordering::Relaxed);
        self.destination.store(destination, Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    /// One monitor sweep. Purely observational: a stuck service is
    /// reported, never preempted.
    pub(crate) fn check(&self) {
        let version = self.version.load(Ordering::Relaxed);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = self.destination.load(Ordering::Relaxed);
            if destination != 0 {
                log::warn!(
                    "message from {:08x} to {:08x} may be stuck in an endless loop (version = {})",
                    self.source.load(Ordering::Relaxed),
                    destination,
                    version
                );
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn looks_stuck(&self) -> bool {
        let version = self.version.load(Ordering::Relaxed);
        version == self.check_version.load(Ordering::Relaxed)
            && self.destination.load(Ordering::Relaxed) != 0
    }
}

impl Default for Probe {
    fn default() -> Probe {
        Probe::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_probe_never_reports() {
        let p = Probe::new();
        p.check();
        assert!(!p.looks_stuck());
        p.check();
        assert!(!p.looks_stuck());
    }

    #[test]
    fn in_flight_callback_reports_on_second_sweep() {
        let p = Probe::new();
        p.trigger(0x100, 0x200); // callback begins, never returns
        p.check(); // first sweep records the version
        assert!(p.looks_stuck()); // second sweep would report
    }

    #[test]
    fn completed_callback_is_clean() {
        let p = Probe::new();
        p.trigger(0x100, 0x200);
        p.trigger(0, 0); // callback returned
        p.check();
        p.check();
        assert!(!p.looks_stuck());
    }
}
