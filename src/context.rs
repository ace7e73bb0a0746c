//! Service context records and the dispatch turn.
//!
//! A context bundles a service's handle, inbox, boxed callback and session
//! counter. `dispatch` is one worker turn: pull a ready inbox, run a batch
//! of messages against its service, hand the inbox back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::handle::Handle;
use crate::monitor::Probe;
use crate::mq::{Inbox, Message, MessageKind};
use crate::runtime::Runtime;
use crate::service::Service;

pub struct ServiceContext {
    handle: Handle,
    name: String,
    inbox: Arc<Inbox>,
    service: Mutex<Box<dyn Service>>,
    session: AtomicI32,
    /// Sessions pinned by a replay driver, consumed before fresh ones.
    pinned_sessions: Mutex<VecDeque<i32>>,
    /// Accumulated callback time in microseconds, when profiling is on.
    cpu: AtomicU64,
}

impl ServiceContext {
    pub(crate) fn new(handle: Handle, name: &str, service: Box<dyn Service>) -> Arc<ServiceContext> {
        Arc::new(ServiceContext {
            handle,
            name: name.to_string(),
            inbox: Inbox::new(handle),
            service: Mutex::new(service),
            session: AtomicI32::new(0),
            pinned_sessions: Mutex::new(VecDeque::new()),
            cpu: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The service-type name this context was built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// Callback time burned by this service so far, in microseconds.
    /// Always zero unless the runtime was started with profiling enabled.
    pub fn cpu_micros(&self) -> u64 {
        self.cpu.load(Ordering::Relaxed)
    }

    /// Allocate a session id for a new request: positive, wrapping.
    pub fn new_session(&self, rt: &Runtime) -> i32 {
        if let Some(session) = self.pinned_sessions.lock().unwrap().pop_front() {
            return session;
        }
        let mut session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if session <= 0 {
            self.session.store(1, Ordering::Relaxed);
            session = 1;
        }
        rt.record_session(self.handle, session);
        session
    }

    /// Replay override for the next session id (`s` records).
    pub(crate) fn pin_session(&self, session: i32) {
        self.pinned_sessions.lock().unwrap().push_back(session);
    }

    pub(crate) fn invoke(&self, rt: &Arc<Runtime>, msg: Message) {
        let mut service = self.service.lock().unwrap();
        if rt.profile_enabled() {
            let begun = Instant::now();
            service.message(rt, self, msg);
            self.cpu
                .fetch_add(begun.elapsed().as_micros() as u64, Ordering::Relaxed);
        } else {
            service.message(rt, self, msg);
        }
    }
}

/// Run one dispatch turn for a worker.
///
/// Returns the inbox the worker should continue on, or `None` when no work
/// is ready (the caller then enters the sleep protocol). Safe to call at
/// any time: an empty ready set simply yields `None` again.
pub(crate) fn dispatch(
    rt: &Arc<Runtime>,
    probe: &Probe,
    inbox: Option<Arc<Inbox>>,
    weight: i32,
) -> Option<Arc<Inbox>> {
    let inbox = match inbox {
        Some(inbox) => inbox,
        None => rt.ready().pop()?,
    };
    let handle = inbox.handle();

    let ctx = match rt.handles().grab(handle) {
        Some(ctx) => ctx,
        None => {
            // The service died while its inbox was queued: bounce pending
            // requests back at their senders and move on.
            drain_released(rt, &inbox);
            return rt.ready().pop();
        }
    };

    let batch = if weight < 0 { 1 } else { 1usize << weight };
    for _ in 0..batch {
        let msg = match inbox.pop() {
            Some(msg) => msg,
            None => return rt.ready().pop(),
        };
        if let Some(len) = inbox.check_overload() {
            log::error!("service {:08x} may overload, inbox length = {}", handle, len);
        }
        rt.record_dispatch(handle, &msg);
        probe.trigger(msg.source, handle);
        ctx.invoke(rt, msg);
        probe.trigger(0, 0);
    }

    match rt.ready().pop() {
        Some(next) => {
            // Others are waiting: requeue this inbox behind them.
            rt.ready().push(inbox);
            Some(next)
        }
        // Ready set drained: keep the inbox so the next turn pops from it
        // directly.
        None => Some(inbox),
    }
}

/// Dispatch every pending message of one context inline, on the calling
/// thread. Used to flush the logger before reporting a fatal startup error.
pub(crate) fn dispatch_all(rt: &Arc<Runtime>, ctx: &ServiceContext) {
    while let Some(msg) = ctx.inbox().pop() {
        ctx.invoke(rt, msg);
    }
}

fn drain_released(rt: &Runtime, inbox: &Inbox) {
    debug_assert!(inbox.is_released());
    while let Some(msg) = inbox.pop() {
        if msg.session > 0 && msg.source != 0 {
            rt.post(
                msg.source,
                Message {
                    source: inbox.handle(),
                    session: msg.session,
                    kind: MessageKind::Error,
                    data: Vec::new(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Service for Counting {
        fn message(&mut self, _rt: &Arc<Runtime>, _ctx: &ServiceContext, _msg: Message) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime_with_counting() -> (Arc<Runtime>, crate::handle::Handle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = calls.clone();
        let mut config = Config::new();
        config.register("counting", move |_rt, _args| {
            Ok(Box::new(Counting {
                calls: calls_in_factory.clone(),
            }))
        });
        let rt = Runtime::new(&mut config).unwrap();
        let handle = rt.spawn_service("counting", "").unwrap();
        (rt, handle, calls)
    }

    fn fill(rt: &Runtime, handle: crate::handle::Handle, n: usize) {
        for i in 0..n {
            rt.post(
                handle,
                Message {
                    source: 0,
                    session: i as i32 + 1,
                    kind: MessageKind::Text,
                    data: Vec::new(),
                },
            );
        }
    }

    #[test]
    fn batch_size_follows_the_weight_contract() {
        let (rt, handle, calls) = runtime_with_counting();
        let probe = Probe::new();
        fill(&rt, handle, 64);

        // Weight 3: one turn consumes 2^3 messages.
        let inbox = dispatch(&rt, &probe, None, 3);
        assert!(inbox.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 8);

        // Negative weight: exactly one message per turn.
        let inbox = dispatch(&rt, &probe, inbox, -1);
        assert!(inbox.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 9);

        // Weight 0: 2^0, still one message.
        let inbox = dispatch(&rt, &probe, inbox, 0);
        assert!(inbox.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn empty_ready_set_yields_no_turn() {
        let (rt, _handle, calls) = runtime_with_counting();
        let probe = Probe::new();
        assert!(dispatch(&rt, &probe, None, 0).is_none());
        // Idempotent when idle: calling again is harmless.
        assert!(dispatch(&rt, &probe, None, 0).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drained_inbox_is_handed_back_for_the_next_turn() {
        let (rt, handle, calls) = runtime_with_counting();
        let probe = Probe::new();
        fill(&rt, handle, 4);

        // Ready set is otherwise empty, so the worked inbox comes back
        // rather than cycling through the global queue.
        let inbox = dispatch(&rt, &probe, None, 2).unwrap();
        assert_eq!(inbox.handle(), handle);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Its queue is now empty: the next turn finds nothing at all.
        assert!(dispatch(&rt, &probe, Some(inbox), 0).is_none());
    }
}
