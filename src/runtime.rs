//! The runtime: every subsystem the scheduler threads and the services
//! share, behind one `Arc`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::context::ServiceContext;
use crate::error::Error;
use crate::handle::{Handle, HandleRegistry, HANDLE_MASK};
use crate::harbor::Harbor;
use crate::mq::{Message, MessageKind, ReadySet};
use crate::record::Recorder;
use crate::scheduler::FastGate;
use crate::service::Registry;
use crate::socket::{SocketId, SocketServer};
use crate::timer::Timer;

pub struct Runtime {
    handles: HandleRegistry,
    ready: ReadySet,
    timer: Timer,
    socket: SocketServer,
    registry: Registry,
    recorder: Recorder,
    harbor: Harbor,
    gate: FastGate,
    rng: Mutex<StdRng>,
    /// The seed behind `rng`, kept so capture can replay it.
    seed: u64,
    total: AtomicUsize,
    profile: bool,
    /// True when this runtime is driven by a record file.
    replaying: bool,
    /// Handle of the service whose inbox is captured / replayed; 0 when
    /// neither is happening.
    record_handle: AtomicU32,
}

impl Runtime {
    pub(crate) fn new(config: &mut Config) -> Result<Arc<Runtime>, Error> {
        let recorder = match &config.capturefile {
            Some(path) => Recorder::create(path)?,
            None => Recorder::disabled(),
        };
        let seed: u64 = rand::random();
        // Subsystems come up in dependency order: harbor and registry
        // first, then queues, timers, sockets.
        Ok(Arc::new(Runtime {
            harbor: Harbor::new(config.harbor),
            handles: HandleRegistry::new(config.harbor),
            ready: ReadySet::new(),
            registry: std::mem::take(&mut config.registry),
            timer: Timer::new(),
            socket: SocketServer::new()?,
            recorder,
            gate: FastGate::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            seed,
            total: AtomicUsize::new(0),
            profile: config.profile,
            replaying: config.recordfile.is_some(),
            record_handle: AtomicU32::new(0),
        }))
    }

    pub(crate) fn handles(&self) -> &HandleRegistry {
        &self.handles
    }

    pub(crate) fn ready(&self) -> &ReadySet {
        &self.ready
    }

    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn socket(&self) -> &SocketServer {
        &self.socket
    }

    pub(crate) fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub(crate) fn harbor(&self) -> &Harbor {
        &self.harbor
    }

    pub(crate) fn gate(&self) -> &FastGate {
        &self.gate
    }

    pub(crate) fn profile_enabled(&self) -> bool {
        self.profile
    }

    /// Wall epoch anchor in centiseconds: `starttime` is seconds.
    pub(crate) fn start_time_centisec(&self) -> u64 {
        self.timer.starttime() as u64 * 100
    }

    /// Number of live services.
    pub fn context_total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Wall epoch anchor, in seconds.
    pub fn starttime(&self) -> u32 {
        self.timer.starttime()
    }

    /// Centiseconds elapsed since the anchor; advances with simulated
    /// time during compression.
    pub fn now(&self) -> u64 {
        self.timer.now()
    }

    /// Instantiate a registered service type and give it a handle.
    pub fn spawn_service(self: &Arc<Self>, name: &str, args: &str) -> Result<Handle, Error> {
        let factory = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))?;
        let service = (*factory)(self, args)?;
        let (handle, _ctx) = self
            .handles
            .register(|handle| ServiceContext::new(handle, name, service))?;
        self.recorder.handle_index(handle & HANDLE_MASK);
        self.recorder.open(handle);
        self.total.fetch_add(1, Ordering::SeqCst);
        log::info!("service {}:{:08x} launched", name, handle);
        Ok(handle)
    }

    /// Remove a service. Its inbox is drained on next pickup, answering
    /// pending requests with `Error`-kind messages.
    pub fn retire(&self, handle: Handle) -> bool {
        match self.handles.retire(handle) {
            Some(ctx) => {
                ctx.inbox().mark_released();
                self.recorder.close(handle);
                self.total.fetch_sub(1, Ordering::SeqCst);
                log::info!("service {}:{:08x} retired", ctx.name(), handle);
                true
            }
            None => false,
        }
    }

    /// Retire every live service; the runtime shuts down once the timer
    /// thread notices nothing is left.
    pub fn retire_all(&self) {
        for handle in self.handles.all_handles() {
            self.retire(handle);
        }
    }

    /// Resolve a well-known service name.
    pub fn find_service(&self, name: &str) -> Option<Handle> {
        self.handles.findname(name)
    }

    /// Bind a well-known name to a service. Fails if the name is taken.
    pub fn name_service(&self, handle: Handle, name: &str) -> bool {
        self.handles.namehandle(handle, name)
    }

    /// Look up a live service's context record.
    pub fn context(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        self.handles.grab(handle)
    }

    /// Enqueue a message into a service's inbox. Returns false when the
    /// destination does not exist (or is remote, which has no transport
    /// here).
    ///
    /// Sleeping workers are not signalled directly: the timer thread is
    /// the pacemaker that rouses the pool, within two of its ticks.
    pub fn post(&self, handle: Handle, msg: Message) -> bool {
        if self.harbor.is_remote(handle) {
            self.harbor.count_dropped();
            log::error!("dropping message for remote service {:08x}: no transport", handle);
            return false;
        }
        if self.replaying && handle == self.record_handle.load(Ordering::Relaxed) {
            // Under replay the recorded service hears only the file;
            // organically regenerated traffic would double-deliver.
            return false;
        }
        self.post_raw(handle, msg)
    }

    /// Replay-driver injection path: bypasses the replay suppression.
    pub(crate) fn post_replay(&self, handle: Handle, msg: Message) -> bool {
        self.post_raw(handle, msg)
    }

    fn post_raw(&self, handle: Handle, msg: Message) -> bool {
        match self.handles.grab(handle) {
            Some(ctx) => {
                ctx.inbox().push(msg, &self.ready);
                true
            }
            None => false,
        }
    }

    pub fn send(
        &self,
        source: Handle,
        dest: Handle,
        kind: MessageKind,
        session: i32,
        data: Vec<u8>,
    ) -> bool {
        self.post(
            dest,
            Message {
                source,
                session,
                kind,
                data,
            },
        )
    }

    /// Deliver a `Response` with this session to `handle` after `ticks`
    /// centiseconds; non-positive delays deliver immediately.
    pub fn timeout(&self, handle: Handle, ticks: i32, session: i32) {
        self.timer.timeout(self, handle, ticks, session);
    }

    /// Draw from the runtime's deterministic RNG stream.
    pub fn random(&self) -> u64 {
        self.rng.lock().unwrap().gen()
    }

    pub(crate) fn reseed(&self, seed: u64) {
        *self.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    /// Request time compression: run the simulated clock forward to
    /// `fast_time` (an epoch in centiseconds) in steps of at most
    /// `once_add`. Returns the accepted target, or 0 when rejected.
    pub fn request_fast_time(&self, fast_time: u64, once_add: u32) -> u64 {
        let mut gate = self.gate.state.lock().unwrap();
        let now_time = self.start_time_centisec() + self.timer.now();
        if fast_time <= now_time || once_add == 0 {
            log::error!(
                "fast time must lie ahead with a positive step: now = {}, target = {}, step = {}",
                now_time,
                fast_time,
                once_add
            );
            return 0;
        }
        gate.fast_time = fast_time;
        gate.once_add = once_add;
        fast_time
    }

    // Socket operations, service-facing.

    pub fn listen(&self, owner: Handle, addr: &str) -> std::io::Result<(SocketId, SocketAddr)> {
        self.socket.listen(self, owner, addr)
    }

    pub fn connect(&self, owner: Handle, addr: &str) -> std::io::Result<SocketId> {
        self.socket.connect(self, owner, addr)
    }

    pub fn socket_send(&self, id: SocketId, data: Vec<u8>) {
        self.socket.send(id, data);
    }

    pub fn socket_close(&self, id: SocketId) {
        self.socket.close(id);
    }

    // Capture hooks.

    pub(crate) fn record_bootstrap(&self, handle: Handle, cmdline: &str) {
        if !self.recorder.is_capturing() {
            return;
        }
        self.recorder
            .preamble(self.seed, self.timer.starttime(), self.timer.now());
        self.recorder.bootstrap(handle, cmdline);
        self.recorder.arm();
        self.record_handle.store(handle, Ordering::Relaxed);
    }

    pub(crate) fn set_record_handle(&self, handle: Handle) {
        self.record_handle.store(handle, Ordering::Relaxed);
    }

    pub(crate) fn record_session(&self, handle: Handle, session: i32) {
        if handle != 0 && handle == self.record_handle.load(Ordering::Relaxed) {
            self.recorder.session(session);
        }
    }

    pub(crate) fn record_dispatch(&self, handle: Handle, msg: &Message) {
        if !self.replaying && handle != 0 && handle == self.record_handle.load(Ordering::Relaxed) {
            self.recorder.message(msg);
        }
    }

    pub(crate) fn record_socket_id(&self, id: u32) {
        self.recorder.socket_id(id);
    }
}
