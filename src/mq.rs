//! Service inboxes and the global ready set.
//!
//! Every service owns one `Inbox`; an inbox with at least one pending
//! message is a member of the `ReadySet`, from which worker threads pull
//! work. Membership is tracked with a latch under the inbox lock, so an
//! inbox is in the ready set at most once no matter how many producers
//! push into it concurrently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::handle::Handle;

/// Message inbox length at which the first overload warning fires; the
/// threshold doubles each time it is crossed.
const OVERLOAD_THRESHOLD: usize = 1024;

/// What a message means to its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Plain text addressed to a service (the logger sinks these).
    Text,
    /// Reply to an earlier request, correlated by session.
    Response,
    /// Runtime-internal control traffic (e.g. the SIGHUP log-reopen nudge).
    System,
    /// An encoded [`crate::socket::SocketEvent`].
    Socket,
    /// The destination of a request died before answering.
    Error,
}

impl MessageKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            MessageKind::Text => 0,
            MessageKind::Response => 1,
            MessageKind::System => 2,
            MessageKind::Socket => 3,
            MessageKind::Error => 4,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<MessageKind> {
        Some(match v {
            0 => MessageKind::Text,
            1 => MessageKind::Response,
            2 => MessageKind::System,
            3 => MessageKind::Socket,
            4 => MessageKind::Error,
            _ => return None,
        })
    }
}

/// One unit of work for a service.
#[derive(Debug)]
pub struct Message {
    /// Handle of the sender; 0 for runtime-originated messages.
    pub source: Handle,
    /// Request correlation id; 0 when no reply is expected.
    pub session: i32,
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

struct InboxInner {
    queue: VecDeque<Message>,
    /// True while this inbox is enqueued in (or checked out of) the ready set.
    in_ready: bool,
    released: bool,
    overload_threshold: usize,
}

/// FIFO of messages owned by one service.
pub(crate) struct Inbox {
    handle: Handle,
    inner: Mutex<InboxInner>,
}

impl Inbox {
    pub(crate) fn new(handle: Handle) -> Arc<Inbox> {
        Arc::new(Inbox {
            handle,
            inner: Mutex::new(InboxInner {
                queue: VecDeque::new(),
                in_ready: false,
                released: false,
                overload_threshold: OVERLOAD_THRESHOLD,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Append a message, entering the ready set if not already a member.
    pub(crate) fn push(self: &Arc<Self>, msg: Message, ready: &ReadySet) {
        let mut q = self.inner.lock().unwrap();
        q.queue.push_back(msg);
        if !q.in_ready {
            q.in_ready = true;
            ready.push(self.clone());
        }
    }

    /// Take the oldest message. Returning `None` clears the ready latch, so
    /// the caller must drop its reference and pick another inbox.
    pub(crate) fn pop(&self) -> Option<Message> {
        let mut q = self.inner.lock().unwrap();
        match q.queue.pop_front() {
            Some(m) => Some(m),
            None => {
                q.in_ready = false;
                None
            }
        }
    }

    /// The owning service has been retired; pending and future messages
    /// are bounced by `drain_released`.
    pub(crate) fn mark_released(&self) {
        self.inner.lock().unwrap().released = true;
    }

    pub(crate) fn is_released(&self) -> bool {
        self.inner.lock().unwrap().released
    }

    /// Report the queue length once per doubling of the overload threshold.
    pub(crate) fn check_overload(&self) -> Option<usize> {
        let mut q = self.inner.lock().unwrap();
        let len = q.queue.len();
        if len > q.overload_threshold {
            while len > q.overload_threshold {
                q.overload_threshold *= 2;
            }
            Some(len)
        } else {
            None
        }
    }
}

/// The set of inboxes with work pending, in pickup order.
pub(crate) struct ReadySet {
    inner: Mutex<VecDeque<Arc<Inbox>>>,
}

impl ReadySet {
    pub(crate) fn new() -> ReadySet {
        ReadySet {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, inbox: Arc<Inbox>) {
        self.inner.lock().unwrap().push_back(inbox);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Inbox>> {
        self.inner.lock().unwrap().pop_front()
    }
}
