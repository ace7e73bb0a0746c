//! The socket subsystem: a poll-loop server bridging TCP readiness into
//! service inboxes.
//!
//! The poll thread blocks in `poll(2)` over every registered socket plus a
//! self-pipe; other threads enqueue commands and write one byte into the
//! pipe to wake it. Events are delivered to the owning service as
//! `Socket`-kind messages carrying an encoded [`SocketEvent`].
//!
//! `poll` returns the scheduler contract: `0` the poller has shut down,
//! `< 0` nothing was delivered (transient), `> 0` at least one event
//! message was queued.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};

use crate::handle::Handle;
use crate::mq::{Message, MessageKind};
use crate::runtime::Runtime;

pub type SocketId = u32;

/// What a `Socket`-kind message means, decoded from its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A `listen` or `connect` registration completed.
    Opened { id: SocketId, peer: String },
    /// A listener produced a new connection.
    Accepted {
        listen_id: SocketId,
        id: SocketId,
        peer: String,
    },
    /// Inbound bytes.
    Data { id: SocketId, data: Vec<u8> },
    /// The peer closed, or a local `close` completed.
    Closed { id: SocketId },
    /// The socket failed and was dropped.
    Error { id: SocketId, reason: String },
}

impl SocketEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            SocketEvent::Opened { id, peer } => {
                out.write_u8(0).unwrap();
                out.write_u32::<LittleEndian>(*id).unwrap();
                write_bytes(&mut out, peer.as_bytes());
            }
            SocketEvent::Accepted {
                listen_id,
                id,
                peer,
            } => {
                out.write_u8(1).unwrap();
                out.write_u32::<LittleEndian>(*listen_id).unwrap();
                out.write_u32::<LittleEndian>(*id).unwrap();
                write_bytes(&mut out, peer.as_bytes());
            }
            SocketEvent::Data { id, data } => {
                out.write_u8(2).unwrap();
                out.write_u32::<LittleEndian>(*id).unwrap();
                write_bytes(&mut out, data);
            }
            SocketEvent::Closed { id } => {
                out.write_u8(3).unwrap();
                out.write_u32::<LittleEndian>(*id).unwrap();
            }
            SocketEvent::Error { id, reason } => {
                out.write_u8(4).unwrap();
                out.write_u32::<LittleEndian>(*id).unwrap();
                write_bytes(&mut out, reason.as_bytes());
            }
        }
        out
    }

    pub fn decode(mut data: &[u8]) -> Option<SocketEvent> {
        let tag = data.read_u8().ok()?;
        let id = data.read_u32::<LittleEndian>().ok()?;
        Some(match tag {
            0 => SocketEvent::Opened {
                id,
                peer: String::from_utf8(read_bytes(&mut data)?).ok()?,
            },
            1 => {
                let conn = data.read_u32::<LittleEndian>().ok()?;
                SocketEvent::Accepted {
                    listen_id: id,
                    id: conn,
                    peer: String::from_utf8(read_bytes(&mut data)?).ok()?,
                }
            }
            2 => SocketEvent::Data {
                id,
                data: read_bytes(&mut data)?,
            },
            3 => SocketEvent::Closed { id },
            4 => SocketEvent::Error {
                id,
                reason: String::from_utf8(read_bytes(&mut data)?).ok()?,
            },
            _ => return None,
        })
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
    out.extend_from_slice(bytes);
}

fn read_bytes(data: &mut &[u8]) -> Option<Vec<u8>> {
    let len = data.read_u32::<LittleEndian>().ok()? as usize;
    if data.len() < len {
        return None;
    }
    let (head, tail) = data.split_at(len);
    let out = head.to_vec();
    *data = tail;
    Some(out)
}

enum Command {
    Listen {
        owner: Handle,
        id: SocketId,
        listener: TcpListener,
    },
    Open {
        owner: Handle,
        id: SocketId,
        stream: TcpStream,
        peer: String,
    },
    Send {
        id: SocketId,
        data: Vec<u8>,
    },
    Close {
        id: SocketId,
    },
    Exit,
}

struct ListenEntry {
    owner: Handle,
    listener: TcpListener,
}

struct ConnEntry {
    owner: Handle,
    stream: TcpStream,
    wbuf: VecDeque<u8>,
}

struct Poller {
    wake_read: RawFd,
    listeners: HashMap<SocketId, ListenEntry>,
    conns: HashMap<SocketId, ConnEntry>,
}

#[derive(Clone, Copy)]
enum PollTag {
    Wake,
    Listener(SocketId),
    Conn(SocketId),
}

pub(crate) struct SocketServer {
    commands: Mutex<VecDeque<Command>>,
    wake_write: RawFd,
    poller: Mutex<Poller>,
    next_id: AtomicU32,
    pinned: Mutex<VecDeque<u32>>,
    /// Connections with unflushed write buffers, maintained by the poll
    /// thread so `updatetime` can nudge without taking the poller lock.
    pending_writes: AtomicUsize,
    exited: AtomicBool,
}

impl SocketServer {
    pub(crate) fn new() -> std::io::Result<SocketServer> {
        let (wake_read, wake_write) = nix::unistd::pipe().map_err(nix_io)?;
        fcntl(wake_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(nix_io)?;
        fcntl(wake_write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(nix_io)?;
        Ok(SocketServer {
            commands: Mutex::new(VecDeque::new()),
            wake_write,
            poller: Mutex::new(Poller {
                wake_read,
                listeners: HashMap::new(),
                conns: HashMap::new(),
            }),
            next_id: AtomicU32::new(1),
            pinned: Mutex::new(VecDeque::new()),
            pending_writes: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
        })
    }

    fn alloc_id(&self, rt: &Runtime) -> SocketId {
        if let Some(id) = self.pinned.lock().unwrap().pop_front() {
            return id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        rt.record_socket_id(id);
        id
    }

    /// Replay override for the next socket id (`k` records).
    pub(crate) fn pin_id(&self, id: u32) {
        self.pinned.lock().unwrap().push_back(id);
    }

    fn wake(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = nix::unistd::write(self.wake_write, &[0u8]);
    }

    fn command(&self, cmd: Command) {
        self.commands.lock().unwrap().push_back(cmd);
        self.wake();
    }

    /// Bind a listener and hand it to the poll thread. The bound address
    /// comes back synchronously so callers can listen on port 0.
    pub(crate) fn listen(
        &self,
        rt: &Runtime,
        owner: Handle,
        addr: &str,
    ) -> std::io::Result<(SocketId, SocketAddr)> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let id = self.alloc_id(rt);
        self.command(Command::Listen {
            owner,
            id,
            listener,
        });
        Ok((id, local))
    }

    pub(crate) fn connect(
        &self,
        rt: &Runtime,
        owner: Handle,
        addr: &str,
    ) -> std::io::Result<SocketId> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?.to_string();
        stream.set_nonblocking(true)?;
        let id = self.alloc_id(rt);
        self.command(Command::Open {
            owner,
            id,
            stream,
            peer,
        });
        Ok(id)
    }

    pub(crate) fn send(&self, id: SocketId, data: Vec<u8>) {
        self.command(Command::Send { id, data });
    }

    pub(crate) fn close(&self, id: SocketId) {
        self.command(Command::Close { id });
    }

    /// Unblock the poll thread permanently. Idempotent.
    pub(crate) fn exit(&self) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            self.command(Command::Exit);
        }
    }

    /// Timer-thread hook: if any connection still has buffered output,
    /// make sure the poll thread is awake to flush it.
    pub(crate) fn updatetime(&self, _rt: &Runtime) {
        if self.pending_writes.load(Ordering::Relaxed) > 0 {
            self.wake();
        }
    }

    /// One blocking poll cycle, run from the socket thread.
    pub(crate) fn poll(&self, rt: &Runtime) -> i32 {
        let mut poller = self.poller.lock().unwrap();

        let mut fds = Vec::with_capacity(1 + poller.listeners.len() + poller.conns.len());
        let mut tags = Vec::with_capacity(fds.capacity());
        fds.push(PollFd::new(poller.wake_read, PollFlags::POLLIN));
        tags.push(PollTag::Wake);
        for (id, entry) in &poller.listeners {
            fds.push(PollFd::new(entry.listener.as_raw_fd(), PollFlags::POLLIN));
            tags.push(PollTag::Listener(*id));
        }
        for (id, entry) in &poller.conns {
            let mut flags = PollFlags::POLLIN;
            if !entry.wbuf.is_empty() {
                flags |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(entry.stream.as_raw_fd(), flags));
            tags.push(PollTag::Conn(*id));
        }

        match poll(&mut fds, -1) {
            Err(nix::errno::Errno::EINTR) => return -1,
            Err(e) => {
                log::error!("poll failed: {}", e);
                return -1;
            }
            Ok(_) => {}
        }

        let ready: Vec<(PollTag, PollFlags)> = fds
            .iter()
            .zip(tags.iter())
            .filter_map(|(fd, tag)| {
                let revents = fd.revents().unwrap_or(PollFlags::empty());
                (!revents.is_empty()).then_some((*tag, revents))
            })
            .collect();
        drop(fds);

        let mut events = 0;

        for (tag, revents) in ready {
            match tag {
                PollTag::Wake => {
                    let mut sink = [0u8; 64];
                    while matches!(nix::unistd::read(poller.wake_read, &mut sink), Ok(n) if n > 0) {}
                }
                PollTag::Listener(id) => {
                    events += self.accept_ready(rt, &mut poller, id);
                }
                PollTag::Conn(id) => {
                    events += self.conn_ready(rt, &mut poller, id, revents);
                }
            }
        }

        // Commands ride on the wake pipe, but drain them unconditionally:
        // a command enqueued while poll was already returning has no byte
        // of its own.
        let commands: Vec<Command> = self.commands.lock().unwrap().drain(..).collect();
        for cmd in commands {
            match cmd {
                Command::Exit => {
                    self.pending_writes.store(0, Ordering::Relaxed);
                    return 0;
                }
                Command::Listen {
                    owner,
                    id,
                    listener,
                } => {
                    let peer = listener
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    poller.listeners.insert(id, ListenEntry { owner, listener });
                    deliver(rt, owner, SocketEvent::Opened { id, peer });
                    events += 1;
                }
                Command::Open {
                    owner,
                    id,
                    stream,
                    peer,
                } => {
                    poller.conns.insert(
                        id,
                        ConnEntry {
                            owner,
                            stream,
                            wbuf: VecDeque::new(),
                        },
                    );
                    deliver(rt, owner, SocketEvent::Opened { id, peer });
                    events += 1;
                }
                Command::Send { id, data } => {
                    match poller.conns.get_mut(&id) {
                        Some(entry) => entry.wbuf.extend(data),
                        None => {
                            log::error!("send to unknown socket {}", id);
                            continue;
                        }
                    }
                    events += flush_conn(rt, &mut poller, id);
                }
                Command::Close { id } => {
                    if poller.listeners.remove(&id).is_some() {
                        continue;
                    }
                    if let Some(entry) = poller.conns.remove(&id) {
                        deliver(rt, entry.owner, SocketEvent::Closed { id });
                        events += 1;
                    }
                }
            }
        }

        let pending = poller.conns.values().filter(|c| !c.wbuf.is_empty()).count();
        self.pending_writes.store(pending, Ordering::Relaxed);

        if events > 0 {
            events
        } else {
            -1
        }
    }

    fn accept_ready(&self, rt: &Runtime, poller: &mut Poller, listen_id: SocketId) -> i32 {
        let mut events = 0;
        loop {
            let accepted = match poller.listeners.get(&listen_id) {
                Some(entry) => entry.listener.accept(),
                None => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::error!("accepted socket setup failed: {}", e);
                        continue;
                    }
                    let owner = poller.listeners[&listen_id].owner;
                    let id = self.alloc_id(rt);
                    poller.conns.insert(
                        id,
                        ConnEntry {
                            owner,
                            stream,
                            wbuf: VecDeque::new(),
                        },
                    );
                    deliver(
                        rt,
                        owner,
                        SocketEvent::Accepted {
                            listen_id,
                            id,
                            peer: peer.to_string(),
                        },
                    );
                    events += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("accept on socket {} failed: {}", listen_id, e);
                    break;
                }
            }
        }
        events
    }

    fn conn_ready(
        &self,
        rt: &Runtime,
        poller: &mut Poller,
        id: SocketId,
        revents: PollFlags,
    ) -> i32 {
        let mut events = 0;
        if revents.intersects(PollFlags::POLLOUT) {
            events += flush_conn(rt, poller, id);
        }
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            let mut buf = [0u8; 4096];
            loop {
                let entry = match poller.conns.get_mut(&id) {
                    Some(entry) => entry,
                    None => break,
                };
                match entry.stream.read(&mut buf) {
                    Ok(0) => {
                        let owner = entry.owner;
                        poller.conns.remove(&id);
                        deliver(rt, owner, SocketEvent::Closed { id });
                        events += 1;
                        break;
                    }
                    Ok(n) => {
                        deliver(
                            rt,
                            entry.owner,
                            SocketEvent::Data {
                                id,
                                data: buf[..n].to_vec(),
                            },
                        );
                        events += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let owner = entry.owner;
                        poller.conns.remove(&id);
                        deliver(
                            rt,
                            owner,
                            SocketEvent::Error {
                                id,
                                reason: e.to_string(),
                            },
                        );
                        events += 1;
                        break;
                    }
                }
            }
        }
        events
    }

    /// Release every socket. Runs after the poll thread has exited.
    pub(crate) fn free(&self) {
        let mut poller = self.poller.lock().unwrap();
        poller.listeners.clear();
        poller.conns.clear();
    }
}

fn flush_conn(rt: &Runtime, poller: &mut Poller, id: SocketId) -> i32 {
    let entry = match poller.conns.get_mut(&id) {
        Some(entry) => entry,
        None => return 0,
    };
    while !entry.wbuf.is_empty() {
        let (head, _) = entry.wbuf.as_slices();
        match entry.stream.write(head) {
            Ok(n) => {
                entry.wbuf.drain(..n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let owner = entry.owner;
                poller.conns.remove(&id);
                deliver(
                    rt,
                    owner,
                    SocketEvent::Error {
                        id,
                        reason: e.to_string(),
                    },
                );
                return 1;
            }
        }
    }
    0
}

fn deliver(rt: &Runtime, owner: Handle, event: SocketEvent) {
    rt.post(
        owner,
        Message {
            source: 0,
            session: 0,
            kind: MessageKind::Socket,
            data: event.encode(),
        },
    );
}

fn nix_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let wake_read = self.poller.lock().unwrap().wake_read;
        let _ = nix::unistd::close(self.wake_write);
        let _ = nix::unistd::close(wake_read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_survive_the_wire_encoding() {
        let event = SocketEvent::Accepted {
            listen_id: 3,
            id: 9,
            peer: "127.0.0.1:4000".to_string(),
        };
        assert_eq!(SocketEvent::decode(&event.encode()), Some(event));
    }

    #[test]
    fn truncated_payload_decodes_to_none() {
        let encoded = SocketEvent::Data {
            id: 1,
            data: vec![1, 2, 3, 4],
        }
        .encode();
        assert_eq!(SocketEvent::decode(&encoded[..encoded.len() - 2]), None);
    }
}
