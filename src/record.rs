//! The session record codec: capture on one side, replay parsing on the
//! other.
//!
//! A record file is a newline-terminated version string followed by tagged
//! records. One logical *step* is a `b`/`m`/`a` record plus every
//! deterministic-state record (`s h k r t n`) trailing it; the replay
//! driver in the scheduler assembles steps and paces the worker pool
//! between them. Fixed-width fields are little-endian; the `b` payload is
//! a length (which counts the 8 handle-hex bytes), the handle as 8 hex
//! characters, then the bootstrap command line.
//!
//! Capture starts writing deterministic-state records only once the
//! bootstrap service exists: everything before that (the logger, most
//! prominently) is recreated by the replaying runtime itself, not by the
//! file.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::handle::Handle;
use crate::mq::{Message, MessageKind};

const RECORD_VERSION: &str = "colony-record 1";

/// Capture sink. All writers are no-ops until the runtime is recording,
/// and the deterministic-state writers additionally wait for `arm`.
pub(crate) struct Recorder {
    inner: Mutex<Option<Sink>>,
}

struct Sink {
    out: BufWriter<File>,
    armed: bool,
}

impl Recorder {
    pub(crate) fn disabled() -> Recorder {
        Recorder {
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn create(path: &Path) -> Result<Recorder, Error> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{}", RECORD_VERSION)?;
        Ok(Recorder {
            inner: Mutex::new(Some(Sink { out, armed: false })),
        })
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Run `write` against the sink; a failed write disables capture for
    /// good rather than corrupting the stream.
    fn with_sink<F>(&self, armed_only: bool, write: F)
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        let result = match inner.as_mut() {
            Some(sink) if !armed_only || sink.armed => write(&mut sink.out),
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::error!("session capture failed, disabling: {}", e);
            *inner = None;
        }
    }

    /// Seed, wall anchor and elapsed clock, written just before `b` so the
    /// replaying runtime starts the bootstrap service under the recorded
    /// deterministic state.
    pub(crate) fn preamble(&self, seed: u64, starttime: u32, now: u64) {
        self.with_sink(false, |out| {
            out.write_u8(b'r')?;
            out.write_u64::<LittleEndian>(seed)?;
            out.write_u8(b't')?;
            out.write_u32::<LittleEndian>(starttime)?;
            out.write_u8(b'n')?;
            out.write_u64::<LittleEndian>(now)
        });
    }

    pub(crate) fn bootstrap(&self, handle: Handle, cmdline: &str) {
        self.with_sink(false, |out| {
            out.write_u8(b'b')?;
            out.write_u64::<LittleEndian>(8 + cmdline.len() as u64)?;
            write!(out, "{:08x}", handle)?;
            out.write_all(cmdline.as_bytes())
        });
    }

    /// Deterministic-state records start flowing after the bootstrap
    /// record is down.
    pub(crate) fn arm(&self) {
        if let Some(sink) = self.inner.lock().unwrap().as_mut() {
            sink.armed = true;
        }
    }

    pub(crate) fn open(&self, handle: Handle) {
        self.with_sink(true, |out| {
            out.write_u8(b'o')?;
            out.write_u32::<LittleEndian>(handle)
        });
    }

    pub(crate) fn close(&self, handle: Handle) {
        self.with_sink(true, |out| {
            out.write_u8(b'c')?;
            out.write_u32::<LittleEndian>(handle)
        });
    }

    /// A message dispatched to the recorded service. Socket events use the
    /// `a` tag, everything else `m`; the payload layout is shared.
    pub(crate) fn message(&self, msg: &Message) {
        self.with_sink(true, |out| {
            out.write_u8(if msg.kind == MessageKind::Socket {
                b'a'
            } else {
                b'm'
            })?;
            out.write_u32::<LittleEndian>(msg.source)?;
            out.write_i32::<LittleEndian>(msg.session)?;
            out.write_u8(msg.kind.to_u8())?;
            out.write_u64::<LittleEndian>(msg.data.len() as u64)?;
            out.write_all(&msg.data)
        });
    }

    pub(crate) fn session(&self, session: i32) {
        self.with_sink(true, |out| {
            out.write_u8(b's')?;
            out.write_i32::<LittleEndian>(session)
        });
    }

    pub(crate) fn handle_index(&self, index: u32) {
        self.with_sink(true, |out| {
            out.write_u8(b'h')?;
            out.write_u32::<LittleEndian>(index)
        });
    }

    pub(crate) fn socket_id(&self, id: u32) {
        self.with_sink(true, |out| {
            out.write_u8(b'k')?;
            out.write_u32::<LittleEndian>(id)
        });
    }

    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut sink) = inner.take() {
            if let Err(e) = sink.out.flush() {
                log::error!("session capture flush failed: {}", e);
            }
        }
    }
}

/// Replay-side reader: the `record_parse` family plus cursor bookkeeping
/// for the step-assembly rule and progress reporting.
pub(crate) struct Player {
    reader: BufReader<File>,
    len: u64,
    pos: u64,
}

impl Player {
    pub(crate) fn open(path: &Path) -> Result<Player, Error> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut version = String::new();
        reader.read_line(&mut version)?;
        let pos = version.len() as u64;
        if version.trim_end() != RECORD_VERSION {
            return Err(Error::Record(format!(
                "version mismatch: expected {:?}, found {:?}",
                RECORD_VERSION,
                version.trim_end()
            )));
        }
        Ok(Player { reader, len, pos })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }

    /// Read the next tag byte; `None` at end of file.
    pub(crate) fn next_tag(&mut self) -> Result<Option<u8>, Error> {
        match self.reader.read_u8() {
            Ok(tag) => {
                self.pos += 1;
                Ok(Some(tag))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Look at the next tag without consuming it.
    pub(crate) fn peek_tag(&mut self) -> Result<Option<u8>, Error> {
        match self.next_tag()? {
            Some(tag) => {
                self.unread()?;
                Ok(Some(tag))
            }
            None => Ok(None),
        }
    }

    /// Push the last tag byte back; used when a record that belongs to the
    /// next step terminates the current one.
    pub(crate) fn unread(&mut self) -> Result<(), Error> {
        self.reader.seek_relative(-1)?;
        self.pos -= 1;
        Ok(())
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, Error> {
        let v = self.reader.read_u32::<LittleEndian>()?;
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, Error> {
        let v = self.reader.read_i32::<LittleEndian>()?;
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, Error> {
        let v = self.reader.read_u64::<LittleEndian>()?;
        self.pos += 8;
        Ok(v)
    }

    /// Payload of an `o` or `c` record.
    pub(crate) fn read_handle(&mut self) -> Result<Handle, Error> {
        self.read_u32()
    }

    /// Payload of a `b` record: the recorded handle and the bootstrap
    /// command line.
    pub(crate) fn read_bootstrap(&mut self) -> Result<(Handle, String), Error> {
        let len = self.read_u64()?;
        if len < 8 {
            return Err(Error::Record(format!("bootstrap record too short ({})", len)));
        }
        let mut hex = [0u8; 8];
        self.read_exact(&mut hex)?;
        let hex = std::str::from_utf8(&hex)
            .map_err(|_| Error::Record("bootstrap handle is not hex".into()))?;
        let handle = Handle::from_str_radix(hex, 16)
            .map_err(|_| Error::Record(format!("bootstrap handle is not hex: {:?}", hex)))?;
        let mut cmdline = vec![0u8; (len - 8) as usize];
        self.read_exact(&mut cmdline)?;
        let cmdline = String::from_utf8(cmdline)
            .map_err(|_| Error::Record("bootstrap command line is not utf-8".into()))?;
        Ok((handle, cmdline))
    }

    /// Payload of an `m` or `a` record.
    pub(crate) fn read_message(&mut self) -> Result<Message, Error> {
        let source = self.read_u32()?;
        let session = self.read_i32()?;
        let kind = self.reader.read_u8()?;
        self.pos += 1;
        let kind = MessageKind::from_u8(kind)
            .ok_or_else(|| Error::Record(format!("unknown message kind {}", kind)))?;
        let len = self.read_u64()?;
        let mut data = vec![0u8; len as usize];
        self.read_exact(&mut data)?;
        Ok(Message {
            source,
            session,
            kind,
            data,
        })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        std::io::Read::read_exact(&mut self.reader, buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_file(stem: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "colony-record-{}-{}-{}",
            stem,
            std::process::id(),
            seq
        ))
    }

    #[test]
    fn capture_then_replay_one_step() {
        let path = scratch_file("step");
        let recorder = Recorder::create(&path).unwrap();
        recorder.preamble(99, 1_700_000_000, 12);
        recorder.bootstrap(0x2a, "pilot run fast");
        recorder.arm();
        recorder.message(&Message {
            source: 7,
            session: 3,
            kind: MessageKind::Text,
            data: b"ping".to_vec(),
        });
        recorder.session(4);
        recorder.finish();

        let mut player = Player::open(&path).unwrap();
        assert_eq!(player.next_tag().unwrap(), Some(b'r'));
        assert_eq!(player.read_u64().unwrap(), 99);
        assert_eq!(player.next_tag().unwrap(), Some(b't'));
        assert_eq!(player.read_u32().unwrap(), 1_700_000_000);
        assert_eq!(player.next_tag().unwrap(), Some(b'n'));
        assert_eq!(player.read_u64().unwrap(), 12);
        assert_eq!(player.next_tag().unwrap(), Some(b'b'));
        let (handle, cmdline) = player.read_bootstrap().unwrap();
        assert_eq!(handle, 0x2a);
        assert_eq!(cmdline, "pilot run fast");
        assert_eq!(player.next_tag().unwrap(), Some(b'm'));
        let msg = player.read_message().unwrap();
        assert_eq!((msg.source, msg.session), (7, 3));
        assert_eq!(msg.data, b"ping");
        assert_eq!(player.next_tag().unwrap(), Some(b's'));
        assert_eq!(player.read_i32().unwrap(), 4);
        assert_eq!(player.next_tag().unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unread_restores_the_cursor() {
        let path = scratch_file("unread");
        let recorder = Recorder::create(&path).unwrap();
        recorder.bootstrap(1, "a");
        recorder.finish();

        let mut player = Player::open(&path).unwrap();
        let before = player.pos();
        assert_eq!(player.peek_tag().unwrap(), Some(b'b'));
        assert_eq!(player.pos(), before);
        assert_eq!(player.next_tag().unwrap(), Some(b'b'));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let path = scratch_file("version");
        std::fs::write(&path, "something-else 9\n").unwrap();
        match Player::open(&path) {
            Err(Error::Record(reason)) => assert!(reason.contains("version")),
            other => panic!("expected a version error, got {:?}", other.map(|_| ())),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn disarmed_recorder_skips_state_records() {
        let path = scratch_file("disarmed");
        let recorder = Recorder::create(&path).unwrap();
        recorder.session(1); // before arm: must not reach the file
        recorder.handle_index(2);
        recorder.bootstrap(5, "x");
        recorder.finish();

        let mut player = Player::open(&path).unwrap();
        assert_eq!(player.next_tag().unwrap(), Some(b'b'));
        let _ = std::fs::remove_file(&path);
    }
}
