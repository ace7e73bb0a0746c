//! The built-in logger service.
//!
//! Sinks `Text` messages other services address to it, one line per
//! message, prefixed with the sender's handle. A `System` message makes it
//! reopen its file, which is how SIGHUP-driven log rotation reaches it
//! (see the timer thread). With no file configured it writes to stderr.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::ServiceContext;
use crate::error::Error;
use crate::mq::{Message, MessageKind};
use crate::runtime::Runtime;
use crate::service::Service;

pub(crate) struct LoggerService {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl LoggerService {
    /// `args` is the log file path; empty means stderr.
    pub(crate) fn new(args: &str) -> Result<LoggerService, Error> {
        let path = (!args.is_empty()).then(|| PathBuf::from(args));
        let file = match &path {
            Some(p) => Some(open_log(p)?),
            None => None,
        };
        Ok(LoggerService { path, file })
    }

    fn write_line(&mut self, source: u32, line: &str) {
        match &mut self.file {
            Some(file) => {
                if writeln!(file, "[:{:08x}] {}", source, line).is_err() {
                    eprintln!("[:{:08x}] {}", source, line);
                }
            }
            None => eprintln!("[:{:08x}] {}", source, line),
        }
    }
}

fn open_log(path: &PathBuf) -> Result<File, Error> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

impl Service for LoggerService {
    fn message(&mut self, _rt: &Arc<Runtime>, _ctx: &ServiceContext, msg: Message) {
        match msg.kind {
            MessageKind::Text => {
                let line = String::from_utf8_lossy(&msg.data);
                self.write_line(msg.source, &line);
            }
            MessageKind::System => {
                if let Some(path) = self.path.clone() {
                    match open_log(&path) {
                        Ok(file) => {
                            self.file = Some(file);
                            log::info!("log file {} reopened", path.display());
                        }
                        Err(e) => log::error!("reopen {} failed: {}", path.display(), e),
                    }
                }
            }
            _ => {}
        }
    }
}
