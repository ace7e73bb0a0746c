//! Runtime configuration.
//!
//! A plain struct the embedder fills before calling [`crate::start`];
//! parsing a config file into it is the embedder's business.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Error;
use crate::runtime::Runtime;
use crate::service::{Registry, Service};

pub struct Config {
    /// Worker thread count. Fixed for the life of the runtime.
    pub thread: usize,
    /// Harbor id for cluster addressing; 0 runs standalone.
    pub harbor: u8,
    /// Measure per-service callback time.
    pub profile: bool,
    /// Detach and write a pidfile at this path.
    pub daemon: Option<PathBuf>,
    /// Service type to launch as the logger.
    pub logservice: String,
    /// Log file handed to the logger service; `None` logs to stderr.
    pub logger: Option<PathBuf>,
    /// Command line of the first service: name, whitespace, argument tail.
    pub bootstrap: Option<String>,
    /// Replay a previously captured session from this file.
    pub recordfile: Option<PathBuf>,
    /// Capture this session to a file for later replay.
    pub capturefile: Option<PathBuf>,
    pub(crate) registry: Registry,
}

impl Config {
    pub fn new() -> Config {
        Config {
            thread: 8,
            harbor: 0,
            profile: false,
            daemon: None,
            logservice: "logger".to_string(),
            logger: None,
            bootstrap: None,
            recordfile: None,
            capturefile: None,
            registry: Registry::with_builtins(),
        }
    }

    /// Register a service type under `name`. The factory runs on whichever
    /// thread spawns the service.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Arc<Runtime>, &str) -> Result<Box<dyn Service>, Error> + Send + Sync + 'static,
    {
        self.registry.insert(name, factory);
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
