//! Daemonization: detach from the terminal and hold an exclusive pidfile.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

use crate::error::Error;

/// Keeps the pidfile locked for the life of the runtime and removes it on
/// shutdown.
pub(crate) struct DaemonGuard {
    pidfile: PathBuf,
    _lock: File,
}

/// Lock the pidfile, detach, and record the daemon's pid. The flock is
/// taken before forking (it survives the fork, the parent's copy dies
/// with the parent), so a second instance fails fast instead of racing.
pub(crate) fn init(pidfile: &Path) -> Result<DaemonGuard, Error> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(pidfile)?;
    if flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
        let mut pid = String::new();
        let _ = file.read_to_string(&mut pid);
        return Err(Error::Daemon(format!(
            "already running as pid {} ({})",
            pid.trim(),
            pidfile.display()
        )));
    }
    nix::unistd::daemon(true, false).map_err(|e| Error::Daemon(format!("detach failed: {}", e)))?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", nix::unistd::getpid())?;
    file.flush()?;
    Ok(DaemonGuard {
        pidfile: pidfile.to_path_buf(),
        _lock: file,
    })
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pidfile);
    }
}
