use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::common::error::error;
use crate::common::utils::fs::{absolute_path, write_atomic};

pub const PID_FILE: &str = "gwms.pid";
pub const FRONTEND_CONFIG_FILE: &str = "frontend.toml";
pub const FACTORY_CONFIG_FILE: &str = "factory.toml";
const STATE_DIR: &str = "state";
const STATS_FILE: &str = "stats.jsonl";

/// Working directory of one control process: configuration, pid file, persisted state.
#[derive(Clone, Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn open(directory: &Path) -> crate::Result<Self> {
        if !directory.is_dir() {
            return error(format!("{directory:?} is not a directory"));
        }
        Ok(Self {
            path: absolute_path(directory.to_path_buf()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.path
    }

    /// Resolves a configured path; relative paths are relative to the working directory.
    pub fn resolve<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.path.join(path)
    }

    pub fn frontend_config(&self) -> PathBuf {
        self.resolve(FRONTEND_CONFIG_FILE)
    }

    pub fn factory_config(&self) -> PathBuf {
        self.resolve(FACTORY_CONFIG_FILE)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(STATE_DIR)
    }

    pub fn stats_file(&self) -> PathBuf {
        self.resolve(STATS_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.resolve(PID_FILE)
    }

    /// Pid of a live process recorded in the pid file.
    pub fn running_pid(&self) -> crate::Result<Option<Pid>> {
        let content = match std::fs::read_to_string(self.pid_file()) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            log::warn!("Ignoring malformed pid file {:?}", self.pid_file());
            return Ok(None);
        };
        let pid = Pid::from_raw(pid);
        // Signal 0 only checks that the process exists
        Ok(signal::kill(pid, None).is_ok().then_some(pid))
    }

    /// Records the current process in the pid file.
    /// Returns `None` when another live process already owns the directory.
    pub fn acquire_pid_file(&self) -> crate::Result<Option<PidFileGuard>> {
        if let Some(pid) = self.running_pid()? {
            log::error!("Process {pid} is already running in {:?}", self.path);
            return Ok(None);
        }
        let path = self.pid_file();
        write_atomic(&path, format!("{}\n", std::process::id()).as_bytes(), 0o644)?;
        Ok(Some(PidFileGuard { path }))
    }

    /// Sends `signal` to the recorded process. Returns `false` if no process is running.
    pub fn signal_process(&self, signal: Signal) -> crate::Result<bool> {
        match self.running_pid()? {
            Some(pid) => {
                signal::kill(pid, signal)
                    .map_err(|e| format!("Cannot send signal {signal} to {pid}: {e:?}"))?;
                log::info!("Sent {signal} to process {pid}");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Removes the pid file when dropped.
pub struct PidFileGuard {
    path: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            log::warn!("Cannot remove pid file {:?}: {error}", self.path);
        }
    }
}
