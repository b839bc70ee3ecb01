use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::process::{Child, Command};

use super::SupervisorError;

/// Opens `<dir>/<prefix>_<YYYYmmddHHMMSS>.log` for appending, creating `dir` if needed.
pub(crate) fn open_log(dir: &Path, prefix: &str) -> Result<(PathBuf, fs::File), SupervisorError> {
    let path = dir.join(format!("{}_{}.log", prefix, Utc::now().format("%Y%m%d%H%M%S")));
    fs::create_dir_all(dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
        .map(|file| (path.clone(), file))
        .map_err(|source| SupervisorError::Log { path, source })
}

/// A spawned process that leads its own process group.
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    child: Child,
    pid: u32,
}

impl ManagedProcess {
    /// Spawns `command` as the leader of a new process group with stdout and stderr appended to
    /// `log`.
    pub(crate) fn spawn(mut command: Command, log: fs::File) -> Result<Self, SupervisorError> {
        let program = format!("{:?}", command.as_std().get_program());
        let stdout = log.try_clone().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(log))
            .process_group(0)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program,
            source: std::io::Error::new(std::io::ErrorKind::Other, "process exited on spawn"),
        })?;
        Ok(Self { child, pid })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Signals the whole process group. A group that is already gone counts as stopped.
    fn terminate(self) -> Result<(), SupervisorError> {
        let pgid = self.pid as i32;
        match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal { pgid, source }),
        }
        // dropping the child leaves reaping to the runtime
    }
}

enum SlotState {
    Idle,
    Running(ManagedProcess),
}

/// Holds zero or one [`ManagedProcess`] of a given role.
pub(crate) struct ProcessSlot {
    role: &'static str,
    state: Mutex<SlotState>,
}

impl ProcessSlot {
    pub(crate) fn new(role: &'static str) -> Self {
        Self {
            role,
            state: Mutex::new(SlotState::Idle),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes ownership of `process`. A process still owned by the slot is terminated first.
    pub(crate) fn install(&self, process: ManagedProcess) -> Result<(), SupervisorError> {
        let previous = std::mem::replace(&mut *self.state(), SlotState::Running(process));
        if let SlotState::Running(previous) = previous {
            warn!(role = self.role, pid = previous.pid(), "replacing a running process");
            previous.terminate()?;
        }
        Ok(())
    }

    /// Terminates the owned process, if any.
    pub(crate) fn stop(&self) -> Result<(), SupervisorError> {
        match std::mem::replace(&mut *self.state(), SlotState::Idle) {
            SlotState::Running(process) => {
                info!(role = self.role, pid = process.pid(), "stopping process group");
                process.terminate()
            }
            SlotState::Idle => {
                debug!(role = self.role, "no process to stop");
                Ok(())
            }
        }
    }

    /// Whether the owned process is still alive. An exited process is released.
    pub(crate) fn is_running(&self) -> bool {
        let mut state = self.state();
        let exited = match &mut *state {
            SlotState::Running(process) => process.has_exited(),
            SlotState::Idle => return false,
        };
        if exited {
            info!(role = self.role, "process exited on its own");
            *state = SlotState::Idle;
        }
        !exited
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        match &*self.state() {
            SlotState::Running(process) => Some(process.pid()),
            SlotState::Idle => None,
        }
    }
}
