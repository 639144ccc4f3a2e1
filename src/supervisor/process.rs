use super::SupervisorError;
use crate::config::DeviceConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Handle on a spawned driver process.
pub trait ProcessHandle: Send {
    fn is_running(&mut self) -> bool;

    /// Ask the process to stop. Does not wait.
    fn terminate(&mut self);

    fn id(&self) -> Option<u32>;
}

/// Starts driver processes.
pub trait DriverLauncher: Send + Sync {
    fn launch(&self, config: &DeviceConfig) -> Result<Box<dyn ProcessHandle>, SupervisorError>;
}

pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ProcessHandle for ChildProcess {
    fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("process {:?} exited with {}", self.child.id(), status);
                false
            }
            Err(e) => {
                warn!("unable to query process state: {}", e);
                false
            }
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("unable to terminate process {:?}: {}", self.child.id(), e);
        }
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Re-executes the payload binary in driver mode, one process per device.
pub struct ProcessLauncher {
    executable: PathBuf,
    config_path: PathBuf,
    output_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: PathBuf, config_path: &Path, output_dir: &Path) -> Self {
        Self {
            executable,
            config_path: config_path.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Launcher for the binary that is currently running.
    pub fn current(config_path: &Path, output_dir: &Path) -> Result<Self, SupervisorError> {
        let executable = std::env::current_exe().map_err(SupervisorError::Io)?;
        Ok(Self::new(executable, config_path, output_dir))
    }

    pub fn command_for(&self, config: &DeviceConfig) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("driver")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--output")
            .arg(&self.output_dir)
            .arg("--pretty-id")
            .arg(config.pretty_id.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl DriverLauncher for ProcessLauncher {
    fn launch(&self, config: &DeviceConfig) -> Result<Box<dyn ProcessHandle>, SupervisorError> {
        let child = self
            .command_for(config)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: config.pretty_id.to_string(),
                source,
            })?;
        info!("spawned {} as process {:?}", config.pretty_id, child.id());
        Ok(Box::new(ChildProcess::new(child)))
    }
}
