//! Supervision of the external training backend.
//!
//! Two long-running processes make up the backend: the aggregation service, which coordinates
//! rounds across nodes, and the training driver, which runs one experiment against it. Each is
//! started in its own process group so stopping it takes down its whole subtree.

mod environment;
mod local;
mod process;

use std::{io, path::Path, path::PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub use self::{environment::RuntimeEnvironment, local::ProcessSupervisor};
use crate::{common::ExperimentId, settings::TlsSettings};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("the runtime environment is only supported on Linux")]
    Unsupported,
    #[error("failed to prepare the runtime environment: {0}")]
    Environment(String),
    #[error("dependency installation failed: {0}")]
    DependencyInstall(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed to open log file {}: {source}", .path.display())]
    Log { path: PathBuf, source: io::Error },
    #[error("failed to signal process group {pgid}: {source}")]
    Signal { pgid: i32, source: nix::Error },
}

/// Certificate material the aggregation service serves with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_certificate: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl From<TlsSettings> for TlsMaterial {
    fn from(
        TlsSettings {
            ca_certificate,
            certificate,
            private_key,
        }: TlsSettings,
    ) -> Self {
        Self {
            ca_certificate,
            certificate,
            private_key,
        }
    }
}

/// Owner of the aggregation service and training driver processes.
///
/// At most one process of each kind is owned at a time. Stopping a process that is not running
/// is a no-op.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Supervisor: Send + Sync + 'static {
    /// Launches the aggregation service and returns its pid.
    ///
    /// `authorized_keys` lists the public keys of the nodes allowed to connect.
    async fn start_aggregator(
        &self,
        tls: &TlsMaterial,
        authorized_keys: &Path,
    ) -> Result<u32, SupervisorError>;

    /// Installs the dependencies declared by the bundle at `bundle`, then launches the training
    /// driver against it and returns its pid.
    async fn start_training_driver(
        &self,
        bundle: &Path,
        experiment_id: ExperimentId,
        experiment_name: &str,
    ) -> Result<u32, SupervisorError>;

    /// Sends `SIGTERM` to the aggregation service's process group without waiting for it.
    fn stop_aggregator(&self) -> Result<(), SupervisorError>;

    /// Sends `SIGTERM` to the training driver's process group without waiting for it.
    fn stop_training_driver(&self) -> Result<(), SupervisorError>;

    fn aggregator_running(&self) -> bool;

    fn training_driver_running(&self) -> bool;
}
