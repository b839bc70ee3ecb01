use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;

use super::{
    process::{open_log, ManagedProcess, ProcessSlot},
    RuntimeEnvironment,
    Supervisor,
    SupervisorError,
    TlsMaterial,
};
use crate::common::ExperimentId;

/// Supervises the backend as local child processes of the controller.
pub struct ProcessSupervisor {
    environment: Arc<RuntimeEnvironment>,
    logs_dir: PathBuf,
    uploads_dir: PathBuf,
    aggregator: ProcessSlot,
    driver: ProcessSlot,
}

impl ProcessSupervisor {
    /// Aggregation service logs go to `logs_dir`, training driver logs to
    /// `<uploads_dir>/<experiment_id>/logs`.
    pub fn new(
        environment: Arc<RuntimeEnvironment>,
        logs_dir: impl Into<PathBuf>,
        uploads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            environment,
            logs_dir: logs_dir.into(),
            uploads_dir: uploads_dir.into(),
            aggregator: ProcessSlot::new("aggregator"),
            driver: ProcessSlot::new("training driver"),
        }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start_aggregator(
        &self,
        tls: &TlsMaterial,
        authorized_keys: &Path,
    ) -> Result<u32, SupervisorError> {
        let (log_path, log) = open_log(&self.logs_dir, "superlink")?;
        let binary = self
            .environment
            .binary(&self.environment.settings().aggregator_binary);
        let mut command = self.environment.command(binary);
        command
            .arg("--ssl-ca-certfile")
            .arg(&tls.ca_certificate)
            .arg("--ssl-certfile")
            .arg(&tls.certificate)
            .arg("--ssl-keyfile")
            .arg(&tls.private_key)
            .arg("--auth-list-public-keys")
            .arg(authorized_keys);

        let process = ManagedProcess::spawn(command, log)?;
        let pid = process.pid();
        self.aggregator.install(process)?;
        info!(pid, log = %log_path.display(), "aggregation service started");
        Ok(pid)
    }

    async fn start_training_driver(
        &self,
        bundle: &Path,
        experiment_id: ExperimentId,
        experiment_name: &str,
    ) -> Result<u32, SupervisorError> {
        self.environment.install_dependencies(bundle).await?;

        let logs_dir = self
            .uploads_dir
            .join(experiment_id.to_string())
            .join("logs");
        let (log_path, log) = open_log(&logs_dir, "flwr")?;
        let binary = self
            .environment
            .binary(&self.environment.settings().driver_binary);
        let mut command = self.environment.command(binary);
        command
            .arg("run")
            .arg(".")
            .arg(experiment_name)
            .arg("--stream")
            .current_dir(bundle);

        let process = ManagedProcess::spawn(command, log)?;
        let pid = process.pid();
        self.driver.install(process)?;
        info!(
            pid,
            experiment_id = %experiment_id,
            log = %log_path.display(),
            "training driver started"
        );
        Ok(pid)
    }

    fn stop_aggregator(&self) -> Result<(), SupervisorError> {
        self.aggregator.stop()
    }

    fn stop_training_driver(&self) -> Result<(), SupervisorError> {
        self.driver.stop()
    }

    fn aggregator_running(&self) -> bool {
        self.aggregator.is_running()
    }

    fn training_driver_running(&self) -> bool {
        self.driver.is_running()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        bundle::tests::write_bundle,
        settings::RuntimeSettings,
        supervisor::environment::tests::write_script,
    };

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        uploads: PathBuf,
        logs: PathBuf,
        supervisor: ProcessSupervisor,
    }

    fn fixture() -> Fixture {
        let venv = tempfile::tempdir().unwrap();
        write_script(venv.path(), "flower-superlink", "echo \"$@\"\nexec sleep 30");
        write_script(venv.path(), "flwr", "echo \"$@\"\nexec sleep 30");
        write_script(venv.path(), "pip", "exit 0");
        let data = tempfile::tempdir().unwrap();
        let uploads = data.path().join("uploads");
        let logs = data.path().join("logs");
        let environment = Arc::new(RuntimeEnvironment::at(
            venv.path(),
            RuntimeSettings::default(),
        ));
        let supervisor = ProcessSupervisor::new(environment, &logs, &uploads);
        Fixture {
            _dirs: vec![venv, data],
            uploads,
            logs,
            supervisor,
        }
    }

    fn tls() -> TlsMaterial {
        TlsMaterial {
            ca_certificate: "ca.crt".into(),
            certificate: "server.pem".into(),
            private_key: "server.key".into(),
        }
    }

    #[tokio::test]
    async fn test_aggregator_lifecycle() {
        let fixture = fixture();
        let supervisor = &fixture.supervisor;
        assert!(!supervisor.aggregator_running());
        assert!(supervisor.stop_aggregator().is_ok());

        supervisor
            .start_aggregator(&tls(), Path::new("keys.csv"))
            .await
            .unwrap();
        assert!(supervisor.aggregator_running());
        assert!(!supervisor.training_driver_running());
        assert_eq!(fs::read_dir(&fixture.logs).unwrap().count(), 1);

        supervisor.stop_aggregator().unwrap();
        assert!(!supervisor.aggregator_running());
        assert!(supervisor.stop_aggregator().is_ok());
    }

    #[tokio::test]
    async fn test_training_driver_logs_under_experiment() {
        let fixture = fixture();
        let experiment_dir = fixture.uploads.join("7");
        write_bundle(&experiment_dir, "mnist");

        fixture
            .supervisor
            .start_training_driver(&experiment_dir.join("mnist"), ExperimentId::new(7), "mnist")
            .await
            .unwrap();
        assert!(fixture.supervisor.training_driver_running());
        let logs = fs::read_dir(experiment_dir.join("logs")).unwrap().count();
        assert_eq!(logs, 1);

        fixture.supervisor.stop_training_driver().unwrap();
        assert!(!fixture.supervisor.training_driver_running());
    }

    #[tokio::test]
    async fn test_failed_install_launches_nothing() {
        let fixture = fixture();
        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            fixture
                .supervisor
                .start_training_driver(empty.path(), ExperimentId::new(1), "mnist")
                .await,
            Err(SupervisorError::DependencyInstall(_))
        ));
        assert!(!fixture.supervisor.training_driver_running());
    }
}
