use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::{sync::Notify, time::timeout};

use fl_link::{
    bundle::StagedDirectory,
    common::{ExperimentId, NodeId},
    error::ErrorKind,
    integrity::{digest_file, ReportedChecksums},
    lifecycle::{Acknowledgement, Engine, EngineConfig, ExperimentChanges, ReplacementFile},
    mailbox::{InstructionKind, Mailbox},
    models::{
        Experiment,
        ExperimentNodeStatus,
        ExperimentStatus,
        MetadataDescriptor,
        NewExperiment,
        NewNode,
        Participant,
    },
    registry::Registry,
    store::MemoryStore,
    supervisor::{Supervisor, SupervisorError, TlsMaterial},
};

/// Counts launches and pretends every launched process keeps running until stopped.
#[derive(Default)]
struct RecordingSupervisor {
    aggregator_launches: AtomicUsize,
    driver_launches: AtomicUsize,
    aggregator_up: AtomicBool,
    driver_up: AtomicBool,
    /// When set, a driver launch waits for `driver_release` after signalling `driver_entered`.
    hold_driver: AtomicBool,
    driver_entered: Notify,
    driver_release: Notify,
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn start_aggregator(
        &self,
        _tls: &TlsMaterial,
        authorized_keys: &Path,
    ) -> Result<u32, SupervisorError> {
        assert!(authorized_keys.is_file());
        self.aggregator_launches.fetch_add(1, Ordering::SeqCst);
        self.aggregator_up.store(true, Ordering::SeqCst);
        Ok(100)
    }

    async fn start_training_driver(
        &self,
        bundle: &Path,
        _experiment_id: ExperimentId,
        _experiment_name: &str,
    ) -> Result<u32, SupervisorError> {
        assert!(bundle.join("pyproject.toml").is_file());
        if self.hold_driver.load(Ordering::SeqCst) {
            self.driver_entered.notify_one();
            self.driver_release.notified().await;
        }
        self.driver_launches.fetch_add(1, Ordering::SeqCst);
        self.driver_up.store(true, Ordering::SeqCst);
        Ok(200)
    }

    fn stop_aggregator(&self) -> Result<(), SupervisorError> {
        self.aggregator_up.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop_training_driver(&self) -> Result<(), SupervisorError> {
        self.driver_up.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn aggregator_running(&self) -> bool {
        self.aggregator_up.load(Ordering::SeqCst)
    }

    fn training_driver_running(&self) -> bool {
        self.driver_up.load(Ordering::SeqCst)
    }
}

struct Controller {
    dir: TempDir,
    engine: Arc<Engine<MemoryStore, RecordingSupervisor>>,
    registry: Registry<MemoryStore>,
    supervisor: Arc<RecordingSupervisor>,
    operator: fl_link::common::UserId,
    participants: Vec<Participant>,
}

impl Controller {
    async fn with_nodes(usernames: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mailbox = Arc::new(Mailbox::new());
        let supervisor = Arc::new(RecordingSupervisor::default());
        let config = EngineConfig {
            uploads_dir: dir.path().join("uploads"),
            authorized_keys: dir.path().join("keys").join("authorized_keys.csv"),
            tls: TlsMaterial {
                ca_certificate: dir.path().join("ca.crt"),
                certificate: dir.path().join("server.pem"),
                private_key: dir.path().join("server.key"),
            },
        };
        let engine = Arc::new(Engine::new(
            store.clone(),
            mailbox.clone(),
            supervisor.clone(),
            config,
        ));
        let registry = Registry::new(store, mailbox);

        let operator = registry.register_user("operator").await.unwrap().id;
        let mut participants = Vec::new();
        for username in usernames {
            let node = registry
                .register_node(NewNode {
                    username: username.to_string(),
                    public_key: format!("ecdsa-sha2-nistp384 {}", username),
                })
                .await
                .unwrap();
            registry.approve_node(node.id).await.unwrap();
            let metadata = registry
                .register_metadata(
                    node.id,
                    MetadataDescriptor {
                        node_metadata_id: 1,
                        name: format!("{}-partition", username),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            participants.push(Participant {
                node_id: node.id,
                metadata_id: metadata.id,
            });
        }

        Self {
            dir,
            engine,
            registry,
            supervisor,
            operator,
            participants,
        }
    }

    fn node(&self, index: usize) -> NodeId {
        self.participants[index].node_id
    }

    /// Lays out a well-formed bundle in a staging directory of its own.
    fn stage(&self, name: &str) -> StagedDirectory {
        let staging = self.dir.path().join("staging").join(name);
        let package = staging.join(name).join(name);
        fs::create_dir_all(&package).unwrap();
        fs::write(
            staging.join(name).join("pyproject.toml"),
            "[project]\nname = \"mnist\"\n",
        )
        .unwrap();
        fs::write(package.join("client_app.py"), "print('client')\n").unwrap();
        fs::write(package.join("server_app.py"), "print('server')\n").unwrap();
        StagedDirectory::new(staging)
    }

    async fn create(&self, name: &str) -> Experiment {
        let experiment = self
            .engine
            .create_experiment(
                NewExperiment {
                    user_id: self.operator,
                    name: name.into(),
                    description: "digits".into(),
                },
                self.participants.clone(),
                &self.stage(name),
            )
            .await
            .unwrap();
        for participant in &self.participants {
            self.engine
                .accept_experiment(experiment.id, participant.node_id)
                .await
                .unwrap();
        }
        experiment
    }

    async fn node_statuses(&self, experiment_id: ExperimentId) -> Vec<ExperimentNodeStatus> {
        self.engine
            .experiment(experiment_id)
            .await
            .unwrap()
            .nodes
            .into_iter()
            .map(|row| row.status)
            .collect()
    }

    fn launches(&self) -> (usize, usize) {
        (
            self.supervisor.aggregator_launches.load(Ordering::SeqCst),
            self.supervisor.driver_launches.load(Ordering::SeqCst),
        )
    }
}

#[tokio::test]
async fn test_experiment_runs_once_every_node_acknowledged() {
    let controller = Controller::with_nodes(&["node-a", "node-b"]).await;
    let experiment = controller.create("mnist").await;

    let invitation = controller.registry.poll(controller.node(0)).await;
    assert_eq!(invitation.len(), 1);
    assert!(matches!(
        &invitation[0].kind,
        InstructionKind::NewExperiment(payload) if payload.experiment_id == experiment.id
    ));

    let started = controller
        .engine
        .start_experiment(experiment.id)
        .await
        .unwrap();
    assert_eq!(started.status, ExperimentStatus::Preparing);
    assert_eq!(controller.launches(), (1, 0));

    let keys = fs::read_to_string(&controller.engine.config().authorized_keys).unwrap();
    assert_eq!(keys.lines().count(), 2);

    for index in 0..2 {
        let instructions = controller.registry.poll(controller.node(index)).await;
        assert!(instructions
            .iter()
            .any(|instruction| matches!(instruction.kind, InstructionKind::StartTraining(_))));
    }

    let first = controller
        .engine
        .acknowledge_training(experiment.id, controller.node(0))
        .await
        .unwrap();
    assert_eq!(first, Acknowledgement::Waiting { remaining: 1 });
    assert_eq!(controller.launches(), (1, 0));

    let last = controller
        .engine
        .acknowledge_training(experiment.id, controller.node(1))
        .await
        .unwrap();
    assert_eq!(last, Acknowledgement::CohortComplete);
    assert_eq!(controller.launches(), (1, 1));

    let repeated = controller
        .engine
        .acknowledge_training(experiment.id, controller.node(1))
        .await
        .unwrap();
    assert_eq!(repeated, Acknowledgement::AlreadyTraining);
    assert_eq!(controller.launches(), (1, 1));

    let details = controller.engine.experiment(experiment.id).await.unwrap();
    assert_eq!(details.experiment.status, ExperimentStatus::Training);
    assert!(details
        .nodes
        .iter()
        .all(|row| row.status == ExperimentNodeStatus::Training));
}

#[tokio::test]
async fn test_stop_halts_backend_and_notifies_nodes() {
    let controller = Controller::with_nodes(&["node-a", "node-b"]).await;
    let experiment = controller.create("mnist").await;
    controller
        .engine
        .start_experiment(experiment.id)
        .await
        .unwrap();
    controller
        .engine
        .acknowledge_training(experiment.id, controller.node(0))
        .await
        .unwrap();
    for index in 0..2 {
        controller.registry.poll(controller.node(index)).await;
    }

    let stopped = controller
        .engine
        .stop_experiment(experiment.id)
        .await
        .unwrap();
    assert_eq!(stopped.status, ExperimentStatus::Stopped);
    assert!(!controller.supervisor.aggregator_running());
    assert_eq!(
        controller.node_statuses(experiment.id).await,
        vec![ExperimentNodeStatus::Stopped, ExperimentNodeStatus::Stopped]
    );
    for index in 0..2 {
        let instructions = controller.registry.poll(controller.node(index)).await;
        assert_eq!(instructions.len(), 1);
        assert!(matches!(
            instructions[0].kind,
            InstructionKind::StopTraining(_)
        ));
    }

    let err = controller
        .engine
        .stop_experiment(experiment.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_stop_is_not_blocked_by_a_launching_driver() {
    let controller = Controller::with_nodes(&["node-a"]).await;
    let experiment = controller.create("mnist").await;
    controller
        .engine
        .start_experiment(experiment.id)
        .await
        .unwrap();
    controller.supervisor.hold_driver.store(true, Ordering::SeqCst);

    let acknowledgement = tokio::spawn({
        let engine = controller.engine.clone();
        let (experiment_id, node_id) = (experiment.id, controller.node(0));
        async move { engine.acknowledge_training(experiment_id, node_id).await }
    });
    controller.supervisor.driver_entered.notified().await;

    let stopped = timeout(
        Duration::from_secs(5),
        controller.engine.stop_experiment(experiment.id),
    )
    .await
    .expect("stop waited for the driver launch")
    .unwrap();
    assert_eq!(stopped.status, ExperimentStatus::Stopped);

    controller.supervisor.driver_release.notify_one();
    assert_eq!(
        acknowledgement.await.unwrap().unwrap(),
        Acknowledgement::CohortComplete
    );
    assert_eq!(controller.launches(), (1, 1));
    // the driver that came up after the stop was stopped again
    assert!(!controller.supervisor.training_driver_running());
}

#[tokio::test]
async fn test_only_one_experiment_runs_at_a_time() {
    let controller = Controller::with_nodes(&["node-a"]).await;
    let first = controller.create("mnist").await;
    let second = controller.create("cifar").await;

    controller.engine.start_experiment(first.id).await.unwrap();
    let err = controller
        .engine
        .start_experiment(second.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(controller.launches(), (1, 0));

    controller.engine.stop_experiment(first.id).await.unwrap();
    controller.engine.start_experiment(second.id).await.unwrap();
    assert_eq!(controller.launches(), (2, 0));
}

#[tokio::test]
async fn test_update_and_checksum_drift() {
    let controller = Controller::with_nodes(&["node-a", "node-b"]).await;
    let experiment = controller.create("mnist").await;
    let bundle_root = experiment_root(&controller, experiment.id).await;
    for index in 0..2 {
        controller.registry.poll(controller.node(index)).await;
    }

    let updated = controller
        .engine
        .update_experiment(
            experiment.id,
            ExperimentChanges {
                files: vec![ReplacementFile {
                    name: "client_app.py".into(),
                    contents: b"print('client v2')\n".to_vec(),
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "mnist");
    assert_eq!(
        controller.node_statuses(experiment.id).await,
        vec![ExperimentNodeStatus::Pending, ExperimentNodeStatus::Pending]
    );
    let instructions = controller.registry.poll(controller.node(0)).await;
    assert!(matches!(
        &instructions[..],
        [instruction] if matches!(
            &instruction.kind,
            InstructionKind::UpdateExperiment(payload)
                if payload.updated_files == vec!["client_app.py".to_string()]
        )
    ));

    // node-a holds the new client, node-b still the old one
    let current = ReportedChecksums {
        pyproject_checksum: digest_file(&bundle_root.join("pyproject.toml")).unwrap(),
        client_app_checksum: digest_file(&bundle_root.join("mnist").join("client_app.py"))
            .unwrap(),
    };
    controller
        .engine
        .report_checksums(experiment.id, controller.node(0), &current)
        .await
        .unwrap();
    let stale = ReportedChecksums {
        client_app_checksum: "0".repeat(64),
        ..current
    };
    let err = controller
        .engine
        .report_checksums(experiment.id, controller.node(1), &stale)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(
        controller.node_statuses(experiment.id).await,
        vec![
            ExperimentNodeStatus::Pending,
            ExperimentNodeStatus::ChecksumMismatch
        ]
    );

    let notified = controller
        .engine
        .redeliver_files(experiment.id)
        .await
        .unwrap();
    assert_eq!(notified, 1);
    assert_eq!(controller.registry.poll(controller.node(1)).await.len(), 2);
}

async fn experiment_root(controller: &Controller, experiment_id: ExperimentId) -> std::path::PathBuf {
    controller
        .engine
        .experiment(experiment_id)
        .await
        .unwrap()
        .experiment
        .files_path
        .unwrap()
}
