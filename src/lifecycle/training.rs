use std::{collections::BTreeMap, fs, path::Path};

use super::{bundle_of, fetch_experiment, Engine};
use crate::{
    common::{ExperimentId, NodeId},
    error::CoordinationError,
    mailbox::Instruction,
    models::{Experiment, ExperimentNodeStatus, ExperimentStatus},
    store::{ParticipationExt, Repository, Store, Transaction},
    supervisor::Supervisor,
};

const ACTIVE: [ExperimentStatus; 2] = [ExperimentStatus::Preparing, ExperimentStatus::Training];

/// The outcome of a node acknowledging that it started training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Acknowledgement {
    /// The node was already training. Nothing changed.
    AlreadyTraining,
    /// The node is training, other participants have not joined yet.
    Waiting { remaining: usize },
    /// The node was the last to join. The experiment is training.
    CohortComplete,
}

/// How an operator finishes an active experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Conclusion {
    Completed,
    Failed,
}

impl Conclusion {
    fn statuses(self) -> (ExperimentStatus, ExperimentNodeStatus) {
        match self {
            Self::Completed => (ExperimentStatus::Completed, ExperimentNodeStatus::Completed),
            Self::Failed => (ExperimentStatus::Failed, ExperimentNodeStatus::Failed),
        }
    }
}

/// The backend processes a reconciliation pass launched again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Relaunched {
    pub aggregator: bool,
    pub training_driver: bool,
}

impl<S, P> Engine<S, P>
where
    S: Store,
    P: Supervisor,
{
    /// Moves every accepted node to `PREPARING` and launches the aggregation service.
    ///
    /// Fails with a conflict while any experiment is `PREPARING` or `TRAINING`. The row changes
    /// and the authorized-keys rewrite form one unit. The launch happens after the commit and a
    /// failure to launch is only logged; [`reconcile`](Self::reconcile) picks it up.
    pub async fn start_experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Experiment, CoordinationError> {
        let _lifecycle = self.lifecycle.lock().await;

        let mut tx = self.store.begin().await?;
        let mut experiment = fetch_experiment(&mut tx, experiment_id).await?;
        if tx.count_experiments(&ACTIVE).await? > 0 {
            return Err(CoordinationError::Conflict(
                "another experiment is already running".into(),
            ));
        }
        bundle_of(&experiment)?;

        let accepted = tx
            .experiment_nodes(experiment_id)
            .await?
            .with_status(ExperimentNodeStatus::Accepted);
        if accepted.is_empty() {
            return Err(CoordinationError::validation(format!(
                "experiment {} has no accepted nodes",
                experiment_id
            )));
        }
        for row in &accepted {
            tx.set_participation_status(row.key(), ExperimentNodeStatus::Preparing)
                .await?;
        }
        experiment.status = ExperimentStatus::Preparing;
        tx.update_experiment(&experiment).await?;

        let mut keys = BTreeMap::new();
        for row in &accepted {
            if let Some(node) = tx.node(row.node_id).await? {
                keys.insert(node.id, node.public_key);
            }
        }
        write_authorized_keys(&self.config.authorized_keys, &keys)?;
        tx.commit().await?;

        self.notify_nodes(&accepted, || Instruction::start_training(experiment_id));
        info!(%experiment_id, nodes = accepted.len(), "experiment preparing");

        self.launch_aggregator().await;
        Ok(experiment)
    }

    /// Records that `node_id` started training. The last participant to arrive launches the
    /// training driver and moves the experiment to `TRAINING`.
    ///
    /// The launch, dependency installation included, runs without the lifecycle lock. A stop
    /// that lands meanwhile finds no driver to signal, so the driver is stopped again once the
    /// launch returned and the experiment is no longer `TRAINING`.
    pub async fn acknowledge_training(
        &self,
        experiment_id: ExperimentId,
        node_id: NodeId,
    ) -> Result<Acknowledgement, CoordinationError> {
        let lifecycle = self.lifecycle.lock().await;

        let mut tx = self.store.begin().await?;
        let mut experiment = fetch_experiment(&mut tx, experiment_id).await?;
        let rows = tx.participation(experiment_id, node_id).await?;
        if rows.is_empty() {
            return Err(CoordinationError::not_found(format_args!(
                "participation of node {} in experiment {}",
                node_id, experiment_id
            )));
        }
        if rows
            .iter()
            .all(|row| row.status == ExperimentNodeStatus::Training)
        {
            debug!(%experiment_id, %node_id, "repeated training acknowledgement");
            return Ok(Acknowledgement::AlreadyTraining);
        }
        let preparing = rows.with_status(ExperimentNodeStatus::Preparing);
        if preparing.is_empty() {
            return Err(CoordinationError::validation(format!(
                "node {} is not preparing for experiment {}",
                node_id, experiment_id
            )));
        }
        for row in &preparing {
            tx.set_participation_status(row.key(), ExperimentNodeStatus::Training)
                .await?;
        }

        let all = tx.experiment_nodes(experiment_id).await?;
        let training = all.count_status(ExperimentNodeStatus::Training);
        if training < all.len() {
            tx.commit().await?;
            info!(%experiment_id, %node_id, training, total = all.len(), "node training");
            return Ok(Acknowledgement::Waiting {
                remaining: all.len() - training,
            });
        }

        experiment.status = ExperimentStatus::Training;
        tx.update_experiment(&experiment).await?;
        tx.commit().await?;
        info!(%experiment_id, %node_id, "all nodes training");
        drop(lifecycle);

        self.launch_training_driver(&experiment).await;
        self.settle_training_driver(experiment_id).await?;
        Ok(Acknowledgement::CohortComplete)
    }

    /// Stops the training driver if `experiment_id` was halted while its driver was launching.
    async fn settle_training_driver(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<(), CoordinationError> {
        let _lifecycle = self.lifecycle.lock().await;
        let experiment = fetch_experiment(&mut self.store.clone(), experiment_id).await?;
        if experiment.status != ExperimentStatus::Training {
            warn!(
                %experiment_id,
                status = %experiment.status,
                "experiment halted during the driver launch, stopping the driver"
            );
            if let Err(err) = self.supervisor.stop_training_driver() {
                warn!(error = %err, "failed to stop the training driver");
            }
        }
        Ok(())
    }

    /// Stops the backend and moves the experiment and its running nodes to `STOPPED`.
    pub async fn stop_experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Experiment, CoordinationError> {
        self.halt(
            experiment_id,
            ExperimentStatus::Stopped,
            ExperimentNodeStatus::Stopped,
        )
        .await
    }

    /// Marks an active experiment as finished, successfully or not.
    pub async fn conclude_experiment(
        &self,
        experiment_id: ExperimentId,
        conclusion: Conclusion,
    ) -> Result<Experiment, CoordinationError> {
        let (status, node_status) = conclusion.statuses();
        self.halt(experiment_id, status, node_status).await
    }

    async fn halt(
        &self,
        experiment_id: ExperimentId,
        status: ExperimentStatus,
        node_status: ExperimentNodeStatus,
    ) -> Result<Experiment, CoordinationError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_backend();

        let mut tx = self.store.begin().await?;
        let mut experiment = fetch_experiment(&mut tx, experiment_id).await?;
        if !experiment.status.is_active() {
            if let Some(active) = tx
                .experiments()
                .await?
                .into_iter()
                .find(|other| other.status.is_active())
            {
                warn!(
                    experiment_id = %active.id,
                    requested = %experiment_id,
                    "backend of the active experiment was stopped, reconcile to relaunch it"
                );
            }
            return Err(CoordinationError::validation(format!(
                "experiment {} is {}, not running",
                experiment_id, experiment.status
            )));
        }

        let running = tx
            .experiment_nodes(experiment_id)
            .await?
            .into_iter()
            .filter(|row| {
                matches!(
                    row.status,
                    ExperimentNodeStatus::Training | ExperimentNodeStatus::Preparing
                )
            })
            .collect::<Vec<_>>();
        for row in &running {
            tx.set_participation_status(row.key(), node_status).await?;
        }
        experiment.status = status;
        tx.update_experiment(&experiment).await?;
        tx.commit().await?;

        self.notify_nodes(&running, || Instruction::stop_training(experiment_id));
        info!(%experiment_id, %status, nodes = running.len(), "experiment halted");
        Ok(experiment)
    }

    /// Launches the backend processes the active experiment needs but that are not running.
    pub async fn reconcile(&self) -> Result<Relaunched, CoordinationError> {
        let _lifecycle = self.lifecycle.lock().await;

        let mut store = self.store.clone();
        let active = store
            .experiments()
            .await?
            .into_iter()
            .find(|experiment| experiment.status.is_active());
        let experiment = match active {
            Some(experiment) => experiment,
            None => return Ok(Relaunched::default()),
        };

        let mut relaunched = Relaunched::default();
        if !self.supervisor.aggregator_running() {
            warn!(experiment_id = %experiment.id, "aggregation service not running, relaunching");
            self.supervisor
                .start_aggregator(&self.config.tls, &self.config.authorized_keys)
                .await?;
            relaunched.aggregator = true;
        }
        if experiment.status == ExperimentStatus::Training
            && !self.supervisor.training_driver_running()
        {
            warn!(experiment_id = %experiment.id, "training driver not running, relaunching");
            let bundle = bundle_of(&experiment)?;
            self.supervisor
                .start_training_driver(bundle.root(), experiment.id, &experiment.name)
                .await?;
            relaunched.training_driver = true;
        }
        Ok(relaunched)
    }

    async fn launch_aggregator(&self) {
        if let Err(err) = self
            .supervisor
            .start_aggregator(&self.config.tls, &self.config.authorized_keys)
            .await
        {
            error!(error = %err, "failed to launch the aggregation service");
        }
    }

    async fn launch_training_driver(&self, experiment: &Experiment) {
        let result = match bundle_of(experiment) {
            Ok(bundle) => self
                .supervisor
                .start_training_driver(bundle.root(), experiment.id, &experiment.name)
                .await
                .map_err(CoordinationError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            error!(experiment_id = %experiment.id, error = %err, "failed to launch the training driver");
        }
    }

    /// Signals both backend processes. Failing to signal is logged and otherwise ignored.
    pub(crate) fn stop_backend(&self) {
        if let Err(err) = self.supervisor.stop_aggregator() {
            warn!(error = %err, "failed to stop the aggregation service");
        }
        if let Err(err) = self.supervisor.stop_training_driver() {
            warn!(error = %err, "failed to stop the training driver");
        }
    }
}

/// Truncates `path` and writes one public key per line.
fn write_authorized_keys(
    path: &Path,
    keys: &BTreeMap<NodeId, String>,
) -> Result<(), CoordinationError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = String::new();
    for key in keys.values() {
        contents.push_str(key.trim());
        contents.push('\n');
    }
    fs::write(path, contents)?;
    debug!(path = %path.display(), keys = keys.len(), "authorized keys rewritten");
    Ok(())
}
