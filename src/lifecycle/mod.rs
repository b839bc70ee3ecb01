//! The experiment lifecycle engine.
//!
//! The [`Engine`] owns every state transition of experiments and their participation rows. A
//! transition reads and writes rows inside one store transaction, fans instructions out to the
//! [`Mailbox`] once the transaction committed, and drives the [`Supervisor`] so that the training
//! backend only runs while an experiment is `PREPARING` or `TRAINING`.
//!
//! Operations that touch cross-experiment state (start, acknowledgement, stop, update) are
//! serialised by a single lifecycle lock. Node polling never takes it.

mod checksum;
mod create;
mod participation;
mod training;
mod update;


use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::Arc,
};

use tokio::sync::Mutex;

pub use self::{
    training::{Acknowledgement, Conclusion, Relaunched},
    update::{ExperimentChanges, ReplacementFile},
};
use crate::{
    bundle::Bundle,
    common::{ExperimentId, NodeId},
    error::CoordinationError,
    mailbox::{Instruction, Mailbox},
    models::{Experiment, ExperimentNode},
    store::{Repository, Store},
    supervisor::{Supervisor, TlsMaterial},
};

/// Locations and credentials the engine hands to the backend.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bundles are unpacked into `<uploads_dir>/<experiment_id>/`.
    pub uploads_dir: PathBuf,
    /// Rewritten before every aggregation service start.
    pub authorized_keys: PathBuf,
    pub tls: TlsMaterial,
}

/// An experiment together with its participation rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentDetails {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub nodes: Vec<ExperimentNode>,
}

pub struct Engine<S, P> {
    store: S,
    mailbox: Arc<Mailbox>,
    supervisor: Arc<P>,
    config: EngineConfig,
    lifecycle: Mutex<()>,
}

impl<S, P> Engine<S, P>
where
    S: Store,
    P: Supervisor,
{
    pub fn new(store: S, mailbox: Arc<Mailbox>, supervisor: Arc<P>, config: EngineConfig) -> Self {
        Self {
            store,
            mailbox,
            supervisor,
            config,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn supervisor(&self) -> &Arc<P> {
        &self.supervisor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One experiment with its participation rows.
    pub async fn experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<ExperimentDetails, CoordinationError> {
        let mut store = self.store.clone();
        let experiment = fetch_experiment(&mut store, experiment_id).await?;
        let nodes = store.experiment_nodes(experiment_id).await?;
        Ok(ExperimentDetails { experiment, nodes })
    }

    pub async fn list_experiments(&self) -> Result<Vec<ExperimentDetails>, CoordinationError> {
        let mut store = self.store.clone();
        let mut details = Vec::new();
        for experiment in store.experiments().await? {
            let nodes = store.experiment_nodes(experiment.id).await?;
            details.push(ExperimentDetails { experiment, nodes });
        }
        Ok(details)
    }

    fn experiment_dir(&self, experiment_id: ExperimentId) -> PathBuf {
        self.config.uploads_dir.join(experiment_id.to_string())
    }

    /// Hands one copy of `instruction` to every distinct node among `rows`.
    fn notify_nodes(&self, rows: &[ExperimentNode], instruction: impl Fn() -> Instruction) {
        let nodes: BTreeSet<NodeId> = rows.iter().map(|row| row.node_id).collect();
        self.mailbox
            .enqueue_all(nodes.into_iter().map(|node_id| (node_id, instruction())));
    }
}

async fn fetch_experiment<R: Repository>(
    repo: &mut R,
    experiment_id: ExperimentId,
) -> Result<Experiment, CoordinationError> {
    repo.experiment(experiment_id)
        .await?
        .ok_or_else(|| CoordinationError::not_found(format_args!("experiment {}", experiment_id)))
}

/// The bundle an experiment was created with.
fn bundle_of(experiment: &Experiment) -> Result<Bundle, CoordinationError> {
    let root = experiment.files_path.as_deref().ok_or_else(|| {
        CoordinationError::validation(format!(
            "experiment {} has no artifact bundle",
            experiment.id
        ))
    })?;
    Ok(Bundle::at(root)?)
}
