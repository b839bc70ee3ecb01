use std::{collections::HashSet, fs};

use super::{fetch_experiment, Engine};
use crate::{
    bundle::{Bundle, BundleSource},
    common::ExperimentId,
    error::CoordinationError,
    mailbox::{Instruction, NewExperimentPayload},
    models::{
        Experiment,
        ExperimentNode,
        ExperimentNodeStatus,
        ExperimentStatus,
        NewExperiment,
        Participant,
    },
    store::{Repository, Store, Transaction},
    supervisor::Supervisor,
};

impl<S, P> Engine<S, P>
where
    S: Store,
    P: Supervisor,
{
    /// Creates an experiment, unpacks its bundle and invites every participant.
    ///
    /// Creation is staged. The experiment row is committed first. If the bundle turns out to be
    /// invalid the row stays `PENDING` without a bundle and the call fails; the upload can then
    /// be retried with [`upload_bundle`](Self::upload_bundle).
    pub async fn create_experiment(
        &self,
        new: NewExperiment,
        participants: Vec<Participant>,
        source: &dyn BundleSource,
    ) -> Result<Experiment, CoordinationError> {
        if new.name.trim().is_empty() {
            return Err(CoordinationError::validation("experiment name is required"));
        }
        let mut store = self.store.clone();
        if store.user(new.user_id).await?.is_none() {
            return Err(CoordinationError::not_found(format_args!("user {}", new.user_id)));
        }
        self.check_participants(&participants).await?;

        let experiment = store.insert_experiment(&new).await?;
        info!(experiment_id = %experiment.id, name = %experiment.name, "experiment created");

        let bundle = self
            .unpack_bundle(experiment.id, source)
            .map_err(|err| staged_failure(experiment.id, err))?;
        self.bind_participants(experiment, &bundle, &participants)
            .await
    }

    /// Retries the bundle upload of an experiment whose creation stopped at the bundle stage.
    pub async fn upload_bundle(
        &self,
        experiment_id: ExperimentId,
        participants: Vec<Participant>,
        source: &dyn BundleSource,
    ) -> Result<Experiment, CoordinationError> {
        let mut store = self.store.clone();
        let experiment = fetch_experiment(&mut store, experiment_id).await?;
        if experiment.files_path.is_some() || experiment.status != ExperimentStatus::Pending {
            return Err(CoordinationError::validation(format!(
                "experiment {} already has a bundle",
                experiment_id
            )));
        }
        self.check_participants(&participants).await?;

        let bundle = self.unpack_bundle(experiment_id, source)?;
        self.bind_participants(experiment, &bundle, &participants)
            .await
    }

    async fn check_participants(&self, participants: &[Participant]) -> Result<(), CoordinationError> {
        if participants.is_empty() {
            return Err(CoordinationError::validation(
                "an experiment needs at least one participant",
            ));
        }
        let mut store = self.store.clone();
        let mut seen = HashSet::new();
        for participant in participants {
            if !seen.insert(*participant) {
                return Err(CoordinationError::validation(format!(
                    "node {} is bound to metadata {} twice",
                    participant.node_id, participant.metadata_id
                )));
            }
            let node = store.node(participant.node_id).await?.ok_or_else(|| {
                CoordinationError::not_found(format_args!("node {}", participant.node_id))
            })?;
            if !node.approved {
                return Err(CoordinationError::validation(format!(
                    "node {} is not approved",
                    node.id
                )));
            }
            let metadata = store
                .metadata(participant.metadata_id)
                .await?
                .ok_or_else(|| {
                    CoordinationError::not_found(format_args!(
                        "metadata {}",
                        participant.metadata_id
                    ))
                })?;
            if metadata.node_id != participant.node_id {
                return Err(CoordinationError::validation(format!(
                    "metadata {} does not belong to node {}",
                    participant.metadata_id, participant.node_id
                )));
            }
        }
        Ok(())
    }

    /// Unpacks `source` into a fresh `<uploads>/<experiment_id>/` and validates the result.
    fn unpack_bundle(
        &self,
        experiment_id: ExperimentId,
        source: &dyn BundleSource,
    ) -> Result<Bundle, CoordinationError> {
        let dir = self.experiment_dir(experiment_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        source.unpack_into(&dir)?;
        Ok(Bundle::locate(&dir)?)
    }

    /// Records the bundle location, binds the participants as `PENDING` and invites them.
    async fn bind_participants(
        &self,
        mut experiment: Experiment,
        bundle: &Bundle,
        participants: &[Participant],
    ) -> Result<Experiment, CoordinationError> {
        let rows = participants
            .iter()
            .map(|participant| ExperimentNode {
                experiment_id: experiment.id,
                node_id: participant.node_id,
                metadata_id: participant.metadata_id,
                status: ExperimentNodeStatus::Pending,
            })
            .collect::<Vec<_>>();

        let mut tx = self.store.begin().await?;
        experiment.files_path = Some(bundle.root().to_path_buf());
        tx.update_experiment(&experiment).await?;
        tx.insert_experiment_nodes(&rows).await?;
        tx.commit().await?;

        self.mailbox.enqueue_all(rows.iter().map(|row| {
            let instruction = Instruction::new_experiment(NewExperimentPayload {
                experiment_id: experiment.id,
                name: experiment.name.clone(),
                description: experiment.description.clone(),
                files_path: bundle.root().to_path_buf(),
                metadata_id: row.metadata_id,
            });
            (row.node_id, instruction)
        }));
        info!(
            experiment_id = %experiment.id,
            participants = rows.len(),
            "experiment bundle accepted"
        );
        Ok(experiment)
    }
}

fn staged_failure(experiment_id: ExperimentId, err: CoordinationError) -> CoordinationError {
    warn!(%experiment_id, error = %err, "bundle rejected, experiment kept for a retried upload");
    match err {
        CoordinationError::Validation(message) => CoordinationError::Validation(format!(
            "experiment {} created without a bundle: {}",
            experiment_id, message
        )),
        other => other,
    }
}
