use super::{bundle_of, fetch_experiment, Engine};
use crate::{
    bundle::{StagedFiles, CLIENT_APP, MANIFEST},
    common::ExperimentId,
    error::CoordinationError,
    mailbox::{Instruction, UpdateExperimentPayload},
    models::{Experiment, ExperimentNodeStatus},
    store::{ParticipationExt, Repository, Store, Transaction},
    supervisor::Supervisor,
};

/// A file uploaded to replace its counterpart in the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Operator edits to an experiment that is not running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub files: Vec<ReplacementFile>,
}

impl<S, P> Engine<S, P>
where
    S: Store,
    P: Supervisor,
{
    /// Applies `changes` to an experiment that is neither `PREPARING` nor `TRAINING`.
    ///
    /// When files are replaced, every participation row goes back to `PENDING` and each node
    /// is told which files changed, so it has to fetch them and accept again. The replacement
    /// files and the row changes land together: on any error the bundle keeps its previous
    /// contents.
    pub async fn update_experiment(
        &self,
        experiment_id: ExperimentId,
        changes: ExperimentChanges,
    ) -> Result<Experiment, CoordinationError> {
        let _lifecycle = self.lifecycle.lock().await;

        let mut tx = self.store.begin().await?;
        let mut experiment = fetch_experiment(&mut tx, experiment_id).await?;
        if experiment.status.is_active() {
            return Err(CoordinationError::validation(format!(
                "experiment {} cannot be updated while {}",
                experiment_id, experiment.status
            )));
        }

        if let Some(name) = changes.name {
            if name.trim().is_empty() {
                return Err(CoordinationError::validation("experiment name is required"));
            }
            experiment.name = name;
        }
        if let Some(description) = changes.description {
            experiment.description = description;
        }

        let staged = if changes.files.is_empty() {
            None
        } else {
            let bundle = bundle_of(&experiment)?;
            Some(bundle.stage_replacements(
                changes
                    .files
                    .iter()
                    .map(|file| (file.name.as_str(), file.contents.as_slice())),
            )?)
        };
        let updated_files = staged.as_ref().map(StagedFiles::names).unwrap_or_default();
        tx.update_experiment(&experiment).await?;

        let rows = if updated_files.is_empty() {
            Vec::new()
        } else {
            tx.experiment_nodes(experiment_id).await?
        };
        for row in &rows {
            tx.set_participation_status(row.key(), ExperimentNodeStatus::Pending)
                .await?;
        }

        // the files go back to their previous contents unless the commit succeeds
        let swapped = staged.map(StagedFiles::swap_in).transpose()?;
        tx.commit().await?;
        if let Some(swapped) = swapped {
            swapped.keep();
        }

        if !rows.is_empty() {
            let payload = UpdateExperimentPayload {
                experiment_id,
                files_path: experiment.files_path.clone(),
                updated_files,
            };
            self.notify_nodes(&rows, || Instruction::update_experiment(payload.clone()));
            info!(
                %experiment_id,
                files = ?payload.updated_files,
                nodes = rows.len(),
                "experiment files replaced"
            );
        } else {
            info!(%experiment_id, "experiment updated");
        }
        Ok(experiment)
    }

    /// Sends the verified files again to every node whose checksums did not match and moves
    /// those nodes back to `PENDING`. Returns the number of nodes notified.
    pub async fn redeliver_files(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<usize, CoordinationError> {
        let _lifecycle = self.lifecycle.lock().await;

        let mut tx = self.store.begin().await?;
        let experiment = fetch_experiment(&mut tx, experiment_id).await?;
        bundle_of(&experiment)?;

        let mismatched = tx
            .experiment_nodes(experiment_id)
            .await?
            .with_status(ExperimentNodeStatus::ChecksumMismatch);
        for row in &mismatched {
            tx.set_participation_status(row.key(), ExperimentNodeStatus::Pending)
                .await?;
        }
        tx.commit().await?;

        let payload = UpdateExperimentPayload {
            experiment_id,
            files_path: experiment.files_path.clone(),
            updated_files: vec![MANIFEST.to_string(), CLIENT_APP.to_string()],
        };
        self.notify_nodes(&mismatched, || Instruction::update_experiment(payload.clone()));

        let mut nodes = mismatched.iter().map(|row| row.node_id).collect::<Vec<_>>();
        nodes.dedup();
        info!(%experiment_id, nodes = nodes.len(), "corrected files redelivered");
        Ok(nodes.len())
    }
}
