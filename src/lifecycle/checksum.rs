use super::{bundle_of, fetch_experiment, Engine};
use crate::{
    common::{ExperimentId, NodeId},
    error::CoordinationError,
    integrity::{self, ReportedChecksums},
    models::ExperimentNodeStatus,
    store::{Repository, Store, Transaction},
    supervisor::Supervisor,
};

impl<S, P> Engine<S, P>
where
    S: Store,
    P: Supervisor,
{
    /// Checks the digests a node reported against the controller's copy of the bundle.
    ///
    /// On a mismatch every participation row of the node in this experiment becomes
    /// `CHECKSUM_MISMATCH` and the integrity error is returned. Nothing is retried; the operator
    /// follows up with [`redeliver_files`](Self::redeliver_files).
    pub async fn report_checksums(
        &self,
        experiment_id: ExperimentId,
        node_id: NodeId,
        reported: &ReportedChecksums,
    ) -> Result<(), CoordinationError> {
        let mut tx = self.store.begin().await?;
        let experiment = fetch_experiment(&mut tx, experiment_id).await?;
        let bundle = bundle_of(&experiment)?;
        let rows = tx.participation(experiment_id, node_id).await?;
        if rows.is_empty() {
            return Err(CoordinationError::not_found(format_args!(
                "participation of node {} in experiment {}",
                node_id, experiment_id
            )));
        }

        match integrity::verify(&bundle, reported) {
            Ok(()) => {
                debug!(%experiment_id, %node_id, "checksums verified");
                Ok(())
            }
            Err(err) => {
                for row in &rows {
                    tx.set_participation_status(row.key(), ExperimentNodeStatus::ChecksumMismatch)
                        .await?;
                }
                tx.commit().await?;
                warn!(%experiment_id, %node_id, error = %err, "checksum drift detected");
                Err(err.into())
            }
        }
    }
}
