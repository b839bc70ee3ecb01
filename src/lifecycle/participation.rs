use super::{fetch_experiment, Engine};
use crate::{
    common::{ExperimentId, NodeId},
    error::CoordinationError,
    models::{ExperimentNode, ExperimentNodeStatus},
    store::{Repository, Store, Transaction},
    supervisor::Supervisor,
};

impl<S, P> Engine<S, P>
where
    S: Store,
    P: Supervisor,
{
    /// The calling node agrees to take part in the experiment.
    pub async fn accept_experiment(
        &self,
        experiment_id: ExperimentId,
        node_id: NodeId,
    ) -> Result<ExperimentNode, CoordinationError> {
        self.answer_invitation(experiment_id, node_id, ExperimentNodeStatus::Accepted)
            .await
    }

    /// The calling node declines to take part in the experiment.
    pub async fn reject_experiment(
        &self,
        experiment_id: ExperimentId,
        node_id: NodeId,
    ) -> Result<ExperimentNode, CoordinationError> {
        self.answer_invitation(experiment_id, node_id, ExperimentNodeStatus::Rejected)
            .await
    }

    async fn answer_invitation(
        &self,
        experiment_id: ExperimentId,
        node_id: NodeId,
        answer: ExperimentNodeStatus,
    ) -> Result<ExperimentNode, CoordinationError> {
        let mut tx = self.store.begin().await?;
        fetch_experiment(&mut tx, experiment_id).await?;

        let rows = tx.participation(experiment_id, node_id).await?;
        if rows.is_empty() {
            return Err(CoordinationError::not_found(format_args!(
                "participation of node {} in experiment {}",
                node_id, experiment_id
            )));
        }
        let mut row = rows
            .into_iter()
            .find(|row| row.status.accepts_answer())
            .ok_or_else(|| {
                CoordinationError::validation(format!(
                    "node {} cannot answer experiment {} in its current state",
                    node_id, experiment_id
                ))
            })?;

        tx.set_participation_status(row.key(), answer).await?;
        tx.commit().await?;

        info!(%experiment_id, %node_id, from = %row.status, to = %answer, "node answered invitation");
        row.status = answer;
        Ok(row)
    }
}
