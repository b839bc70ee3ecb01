//! Commands delivered to nodes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::common::{ExperimentId, MetadataId};

/// A one-shot command for exactly one node.
///
/// On the wire this is `{"type": ..., "payload": {...}, "createdAt": ...}` where the payload
/// schema depends on the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(flatten)]
    pub kind: InstructionKind,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Instruction {
    pub fn new(kind: InstructionKind) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn new_experiment(payload: NewExperimentPayload) -> Self {
        Self::new(InstructionKind::NewExperiment(payload))
    }

    pub fn start_training(experiment_id: ExperimentId) -> Self {
        Self::new(InstructionKind::StartTraining(ExperimentRef { experiment_id }))
    }

    pub fn stop_training(experiment_id: ExperimentId) -> Self {
        Self::new(InstructionKind::StopTraining(ExperimentRef { experiment_id }))
    }

    pub fn update_experiment(payload: UpdateExperimentPayload) -> Self {
        Self::new(InstructionKind::UpdateExperiment(payload))
    }

    /// The experiment this instruction is about.
    pub fn experiment_id(&self) -> ExperimentId {
        match &self.kind {
            InstructionKind::NewExperiment(p) => p.experiment_id,
            InstructionKind::StartTraining(p) | InstructionKind::StopTraining(p) => {
                p.experiment_id
            }
            InstructionKind::UpdateExperiment(p) => p.experiment_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionKind {
    NewExperiment(NewExperimentPayload),
    StartTraining(ExperimentRef),
    StopTraining(ExperimentRef),
    UpdateExperiment(UpdateExperimentPayload),
}

/// Invitation to take part in an experiment with the given dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperimentPayload {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub description: String,
    pub files_path: PathBuf,
    pub metadata_id: MetadataId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRef {
    pub experiment_id: ExperimentId,
}

/// Tells a node which bundle files changed and must be fetched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateExperimentPayload {
    pub experiment_id: ExperimentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_path: Option<PathBuf>,
    pub updated_files: Vec<String>,
}
