use std::fmt;

use crate::common::{ExperimentId, MetadataId, NodeId};

/// Participation status of one node within one experiment.
#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentNodeStatus {
    Pending,
    Accepted,
    Rejected,
    Preparing,
    Training,
    Stopped,
    Completed,
    Failed,
    ChecksumMismatch,
}

impl ExperimentNodeStatus {
    /// Whether the node may answer an invitation from this status.
    ///
    /// Nodes that are part of a running cohort, or whose files are known to be out of date,
    /// have to go through stop or redelivery first.
    pub fn accepts_answer(self) -> bool {
        !matches!(
            self,
            Self::Preparing | Self::Training | Self::ChecksumMismatch
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Preparing => "PREPARING",
            Self::Training => "TRAINING",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
        }
    }
}

impl fmt::Display for ExperimentNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participation row keyed by `(experiment_id, node_id, metadata_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentNode {
    pub experiment_id: ExperimentId,
    pub node_id: NodeId,
    pub metadata_id: MetadataId,
    pub status: ExperimentNodeStatus,
}

impl ExperimentNode {
    pub fn key(&self) -> (ExperimentId, NodeId, MetadataId) {
        (self.experiment_id, self.node_id, self.metadata_id)
    }
}

/// A `(node, dataset)` pair an operator binds to an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub node_id: NodeId,
    pub metadata_id: MetadataId,
}
