use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};

use crate::common::{ExperimentId, UserId};

/// Global lifecycle status of an experiment.
#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Pending,
    Preparing,
    Training,
    Stopped,
    Completed,
    Failed,
}

impl ExperimentStatus {
    /// Whether the experiment currently owns the training backend.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Preparing | Self::Training)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Training => "TRAINING",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub user_id: UserId,
    pub name: String,
    pub description: String,
    /// Root of the unpacked artifact bundle. `None` until a bundle passed validation.
    pub files_path: Option<PathBuf>,
    pub status: ExperimentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator-supplied fields of a new experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}
