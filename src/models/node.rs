use chrono::{DateTime, Utc};

use crate::common::NodeId;

/// A worker node known to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub username: String,
    /// Public key the node presents to the aggregation service. It is written to the
    /// authorized-keys file when an experiment the node accepted is started.
    pub public_key: String,
    pub approved: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The fields a node supplies when it registers itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNode {
    pub username: String,
    pub public_key: String,
}
