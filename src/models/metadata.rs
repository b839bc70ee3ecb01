use chrono::{DateTime, Utc};

use crate::common::{MetadataId, NodeId};

/// A dataset descriptor declared by a node.
///
/// `(node_id, node_metadata_id)` is unique: `node_metadata_id` is the identifier the node uses
/// locally for the data partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: MetadataId,
    pub node_id: NodeId,
    pub node_metadata_id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: String,
    pub description: String,
    pub extras: String,
    pub created_at: DateTime<Utc>,
}

/// What a node sends when it declares a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataDescriptor {
    pub node_metadata_id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: String,
    pub description: String,
    pub extras: String,
}
