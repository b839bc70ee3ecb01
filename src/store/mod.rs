//! Storage API.
//!
//! The coordinator treats persistence as a transactional row store. A [`Store`] answers row
//! operations directly (each one is its own atomic unit) and opens [`Transaction`]s for
//! multi-row transitions. Writes made through a transaction become visible on
//! [`Transaction::commit`]; dropping the transaction discards them.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use self::memory::{MemoryStore, MemoryTransaction};
use crate::{
    common::{ExperimentId, MetadataId, NodeId, UserId},
    models::{
        Experiment,
        ExperimentNode,
        ExperimentNodeStatus,
        ExperimentStatus,
        Metadata,
        MetadataDescriptor,
        NewExperiment,
        NewNode,
        Node,
        User,
    },
};

/// The error type for storage operations. These are failures of the persistence layer itself
/// (constraint violations, lost connections, ...), not domain errors.
pub type StoreError = anyhow::Error;

/// The result of a storage operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// Row operations shared by autocommit handles and open transactions.
#[async_trait]
pub trait Repository: Send {
    /// Inserts an operator account.
    async fn insert_user(&mut self, username: &str) -> StoreResult<User>;

    async fn user(&mut self, id: UserId) -> StoreResult<Option<User>>;

    /// Inserts a node. Fails if the username or the public key is already taken.
    async fn insert_node(&mut self, node: &NewNode) -> StoreResult<Node>;

    async fn node(&mut self, id: NodeId) -> StoreResult<Option<Node>>;

    async fn nodes(&mut self) -> StoreResult<Vec<Node>>;

    /// Overwrites an existing node row. Fails if the node does not exist.
    async fn update_node(&mut self, node: &Node) -> StoreResult<()>;

    /// Sets `last_seen` of one node and leaves every other column alone. Returns `None` for an
    /// unknown node.
    async fn touch_node(&mut self, id: NodeId, seen: DateTime<Utc>) -> StoreResult<Option<Node>>;

    /// Deletes a node together with the metadata it declared.
    ///
    /// # Behavior
    ///
    /// - If the node exists, delete it and return `StoreResult::Ok(true)`.
    /// - If it does not exist, return `StoreResult::Ok(false)`.
    async fn delete_node(&mut self, id: NodeId) -> StoreResult<bool>;

    /// Inserts a dataset descriptor for `node_id`. Fails if the node does not exist or already
    /// declared the same `node_metadata_id`.
    async fn insert_metadata(
        &mut self,
        node_id: NodeId,
        descriptor: &MetadataDescriptor,
    ) -> StoreResult<Metadata>;

    async fn metadata(&mut self, id: MetadataId) -> StoreResult<Option<Metadata>>;

    async fn metadata_list(&mut self) -> StoreResult<Vec<Metadata>>;

    /// Inserts an experiment in status `PENDING` without a bundle.
    async fn insert_experiment(&mut self, experiment: &NewExperiment) -> StoreResult<Experiment>;

    async fn experiment(&mut self, id: ExperimentId) -> StoreResult<Option<Experiment>>;

    async fn experiments(&mut self) -> StoreResult<Vec<Experiment>>;

    /// Overwrites an existing experiment row and bumps its `updated_at`.
    async fn update_experiment(&mut self, experiment: &Experiment) -> StoreResult<()>;

    /// Counts the experiments whose status is one of `statuses`.
    async fn count_experiments(&mut self, statuses: &[ExperimentStatus]) -> StoreResult<usize>;

    /// Inserts participation rows. Fails on a duplicate key or a dangling reference; nothing is
    /// inserted in that case.
    async fn insert_experiment_nodes(&mut self, rows: &[ExperimentNode]) -> StoreResult<()>;

    /// All participation rows of an experiment, ordered by `(node_id, metadata_id)`.
    async fn experiment_nodes(
        &mut self,
        experiment_id: ExperimentId,
    ) -> StoreResult<Vec<ExperimentNode>>;

    /// The participation rows of one node within one experiment.
    async fn participation(
        &mut self,
        experiment_id: ExperimentId,
        node_id: NodeId,
    ) -> StoreResult<Vec<ExperimentNode>>;

    /// Whether `node_id` appears in any experiment.
    async fn is_participating(&mut self, node_id: NodeId) -> StoreResult<bool>;

    /// Sets the status of one participation row. Fails if the row does not exist.
    async fn set_participation_status(
        &mut self,
        key: (ExperimentId, NodeId, MetadataId),
        status: ExperimentNodeStatus,
    ) -> StoreResult<()>;
}

/// A connection to the row store.
#[async_trait]
pub trait Store
where
    Self: Repository + Clone + Sync + 'static,
{
    type Transaction: Transaction;

    /// Opens a transaction.
    async fn begin(&self) -> StoreResult<Self::Transaction>;
}

/// An open atomic unit. Dropping it without calling [`commit`](Transaction::commit) rolls
/// every write back.
#[async_trait]
pub trait Transaction
where
    Self: Repository + Sized,
{
    async fn commit(self) -> StoreResult<()>;
}

/// Convenience filters over participation rows.
pub trait ParticipationExt {
    fn with_status(self, status: ExperimentNodeStatus) -> Vec<ExperimentNode>;
    fn count_status(&self, status: ExperimentNodeStatus) -> usize;
}

impl ParticipationExt for Vec<ExperimentNode> {
    fn with_status(self, status: ExperimentNodeStatus) -> Vec<ExperimentNode> {
        self.into_iter().filter(|row| row.status == status).collect()
    }

    fn count_status(&self, status: ExperimentNodeStatus) -> usize {
        self.iter().filter(|row| row.status == status).count()
    }
}
