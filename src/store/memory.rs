//! In-process row store.
//!
//! All tables live behind one async mutex. A transaction takes the lock for its whole lifetime
//! and works on a copy of the tables that replaces the live ones on commit, so transactions are
//! serialised and a dropped transaction leaves no trace.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Repository, Store, StoreResult, Transaction};
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

type ParticipationKey = (ExperimentId, NodeId, MetadataId);

#[derive(Debug, Default, Clone)]
struct Sequences {
    user: u64,
    node: u64,
    metadata: u64,
    experiment: u64,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    users: BTreeMap<UserId, User>,
    nodes: BTreeMap<NodeId, Node>,
    metadata: BTreeMap<MetadataId, Metadata>,
    experiments: BTreeMap<ExperimentId, Experiment>,
    experiment_nodes: BTreeMap<ParticipationKey, ExperimentNode>,
    sequences: Sequences,
}

fn next(sequence: &mut u64) -> u64 {
    *sequence += 1;
    *sequence
}

impl Tables {
    fn insert_user(&mut self, username: &str) -> StoreResult<User> {
        if self.users.values().any(|user| user.username == username) {
            bail!("user {} already exists", username);
        }
        let user = User {
            id: UserId::new(next(&mut self.sequences.user)),
            username: username.to_string(),
            approved: true,
            created_at: Utc::now(),
        };
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn user(&self, id: UserId) -> Option<User> {
        self.users.get(&id).cloned()
    }

    fn insert_node(&mut self, new: &NewNode) -> StoreResult<Node> {
        if let Some(existing) = self
            .nodes
            .values()
            .find(|node| node.username == new.username || node.public_key == new.public_key)
        {
            bail!("node conflicts with existing node {}", existing.id);
        }
        let now = Utc::now();
        let node = Node {
            id: NodeId::new(next(&mut self.sequences.node)),
            username: new.username.clone(),
            public_key: new.public_key.clone(),
            approved: false,
            last_seen: now,
            created_at: now,
            updated_at: now,
        };
        self.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    fn node(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    fn update_node(&mut self, node: &Node) -> StoreResult<()> {
        let row = self
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| anyhow!("node {} does not exist", node.id))?;
        *row = node.clone();
        row.updated_at = Utc::now();
        Ok(())
    }

    fn touch_node(&mut self, id: NodeId, seen: DateTime<Utc>) -> Option<Node> {
        let row = self.nodes.get_mut(&id)?;
        row.last_seen = seen;
        Some(row.clone())
    }

    fn delete_node(&mut self, id: NodeId) -> bool {
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        self.metadata.retain(|_, metadata| metadata.node_id != id);
        true
    }

    fn insert_metadata(
        &mut self,
        node_id: NodeId,
        descriptor: &MetadataDescriptor,
    ) -> StoreResult<Metadata> {
        if !self.nodes.contains_key(&node_id) {
            bail!("node {} does not exist", node_id);
        }
        if self.metadata.values().any(|metadata| {
            metadata.node_id == node_id && metadata.node_metadata_id == descriptor.node_metadata_id
        }) {
            bail!(
                "node {} already declared metadata {}",
                node_id,
                descriptor.node_metadata_id
            );
        }
        let metadata = Metadata {
            id: MetadataId::new(next(&mut self.sequences.metadata)),
            node_id,
            node_metadata_id: descriptor.node_metadata_id,
            name: descriptor.name.clone(),
            kind: descriptor.kind.clone(),
            tags: descriptor.tags.clone(),
            description: descriptor.description.clone(),
            extras: descriptor.extras.clone(),
            created_at: Utc::now(),
        };
        self.metadata.insert(metadata.id, metadata.clone());
        Ok(metadata)
    }

    fn metadata(&self, id: MetadataId) -> Option<Metadata> {
        self.metadata.get(&id).cloned()
    }

    fn metadata_list(&self) -> Vec<Metadata> {
        self.metadata.values().cloned().collect()
    }

    fn insert_experiment(&mut self, new: &NewExperiment) -> StoreResult<Experiment> {
        if !self.users.contains_key(&new.user_id) {
            bail!("user {} does not exist", new.user_id);
        }
        let now = Utc::now();
        let experiment = Experiment {
            id: ExperimentId::new(next(&mut self.sequences.experiment)),
            user_id: new.user_id,
            name: new.name.clone(),
            description: new.description.clone(),
            files_path: None,
            status: ExperimentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(experiment)
    }

    fn experiment(&self, id: ExperimentId) -> Option<Experiment> {
        self.experiments.get(&id).cloned()
    }

    fn experiments(&self) -> Vec<Experiment> {
        self.experiments.values().cloned().collect()
    }

    fn update_experiment(&mut self, experiment: &Experiment) -> StoreResult<()> {
        let row = self
            .experiments
            .get_mut(&experiment.id)
            .ok_or_else(|| anyhow!("experiment {} does not exist", experiment.id))?;
        *row = experiment.clone();
        row.updated_at = Utc::now();
        Ok(())
    }

    fn count_experiments(&self, statuses: &[ExperimentStatus]) -> usize {
        self.experiments
            .values()
            .filter(|experiment| statuses.contains(&experiment.status))
            .count()
    }

    fn insert_experiment_nodes(&mut self, rows: &[ExperimentNode]) -> StoreResult<()> {
        for (i, row) in rows.iter().enumerate() {
            if !self.experiments.contains_key(&row.experiment_id) {
                bail!("experiment {} does not exist", row.experiment_id);
            }
            if !self.nodes.contains_key(&row.node_id) {
                bail!("node {} does not exist", row.node_id);
            }
            if !self.metadata.contains_key(&row.metadata_id) {
                bail!("metadata {} does not exist", row.metadata_id);
            }
            if self.experiment_nodes.contains_key(&row.key())
                || rows[..i].iter().any(|other| other.key() == row.key())
            {
                bail!(
                    "node {} is already bound to experiment {} with metadata {}",
                    row.node_id,
                    row.experiment_id,
                    row.metadata_id
                );
            }
        }
        self.experiment_nodes
            .extend(rows.iter().map(|row| (row.key(), row.clone())));
        Ok(())
    }

    fn experiment_nodes(&self, experiment_id: ExperimentId) -> Vec<ExperimentNode> {
        self.experiment_nodes
            .values()
            .filter(|row| row.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    fn participation(&self, experiment_id: ExperimentId, node_id: NodeId) -> Vec<ExperimentNode> {
        self.experiment_nodes
            .values()
            .filter(|row| row.experiment_id == experiment_id && row.node_id == node_id)
            .cloned()
            .collect()
    }

    fn is_participating(&self, node_id: NodeId) -> bool {
        self.experiment_nodes
            .values()
            .any(|row| row.node_id == node_id)
    }

    fn set_participation_status(
        &mut self,
        key: ParticipationKey,
        status: ExperimentNodeStatus,
    ) -> StoreResult<()> {
        let row = self.experiment_nodes.get_mut(&key).ok_or_else(|| {
            anyhow!(
                "node {} is not bound to experiment {} with metadata {}",
                key.1,
                key.0,
                key.2
            )
        })?;
        row.status = status;
        Ok(())
    }
}

/// Implements [`Repository`] for a handle by forwarding every call to a [`Tables`] expression.
macro_rules! forward_repository {
    ($ty:ty, $this:ident => $tables:expr) => {
        #[async_trait]
        impl Repository for $ty {
            async fn insert_user(&mut self, username: &str) -> StoreResult<User> {
                let $this = self;
                $tables.insert_user(username)
            }

            async fn user(&mut self, id: UserId) -> StoreResult<Option<User>> {
                let $this = self;
                Ok($tables.user(id))
            }

            async fn insert_node(&mut self, node: &NewNode) -> StoreResult<Node> {
                let $this = self;
                $tables.insert_node(node)
            }

            async fn node(&mut self, id: NodeId) -> StoreResult<Option<Node>> {
                let $this = self;
                Ok($tables.node(id))
            }

            async fn nodes(&mut self) -> StoreResult<Vec<Node>> {
                let $this = self;
                Ok($tables.nodes())
            }

            async fn update_node(&mut self, node: &Node) -> StoreResult<()> {
                let $this = self;
                $tables.update_node(node)
            }

            async fn touch_node(
                &mut self,
                id: NodeId,
                seen: DateTime<Utc>,
            ) -> StoreResult<Option<Node>> {
                let $this = self;
                Ok($tables.touch_node(id, seen))
            }

            async fn delete_node(&mut self, id: NodeId) -> StoreResult<bool> {
                let $this = self;
                Ok($tables.delete_node(id))
            }

            async fn insert_metadata(
                &mut self,
                node_id: NodeId,
                descriptor: &MetadataDescriptor,
            ) -> StoreResult<Metadata> {
                let $this = self;
                $tables.insert_metadata(node_id, descriptor)
            }

            async fn metadata(&mut self, id: MetadataId) -> StoreResult<Option<Metadata>> {
                let $this = self;
                Ok($tables.metadata(id))
            }

            async fn metadata_list(&mut self) -> StoreResult<Vec<Metadata>> {
                let $this = self;
                Ok($tables.metadata_list())
            }

            async fn insert_experiment(
                &mut self,
                experiment: &NewExperiment,
            ) -> StoreResult<Experiment> {
                let $this = self;
                $tables.insert_experiment(experiment)
            }

            async fn experiment(&mut self, id: ExperimentId) -> StoreResult<Option<Experiment>> {
                let $this = self;
                Ok($tables.experiment(id))
            }

            async fn experiments(&mut self) -> StoreResult<Vec<Experiment>> {
                let $this = self;
                Ok($tables.experiments())
            }

            async fn update_experiment(&mut self, experiment: &Experiment) -> StoreResult<()> {
                let $this = self;
                $tables.update_experiment(experiment)
            }

            async fn count_experiments(
                &mut self,
                statuses: &[ExperimentStatus],
            ) -> StoreResult<usize> {
                let $this = self;
                Ok($tables.count_experiments(statuses))
            }

            async fn insert_experiment_nodes(&mut self, rows: &[ExperimentNode]) -> StoreResult<()> {
                let $this = self;
                $tables.insert_experiment_nodes(rows)
            }

            async fn experiment_nodes(
                &mut self,
                experiment_id: ExperimentId,
            ) -> StoreResult<Vec<ExperimentNode>> {
                let $this = self;
                Ok($tables.experiment_nodes(experiment_id))
            }

            async fn participation(
                &mut self,
                experiment_id: ExperimentId,
                node_id: NodeId,
            ) -> StoreResult<Vec<ExperimentNode>> {
                let $this = self;
                Ok($tables.participation(experiment_id, node_id))
            }

            async fn is_participating(&mut self, node_id: NodeId) -> StoreResult<bool> {
                let $this = self;
                Ok($tables.is_participating(node_id))
            }

            async fn set_participation_status(
                &mut self,
                key: ParticipationKey,
                status: ExperimentNodeStatus,
            ) -> StoreResult<()> {
                let $this = self;
                $tables.set_participation_status(key, status)
            }
        }
    };
}

/// A cheaply clonable handle to the in-process tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

forward_repository!(MemoryStore, this => this.tables.lock().await);

#[async_trait]
impl Store for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> StoreResult<MemoryTransaction> {
        let live = self.tables.clone().lock_owned().await;
        let working = live.clone();
        Ok(MemoryTransaction { live, working })
    }
}

/// An open transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    live: OwnedMutexGuard<Tables>,
    working: Tables,
}

forward_repository!(MemoryTransaction, this => this.working);

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self) -> StoreResult<()> {
        let MemoryTransaction { mut live, working } = self;
        *live = working;
        Ok(())
    }
}
