//! Operator accounts, nodes and the dataset descriptors nodes declare.
//!
//! Nodes register themselves and stay unapproved until an operator approves them. Every poll
//! counts as a sign of life; there is no eviction of stale nodes.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    common::NodeId,
    error::CoordinationError,
    mailbox::{Instruction, Mailbox},
    models::{Metadata, MetadataDescriptor, NewNode, Node, User},
    store::{Repository, Store, Transaction},
};

pub struct Registry<S> {
    store: S,
    mailbox: Arc<Mailbox>,
}

impl<S> Registry<S>
where
    S: Store,
{
    pub fn new(store: S, mailbox: Arc<Mailbox>) -> Self {
        Self { store, mailbox }
    }

    pub async fn register_user(&self, username: &str) -> Result<User, CoordinationError> {
        if username.trim().is_empty() {
            return Err(CoordinationError::validation("username is required"));
        }
        let user = self.store.clone().insert_user(username).await?;
        info!(user_id = %user.id, "operator registered");
        Ok(user)
    }

    /// Registers a node. It cannot be bound to experiments before an operator approved it.
    pub async fn register_node(&self, new: NewNode) -> Result<Node, CoordinationError> {
        if new.username.trim().is_empty() || new.public_key.trim().is_empty() {
            return Err(CoordinationError::validation(
                "username and public key are required",
            ));
        }
        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx
            .nodes()
            .await?
            .into_iter()
            .find(|node| node.username == new.username || node.public_key == new.public_key)
        {
            let taken = if existing.username == new.username {
                "username"
            } else {
                "public key"
            };
            return Err(CoordinationError::validation(format!(
                "{} already registered",
                taken
            )));
        }
        let node = tx.insert_node(&new).await?;
        tx.commit().await?;
        info!(node_id = %node.id, username = %node.username, "node registered");
        Ok(node)
    }

    pub async fn approve_node(&self, node_id: NodeId) -> Result<Node, CoordinationError> {
        let mut tx = self.store.begin().await?;
        let mut node = fetch_node(&mut tx, node_id).await?;
        if !node.approved {
            node.approved = true;
            tx.update_node(&node).await?;
            tx.commit().await?;
            info!(%node_id, "node approved");
        }
        Ok(node)
    }

    /// Deletes a node and its dataset descriptors. A node bound to an experiment stays.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<(), CoordinationError> {
        let mut tx = self.store.begin().await?;
        if tx.is_participating(node_id).await? {
            return Err(CoordinationError::validation(format!(
                "node {} takes part in an experiment",
                node_id
            )));
        }
        if !tx.delete_node(node_id).await? {
            return Err(CoordinationError::not_found(format_args!("node {}", node_id)));
        }
        tx.commit().await?;
        info!(%node_id, "node removed");
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, CoordinationError> {
        Ok(self.store.clone().nodes().await?)
    }

    /// Records that the node was seen just now.
    pub async fn heartbeat(&self, node_id: NodeId) -> Result<Node, CoordinationError> {
        self.store
            .clone()
            .touch_node(node_id, Utc::now())
            .await?
            .ok_or_else(|| CoordinationError::not_found(format_args!("node {}", node_id)))
    }

    /// Hands the node everything queued for it. Never fails: a failed heartbeat is logged and
    /// the mailbox is drained regardless.
    pub async fn poll(&self, node_id: NodeId) -> Vec<Instruction> {
        if let Err(err) = self.heartbeat(node_id).await {
            warn!(%node_id, error = %err, "failed to record node heartbeat");
        }
        let instructions = self.mailbox.drain(node_id);
        if !instructions.is_empty() {
            debug!(%node_id, count = instructions.len(), "instructions delivered");
        }
        instructions
    }

    /// Stores a dataset descriptor declared by `node_id`.
    pub async fn register_metadata(
        &self,
        node_id: NodeId,
        descriptor: MetadataDescriptor,
    ) -> Result<Metadata, CoordinationError> {
        if descriptor.name.trim().is_empty() {
            return Err(CoordinationError::validation("metadata name is required"));
        }
        let mut tx = self.store.begin().await?;
        fetch_node(&mut tx, node_id).await?;
        let duplicate = tx.metadata_list().await?.into_iter().any(|metadata| {
            metadata.node_id == node_id && metadata.node_metadata_id == descriptor.node_metadata_id
        });
        if duplicate {
            return Err(CoordinationError::validation(format!(
                "node {} already declared metadata {}",
                node_id, descriptor.node_metadata_id
            )));
        }
        let metadata = tx.insert_metadata(node_id, &descriptor).await?;
        tx.commit().await?;
        info!(%node_id, metadata_id = %metadata.id, name = %metadata.name, "metadata registered");
        Ok(metadata)
    }

    pub async fn list_metadata(&self) -> Result<Vec<Metadata>, CoordinationError> {
        Ok(self.store.clone().metadata_list().await?)
    }
}

async fn fetch_node<R: Repository>(repo: &mut R, node_id: NodeId) -> Result<Node, CoordinationError> {
    repo.node(node_id)
        .await?
        .ok_or_else(|| CoordinationError::not_found(format_args!("node {}", node_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::ExperimentId,
        error::ErrorKind,
        models::{ExperimentNode, ExperimentNodeStatus, NewExperiment},
        store::MemoryStore,
    };

    fn registry() -> (Registry<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        (
            Registry::new(store.clone(), Arc::new(Mailbox::new())),
            store,
        )
    }

    fn new_node(username: &str, public_key: &str) -> NewNode {
        NewNode {
            username: username.into(),
            public_key: public_key.into(),
        }
    }

    #[tokio::test]
    async fn test_register_and_approve_node() {
        let (registry, _) = registry();
        let node = registry
            .register_node(new_node("node-a", "ecdsa a"))
            .await
            .unwrap();
        assert!(!node.approved);

        let approved = registry.approve_node(node.id).await.unwrap();
        assert!(approved.approved);
        let nodes = registry.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].approved);

        let err = registry.approve_node(NodeId::new(9)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_node_is_rejected() {
        let (registry, _) = registry();
        registry
            .register_node(new_node("node-a", "ecdsa a"))
            .await
            .unwrap();

        for duplicate in [new_node("node-a", "ecdsa b"), new_node("node-b", "ecdsa a")] {
            let err = registry.register_node(duplicate).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        let err = registry.register_node(new_node("", "ecdsa c")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_poll_drains_and_touches_last_seen() {
        let (registry, _) = registry();
        let node = registry
            .register_node(new_node("node-a", "ecdsa a"))
            .await
            .unwrap();
        registry
            .mailbox
            .enqueue(node.id, Instruction::start_training(ExperimentId::new(1)));

        let instructions = registry.poll(node.id).await;
        assert_eq!(instructions.len(), 1);
        assert!(registry.poll(node.id).await.is_empty());

        let seen = registry.list_nodes().await.unwrap()[0].last_seen;
        assert!(seen >= node.last_seen);

        // unknown nodes still get an answer
        assert!(registry.poll(NodeId::new(42)).await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_only_touches_last_seen() {
        let (registry, mut store) = registry();
        let node = registry
            .register_node(new_node("node-a", "ecdsa a"))
            .await
            .unwrap();
        let stale = store.node(node.id).await.unwrap().unwrap();
        registry.approve_node(node.id).await.unwrap();

        let seen = registry.heartbeat(node.id).await.unwrap();
        assert!(seen.approved);
        assert!(seen.last_seen >= stale.last_seen);
        assert_eq!(store.node(node.id).await.unwrap().unwrap(), seen);

        let err = registry.heartbeat(NodeId::new(9)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_metadata_is_unique_per_node() {
        let (registry, _) = registry();
        let node = registry
            .register_node(new_node("node-a", "ecdsa a"))
            .await
            .unwrap();
        let descriptor = MetadataDescriptor {
            node_metadata_id: 3,
            name: "mnist-partition".into(),
            kind: "image".into(),
            ..Default::default()
        };

        let metadata = registry
            .register_metadata(node.id, descriptor.clone())
            .await
            .unwrap();
        assert_eq!(metadata.kind, "image");
        let err = registry
            .register_metadata(node.id, descriptor.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = registry
            .register_metadata(NodeId::new(9), descriptor)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(registry.list_metadata().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_participating_node_cannot_be_removed() {
        let (registry, mut store) = registry();
        let user = registry.register_user("operator").await.unwrap();
        let busy = registry
            .register_node(new_node("node-a", "ecdsa a"))
            .await
            .unwrap();
        let idle = registry
            .register_node(new_node("node-b", "ecdsa b"))
            .await
            .unwrap();
        let metadata = registry
            .register_metadata(
                busy.id,
                MetadataDescriptor {
                    name: "partition".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let experiment = store
            .insert_experiment(&NewExperiment {
                user_id: user.id,
                name: "mnist".into(),
                description: String::new(),
            })
            .await
            .unwrap();
        store
            .insert_experiment_nodes(&[ExperimentNode {
                experiment_id: experiment.id,
                node_id: busy.id,
                metadata_id: metadata.id,
                status: ExperimentNodeStatus::Pending,
            }])
            .await
            .unwrap();

        let err = registry.remove_node(busy.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        registry.remove_node(idle.id).await.unwrap();
        let err = registry.remove_node(idle.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(store.node(idle.id).await.unwrap().is_none());
    }
}
