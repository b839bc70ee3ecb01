//! Per-node instruction mailbox.
//!
//! Nodes are never contacted directly. The lifecycle engine drops [`Instruction`]s into the
//! mailbox and each node collects its own queue when it polls. Delivery is destructive: a
//! drained instruction is gone, and nothing survives a controller restart.
//!
//! The mailbox lock only guards the queue map and is never held across an `.await`, so polling
//! never waits on lifecycle operations.

mod instruction;

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

pub use self::instruction::{
    ExperimentRef,
    Instruction,
    InstructionKind,
    NewExperimentPayload,
    UpdateExperimentPayload,
};
use crate::common::NodeId;

#[derive(Debug, Default)]
pub struct Mailbox {
    queues: Mutex<HashMap<NodeId, VecDeque<Instruction>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `instruction` to the queue of `node_id`.
    pub fn enqueue(&self, node_id: NodeId, instruction: Instruction) {
        debug!(%node_id, experiment_id = %instruction.experiment_id(), "enqueuing instruction");
        self.queues()
            .entry(node_id)
            .or_default()
            .push_back(instruction);
    }

    /// Appends a batch of instructions under a single lock acquisition. Order within the batch
    /// is preserved per node.
    pub fn enqueue_all<I>(&self, instructions: I)
    where
        I: IntoIterator<Item = (NodeId, Instruction)>,
    {
        let mut queues = self.queues();
        for (node_id, instruction) in instructions {
            debug!(%node_id, experiment_id = %instruction.experiment_id(), "enqueuing instruction");
            queues.entry(node_id).or_default().push_back(instruction);
        }
    }

    /// Removes and returns everything queued for `node_id`, oldest first.
    pub fn drain(&self, node_id: NodeId) -> Vec<Instruction> {
        self.queues()
            .remove(&node_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Number of instructions waiting for `node_id`.
    pub fn pending(&self, node_id: NodeId) -> usize {
        self.queues().get(&node_id).map_or(0, VecDeque::len)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<NodeId, VecDeque<Instruction>>> {
        // a panic while holding the lock cannot leave a queue half-written
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::ExperimentId;

    fn node(id: u64) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn drain_without_enqueue_is_empty() {
        let mailbox = Mailbox::new();
        assert!(mailbox.drain(node(1)).is_empty());
        assert!(mailbox.drain(node(1)).is_empty());
    }

    #[test]
    fn drain_is_fifo_and_destructive() {
        let mailbox = Mailbox::new();
        let first = Instruction::start_training(ExperimentId::new(1));
        let second = Instruction::stop_training(ExperimentId::new(1));
        mailbox.enqueue(node(1), first.clone());
        mailbox.enqueue(node(1), second.clone());

        assert_eq!(mailbox.drain(node(1)), vec![first, second]);
        assert!(mailbox.drain(node(1)).is_empty());
    }

    #[test]
    fn queues_are_independent() {
        let mailbox = Mailbox::new();
        mailbox.enqueue_all(vec![
            (node(1), Instruction::start_training(ExperimentId::new(1))),
            (node(2), Instruction::start_training(ExperimentId::new(1))),
            (node(1), Instruction::stop_training(ExperimentId::new(1))),
        ]);
        assert_eq!(mailbox.pending(node(1)), 2);
        assert_eq!(mailbox.pending(node(2)), 1);

        assert_eq!(mailbox.drain(node(2)).len(), 1);
        assert_eq!(mailbox.pending(node(1)), 2);
        assert_eq!(mailbox.pending(node(2)), 0);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let mailbox = Arc::new(Mailbox::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mailbox = mailbox.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        mailbox.enqueue(node(i % 2), Instruction::start_training(ExperimentId::new(i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mailbox.drain(node(0)).len() + mailbox.drain(node(1)).len(), 800);
    }
}
