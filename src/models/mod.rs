//! Entities owned by the controller.
//!
//! Rows are plain values: the store hands out copies and every mutation goes back through a
//! [`Repository`](crate::store::Repository) call.

mod experiment;
mod experiment_node;
mod metadata;
mod node;
mod user;

pub use self::{
    experiment::{Experiment, ExperimentStatus, NewExperiment},
    experiment_node::{ExperimentNode, ExperimentNodeStatus, Participant},
    metadata::{Metadata, MetadataDescriptor},
    node::{NewNode, Node},
    user::User,
};
