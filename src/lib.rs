//! Coordination of federated learning experiments across remote worker nodes.
//!
//! The controller registers nodes and their datasets, hands out bundles of training code, keeps
//! a per-node [`mailbox`] of instructions the nodes poll, and runs the aggregation backend
//! through a [`supervisor`] while an experiment is active. All state transitions live in
//! [`lifecycle`].

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

pub mod bundle;
pub mod common;
pub mod error;
pub mod integrity;
pub mod lifecycle;
pub mod logging;
pub mod mailbox;
pub mod models;
pub mod registry;
pub mod rest;
pub mod settings;
pub mod signal;
pub mod store;
pub mod supervisor;
