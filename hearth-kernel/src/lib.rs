//! Hearth kernel: control plane of a fleet of game-server nodes.
//!
//! Nodes dial the control channel (`channel`), commands are correlated with
//! their acks (`commands`), syncs are reconciled into the store (`reconcile`),
//! and live state fans out to operators through the hub (`hub`, `monitor`).

pub mod backups;
pub mod channel;
pub mod commands;
pub mod config;
pub mod health;
pub mod http;
pub mod hub;
pub mod models;
pub mod monitor;
pub mod operations;
pub mod reconcile;
pub mod state;
pub mod store;

pub use state::KernelState;
