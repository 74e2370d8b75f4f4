//! Core coordination layer for Commander: locking, state, reconciliation and rules.

pub mod atomic;
pub mod backend;
pub mod config;
pub mod doctor;
pub mod events;
pub mod home;
pub mod lock;
pub mod model;
pub mod process;
pub mod reconcile;
pub mod rules;
pub mod safety;
pub mod session;
pub mod state;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
