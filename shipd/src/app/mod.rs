//! Orchestrator wiring

pub mod locks;
pub mod options;
pub mod state;
