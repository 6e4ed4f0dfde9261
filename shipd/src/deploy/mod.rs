//! Deployment pipelines and their building blocks

pub mod artifacts;
pub mod fsm;
pub mod git;
pub mod hooks;
pub mod image;
pub mod pipeline;
pub mod ports;
pub mod registry;
pub mod rollback;
pub mod strategy;
