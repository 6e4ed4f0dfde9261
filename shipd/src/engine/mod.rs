//! Container engine gateway

pub mod compose;
pub mod docker;
pub mod health;
pub mod policy;
pub mod runner;
