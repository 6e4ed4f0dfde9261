//! shipd library
//!
//! Single-node deployment orchestration: versioned releases, container
//! engine execution, health verification and rollback.

pub mod app;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod storage;
pub mod stream;
pub mod utils;
pub mod workers;
