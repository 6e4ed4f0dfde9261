//! Data model

pub mod app;
pub mod config;
pub mod release;
