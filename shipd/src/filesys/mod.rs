//! Filesystem primitives

pub mod dir;
pub mod file;
