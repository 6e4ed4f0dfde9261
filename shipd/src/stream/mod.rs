//! Deployment progress streams and cancellation

pub mod cancel;
pub mod logs;
