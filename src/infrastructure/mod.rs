//! Transport and logging plumbing.

pub mod bluetooth;
pub mod logging;
