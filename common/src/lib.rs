//! Shared building blocks for the murmur capture host and its supervisor.

pub mod config;
pub mod failed;
pub mod host;
pub mod identity;
pub mod protocol;
pub mod segment;
pub mod state;
pub mod storage;
pub mod trigger;
