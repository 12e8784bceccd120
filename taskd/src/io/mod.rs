//! Side-effecting operations: filesystem, processes, engine, notifications.

pub mod atomic;
pub mod config;
pub mod context;
pub mod engine;
pub mod git;
pub mod notify;
pub mod process;
pub mod prompt;
pub mod publish;
pub mod record_store;
pub mod status;
