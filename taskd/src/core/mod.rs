//! Deterministic, pure logic shared by the worker.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod codec;
pub mod markup;
pub mod phase;
pub mod plan;
pub mod reply;
pub mod types;
