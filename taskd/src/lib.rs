//! Multi-user durable task worker.
//!
//! Each user owns a directory of task records. A record moves through planning,
//! stepwise execution and finalization, one phase transition per scheduler tick,
//! with every intermediate state persisted so an interrupted worker resumes where
//! it stopped. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (record codec, phase classification,
//!   plan parsing, engine reply classification). No I/O.
//! - **[`io`]**: Side-effecting operations (record store, engine processes,
//!   notifications, sync). Trait seams let tests swap in scripted fakes.
//!
//! Orchestration modules ([`machine`], [`deferral`], [`scheduler`]) coordinate
//! core logic with I/O; [`inspect`] backs the debugging CLI command.

pub mod core;
pub mod deferral;
pub mod exit_codes;
pub mod inspect;
pub mod io;
pub mod logging;
pub mod machine;
pub mod record;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
