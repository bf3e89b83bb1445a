//! Client agent for a remote fuzzing service.
//!
//! The service decides what to test; this crate dials it over a persistent
//! websocket, carries out its directives locally and reports back:
//!
//! - **[`core`]**: Pure, deterministic logic (wire schema, typed actions, frame
//!   classification, session counters, verdicts). No I/O.
//! - **[`io`]**: Side effects (configuration, shell stages, environment
//!   snapshot, HTTP replay, the websocket transport).
//!
//! Orchestration modules ([`start`], [`step`], [`fuzz`], [`lint`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod fuzz;
pub mod io;
pub mod lint;
pub mod logging;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
