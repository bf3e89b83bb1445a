//! I/O helpers for agent commands.

pub mod config;
pub mod http;
pub mod process;
pub mod script;
pub mod snapshot;
pub mod spec;
pub mod template;
pub mod transport;
