//! Chrome DevTools protocol adapter.
//!
//! Each launched browser gets its own temporary profile and a single
//! websocket connection. Pages are separate targets attached with flattened
//! sessions, so every command and event on the socket names its page.

mod connection;
mod launcher;
mod page;
mod process;

pub use launcher::{ChromeLauncher, DEFAULT_COMMAND_TIMEOUT, DEFAULT_LAUNCH_TIMEOUT};
