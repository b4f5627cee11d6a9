//! Runtime adapters: the HTTP surface, telemetry and their errors.

pub mod error;
pub mod http;
pub mod telemetry;
