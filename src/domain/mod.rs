//! Domain layer types and invariants.

pub mod error;
pub mod network;
pub mod pool_key;
pub mod viewport;
