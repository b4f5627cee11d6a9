//! Render pages through a pool of recycled headless browser processes.

pub mod application;
pub mod config;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod pool;
pub mod quiescence;
pub mod util;
