//! Pool of recycled rendering-engine processes.
//!
//! [`ResolverRegistry`] maps pool keys to [`Resolver`]s; each resolver owns at
//! most one live process at a time and hands out [`Page`]s from it.

mod error;
mod hooks;
mod page;
mod registry;
mod resolver;
mod state;

pub use error::PoolError;
pub use page::Page;
pub use registry::{ResolveOptions, ResolverRegistry};
pub use resolver::{
    DEFAULT_END_OF_LIFE_PAGE_COUNT, Resolver, ResolverConfig, ResolverPhase, ResolverSnapshot,
};
pub use state::ResolverState;
