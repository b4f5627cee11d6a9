pub(crate) mod lock;
pub mod wait;
