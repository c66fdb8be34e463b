//! Shared helpers used across client components.

pub mod background;
pub mod serde;

pub use background::PeriodicTask;
