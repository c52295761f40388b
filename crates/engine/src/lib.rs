//! Ceremony queue monitoring engine.
//!
//! This crate contains the status client, the retrying probe, change
//! detection, the per-user monitors and the registry that owns them.

pub mod client;
pub mod detector;
pub mod error;
pub mod health;
pub mod monitor;
pub mod probe;
pub mod registry;
pub mod sink;
pub mod store;

pub use client::*;
pub use detector::*;
pub use error::*;
pub use health::*;
pub use monitor::*;
pub use probe::*;
pub use registry::*;
pub use sink::*;
pub use store::*;
