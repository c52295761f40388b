//! Core data types for the ceremony monitor.

pub mod observation;
pub mod status;
pub mod token;
pub mod user;

pub use observation::*;
pub use status::*;
pub use token::*;
pub use user::*;
