//! # Pushclock Core
//! Shared error taxonomy, domain types, traits and configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::PushclockConfig;
pub use error::{PushclockError, Result};
