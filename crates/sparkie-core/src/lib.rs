//! # Sparkie Core
//!
//! Shared configuration and error types used by every Sparkie crate.

pub mod config;
pub mod error;

pub use config::SparkieConfig;
pub use error::{Result, SparkieError};
