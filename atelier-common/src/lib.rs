//! Shared types, configuration, and logging for the Atelier installation services.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result, ResultExt};
