//! Utility functions and helpers.
//!
//! Environment variable lookup shared by the configuration types.

pub mod env;

pub use env::{get_env_with_prefix, parse_env_with_prefix};
