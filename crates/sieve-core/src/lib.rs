//! Sieve Core
//!
//! Core domain types, traits, and error handling for Sieve.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the runner and the CLI.

pub mod error;
pub mod events;
pub mod glob;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod predicate;
pub mod run;
pub mod trigger;

pub use error::{Error, Result};
pub use ids::*;
