//! GymFlow Shared Types and Utilities
//!
//! Identifier types, errors and database helpers shared by the billing engine
//! and the worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
