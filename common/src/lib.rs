//! Common Utilities and Types Library
//! 
//! This crate provides shared types and utilities used across the DCI scanner.

pub mod bounded;
pub mod dci;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use bounded::{BoundedQueue, PushError, SharedQueue};
pub use dci::*;
pub use types::*;
pub use utils::*;
