//! # Configuration Module
//!
//! Centralizes the store's geometry and policy constants. Interdependent
//! values are co-located in [`constants`] and enforced through compile-time
//! assertions rather than scattered across the modules that use them.

pub mod constants;
pub use constants::*;
