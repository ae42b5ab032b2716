//! Batch aggregate - one outstanding call to the inference backend.
//!
//! - Batch types and states (typestate pattern)
//! - State transition methods

pub mod state;
pub mod transitions;

pub use state::*;
