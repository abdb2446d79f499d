//! # Utility Functions (`utils`)
//!
//! Helpers around the core pipeline, currently state-dict persistence.

pub mod serialization;

pub use serialization::{load_state, save_state, SerializationError};
