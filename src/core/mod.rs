//! Core types shared by the peer mesh and the client socket pool.
//!
//! This module provides the configuration surface, the error taxonomy, the
//! wire constants and the observer interface. It has no network code.

mod config;
mod constants;
mod error;
mod ids;
mod traits;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use ids::*;
pub use traits::*;
