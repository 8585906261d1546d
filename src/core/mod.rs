//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component lifecycle
//! - [`time`] - Clocks and ticks
//! - [`error`] - Error taxonomy and wire mapping

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
