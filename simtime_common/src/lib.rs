//! simtime Common Library
//!
//! Shared constants and configuration loading utilities for the simtime
//! workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Timer bank sizes, calibration limits, idle thresholds
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use simtime_common::consts::{NTIMERS, SIM_TMAX};
//! use simtime_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
