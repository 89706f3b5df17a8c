//! Prelude module for common re-exports.
//!
//! ```rust
//! use simtime_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, SharedConfig};

// ─── Timer Constants ────────────────────────────────────────────────
pub use crate::consts::{
    NOMINAL_INTERVAL_MS, NTIMERS, SIM_IDLE_MAX, SIM_IDLE_STDFLT, SIM_IDLE_STMAX, SIM_IDLE_STMIN,
    SIM_TMAX,
};
