//! `simtime.toml` loader with validation.
//!
//! Every section is optional; missing fields take the defaults of the
//! timer library. Unknown fields are rejected.

use std::path::Path;

use serde::{Deserialize, Serialize};
use simtime_common::config::{ConfigError, ConfigLoader, SharedConfig};
use simtime_common::consts::{
    NTIMERS, SIM_IDLE_MAX, SIM_IDLE_STDFLT, SIM_IDLE_STMAX, SIM_IDLE_STMIN,
};

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimtimeConfig {
    #[serde(default)]
    pub shared: SharedConfig,
    #[serde(default)]
    pub timer: TimerSection,
    #[serde(default)]
    pub idle: IdleSection,
}

/// Calibrated clock driven by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimerSection {
    /// Channel index (`0..NTIMERS`).
    pub channel: usize,
    /// Initial per-tick delay [cycles].
    pub initial_delay: u32,
    /// Nominal tick rate [Hz].
    pub ticks_per_second: u32,
}

impl Default for TimerSection {
    fn default() -> Self {
        Self {
            channel: 0,
            initial_delay: 5000,
            ticks_per_second: 100,
        }
    }
}

/// Idle behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IdleSection {
    /// Enable idling at startup (if the host supports it).
    pub enabled: bool,
    /// Stability threshold [s].
    pub stability_secs: u32,
    /// Sleep-resolution probe ceiling [ms].
    pub max_sleep_resolution_ms: u32,
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            enabled: false,
            stability_secs: SIM_IDLE_STDFLT,
            max_sleep_resolution_ms: SIM_IDLE_MAX,
        }
    }
}

impl SimtimeConfig {
    /// Validate cross-field bounds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        if self.timer.channel >= NTIMERS {
            return Err(ConfigError::ValidationError(format!(
                "timer.channel {} out of range (0..{NTIMERS})",
                self.timer.channel
            )));
        }
        if self.timer.ticks_per_second == 0 {
            return Err(ConfigError::ValidationError(
                "timer.ticks_per_second must be > 0".to_string(),
            ));
        }
        if !(SIM_IDLE_STMIN..=SIM_IDLE_STMAX).contains(&self.idle.stability_secs) {
            return Err(ConfigError::ValidationError(format!(
                "idle.stability_secs {} outside {SIM_IDLE_STMIN}..={SIM_IDLE_STMAX}",
                self.idle.stability_secs
            )));
        }
        if self.idle.max_sleep_resolution_ms == 0 {
            return Err(ConfigError::ValidationError(
                "idle.max_sleep_resolution_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and validate a runner configuration file.
pub fn load_config(path: &Path) -> Result<SimtimeConfig, ConfigError> {
    let config = SimtimeConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a runner configuration from TOML text.
pub fn parse_config(content: &str) -> Result<SimtimeConfig, ConfigError> {
    let config = SimtimeConfig::from_toml(content)?;
    config.validate()?;
    Ok(config)
}
