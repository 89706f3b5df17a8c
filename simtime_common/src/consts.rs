//! System-wide constants for the simtime workspace.
//!
//! Single source of truth for the timer bank size, calibration limits and
//! idle thresholds. Imported by all crates.

use static_assertions::const_assert;

/// Number of independent calibrated timer channels.
pub const NTIMERS: usize = 8;

/// Nominal wall-clock length of one calibration interval [ms].
pub const NOMINAL_INTERVAL_MS: u32 = 1000;

/// Maximum virtual/real drift folded into the next interval [ms].
pub const SIM_TMAX: i32 = 500;

/// Delay returned by calibration for a channel index outside the bank.
pub const CALIBRATE_FALLBACK_DELAY: u32 = 10_000;

/// Wall-clock gap above which a calibration boundary is abandoned [ms].
pub const MAX_CALIBRATION_GAP_MS: u32 = 30_000;

/// Number of 1 ms sleeps sampled by the sleep-resolution probe.
pub const SLEEP_SAMPLES: u32 = 100;

/// Sleep resolution above which idling is considered unsupported [ms].
pub const SIM_IDLE_MAX: u32 = 10;

/// Minimum stability threshold [s].
pub const SIM_IDLE_STMIN: u32 = 10;

/// Default stability threshold [s].
pub const SIM_IDLE_STDFLT: u32 = 20;

/// Maximum stability threshold [s].
pub const SIM_IDLE_STMAX: u32 = 600;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/simtime.toml";

const_assert!(NTIMERS > 0);
const_assert!(SIM_TMAX > 0 && (SIM_TMAX as u32) < NOMINAL_INTERVAL_MS);
const_assert!(SIM_IDLE_STMIN <= SIM_IDLE_STDFLT && SIM_IDLE_STDFLT <= SIM_IDLE_STMAX);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_interval_window_stays_positive() {
        // nxintv = 1000 + clamp(drift, ±SIM_TMAX) must never reach zero.
        let min = NOMINAL_INTERVAL_MS as i32 - SIM_TMAX;
        let max = NOMINAL_INTERVAL_MS as i32 + SIM_TMAX;
        assert!(min > 0);
        assert!(max < 2 * NOMINAL_INTERVAL_MS as i32);
    }

    #[test]
    fn gap_limit_spans_many_intervals() {
        assert!(MAX_CALIBRATION_GAP_MS > 10 * NOMINAL_INTERVAL_MS);
    }
}
