//! Idle decision procedure and its control surface.
//!
//! Consulted once per simulation-loop iteration. When the next pending event
//! tolerates it and the calibrated channel is stable, the host thread sleeps
//! for as much of the remaining simulated-cycle budget as fits in whole
//! host sleep-resolution intervals, and the cycles that elapsed during the
//! sleep are charged to the caller's remaining-cycle counter.
//!
//! Solves `ms_to_wait = w · ms_per_wait` for `w`:
//!
//! ```text
//! cyc_ms = currd · hz / 1000
//! w_ms   = remaining / cyc_ms
//! w_idle = w_ms / resolution_ms     (0 → not worth sleeping)
//! ```

use simtime_common::consts::{NTIMERS, SIM_IDLE_STDFLT, SIM_IDLE_STMAX, SIM_IDLE_STMIN};
use thiserror::Error;
use tracing::trace;

use crate::calibration::TimerChannel;
use crate::host::HostClock;
use crate::queue::{ClockQueue, UnitFlags};

/// Rejections from the idle control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdleError {
    /// Host sleep resolution unmeasured or coarser than requested.
    #[error("idling not supported (host sleep resolution {resolution_ms}ms)")]
    Unsupported { resolution_ms: u32 },

    /// Threshold malformed or outside the accepted range.
    #[error(
        "invalid stability threshold: {0} (expected {min}..={max}s)",
        min = SIM_IDLE_STMIN,
        max = SIM_IDLE_STMAX
    )]
    InvalidArg(String),
}

/// Contract exposed to the simulator's command dispatcher.
pub trait IdleControl {
    /// Enable idling, optionally setting the stability threshold [s].
    fn idle_enable(&mut self, threshold: Option<u32>) -> Result<(), IdleError>;

    /// Disable idling. Always succeeds.
    fn idle_disable(&mut self);

    /// One human-readable status line.
    fn idle_status(&self) -> String;
}

/// Process-wide idle configuration plus the per-channel cycles/ms cache.
#[derive(Debug, Clone)]
pub struct IdleState {
    enabled: bool,
    stability_secs: u32,
    resolution_ms: u32,
    /// 0 = not computed yet for this idle session.
    cycles_per_ms: [u32; NTIMERS],
}

impl Default for IdleState {
    fn default() -> Self {
        Self {
            enabled: false,
            stability_secs: SIM_IDLE_STDFLT,
            resolution_ms: 0,
            cycles_per_ms: [0; NTIMERS],
        }
    }
}

impl IdleState {
    /// Disabled, default threshold, resolution unmeasured.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stability threshold [s].
    #[inline]
    pub fn stability_secs(&self) -> u32 {
        self.stability_secs
    }

    /// Measured host sleep resolution [ms] (0 = idling unsupported).
    #[inline]
    pub fn sleep_resolution(&self) -> u32 {
        self.resolution_ms
    }

    /// Store the probed host sleep resolution.
    pub fn set_sleep_resolution(&mut self, ms: u32) {
        self.resolution_ms = ms;
    }

    /// Drop the cached cycles/ms of channel `tmr`.
    pub fn invalidate(&mut self, tmr: usize) {
        if let Some(slot) = self.cycles_per_ms.get_mut(tmr) {
            *slot = 0;
        }
    }

    /// Enable idling.
    ///
    /// Rejected with [`IdleError::Unsupported`] if the resolution is
    /// unmeasured or a non-zero `threshold` is finer than it, and with
    /// [`IdleError::InvalidArg`] if `threshold` is outside
    /// `SIM_IDLE_STMIN..=SIM_IDLE_STMAX`. Nothing changes on rejection.
    pub fn enable(&mut self, threshold: Option<u32>) -> Result<(), IdleError> {
        if self.resolution_ms == 0 {
            return Err(IdleError::Unsupported { resolution_ms: 0 });
        }
        if let Some(secs) = threshold {
            if secs != 0 && self.resolution_ms > secs {
                return Err(IdleError::Unsupported {
                    resolution_ms: self.resolution_ms,
                });
            }
            if !(SIM_IDLE_STMIN..=SIM_IDLE_STMAX).contains(&secs) {
                return Err(IdleError::InvalidArg(secs.to_string()));
            }
            self.stability_secs = secs;
        }
        self.enabled = true;
        self.cycles_per_ms = [0; NTIMERS];
        Ok(())
    }

    /// Dispatcher variant of [`IdleState::enable`] taking the raw decimal
    /// argument text.
    pub fn enable_with_arg(&mut self, arg: Option<&str>) -> Result<(), IdleError> {
        let threshold = match arg {
            None => None,
            Some(text) => Some(
                text.trim()
                    .parse::<u32>()
                    .map_err(|_| IdleError::InvalidArg(format!("{text:?}")))?,
            ),
        };
        self.enable(threshold)
    }

    /// Disable idling.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.cycles_per_ms = [0; NTIMERS];
    }

    /// Status line for `SHOW IDLE`.
    pub fn report(&self) -> String {
        if self.enabled {
            format!("idle enabled, stability wait = {}s", self.stability_secs)
        } else {
            "idle disabled".to_string()
        }
    }

    /// Decide whether to idle on channel `tmr`, and sleep if so.
    ///
    /// `remaining` is the caller's remaining-cycle counter. On a non-idle
    /// return it is decremented by one when `charge_if_not_idling` is set;
    /// after a sleep the estimated skipped cycles are subtracted. It is
    /// never left negative. Returns whether the host slept.
    pub fn attempt<C, Q>(
        &mut self,
        clock: &C,
        tmr: usize,
        channel: Option<&TimerChannel>,
        charge_if_not_idling: bool,
        queue: &Q,
        remaining: &mut i32,
    ) -> bool
    where
        C: HostClock + ?Sized,
        Q: ClockQueue + ?Sized,
    {
        let eligible = self.enabled
            && queue
                .head_flags()
                .is_some_and(|flags| flags.contains(UnitFlags::IDLE));
        let Some(channel) = channel.filter(|c| eligible && c.elapsed() >= self.stability_secs)
        else {
            return not_idle(charge_if_not_idling, remaining);
        };

        let cyc_ms = match self.cycles_per_ms.get_mut(tmr) {
            Some(slot) => {
                if *slot == 0 {
                    *slot = cycles_per_ms(channel);
                }
                *slot
            }
            None => 0,
        };
        if self.resolution_ms == 0 || cyc_ms == 0 {
            return not_idle(charge_if_not_idling, remaining);
        }

        let budget = (*remaining).max(0) as u32;
        let wait_ms = budget / cyc_ms;
        if wait_ms / self.resolution_ms == 0 {
            return not_idle(charge_if_not_idling, remaining);
        }

        let actual_ms = clock.sleep_ms(wait_ms);
        let skipped = u64::from(actual_ms) * u64::from(cyc_ms);
        *remaining = u64::from(budget).saturating_sub(skipped) as i32;
        trace!(
            channel = tmr,
            wait_ms,
            actual_ms,
            remaining = *remaining,
            "idled"
        );
        true
    }
}

fn not_idle(charge: bool, remaining: &mut i32) -> bool {
    if charge {
        *remaining = remaining.saturating_sub(1).max(0);
    }
    false
}

/// Simulated cycles per wall millisecond at the channel's current rate.
fn cycles_per_ms(channel: &TimerChannel) -> u32 {
    let cycles = u64::from(channel.current_delay()) * u64::from(channel.hz()) / 1000;
    cycles.min(u64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::TimerBank;
    use crate::host::ManualClock;

    const IDLE_HEAD: Option<UnitFlags> = Some(UnitFlags::IDLE);

    /// Channel 0 at 1000 cycles/tick, 100 Hz (100 cycles/ms), `secs` stable.
    fn stable_bank(clock: &ManualClock, secs: u32) -> TimerBank {
        let mut bank = TimerBank::new();
        bank.init(1000, 0, clock);
        for _ in 0..secs {
            for _ in 0..99 {
                bank.calibrate(100, 0, clock);
            }
            clock.advance(1000);
            bank.calibrate(100, 0, clock);
        }
        bank
    }

    fn enabled_state(resolution_ms: u32) -> IdleState {
        let mut idle = IdleState::new();
        idle.set_sleep_resolution(resolution_ms);
        idle.enable(Some(SIM_IDLE_STMIN)).unwrap();
        idle
    }

    #[test]
    fn enable_requires_measured_resolution() {
        let mut idle = IdleState::new();
        assert_eq!(
            idle.enable(Some(5)),
            Err(IdleError::Unsupported { resolution_ms: 0 })
        );
        assert!(idle.enable(None).is_err());
        assert!(!idle.is_enabled());
    }

    #[test]
    fn enable_rejects_threshold_finer_than_resolution() {
        let mut idle = IdleState::new();
        idle.set_sleep_resolution(15);
        assert_eq!(
            idle.enable(Some(12)),
            Err(IdleError::Unsupported { resolution_ms: 15 })
        );
        assert!(!idle.is_enabled());
    }

    #[test]
    fn enable_validates_threshold_range() {
        let mut idle = IdleState::new();
        idle.set_sleep_resolution(1);
        assert!(matches!(idle.enable(Some(0)), Err(IdleError::InvalidArg(_))));
        assert!(matches!(
            idle.enable(Some(SIM_IDLE_STMIN - 1)),
            Err(IdleError::InvalidArg(_))
        ));
        assert!(matches!(
            idle.enable(Some(SIM_IDLE_STMAX + 1)),
            Err(IdleError::InvalidArg(_))
        ));
        assert_eq!(idle.stability_secs(), SIM_IDLE_STDFLT);

        idle.enable(Some(SIM_IDLE_STMAX)).unwrap();
        assert_eq!(idle.stability_secs(), SIM_IDLE_STMAX);
        assert!(idle.is_enabled());
    }

    #[test]
    fn enable_without_threshold_keeps_current() {
        let mut idle = IdleState::new();
        idle.set_sleep_resolution(1);
        idle.enable(None).unwrap();
        assert_eq!(idle.stability_secs(), SIM_IDLE_STDFLT);
        assert_eq!(idle.report(), "idle enabled, stability wait = 20s");
    }

    #[test]
    fn enable_with_arg_parses_decimal() {
        let mut idle = IdleState::new();
        idle.set_sleep_resolution(1);
        idle.enable_with_arg(Some(" 45 ")).unwrap();
        assert_eq!(idle.stability_secs(), 45);
        assert!(matches!(
            idle.enable_with_arg(Some("4x")),
            Err(IdleError::InvalidArg(_))
        ));
        assert!(matches!(
            idle.enable_with_arg(Some("-3")),
            Err(IdleError::InvalidArg(_))
        ));
        assert_eq!(idle.stability_secs(), 45);
    }

    #[test]
    fn disable_and_report() {
        let mut idle = enabled_state(1);
        assert_eq!(idle.report(), "idle enabled, stability wait = 10s");
        idle.disable();
        assert!(!idle.is_enabled());
        assert_eq!(idle.report(), "idle disabled");
    }

    #[test]
    fn error_messages_name_the_problem() {
        let msg = IdleError::InvalidArg("700".into()).to_string();
        assert!(msg.contains("700"));
        assert!(msg.contains("600"));
        let msg = IdleError::Unsupported { resolution_ms: 0 }.to_string();
        assert!(msg.contains("not supported"));
    }

    #[test]
    fn disabled_idle_charges_one_cycle() {
        let clock = ManualClock::new();
        let bank = stable_bank(&clock, 12);
        let mut idle = IdleState::new();
        idle.set_sleep_resolution(1);
        let mut remaining = 50_000;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 49_999);
        assert!(!idle.attempt(&clock, 0, bank.channel(0), false, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 49_999);
        assert_eq!(clock.pause_count(), 0);
    }

    #[test]
    fn empty_or_busy_queue_does_not_idle() {
        let clock = ManualClock::new();
        let bank = stable_bank(&clock, 12);
        let mut idle = enabled_state(1);
        let mut remaining = 50_000;

        let empty: Option<UnitFlags> = None;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &empty, &mut remaining));
        let busy = Some(UnitFlags::CLOCK);
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &busy, &mut remaining));
        assert_eq!(remaining, 49_998);
    }

    #[test]
    fn unstable_channel_does_not_idle() {
        let clock = ManualClock::new();
        let bank = stable_bank(&clock, 9);
        let mut idle = enabled_state(1);
        let mut remaining = 50_000;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 49_999);
    }

    #[test]
    fn out_of_range_channel_does_not_idle() {
        let clock = ManualClock::new();
        let bank = stable_bank(&clock, 12);
        let mut idle = enabled_state(1);
        let mut remaining = 50_000;
        assert!(!idle.attempt(
            &clock,
            NTIMERS,
            bank.channel(NTIMERS),
            true,
            &IDLE_HEAD,
            &mut remaining
        ));
        assert_eq!(remaining, 49_999);
    }

    #[test]
    fn sleeps_and_charges_skipped_cycles() {
        let clock = ManualClock::with_granularity(4);
        let bank = stable_bank(&clock, 12);
        let start = clock.now_ms();
        let mut idle = enabled_state(4);

        // 100 cycles/ms → 5037 cycles = 50 ms; 50 / 4 = 12 intervals.
        let mut remaining = 5_037;
        assert!(idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        // Host rounded the 50 ms sleep up to 52 ms → 5200 cycles elapsed.
        assert_eq!(clock.now_ms() - start, 52);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn partial_sleep_leaves_remainder() {
        let clock = ManualClock::new();
        let bank = stable_bank(&clock, 12);
        let mut idle = enabled_state(1);
        let mut remaining = 1_250;
        assert!(idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        // 12 ms slept exactly → 1200 cycles charged.
        assert_eq!(remaining, 50);
    }

    #[test]
    fn too_little_slack_does_not_idle() {
        let clock = ManualClock::with_granularity(10);
        let bank = stable_bank(&clock, 12);
        let mut idle = enabled_state(10);
        // 999 cycles = 9 ms < one 10 ms interval.
        let mut remaining = 999;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 998);

        let mut remaining = 0;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 0);
    }

    #[test]
    fn negative_counter_is_clamped() {
        let clock = ManualClock::new();
        let bank = stable_bank(&clock, 12);
        let mut idle = enabled_state(1);
        let mut remaining = -40;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 0);
    }

    #[test]
    fn zero_rate_channel_does_not_idle() {
        let clock = ManualClock::new();
        let mut bank = TimerBank::new();
        bank.init(1, 0, &clock);
        // hz = 1 with currd ≥ 1 gives 0 cycles/ms.
        for _ in 0..12 {
            clock.advance(1000);
            bank.calibrate(1, 0, &clock);
        }
        let mut idle = enabled_state(1);
        let mut remaining = 1_000_000;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 999_999);
    }

    #[test]
    fn cycles_per_ms_is_cached_until_reenabled() {
        let clock = ManualClock::new();
        let mut bank = stable_bank(&clock, 12);
        let mut idle = enabled_state(1);
        let mut remaining = 1_000;
        assert!(idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 0);

        // Channel now runs at 1000 cycles/ms; the cached rate is still 100.
        bank.init(10_000, 0, &clock);
        for _ in 0..12 {
            for _ in 0..99 {
                bank.calibrate(100, 0, &clock);
            }
            clock.advance(1000);
            bank.calibrate(100, 0, &clock);
        }
        let mut remaining = 999;
        assert!(idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 99);

        // Re-enabling starts a new session: 999 cycles < 1 ms now.
        idle.enable(None).unwrap();
        let mut remaining = 999;
        assert!(!idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 998);

        idle.invalidate(0);
        let mut remaining = 2_000;
        assert!(idle.attempt(&clock, 0, bank.channel(0), true, &IDLE_HEAD, &mut remaining));
        assert_eq!(remaining, 0);
    }
}
