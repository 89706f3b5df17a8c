//! The timer subsystem: one value owned by the simulation loop.
//!
//! Bundles the host clock, the calibration bank and the idle state, and
//! exposes the operations the simulation-loop owner and the command
//! dispatcher call. Everything is `&mut self`-driven on a single thread;
//! calls for one channel must stay tick-ordered.

use simtime_common::consts::SIM_IDLE_MAX;
use tracing::info;

use crate::calibration::{ChannelSnapshot, TimerBank};
use crate::host::{HostClock, probe_sleep_resolution};
use crate::idle::{IdleControl, IdleError, IdleState};
use crate::queue::ClockQueue;

/// Default channel for the single-timer shims.
const DEFAULT_TIMER: usize = 0;

/// Calibration bank, idle state and host clock of one simulator instance.
#[derive(Debug)]
pub struct TimerSubsystem<C: HostClock> {
    clock: C,
    bank: TimerBank,
    idle: IdleState,
    sleep_ceiling_ms: u32,
}

impl<C: HostClock> TimerSubsystem<C> {
    /// New subsystem over `clock`. Idling stays unsupported until
    /// [`TimerSubsystem::timer_startup`] measures the host.
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            bank: TimerBank::new(),
            idle: IdleState::new(),
            sleep_ceiling_ms: SIM_IDLE_MAX,
        }
    }

    /// Override the probe's sanity ceiling [ms].
    pub fn with_sleep_ceiling(mut self, ceiling_ms: u32) -> Self {
        self.sleep_ceiling_ms = ceiling_ms;
        self
    }

    /// Disable idling, probe the host sleep resolution and store it.
    ///
    /// Returns whether idling is possible on this host.
    pub fn timer_startup(&mut self) -> bool {
        self.idle.disable();
        let resolution = probe_sleep_resolution(&self.clock, self.sleep_ceiling_ms);
        self.idle.set_sleep_resolution(resolution);
        if resolution == 0 {
            info!("host sleep too coarse, idling unavailable");
        }
        resolution != 0
    }

    /// Initialize channel `tmr` (`timer_init`). Returns the coerced delay.
    pub fn timer_init(&mut self, delay: u32, tmr: usize) -> u32 {
        self.idle.invalidate(tmr);
        self.bank.init(delay, tmr, &self.clock)
    }

    /// Re-initialize every previously initialized channel.
    pub fn timer_init_all(&mut self) {
        for tmr in 0..self.bank.channels().len() {
            self.idle.invalidate(tmr);
        }
        self.bank.init_all(&self.clock);
    }

    /// One tick on channel `tmr` (`timer_calibrate`). Returns the next delay.
    pub fn timer_calibrate(&mut self, ticks_per_second: u32, tmr: usize) -> u32 {
        self.bank.calibrate(ticks_per_second, tmr, &self.clock)
    }

    /// [`TimerSubsystem::timer_init`] on the default channel.
    pub fn rtc_init(&mut self, delay: u32) -> u32 {
        self.timer_init(delay, DEFAULT_TIMER)
    }

    /// [`TimerSubsystem::timer_calibrate`] on the default channel.
    pub fn rtc_calibrate(&mut self, ticks_per_second: u32) -> u32 {
        self.timer_calibrate(ticks_per_second, DEFAULT_TIMER)
    }

    /// Consult the idle procedure (`idle_tick`).
    ///
    /// Mutates the caller-owned `remaining` cycle counter; see
    /// [`IdleState::attempt`].
    pub fn idle_tick<Q: ClockQueue + ?Sized>(
        &mut self,
        tmr: usize,
        charge_if_not_idling: bool,
        queue: &Q,
        remaining: &mut i32,
    ) -> bool {
        self.idle.attempt(
            &self.clock,
            tmr,
            self.bank.channel(tmr),
            charge_if_not_idling,
            queue,
            remaining,
        )
    }

    /// Dispatcher variant of `idle_enable` taking raw argument text.
    pub fn idle_enable_arg(&mut self, arg: Option<&str>) -> Result<(), IdleError> {
        self.idle.enable_with_arg(arg)
    }

    /// Store a sleep resolution measured elsewhere.
    pub fn set_sleep_resolution(&mut self, ms: u32) {
        self.idle.set_sleep_resolution(ms);
    }

    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[inline]
    pub fn bank(&self) -> &TimerBank {
        &self.bank
    }

    #[inline]
    pub fn idle(&self) -> &IdleState {
        &self.idle
    }

    /// Snapshot of channel `tmr`, if in range.
    pub fn snapshot(&self, tmr: usize) -> Option<ChannelSnapshot> {
        self.bank.snapshot(tmr)
    }
}

impl<C: HostClock> IdleControl for TimerSubsystem<C> {
    fn idle_enable(&mut self, threshold: Option<u32>) -> Result<(), IdleError> {
        self.idle.enable(threshold)?;
        info!(stability_secs = self.idle.stability_secs(), "idle enabled");
        Ok(())
    }

    fn idle_disable(&mut self) {
        self.idle.disable();
    }

    fn idle_status(&self) -> String {
        self.idle.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ManualClock;
    use crate::queue::UnitFlags;

    #[test]
    fn startup_measures_resolution() {
        let mut sys = TimerSubsystem::new(ManualClock::with_granularity(2));
        assert!(sys.timer_startup());
        assert_eq!(sys.idle().sleep_resolution(), 2);
        assert!(!sys.idle().is_enabled());
    }

    #[test]
    fn startup_on_coarse_host_disables_idle_for_good() {
        let mut sys = TimerSubsystem::new(ManualClock::with_granularity(16));
        assert!(!sys.timer_startup());
        for arg in [None, Some(5), Some(20), Some(600)] {
            assert!(matches!(
                sys.idle_enable(arg),
                Err(IdleError::Unsupported { .. })
            ));
        }
        assert_eq!(sys.idle_status(), "idle disabled");
    }

    #[test]
    fn custom_ceiling_admits_coarse_host() {
        let mut sys = TimerSubsystem::new(ManualClock::with_granularity(16)).with_sleep_ceiling(20);
        assert!(sys.timer_startup());
        assert_eq!(sys.idle().sleep_resolution(), 16);
    }

    #[test]
    fn startup_disables_enabled_idle() {
        let mut sys = TimerSubsystem::new(ManualClock::new());
        sys.set_sleep_resolution(1);
        sys.idle_enable(None).unwrap();
        sys.timer_startup();
        assert!(!sys.idle().is_enabled());
    }

    #[test]
    fn rtc_shims_use_channel_zero() {
        let mut sys = TimerSubsystem::new(ManualClock::new());
        assert_eq!(sys.rtc_init(0), 1);
        assert_eq!(sys.bank().channel(0).unwrap().initial_delay(), 1);
        sys.rtc_calibrate(5);
        assert_eq!(sys.bank().channel(0).unwrap().ticks(), 1);
        assert_eq!(sys.bank().channel(1).unwrap().ticks(), 0);
    }

    #[test]
    fn idle_status_round_trip() {
        let mut sys = TimerSubsystem::new(ManualClock::new());
        sys.set_sleep_resolution(1);
        sys.idle_enable(Some(30)).unwrap();
        assert_eq!(sys.idle_status(), "idle enabled, stability wait = 30s");
        sys.idle_disable();
        assert_eq!(sys.idle_status(), "idle disabled");
        sys.idle_enable_arg(Some("15")).unwrap();
        assert_eq!(sys.idle_status(), "idle enabled, stability wait = 15s");
    }

    #[test]
    fn reinit_refreshes_cached_rate() {
        let mut sys = TimerSubsystem::new(ManualClock::new());
        sys.set_sleep_resolution(1);
        sys.idle_enable(Some(10)).unwrap();
        let head = Some(UnitFlags::IDLE);

        sys.timer_init(1000, 0);
        for _ in 0..10 {
            for _ in 0..99 {
                sys.timer_calibrate(100, 0);
            }
            sys.clock().advance(1000);
            sys.timer_calibrate(100, 0);
        }
        let mut remaining = 999;
        assert!(sys.idle_tick(0, true, &head, &mut remaining));

        // Reinit at 10x the rate: cache dropped, 999 cycles < 1 ms.
        sys.timer_init(10_000, 0);
        for _ in 0..10 {
            for _ in 0..99 {
                sys.timer_calibrate(100, 0);
            }
            sys.clock().advance(1000);
            sys.timer_calibrate(100, 0);
        }
        let mut remaining = 999;
        assert!(!sys.idle_tick(0, true, &head, &mut remaining));
        assert_eq!(remaining, 998);
    }
}
