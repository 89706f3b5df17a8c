//! Per-channel clock calibration.
//!
//! Each [`TimerChannel`] relates virtual ticks to wall-clock milliseconds.
//! The simulator asks [`TimerBank::calibrate`] once per virtual tick for the
//! delay (cost units, usually instructions) to schedule before the next
//! tick. Roughly once per nominal second of ticks the channel reaches a
//! *boundary*: it samples the host clock and rescales the delay so that
//! elapsed wall time tracks elapsed virtual time.
//!
//! ## Update at a boundary
//!
//! ```text
//! based  = based · nxintv / Δreal
//! nxintv = 1000 + clamp(vtime − rtime, ±SIM_TMAX)
//! currd  = based · nxintv / 1000
//! ```
//!
//! All products use `f64` intermediates. Anomalous measurements (clock
//! stepping backward, a gap over 30 s, no observable elapsed time) degrade
//! to "hold the last delay" or "report the initial delay" and are never
//! surfaced as errors. `based` and `currd` never drop below 1.

use serde::Serialize;
use simtime_common::consts::{
    CALIBRATE_FALLBACK_DELAY, MAX_CALIBRATION_GAP_MS, NOMINAL_INTERVAL_MS, NTIMERS, SIM_TMAX,
};
use tracing::{debug, trace, warn};

use crate::host::HostClock;

/// What happened to a channel on one calibration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Fewer than `ticks_per_second` ticks since the last boundary.
    NotReached,
    /// Boundary reached but the host has no usable timer.
    NoTimer,
    /// Host clock read earlier than the last boundary; wall time re-based.
    ClockBackward {
        /// Sample that replaced `rtime`.
        now_ms: u32,
    },
    /// Wall-clock gap too large to trust; initial delay reported.
    GapTooLarge {
        /// Measured gap [ms].
        delta_ms: u32,
    },
    /// Clock too coarse to observe a full interval; base delay slewed.
    Slewed,
    /// Normal proportional update.
    Adjusted {
        /// Measured wall interval [ms].
        delta_ms: u32,
    },
}

/// Calibration state of one simulated clock source.
///
/// The default value is a never-initialized channel (`initd == 0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerChannel {
    ticks: u32,
    hz: u32,
    rtime: u32,
    vtime: u32,
    nxintv: u32,
    based: u32,
    currd: u32,
    initd: u32,
    elapsed: u32,
}

impl TimerChannel {
    /// Reset the channel to `delay` with both clocks anchored at `now_ms`.
    ///
    /// `delay` must already be coerced to at least 1.
    fn reset(&mut self, delay: u32, now_ms: u32) {
        *self = Self {
            ticks: 0,
            hz: 0,
            rtime: now_ms,
            vtime: now_ms,
            nxintv: NOMINAL_INTERVAL_MS,
            based: delay,
            currd: delay,
            initd: delay,
            elapsed: 0,
        };
    }

    /// Count one tick and recalibrate if a boundary was reached.
    ///
    /// Returns the delay to schedule before the next tick together with the
    /// boundary outcome. The host clock is only read at a boundary.
    pub fn calibrate<C: HostClock + ?Sized>(
        &mut self,
        ticks_per_second: u32,
        clock: &C,
    ) -> (u32, Boundary) {
        self.hz = ticks_per_second;
        self.ticks = self.ticks.saturating_add(1);
        if self.ticks < ticks_per_second {
            return (self.currd, Boundary::NotReached);
        }
        self.ticks = 0;
        self.elapsed = self.elapsed.saturating_add(1);

        if !clock.is_available() {
            return (self.currd, Boundary::NoTimer);
        }

        let now = clock.now_ms();
        if now < self.rtime {
            self.rtime = now;
            return (self.currd, Boundary::ClockBackward { now_ms: now });
        }

        let delta_real = now - self.rtime;
        self.rtime = now;
        self.vtime = self.vtime.wrapping_add(NOMINAL_INTERVAL_MS);

        // `based`/`currd` keep their pre-gap values.
        if delta_real > MAX_CALIBRATION_GAP_MS {
            return (self.initd, Boundary::GapTooLarge { delta_ms: delta_real });
        }

        let boundary = if delta_real == 0 {
            self.based = self.based.saturating_mul(ticks_per_second);
            Boundary::Slewed
        } else {
            self.based = (f64::from(self.based) * f64::from(self.nxintv) / f64::from(delta_real))
                as u32;
            Boundary::Adjusted {
                delta_ms: delta_real,
            }
        };

        let drift = (self.vtime.wrapping_sub(self.rtime) as i32).clamp(-SIM_TMAX, SIM_TMAX);
        self.nxintv = NOMINAL_INTERVAL_MS.saturating_add_signed(drift);
        self.currd = (f64::from(self.based) * f64::from(self.nxintv)
            / f64::from(NOMINAL_INTERVAL_MS)) as u32;

        // Floor both at 1.
        self.based = self.based.max(1);
        self.currd = self.currd.max(1);

        (self.currd, boundary)
    }

    /// Ticks counted since the last boundary.
    #[inline]
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Last reported nominal tick rate.
    #[inline]
    pub fn hz(&self) -> u32 {
        self.hz
    }

    /// Wall time at the last boundary [ms].
    #[inline]
    pub fn rtime(&self) -> u32 {
        self.rtime
    }

    /// Virtual time [ms].
    #[inline]
    pub fn vtime(&self) -> u32 {
        self.vtime
    }

    /// Next scheduled wall interval [ms].
    #[inline]
    pub fn next_interval(&self) -> u32 {
        self.nxintv
    }

    /// Base delay per tick.
    #[inline]
    pub fn base_delay(&self) -> u32 {
        self.based
    }

    /// Current delay per tick.
    #[inline]
    pub fn current_delay(&self) -> u32 {
        self.currd
    }

    /// Delay given at the last initialization (0 = never initialized).
    #[inline]
    pub fn initial_delay(&self) -> u32 {
        self.initd
    }

    /// Boundaries passed since initialization [s].
    #[inline]
    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    /// Serializable copy of the channel state.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            ticks: self.ticks,
            hz: self.hz,
            rtime: self.rtime,
            vtime: self.vtime,
            nxintv: self.nxintv,
            based: self.based,
            currd: self.currd,
            initd: self.initd,
            elapsed: self.elapsed,
        }
    }
}

/// Read-only view of a channel for diagnostics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub ticks: u32,
    pub hz: u32,
    pub rtime: u32,
    pub vtime: u32,
    pub nxintv: u32,
    pub based: u32,
    pub currd: u32,
    pub initd: u32,
    pub elapsed: u32,
}

// ─── Timer Bank ─────────────────────────────────────────────────────

/// Fixed bank of [`NTIMERS`] independent calibration channels.
///
/// Out-of-range indices never fail loudly and never touch another channel.
#[derive(Debug, Clone, Default)]
pub struct TimerBank {
    channels: [TimerChannel; NTIMERS],
}

impl TimerBank {
    /// Bank with every channel uninitialized.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize channel `tmr` with `delay` (0 is coerced to 1).
    ///
    /// Returns the coerced delay, also for out-of-range indices.
    pub fn init<C: HostClock + ?Sized>(&mut self, delay: u32, tmr: usize, clock: &C) -> u32 {
        let delay = delay.max(1);
        if let Some(channel) = self.channels.get_mut(tmr) {
            channel.reset(delay, clock.now_ms());
            debug!(channel = tmr, delay, "timer channel initialized");
        }
        delay
    }

    /// Re-initialize every channel that has been initialized before,
    /// restoring its initial delay.
    pub fn init_all<C: HostClock + ?Sized>(&mut self, clock: &C) {
        let now = clock.now_ms();
        for channel in self.channels.iter_mut().filter(|c| c.initd != 0) {
            let delay = channel.initd;
            channel.reset(delay, now);
        }
    }

    /// Count one tick on channel `tmr` and return the next delay.
    ///
    /// Out-of-range channels return [`CALIBRATE_FALLBACK_DELAY`].
    pub fn calibrate<C: HostClock + ?Sized>(
        &mut self,
        ticks_per_second: u32,
        tmr: usize,
        clock: &C,
    ) -> u32 {
        let Some(channel) = self.channels.get_mut(tmr) else {
            return CALIBRATE_FALLBACK_DELAY;
        };

        let (delay, boundary) = channel.calibrate(ticks_per_second, clock);
        match boundary {
            Boundary::NotReached | Boundary::NoTimer => {}
            Boundary::ClockBackward { now_ms } => {
                debug!(channel = tmr, now_ms, "host clock ran backward, wall time re-based");
            }
            Boundary::GapTooLarge { delta_ms } => {
                warn!(
                    channel = tmr,
                    delta_ms,
                    initial_delay = delay,
                    "calibration gap too large, reporting initial delay"
                );
            }
            Boundary::Slewed => {
                debug!(
                    channel = tmr,
                    based = channel.based,
                    "no elapsed wall time, slewing base delay"
                );
            }
            Boundary::Adjusted { delta_ms } => {
                trace!(
                    channel = tmr,
                    delta_ms,
                    based = channel.based,
                    currd = channel.currd,
                    nxintv = channel.nxintv,
                    "calibrated"
                );
            }
        }
        delay
    }

    /// Channel `tmr`, if in range.
    #[inline]
    pub fn channel(&self, tmr: usize) -> Option<&TimerChannel> {
        self.channels.get(tmr)
    }

    /// All channels in index order.
    pub fn channels(&self) -> &[TimerChannel; NTIMERS] {
        &self.channels
    }

    /// Snapshot of channel `tmr`, if in range.
    pub fn snapshot(&self, tmr: usize) -> Option<ChannelSnapshot> {
        self.channel(tmr).map(TimerChannel::snapshot)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
