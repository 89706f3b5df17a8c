//! Host time source: millisecond counter, blocking sleep, resolution probe.
//!
//! The calibration and idle code never touches the OS directly. Everything
//! goes through the narrow [`HostClock`] capability pair so the same feedback
//! loop runs against the real monotonic clock or a scripted [`ManualClock`].
//!
//! The counter is allowed to be imperfect: it may wrap at `u32::MAX`, step
//! backward after a host clock adjustment, or never advance at all. Sleep
//! granularity is measured with [`probe_sleep_resolution`], never assumed.

use std::cell::Cell;

use simtime_common::consts::SLEEP_SAMPLES;
use tracing::{debug, info};

/// Narrow host-time capability consumed by the timer subsystem.
pub trait HostClock {
    /// Current wall time [ms]. Monotonic-ish; may wrap or step backward.
    fn now_ms(&self) -> u32;

    /// Block the calling thread for at least `ms` milliseconds.
    fn pause_ms(&self, ms: u32);

    /// Whether the host provides a usable real-time counter.
    ///
    /// When `false`, calibration holds every channel at its last delay.
    fn is_available(&self) -> bool {
        true
    }

    /// Sleep for `ms` and return the measured elapsed time [ms].
    fn sleep_ms(&self, ms: u32) -> u32 {
        let start = self.now_ms();
        self.pause_ms(ms);
        self.now_ms().wrapping_sub(start)
    }

    /// Sleep for whole seconds.
    fn sleep_secs(&self, secs: u32) {
        self.pause_ms(secs.saturating_mul(1000));
    }
}

/// Estimate the host's real minimum sleep granularity [ms].
///
/// Issues [`SLEEP_SAMPLES`] one-millisecond sleeps, measures each against
/// [`HostClock::now_ms`], and returns the rounded-up mean latency. A result
/// above `ceiling_ms` means the host has no usable fine-grained sleep and
/// yields 0 ("idling unsupported").
pub fn probe_sleep_resolution<C: HostClock + ?Sized>(clock: &C, ceiling_ms: u32) -> u32 {
    let mut total: u64 = 0;
    for _ in 0..SLEEP_SAMPLES {
        let t1 = clock.now_ms();
        clock.pause_ms(1);
        let t2 = clock.now_ms();
        total += u64::from(t2.wrapping_sub(t1));
    }

    let samples = u64::from(SLEEP_SAMPLES);
    let mean = (total + samples - 1) / samples;
    if mean > u64::from(ceiling_ms) {
        debug!(mean_ms = mean, ceiling_ms, "sleep resolution above ceiling");
        return 0;
    }

    let resolution = mean as u32;
    info!(resolution_ms = resolution, "host sleep resolution probed");
    resolution
}

// ─── Platform Clock ─────────────────────────────────────────────────

/// Host clock backed by `CLOCK_MONOTONIC`.
///
/// Uses `clock_gettime` / `clock_nanosleep` on Linux and falls back to
/// `std::time::Instant` / `std::thread::sleep` elsewhere.
#[derive(Debug)]
pub struct MonotonicClock {
    #[cfg(not(target_os = "linux"))]
    origin: std::time::Instant,
}

impl MonotonicClock {
    /// Create a clock reading the host monotonic counter.
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "linux"))]
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl HostClock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        use nix::time::{ClockId, clock_gettime};

        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            // Truncation to u32 is the documented wrap of the counter.
            Ok(ts) => (ts.tv_sec() as u64)
                .wrapping_mul(1000)
                .wrapping_add(ts.tv_nsec() as u64 / 1_000_000) as u32,
            Err(_) => 0,
        }
    }

    fn pause_ms(&self, ms: u32) {
        use nix::errno::Errno;
        use nix::sys::time::TimeSpec;
        use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};
        use std::time::Duration;

        let request = Duration::from_millis(u64::from(ms));
        let Ok(now) = clock_gettime(ClockId::CLOCK_MONOTONIC) else {
            std::thread::sleep(request);
            return;
        };

        // Absolute deadline: a signal handler must not shorten the sleep.
        let deadline = now + TimeSpec::from(request);
        while let Err(Errno::EINTR) = clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &deadline,
        ) {}
    }
}

#[cfg(not(target_os = "linux"))]
impl HostClock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }

    fn pause_ms(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

// ─── Manual Clock ───────────────────────────────────────────────────

/// Deterministic host clock that only moves when told to.
///
/// Sleeps advance the counter instantly, rounded up to the configured
/// granularity (an OS scheduler tick). Interior mutability lets the clock be
/// driven through a shared reference while the timer subsystem owns it.
///
/// ```
/// use simtime_timer::host::{HostClock, ManualClock};
///
/// let clock = ManualClock::with_granularity(10);
/// assert_eq!(clock.sleep_ms(1), 10);
/// assert_eq!(clock.sleep_ms(25), 30);
/// clock.advance(5);
/// assert_eq!(clock.now_ms(), 45);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<u32>,
    granularity: u32,
    available: bool,
    pauses: Cell<u32>,
}

impl ManualClock {
    /// Clock at 0 ms with exact 1 ms sleeps.
    pub fn new() -> Self {
        Self::with_granularity(1)
    }

    /// Clock at 0 ms whose sleeps round up to multiples of `granularity_ms`.
    ///
    /// A granularity of 0 models a host whose sleep never advances the clock.
    pub fn with_granularity(granularity_ms: u32) -> Self {
        Self {
            now: Cell::new(0),
            granularity: granularity_ms,
            available: true,
            pauses: Cell::new(0),
        }
    }

    /// Clock reporting no usable real-time counter.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Jump to an absolute counter value (may move backward).
    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    /// Advance the counter, wrapping at `u32::MAX`.
    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    /// Number of blocking pauses issued so far.
    pub fn pause_count(&self) -> u32 {
        self.pauses.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }

    fn pause_ms(&self, ms: u32) {
        self.pauses.set(self.pauses.get() + 1);
        let step = match self.granularity {
            0 => 0,
            g => ms.max(1).div_ceil(g).saturating_mul(g),
        };
        self.advance(step);
    }

    fn is_available(&self) -> bool {
        self.available
    }
}
