//! # simtime Timer Library
//!
//! Host-independent clock calibration and idle detection for hardware
//! simulators. Keeps each simulated clock source paced against wall time
//! despite host scheduling jitter, coarse OS timers and variable simulated
//! instruction throughput, and lets the simulation loop yield the host CPU
//! when the next pending event can be reached by sleeping.
//!
//! ## Layers
//!
//! 1. **Host time** ([`host`]): millisecond counter, sleep, resolution probe
//! 2. **Calibration** ([`calibration`]): `NTIMERS` independent feedback loops
//! 3. **Idle** ([`idle`]): sleep decision plus the enable/disable/status surface
//! 4. **Subsystem** ([`subsystem`]): the one value the simulation loop owns
//!
//! ## No Allocation in the Loop
//!
//! The bank is a fixed array and the calibration/idle paths allocate
//! nothing. Only the status line and configuration loading touch the heap.

pub mod calibration;
pub mod config;
pub mod host;
pub mod idle;
pub mod queue;
pub mod subsystem;

pub use calibration::{Boundary, ChannelSnapshot, TimerBank, TimerChannel};
pub use host::{HostClock, ManualClock, MonotonicClock, probe_sleep_resolution};
pub use idle::{IdleControl, IdleError, IdleState};
pub use queue::{ClockQueue, EventQueue, PendingEvent, QueueError, UnitFlags};
pub use subsystem::TimerSubsystem;
