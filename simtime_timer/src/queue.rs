//! Pending-event queue head as seen by the idle decision.
//!
//! The simulator's scheduler is outside this crate. The idle procedure only
//! needs to know whether an event is pending and whether the head event
//! tolerates being reached after a host sleep; that is the [`ClockQueue`]
//! seam. [`EventQueue`] is a minimal fixed-capacity implementation used by
//! the `simtime` runner and the tests.

use bitflags::bitflags;
use heapless::Vec;
use thiserror::Error;

bitflags! {
    /// Per-unit scheduling flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnitFlags: u32 {
        /// Event may be reached through an idle sleep.
        const IDLE = 1 << 0;
        /// Unit is a calibrated periodic clock.
        const CLOCK = 1 << 1;
    }
}

/// Read-only view of the head of the simulator's clock queue.
pub trait ClockQueue {
    /// Flags of the next pending event, or `None` if the queue is empty.
    fn head_flags(&self) -> Option<UnitFlags>;
}

impl ClockQueue for Option<UnitFlags> {
    fn head_flags(&self) -> Option<UnitFlags> {
        *self
    }
}

/// A scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    /// Owning unit identifier.
    pub unit: u8,
    /// Scheduling flags of the owning unit.
    pub flags: UnitFlags,
    /// Absolute due time [cycles].
    pub due: u64,
}

/// Event queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// All `N` slots are in use.
    #[error("event queue full ({capacity} slots)")]
    Full { capacity: usize },
}

/// Fixed-capacity event queue ordered by due time.
///
/// Events with equal due time fire in scheduling order.
#[derive(Debug, Clone, Default)]
pub struct EventQueue<const N: usize> {
    events: Vec<PendingEvent, N>,
    now: u64,
}

impl<const N: usize> EventQueue<N> {
    /// Empty queue at cycle 0.
    pub const fn new() -> Self {
        Self {
            events: Vec::new(),
            now: 0,
        }
    }

    /// Current queue time [cycles].
    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedule `unit` to fire `delay` cycles from now.
    pub fn schedule(&mut self, unit: u8, flags: UnitFlags, delay: u32) -> Result<(), QueueError> {
        let due = self.now + u64::from(delay);
        let index = self
            .events
            .iter()
            .position(|e| e.due > due)
            .unwrap_or(self.events.len());
        self.events
            .insert(index, PendingEvent { unit, flags, due })
            .map_err(|_| QueueError::Full { capacity: N })
    }

    /// Cycles until the head event fires.
    pub fn cycles_to_next(&self) -> Option<u64> {
        self.events.first().map(|e| e.due.saturating_sub(self.now))
    }

    /// Pop the head event and advance queue time to its due time.
    pub fn pop_next(&mut self) -> Option<PendingEvent> {
        if self.events.is_empty() {
            return None;
        }
        let event = self.events.remove(0);
        self.now = self.now.max(event.due);
        Some(event)
    }
}

impl<const N: usize> ClockQueue for EventQueue<N> {
    fn head_flags(&self) -> Option<UnitFlags> {
        self.events.first().map(|e| e.flags)
    }
}
