//! Tick accumulation and the shared current-tick handle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;

/// If this many tick durations pile up in the accumulator, something
/// stalled the process; excess is discarded instead of replayed.
pub const MAX_TICK_BACKLOG: u32 = 5;

/// Converts wall-clock deltas into whole simulation ticks.
///
/// Time is accumulated as integer nanoseconds so long sessions don't
/// accumulate floating-point drift. One call may yield zero, one, or many
/// ticks; callers must handle all three.
#[derive(Debug)]
pub struct TickAccumulator {
    tick_interval_ns: u64,
    accumulated_ns: u64,
}

impl TickAccumulator {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval_ns: tick_interval.as_nanos() as u64,
            accumulated_ns: 0,
        }
    }

    /// Feeds in elapsed wall-clock time and returns how many ticks are now
    /// due. A backlog past [`MAX_TICK_BACKLOG`] ticks is a stall: it's
    /// logged as a health signal and the excess is dropped so the loop
    /// doesn't spiral trying to catch up.
    pub fn add_time(&mut self, delta: Duration) -> u32 {
        self.accumulated_ns = self.accumulated_ns.saturating_add(delta.as_nanos() as u64);

        let backlog_limit = self.tick_interval_ns * u64::from(MAX_TICK_BACKLOG);
        if self.accumulated_ns > backlog_limit {
            warn!(
                "Detected a stalled tick loop. Accumulated: {}ns, limit: {}ns. Dropping excess.",
                self.accumulated_ns, backlog_limit
            );
            self.accumulated_ns = backlog_limit;
        }

        let ticks = (self.accumulated_ns / self.tick_interval_ns) as u32;
        self.accumulated_ns -= u64::from(ticks) * self.tick_interval_ns;
        ticks
    }
}

/// Owner side of the current-tick counter. The simulation loop holds this
/// and is the only thing that advances it.
#[derive(Debug)]
pub struct TickCounter {
    current: Arc<AtomicU32>,
}

impl TickCounter {
    pub fn new(start_tick: u32) -> Self {
        Self {
            current: Arc::new(AtomicU32::new(start_tick)),
        }
    }

    pub fn get(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn advance(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// A read-only handle for other components (network receive path,
    /// logging) to snapshot the current tick from.
    pub fn handle(&self) -> TickHandle {
        TickHandle {
            current: Arc::clone(&self.current),
        }
    }
}

/// Read-only view of the simulation's current tick.
#[derive(Debug, Clone)]
pub struct TickHandle {
    current: Arc<AtomicU32>,
}

impl TickHandle {
    pub fn get(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }
}
