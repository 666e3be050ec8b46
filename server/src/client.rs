//! Per-connection state: outbound queueing, tick-diff history, and the
//! tick adjustment calculation.
//!
//! The tick-diff history is written by the network receive task and read
//! by the send path when it builds batch headers, so it sits behind its
//! own mutex; the lock is scoped tightly around the push and the snapshot
//! read, never held across I/O.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tokio::sync::mpsc;

/// Fixed length of the tick-diff history ring.
pub const TICKDIFF_HISTORY_LENGTH: usize = 5;

/// Tunables for the drift/lag-spike estimator. The defaults are the values
/// the protocol was tuned with; the mechanism, not the constants, is the
/// contract.
#[derive(Debug, Clone)]
pub struct AdjustmentConfig {
    /// Diffs outside [lowest, highest] are an unrecoverable desync; the
    /// connection is dropped.
    pub lowest_valid_diff: i64,
    pub highest_valid_diff: i64,
    /// The band the latest diff should settle into. Client messages are
    /// aimed to arrive slightly ahead of the tick they apply to.
    pub target_bound_lower: i64,
    pub target_bound_upper: i64,
    /// Lag-spike bound: `avg_abs_diff * multiplier + slack`. A latest diff
    /// past this is assumed to be a transient spike, not drift.
    pub lag_spike_multiplier: f32,
    pub lag_spike_slack: i64,
    /// Cap on the magnitude of any single emitted correction.
    pub max_correction: i64,
}

impl Default for AdjustmentConfig {
    fn default() -> Self {
        Self {
            lowest_valid_diff: -10,
            highest_valid_diff: 10,
            target_bound_lower: 1,
            target_bound_upper: 3,
            lag_spike_multiplier: 2.0,
            lag_spike_slack: 3,
            max_correction: 10,
        }
    }
}

/// A computed correction, tagged with the iteration the client has
/// confirmed so far. Recomputed fresh each time it's requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustmentData {
    pub adjustment: i8,
    pub iteration: u8,
}

/// The peer's tick diff is outside the valid range; the connection must be
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickDiffOutOfBounds {
    pub diff: i64,
}

#[derive(Debug)]
struct TickDiffState {
    history: VecDeque<i64>,
    has_recorded_diff: bool,
}

/// One connected peer.
///
/// Owns its transport sender exclusively: dropping the connection drops
/// the writer task's channel, which closes the socket.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: u32,
    pub addr: SocketAddr,
    /// Raw bytes handed to this connection's writer task.
    sender: mpsc::UnboundedSender<Vec<u8>>,
    /// Framed messages queued by the simulation, flushed on the next
    /// network tick.
    send_queue: Mutex<VecDeque<Vec<u8>>>,
    tick_diff: Mutex<TickDiffState>,
    /// Latest adjustment iteration the client has echoed back.
    latest_adj_iteration: AtomicU8,
    /// The newest sim tick this client has been sent state for. Zero means
    /// the connection response hasn't gone out yet.
    latest_sent_sim_tick: AtomicU32,
    last_seen: Mutex<Instant>,
}

impl ClientConnection {
    pub fn new(id: u32, addr: SocketAddr, sender: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            addr,
            sender,
            send_queue: Mutex::new(VecDeque::new()),
            tick_diff: Mutex::new(TickDiffState {
                history: VecDeque::with_capacity(TICKDIFF_HISTORY_LENGTH),
                has_recorded_diff: false,
            }),
            latest_adj_iteration: AtomicU8::new(0),
            latest_sent_sim_tick: AtomicU32::new(0),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Queues one framed message for the next batch.
    pub fn queue_message(&self, framed: Vec<u8>) {
        let mut queue = self.send_queue.lock().unwrap();
        queue.push_back(framed);
    }

    /// Takes up to `max` queued messages for batching.
    pub fn drain_send_queue(&self, max: usize) -> Vec<Vec<u8>> {
        let mut queue = self.send_queue.lock().unwrap();
        let count = queue.len().min(max);
        queue.drain(..count).collect()
    }

    pub fn waiting_message_count(&self) -> usize {
        self.send_queue.lock().unwrap().len()
    }

    /// Hands a fully built batch to the writer task. A closed channel means
    /// the writer is gone; the disconnect sweep will clean this client up.
    pub fn forward_batch(&self, batch: Vec<u8>) -> bool {
        if self.sender.send(batch).is_err() {
            debug!("Client {}: writer task gone, dropping batch.", self.id);
            return false;
        }
        true
    }

    /// Records one observed tick diff. The first recorded diff seeds the
    /// entire history so early jitter doesn't bias the average before the
    /// ring fills.
    pub fn record_tick_diff(
        &self,
        diff: i64,
        config: &AdjustmentConfig,
    ) -> Result<(), TickDiffOutOfBounds> {
        if diff < config.lowest_valid_diff || diff > config.highest_valid_diff {
            info!(
                "Client {}: tick diff {} out of bounds [{}, {}], dropping connection.",
                self.id, diff, config.lowest_valid_diff, config.highest_valid_diff
            );
            return Err(TickDiffOutOfBounds { diff });
        }

        let mut state = self.tick_diff.lock().unwrap();
        if !state.has_recorded_diff {
            state.history.clear();
            for _ in 0..TICKDIFF_HISTORY_LENGTH {
                state.history.push_back(diff);
            }
            state.has_recorded_diff = true;
        } else {
            state.history.pop_front();
            state.history.push_back(diff);
        }
        Ok(())
    }

    /// Computes the correction to send this client.
    ///
    /// If the latest diff sits outside the target band, it's a drift
    /// candidate — unless it exceeds the lag-spike bound derived from the
    /// mean of absolute diffs, in which case we emit zero and wait for the
    /// spike to resolve on its own. Corrections are bounded; drift is
    /// walked back incrementally rather than zeroed in one step.
    pub fn get_tick_adjustment(&self, config: &AdjustmentConfig) -> AdjustmentData {
        let iteration = self.latest_adj_iteration.load(Ordering::Acquire);

        let (latest_diff, average_abs_diff) = {
            let state = self.tick_diff.lock().unwrap();
            if !state.has_recorded_diff {
                // No data, no adjustment.
                return AdjustmentData {
                    adjustment: 0,
                    iteration,
                };
            }

            let sum: i64 = state.history.iter().map(|d| d.abs()).sum();
            let average = sum as f32 / TICKDIFF_HISTORY_LENGTH as f32;
            (*state.history.back().unwrap(), average)
        };

        let mut adjustment: i64 = 0;
        if latest_diff < config.target_bound_lower || latest_diff > config.target_bound_upper {
            let lag_bound = (average_abs_diff * config.lag_spike_multiplier) as i64
                + config.lag_spike_slack;

            if latest_diff < lag_bound {
                adjustment = config.target_bound_lower - latest_diff;
                adjustment = adjustment.clamp(-config.max_correction, config.max_correction);
            }
        }

        if adjustment != 0 {
            debug!(
                "Client {}: latest diff: {}, adjustment: {}, iteration: {}",
                self.id, latest_diff, adjustment, iteration
            );
        }

        AdjustmentData {
            adjustment: adjustment as i8,
            iteration,
        }
    }

    /// Processes the iteration the client echoed in its header. The client
    /// echoes `latest + 1` once it has applied an adjustment; anything
    /// further ahead means we skipped one, which is a logic error worth
    /// logging but not fatal.
    pub fn confirm_adj_iteration(&self, received: u8) {
        let latest = self.latest_adj_iteration.load(Ordering::Acquire);
        let expected_next = latest.wrapping_add(1);

        if received == expected_next {
            self.latest_adj_iteration
                .store(expected_next, Ordering::Release);
        } else if received != latest {
            error!(
                "Client {}: out-of-sequence adjustment iteration. Received: {}, expected: {} or {}.",
                self.id, received, latest, expected_next
            );
        }
    }

    pub fn latest_adj_iteration(&self) -> u8 {
        self.latest_adj_iteration.load(Ordering::Acquire)
    }

    pub fn latest_sent_sim_tick(&self) -> u32 {
        self.latest_sent_sim_tick.load(Ordering::Acquire)
    }

    /// Marks the tick whose state this client has now been sent, starting
    /// the confirmed-tick bookkeeping.
    pub fn set_latest_sent_sim_tick(&self, tick: u32) {
        self.latest_sent_sim_tick.store(tick, Ordering::Release);
    }

    pub fn add_confirmed_ticks(&self, count: u32) {
        self.latest_sent_sim_tick.fetch_add(count, Ordering::AcqRel);
    }

    pub fn refresh_last_seen(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.lock().unwrap().elapsed() > timeout
    }

    #[cfg(test)]
    pub fn set_last_seen(&self, instant: Instant) {
        *self.last_seen.lock().unwrap() = instant;
    }
}
