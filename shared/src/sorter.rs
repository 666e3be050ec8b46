//! Tick-ordered message sequencing.
//!
//! The sorter decouples when a message physically arrives from which tick
//! it logically belongs to. Arrivals in any order are bucketed by tick;
//! the simulation drains exactly one bucket per tick, strictly in order.

use std::collections::VecDeque;

use log::error;

/// How many ticks ahead of the watermark a message may claim to be.
/// Anything past this is a misbehaving or badly delayed peer.
pub const SORTER_BUFFER_SIZE: usize = 10;

/// Classification of a pushed message's tick against the accept window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    TooOld,
    TooNew,
}

/// Outcome of a push: how the tick classified, and the signed distance
/// from the watermark (kept for drift diagnostics either way).
#[derive(Debug, Clone, Copy)]
pub struct PushResult {
    pub validity: Validity,
    pub diff: i64,
}

/// Buffers messages keyed by tick and releases them in strict tick order.
///
/// `buckets[0]` always corresponds to `current_tick` (the watermark: the
/// oldest tick still accepted). Consumption is strictly monotonic — a tick
/// can only be drained once, via `start_receive`/`end_receive`.
#[derive(Debug)]
pub struct MessageSorter<T> {
    buckets: VecDeque<Vec<T>>,
    current_tick: u32,
    receiving: bool,
    dropped_too_old: u64,
    dropped_too_new: u64,
}

impl<T> MessageSorter<T> {
    pub fn new(start_tick: u32) -> Self {
        let mut buckets = VecDeque::with_capacity(SORTER_BUFFER_SIZE);
        for _ in 0..SORTER_BUFFER_SIZE {
            buckets.push_back(Vec::new());
        }
        Self {
            buckets,
            current_tick: start_tick,
            receiving: false,
            dropped_too_old: 0,
            dropped_too_new: 0,
        }
    }

    /// The oldest tick this sorter will still accept and the next tick
    /// that `start_receive` expects.
    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    pub fn dropped_too_old(&self) -> u64 {
        self.dropped_too_old
    }

    pub fn dropped_too_new(&self) -> u64 {
        self.dropped_too_new
    }

    /// Buckets `message` under `tick_num` if it falls inside the accept
    /// window. Out-of-window messages, and messages for a tick whose
    /// receive is currently open, are dropped and counted; the buffer is
    /// left untouched.
    pub fn push(&mut self, tick_num: u32, message: T) -> PushResult {
        let diff = i64::from(tick_num) - i64::from(self.current_tick);

        // The watermark bucket is off-limits while a receive is open: the
        // drain already took it, so a late landing would never be seen.
        if diff < 0 || (diff == 0 && self.receiving) {
            self.dropped_too_old += 1;
            return PushResult {
                validity: Validity::TooOld,
                diff,
            };
        }
        if diff >= SORTER_BUFFER_SIZE as i64 {
            self.dropped_too_new += 1;
            return PushResult {
                validity: Validity::TooNew,
                diff,
            };
        }

        self.buckets[diff as usize].push(message);
        PushResult {
            validity: Validity::Valid,
            diff,
        }
    }

    /// Takes the bucket for exactly `tick_num`, which must be the current
    /// watermark. An empty bucket is a normal, common result (heartbeat-only
    /// tick). Must be paired with `end_receive`.
    pub fn start_receive(&mut self, tick_num: u32) -> Vec<T> {
        if self.receiving {
            error!("start_receive called while a receive was already open.");
            return Vec::new();
        }
        if tick_num != self.current_tick {
            error!(
                "Tried to receive tick {} but the watermark is {}. Ticks must be drained in order.",
                tick_num, self.current_tick
            );
            return Vec::new();
        }

        self.receiving = true;
        std::mem::take(&mut self.buckets[0])
    }

    /// Closes the open receive: the drained tick's bucket is retired and
    /// the watermark advances by one.
    pub fn end_receive(&mut self) {
        if !self.receiving {
            error!("end_receive called without a matching start_receive.");
            return;
        }

        self.receiving = false;
        self.buckets.pop_front();
        self.buckets.push_back(Vec::new());
        self.current_tick = self.current_tick.wrapping_add(1);
    }
}
