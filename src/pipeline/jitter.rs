//! Adaptive jitter buffer
//!
//! Holds [`TimedChunk`]s ordered by deadline (ties broken by sequence) and
//! releases each one once its deadline plus an adaptive hold has passed. The
//! hold absorbs network variance: it grows from the base target with observed
//! jitter and packet loss, and the target itself adapts to under/overruns on
//! a five-second cadence.
//!
//! Release order is by deadline, not arrival, so a reordered packet that
//! made it in before its slot plays in place. Chunks that arrive with their
//! deadline already in the past are dropped and counted, never played.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info};

use crate::config::{JitterConfig, MemoryConfig};
use crate::pipeline::state::BufferState;
use crate::pipeline::types::TimedChunk;
use crate::pipeline::sync::NetworkCondition;

/// Extra hold per ms of smoothed jitter is capped here.
const JITTER_HOLD_CAP_MS: f64 = 100.0;

/// Extra hold applied at 100% packet loss.
const LOSS_HOLD_MS: f64 = 50.0;

/// Chunk cap divisor: the buffer holds at most `2 × hold / 20 ms` chunks.
const NOMINAL_CHUNK_MS: f64 = 20.0;

/// Spacing between buffer-time adaptation decisions.
const ADAPT_INTERVAL_MS: u64 = 5_000;

/// Growth factor after an underrun interval.
const ADAPT_GROW: f64 = 1.2;

/// Shrink factor after a calm overrun interval.
const ADAPT_SHRINK: f64 = 0.9;

/// Overruns only shrink the target while jitter is below this.
const ADAPT_SHRINK_MAX_JITTER_MS: f64 = 10.0;

/// Payload-byte budget shared by every session's buffer
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    per_session_bytes: usize,
    total_bytes: usize,
    global_in_use: Arc<AtomicUsize>,
}

impl MemoryBudget {
    pub fn new(cfg: &MemoryConfig) -> Self {
        Self {
            per_session_bytes: cfg.per_session_bytes,
            total_bytes: cfg.total_bytes,
            global_in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn try_reserve(&self, session_in_use: usize, bytes: usize) -> bool {
        if session_in_use + bytes > self.per_session_bytes {
            return false;
        }
        let prior = self.global_in_use.fetch_add(bytes, Ordering::Relaxed);
        if prior + bytes > self.total_bytes {
            self.global_in_use.fetch_sub(bytes, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn release(&self, bytes: usize) {
        self.global_in_use.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn global_in_use(&self) -> usize {
        self.global_in_use.load(Ordering::Relaxed)
    }
}

/// Cumulative buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub buffered: u64,
    pub played: u64,
    pub dropped_late: u64,
    pub dropped_overrun: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub memory_refusals: u64,
    /// Sequence gaps observed at emission (a missing chunk never arrived).
    pub gaps: u64,
    pub out_of_order_emitted: u64,
}

/// Result of one insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    DroppedLate,
    MemoryPressure,
}

/// One chunk leaving the buffer
#[derive(Debug)]
pub struct Released {
    pub chunk: TimedChunk,
    /// The chunk was emitted behind a higher sequence number because the
    /// in-between chunk arrived too late; the sink may choose to skip it.
    pub out_of_order: bool,
}

/// Everything a tick produced
#[derive(Debug, Default)]
pub struct TickOutput {
    pub released: Vec<Released>,
    pub underrun: bool,
    /// The buffer finished draining on this tick.
    pub drained: bool,
}

/// Per-session deadline-ordered buffer with an adaptive hold
pub struct JitterBuffer {
    chunks: VecDeque<TimedChunk>,
    cfg: JitterConfig,
    budget: MemoryBudget,

    /// Current adaptive base hold; clamped to `[min_ms, max_ms]`.
    target_buffer_ms: f64,
    state: BufferState,
    stats: JitterStats,

    buffered_bytes: usize,
    buffered_duration_ms: f64,

    interval_underruns: u64,
    interval_overruns: u64,
    last_adapt_ms: Option<u64>,

    last_emitted_seq: Option<u32>,
    last_emitted_deadline_ms: u64,
}

impl JitterBuffer {
    pub fn new(cfg: JitterConfig, budget: MemoryBudget) -> Self {
        let target_buffer_ms = cfg.target_ms as f64;
        Self {
            chunks: VecDeque::new(),
            cfg,
            budget,
            target_buffer_ms,
            state: BufferState::Filling,
            stats: JitterStats::default(),
            buffered_bytes: 0,
            buffered_duration_ms: 0.0,
            interval_underruns: 0,
            interval_overruns: 0,
            last_adapt_ms: None,
            last_emitted_seq: None,
            last_emitted_deadline_ms: 0,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn target_buffer_ms(&self) -> u64 {
        self.target_buffer_ms.round() as u64
    }

    /// The hold an insert would get under the given conditions.
    pub fn effective_buffer_ms(&self, network: &NetworkCondition) -> u64 {
        let hold = self.target_buffer_ms
            + (2.0 * network.jitter_ms).min(JITTER_HOLD_CAP_MS)
            + LOSS_HOLD_MS * network.packet_loss_ratio;
        (hold.round() as u64).clamp(self.cfg.min_ms, self.cfg.max_ms)
    }

    /// Insert one chunk, decorated with the hold computed from current
    /// network conditions.
    pub fn insert(
        &mut self,
        mut chunk: TimedChunk,
        network: &NetworkCondition,
        now_ms: u64,
    ) -> InsertOutcome {
        if !self.state.is_live() || chunk.deadline_ms < now_ms {
            self.stats.dropped_late += 1;
            return InsertOutcome::DroppedLate;
        }

        let payload_len = chunk.payload.len();
        if !self.budget.try_reserve(self.buffered_bytes, payload_len) {
            self.stats.memory_refusals += 1;
            return InsertOutcome::MemoryPressure;
        }

        let hold = self.effective_buffer_ms(network);
        chunk.buffer_ms = hold;
        self.buffered_bytes += payload_len;
        self.buffered_duration_ms += chunk.duration_ms;
        self.stats.buffered += 1;

        let key = (chunk.deadline_ms, chunk.sequence);
        let pos = self
            .chunks
            .iter()
            .position(|c| (c.deadline_ms, c.sequence) > key);
        match pos {
            Some(i) => self.chunks.insert(i, chunk),
            None => self.chunks.push_back(chunk),
        }

        if self.state == BufferState::Filling
            && self.buffered_duration_ms >= self.cfg.min_ms as f64
        {
            self.transition(BufferState::Playing);
        }

        // Chunk cap scales with the hold: at most 2× the hold's worth of
        // nominal 20 ms chunks. Oldest deadlines go first.
        let max_chunks = ((2.0 * hold as f64) / NOMINAL_CHUNK_MS).ceil() as usize;
        while self.chunks.len() > max_chunks.max(1) {
            if let Some(evicted) = self.chunks.pop_front() {
                self.forget(&evicted);
                self.stats.overruns += 1;
                self.stats.dropped_overrun += 1;
                self.interval_overruns += 1;
                debug!(
                    "jitter overrun: evicted seq {} (deadline {})",
                    evicted.sequence, evicted.deadline_ms
                );
            }
        }

        InsertOutcome::Buffered
    }

    /// Release every chunk whose hold has expired, in deadline order.
    ///
    /// Calling twice with the same `now` releases everything due the first
    /// time and nothing the second.
    pub fn tick(&mut self, now_ms: u64) -> TickOutput {
        let mut out = TickOutput::default();
        if self.state.is_closed() {
            return out;
        }

        let had_chunks = !self.chunks.is_empty();
        while let Some(front) = self.chunks.front() {
            if front.deadline_ms + front.buffer_ms > now_ms {
                break;
            }
            let chunk = self.chunks.pop_front().unwrap();
            self.forget(&chunk);
            self.stats.played += 1;

            let out_of_order = match self.last_emitted_seq {
                Some(last) => {
                    let ahead = chunk.sequence.wrapping_sub(last);
                    if ahead > 1 && ahead < 0x8000_0000 {
                        self.stats.gaps += 1;
                    }
                    let behind = ahead == 0 || ahead >= 0x8000_0000;
                    if behind {
                        self.stats.out_of_order_emitted += 1;
                    }
                    behind
                }
                None => false,
            };
            if !out_of_order {
                self.last_emitted_seq = Some(chunk.sequence);
            }

            debug_assert!(chunk.deadline_ms >= self.last_emitted_deadline_ms);
            self.last_emitted_deadline_ms = chunk.deadline_ms;

            out.released.push(Released {
                chunk,
                out_of_order,
            });
        }

        if self.chunks.is_empty() && had_chunks {
            match self.state {
                BufferState::Playing => {
                    self.stats.underruns += 1;
                    self.interval_underruns += 1;
                    out.underrun = true;
                    self.transition(BufferState::Filling);
                }
                BufferState::Draining => {
                    self.transition(BufferState::Closed);
                    out.drained = true;
                }
                _ => {}
            }
        } else if self.state.is_draining() && self.chunks.is_empty() {
            self.transition(BufferState::Closed);
            out.drained = true;
        }

        out
    }

    /// Re-evaluate the base hold. At most one decision per five seconds;
    /// interval counters reset after each decision.
    pub fn adapt(&mut self, now_ms: u64, jitter_ms: f64) {
        if !self.cfg.adaptive {
            return;
        }
        match self.last_adapt_ms {
            Some(last) if now_ms.saturating_sub(last) < ADAPT_INTERVAL_MS => return,
            None => {
                // First window starts counting from here
                self.last_adapt_ms = Some(now_ms);
                return;
            }
            _ => {}
        }
        self.last_adapt_ms = Some(now_ms);

        let before = self.target_buffer_ms;
        if self.interval_underruns > 0 {
            self.target_buffer_ms =
                (self.target_buffer_ms * ADAPT_GROW).min(self.cfg.max_ms as f64);
        } else if self.interval_overruns > 0 && jitter_ms < ADAPT_SHRINK_MAX_JITTER_MS {
            self.target_buffer_ms =
                (self.target_buffer_ms * ADAPT_SHRINK).max(self.cfg.min_ms as f64);
        }
        if (self.target_buffer_ms - before).abs() > f64::EPSILON {
            info!(
                "jitter hold adapted {:.0} -> {:.0} ms ({} underruns, {} overruns)",
                before, self.target_buffer_ms, self.interval_underruns, self.interval_overruns
            );
        }
        self.interval_underruns = 0;
        self.interval_overruns = 0;
    }

    /// Stop accepting inserts. The buffer empties over subsequent ticks;
    /// the tick that leaves it empty reports the drain and closes it.
    pub fn begin_drain(&mut self) {
        if self.state.is_live() {
            self.transition(BufferState::Draining);
        }
    }

    /// Drop everything immediately. Used on hard shutdown; released chunks
    /// are discarded, not played.
    pub fn close(&mut self) {
        for chunk in std::mem::take(&mut self.chunks) {
            self.budget.release(chunk.payload.len());
        }
        self.buffered_bytes = 0;
        self.buffered_duration_ms = 0.0;
        if self.state.is_live() {
            self.transition(BufferState::Draining);
        }
        self.transition(BufferState::Closed);
    }

    fn forget(&mut self, chunk: &TimedChunk) {
        self.budget.release(chunk.payload.len());
        self.buffered_bytes -= chunk.payload.len();
        self.buffered_duration_ms = (self.buffered_duration_ms - chunk.duration_ms).max(0.0);
    }

    fn transition(&mut self, target: BufferState) {
        if self.state.can_transition_to(&target) {
            self.state = target;
        } else {
            debug!("refused buffer transition {} -> {}", self.state, target);
        }
    }
}

impl Drop for JitterBuffer {
    fn drop(&mut self) {
        self.budget.release(self.buffered_bytes);
    }
}
