//! Per-session state
//!
//! A session is the unit of isolation: every packet, chunk, timer and
//! counter belongs to exactly one, and sessions never synchronize with each
//! other. Mutable state is split into two halves with one writer each: the
//! receive task owns the ingest half (sequence cursor, estimator, sync
//! engine), the playout tick owns the playout half (jitter buffer, subtitle
//! scheduler), and the halves communicate only through the session's
//! inbound queue.

pub mod registry;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};

use crate::events::{SinkEvent, SubtitleEvent};
use crate::pipeline::jitter::JitterBuffer;
use crate::pipeline::subtitles::SubtitleScheduler;
use crate::pipeline::sync::{ConditionEstimator, NetworkCondition, SyncEngine};
use crate::pipeline::types::InboundItem;
use crate::protocol::AudioFormat;

/// Capacity of the per-session ingest → playout queue.
const INBOUND_QUEUE_LEN: usize = 512;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered; no packets yet.
    Pending,
    /// First datagram accepted.
    Active,
    /// Last-flag seen or end requested; buffer emptying.
    Draining,
    /// Buffer empty and deregistered; terminal.
    Terminated,
}

impl SessionState {
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Pending, Active) => true,
            (Pending, Draining) => true,
            (Active, Draining) => true,
            // Idle timeout skips draining
            (Pending, Terminated) => true,
            (Active, Terminated) => true,
            (Draining, Terminated) => true,
            (Terminated, _) => false,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Pending => "Pending",
            SessionState::Active => "Active",
            SessionState::Draining => "Draining",
            SessionState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}

/// Final statistics emitted when a session ends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub received: u64,
    pub lost: u64,
    pub duplicates: u64,
    pub reordered: u64,
    /// Accepted at ingest but unusable downstream: late drops plus overrun
    /// evictions.
    pub out_of_window: u64,
    pub dropped_late: u64,
    pub dropped_overrun: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub memory_refusals: u64,
    pub mean_latency_ms: f64,
    pub mean_jitter_ms: f64,
    pub total_audio_ms: f64,
    /// Wall-clock epoch ms; for operators only, never used for scheduling.
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
}

impl SessionStats {
    /// Accounting identity: everything attributed to the session.
    pub fn total_observed(&self) -> u64 {
        self.received + self.lost + self.duplicates
    }
}

/// Ingest half: written only by the receive task
#[derive(Debug, Default)]
pub struct IngestState {
    /// Next expected sequence; set by the first accepted packet.
    pub expected_seq: Option<u32>,
    pub estimator: ConditionEstimator,
    pub sync: SyncEngine,
    /// Packets whose format tag disagreed with the declared one. The session
    /// continues degraded; the first disagreement is logged.
    pub format_mismatches: u64,
}

/// Playout half: written only by the tick task
pub struct PlayoutState {
    pub jitter: JitterBuffer,
    pub subtitles: SubtitleScheduler,
    pub inbound_rx: mpsc::Receiver<InboundItem>,
    /// Events the sink refused; retried next tick, never reordered.
    pub pending_sink: VecDeque<SinkEvent>,
    pub pending_subtitles: VecDeque<SubtitleEvent>,
    /// Audio actually released to the sink, in ms.
    pub played_audio_ms: f64,
    /// Ticks in a row the sink refused an event; resets on success.
    pub consecutive_busy: u32,
    /// Drain already announced to the sink.
    pub drain_emitted: bool,
    /// Drain fully delivered and waiters woken.
    pub drain_notified: bool,
}

/// One live session
pub struct Session {
    id: String,
    /// Expected sender endpoint; replaced by a control-plane re-register.
    endpoint: Mutex<SocketAddr>,
    format: Mutex<(AudioFormat, u32)>,
    state: Mutex<SessionState>,

    pub ingest: Mutex<IngestState>,
    pub playout: Mutex<PlayoutState>,
    pub inbound_tx: mpsc::Sender<InboundItem>,

    /// Latest condition snapshot, written at ingest, read at playout.
    condition: Mutex<NetworkCondition>,

    last_activity_ms: AtomicU64,
    started_wall_ms: u64,
    /// Signalled when the jitter buffer finishes draining.
    pub drained: Notify,
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Session {
    pub fn new(
        id: String,
        endpoint: SocketAddr,
        format: AudioFormat,
        sample_rate: u32,
        jitter: JitterBuffer,
        subtitles: SubtitleScheduler,
        now_ms: u64,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        Self {
            id,
            endpoint: Mutex::new(endpoint),
            format: Mutex::new((format, sample_rate)),
            state: Mutex::new(SessionState::Pending),
            ingest: Mutex::new(IngestState::default()),
            playout: Mutex::new(PlayoutState {
                jitter,
                subtitles,
                inbound_rx,
                pending_sink: VecDeque::new(),
                pending_subtitles: VecDeque::new(),
                played_audio_ms: 0.0,
                consecutive_busy: 0,
                drain_emitted: false,
                drain_notified: false,
            }),
            inbound_tx,
            condition: Mutex::new(NetworkCondition::default()),
            last_activity_ms: AtomicU64::new(now_ms),
            started_wall_ms: wall_ms(),
            drained: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.lock().unwrap()
    }

    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.lock().unwrap() = endpoint;
    }

    pub fn format(&self) -> (AudioFormat, u32) {
        *self.format.lock().unwrap()
    }

    pub fn set_format(&self, format: AudioFormat, sample_rate: u32) {
        *self.format.lock().unwrap() = (format, sample_rate);
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Validated transition; returns whether it was applied.
    pub fn set_state(&self, target: SessionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.can_transition_to(&target) {
            *state = target;
            true
        } else {
            debug!(
                "session {}: refused transition {} -> {}",
                self.id, state, target
            );
            false
        }
    }

    pub fn condition(&self) -> NetworkCondition {
        *self.condition.lock().unwrap()
    }

    pub fn set_condition(&self, condition: NetworkCondition) {
        *self.condition.lock().unwrap() = condition;
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Assemble final statistics from both halves.
    pub fn final_stats(&self) -> SessionStats {
        let ingest = self.ingest.lock().unwrap();
        let playout = self.playout.lock().unwrap();
        let jstats = playout.jitter.stats();

        SessionStats {
            received: ingest.estimator.received(),
            lost: ingest.estimator.lost(),
            duplicates: ingest.estimator.duplicates(),
            reordered: ingest.estimator.reordered(),
            out_of_window: jstats.dropped_late + jstats.dropped_overrun,
            dropped_late: jstats.dropped_late,
            dropped_overrun: jstats.dropped_overrun,
            underruns: jstats.underruns,
            overruns: jstats.overruns,
            memory_refusals: jstats.memory_refusals,
            mean_latency_ms: ingest.estimator.mean_latency_ms(),
            mean_jitter_ms: ingest.estimator.mean_jitter_ms(),
            total_audio_ms: playout.played_audio_ms,
            started_at_ms: self.started_wall_ms,
            ended_at_ms: wall_ms(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JitterConfig, MemoryConfig, SubtitleConfig};
    use crate::pipeline::jitter::MemoryBudget;

    fn make_session(id: &str) -> Session {
        Session::new(
            id.to_string(),
            "127.0.0.1:9000".parse().unwrap(),
            AudioFormat::Pcm,
            44_100,
            JitterBuffer::new(
                JitterConfig::default(),
                MemoryBudget::new(&MemoryConfig::default()),
            ),
            SubtitleScheduler::new(SubtitleConfig::default().default_duration_ms),
            1_000,
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let s = make_session("a");
        assert_eq!(s.state(), SessionState::Pending);
        assert!(s.set_state(SessionState::Active));
        assert!(s.set_state(SessionState::Draining));
        assert!(s.set_state(SessionState::Terminated));
        // Terminal
        assert!(!s.set_state(SessionState::Active));
        assert_eq!(s.state(), SessionState::Terminated);
    }

    #[test]
    fn test_draining_cannot_resume() {
        let s = make_session("a");
        s.set_state(SessionState::Active);
        s.set_state(SessionState::Draining);
        assert!(!s.set_state(SessionState::Active));
        assert_eq!(s.state(), SessionState::Draining);
    }

    #[test]
    fn test_idle_tracking() {
        let s = make_session("a");
        assert_eq!(s.idle_ms(1_500), 500);
        s.touch(2_000);
        assert_eq!(s.idle_ms(2_300), 300);
    }

    #[test]
    fn test_stats_identity() {
        let stats = SessionStats {
            received: 10,
            lost: 2,
            duplicates: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_observed(), 13);
    }
}
