//! Core value types flowing through the playout pipeline

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::AudioFormat;

/// Subtitle record tied to the session's audio-start reference.
///
/// `start_ms` and `end_ms` are offsets from the session's audio start, on the
/// sender's subtitle timeline. The scheduler anchors them to the local clock
/// via the sync baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleData {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Correction for synthesis lead time, applied to both edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_offset_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// A chunk of audio that has been through the sync engine: its playback
/// deadline is an absolute local-clock millisecond value.
///
/// The jitter buffer orders chunks by `deadline_ms` ascending, ties broken by
/// `sequence`.
#[derive(Debug, Clone)]
pub struct TimedChunk {
    pub session_id: String,
    pub payload: Bytes,
    pub format: AudioFormat,
    pub sample_rate: u32,
    /// Local-clock instant the audio must reach the sink, in ms.
    pub deadline_ms: u64,
    /// Estimated play duration of the payload, in ms.
    pub duration_ms: f64,
    pub sequence: u32,
    pub subtitle: Option<SubtitleData>,
    /// Local-clock arrival time, in ms.
    pub received_at_ms: u64,
    /// Effective hold assigned at insert; the chunk is released once
    /// `deadline_ms + buffer_ms` has passed.
    pub buffer_ms: u64,
}

/// Messages the ingest side feeds into a session's playout side.
///
/// The receive task and the tick task touch disjoint session sub-states and
/// coordinate exclusively through this per-session queue.
#[derive(Debug)]
pub enum InboundItem {
    Chunk(TimedChunk),
    /// The sync baseline was established; carries `audio_start_local_ms`.
    Baseline(u64),
    /// The baseline slewed by this many ms; pending subtitle events must be
    /// rescheduled from the updated anchor.
    Rebase(i64),
    /// A subtitle record to anchor to the session timeline.
    Subtitle(SubtitleData),
}
