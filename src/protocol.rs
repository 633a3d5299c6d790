//! UDP wire format for audio datagrams
//!
//! Each datagram carries exactly one packet; there is no framing, no
//! checksum, and no fragmentation (datagram integrity is the transport's
//! responsibility). All integers are big-endian:
//!
//! ```text
//! ┌─────────┬────────────┬─────┬────────┬─────────────┬─────┬─────────────┬─────────┬─────────────┬─────────┐
//! │ sid_len │ session_id │ seq │ tts_ts │ playback_ts │ fmt │ sample_rate │ is_last │ payload_len │ payload │
//! │ u8      │ sid_len B  │ u32 │ u64    │ u64         │ u8  │ u32         │ u8      │ u32         │ raw B   │
//! └─────────┴────────────┴─────┴────────┴─────────────┴─────┴─────────────┴─────────┴─────────────┴─────────┘
//! ```
//!
//! Minimum datagram size is 31 bytes plus the session id. Format codes:
//! 0 = pcm, 1 = mp3, 2 = opus. Payloads are raw bytes; nothing on this path
//! is base64- or otherwise re-encoded.
//!
//! A datagram that fails any check here is a *transient* error: the receive
//! stage counts it and moves on, it never aborts the socket loop.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Fixed header bytes surrounding the session id and payload.
pub const MIN_HEADER_LEN: usize = 31;

/// Longest accepted session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Audio payload encoding carried in the format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Uncompressed 16-bit mono PCM
    Pcm,
    Mp3,
    Opus,
}

impl AudioFormat {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AudioFormat::Pcm),
            1 => Some(AudioFormat::Mp3),
            2 => Some(AudioFormat::Opus),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AudioFormat::Pcm => 0,
            AudioFormat::Mp3 => 1,
            AudioFormat::Opus => 2,
        }
    }

    /// Compressed formats have their chunk duration inferred from timestamp
    /// deltas rather than payload size.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, AudioFormat::Pcm)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioFormat::Pcm => write!(f, "pcm"),
            AudioFormat::Mp3 => write!(f, "mp3"),
            AudioFormat::Opus => write!(f, "opus"),
        }
    }
}

/// One parsed audio datagram
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    pub session_id: String,
    pub sequence: u32,
    /// Sender-clock instant the audio was synthesized, in ms.
    pub tts_ts: u64,
    /// Sender-clock instant the audio is meant to play, in ms. Authoritative
    /// for ordering; independent of `tts_ts` on purpose.
    pub playback_ts: u64,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

/// Why a datagram was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {len} bytes")]
    TooShort { len: usize },

    #[error("session id invalid or out of range")]
    BadSessionId,

    #[error("unknown format code {0}")]
    UnknownFormat(u8),

    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Session ids are 1–128 chars of `[A-Za-z0-9_-]`, on the wire and on the
/// control plane alike.
pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Parse one datagram.
pub fn parse_packet(datagram: &[u8]) -> Result<AudioPacket, WireError> {
    let len = datagram.len();
    if len < MIN_HEADER_LEN {
        return Err(WireError::TooShort { len });
    }

    let mut buf = datagram;
    let sid_len = buf.get_u8() as usize;
    if sid_len == 0 || sid_len > MAX_SESSION_ID_LEN || len < MIN_HEADER_LEN + sid_len {
        return Err(WireError::BadSessionId);
    }

    let session_id = match std::str::from_utf8(&buf[..sid_len]) {
        Ok(s) if valid_session_id(s) => s.to_string(),
        _ => return Err(WireError::BadSessionId),
    };
    buf.advance(sid_len);

    let sequence = buf.get_u32();
    let tts_ts = buf.get_u64();
    let playback_ts = buf.get_u64();

    let fmt_code = buf.get_u8();
    let format = AudioFormat::from_code(fmt_code).ok_or(WireError::UnknownFormat(fmt_code))?;

    let sample_rate = buf.get_u32();
    let is_last = buf.get_u8() != 0;

    let declared = buf.get_u32() as usize;
    if declared != buf.remaining() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: buf.remaining(),
        });
    }

    Ok(AudioPacket {
        session_id,
        sequence,
        tts_ts,
        playback_ts,
        format,
        sample_rate,
        is_last,
        payload: Bytes::copy_from_slice(buf),
    })
}

/// Encode a packet into one datagram. The counterpart of [`parse_packet`],
/// used by tests and LAN sender tooling.
pub fn encode_packet(pkt: &AudioPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(MIN_HEADER_LEN + pkt.session_id.len() + pkt.payload.len());
    buf.put_u8(pkt.session_id.len() as u8);
    buf.put_slice(pkt.session_id.as_bytes());
    buf.put_u32(pkt.sequence);
    buf.put_u64(pkt.tts_ts);
    buf.put_u64(pkt.playback_ts);
    buf.put_u8(pkt.format.code());
    buf.put_u32(pkt.sample_rate);
    buf.put_u8(pkt.is_last as u8);
    buf.put_u32(pkt.payload.len() as u32);
    buf.put_slice(&pkt.payload);
    buf.freeze()
}
