//! Session registry
//!
//! Maps session ids to live sessions. Written by the negotiator (register,
//! deregister) and read by the receive task on every packet and the playout
//! tick on every pass, so the lock is held only long enough to clone the
//! `Arc` handles out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::config::{JitterConfig, MemoryConfig, SubtitleConfig};
use crate::pipeline::jitter::{JitterBuffer, MemoryBudget};
use crate::pipeline::subtitles::SubtitleScheduler;
use crate::protocol::AudioFormat;
use crate::session::{Session, SessionState, SessionStats};

/// Registry of live sessions plus the pieces a new session is built from
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    jitter_cfg: JitterConfig,
    budget: MemoryBudget,
    subtitle_cfg: SubtitleConfig,
}

impl SessionRegistry {
    pub fn new(
        jitter_cfg: JitterConfig,
        memory_cfg: &MemoryConfig,
        subtitle_cfg: SubtitleConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            jitter_cfg,
            budget: MemoryBudget::new(memory_cfg),
            subtitle_cfg,
        }
    }

    /// Register a session, or refresh one that already exists.
    ///
    /// Re-registering the same id is idempotent: counters, the sequence
    /// cursor and the sync baseline all survive; only the endpoint and the
    /// declared format are replaced (the control plane drives endpoint
    /// changes).
    pub fn register(
        &self,
        session_id: &str,
        endpoint: SocketAddr,
        format: AudioFormat,
        sample_rate: u32,
        now_ms: u64,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(session_id) {
            if existing.endpoint() != endpoint {
                info!(
                    "session {}: endpoint replaced {} -> {}",
                    session_id,
                    existing.endpoint(),
                    endpoint
                );
                existing.set_endpoint(endpoint);
            }
            existing.set_format(format, sample_rate);
            return Arc::clone(existing);
        }

        let session = Arc::new(Session::new(
            session_id.to_string(),
            endpoint,
            format,
            sample_rate,
            JitterBuffer::new(self.jitter_cfg.clone(), self.budget.clone()),
            SubtitleScheduler::new(self.subtitle_cfg.default_duration_ms),
            now_ms,
        ));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        info!(
            "session {}: registered (endpoint {}, {} @ {} Hz)",
            session_id, endpoint, format, sample_rate
        );
        session
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Remove a session and return its final statistics. `None` when the id
    /// is unknown (deregistering twice is a no-op).
    pub fn deregister(&self, session_id: &str) -> Option<SessionStats> {
        let session = self.sessions.lock().unwrap().remove(session_id)?;
        session.set_state(SessionState::Draining);
        session.set_state(SessionState::Terminated);
        let stats = session.final_stats();
        {
            let mut playout = session.playout.lock().unwrap();
            playout.jitter.close();
            playout.subtitles.cancel_all();
        }
        info!(
            "session {}: deregistered ({} received, {} lost, {:.0} ms audio)",
            session_id, stats.received, stats.lost, stats.total_audio_ms
        );
        Some(stats)
    }

    /// Handles to every live session, for the tick pass.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// Reap sessions idle beyond `timeout_ms` and sessions that already
    /// terminated. Returns the reaped ids with their final statistics.
    pub fn expire_idle(&self, now_ms: u64, timeout_ms: u64) -> Vec<(String, SessionStats)> {
        let expired: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| {
                    s.state() == SessionState::Terminated
                        || (s.state().is_live() && s.idle_ms(now_ms) > timeout_ms)
                })
                .cloned()
                .collect()
        };

        let mut reaped = Vec::with_capacity(expired.len());
        for session in expired {
            if session.state() != SessionState::Terminated {
                warn!(
                    "session {}: idle {} ms, expiring",
                    session.id(),
                    session.idle_ms(now_ms)
                );
            }
            if let Some(stats) = self.deregister(session.id()) {
                reaped.push((session.id().to_string(), stats));
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            JitterConfig::default(),
            &MemoryConfig::default(),
            SubtitleConfig::default(),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        reg.register("abc", addr(9000), AudioFormat::Pcm, 44_100, 0);
        let s = reg.lookup("abc").unwrap();
        assert_eq!(s.endpoint(), addr(9000));
        assert!(reg.lookup("missing").is_none());
    }

    #[test]
    fn test_register_idempotent() {
        let reg = registry();
        let first = reg.register("abc", addr(9000), AudioFormat::Pcm, 44_100, 0);
        first.ingest.lock().unwrap().expected_seq = Some(7);

        let second = reg.register("abc", addr(9000), AudioFormat::Opus, 48_000, 100);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.len(), 1);
        // Sequence cursor survives; the declared format is refreshed
        assert_eq!(second.ingest.lock().unwrap().expected_seq, Some(7));
        assert_eq!(second.format(), (AudioFormat::Opus, 48_000));
    }

    #[test]
    fn test_reregister_replaces_endpoint() {
        let reg = registry();
        reg.register("abc", addr(9000), AudioFormat::Pcm, 44_100, 0);
        reg.register("abc", addr(9001), AudioFormat::Pcm, 44_100, 0);
        assert_eq!(reg.lookup("abc").unwrap().endpoint(), addr(9001));
    }

    #[test]
    fn test_deregister_returns_stats_once() {
        let reg = registry();
        reg.register("abc", addr(9000), AudioFormat::Pcm, 44_100, 0);
        assert!(reg.deregister("abc").is_some());
        // Second deregister is a no-op
        assert!(reg.deregister("abc").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_expire_idle() {
        let reg = registry();
        let s = reg.register("old", addr(9000), AudioFormat::Pcm, 44_100, 0);
        s.set_state(SessionState::Active);
        reg.register("fresh", addr(9001), AudioFormat::Pcm, 44_100, 299_000);

        let reaped = reg.expire_idle(300_001, 300_000);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, "old");
        assert!(reg.lookup("old").is_none());
        assert!(reg.lookup("fresh").is_some());
    }

    #[test]
    fn test_expire_reaps_terminated() {
        let reg = registry();
        let s = reg.register("done", addr(9000), AudioFormat::Pcm, 44_100, 0);
        s.set_state(SessionState::Active);
        s.set_state(SessionState::Draining);
        s.set_state(SessionState::Terminated);

        let reaped = reg.expire_idle(1, 300_000);
        assert_eq!(reaped.len(), 1);
        assert!(reg.is_empty());
    }
}
