//! Subtitle scheduling on the session timeline
//!
//! Subtitle records carry offsets from the session's audio start; the
//! scheduler anchors them to the local clock once the sync baseline exists
//! and holds a min-heap of pending show/hide deadlines serviced by the
//! playout tick. One heap per session replaces one timer per event; at tick
//! granularity that is both cheaper and easier to cancel.
//!
//! Records arriving before the baseline is established are parked and
//! anchored as soon as the first packet fixes the timeline. When the
//! baseline slews, every pending deadline shifts with it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::pipeline::types::SubtitleData;

/// What a due cue asks the sink to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleAction {
    Show,
    Hide,
}

/// A cue whose time has come
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleCue {
    pub action: SubtitleAction,
    pub text: String,
    /// The cue's deadline was already in the past when it was scheduled.
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCue {
    at_ms: u64,
    /// Insertion counter; keeps a record's show ahead of its hide and makes
    /// the heap order total.
    order: u64,
    action: SubtitleAction,
    text: String,
    late: bool,
}

impl Ord for PendingCue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at_ms, self.order).cmp(&(other.at_ms, other.order))
    }
}

impl PartialOrd for PendingCue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-session scheduler of show/hide cues
#[derive(Debug, Default)]
pub struct SubtitleScheduler {
    pending: BinaryHeap<Reverse<PendingCue>>,
    /// Records seen before the baseline existed.
    unanchored: Vec<SubtitleData>,
    audio_start_local_ms: Option<u64>,
    default_duration_ms: u64,
    counter: u64,
    scheduled: u64,
    emitted: u64,
}

impl SubtitleScheduler {
    pub fn new(default_duration_ms: u64) -> Self {
        Self {
            default_duration_ms,
            ..Default::default()
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Anchor the scheduler; parked records are scheduled immediately.
    pub fn set_baseline(&mut self, audio_start_local_ms: u64, now_ms: u64) {
        self.audio_start_local_ms = Some(audio_start_local_ms);
        for sub in std::mem::take(&mut self.unanchored) {
            self.schedule(&sub, now_ms);
        }
    }

    /// Queue one record's show and hide cues.
    pub fn schedule(&mut self, sub: &SubtitleData, now_ms: u64) {
        let Some(base) = self.audio_start_local_ms else {
            self.unanchored.push(sub.clone());
            return;
        };

        let offset = sub.tts_offset_ms.unwrap_or(0);
        let end_ms = if sub.end_ms > sub.start_ms {
            sub.end_ms
        } else {
            sub.start_ms + self.default_duration_ms
        };

        let show_at = base
            .saturating_add_signed(offset)
            .saturating_add(sub.start_ms);
        let hide_at = base.saturating_add_signed(offset).saturating_add(end_ms);

        self.push(show_at, SubtitleAction::Show, sub.text.clone(), now_ms);
        self.push(hide_at, SubtitleAction::Hide, sub.text.clone(), now_ms);
        self.scheduled += 1;
    }

    fn push(&mut self, at_ms: u64, action: SubtitleAction, text: String, now_ms: u64) {
        let order = self.counter;
        self.counter += 1;
        self.pending.push(Reverse(PendingCue {
            at_ms,
            order,
            action,
            text,
            late: at_ms < now_ms,
        }));
    }

    /// Shift every pending cue by the baseline slew.
    pub fn rebase(&mut self, delta_ms: i64) {
        if delta_ms == 0 || self.pending.is_empty() {
            if let Some(base) = self.audio_start_local_ms {
                self.audio_start_local_ms = Some(base.saturating_add_signed(delta_ms));
            }
            return;
        }
        if let Some(base) = self.audio_start_local_ms {
            self.audio_start_local_ms = Some(base.saturating_add_signed(delta_ms));
        }
        let shifted: Vec<PendingCue> = self
            .pending
            .drain()
            .map(|Reverse(mut cue)| {
                cue.at_ms = cue.at_ms.saturating_add_signed(delta_ms);
                cue
            })
            .collect();
        self.pending = shifted.into_iter().map(Reverse).collect();
    }

    /// Pop every cue due at `now`, in deadline order.
    pub fn due(&mut self, now_ms: u64) -> Vec<SubtitleCue> {
        let mut out = Vec::new();
        while let Some(Reverse(front)) = self.pending.peek() {
            if front.at_ms > now_ms {
                break;
            }
            let Reverse(cue) = self.pending.pop().unwrap();
            self.emitted += 1;
            out.push(SubtitleCue {
                action: cue.action,
                text: cue.text,
                late: cue.late,
            });
        }
        out
    }

    /// Drop everything pending. Idempotent; used at session teardown.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.unanchored.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(text: &str, start_ms: u64, end_ms: u64) -> SubtitleData {
        SubtitleData {
            text: text.to_string(),
            start_ms,
            end_ms,
            tts_offset_ms: None,
            confidence: None,
        }
    }

    #[test]
    fn test_show_then_hide_at_baseline_offsets() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(10_000, 9_000);
        sched.schedule(&sub("hello", 0, 500), 9_000);

        assert!(sched.due(9_999).is_empty());

        let cues = sched.due(10_000);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].action, SubtitleAction::Show);
        assert_eq!(cues[0].text, "hello");
        assert!(!cues[0].late);

        assert!(sched.due(10_499).is_empty());
        let cues = sched.due(10_500);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].action, SubtitleAction::Hide);
    }

    #[test]
    fn test_pair_never_interleaves() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(10_000, 9_000);
        sched.schedule(&sub("one", 0, 400), 9_000);
        sched.schedule(&sub("two", 200, 600), 9_000);

        let cues = sched.due(11_000);
        let texts: Vec<(&str, SubtitleAction)> = cues
            .iter()
            .map(|c| (c.text.as_str(), c.action))
            .collect();
        // Each record's show precedes its hide; overlap between records is fine
        assert_eq!(
            texts,
            vec![
                ("one", SubtitleAction::Show),
                ("two", SubtitleAction::Show),
                ("one", SubtitleAction::Hide),
                ("two", SubtitleAction::Hide),
            ]
        );
    }

    #[test]
    fn test_past_cue_flagged_late() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(1_000, 5_000);
        sched.schedule(&sub("old", 0, 500), 5_000);

        let cues = sched.due(5_000);
        assert_eq!(cues.len(), 2);
        assert!(cues.iter().all(|c| c.late));
    }

    #[test]
    fn test_default_duration_applied() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(10_000, 9_000);
        // end <= start: hide falls back to start + default duration
        sched.schedule(&sub("x", 100, 100), 9_000);

        assert_eq!(sched.due(10_100).len(), 1);
        assert!(sched.due(15_099).is_empty());
        assert_eq!(sched.due(15_100).len(), 1);
    }

    #[test]
    fn test_tts_offset_shifts_both_edges() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(10_000, 9_000);
        let mut s = sub("x", 100, 300);
        s.tts_offset_ms = Some(-50);
        sched.schedule(&s, 9_000);

        assert!(sched.due(10_049).is_empty());
        assert_eq!(sched.due(10_050).len(), 1);
        assert_eq!(sched.due(10_250).len(), 1);
    }

    #[test]
    fn test_unanchored_records_wait_for_baseline() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.schedule(&sub("early", 0, 200), 500);
        assert_eq!(sched.pending_len(), 0);

        sched.set_baseline(2_000, 1_000);
        assert_eq!(sched.pending_len(), 2);
        assert_eq!(sched.due(2_000).len(), 1);
    }

    #[test]
    fn test_rebase_shifts_pending() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(10_000, 9_000);
        sched.schedule(&sub("x", 0, 500), 9_000);

        sched.rebase(30);
        assert!(sched.due(10_029).is_empty());
        assert_eq!(sched.due(10_030).len(), 1);

        sched.rebase(-10);
        assert_eq!(sched.due(10_520).len(), 1);
    }

    #[test]
    fn test_cancel_all_idempotent() {
        let mut sched = SubtitleScheduler::new(5_000);
        sched.set_baseline(10_000, 9_000);
        sched.schedule(&sub("x", 0, 500), 9_000);
        sched.cancel_all();
        sched.cancel_all();
        assert!(sched.due(20_000).is_empty());
    }
}
