//! Session Model
//!
//! A session is one tagged recording of RR intervals. While recording it lives as an
//! [`ActiveSession`] owned by the recording controller; once frozen it becomes an immutable
//! [`Session`] that is handed to the upload queue.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::tag::SessionTag;

/// Event id of a session that is not part of a chained sequence.
pub const STANDALONE_EVENT_ID: i64 = 0;

/// Parameters of a recording as chosen by the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub tag: SessionTag,
    pub duration_minutes: u32,
    pub is_paired: bool,
    pub protocol_name: String,
}

impl RecordingRequest {
    pub fn new(tag: SessionTag, duration_minutes: u32) -> Self {
        Self {
            tag,
            duration_minutes,
            is_paired: false,
            protocol_name: String::new(),
        }
    }
}

/// A completed, immutable recording.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub tag: SessionTag,
    pub subtag: String,
    /// `0` for standalone sessions, otherwise the id of the chained event.
    pub event_id: i64,
    pub duration_minutes: u32,
    /// RR intervals in milliseconds, in arrival order.
    pub rr_intervals: Vec<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl Session {
    pub fn is_standalone(&self) -> bool {
        self.event_id == STANDALONE_EVENT_ID
    }
}

/// A session that is still accumulating samples.
///
/// RR intervals can only be appended; the elapsed time advances one second per tick.
#[derive(Clone, Debug)]
pub struct ActiveSession {
    id: Uuid,
    user_id: String,
    tag: SessionTag,
    subtag: String,
    event_id: i64,
    duration_minutes: u32,
    rr_intervals: Vec<f64>,
    recorded_at: OffsetDateTime,
    elapsed_seconds: u64,
}

impl ActiveSession {
    pub fn new(
        user_id: &str,
        tag: SessionTag,
        subtag: String,
        event_id: i64,
        duration_minutes: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            tag,
            subtag,
            event_id,
            duration_minutes,
            rr_intervals: Vec::new(),
            recorded_at: OffsetDateTime::now_utc(),
            elapsed_seconds: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tag(&self) -> SessionTag {
        self.tag
    }

    pub fn subtag(&self) -> &str {
        &self.subtag
    }

    pub fn event_id(&self) -> i64 {
        self.event_id
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn rr_intervals(&self) -> &[f64] {
        &self.rr_intervals
    }

    pub fn recorded_at(&self) -> OffsetDateTime {
        self.recorded_at
    }

    pub fn append_rr(&mut self, rr_ms: &[f64]) {
        self.rr_intervals.extend_from_slice(rr_ms);
    }

    /// Advances the session clock by one second.
    pub fn tick(&mut self) {
        self.elapsed_seconds += 1;
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn target_seconds(&self) -> u64 {
        self.duration_minutes as u64 * 60
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.target_seconds().saturating_sub(self.elapsed_seconds)
    }

    /// Fraction of the configured duration already recorded, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let target = self.target_seconds();
        if target == 0 {
            return 1.0;
        }
        (self.elapsed_seconds as f64 / target as f64).clamp(0.0, 1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.elapsed_seconds >= self.target_seconds()
    }

    /// Turns the active session into an immutable [`Session`].
    ///
    /// A session stopped before its configured duration reports the minutes actually
    /// recorded, rounded up, never less than one.
    pub fn freeze(self) -> Session {
        let duration_minutes = if self.is_complete() {
            self.duration_minutes
        } else {
            (self.elapsed_seconds.div_ceil(60) as u32).max(1)
        };
        Session {
            id: self.id,
            user_id: self.user_id,
            tag: self.tag,
            subtag: self.subtag,
            event_id: self.event_id,
            duration_minutes,
            rr_intervals: self.rr_intervals,
            recorded_at: self.recorded_at,
        }
    }
}

/// Grouping of the chained sessions of one auto-recording sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepEvent {
    pub id: i64,
    /// Number of intervals completed so far.
    pub interval_count: u32,
}

impl SleepEvent {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            interval_count: 0,
        }
    }

    /// 1-based ordinal of the interval currently being recorded.
    pub fn current_interval(&self) -> u32 {
        self.interval_count + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(duration: u32) -> ActiveSession {
        ActiveSession::new(
            "user-1",
            SessionTag::Experiment,
            "experiment_single".into(),
            0,
            duration,
        )
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut s = active(1);
        assert_eq!(s.progress(), 0.0);
        for _ in 0..30 {
            s.tick();
        }
        assert!((s.progress() - 0.5).abs() < f64::EPSILON);
        for _ in 0..60 {
            s.tick();
        }
        assert_eq!(s.progress(), 1.0);
        assert_eq!(s.remaining_seconds(), 0);
        assert!(s.is_complete());
    }

    #[test]
    fn test_freeze_keeps_identity_and_samples() {
        let mut s = active(2);
        let id = s.id();
        s.append_rr(&[800.0, 810.5]);
        s.append_rr(&[790.0]);
        for _ in 0..120 {
            s.tick();
        }
        let frozen = s.freeze();
        assert_eq!(frozen.id, id);
        assert_eq!(frozen.rr_intervals, vec![800.0, 810.5, 790.0]);
        assert_eq!(frozen.duration_minutes, 2);
        assert!(frozen.is_standalone());
    }

    #[test]
    fn test_partial_session_reports_recorded_minutes() {
        let mut s = active(10);
        for _ in 0..241 {
            s.tick();
        }
        assert_eq!(s.freeze().duration_minutes, 5);

        let s = active(10);
        assert_eq!(s.freeze().duration_minutes, 1);
    }

    #[test]
    fn test_session_json_shape() {
        let session = active(5).freeze();
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["tag"], "experiment");
        assert_eq!(json["event_id"], 0);
        assert!(json["recorded_at"].as_str().unwrap().contains('T'));
        let back: Session = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_sleep_event_interval_ordinal() {
        let mut ev = SleepEvent::new(42);
        assert_eq!(ev.current_interval(), 1);
        ev.interval_count += 2;
        assert_eq!(ev.current_interval(), 3);
    }
}
