//! Core State
//!
//! Read-only snapshot of everything the core knows, published after every handled event.
//! Presentation code only ever sees these values; the owner of the live components is the
//! core controller.

use std::collections::VecDeque;
use std::fmt;

use time::{format_description, OffsetDateTime};

use super::{
    queue::{QueueItem, UploadStatus},
    sensor::{SensorConnectionState, SensorInfo},
    session::{RecordingRequest, STANDALONE_EVENT_ID},
    tag::SessionTag,
};
use crate::{
    api::model::{QueueModelApi, RecordingModelApi, SensorModelApi},
    components::recording::RecordingState,
    core::constants::TIME_STRING_FORMAT,
};

/// One line of the debug trail.
#[derive(Clone, Debug, PartialEq)]
pub struct TrailEntry {
    pub at: OffsetDateTime,
    pub message: String,
}

impl fmt::Display for TrailEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = format_description::parse(TIME_STRING_FORMAT).map_err(|_| fmt::Error)?;
        let time = self.at.format(&format).map_err(|_| fmt::Error)?;
        write!(f, "[{}] {}", time, self.message)
    }
}

/// Bounded log of state transitions, oldest entries are dropped first.
#[derive(Clone, Debug)]
pub struct DebugTrail {
    entries: VecDeque<TrailEntry>,
    capacity: usize,
}

impl DebugTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TrailEntry {
            at: OffsetDateTime::now_utc(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrailEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SensorSnapshot {
    pub state: SensorConnectionState,
    pub info: Option<SensorInfo>,
    pub last_error: Option<String>,
    pub last_heart_rate: Option<u16>,
}

impl SensorSnapshot {
    pub fn capture(sensor: &dyn SensorModelApi) -> Self {
        Self {
            state: sensor.connection_state(),
            info: sensor.sensor_info().cloned(),
            last_error: sensor.last_error().map(str::to_owned),
            last_heart_rate: sensor.last_heart_rate(),
        }
    }
}

/// Live progress of the running recording.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    pub tag: Option<SessionTag>,
    pub subtag: Option<String>,
    pub event_id: i64,
    /// 1-based interval of an auto recording.
    pub interval: Option<u32>,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub progress: f64,
    pub rr_count: usize,
}

impl Default for RecordingSnapshot {
    fn default() -> Self {
        Self {
            state: RecordingState::Idle,
            tag: None,
            subtag: None,
            event_id: STANDALONE_EVENT_ID,
            interval: None,
            elapsed_seconds: 0,
            remaining_seconds: 0,
            progress: 0.0,
            rr_count: 0,
        }
    }
}

impl RecordingSnapshot {
    pub fn capture(recorder: &dyn RecordingModelApi) -> Self {
        let mut snapshot = Self {
            state: recorder.recording_state(),
            interval: recorder.sleep_event().map(|e| e.current_interval()),
            progress: recorder.recording_progress(),
            ..Default::default()
        };
        if let Some(active) = recorder.active_session() {
            snapshot.tag = Some(active.tag());
            snapshot.subtag = Some(active.subtag().to_owned());
            snapshot.event_id = active.event_id();
            snapshot.elapsed_seconds = active.elapsed_seconds();
            snapshot.remaining_seconds = active.remaining_seconds();
            snapshot.rr_count = active.rr_intervals().len();
        }
        snapshot
    }
}

/// Number of queue items per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn capture(queue: &dyn QueueModelApi) -> Self {
        Self {
            pending: queue.count(UploadStatus::Pending),
            uploading: queue.count(UploadStatus::Uploading),
            completed: queue.count(UploadStatus::Completed),
            failed: queue.count(UploadStatus::Failed),
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.uploading + self.completed + self.failed
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pending, {} uploading, {} completed, {} failed",
            self.pending, self.uploading, self.completed, self.failed
        )
    }
}

/// Snapshot published by the core controller.
#[derive(Clone, Debug, PartialEq)]
pub struct CoreState {
    /// Parameters the next recording will start with.
    pub selection: RecordingRequest,
    pub sensor: SensorSnapshot,
    pub recording: RecordingSnapshot,
    pub can_start_recording: bool,
    pub queue: Vec<QueueItem>,
    pub stats: QueueStats,
    pub debug_trail: Vec<TrailEntry>,
}

impl CoreState {
    pub fn new(selection: RecordingRequest) -> Self {
        Self {
            selection,
            sensor: SensorSnapshot::default(),
            recording: RecordingSnapshot::default(),
            can_start_recording: false,
            queue: Vec::new(),
            stats: QueueStats::default(),
            debug_trail: Vec::new(),
        }
    }
}
