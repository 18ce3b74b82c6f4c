//! This module defines the read only API for interacting with the core components.
//! Presentation code and sibling components only ever see these views; all mutation goes
//! through the traits in [`super::controller`].
use std::fmt::Debug;

use uuid::Uuid;

use crate::{
    components::recording::RecordingState,
    model::{
        queue::{QueueItem, UploadStatus},
        sensor::{SensorConnectionState, SensorInfo},
        session::{ActiveSession, SleepEvent},
    },
};

/// `SensorModelApi` trait.
///
/// Read access to the connection lifecycle and telemetry of the tracked sensor.
pub trait SensorModelApi: Debug + Send + Sync {
    /// Current connection state.
    fn connection_state(&self) -> SensorConnectionState;

    /// Device metadata, present while connected.
    fn sensor_info(&self) -> Option<&SensorInfo>;

    /// Message of the last failed connection attempt, if any.
    fn last_error(&self) -> Option<&str>;

    /// Heart rate of the most recent accepted sample.
    fn last_heart_rate(&self) -> Option<u16>;

    fn is_connected(&self) -> bool {
        self.connection_state() == SensorConnectionState::Connected
    }
}

/// `RecordingModelApi` trait.
///
/// Read access to the recording state machine and the session being recorded.
pub trait RecordingModelApi: Debug + Send {
    fn recording_state(&self) -> RecordingState;

    fn is_recording(&self) -> bool {
        self.recording_state() != RecordingState::Idle
    }

    /// The session currently accumulating samples.
    fn active_session(&self) -> Option<&ActiveSession>;

    /// Grouping of the running auto-recording sequence.
    fn sleep_event(&self) -> Option<SleepEvent>;

    /// Elapsed fraction of the current interval, clamped to `[0, 1]`.
    fn recording_progress(&self) -> f64 {
        self.active_session()
            .map(|s| s.progress())
            .unwrap_or_default()
    }

    /// True iff the sensor is connected and nothing is being recorded.
    fn can_start_recording(&self, sensor: &dyn SensorModelApi) -> bool {
        sensor.is_connected() && !self.is_recording()
    }
}

/// `QueueModelApi` trait.
///
/// Read access to the upload queue in enqueue order.
pub trait QueueModelApi: Debug + Send {
    fn items(&self) -> &[QueueItem];

    fn get(&self, id: &Uuid) -> Option<&QueueItem> {
        self.items().iter().find(|i| &i.id() == id)
    }

    fn count(&self, status: UploadStatus) -> usize {
        self.items().iter().filter(|i| i.status() == status).count()
    }

    fn is_uploading(&self) -> bool {
        self.count(UploadStatus::Uploading) > 0
    }

    /// Largest event id of any queued session, `0` if none is chained.
    fn max_event_id(&self) -> i64 {
        self.items()
            .iter()
            .map(|i| i.session().event_id)
            .max()
            .unwrap_or_default()
    }
}
