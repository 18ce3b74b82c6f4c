//! Core Events
//!
//! This module defines the events processed by the core event loop. Commands from the
//! presentation layer, sensor callbacks, the recording clock and upload completions all arrive
//! as [`CoreEvent`]s and are handled one at a time by a single owner.
use uuid::Uuid;

use crate::model::{
    queue::UploadResponse,
    sensor::{HeartrateSample, SensorConnectionState, SensorInfo},
    tag::SessionTag,
};

/// Everything a sensor driver can observe.
#[derive(Clone, Debug, PartialEq)]
pub enum SensorEvent {
    /// The connection moved to a new state.
    StateChanged(SensorConnectionState),
    /// The attempt failed or timed out.
    Failed(String),
    /// Fresh device metadata.
    Telemetry(SensorInfo),
    /// A live heart rate measurement.
    Sample(HeartrateSample),
}

/// A sensor event tagged with the connection attempt that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorMessage {
    pub attempt: u64,
    pub event: SensorEvent,
}

/// User-driven commands.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Select a tag; the duration resets to the tag default.
    SelectTag(SessionTag),
    /// Set the duration, clamped to the bounds of the selected tag.
    SetDuration(u32),
    SetPaired(bool),
    SetProtocol(String),
    ConnectSensor,
    DisconnectSensor,
    StartRecording,
    StopRecording,
    /// Attempt delivery of the next pending item.
    ProcessQueue,
    RetryFailed,
    ClearCompleted,
    ClearAll,
}

/// Enumeration of all events handled by the core.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    Command(Command),
    Sensor(SensorMessage),
    /// One second of recording time elapsed.
    Tick,
    /// An upload request returned.
    UploadFinished {
        id: Uuid,
        outcome: Result<UploadResponse, String>,
    },
    /// Stop recording, release the sensor and leave the event loop.
    Shutdown,
}

impl From<Command> for CoreEvent {
    fn from(value: Command) -> Self {
        CoreEvent::Command(value)
    }
}
