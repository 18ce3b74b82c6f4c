//! Controller Module
//!
//! This module defines the traits for mutating the core components: sensor connection,
//! recording, the upload queue and the external collaborators behind them (sensor hardware,
//! ingestion service, durable storage).
use crate::{
    core::events::CoreEvent,
    model::{
        queue::{QueueItem, UploadResponse},
        sensor::HeartrateSample,
        session::{RecordingRequest, Session},
    },
};
use anyhow::Result;
use async_trait::async_trait;
use btleplug::api::Central;
use log::warn;
use std::time::Duration;
use tokio::{
    sync::{mpsc::Sender, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

use super::model::{QueueModelApi, RecordingModelApi, SensorModelApi};

/// SensorApi trait
///
/// Lifecycle commands for the single tracked sensor.
#[async_trait]
pub trait SensorApi: SensorModelApi {
    /// Starts a connection attempt. No-op while scanning, connecting or connected.
    async fn connect(&mut self) -> Result<()>;

    /// Tears down the connection from any state and forgets the device metadata.
    async fn disconnect(&mut self) -> Result<()>;
}

/// RecordingApi trait
///
/// Commands of the recording state machine. Completed sessions are handed to the
/// [`SessionSink`] the controller was built with.
pub trait RecordingApi: RecordingModelApi {
    /// Starts a session. Only legal while idle and with a connected sensor.
    fn start(&mut self, request: RecordingRequest, sensor: &dyn SensorModelApi) -> Result<()>;

    /// Freezes the current (possibly partial) session, hands it to the sink and returns to idle.
    ///
    /// A session stopped before its first second elapsed and without any RR sample carries no
    /// data; it is discarded instead of being queued.
    fn stop(&mut self) -> Result<()>;

    /// Advances the recording clock by one second.
    fn tick(&mut self);

    /// Appends the RR intervals of a live sample to the current session.
    fn record_sample(&mut self, sample: &HeartrateSample);

    /// Reacts to sensor state changes; leaving `Connected` stops an active recording.
    fn on_sensor_state(&mut self, sensor: &dyn SensorModelApi);
}

/// QueueApi trait
///
/// Commands of the durable upload queue. Every mutation is persisted before it returns.
#[async_trait]
pub trait QueueApi: QueueModelApi {
    /// Appends a pending item. Returns `false` if the session id is already queued.
    fn enqueue(&mut self, session: Session) -> Result<bool>;

    /// Marks the oldest pending item as uploading and returns its session, unless an upload is
    /// already in flight.
    fn begin_next(&mut self) -> Result<Option<Session>>;

    /// Records the outcome of the upload started by [`QueueApi::begin_next`].
    fn finish(&mut self, id: Uuid, outcome: std::result::Result<UploadResponse, String>)
        -> Result<()>;

    /// Runs one complete delivery round trip against `api`.
    async fn process_next(&mut self, api: &dyn IngestionApi) -> Result<Option<QueueItem>>;

    /// Moves every failed item back to pending. Returns the number of items affected.
    fn retry_failed(&mut self) -> Result<usize>;

    /// Removes completed items. Returns the number of items removed.
    fn clear_completed(&mut self) -> Result<usize>;

    /// Removes every item regardless of status. Returns the number of items removed.
    fn clear_all(&mut self) -> Result<usize>;
}

/// Destination of frozen sessions.
///
/// On `Err` the caller keeps the session and submits it again later, so sinks must accept the
/// same session twice without duplicating it.
#[cfg_attr(test, mockall::automock)]
pub trait SessionSink: Send {
    fn submit(&mut self, session: Session) -> Result<()>;
}

/// Remote ingestion endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngestionApi: Send + Sync {
    async fn upload(&self, session: &Session) -> Result<UploadResponse>;
}

/// Durable storage of the queue contents.
#[cfg_attr(test, mockall::automock)]
pub trait QueueStore: Send {
    fn load(&self) -> Result<Vec<QueueItem>>;
    fn save(&self, items: &[QueueItem]) -> Result<()>;
}

/// Hardware seam of the sensor link.
///
/// A driver runs one connection attempt as a background task and reports everything it
/// observes as `CoreEvent::Sensor` messages tagged with `attempt`.
#[cfg_attr(test, mockall::automock)]
pub trait SensorDriver: Send + Sync {
    fn open(&self, attempt: u64, timeout: Duration, events: Sender<CoreEvent>)
        -> ConnectionHandle;
}

/// AdapterDiscovery trait
///
/// Lists the Bluetooth adapters available on this host.
#[async_trait]
pub trait AdapterDiscovery<A: Central> {
    async fn discover_adapters() -> Result<Vec<A>>;
}

/// Handle on a running connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn new(shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Asks the task to release the device and waits up to `grace` before aborting it.
    pub async fn close(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("sensor task did not stop within {:?}, aborting", grace);
            self.task.abort();
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
