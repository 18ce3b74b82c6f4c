//! Core Controller
//!
//! This module defines the owner of all mutable core state. Commands, sensor callbacks, the
//! recording clock and upload completions arrive as [`CoreEvent`]s on one channel and are
//! handled strictly one after another. After every event a fresh [`CoreState`] snapshot is
//! published for presentation code.

use crate::{
    api::{
        controller::{IngestionApi, QueueApi, RecordingApi, SensorApi, SensorDriver},
        model::{QueueModelApi, RecordingModelApi, SensorModelApi},
    },
    components::{
        recording::{recording_state_label, RecordingController, RecordingState},
        sensor::SensorLink,
        upload_queue::{SharedQueue, UploadQueue},
    },
    core::{
        config::Config,
        events::{Command, CoreEvent, SensorEvent},
    },
    map_err,
    model::{
        queue::UploadResponse,
        session::RecordingRequest,
        state::{CoreState, DebugTrail, QueueStats, RecordingSnapshot, SensorSnapshot},
        tag::{SessionTag, TagCatalog},
    },
};

use anyhow::{anyhow, Result};
use log::{error, info, trace};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, Receiver, Sender},
        watch,
    },
    time::MissedTickBehavior,
};
use uuid::Uuid;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Cloneable access to a running [`CoreController`].
#[derive(Clone, Debug)]
pub struct CoreHandle {
    events: Sender<CoreEvent>,
    state: watch::Receiver<CoreState>,
}

impl CoreHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.events
            .send(command.into())
            .await
            .map_err(|_| anyhow!("core event loop has stopped"))
    }

    /// Stops the recording, releases the sensor and ends the event loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.events
            .send(CoreEvent::Shutdown)
            .await
            .map_err(|_| anyhow!("core event loop has stopped"))
    }

    /// Latest published snapshot.
    pub fn state(&self) -> CoreState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CoreState> {
        self.state.clone()
    }
}

/// Recording progress and queue size before an event, to describe what the event changed.
struct Marks {
    state: RecordingState,
    interval: Option<u32>,
    queued: usize,
}

/// Owner of the sensor link, recording controller and upload queue.
///
/// # Fields
/// - `selection`: Parameters the next recording starts with
/// - `upload_in_flight`: Item whose upload request is outstanding
/// - `trail`: Debug trail of state transitions
pub struct CoreController<D: SensorDriver> {
    catalog: TagCatalog,
    sensor: SensorLink<D>,
    recorder: RecordingController<SharedQueue>,
    queue: SharedQueue,
    ingestion: Arc<dyn IngestionApi>,
    events_tx: Sender<CoreEvent>,
    events_rx: Option<Receiver<CoreEvent>>,
    state_tx: watch::Sender<CoreState>,
    selection: RecordingRequest,
    trail: DebugTrail,
    upload_in_flight: Option<Uuid>,
    auto_upload: bool,
}

impl<D: SensorDriver> CoreController<D> {
    pub fn new(
        config: &Config,
        driver: D,
        queue: UploadQueue,
        ingestion: Arc<dyn IngestionApi>,
    ) -> Result<Self> {
        trace!("Initializing CoreController.");
        let catalog = config.catalog()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let last_event_id = queue.max_event_id();
        let queue = queue.shared();
        let mut recorder =
            RecordingController::new(catalog.clone(), config.user_id.clone(), queue.clone());
        recorder.seed_event_id(last_event_id);
        let tag = SessionTag::WakeCheck;
        let selection = RecordingRequest::new(tag, catalog.default_duration_minutes(tag));
        let (state_tx, _) = watch::channel(CoreState::new(selection.clone()));

        let controller = Self {
            catalog,
            sensor: SensorLink::new(driver, events_tx.clone(), config.connect_timeout()),
            recorder,
            queue,
            ingestion,
            events_tx,
            events_rx: Some(events_rx),
            state_tx,
            selection,
            trail: DebugTrail::new(config.debug_trail_len),
            upload_in_flight: None,
            auto_upload: config.auto_upload,
        };
        controller.publish();
        Ok(controller)
    }

    pub fn handle(&self) -> CoreHandle {
        CoreHandle {
            events: self.events_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Builds the current snapshot.
    pub fn snapshot(&self) -> CoreState {
        let (queue, stats) = match self.queue.lock() {
            Ok(q) => (q.items().to_vec(), QueueStats::capture(&*q)),
            Err(poisoned) => {
                let q = poisoned.into_inner();
                (q.items().to_vec(), QueueStats::capture(&*q))
            }
        };
        CoreState {
            selection: self.selection.clone(),
            sensor: SensorSnapshot::capture(&self.sensor),
            recording: RecordingSnapshot::capture(&self.recorder),
            can_start_recording: self.recorder.can_start_recording(&self.sensor),
            queue,
            stats,
            debug_trail: self.trail.entries().cloned().collect(),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.trail.push(message);
    }

    fn with_queue<T>(&self, f: impl FnOnce(&mut UploadQueue) -> Result<T>) -> Result<T> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("upload queue lock poisoned"))?;
        f(&mut queue)
    }

    fn marks(&self) -> Marks {
        Marks {
            state: self.recorder.recording_state(),
            interval: self.recorder.sleep_event().map(|e| e.current_interval()),
            queued: self.with_queue(|q| Ok(q.items().len())).unwrap_or_default(),
        }
    }

    /// Records recording transitions and newly queued sessions in the trail.
    fn after_transition(&mut self, before: Marks) {
        let now = self.marks();
        if now.state != before.state {
            self.note(format!(
                "recording {} -> {}",
                recording_state_label(before.state),
                recording_state_label(now.state)
            ));
        } else if now.interval != before.interval {
            if let Some(interval) = now.interval {
                self.note(format!("auto recording interval {} started", interval));
            }
        }
        if now.queued > before.queued {
            self.note(format!("{} session(s) queued", now.queued - before.queued));
            if self.auto_upload {
                self.kick_upload();
            }
        }
    }

    /// Starts delivery of the next pending item unless an upload is outstanding.
    fn kick_upload(&mut self) {
        if self.upload_in_flight.is_some() {
            return;
        }
        match self.with_queue(|q| q.begin_next()) {
            Ok(Some(session)) => {
                let id = session.id;
                self.upload_in_flight = Some(id);
                self.note(format!("uploading session {}", id));
                let api = self.ingestion.clone();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let outcome = map_err!(api.upload(&session).await);
                    if tx
                        .send(CoreEvent::UploadFinished { id, outcome })
                        .await
                        .is_err()
                    {
                        error!("upload of {} finished after the core stopped", id);
                    }
                });
            }
            Ok(None) => trace!("nothing to upload"),
            Err(e) => error!("could not start upload: {}", e),
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SelectTag(tag) => {
                self.selection.tag = tag;
                self.selection.duration_minutes = self.catalog.default_duration_minutes(tag);
                self.note(format!(
                    "selected {} for {} min",
                    tag, self.selection.duration_minutes
                ));
            }
            Command::SetDuration(minutes) => {
                self.selection.duration_minutes =
                    self.catalog.clamp_duration(self.selection.tag, minutes);
            }
            Command::SetPaired(paired) => self.selection.is_paired = paired,
            Command::SetProtocol(name) => self.selection.protocol_name = name,
            Command::ConnectSensor => {
                self.sensor.connect().await?;
                self.note(format!("sensor {}", self.sensor.connection_state()));
            }
            Command::DisconnectSensor => {
                self.sensor.disconnect().await?;
                self.note("sensor disconnected");
                self.recorder.on_sensor_state(&self.sensor);
            }
            Command::StartRecording => {
                self.recorder.start(self.selection.clone(), &self.sensor)?;
            }
            Command::StopRecording => self.recorder.stop()?,
            Command::ProcessQueue => {
                self.recorder.flush_undelivered();
                if self.with_queue(|q| q.sync())? {
                    self.note("upload queue saved");
                }
                self.kick_upload();
            }
            Command::RetryFailed => {
                let count = self.with_queue(|q| q.retry_failed())?;
                self.note(format!("{} failed upload(s) queued for retry", count));
                if count > 0 {
                    self.kick_upload();
                }
            }
            Command::ClearCompleted => {
                let count = self.with_queue(|q| q.clear_completed())?;
                self.note(format!("cleared {} completed item(s)", count));
            }
            Command::ClearAll => {
                let count = self.with_queue(|q| q.clear_all())?;
                self.note(format!("cleared {} item(s)", count));
            }
        }
        Ok(())
    }

    fn handle_sensor_event(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Sample(sample) => {
                trace!("sample {} bpm {:?}", sample.heart_rate, sample.rr_intervals_ms);
                self.recorder.record_sample(&sample);
            }
            SensorEvent::StateChanged(state) => {
                self.note(format!("sensor {}", state));
                self.recorder.on_sensor_state(&self.sensor);
            }
            SensorEvent::Failed(reason) => {
                self.note(format!("sensor failed: {}", reason));
                self.recorder.on_sensor_state(&self.sensor);
            }
            SensorEvent::Telemetry(info) => trace!("telemetry {:?}", info),
        }
    }

    fn handle_upload_finished(
        &mut self,
        id: Uuid,
        outcome: std::result::Result<UploadResponse, String>,
    ) -> Result<()> {
        if self.upload_in_flight == Some(id) {
            self.upload_in_flight = None;
        }
        let message = match &outcome {
            Ok(response) if response.validation.is_valid => format!("session {} delivered", id),
            Ok(response) => format!(
                "session {} delivered with {} validation error(s)",
                id,
                response.validation.errors.len()
            ),
            Err(e) => format!("upload of session {} failed: {}", id, e),
        };
        let result = self.with_queue(|q| q.finish(id, outcome));
        self.note(message);
        if self.auto_upload {
            self.kick_upload();
        }
        result
    }

    /// Dispatches one core event.
    async fn dispatch_event(&mut self, event: CoreEvent) -> Result<()> {
        let before = self.marks();
        let result = match event {
            CoreEvent::Command(command) => self.handle_command(command).await,
            CoreEvent::Sensor(message) => {
                if let Some(event) = self.sensor.accept(message) {
                    self.handle_sensor_event(event);
                }
                Ok(())
            }
            CoreEvent::Tick => {
                self.recorder.tick();
                Ok(())
            }
            CoreEvent::UploadFinished { id, outcome } => self.handle_upload_finished(id, outcome),
            CoreEvent::Shutdown => {
                if self.recorder.is_recording() {
                    self.recorder.stop()?;
                }
                self.sensor.disconnect().await
            }
        };
        self.after_transition(before);
        result
    }

    /// Runs the event loop until [`CoreHandle::shutdown`] is called.
    pub async fn run(mut self) -> Result<()> {
        let mut events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| anyhow!("event loop already running"))?;
        let mut clock = tokio::time::interval(Duration::from_secs(1));
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
        clock.tick().await;
        if self.auto_upload {
            self.kick_upload();
        }
        self.publish();

        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = clock.tick() => CoreEvent::Tick,
            };
            let idle = !self.recorder.is_recording();
            let is_tick = matches!(event, CoreEvent::Tick);
            let is_shutdown = matches!(event, CoreEvent::Shutdown);
            if is_tick && idle {
                continue;
            }
            if let Err(e) = self.dispatch_event(event).await {
                error!("error during event handling: {}", e);
                self.trail.push(format!("error: {}", e));
            }
            // a new recording gets full seconds from its start
            if idle && self.recorder.is_recording() {
                clock.reset();
            }
            self.publish();
            if is_shutdown {
                break;
            }
        }
        info!("core event loop stopped");
        Ok(())
    }
}
