//! Recording Controller
//!
//! Drives tagged recordings. A recording is either manual (one session of the configured
//! duration) or auto (consecutive intervals of equal length sharing one event id until stopped).
//! Every finished interval is frozen and handed to the session sink.
use crate::{
    api::{
        controller::{RecordingApi, SessionSink},
        model::{RecordingModelApi, SensorModelApi},
    },
    model::{
        sensor::HeartrateSample,
        session::{ActiveSession, RecordingRequest, Session, SleepEvent, STANDALONE_EVENT_ID},
        tag::TagCatalog,
    },
};
use anyhow::{anyhow, Result};
use log::{error, info, trace, warn};
use rust_fsm::*;
use std::fmt::Debug;
use time::OffsetDateTime;

state_machine! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub recording_machine(Idle)

    Idle => {
        StartManual => RecordingManual,
        StartAuto => RecordingAuto
    },
    RecordingManual => {
        IntervalCompleted => Idle,
        Stop => Idle
    },
    RecordingAuto => {
        IntervalCompleted => RecordingAuto,
        Stop => Idle
    }
}

/// State of the recording controller.
pub type RecordingState = recording_machine::State;
type RecordingInput = recording_machine::Input;

pub fn recording_state_label(state: RecordingState) -> &'static str {
    match state {
        RecordingState::Idle => "idle",
        RecordingState::RecordingManual => "recording_manual",
        RecordingState::RecordingAuto => "recording_auto",
    }
}

/// Records sessions and delivers them to `S`.
///
/// # Fields
/// - `machine`: Recording state machine
/// - `request`: Parameters of the running recording
/// - `active`: Session accumulating samples
/// - `sleep_event`: Chain of the running auto recording
/// - `last_event_id`: Highest event id handed out so far
/// - `undelivered`: Finished sessions the sink has not accepted yet
pub struct RecordingController<S: SessionSink> {
    catalog: TagCatalog,
    sink: S,
    user_id: String,
    machine: recording_machine::StateMachine,
    request: Option<RecordingRequest>,
    active: Option<ActiveSession>,
    sleep_event: Option<SleepEvent>,
    last_event_id: i64,
    undelivered: Vec<Session>,
}

impl<S: SessionSink> Debug for RecordingController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingController")
            .field("state", self.machine.state())
            .field("request", &self.request)
            .field("active", &self.active)
            .field("sleep_event", &self.sleep_event)
            .field("last_event_id", &self.last_event_id)
            .field("undelivered", &self.undelivered.len())
            .finish()
    }
}

impl<S: SessionSink> RecordingController<S> {
    pub fn new(catalog: TagCatalog, user_id: impl Into<String>, sink: S) -> Self {
        Self {
            catalog,
            sink,
            user_id: user_id.into(),
            machine: recording_machine::StateMachine::new(),
            request: None,
            active: None,
            sleep_event: None,
            last_event_id: STANDALONE_EVENT_ID,
            undelivered: Vec::new(),
        }
    }

    /// Event ids handed out later are strictly greater than `event_id`.
    pub fn seed_event_id(&mut self, event_id: i64) {
        self.last_event_id = self.last_event_id.max(event_id);
    }

    pub fn catalog(&self) -> &TagCatalog {
        &self.catalog
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Finished sessions waiting to be handed to the sink again.
    pub fn undelivered(&self) -> &[Session] {
        &self.undelivered
    }

    /// Parameters of the running recording.
    pub fn request(&self) -> Option<&RecordingRequest> {
        self.request.as_ref()
    }

    fn consume(&mut self, input: RecordingInput) -> Result<()> {
        let from = *self.machine.state();
        self.machine
            .consume(&input)
            .map_err(|_| anyhow!("cannot apply {:?} while {:?}", input, from))?;
        trace!("recording {:?} -> {:?}", from, self.machine.state());
        Ok(())
    }

    /// Seconds since the epoch, bumped past every id handed out before.
    fn allocate_event_id(&mut self) -> i64 {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.last_event_id = now.max(self.last_event_id + 1);
        self.last_event_id
    }

    fn open_session(&mut self, request: &RecordingRequest) {
        let interval = self.sleep_event.map(|e| e.current_interval());
        let event_id = self
            .sleep_event
            .map(|e| e.id)
            .unwrap_or(STANDALONE_EVENT_ID);
        let subtag =
            request
                .tag
                .generate_subtag(request.is_paired, interval, &request.protocol_name);
        info!(
            "recording {} ({}) for {} min",
            request.tag, subtag, request.duration_minutes
        );
        self.active = Some(ActiveSession::new(
            &self.user_id,
            request.tag,
            subtag,
            event_id,
            request.duration_minutes,
        ));
    }

    fn submit(&mut self, session: Session) {
        info!(
            "session {} ({}) finished with {} RR intervals",
            session.id,
            session.subtag,
            session.rr_intervals.len()
        );
        self.undelivered.push(session);
        self.flush_undelivered();
    }

    /// Hands held sessions to the sink, oldest first. Sessions stay held until accepted.
    pub fn flush_undelivered(&mut self) {
        for session in std::mem::take(&mut self.undelivered) {
            let id = session.id;
            if let Err(e) = self.sink.submit(session.clone()) {
                error!("failed to hand over session {}: {}", id, e);
                self.undelivered.push(session);
            }
        }
    }

    fn complete_interval(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.submit(active.freeze());
        if let Some(event) = self.sleep_event.as_mut() {
            event.interval_count += 1;
        }
        if let Err(e) = self.consume(RecordingInput::IntervalCompleted) {
            error!("{}", e);
            return;
        }
        match (*self.machine.state(), self.request.clone()) {
            (RecordingState::RecordingAuto, Some(request)) => self.open_session(&request),
            _ => self.reset(),
        }
    }

    fn reset(&mut self) {
        self.request = None;
        self.active = None;
        self.sleep_event = None;
    }
}

impl<S: SessionSink> RecordingApi for RecordingController<S> {
    fn start(&mut self, request: RecordingRequest, sensor: &dyn SensorModelApi) -> Result<()> {
        if self.is_recording() {
            return Err(anyhow!("a recording is already in progress"));
        }
        if !sensor.is_connected() {
            return Err(anyhow!(
                "sensor is {}, connect it first",
                sensor.connection_state()
            ));
        }
        self.catalog
            .check_duration(request.tag, request.duration_minutes)?;

        if request.tag.is_auto_recording_mode() {
            self.consume(RecordingInput::StartAuto)?;
            let event = SleepEvent::new(self.allocate_event_id());
            info!("auto recording event {} started", event.id);
            self.sleep_event = Some(event);
        } else {
            self.consume(RecordingInput::StartManual)?;
            self.sleep_event = None;
        }
        self.open_session(&request);
        self.request = Some(request);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.is_recording() {
            return Err(anyhow!("no recording in progress"));
        }
        if let Some(active) = self.active.take() {
            if active.elapsed_seconds() == 0 && active.rr_intervals().is_empty() {
                info!("discarding empty session {}", active.id());
            } else {
                self.submit(active.freeze());
            }
        }
        self.consume(RecordingInput::Stop)?;
        self.reset();
        Ok(())
    }

    fn tick(&mut self) {
        if !self.undelivered.is_empty() {
            self.flush_undelivered();
        }
        let complete = match self.active.as_mut() {
            Some(active) => {
                active.tick();
                active.is_complete()
            }
            None => false,
        };
        if complete {
            self.complete_interval();
        }
    }

    fn record_sample(&mut self, sample: &HeartrateSample) {
        if let Some(active) = self.active.as_mut() {
            active.append_rr(&sample.rr_intervals_ms);
        }
    }

    fn on_sensor_state(&mut self, sensor: &dyn SensorModelApi) {
        if self.is_recording() && !sensor.is_connected() {
            warn!(
                "sensor went {} during recording, stopping",
                sensor.connection_state()
            );
            if let Err(e) = self.stop() {
                error!("{}", e);
            }
        }
    }
}

impl<S: SessionSink> RecordingModelApi for RecordingController<S> {
    fn recording_state(&self) -> RecordingState {
        *self.machine.state()
    }

    fn active_session(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    fn sleep_event(&self) -> Option<SleepEvent> {
        self.sleep_event
    }
}
