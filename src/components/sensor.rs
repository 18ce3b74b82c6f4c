//! Sensor Link
//!
//! Owns the connection lifecycle of exactly one wearable sensor. The hardware work runs in a
//! task spawned by a [`SensorDriver`]; the link itself only tracks state and filters the events
//! that task reports back through the core event loop.
use crate::api::controller::{ConnectionHandle, SensorApi, SensorDriver};
use crate::api::model::SensorModelApi;
use crate::core::constants::SENSOR_SHUTDOWN_GRACE_MS;
use crate::core::events::{CoreEvent, SensorEvent, SensorMessage};
use crate::model::sensor::{SensorConnectionState, SensorInfo};
use anyhow::Result;
use async_trait::async_trait;
use log::{info, trace, warn};
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

/// Tracks the single sensor connection.
///
/// # Fields
/// - `driver`: Hardware seam that runs connection attempts
/// - `event_bus`: Channel the driver reports into
/// - `attempt`: Generation of the current connection attempt; events of older attempts are dropped
/// - `connection`: Handle of the running connection task
pub struct SensorLink<D: SensorDriver> {
    driver: D,
    event_bus: Sender<CoreEvent>,
    connect_timeout: Duration,
    attempt: u64,
    connection: Option<ConnectionHandle>,
    state: SensorConnectionState,
    info: Option<SensorInfo>,
    last_error: Option<String>,
    last_heart_rate: Option<u16>,
}

impl<D: SensorDriver> Debug for SensorLink<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorLink")
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .field("info", &self.info)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl<D: SensorDriver> SensorLink<D> {
    pub fn new(driver: D, event_bus: Sender<CoreEvent>, connect_timeout: Duration) -> Self {
        Self {
            driver,
            event_bus,
            connect_timeout,
            attempt: 0,
            connection: None,
            state: SensorConnectionState::Disconnected,
            info: None,
            last_error: None,
            last_heart_rate: None,
        }
    }

    /// Generation of the current connection attempt.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Applies an event reported by a driver task.
    ///
    /// Returns the event if it was accepted, `None` if it belongs to a superseded attempt or is
    /// not valid in the current state (e.g. samples while not connected).
    pub fn accept(&mut self, message: SensorMessage) -> Option<SensorEvent> {
        if message.attempt != self.attempt {
            trace!(
                "dropping sensor event of stale attempt {} (current {})",
                message.attempt,
                self.attempt
            );
            return None;
        }
        match &message.event {
            SensorEvent::StateChanged(state) => {
                if *state == self.state {
                    return None;
                }
                info!("sensor {} -> {}", self.state, state);
                self.state = *state;
                if *state != SensorConnectionState::Connected {
                    self.info = None;
                }
                if !state.is_busy() {
                    self.connection = None;
                }
            }
            SensorEvent::Failed(reason) => {
                warn!("sensor connection failed: {}", reason);
                self.state = SensorConnectionState::Failed;
                self.last_error = Some(reason.clone());
                self.info = None;
                self.connection = None;
            }
            SensorEvent::Telemetry(info) => {
                if self.state != SensorConnectionState::Connected {
                    return None;
                }
                self.info = Some(info.clone());
            }
            SensorEvent::Sample(sample) => {
                if self.state != SensorConnectionState::Connected {
                    return None;
                }
                self.last_heart_rate = Some(sample.heart_rate);
            }
        }
        Some(message.event)
    }
}

#[async_trait]
impl<D: SensorDriver> SensorApi for SensorLink<D> {
    async fn connect(&mut self) -> Result<()> {
        if self.state.is_busy() {
            trace!("connect requested while {}, ignoring", self.state);
            return Ok(());
        }
        self.attempt += 1;
        self.state = SensorConnectionState::Scanning;
        self.last_error = None;
        self.info = None;
        info!("sensor connection attempt {} started", self.attempt);
        self.connection = Some(self.driver.open(
            self.attempt,
            self.connect_timeout,
            self.event_bus.clone(),
        ));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // invalidates everything the old task still reports
        self.attempt += 1;
        self.state = SensorConnectionState::Disconnected;
        self.info = None;
        self.last_heart_rate = None;
        if let Some(connection) = self.connection.take() {
            connection
                .close(Duration::from_millis(SENSOR_SHUTDOWN_GRACE_MS))
                .await;
        }
        info!("sensor disconnected");
        Ok(())
    }
}

impl<D: SensorDriver> SensorModelApi for SensorLink<D> {
    fn connection_state(&self) -> SensorConnectionState {
        self.state
    }

    fn sensor_info(&self) -> Option<&SensorInfo> {
        self.info.as_ref()
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn last_heart_rate(&self) -> Option<u16> {
        self.last_heart_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::controller::MockSensorDriver;
    use crate::model::sensor::HeartrateSample;
    use tokio::sync::{mpsc, oneshot};

    fn idle_handle() -> ConnectionHandle {
        let (tx, rx) = oneshot::channel();
        ConnectionHandle::new(
            tx,
            tokio::spawn(async move {
                let _ = rx.await;
            }),
        )
    }

    fn link(expected_opens: usize) -> SensorLink<MockSensorDriver> {
        let (tx, _rx) = mpsc::channel(16);
        let mut driver = MockSensorDriver::new();
        driver
            .expect_open()
            .times(expected_opens)
            .returning(|_, _, _| idle_handle());
        SensorLink::new(driver, tx, Duration::from_secs(5))
    }

    fn msg(attempt: u64, event: SensorEvent) -> SensorMessage {
        SensorMessage { attempt, event }
    }

    fn connected(link: &mut SensorLink<MockSensorDriver>) {
        let attempt = link.attempt();
        link.accept(msg(
            attempt,
            SensorEvent::StateChanged(SensorConnectionState::Connecting),
        ));
        link.accept(msg(
            attempt,
            SensorEvent::StateChanged(SensorConnectionState::Connected),
        ));
        link.accept(msg(attempt, telemetry()));
    }

    fn telemetry() -> SensorEvent {
        SensorEvent::Telemetry(SensorInfo {
            name: "Polar H10".into(),
            battery_percent: Some(90),
            signal_strength: Some(-58),
        })
    }

    #[tokio::test]
    async fn test_new_link_is_disconnected() {
        let link = link(0);
        assert_eq!(link.connection_state(), SensorConnectionState::Disconnected);
        assert!(link.sensor_info().is_none());
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_connect_moves_to_scanning_and_is_idempotent() {
        let mut link = link(1);
        assert!(link.connect().await.is_ok());
        assert_eq!(link.connection_state(), SensorConnectionState::Scanning);
        assert!(link.connect().await.is_ok());
        connected(&mut link);
        assert!(link.connect().await.is_ok());
        assert_eq!(link.attempt(), 1);
        assert!(link.is_connected());
        assert_eq!(link.sensor_info().unwrap().battery_percent, Some(90));
    }

    #[tokio::test]
    async fn test_failed_attempt_requires_explicit_reconnect() {
        let mut link = link(2);
        link.connect().await.unwrap();
        let event = link.accept(msg(1, SensorEvent::Failed("timeout".into())));
        assert!(event.is_some());
        assert_eq!(link.connection_state(), SensorConnectionState::Failed);
        assert_eq!(link.last_error(), Some("timeout"));

        link.connect().await.unwrap();
        assert_eq!(link.attempt(), 2);
        assert_eq!(link.connection_state(), SensorConnectionState::Scanning);
        assert!(link.last_error().is_none());
    }

    #[tokio::test]
    async fn test_samples_only_accepted_while_connected() {
        let mut link = link(1);
        let sample = SensorEvent::Sample(HeartrateSample {
            heart_rate: 61,
            rr_intervals_ms: vec![980.0],
        });
        link.connect().await.unwrap();
        assert!(link.accept(msg(1, sample.clone())).is_none());
        connected(&mut link);
        assert_eq!(link.accept(msg(1, sample.clone())), Some(sample));
        assert_eq!(link.last_heart_rate(), Some(61));
    }

    #[tokio::test]
    async fn test_telemetry_only_accepted_while_connected() {
        let mut link = link(1);
        link.connect().await.unwrap();
        assert!(link.accept(msg(1, telemetry())).is_none());
        link.accept(msg(
            1,
            SensorEvent::StateChanged(SensorConnectionState::Connecting),
        ));
        assert!(link.accept(msg(1, telemetry())).is_none());
        assert!(link.sensor_info().is_none());

        link.accept(msg(
            1,
            SensorEvent::StateChanged(SensorConnectionState::Connected),
        ));
        assert!(link.accept(msg(1, telemetry())).is_some());
        assert_eq!(link.sensor_info().unwrap().name, "Polar H10");
    }

    #[tokio::test]
    async fn test_disconnect_discards_late_events() {
        let mut link = link(1);
        link.connect().await.unwrap();
        connected(&mut link);
        assert!(link.disconnect().await.is_ok());
        assert_eq!(link.connection_state(), SensorConnectionState::Disconnected);
        assert!(link.sensor_info().is_none());

        let late = SensorEvent::Sample(HeartrateSample {
            heart_rate: 70,
            rr_intervals_ms: vec![850.0],
        });
        assert!(link.accept(msg(1, late)).is_none());
        assert!(link
            .accept(msg(
                1,
                SensorEvent::StateChanged(SensorConnectionState::Connected)
            ))
            .is_none());
        assert_eq!(link.connection_state(), SensorConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_from_any_state() {
        let mut link = link(0);
        assert!(link.disconnect().await.is_ok());
        assert_eq!(link.connection_state(), SensorConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stream_end_clears_info() {
        let mut link = link(1);
        link.connect().await.unwrap();
        connected(&mut link);
        let event = link.accept(msg(
            1,
            SensorEvent::StateChanged(SensorConnectionState::Disconnected),
        ));
        assert!(event.is_some());
        assert!(link.sensor_info().is_none());
        assert!(!link.is_connected());
    }
}
