//! Simulated sensor
//!
//! Stand-in for a chest strap when no Bluetooth hardware is around. Produces one heart rate
//! sample per second with jittered RR intervals and a slowly draining battery.
use crate::api::controller::{ConnectionHandle, SensorDriver};
use crate::core::events::{CoreEvent, SensorEvent, SensorMessage};
use crate::model::sensor::{HeartrateSample, SensorConnectionState, SensorInfo};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::{mpsc::Sender, oneshot};

const BASE_RR_MS: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    sample_period: Duration,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_secs(1),
        }
    }
}

impl SimulatedDriver {
    pub fn with_sample_period(sample_period: Duration) -> Self {
        Self { sample_period }
    }
}

impl SensorDriver for SimulatedDriver {
    fn open(&self, attempt: u64, _timeout: Duration, events: Sender<CoreEvent>) -> ConnectionHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = self.sample_period;
        let task = tokio::spawn(async move {
            let send = |event| {
                events.send(CoreEvent::Sensor(SensorMessage { attempt, event }))
            };
            let mut rng = StdRng::from_entropy();
            let mut battery: f64 = 100.0;
            let info = |battery: f64| SensorInfo {
                name: "Simulated HRM".to_string(),
                battery_percent: Some(battery as u8),
                signal_strength: Some(-50),
            };

            let _ = send(SensorEvent::StateChanged(SensorConnectionState::Connecting)).await;
            let _ = send(SensorEvent::StateChanged(SensorConnectionState::Connected)).await;
            let _ = send(SensorEvent::Telemetry(info(battery))).await;

            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let rr = BASE_RR_MS + rng.gen_range(-40.0..40.0);
                        let sample = HeartrateSample {
                            heart_rate: (60_000.0 / rr).round() as u16,
                            rr_intervals_ms: vec![rr],
                        };
                        if send(SensorEvent::Sample(sample)).await.is_err() {
                            break;
                        }
                        battery = (battery - 0.01).max(0.0);
                        if rng.gen_ratio(1, 30) {
                            let _ = send(SensorEvent::Telemetry(info(battery))).await;
                        }
                    }
                }
            }
            let _ = send(SensorEvent::StateChanged(SensorConnectionState::Disconnected)).await;
        });
        ConnectionHandle::new(shutdown_tx, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_simulated_sensor_streams_until_closed() {
        let (tx, mut rx) = mpsc::channel(64);
        let driver = SimulatedDriver::with_sample_period(Duration::from_millis(10));
        let handle = driver.open(3, Duration::from_secs(1), tx);

        let mut samples = 0;
        while samples < 3 {
            match rx.recv().await {
                Some(CoreEvent::Sensor(msg)) => {
                    assert_eq!(msg.attempt, 3);
                    if let SensorEvent::Sample(sample) = msg.event {
                        assert_eq!(sample.rr_intervals_ms.len(), 1);
                        assert!((960.0..1040.0).contains(&sample.rr_intervals_ms[0]));
                        samples += 1;
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        handle.close(Duration::from_secs(1)).await;
    }
}
