//! Bluetooth Driver Module
//!
//! This module implements the Bluetooth Low Energy (BLE) side of the sensor link. Every
//! connection attempt runs as its own task: scan for a heart rate monitor, connect, subscribe to
//! the heart rate measurement characteristic and forward everything it observes to the core
//! event loop until told to shut down.
use crate::api::controller::{AdapterDiscovery, ConnectionHandle, SensorDriver};
use crate::core::constants::{
    BATTERY_LEVEL_UUID, HEARTRATE_MEASUREMENT_UUID, HEARTRATE_SERVICE_UUID,
};
use crate::core::events::{CoreEvent, SensorEvent, SensorMessage};
use crate::model::sensor::{HeartrateMessage, HeartrateSample, SensorConnectionState, SensorInfo};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use log::{info, trace, warn};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::{mpsc::Sender, oneshot};

/// Poll period of the peripheral list while scanning.
const SCAN_POLL_MS: u64 = 500;

/// Connects to BLE heart rate monitors through adapters of type `A`.
///
/// # Fields
/// - `name_filter`: Only devices whose advertised name contains this string are accepted
/// - `telemetry_interval`: Period of battery and signal strength updates while connected
pub struct BleDriver<A: Central + AdapterDiscovery<A> + 'static> {
    name_filter: Option<String>,
    telemetry_interval: Duration,
    _adapter: PhantomData<fn() -> A>,
}

impl<A: Central + AdapterDiscovery<A> + 'static> Debug for BleDriver<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleDriver")
            .field("name_filter", &self.name_filter)
            .field("telemetry_interval", &self.telemetry_interval)
            .finish()
    }
}

impl<A: Central + AdapterDiscovery<A> + 'static> BleDriver<A> {
    pub fn new(name_filter: Option<String>, telemetry_interval: Duration) -> Self {
        Self {
            name_filter,
            telemetry_interval,
            _adapter: PhantomData,
        }
    }
}

impl<A: Central + AdapterDiscovery<A> + 'static> SensorDriver for BleDriver<A> {
    fn open(&self, attempt: u64, timeout: Duration, events: Sender<CoreEvent>) -> ConnectionHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let name_filter = self.name_filter.clone();
        let telemetry_interval = self.telemetry_interval;
        let task = tokio::spawn(async move {
            let publisher = Publisher { attempt, events };
            let result = run_connection::<A>(
                &publisher,
                name_filter,
                timeout,
                telemetry_interval,
                shutdown_rx,
            )
            .await;
            let last = match result {
                Ok(()) => SensorEvent::StateChanged(SensorConnectionState::Disconnected),
                Err(e) => SensorEvent::Failed(e.to_string()),
            };
            publisher.send(last).await;
            trace!("BT connection task {} terminated", attempt);
        });
        ConnectionHandle::new(shutdown_tx, task)
    }
}

/// Tags outgoing events with the attempt they belong to.
struct Publisher {
    attempt: u64,
    events: Sender<CoreEvent>,
}

impl Publisher {
    /// Returns `false` once the core has gone away.
    async fn send(&self, event: SensorEvent) -> bool {
        self.events
            .send(CoreEvent::Sensor(SensorMessage {
                attempt: self.attempt,
                event,
            }))
            .await
            .is_ok()
    }
}

/// A connected and subscribed heart rate monitor.
struct Connection<P: Peripheral> {
    peripheral: P,
    battery: Option<Characteristic>,
}

async fn run_connection<A: Central + AdapterDiscovery<A> + 'static>(
    publisher: &Publisher,
    name_filter: Option<String>,
    timeout: Duration,
    telemetry_interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let connection = tokio::select! {
        _ = &mut shutdown => return Ok(()),
        connection = establish::<A>(publisher, name_filter.as_deref(), timeout) => connection?,
    };
    let peripheral = &connection.peripheral;
    let mut notifications = peripheral.notifications().await?;

    publisher
        .send(SensorEvent::StateChanged(SensorConnectionState::Connected))
        .await;
    info!("heart rate sensor connected");
    publisher
        .send(SensorEvent::Telemetry(read_telemetry(&connection).await))
        .await;

    let mut telemetry = tokio::time::interval(telemetry_interval);
    // the first tick completes immediately
    telemetry.tick().await;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("failed to disconnect sensor: {}", e);
                }
                return Ok(());
            }
            notification = notifications.next() => {
                let Some(data) = notification else {
                    warn!("BT notification stream ended");
                    return Ok(());
                };
                if data.uuid != HEARTRATE_MEASUREMENT_UUID {
                    continue;
                }
                match HeartrateMessage::parse(&data.value) {
                    Ok(msg) => {
                        let sample = SensorEvent::Sample(HeartrateSample::from(&msg));
                        if !publisher.send(sample).await {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!("discarding heart rate notification: {}", e),
                }
            }
            _ = telemetry.tick() => {
                publisher
                    .send(SensorEvent::Telemetry(read_telemetry(&connection).await))
                    .await;
            }
        }
    }
}

async fn establish<A: Central + AdapterDiscovery<A> + 'static>(
    publisher: &Publisher,
    name_filter: Option<&str>,
    timeout: Duration,
) -> Result<Connection<A::Peripheral>> {
    let adapter = A::discover_adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(anyhow!("no Bluetooth adapter found"))?;
    adapter
        .start_scan(ScanFilter {
            services: vec![HEARTRATE_SERVICE_UUID],
        })
        .await?;
    trace!("scanning for heart rate sensors");
    let found = tokio::time::timeout(timeout, find_heart_rate_peripheral(&adapter, name_filter)).await;
    if let Err(e) = adapter.stop_scan().await {
        warn!("failed to stop scan: {}", e);
    }
    let peripheral =
        found.map_err(|_| anyhow!("no heart rate sensor found within {:?}", timeout))??;

    publisher
        .send(SensorEvent::StateChanged(SensorConnectionState::Connecting))
        .await;
    tokio::time::timeout(timeout, async {
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok::<(), btleplug::Error>(())
    })
    .await
    .map_err(|_| anyhow!("connection timed out after {:?}", timeout))??;

    let characteristics = peripheral.characteristics();
    let heart_rate = characteristics
        .iter()
        .find(|c| c.uuid == HEARTRATE_MEASUREMENT_UUID)
        .ok_or(anyhow!("Peripheral has no Heartrate attribute"))?
        .clone();
    peripheral.subscribe(&heart_rate).await?;
    let battery = characteristics
        .iter()
        .find(|c| c.uuid == BATTERY_LEVEL_UUID)
        .cloned();

    Ok(Connection {
        peripheral,
        battery,
    })
}

async fn find_heart_rate_peripheral<A: Central>(
    adapter: &A,
    name_filter: Option<&str>,
) -> Result<A::Peripheral> {
    loop {
        for peripheral in adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if is_heart_rate_sensor(&props, name_filter) {
                    trace!("found sensor {:?}", props.local_name);
                    return Ok(peripheral);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(SCAN_POLL_MS)).await;
    }
}

/// Matches the name filter if one is configured, the advertised heart rate service otherwise.
fn is_heart_rate_sensor(props: &PeripheralProperties, name_filter: Option<&str>) -> bool {
    match name_filter {
        Some(filter) => props
            .local_name
            .as_deref()
            .is_some_and(|name| name.contains(filter)),
        None => props.services.contains(&HEARTRATE_SERVICE_UUID),
    }
}

async fn read_telemetry<P: Peripheral>(connection: &Connection<P>) -> SensorInfo {
    let peripheral = &connection.peripheral;
    let props = peripheral.properties().await.ok().flatten();
    let battery_percent = match &connection.battery {
        Some(c) => match peripheral.read(c).await {
            Ok(value) => value.first().map(|b| (*b).min(100)),
            Err(e) => {
                warn!("failed to read battery level: {}", e);
                None
            }
        },
        None => None,
    };
    SensorInfo {
        name: props
            .as_ref()
            .and_then(|p| p.local_name.clone())
            .unwrap_or_else(|| "Unknown sensor".to_string()),
        battery_percent,
        signal_strength: props.and_then(|p| p.rssi),
    }
}

#[async_trait]
impl AdapterDiscovery<Adapter> for Adapter {
    async fn discover_adapters() -> Result<Vec<Adapter>> {
        let manager = Manager::new().await?;
        Ok(manager.adapters().await?)
    }
}
