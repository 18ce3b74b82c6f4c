//! HRV Recorder
//!
//! Command line front end of the recording core. Records tagged sessions from a BLE chest strap
//! and maintains the local upload queue.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::watch;

use hrv_recorder::{
    api::{
        controller::{QueueApi, QueueStore},
        model::QueueModelApi,
    },
    components::{
        application::{CoreController, CoreHandle},
        ingestion::HttpIngestionClient,
        recording::RecordingState,
        storage::JsonFileStore,
        upload_queue::UploadQueue,
    },
    core::{config::Config, events::Command},
    model::{
        sensor::SensorConnectionState,
        state::{CoreState, QueueStats},
        tag::SessionTag,
    },
};

#[cfg(not(feature = "mock"))]
use btleplug::platform::Adapter;
#[cfg(not(feature = "mock"))]
use hrv_recorder::components::bluetooth::BleDriver;
#[cfg(feature = "mock")]
use hrv_recorder::components::simulated::SimulatedDriver;

#[derive(Parser, Debug)]
#[command(name = "hrv-recorder", version, about = "Record and upload HRV sessions")]
struct Cli {
    /// Path of the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tags with their duration bounds
    Tags,
    /// Connect to the sensor and record one session (or a chain of intervals)
    Record {
        /// Tag of the session, e.g. wake_check or sleep
        #[arg(long)]
        tag: String,
        /// Duration in minutes, defaults to the tag default
        #[arg(long)]
        duration: Option<u32>,
        /// Mark the session as part of a pre/post day pair
        #[arg(long)]
        paired: bool,
        /// Protocol name used to derive the subtag
        #[arg(long, default_value = "")]
        protocol: String,
    },
    /// Inspect and maintain the upload queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum QueueAction {
    /// Show every queued session
    List,
    /// Deliver all pending sessions
    Flush,
    /// Return failed sessions to pending
    Retry,
    /// Remove delivered sessions
    ClearCompleted,
    /// Remove every session
    ClearAll,
}

#[cfg(not(feature = "mock"))]
fn sensor_driver(config: &Config) -> BleDriver<Adapter> {
    BleDriver::new(config.sensor.name_filter.clone(), config.telemetry_interval())
}

#[cfg(feature = "mock")]
fn sensor_driver(_config: &Config) -> SimulatedDriver {
    SimulatedDriver::default()
}

fn open_queue(config: &Config) -> Result<UploadQueue> {
    let store: Box<dyn QueueStore> = Box::new(JsonFileStore::new(&config.queue_path));
    UploadQueue::open(store)
}

/// Starts the core event loop in the background.
fn start_core(config: &Config) -> Result<(CoreHandle, tokio::task::JoinHandle<Result<()>>)> {
    let ingestion = HttpIngestionClient::new(
        &config.api.base_url,
        config.api.token.clone(),
        config.upload_timeout(),
    )?;
    let core = CoreController::new(
        config,
        sensor_driver(config),
        open_queue(config)?,
        Arc::new(ingestion),
    )?;
    let handle = core.handle();
    Ok((handle, tokio::spawn(core.run())))
}

async fn wait_for(
    rx: &mut watch::Receiver<CoreState>,
    f: impl FnMut(&CoreState) -> bool,
) -> Result<CoreState> {
    let state = rx
        .wait_for(f)
        .await
        .map_err(|_| anyhow!("core event loop has stopped"))?;
    Ok(state.clone())
}

fn last_error(state: &CoreState, since: usize) -> Option<String> {
    state
        .debug_trail
        .iter()
        .skip(since)
        .find_map(|e| e.message.strip_prefix("error: ").map(str::to_owned))
}

fn list_tags(config: &Config) -> Result<()> {
    let catalog = config.catalog()?;
    println!("{:<12} {:>8} {:>8} {:>8}  auto", "tag", "default", "min", "max");
    for (tag, rules) in catalog.tags() {
        println!(
            "{:<12} {:>8} {:>8} {:>8}  {}",
            tag.as_str(),
            rules.default_duration_minutes,
            rules.min_duration_minutes,
            rules.max_duration_minutes,
            if tag.is_auto_recording_mode() { "yes" } else { "no" }
        );
    }
    Ok(())
}

/// Waits until nothing is pending or uploading anymore.
async fn drain_queue(config: &Config, rx: &mut watch::Receiver<CoreState>) -> Result<QueueStats> {
    let outstanding = {
        let stats = rx.borrow().stats;
        stats.pending + stats.uploading
    };
    let limit = config.upload_timeout() * (outstanding as u32 + 1);
    match tokio::time::timeout(
        limit,
        wait_for(rx, |s| s.stats.pending == 0 && s.stats.uploading == 0),
    )
    .await
    {
        Ok(state) => Ok(state?.stats),
        Err(_) => {
            warn!("queue did not drain within {:?}", limit);
            Ok(rx.borrow().stats)
        }
    }
}

async fn record(
    config: &Config,
    tag: SessionTag,
    duration: Option<u32>,
    paired: bool,
    protocol: String,
) -> Result<()> {
    let (handle, task) = start_core(config)?;
    let mut rx = handle.subscribe();

    handle.send(Command::SelectTag(tag)).await?;
    if let Some(minutes) = duration {
        handle.send(Command::SetDuration(minutes)).await?;
    }
    handle.send(Command::SetPaired(paired)).await?;
    handle.send(Command::SetProtocol(protocol)).await?;

    println!("connecting to sensor ...");
    handle.send(Command::ConnectSensor).await?;
    let state = wait_for(&mut rx, |s| {
        matches!(
            s.sensor.state,
            SensorConnectionState::Connected | SensorConnectionState::Failed
        )
    })
    .await?;
    if state.sensor.state == SensorConnectionState::Failed {
        handle.shutdown().await?;
        task.await??;
        return Err(anyhow!(
            "sensor connection failed: {}",
            state.sensor.last_error.unwrap_or_default()
        ));
    }
    // device metadata follows right after the connection is reported
    let state = tokio::time::timeout(
        Duration::from_secs(2),
        wait_for(&mut rx, |s| s.sensor.info.is_some()),
    )
    .await
    .unwrap_or(Ok(state))?;
    match &state.sensor.info {
        Some(info) => println!(
            "connected to {} (battery {:?}%, signal {:?})",
            info.name, info.battery_percent, info.signal_strength
        ),
        None => println!("connected"),
    }

    let seen = state.debug_trail.len();
    handle.send(Command::StartRecording).await?;
    let state = wait_for(&mut rx, |s| {
        s.recording.state != RecordingState::Idle || last_error(s, seen).is_some()
    })
    .await?;
    if let Some(e) = last_error(&state, seen) {
        handle.shutdown().await?;
        task.await??;
        return Err(anyhow!(e));
    }
    println!(
        "recording {} for {} min, press Ctrl-C to stop",
        state.selection.tag, state.selection.duration_minutes
    );

    let mut last_report = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("stop requested");
                handle.send(Command::StopRecording).await?;
                wait_for(&mut rx, |s| s.recording.state == RecordingState::Idle).await?;
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(anyhow!("core event loop has stopped"));
                }
                let state = rx.borrow_and_update().clone();
                if state.recording.state == RecordingState::Idle {
                    break;
                }
                let progress = &state.recording;
                if progress.elapsed_seconds >= last_report + 10 {
                    last_report = progress.elapsed_seconds;
                    println!(
                        "{} {:>3.0}% {}s left, {} RR, HR {}",
                        progress.subtag.as_deref().unwrap_or_default(),
                        progress.progress * 100.0,
                        progress.remaining_seconds,
                        progress.rr_count,
                        state
                            .sensor
                            .last_heart_rate
                            .map(|hr| hr.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
    }

    handle.send(Command::DisconnectSensor).await?;
    if config.auto_upload {
        println!("delivering queued sessions ...");
        let stats = drain_queue(config, &mut rx).await?;
        println!("queue: {}", stats);
    }
    handle.shutdown().await?;
    task.await?
}

async fn maintain_queue(config: &Config, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::List => {
            let queue = open_queue(config)?;
            for item in queue.items() {
                let session = item.session();
                println!(
                    "{} {:<10} {:<26} event {:<10} {:>3} min {:>5} RR  attempts {}{}",
                    item.id(),
                    item.status().to_string(),
                    session.subtag,
                    session.event_id,
                    session.duration_minutes,
                    session.rr_intervals.len(),
                    item.attempts(),
                    item.error_message()
                        .map(|e| format!("  ({})", e))
                        .unwrap_or_default()
                );
            }
            println!("{} item(s)", queue.items().len());
        }
        QueueAction::Flush => {
            let mut config = config.clone();
            config.auto_upload = true;
            let (handle, task) = start_core(&config)?;
            let mut rx = handle.subscribe();
            handle.send(Command::ProcessQueue).await?;
            let stats = drain_queue(&config, &mut rx).await?;
            println!("queue: {}", stats);
            handle.shutdown().await?;
            task.await??;
        }
        QueueAction::Retry => {
            let count = open_queue(config)?.retry_failed()?;
            println!("{} failed item(s) returned to pending", count);
        }
        QueueAction::ClearCompleted => {
            let count = open_queue(config)?.clear_completed()?;
            println!("removed {} completed item(s)", count);
        }
        QueueAction::ClearAll => {
            let count = open_queue(config)?.clear_all()?;
            println!("removed {} item(s)", count);
        }
    }
    Ok(())
}

/// Main entry point of the application.
///
/// Initializes logging, loads the configuration and runs the requested command.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger with environment-specific settings.
    env_logger::Builder::from_env(
        Env::default()
            .filter_or("HRV_RECORDER_LOG", "info")
            .write_style_or("HRV_RECORDER_LOG_STYLE", "auto"),
    )
    .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if config.user_id.is_empty() {
        warn!("no user_id configured, sessions will carry an empty user id");
    }

    match cli.command {
        Commands::Tags => list_tags(&config),
        Commands::Record {
            tag,
            duration,
            paired,
            protocol,
        } => record(&config, tag.parse()?, duration, paired, protocol).await,
        Commands::Queue { action } => maintain_queue(&config, action).await,
    }
}
