//! HRV Recorder
//!
//! Recording and upload core for RR-interval wearables. Captures RR data from a Bluetooth Low
//! Energy (BLE) heart rate sensor, organizes it into tagged recording sessions (including chained
//! overnight intervals) and delivers every session to a remote ingestion service through a
//! durable, retrying upload queue.

/// Trait definitions at the seams between components.
pub mod api {
    /// Mutating APIs of the core components and their external collaborators.
    pub mod controller;
    /// Read only views on the core components.
    pub mod model;
}

/// Implementations of the core components.
pub mod components {
    /// Owner of all core state and its event loop.
    pub mod application;
    /// BLE heart rate sensor driver.
    pub mod bluetooth;
    /// HTTP client of the ingestion service.
    pub mod ingestion;
    /// Recording state machine.
    pub mod recording;
    /// Connection lifecycle of the tracked sensor.
    pub mod sensor;
    /// Sensor driver without hardware.
    #[cfg(feature = "mock")]
    pub mod simulated;
    /// Durable storage of the upload queue.
    pub mod storage;
    /// Ordered, retrying delivery of completed sessions.
    pub mod upload_queue;
}

/// Core utilities used throughout the crate.
pub mod core {
    /// Configuration file handling.
    pub mod config;
    /// Application-wide constants.
    pub mod constants;
    /// Events processed by the core event loop.
    pub mod events;
    /// Custom macros for code simplification.
    pub mod macros;
}

/// Data models representing the domain.
pub mod model {
    /// Upload queue items and server validation feedback.
    pub mod queue;
    /// Heart rate measurements and sensor metadata.
    pub mod sensor;
    /// Recording sessions.
    pub mod session;
    /// Snapshot published to presentation code.
    pub mod state;
    /// Session tags and their duration rules.
    pub mod tag;
}
