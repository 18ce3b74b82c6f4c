use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/// UUID for the Heart Rate Service.
pub const HEARTRATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
/// UUID for the Heart Rate Measurement Characteristic.
pub const HEARTRATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);
/// UUID for the Battery Level Characteristic.
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2A19);

pub const UPLOAD_PATH: &str = "/api/v1/sessions/upload";
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_DEBUG_TRAIL_LEN: usize = 200;
/// Time given to a sensor task to release the device before it is aborted.
pub const SENSOR_SHUTDOWN_GRACE_MS: u64 = 2000;

pub const TIME_STRING_FORMAT: &str = "[hour]:[minute]:[second]";
