use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ErrorKind,
    locator::{normalize_prefix, ServerEndpoint},
};

pub mod defaults {
    pub const FIRMWARE_VERSION: i64 = 10;
    pub const CERTIFICATE_VERSION: i64 = 0;

    pub const ORG_ID: &str = "Myorg";
    pub const GROUP_ID: &str = "Grpid";
    pub const APP_ID: &str = "bath";
    pub const APP_NAME: &str = "Sky Light";

    pub const FW_PRIMARY_PREFIX: &str = "http://your-bucket.s3.us-east-2.amazonaws.com/ota1/";
    pub const FW_BACKUP_PREFIX: &str = "http://192.168.0.101:8000/ota";
    pub const CERTIFICATE_PRIMARY_PREFIX: &str = "http://your-bucket.s3.us-east-2.amazonaws.com/cert1";
    pub const CERTIFICATE_BACKUP_PREFIX: &str = "http://192.168.0.101:8000/ota/cert/";

    pub const NUM_RELAYS: i64 = 2;
    pub const PRIMARY_RELAY: i64 = 0;
    pub const ACTIVE_LOW_RELAY: bool = false;
    pub const RADAR_TRIGGERS: bool = false;

    pub const STATUS_FREQUENCY_MIN: i64 = 5;
    pub const AUTO_OFF_MIN: f64 = 1.5;
    pub const CHECK_INTERVAL_MS: u64 = 10_000;
    pub const UPDATE_INTERVAL_MS: u64 = 6 * 60 * 60 * 1000;
    pub const UPDATE_RETRY_ATTEMPTS: u32 = 3;
    pub const UPDATE_RETRY_BACKOFF_MS: u64 = 60_000;
    pub const UPDATE_RETRY_BACKOFF_CAP_MS: u64 = 15 * 60 * 1000;

    pub const NIGHT_START_HOUR: u8 = 18;
    pub const NIGHT_START_MINUTE: u8 = 0;
    pub const NIGHT_END_HOUR: u8 = 6;
    pub const NIGHT_END_MINUTE: u8 = 30;

    pub const DAY_LIGHT_THRESHOLD: i64 = 300;
    pub const NIGHT_LIGHT_THRESHOLD: i64 = 100;

    pub const CONFIG_FILE_SIZE: u64 = 500;

    pub const MAX_ID_LENGTH: usize = 31;
    pub const MAX_PREFIX_LENGTH: usize = 127;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightHours {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl Default for NightHours {
    fn default() -> Self {
        Self {
            start_hour: defaults::NIGHT_START_HOUR,
            start_minute: defaults::NIGHT_START_MINUTE,
            end_hour: defaults::NIGHT_END_HOUR,
            end_minute: defaults::NIGHT_END_MINUTE,
        }
    }
}

impl NightHours {
    pub fn display(&self) -> String {
        format!(
            "{:02}:{:02} - {:02}:{:02}",
            self.start_hour, self.start_minute, self.end_hour, self.end_minute
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub org_id: String,
    pub app_id: String,
    pub group_id: String,
    pub firmware: ServerEndpoint,
    pub certificates: ServerEndpoint,
    pub firmware_version: i64,
    pub certificate_version: i64,
    pub version_check_enabled: bool,
    pub active_low: bool,
    pub primary_relay: i64,
    pub radar_triggers: bool,
    pub status_frequency_min: i64,
    pub auto_off_minutes: f64,
    pub night_hours: NightHours,
    pub day_light_threshold: i64,
    pub night_light_threshold: i64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            org_id: defaults::ORG_ID.to_string(),
            app_id: defaults::APP_ID.to_string(),
            group_id: defaults::GROUP_ID.to_string(),
            firmware: ServerEndpoint::new(defaults::FW_PRIMARY_PREFIX, defaults::FW_BACKUP_PREFIX),
            certificates: ServerEndpoint::new(
                defaults::CERTIFICATE_PRIMARY_PREFIX,
                defaults::CERTIFICATE_BACKUP_PREFIX,
            ),
            firmware_version: defaults::FIRMWARE_VERSION,
            certificate_version: defaults::CERTIFICATE_VERSION,
            version_check_enabled: true,
            active_low: defaults::ACTIVE_LOW_RELAY,
            primary_relay: defaults::PRIMARY_RELAY,
            radar_triggers: defaults::RADAR_TRIGGERS,
            status_frequency_min: defaults::STATUS_FREQUENCY_MIN,
            auto_off_minutes: defaults::AUTO_OFF_MIN,
            night_hours: NightHours::default(),
            day_light_threshold: defaults::DAY_LIGHT_THRESHOLD,
            night_light_threshold: defaults::NIGHT_LIGHT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverride {
    pub ota_primary: Option<String>,
    pub ota_secondary: Option<String>,
    pub cert_primary: Option<String>,
    pub cert_secondary: Option<String>,
    pub group_id: Option<String>,
    pub org_id: Option<String>,
    pub app_id: Option<String>,
    pub certificate_version: Option<i64>,
    pub active_low: Option<bool>,
    pub primary_relay: Option<i64>,
    pub radar_triggers: Option<bool>,
    pub status_frequency_min: Option<i64>,
    pub auto_off_minutes: Option<f64>,
    pub night_hours: [Option<u8>; 4],
    pub day_light_threshold: Option<i64>,
    pub night_light_threshold: Option<i64>,
}

impl ConfigOverride {
    pub fn from_json(raw: &[u8]) -> Result<Self, ErrorKind> {
        let doc: Value = serde_json::from_slice(raw).map_err(|_| ErrorKind::ConfigParseError)?;
        let Value::Object(map) = doc else {
            return Err(ErrorKind::ConfigParseError);
        };

        let night = map.get("NIGHT_HRS").and_then(Value::as_array);
        let night_field = |index: usize, max: u64| {
            night
                .and_then(|values| values.get(index))
                .and_then(Value::as_u64)
                .filter(|value| *value <= max)
                .map(|value| value as u8)
        };

        Ok(Self {
            ota_primary: prefix_field(map.get("OTA1")),
            ota_secondary: prefix_field(map.get("OTA2")),
            cert_primary: prefix_field(map.get("CERT1")),
            cert_secondary: prefix_field(map.get("CERT2")),
            group_id: id_field(map.get("GRP")),
            org_id: id_field(map.get("ORG")),
            app_id: id_field(map.get("APP")),
            certificate_version: map.get("CERT_VER").and_then(Value::as_i64),
            active_low: map.get("ACTIVE_LOW").and_then(flag_field),
            primary_relay: map.get("PRIMARY_REL").and_then(Value::as_i64),
            radar_triggers: map.get("RADAR_TRIG").and_then(flag_field),
            status_frequency_min: map
                .get("STAT_FREQ_MIN")
                .and_then(Value::as_i64)
                .filter(|minutes| *minutes > 0),
            auto_off_minutes: map
                .get("AUTO_OFF_MIN")
                .and_then(Value::as_f64)
                .filter(|minutes| *minutes > 0.0),
            night_hours: [
                night_field(0, 23),
                night_field(1, 59),
                night_field(2, 23),
                night_field(3, 59),
            ],
            day_light_threshold: map.get("DAY_LIGHT").and_then(Value::as_i64),
            night_light_threshold: map.get("NIGHT_LIGHT").and_then(Value::as_i64),
        })
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// Ids become single topic levels.
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/')
}

pub(crate) fn is_valid_prefix(prefix: &str) -> bool {
    !normalize_prefix(prefix).is_empty()
}

fn string_field(value: Option<&Value>, max_len: usize) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| text.len() <= max_len)
}

fn id_field(value: Option<&Value>) -> Option<String> {
    string_field(value, defaults::MAX_ID_LENGTH)
        .filter(|id| is_valid_id(id))
        .map(str::to_string)
}

fn prefix_field(value: Option<&Value>) -> Option<String> {
    string_field(value, defaults::MAX_PREFIX_LENGTH)
        .filter(|prefix| is_valid_prefix(prefix))
        .map(str::to_string)
}

fn flag_field(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

impl NodeSettings {
    pub fn apply(&mut self, overrides: &ConfigOverride) {
        use crate::locator::Source::{Primary, Secondary};

        if let Some(prefix) = &overrides.ota_primary {
            self.firmware.set_prefix(Primary, prefix);
        }
        if let Some(prefix) = &overrides.ota_secondary {
            self.firmware.set_prefix(Secondary, prefix);
        }
        if let Some(prefix) = &overrides.cert_primary {
            self.certificates.set_prefix(Primary, prefix);
        }
        if let Some(prefix) = &overrides.cert_secondary {
            self.certificates.set_prefix(Secondary, prefix);
        }
        if let Some(group) = &overrides.group_id {
            self.group_id = group.clone();
        }
        if let Some(org) = &overrides.org_id {
            self.org_id = org.clone();
        }
        if let Some(app) = &overrides.app_id {
            self.app_id = app.clone();
        }
        if let Some(version) = overrides.certificate_version {
            self.certificate_version = version;
        }
        if let Some(active_low) = overrides.active_low {
            self.active_low = active_low;
        }
        if let Some(relay) = overrides.primary_relay {
            self.primary_relay = relay;
        }
        if let Some(radar) = overrides.radar_triggers {
            self.radar_triggers = radar;
        }
        if let Some(minutes) = overrides.status_frequency_min {
            self.status_frequency_min = minutes;
        }
        if let Some(minutes) = overrides.auto_off_minutes {
            self.auto_off_minutes = minutes;
        }

        let [start_hour, start_minute, end_hour, end_minute] = overrides.night_hours;
        if let Some(value) = start_hour {
            self.night_hours.start_hour = value;
        }
        if let Some(value) = start_minute {
            self.night_hours.start_minute = value;
        }
        if let Some(value) = end_hour {
            self.night_hours.end_hour = value;
        }
        if let Some(value) = end_minute {
            self.night_hours.end_minute = value;
        }

        if let Some(threshold) = overrides.day_light_threshold {
            self.day_light_threshold = threshold;
        }
        if let Some(threshold) = overrides.night_light_threshold {
            self.night_light_threshold = threshold;
        }
    }

    pub fn auto_off_ticks(&self) -> i64 {
        let tick_secs = (defaults::CHECK_INTERVAL_MS / 1000) as f64;
        (self.auto_off_minutes * 60.0 / tick_secs) as i64
    }
}
