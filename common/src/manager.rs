use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    certs::{CertificateStore, BUNDLE_FILES},
    config::{defaults, is_valid_id, is_valid_prefix, NodeSettings},
    error::ErrorKind,
    io::FileStore,
    locator::{ArtifactLocator, Source},
    topics::Topics,
};

pub const UNKNOWN_PARAM_REPLY: &str = "ERROR";

pub const MAC_ADDRESS_LENGTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
    #[error("value for {key} exceeds {max} characters")]
    TooLong { key: String, max: usize },
    #[error("{0} cannot be changed at runtime")]
    Immutable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity<'a> {
    pub org_id: &'a str,
    pub app_id: &'a str,
    pub group_id: &'a str,
    pub mac: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLevels {
    pub on: u8,
    pub off: u8,
}

impl RelayLevels {
    pub fn for_polarity(active_low: bool) -> Self {
        if active_low {
            Self { on: 0, off: 1 }
        } else {
            Self { on: 1, off: 0 }
        }
    }
}

pub fn format_mac(bytes: [u8; 6]) -> String {
    bytes.iter().map(|byte| format!("{byte:02X}")).collect()
}

// Runtime changes made through `ConfigManager::set` live in memory only
// and are lost on reboot; `/config.txt` is never written back.
#[derive(Debug)]
pub struct ConfigManager {
    settings: NodeSettings,
    mac: String,
    relay_levels: RelayLevels,
    topics: Topics,
    night_hours: String,
    provisioning_error: Option<ErrorKind>,
    locator: ArtifactLocator,
}

impl ConfigManager {
    pub fn new(settings: NodeSettings, mac: String) -> Self {
        Self {
            relay_levels: RelayLevels::for_polarity(settings.active_low),
            topics: Topics::compose(
                &settings.org_id,
                &settings.app_id,
                &settings.group_id,
                &mac,
            ),
            night_hours: settings.night_hours.display(),
            settings,
            mac,
            provisioning_error: None,
            locator: ArtifactLocator::new(),
        }
    }

    pub fn init<S: FileStore + ?Sized>(&mut self, store: &mut S) -> bool {
        self.provisioning_error = None;
        let mut certs = CertificateStore::new(store);

        match certs.load_overrides() {
            Ok(Some(overrides)) => {
                self.settings.apply(&overrides);
                self.derive();
            }
            Ok(None) => {}
            Err(err) if err.blocks_provisioning() => {
                warn!("config load failed: {err}");
                self.provisioning_error = Some(err);
                return false;
            }
            Err(err) => warn!("config override ignored ({err}); keeping compiled defaults"),
        }

        if let Err(err) = certs.verify() {
            warn!("device is not provisioned: {err}");
            self.provisioning_error = Some(err);
            return false;
        }

        info!(
            "config ready: mac {}, publish topic {}, subscribe topic {}, broadcast topic {}",
            self.mac, self.topics.publish, self.topics.subscribe, self.topics.broadcast
        );
        if let Ok(dump) = serde_json::to_string(&self.settings) {
            debug!("settings: {dump}");
        }
        true
    }

    pub fn provisioning_error(&self) -> Option<&ErrorKind> {
        self.provisioning_error.as_ref()
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn identity(&self) -> DeviceIdentity<'_> {
        DeviceIdentity {
            org_id: &self.settings.org_id,
            app_id: &self.settings.app_id,
            group_id: &self.settings.group_id,
            mac: &self.mac,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn relay_levels(&self) -> RelayLevels {
        self.relay_levels
    }

    pub fn night_hours(&self) -> &str {
        &self.night_hours
    }

    fn derive(&mut self) {
        self.relay_levels = RelayLevels::for_polarity(self.settings.active_low);
        self.night_hours = self.settings.night_hours.display();
        self.topics = Topics::compose(
            &self.settings.org_id,
            &self.settings.app_id,
            &self.settings.group_id,
            &self.mac,
        );
    }

    pub fn get(&mut self, key: &str) -> String {
        let settings = &self.settings;
        let locator = &mut self.locator;
        let config_file = BUNDLE_FILES[0];

        match key {
            "OTAP" => locator
                .firmware_url(&settings.firmware, Source::Primary, &settings.app_id)
                .into_string(),
            "OTAS" => locator
                .firmware_url(&settings.firmware, Source::Secondary, &settings.app_id)
                .into_string(),
            "OTAPV" => locator
                .firmware_version_url(&settings.firmware, Source::Primary, &settings.app_id)
                .into_string(),
            "OTASV" => locator
                .firmware_version_url(&settings.firmware, Source::Secondary, &settings.app_id)
                .into_string(),
            "CERTP" => locator
                .certificate_url(&settings.certificates, Source::Primary, config_file)
                .into_string(),
            "CERTS" => locator
                .certificate_url(&settings.certificates, Source::Secondary, config_file)
                .into_string(),
            "CERTPV" => locator
                .certificate_version_url(&settings.certificates, Source::Primary)
                .into_string(),
            "CERTSV" => locator
                .certificate_version_url(&settings.certificates, Source::Secondary)
                .into_string(),
            "MAC" => self.mac.clone(),
            "ORG" => settings.org_id.clone(),
            "GRP" => settings.group_id.clone(),
            "APP" => settings.app_id.clone(),
            "ACTL" => format!("AL:{}", u8::from(settings.active_low)),
            "RTRIG" => format!("RT:{}", u8::from(settings.radar_triggers)),
            "PRIREL" => settings.primary_relay.to_string(),
            "STATF" => settings.status_frequency_min.to_string(),
            "AOFF" => settings.auto_off_minutes.to_string(),
            "NHRS" => self.night_hours.clone(),
            "LTH" => format!(
                "Day:{} , Night:{}",
                settings.day_light_threshold, settings.night_light_threshold
            ),
            _ => {
                warn!("get: unknown parameter `{key}`");
                UNKNOWN_PARAM_REPLY.to_string()
            }
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ParamError> {
        info!("set {key} = {value}");
        match key {
            "MAC" => {
                let mac = value.trim().to_ascii_uppercase();
                if mac.len() > MAC_ADDRESS_LENGTH {
                    return Err(too_long(key, MAC_ADDRESS_LENGTH));
                }
                if mac.len() != MAC_ADDRESS_LENGTH || !mac.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(invalid(key, value));
                }
                warn!("mac address spoofed to {mac}; duplicate client ids clash on the broker");
                self.mac = mac;
                self.derive();
            }
            "OTAP" => self.set_prefix(key, value, Source::Primary, false)?,
            "OTAS" => self.set_prefix(key, value, Source::Secondary, false)?,
            "CERTP" => self.set_prefix(key, value, Source::Primary, true)?,
            "CERTS" => self.set_prefix(key, value, Source::Secondary, true)?,
            "GRP" => {
                let group = value.trim();
                if group.len() > defaults::MAX_ID_LENGTH {
                    return Err(too_long(key, defaults::MAX_ID_LENGTH));
                }
                if !is_valid_id(group) {
                    return Err(invalid(key, value));
                }
                self.settings.group_id = group.to_string();
                self.derive();
            }
            // Topic subscriptions are keyed on these; no safe runtime path.
            "ORG" | "APP" => return Err(ParamError::Immutable(key.to_string())),
            "PRIREL" => {
                let relay = value.trim().parse::<i64>().unwrap_or(0);
                // Relay 0 is rejected too; kept as deployed devices expect it.
                if !(1..defaults::NUM_RELAYS).contains(&relay) {
                    return Err(invalid(key, value));
                }
                self.settings.primary_relay = relay;
            }
            "ACTL" => {
                self.settings.active_low = parse_flag(key, value)?;
                self.derive();
            }
            "RTRIG" => self.settings.radar_triggers = parse_flag(key, value)?,
            _ => {
                warn!("set: unknown parameter `{key}`");
                return Err(ParamError::UnknownParameter(key.to_string()));
            }
        }
        Ok(())
    }

    fn set_prefix(
        &mut self,
        key: &str,
        value: &str,
        source: Source,
        certificates: bool,
    ) -> Result<(), ParamError> {
        if value.len() > defaults::MAX_PREFIX_LENGTH {
            return Err(too_long(key, defaults::MAX_PREFIX_LENGTH));
        }
        if !is_valid_prefix(value) {
            return Err(invalid(key, value));
        }
        let endpoint = if certificates {
            &mut self.settings.certificates
        } else {
            &mut self.settings.firmware
        };
        endpoint.set_prefix(source, value);
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ParamError> {
    match value.as_bytes().first() {
        Some(b'1') => Ok(true),
        Some(b'0') => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ParamError {
    ParamError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn too_long(key: &str, max: usize) -> ParamError {
    ParamError::TooLong {
        key: key.to_string(),
        max,
    }
}
