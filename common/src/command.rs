use log::{info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::{manager::ConfigManager, status::StatusMessage, topics::Topics};

pub const MAX_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("payload of {0} bytes is too large")]
    TooLarge(usize),
    #[error("payload is not a JSON object")]
    InvalidJson,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("payload has no C, G or S key")]
    MissingEnvelope,
    #[error("empty parameter name")]
    EmptyParameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Update,
    Certificates,
    Version,
    Mac,
    Group,
    Org,
    Reboot,
}

impl CommandCode {
    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "UPD" => Self::Update,
            "CER" => Self::Certificates,
            "VER" => Self::Version,
            "MAC" => Self::Mac,
            "GRO" => Self::Group,
            "ORG" => Self::Org,
            "REB" => Self::Reboot,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Run(CommandCode),
    Get(String),
    Set { key: String, value: String },
}

impl RemoteCommand {
    // `G` wins over `S`, which wins over `C`, when a payload carries more
    // than one envelope.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CommandError::TooLarge(payload.len()));
        }
        let doc: Value = serde_json::from_slice(payload).map_err(|_| CommandError::InvalidJson)?;
        let Value::Object(map) = doc else {
            return Err(CommandError::InvalidJson);
        };

        if let Some(key) = map.get("G") {
            let key = key.as_str().unwrap_or_default().trim();
            if key.is_empty() {
                return Err(CommandError::EmptyParameter);
            }
            return Ok(Self::Get(key.to_string()));
        }

        if let Some(set) = map.get("S") {
            let key = set
                .get("P")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim();
            if key.is_empty() {
                return Err(CommandError::EmptyParameter);
            }
            let value = match set.get("V") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            return Ok(Self::Set {
                key: key.to_string(),
                value,
            });
        }

        let code = map
            .get("C")
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingEnvelope)?
            .trim();
        CommandCode::parse(code)
            .map(Self::Run)
            .ok_or_else(|| CommandError::UnknownCommand(code.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandAction {
    Publish(StatusMessage),
    CheckForUpdates,
    ProvisionCertificates,
    Reboot,
    Resubscribe { old: Topics, new: Topics },
}

pub fn dispatch(command: RemoteCommand, config: &mut ConfigManager) -> Vec<CommandAction> {
    match command {
        RemoteCommand::Run(code) => run(code, config),
        RemoteCommand::Get(key) => {
            vec![CommandAction::Publish(StatusMessage::Param(config.get(&key)))]
        }
        RemoteCommand::Set { key, value } => {
            let before = config.topics().clone();
            match config.set(&key, &value) {
                Ok(()) => {
                    let mut actions = vec![CommandAction::Publish(StatusMessage::info(format!(
                        "{key} updated"
                    )))];
                    if config.topics() != &before {
                        info!("topics changed; resubscribing");
                        actions.push(CommandAction::Resubscribe {
                            old: before,
                            new: config.topics().clone(),
                        });
                    }
                    actions
                }
                Err(err) => {
                    warn!("set {key} rejected: {err}");
                    vec![CommandAction::Publish(StatusMessage::command(format!(
                        "Set failed: {err}"
                    )))]
                }
            }
        }
    }
}

fn run(code: CommandCode, config: &ConfigManager) -> Vec<CommandAction> {
    let identity = config.identity();
    match code {
        CommandCode::Update => vec![CommandAction::CheckForUpdates],
        CommandCode::Certificates => vec![CommandAction::ProvisionCertificates],
        CommandCode::Version => vec![CommandAction::Publish(StatusMessage::Version(
            config.settings().firmware_version.to_string(),
        ))],
        CommandCode::Mac => vec![CommandAction::Publish(StatusMessage::Mac(
            identity.mac.to_string(),
        ))],
        CommandCode::Group => vec![CommandAction::Publish(StatusMessage::Group(
            identity.group_id.to_string(),
        ))],
        CommandCode::Org => vec![CommandAction::Publish(StatusMessage::Org(
            identity.org_id.to_string(),
        ))],
        CommandCode::Reboot => vec![
            CommandAction::Publish(StatusMessage::Notice("Device is rebooting !".to_string())),
            CommandAction::Reboot,
        ],
    }
}
