use serde::Serialize;

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StatusMessage {
    #[serde(rename = "C")]
    Command(String),
    #[serde(rename = "I")]
    Info(String),
    #[serde(rename = "P")]
    Param(String),
    #[serde(rename = "V")]
    Version(String),
    #[serde(rename = "M")]
    Mac(String),
    #[serde(rename = "G")]
    Group(String),
    #[serde(rename = "O")]
    Org(String),
    #[serde(rename = "L")]
    Notice(String),
}

impl StatusMessage {
    pub fn command(text: impl Into<String>) -> Self {
        Self::Command(text.into())
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::Info(text.into())
    }

    pub fn failure(context: &str, err: &ErrorKind) -> Self {
        Self::Command(format!("{context}: {}", describe(err)))
    }

    pub fn version_check_failed(err: &ErrorKind) -> Self {
        Self::failure("Version check failed", err)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

pub fn describe(err: &ErrorKind) -> String {
    let mut text = err.tag().to_string();
    if let Some(code) = err.status_code() {
        text.push_str(&format!(" ({code})"));
    }
    if let ErrorKind::UpdateFailed { message, .. } = err {
        text.push(' ');
        text.push_str(message);
    }
    text
}
