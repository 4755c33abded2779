use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const START_SERVER_COMMAND: &str = "opencode serve";
pub const INSTALL_COMMAND: &str = "curl -fsSL https://opencode.ai/install | bash";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    ServerNotRunning,
    NotInstalled,
    Validation,
}

impl ErrorKind {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Transport => "Request Failed",
            Self::ServerNotRunning => "OpenCode server not running",
            Self::NotInstalled => "OpenCode not installed",
            Self::Validation => "Invalid Request",
        }
    }
}

/// Actionable advice shown next to an error, with a command the user can copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remediation {
    pub title: String,
    pub message: String,
    pub command: String,
}

#[derive(Debug, Error)]
pub enum OpenCodeError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode {path} response: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid server url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("OpenCode server is not running at {url}")]
    ServerNotRunning {
        url: String,
        reason: Option<String>,
    },
    #[error("opencode binary not found")]
    NotInstalled,
    #[error("failed to start opencode: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("OpenCode server reported unhealthy (version {version})")]
    Unhealthy { version: String },
    #[error("no model selected")]
    MissingModel,
}

impl OpenCodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { .. }
            | Self::Transport(_)
            | Self::Decode { .. }
            | Self::Unhealthy { .. } => ErrorKind::Transport,
            Self::InvalidUrl { .. } | Self::MissingModel => ErrorKind::Validation,
            Self::ServerNotRunning { .. } | Self::Spawn(_) => ErrorKind::ServerNotRunning,
            Self::NotInstalled => ErrorKind::NotInstalled,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    pub fn remediation(&self) -> Option<Remediation> {
        match self.kind() {
            ErrorKind::ServerNotRunning => Some(Remediation {
                title: ErrorKind::ServerNotRunning.title().to_string(),
                message: format!("Run '{START_SERVER_COMMAND}' to start"),
                command: START_SERVER_COMMAND.to_string(),
            }),
            ErrorKind::NotInstalled => Some(Remediation {
                title: ErrorKind::NotInstalled.title().to_string(),
                message: "Install from opencode.ai".to_string(),
                command: INSTALL_COMMAND.to_string(),
            }),
            ErrorKind::Validation if matches!(self, Self::MissingModel) => Some(Remediation {
                title: "Model not selected".to_string(),
                message: "Pass --model provider/model or configure a default model in OpenCode"
                    .to_string(),
                command: "opencode-ask models".to_string(),
            }),
            _ => None,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        let details = match self {
            Self::Http { body, .. } => Some(
                serde_json::from_str::<Value>(body).unwrap_or_else(|_| Value::String(body.clone())),
            ),
            Self::ServerNotRunning {
                reason: Some(reason),
                ..
            } => Some(Value::String(reason.clone())),
            _ => None,
        };

        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            status: self.status(),
            remediation: self.remediation(),
            details,
        }
    }
}

/// Serializable summary of an [`OpenCodeError`] for machine-readable output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&OpenCodeError> for ErrorReport {
    fn from(value: &OpenCodeError) -> Self {
        value.to_report()
    }
}
