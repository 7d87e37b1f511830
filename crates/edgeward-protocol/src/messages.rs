use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Marker prepended to every message produced while the simulated backend is in use
pub const SIMULATION_MARKER: &str = "[SIMULATED]";

/// Status of a single progress event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Step completed, more steps follow
    InProgress,
    /// Terminal: the operation completed
    Success,
    /// Terminal: the operation was aborted at this step
    Failure,
}

impl EventStatus {
    /// Whether this status closes the stream
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventStatus::InProgress)
    }
}

/// TLS exposure state of an administrator's domain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TlsStatus {
    /// Plain HTTP, no domain exposed
    #[default]
    Http,
    /// Domain routed with an active certificate
    Https,
    /// Issuance in flight
    Pending,
    /// The control plane may hold a configuration the record cannot vouch for
    Failed,
}

impl TlsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsStatus::Http => "HTTP",
            TlsStatus::Https => "HTTPS",
            TlsStatus::Pending => "PENDING",
            TlsStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TlsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown TLS status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown TLS status: {0}")]
pub struct UnknownTlsStatus(pub String);

impl FromStr for TlsStatus {
    type Err = UnknownTlsStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP" => Ok(TlsStatus::Http),
            "HTTPS" => Ok(TlsStatus::Https),
            "PENDING" => Ok(TlsStatus::Pending),
            "FAILED" => Ok(TlsStatus::Failed),
            other => Err(UnknownTlsStatus(other.to_string())),
        }
    }
}

/// One step update of a register/deregister operation
///
/// Wire shape: `{"step": 1, "message": "...", "status": "in_progress", "simulated": false}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Step index, 1 through 5
    pub step: u8,
    /// Human readable description
    pub message: String,
    pub status: EventStatus,
    /// Set when the event was produced against the simulated backend
    #[serde(default)]
    pub simulated: bool,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_status_text_form() {
        for status in [
            TlsStatus::Http,
            TlsStatus::Https,
            TlsStatus::Pending,
            TlsStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TlsStatus>().unwrap(), status);
        }
        assert!("https".parse::<TlsStatus>().is_err());
        assert_eq!(TlsStatus::default(), TlsStatus::Http);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent {
            step: 3,
            message: "Applied".to_string(),
            status: EventStatus::InProgress,
            simulated: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["step"], 3);
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["message"], "Applied");

        let parsed: ProgressEvent =
            serde_json::from_str(r#"{"step":5,"message":"done","status":"success"}"#).unwrap();
        assert!(parsed.is_terminal());
        assert!(!parsed.simulated);
    }
}
