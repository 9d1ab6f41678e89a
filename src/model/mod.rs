use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Stable identity of the station, also used for dedup.
    pub fn unique_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    #[default]
    Off,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => f.write_str("on"),
            PowerState::Off => f.write_str("off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    Command,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerChange {
    pub target: ConnectionTarget,
    pub state: PowerState,
    pub source: ChangeSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer closed the connection.
    Normal,
    Error,
}

/// Lifecycle of the long-lived stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Closed {
        reason: CloseReason,
    },
    Reconnecting {
        attempt: u32,
    },
    Cancelled,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Closed { .. } | SessionState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub id: String,
    pub title: String,
    pub power: PowerState,
    pub session: SessionState,
}
