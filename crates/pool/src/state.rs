//! Connectivity states reported by pooled connections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current usability of a single connection.
///
/// A connection starts out `Connecting`, becomes `Ready` once the transport
/// is established and may fall back to `Idle` when unused. Transport
/// failures move it to `TransientFailure`; `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    Connecting,
    Ready,
    Idle,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// Ready or idle connections can take a call right away.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectivityState::Ready | ConnectivityState::Idle)
    }

    /// States the repair pass replaces.
    pub fn needs_repair(self) -> bool {
        matches!(
            self,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
