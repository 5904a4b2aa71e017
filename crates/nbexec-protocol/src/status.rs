//! Kernel connection status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of one kernel connection.
///
/// `Dead` is terminal: nothing leaves it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// No transport attached yet.
    #[default]
    NotConnected,
    /// Transport attached, waiting for the kernel's first status report.
    Starting,
    /// Ready to accept the next execution.
    Idle,
    /// Processing exactly one execution.
    Busy,
    /// Interrupt sent, acknowledgement pending.
    Interrupting,
    /// Restart requested, kernel has not come back yet.
    Restarting,
    /// Shut down or transport lost.
    Dead,
}

impl KernelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Interrupting => "interrupting",
            Self::Restarting => "restarting",
            Self::Dead => "dead",
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `execution_state` a kernel reports on its `status` broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    Restarting,
    Dead,
}
