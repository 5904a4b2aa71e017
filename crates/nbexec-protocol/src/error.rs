//! Error taxonomy for the execution engine.

use crate::ids::{KernelId, MessageId};
use crate::message::ChannelKind;
use crate::status::KernelStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failures at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("cannot send on the {0} channel")]
    ChannelUnavailable(ChannelKind),
    #[error("transport io error: {0}")]
    Io(String),
}

/// Malformed caller input or malformed wire content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("execute request has no source")]
    EmptySource,
    #[error("malformed {msg_type} content: {reason}")]
    MalformedContent { msg_type: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Why an execution stopped being tracked before its reply arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Interrupted,
    KernelRestarted,
    KernelShutdown,
    UserCancelled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Interrupted => "interrupted",
            Self::KernelRestarted => "kernel restarted",
            Self::KernelShutdown => "kernel shutdown",
            Self::UserCancelled => "cancelled by user",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by kernel operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("kernel unavailable: {0}")]
    KernelUnavailable(KernelId),
    #[error("execution failed: {ename}: {evalue}")]
    ExecutionFailed {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    #[error("execution aborted by kernel")]
    ExecutionAborted,
    #[error("execution cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: KernelStatus,
        to: KernelStatus,
    },
    #[error("unknown request: {0}")]
    UnknownRequest(MessageId),
    #[error("kernel session stopped")]
    SessionStopped,
}

/// Convenience result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
