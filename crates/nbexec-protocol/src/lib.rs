//! # nbexec-protocol — kernel messaging contract
//!
//! Shared types for talking to an interactive compute kernel: the message
//! envelope, the closed message vocabulary, output records, kernel status,
//! the error taxonomy, and the transport/launcher ports.
//!
//! Kept free of async runtimes so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — typed ids (MessageId, SessionId, KernelId, CellId)
//! - [`message`] — JupyterMessage envelope, headers, channels, MessageFactory
//! - [`content`] — MessageContent (closed vocabulary + Unknown passthrough)
//! - [`output`] — Output records and OutputEvent
//! - [`status`] — KernelStatus, ExecutionState
//! - [`ports`] — KernelTransport, KernelLauncher
//! - [`error`] — KernelError, TransportError, ProtocolError, CancelReason

pub mod content;
pub mod error;
pub mod ids;
pub mod message;
pub mod output;
pub mod ports;
pub mod status;

pub use content::{
    CommClose, CommMsg, CommOpen, DisplayData, ErrorContent, ExecuteInput, ExecuteReply,
    ExecuteRequest, ExecuteResult, InputReply, InputRequest, InterruptReply, InterruptRequest,
    KernelInfoReply, KernelInfoRequest, MessageContent, Metadata, MimeBundle, ReplyStatus,
    ShutdownReply, ShutdownRequest, StatusContent, StreamContent, StreamName, Transient,
};
pub use error::{CancelReason, KernelError, KernelResult, ProtocolError, TransportError};
pub use ids::{CellId, KernelId, MessageId, SessionId};
pub use message::{
    ChannelKind, ExecuteOptions, JupyterMessage, MessageFactory, MessageHeader, PROTOCOL_VERSION,
    WireMessage,
};
pub use output::{Output, OutputEvent};
pub use ports::{KernelLauncher, KernelSpec, KernelTransport, MessageStream};
pub use status::{ExecutionState, KernelStatus};
