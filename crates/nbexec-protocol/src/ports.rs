//! Boundary ports between the engine and its external collaborators.
//!
//! The transport supervisor supplies a [`KernelTransport`] per kernel; the
//! process spawner is a [`KernelLauncher`]. The engine never spawns
//! processes or parses connection files itself.

use crate::error::{KernelResult, TransportError};
use crate::message::JupyterMessage;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lazily-consumed sequence of inbound messages. Ends when the transport
/// is severed; never yields errors.
pub type MessageStream = BoxStream<'static, JupyterMessage>;

/// Duplex connection to one kernel.
pub trait KernelTransport: Send + Sync {
    /// Enqueue `message` on the stream its type belongs to. Never blocks.
    /// Delivery order matches call order per channel.
    fn send(&self, message: JupyterMessage) -> Result<(), TransportError>;

    /// Independent subscription to every inbound stream, interleaved in
    /// arrival order. Subscribers do not affect each other.
    fn observe(&self) -> MessageStream;

    /// Terminate every observer and fail subsequent sends.
    fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

impl KernelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            language: None,
            argv: Vec::new(),
        }
    }
}

/// Starts a kernel process and hands back its transport.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self, spec: &KernelSpec) -> KernelResult<Arc<dyn KernelTransport>>;
}
