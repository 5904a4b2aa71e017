//! The message envelope exchanged with a kernel.
//!
//! A [`JupyterMessage`] is an immutable value: header, parent header,
//! metadata, typed content, and binary buffers. The parent header is the
//! only correlation key; a reply or broadcast caused by a request carries
//! that request's header as its parent.

use crate::content::{
    ExecuteRequest, InputReply, InterruptRequest, KernelInfoRequest, MessageContent, Metadata,
    ShutdownRequest,
};
use crate::error::{KernelError, ProtocolError};
use crate::ids::{MessageId, SessionId};
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol version stamped on outgoing headers by default.
pub const PROTOCOL_VERSION: &str = "5.3";

/// One of the ordered streams multiplexed over a kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Shell,
    Control,
    IoPub,
    Stdin,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Control => "control",
            Self::IoPub => "iopub",
            Self::Stdin => "stdin",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: MessageId,
    pub session: SessionId,
    #[serde(default)]
    pub username: String,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

/// Protocol envelope with typed content.
///
/// Serializes to the JSON wire shape (`parent_header` is `{}` when absent).
/// Unknown `msg_type`s decode into [`MessageContent::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    pub header: MessageHeader,
    pub parent_header: Option<MessageHeader>,
    pub metadata: Metadata,
    pub content: MessageContent,
    /// Order-significant binary attachments. Never reordered or deduplicated.
    pub buffers: Vec<Vec<u8>>,
    /// Stream the message arrived on. Set by the transport on receipt.
    pub channel: Option<ChannelKind>,
}

impl JupyterMessage {
    pub fn msg_id(&self) -> &MessageId {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_id(&self) -> Option<&MessageId> {
        self.parent_header.as_ref().map(|parent| &parent.msg_id)
    }

    /// True when this message was caused by the request with `request_id`.
    pub fn is_reply_to(&self, request_id: &MessageId) -> bool {
        self.parent_id() == Some(request_id)
    }

    pub fn with_channel(mut self, channel: ChannelKind) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Reject messages whose type is pinned to another stream than the one
    /// they arrived on.
    pub fn check_channel(&self) -> Result<(), KernelError> {
        match (self.channel, self.content.expected_channel()) {
            (Some(actual), Some(expected)) if actual != expected => {
                Err(KernelError::ProtocolViolation(format!(
                    "{} {} arrived on {actual}, expected {expected}",
                    self.msg_type(),
                    self.msg_id()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Untyped wire shape of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: MessageHeader,
    #[serde(
        default,
        serialize_with = "serialize_parent",
        deserialize_with = "deserialize_parent"
    )]
    pub parent_header: Option<MessageHeader>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelKind>,
}

fn serialize_parent<S: Serializer>(
    parent: &Option<MessageHeader>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}

fn deserialize_parent<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<MessageHeader>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        other => MessageHeader::deserialize(other)
            .map(Some)
            .map_err(de::Error::custom),
    }
}

impl TryFrom<WireMessage> for JupyterMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let content = MessageContent::from_wire(&wire.header.msg_type, wire.content)?;
        Ok(Self {
            header: wire.header,
            parent_header: wire.parent_header,
            metadata: wire.metadata,
            content,
            buffers: wire.buffers,
            channel: wire.channel,
        })
    }
}

impl TryFrom<&JupyterMessage> for WireMessage {
    type Error = ProtocolError;

    fn try_from(message: &JupyterMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            header: message.header.clone(),
            parent_header: message.parent_header.clone(),
            metadata: message.metadata.clone(),
            content: message.content.to_wire()?,
            buffers: message.buffers.clone(),
            channel: message.channel,
        })
    }
}

impl Serialize for JupyterMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireMessage::try_from(self)
            .map_err(ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JupyterMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        Self::try_from(wire).map_err(de::Error::custom)
    }
}

/// Options carried by an `execute_request`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
    pub user_expressions: Map<String, Value>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            allow_stdin: true,
            stop_on_error: true,
            user_expressions: Map::new(),
        }
    }
}

/// Builds envelopes stamped with one client session.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    session: SessionId,
    username: String,
    version: String,
}

impl MessageFactory {
    pub fn new(session: SessionId, username: impl Into<String>) -> Self {
        Self {
            session,
            username: username.into(),
            version: PROTOCOL_VERSION.to_owned(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn header(&self, msg_type: &str) -> MessageHeader {
        MessageHeader {
            msg_id: MessageId::new_uuid(),
            session: self.session.clone(),
            username: self.username.clone(),
            date: Utc::now(),
            msg_type: msg_type.to_owned(),
            version: self.version.clone(),
        }
    }

    pub fn message(
        &self,
        content: MessageContent,
        parent: Option<&MessageHeader>,
    ) -> JupyterMessage {
        JupyterMessage {
            header: self.header(content.msg_type()),
            parent_header: parent.cloned(),
            metadata: Metadata::new(),
            content,
            buffers: Vec::new(),
            channel: None,
        }
    }

    /// Build an `execute_request`. Blank source is malformed input.
    pub fn execute_request(
        &self,
        source: impl Into<String>,
        options: &ExecuteOptions,
    ) -> Result<JupyterMessage, ProtocolError> {
        let code = source.into();
        if code.trim().is_empty() {
            return Err(ProtocolError::EmptySource);
        }
        let request = ExecuteRequest {
            code,
            silent: options.silent,
            store_history: options.store_history,
            user_expressions: options.user_expressions.clone(),
            allow_stdin: options.allow_stdin,
            stop_on_error: options.stop_on_error,
        };
        Ok(self.message(MessageContent::ExecuteRequest(request), None))
    }

    /// Answer an `input_request`; the request becomes the parent.
    pub fn input_reply(&self, request: &MessageHeader, value: impl Into<String>) -> JupyterMessage {
        self.message(
            MessageContent::InputReply(InputReply {
                value: value.into(),
            }),
            Some(request),
        )
    }

    pub fn interrupt_request(&self) -> JupyterMessage {
        self.message(MessageContent::InterruptRequest(InterruptRequest {}), None)
    }

    pub fn shutdown_request(&self, restart: bool) -> JupyterMessage {
        self.message(
            MessageContent::ShutdownRequest(ShutdownRequest { restart }),
            None,
        )
    }

    pub fn kernel_info_request(&self) -> JupyterMessage {
        self.message(MessageContent::KernelInfoRequest(KernelInfoRequest {}), None)
    }

    /// Kernel-side helper: a message caused by `parent`.
    pub fn reply(&self, parent: &JupyterMessage, content: MessageContent) -> JupyterMessage {
        self.message(content, Some(&parent.header))
    }
}
