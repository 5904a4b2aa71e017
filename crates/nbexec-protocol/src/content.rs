//! Typed message content for the kernel messaging vocabulary.
//!
//! The wire format keys content shape off `header.msg_type`. Known types
//! decode into their dedicated struct; anything else lands in
//! [`MessageContent::Unknown`] untouched so newer kernels never break the
//! engine.

use crate::error::ProtocolError;
use crate::message::ChannelKind;
use crate::status::ExecutionState;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media type -> representation. Insertion order is preserved.
pub type MimeBundle = IndexMap<String, Value>;

/// Opaque key-value side channel.
pub type Metadata = Map<String, Value>;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    #[serde(default = "default_true")]
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    #[default]
    Ok,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_expressions: Map<String, Value>,
}

impl ExecuteReply {
    pub fn ok(execution_count: Option<u32>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            execution_count,
            ename: None,
            evalue: None,
            traceback: Vec::new(),
            payload: Vec::new(),
            user_expressions: Map::new(),
        }
    }

    pub fn error(
        execution_count: Option<u32>,
        ename: impl Into<String>,
        evalue: impl Into<String>,
        traceback: Vec<String>,
    ) -> Self {
        Self {
            status: ReplyStatus::Error,
            ename: Some(ename.into()),
            evalue: Some(evalue.into()),
            traceback,
            ..Self::ok(execution_count)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    #[serde(default)]
    pub execution_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: StreamName,
    pub text: String,
}

/// Per-message data that is never persisted with the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

impl Transient {
    pub fn is_empty(&self) -> bool {
        self.display_id.is_none()
    }
}

/// Shared shape of `display_data` and `update_display_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Transient::is_empty")]
    pub transient: Transient,
}

impl DisplayData {
    pub fn display_id(&self) -> Option<&str> {
        self.transient.display_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    #[serde(default)]
    pub execution_count: Option<u32>,
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptReply {
    #[serde(default)]
    pub status: ReplyStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReply {
    #[serde(default)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelInfoReply {
    pub status: ReplyStatus,
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: Value,
    pub banner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommClose {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Closed vocabulary of message content, keyed by wire `msg_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    ExecuteRequest(ExecuteRequest),
    ExecuteReply(ExecuteReply),
    ExecuteInput(ExecuteInput),
    ExecuteResult(ExecuteResult),
    Stream(StreamContent),
    DisplayData(DisplayData),
    UpdateDisplayData(DisplayData),
    Error(ErrorContent),
    InputRequest(InputRequest),
    InputReply(InputReply),
    Status(StatusContent),
    InterruptRequest(InterruptRequest),
    InterruptReply(InterruptReply),
    ShutdownRequest(ShutdownRequest),
    ShutdownReply(ShutdownReply),
    KernelInfoRequest(KernelInfoRequest),
    KernelInfoReply(KernelInfoReply),
    CommOpen(CommOpen),
    CommMsg(CommMsg),
    CommClose(CommClose),
    /// Any `msg_type` outside the vocabulary, carried verbatim.
    Unknown { msg_type: String, content: Value },
}

impl MessageContent {
    /// Wire `msg_type` string.
    pub fn msg_type(&self) -> &str {
        match self {
            Self::ExecuteRequest(_) => "execute_request",
            Self::ExecuteReply(_) => "execute_reply",
            Self::ExecuteInput(_) => "execute_input",
            Self::ExecuteResult(_) => "execute_result",
            Self::Stream(_) => "stream",
            Self::DisplayData(_) => "display_data",
            Self::UpdateDisplayData(_) => "update_display_data",
            Self::Error(_) => "error",
            Self::InputRequest(_) => "input_request",
            Self::InputReply(_) => "input_reply",
            Self::Status(_) => "status",
            Self::InterruptRequest(_) => "interrupt_request",
            Self::InterruptReply(_) => "interrupt_reply",
            Self::ShutdownRequest(_) => "shutdown_request",
            Self::ShutdownReply(_) => "shutdown_reply",
            Self::KernelInfoRequest(_) => "kernel_info_request",
            Self::KernelInfoReply(_) => "kernel_info_reply",
            Self::CommOpen(_) => "comm_open",
            Self::CommMsg(_) => "comm_msg",
            Self::CommClose(_) => "comm_close",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }

    /// Channel this content travels on, when the protocol pins one.
    ///
    /// Comm messages flow both ways (shell out, iopub in) and unknown types
    /// carry no expectation, so both return `None`.
    pub fn expected_channel(&self) -> Option<ChannelKind> {
        match self {
            Self::ExecuteRequest(_)
            | Self::ExecuteReply(_)
            | Self::KernelInfoRequest(_)
            | Self::KernelInfoReply(_) => Some(ChannelKind::Shell),
            Self::InterruptRequest(_)
            | Self::InterruptReply(_)
            | Self::ShutdownRequest(_)
            | Self::ShutdownReply(_) => Some(ChannelKind::Control),
            Self::InputRequest(_) | Self::InputReply(_) => Some(ChannelKind::Stdin),
            Self::ExecuteInput(_)
            | Self::ExecuteResult(_)
            | Self::Stream(_)
            | Self::DisplayData(_)
            | Self::UpdateDisplayData(_)
            | Self::Error(_)
            | Self::Status(_) => Some(ChannelKind::IoPub),
            Self::CommOpen(_) | Self::CommMsg(_) | Self::CommClose(_) | Self::Unknown { .. } => {
                None
            }
        }
    }

    /// True for the five types folded into a cell's output list.
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Self::Stream(_)
                | Self::DisplayData(_)
                | Self::UpdateDisplayData(_)
                | Self::ExecuteResult(_)
                | Self::Error(_)
        )
    }

    /// Decode wire content for `msg_type`.
    pub fn from_wire(msg_type: &str, content: Value) -> Result<Self, ProtocolError> {
        let decoded = match msg_type {
            "execute_request" => Self::ExecuteRequest(decode(msg_type, content)?),
            "execute_reply" => Self::ExecuteReply(decode(msg_type, content)?),
            "execute_input" => Self::ExecuteInput(decode(msg_type, content)?),
            "execute_result" => Self::ExecuteResult(decode(msg_type, content)?),
            "stream" => Self::Stream(decode(msg_type, content)?),
            "display_data" => Self::DisplayData(decode(msg_type, content)?),
            "update_display_data" => Self::UpdateDisplayData(decode(msg_type, content)?),
            "error" => Self::Error(decode(msg_type, content)?),
            "input_request" => Self::InputRequest(decode(msg_type, content)?),
            "input_reply" => Self::InputReply(decode(msg_type, content)?),
            "status" => Self::Status(decode(msg_type, content)?),
            "interrupt_request" => Self::InterruptRequest(decode(msg_type, content)?),
            "interrupt_reply" => Self::InterruptReply(decode(msg_type, content)?),
            "shutdown_request" => Self::ShutdownRequest(decode(msg_type, content)?),
            "shutdown_reply" => Self::ShutdownReply(decode(msg_type, content)?),
            "kernel_info_request" => Self::KernelInfoRequest(decode(msg_type, content)?),
            "kernel_info_reply" => Self::KernelInfoReply(decode(msg_type, content)?),
            "comm_open" => Self::CommOpen(decode(msg_type, content)?),
            "comm_msg" => Self::CommMsg(decode(msg_type, content)?),
            "comm_close" => Self::CommClose(decode(msg_type, content)?),
            other => Self::Unknown {
                msg_type: other.to_owned(),
                content,
            },
        };
        Ok(decoded)
    }

    /// Encode to wire content (the shape without the type tag).
    pub fn to_wire(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::ExecuteRequest(inner) => encode(inner),
            Self::ExecuteReply(inner) => encode(inner),
            Self::ExecuteInput(inner) => encode(inner),
            Self::ExecuteResult(inner) => encode(inner),
            Self::Stream(inner) => encode(inner),
            Self::DisplayData(inner) | Self::UpdateDisplayData(inner) => encode(inner),
            Self::Error(inner) => encode(inner),
            Self::InputRequest(inner) => encode(inner),
            Self::InputReply(inner) => encode(inner),
            Self::Status(inner) => encode(inner),
            Self::InterruptRequest(inner) => encode(inner),
            Self::InterruptReply(inner) => encode(inner),
            Self::ShutdownRequest(inner) => encode(inner),
            Self::ShutdownReply(inner) => encode(inner),
            Self::KernelInfoRequest(inner) => encode(inner),
            Self::KernelInfoReply(inner) => encode(inner),
            Self::CommOpen(inner) => encode(inner),
            Self::CommMsg(inner) => encode(inner),
            Self::CommClose(inner) => encode(inner),
            Self::Unknown { content, .. } => Ok(content.clone()),
        }
    }
}

fn decode<T: DeserializeOwned>(msg_type: &str, content: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(content).map_err(|error| ProtocolError::MalformedContent {
        msg_type: msg_type.to_owned(),
        reason: error.to_string(),
    })
}

fn encode<T: Serialize>(content: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(content).map_err(|error| ProtocolError::Serialization(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_msg_type_passes_through() {
        let content = json!({ "anything": [1, 2, 3] });
        let decoded = MessageContent::from_wire("debug_event", content.clone()).unwrap();
        assert_eq!(decoded.msg_type(), "debug_event");
        assert_eq!(decoded.expected_channel(), None);
        assert_eq!(decoded.to_wire().unwrap(), content);
    }

    #[test]
    fn execute_request_defaults_match_protocol() {
        let decoded =
            MessageContent::from_wire("execute_request", json!({ "code": "1 + 1" })).unwrap();
        let MessageContent::ExecuteRequest(request) = decoded else {
            panic!("expected execute_request");
        };
        assert!(!request.silent);
        assert!(request.store_history);
        assert!(request.allow_stdin);
        assert!(request.stop_on_error);
    }

    #[test]
    fn malformed_known_type_is_rejected() {
        let error = MessageContent::from_wire("stream", json!({ "name": "stdout" })).unwrap_err();
        assert!(matches!(
            error,
            ProtocolError::MalformedContent { ref msg_type, .. } if msg_type == "stream"
        ));
    }

    #[test]
    fn display_id_lives_in_transient() {
        let decoded = MessageContent::from_wire(
            "update_display_data",
            json!({
                "data": { "text/plain": "v2" },
                "metadata": {},
                "transient": { "display_id": "X" }
            }),
        )
        .unwrap();
        let MessageContent::UpdateDisplayData(display) = decoded else {
            panic!("expected update_display_data");
        };
        assert_eq!(display.display_id(), Some("X"));
    }

    #[test]
    fn mime_bundle_keeps_insertion_order() {
        let decoded = MessageContent::from_wire(
            "display_data",
            json!({ "data": { "text/plain": "a", "image/png": "b", "text/html": "c" } }),
        )
        .unwrap();
        let MessageContent::DisplayData(display) = decoded else {
            panic!("expected display_data");
        };
        let keys: Vec<_> = display.data.keys().map(String::as_str).collect();
        assert_eq!(keys, ["text/plain", "image/png", "text/html"]);
    }

    #[test]
    fn replies_pin_their_channel() {
        let reply = MessageContent::ExecuteReply(ExecuteReply::ok(Some(1)));
        assert_eq!(reply.expected_channel(), Some(ChannelKind::Shell));
        let interrupt = MessageContent::InterruptReply(InterruptReply::default());
        assert_eq!(interrupt.expected_channel(), Some(ChannelKind::Control));
        let input = MessageContent::InputRequest(InputRequest {
            prompt: "name? ".to_owned(),
            password: false,
        });
        assert_eq!(input.expected_channel(), Some(ChannelKind::Stdin));
    }
}
