//! Output records accumulated per cell, and the events that produce them.

use crate::content::{MessageContent, Metadata, MimeBundle, StreamName};
use serde::{Deserialize, Serialize};

/// One renderable record in a cell's output list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
    ExecuteResult {
        data: MimeBundle,
        #[serde(default)]
        metadata: Metadata,
        execution_count: Option<u32>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl Output {
    pub fn output_type(&self) -> &'static str {
        match self {
            Self::Stream { .. } => "stream",
            Self::DisplayData { .. } => "display_data",
            Self::ExecuteResult { .. } => "execute_result",
            Self::Error { .. } => "error",
        }
    }
}

/// An output-bearing message, reduced to what the aggregator needs.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        metadata: Metadata,
        display_id: Option<String>,
    },
    UpdateDisplayData {
        data: MimeBundle,
        metadata: Metadata,
        display_id: String,
    },
    ExecuteResult {
        data: MimeBundle,
        metadata: Metadata,
        execution_count: Option<u32>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputEvent {
    /// Extract the output event carried by `content`, if any.
    ///
    /// An `update_display_data` without a display id can never target a
    /// record and yields `None`.
    pub fn from_content(content: &MessageContent) -> Option<Self> {
        match content {
            MessageContent::Stream(stream) => Some(Self::Stream {
                name: stream.name,
                text: stream.text.clone(),
            }),
            MessageContent::DisplayData(display) => Some(Self::DisplayData {
                data: display.data.clone(),
                metadata: display.metadata.clone(),
                display_id: display.transient.display_id.clone(),
            }),
            MessageContent::UpdateDisplayData(display) => {
                display
                    .display_id()
                    .map(|display_id| Self::UpdateDisplayData {
                        data: display.data.clone(),
                        metadata: display.metadata.clone(),
                        display_id: display_id.to_owned(),
                    })
            }
            MessageContent::ExecuteResult(result) => Some(Self::ExecuteResult {
                data: result.data.clone(),
                metadata: result.metadata.clone(),
                execution_count: result.execution_count,
            }),
            MessageContent::Error(error) => Some(Self::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            }),
            _ => None,
        }
    }

    pub fn stream(name: StreamName, text: impl Into<String>) -> Self {
        Self::Stream {
            name,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{DisplayData, StatusContent, Transient};
    use crate::status::ExecutionState;
    use serde_json::json;

    #[test]
    fn update_without_display_id_is_not_an_event() {
        let content = MessageContent::UpdateDisplayData(DisplayData {
            data: MimeBundle::new(),
            metadata: Metadata::new(),
            transient: Transient::default(),
        });
        assert_eq!(OutputEvent::from_content(&content), None);
    }

    #[test]
    fn status_is_not_output() {
        let content = MessageContent::Status(StatusContent {
            execution_state: ExecutionState::Busy,
        });
        assert!(!content.is_output());
        assert_eq!(OutputEvent::from_content(&content), None);
    }

    #[test]
    fn output_serializes_with_output_type_tag() {
        let output = Output::Stream {
            name: StreamName::Stderr,
            text: "oops".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({ "output_type": "stream", "name": "stderr", "text": "oops" })
        );
    }
}
