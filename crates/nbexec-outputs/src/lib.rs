//! Output aggregation.
//!
//! Folds kernel output events into a cell's ordered output list. Rules, in
//! priority order:
//!
//! 1. `update_display_data` replaces the bundle and metadata of every record
//!    carrying the same `display_id`, in place. With no match it is dropped.
//! 2. `stream` text is appended to the last record when that record is a
//!    stream with the same name.
//! 3. Anything else is appended.
//!
//! The fold is pure: no clock, no randomness. Folding a sequence in one call
//! or across several calls yields the same list.

use nbexec_protocol::{Output, OutputEvent};
use tracing::debug;

/// What a single [`append_output`] did to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Appended,
    Coalesced,
    /// Indices of the records an update replaced.
    Updated(Vec<usize>),
    /// Update with no matching display id.
    Dropped,
}

impl Applied {
    /// Whether the list changed.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// Apply one event to `outputs` in place.
pub fn append_output(outputs: &mut Vec<Output>, event: OutputEvent) -> Applied {
    match event {
        OutputEvent::UpdateDisplayData {
            data,
            metadata,
            display_id,
        } => {
            let mut updated = Vec::new();
            for (index, output) in outputs.iter_mut().enumerate() {
                if let Output::DisplayData {
                    data: current_data,
                    metadata: current_metadata,
                    display_id: Some(current_id),
                } = output
                    && *current_id == display_id
                {
                    *current_data = data.clone();
                    *current_metadata = metadata.clone();
                    updated.push(index);
                }
            }
            if updated.is_empty() {
                debug!(%display_id, "update_display_data without matching display dropped");
                Applied::Dropped
            } else {
                Applied::Updated(updated)
            }
        }
        OutputEvent::Stream { name, text } => {
            if let Some(Output::Stream {
                name: last_name,
                text: last_text,
            }) = outputs.last_mut()
                && *last_name == name
            {
                last_text.push_str(&text);
                return Applied::Coalesced;
            }
            outputs.push(Output::Stream { name, text });
            Applied::Appended
        }
        OutputEvent::DisplayData {
            data,
            metadata,
            display_id,
        } => {
            outputs.push(Output::DisplayData {
                data,
                metadata,
                display_id,
            });
            Applied::Appended
        }
        OutputEvent::ExecuteResult {
            data,
            metadata,
            execution_count,
        } => {
            outputs.push(Output::ExecuteResult {
                data,
                metadata,
                execution_count,
            });
            Applied::Appended
        }
        OutputEvent::Error {
            ename,
            evalue,
            traceback,
        } => {
            outputs.push(Output::Error {
                ename,
                evalue,
                traceback,
            });
            Applied::Appended
        }
    }
}

/// Fold `events` onto `outputs` and return the resulting list.
pub fn fold_outputs(
    mut outputs: Vec<Output>,
    events: impl IntoIterator<Item = OutputEvent>,
) -> Vec<Output> {
    for event in events {
        append_output(&mut outputs, event);
    }
    outputs
}

/// Output list of one cell execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputArea {
    outputs: Vec<Output>,
}

impl OutputArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_outputs(outputs: Vec<Output>) -> Self {
        Self { outputs }
    }

    pub fn apply(&mut self, event: OutputEvent) -> Applied {
        append_output(&mut self.outputs, event)
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn into_outputs(self) -> Vec<Output> {
        self.outputs
    }
}
