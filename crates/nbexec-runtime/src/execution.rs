//! One cell execution: its event stream, its handle, and the task that
//! drives it.

use std::sync::Arc;

use futures_util::StreamExt;
use nbexec_outputs::OutputArea;
use nbexec_protocol::{
    CancelReason, CellId, ExecuteReply, JupyterMessage, KernelError, KernelId, KernelResult,
    KernelTransport, MessageContent, MessageFactory, MessageId, MessageStream, Output,
    OutputEvent, ReplyStatus,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::session::Command;

/// Progress of one execution, in order. Exactly one [`ExecutionEvent::Finished`]
/// is emitted and it is always last.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Waiting behind `position` other executions.
    Queued { position: usize },
    /// Request sent to the kernel.
    Started,
    /// The kernel announced the counter for this execution.
    ExecutionCount(u32),
    /// Current output list after a change.
    Outputs(Vec<Output>),
    /// The kernel is blocked on user input; answer with
    /// [`ExecutionHandle::reply_input`].
    InputRequested { prompt: String, password: bool },
    Finished(ExecutionOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed { execution_count: Option<u32> },
    Failed(KernelError),
    Cancelled(CancelReason),
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// The outcome as a result: completion is `Ok`, everything else an error.
    pub fn into_result(self) -> KernelResult<Option<u32>> {
        match self {
            Self::Completed { execution_count } => Ok(execution_count),
            Self::Failed(error) => Err(error),
            Self::Cancelled(reason) => Err(KernelError::Cancelled { reason }),
        }
    }

    fn from_reply(reply: ExecuteReply) -> Self {
        match reply.status {
            ReplyStatus::Ok => Self::Completed {
                execution_count: reply.execution_count,
            },
            ReplyStatus::Error => Self::Failed(KernelError::ExecutionFailed {
                ename: reply.ename.unwrap_or_default(),
                evalue: reply.evalue.unwrap_or_default(),
                traceback: reply.traceback,
            }),
            ReplyStatus::Aborted => Self::Failed(KernelError::ExecutionAborted),
        }
    }
}

/// Everything an execution produced, collected by [`ExecutionHandle::wait`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub request_id: MessageId,
    pub cell_id: CellId,
    pub execution_count: Option<u32>,
    pub outputs: Vec<Output>,
    pub outcome: ExecutionOutcome,
}

/// Caller side of one submitted execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    kernel_id: KernelId,
    request_id: MessageId,
    cell_id: CellId,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
    input: mpsc::UnboundedSender<String>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        kernel_id: KernelId,
        accepted: Accepted,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            kernel_id,
            request_id: accepted.request_id,
            cell_id: accepted.cell_id,
            events: accepted.events,
            input: accepted.input,
            commands,
        }
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    /// Id of the `execute_request`.
    pub fn request_id(&self) -> &MessageId {
        &self.request_id
    }

    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    /// Next event; `None` after [`ExecutionEvent::Finished`].
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Answer a pending input request.
    pub fn reply_input(&self, value: impl Into<String>) -> KernelResult<()> {
        self.input
            .send(value.into())
            .map_err(|_| KernelError::UnknownRequest(self.request_id.clone()))
    }

    /// Stop tracking this execution. Nothing is sent to the kernel; a
    /// running execution keeps running there.
    pub fn cancel(&self) -> KernelResult<()> {
        self.commands
            .send(Command::Cancel {
                request_id: self.request_id.clone(),
                reason: CancelReason::UserCancelled,
            })
            .map_err(|_| KernelError::KernelUnavailable(self.kernel_id.clone()))
    }

    /// Drain events until the execution finishes.
    pub async fn wait(mut self) -> ExecutionSummary {
        let mut execution_count = None;
        let mut outputs = Vec::new();
        let mut outcome = ExecutionOutcome::Failed(KernelError::SessionStopped);
        while let Some(event) = self.events.recv().await {
            match event {
                ExecutionEvent::ExecutionCount(count) => execution_count = Some(count),
                ExecutionEvent::Outputs(current) => outputs = current,
                ExecutionEvent::Finished(finished) => {
                    outcome = finished;
                    break;
                }
                _ => {}
            }
        }
        if let ExecutionOutcome::Completed {
            execution_count: Some(count),
        } = &outcome
        {
            execution_count = Some(*count);
        }
        ExecutionSummary {
            request_id: self.request_id,
            cell_id: self.cell_id,
            execution_count,
            outputs,
            outcome,
        }
    }

    /// Events as a stream. Input replies and cancellation are no longer
    /// possible through this handle.
    pub fn into_stream(self) -> UnboundedReceiverStream<ExecutionEvent> {
        UnboundedReceiverStream::new(self.events)
    }
}

/// Caller parts of a freshly accepted execution.
#[derive(Debug)]
pub(crate) struct Accepted {
    pub request_id: MessageId,
    pub cell_id: CellId,
    pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
    pub input: mpsc::UnboundedSender<String>,
}

/// Delivered once by the session when the execution leaves the queue.
pub(crate) enum Activation {
    /// Request sent; the stream is already correlated to it.
    Started(MessageStream),
    Failed(KernelError),
}

pub(crate) type CancelSignal = watch::Sender<Option<CancelReason>>;

/// Drives one execution from queue to terminal event.
///
/// The session owns scheduling and the kernel status; this task owns the
/// execution's outputs and its event stream. The two meet at the activation
/// and cancel signals.
pub(crate) struct ExecutionTask {
    request_id: MessageId,
    cell_id: CellId,
    events: mpsc::UnboundedSender<ExecutionEvent>,
    input: mpsc::UnboundedReceiver<String>,
    activation: oneshot::Receiver<Activation>,
    cancel: watch::Receiver<Option<CancelReason>>,
    cancel_open: bool,
    transport: Arc<dyn KernelTransport>,
    factory: MessageFactory,
}

/// Session-side ends of an execution.
pub(crate) struct TaskControl {
    pub activation: oneshot::Sender<Activation>,
    pub cancel: CancelSignal,
    pub events: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ExecutionTask {
    pub(crate) fn new(
        request_id: MessageId,
        cell_id: CellId,
        transport: Arc<dyn KernelTransport>,
        factory: MessageFactory,
    ) -> (Self, TaskControl, Accepted) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (activation_tx, activation_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(None);

        let task = Self {
            request_id: request_id.clone(),
            cell_id: cell_id.clone(),
            events: events_tx.clone(),
            input: input_rx,
            activation: activation_rx,
            cancel: cancel_rx,
            cancel_open: true,
            transport,
            factory,
        };
        let control = TaskControl {
            activation: activation_tx,
            cancel: cancel_tx,
            events: events_tx,
        };
        let accepted = Accepted {
            request_id,
            cell_id,
            events: events_rx,
            input: input_tx,
        };
        (task, control, accepted)
    }

    pub(crate) async fn run(mut self) {
        let outcome = self.drive().await;
        info!(
            request_id = %self.request_id,
            cell_id = %self.cell_id,
            outcome = ?outcome,
            "execution finished"
        );
        self.emit(ExecutionEvent::Finished(outcome));
    }

    async fn drive(&mut self) -> ExecutionOutcome {
        let activation = tokio::select! {
            biased;
            reason = cancellation(&mut self.cancel) => {
                return ExecutionOutcome::Cancelled(reason.unwrap_or(CancelReason::KernelShutdown));
            }
            activation = &mut self.activation => activation,
        };
        let mut messages = match activation {
            Ok(Activation::Started(messages)) => messages,
            Ok(Activation::Failed(error)) => return ExecutionOutcome::Failed(error),
            Err(_) => return ExecutionOutcome::Cancelled(CancelReason::KernelShutdown),
        };
        self.emit(ExecutionEvent::Started);

        let mut area = OutputArea::new();
        loop {
            let next = tokio::select! {
                biased;
                reason = cancellation(&mut self.cancel), if self.cancel_open => match reason {
                    Some(reason) => return ExecutionOutcome::Cancelled(reason),
                    None => {
                        self.cancel_open = false;
                        continue;
                    }
                },
                next = messages.next() => next,
            };
            let Some(message) = next else {
                // Correlated stream ended without a reply: the session decides why.
                return self.await_verdict().await;
            };
            match &message.content {
                MessageContent::ExecuteReply(reply) => {
                    return ExecutionOutcome::from_reply(reply.clone());
                }
                MessageContent::ExecuteInput(input) => {
                    if let Some(count) = input.execution_count {
                        self.emit(ExecutionEvent::ExecutionCount(count));
                    }
                }
                MessageContent::InputRequest(request) => {
                    self.emit(ExecutionEvent::InputRequested {
                        prompt: request.prompt.clone(),
                        password: request.password,
                    });
                    if let Some(outcome) = self.answer_input(&message).await {
                        return outcome;
                    }
                }
                content => match OutputEvent::from_content(content) {
                    Some(event) => {
                        if area.apply(event).changed() {
                            self.emit(ExecutionEvent::Outputs(area.outputs().to_vec()));
                        }
                    }
                    None => debug!(
                        request_id = %self.request_id,
                        msg_type = message.msg_type(),
                        "correlated message ignored"
                    ),
                },
            }
        }
    }

    /// Wait for the caller's input and forward it. Stream polling is
    /// suspended meanwhile; cancellation is not.
    async fn answer_input(&mut self, request: &JupyterMessage) -> Option<ExecutionOutcome> {
        loop {
            tokio::select! {
                biased;
                reason = cancellation(&mut self.cancel), if self.cancel_open => match reason {
                    Some(reason) => return Some(ExecutionOutcome::Cancelled(reason)),
                    None => self.cancel_open = false,
                },
                value = self.input.recv() => {
                    let Some(value) = value else {
                        // Handle gone: the prompt stays unanswered until an interrupt.
                        return Some(self.await_verdict().await);
                    };
                    let reply = self.factory.input_reply(&request.header, value);
                    return match self.transport.send(reply) {
                        Ok(()) => None,
                        Err(error) => Some(ExecutionOutcome::Failed(error.into())),
                    };
                }
            }
        }
    }

    async fn await_verdict(&mut self) -> ExecutionOutcome {
        let reason = if self.cancel_open {
            cancellation(&mut self.cancel).await
        } else {
            None
        };
        if reason.is_none() {
            warn!(request_id = %self.request_id, "execution ended without reply");
        }
        ExecutionOutcome::Cancelled(reason.unwrap_or(CancelReason::KernelShutdown))
    }

    fn emit(&self, event: ExecutionEvent) {
        // A dropped handle means nobody is listening.
        let _ = self.events.send(event);
    }
}

/// Resolves with the cancel reason, or `None` once the session dropped the
/// signal without cancelling.
async fn cancellation(cancel: &mut watch::Receiver<Option<CancelReason>>) -> Option<CancelReason> {
    loop {
        if let Some(reason) = *cancel.borrow_and_update() {
            return Some(reason);
        }
        if cancel.changed().await.is_err() {
            return *cancel.borrow();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_status_maps_to_outcome() {
        assert_eq!(
            ExecutionOutcome::from_reply(ExecuteReply::ok(Some(3))),
            ExecutionOutcome::Completed {
                execution_count: Some(3)
            }
        );
        assert_eq!(
            ExecutionOutcome::from_reply(ExecuteReply::error(
                Some(4),
                "ZeroDivisionError",
                "division by zero",
                vec!["frame".to_owned()],
            )),
            ExecutionOutcome::Failed(KernelError::ExecutionFailed {
                ename: "ZeroDivisionError".to_owned(),
                evalue: "division by zero".to_owned(),
                traceback: vec!["frame".to_owned()],
            })
        );
        let aborted = ExecuteReply {
            status: ReplyStatus::Aborted,
            ..ExecuteReply::ok(None)
        };
        assert_eq!(
            ExecutionOutcome::from_reply(aborted),
            ExecutionOutcome::Failed(KernelError::ExecutionAborted)
        );
    }

    #[test]
    fn outcome_into_result() {
        assert_eq!(
            ExecutionOutcome::Completed {
                execution_count: Some(1)
            }
            .into_result(),
            Ok(Some(1))
        );
        assert_eq!(
            ExecutionOutcome::Cancelled(CancelReason::Interrupted).into_result(),
            Err(KernelError::Cancelled {
                reason: CancelReason::Interrupted
            })
        );
    }

    #[tokio::test]
    async fn cancellation_sees_a_reason_sent_before_polling() {
        let (sender, mut receiver) = watch::channel(None);
        sender.send_replace(Some(CancelReason::KernelRestarted));
        drop(sender);
        assert_eq!(
            cancellation(&mut receiver).await,
            Some(CancelReason::KernelRestarted)
        );
    }

    #[tokio::test]
    async fn cancellation_without_reason_yields_none() {
        let (sender, mut receiver) = watch::channel::<Option<CancelReason>>(None);
        drop(sender);
        assert_eq!(cancellation(&mut receiver).await, None);
    }
}
