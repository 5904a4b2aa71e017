//! Per-kernel session.
//!
//! A single task owns the kernel's lifecycle, its queue of pending
//! executions, and the record of finished request ids. Callers talk to it
//! through a [`KernelHandle`]; inbound kernel messages arrive on the
//! session's own subscription. Only the session task ever mutates that
//! state, so the kernel status changes atomically with the registry.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use indexmap::IndexSet;
use nbexec_protocol::{
    CancelReason, CellId, ExecutionState, JupyterMessage, KernelError, KernelId,
    KernelInfoReply, KernelResult, KernelStatus, KernelTransport, MessageContent, MessageFactory,
    MessageId, MessageStream,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::correlator::correlate;
use crate::execution::{
    Accepted, Activation, CancelSignal, ExecutionEvent, ExecutionHandle, ExecutionTask,
    TaskControl,
};
use crate::lifecycle::{Lifecycle, Transition};

/// Observable state of one kernel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelSnapshot {
    pub status: KernelStatus,
    /// Last counter reported by the kernel; reset by a restart.
    pub execution_count: Option<u32>,
    pub kernel_info: Option<KernelInfoReply>,
    /// Execution currently running on the kernel.
    pub active: Option<MessageId>,
    /// Executions waiting behind the active one.
    pub queued: usize,
}

#[derive(Debug)]
pub(crate) enum Command {
    Execute {
        cell_id: CellId,
        source: String,
        reply: oneshot::Sender<KernelResult<Accepted>>,
    },
    Cancel {
        request_id: MessageId,
        reason: CancelReason,
    },
    Interrupt {
        reply: oneshot::Sender<KernelResult<()>>,
    },
    Restart {
        reply: oneshot::Sender<KernelResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<KernelResult<()>>,
    },
}

/// Caller side of a kernel session. Cheap to clone.
#[derive(Clone)]
pub struct KernelHandle {
    kernel_id: KernelId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<KernelSnapshot>,
    transport: Arc<dyn KernelTransport>,
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("kernel_id", &self.kernel_id)
            .field("status", &self.status())
            .finish()
    }
}

impl KernelHandle {
    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    /// Submit `source` for execution in `cell_id`.
    ///
    /// Fails at once with `KernelUnavailable` when the kernel is dead, and
    /// with a protocol error when the source is blank. Otherwise the
    /// execution is queued and runs after every earlier submission.
    #[instrument(skip_all, fields(kernel_id = %self.kernel_id))]
    pub async fn execute(
        &self,
        cell_id: impl Into<CellId>,
        source: impl Into<String>,
    ) -> KernelResult<ExecutionHandle> {
        if self.status().is_dead() {
            return Err(self.unavailable());
        }
        let (reply, accepted) = oneshot::channel();
        self.send(Command::Execute {
            cell_id: cell_id.into(),
            source: source.into(),
            reply,
        })?;
        let accepted = accepted.await.map_err(|_| self.unavailable())??;
        Ok(ExecutionHandle::new(
            self.kernel_id.clone(),
            accepted,
            self.commands.clone(),
        ))
    }

    /// Ask the kernel to interrupt the running execution.
    pub async fn interrupt(&self) -> KernelResult<()> {
        self.request(|reply| Command::Interrupt { reply }).await
    }

    /// Cancel every pending execution and restart the kernel.
    pub async fn restart(&self) -> KernelResult<()> {
        self.request(|reply| Command::Restart { reply }).await
    }

    /// Cancel every pending execution, shut the kernel down, and close the
    /// transport.
    pub async fn shutdown(&self) -> KernelResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn status(&self) -> KernelStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn execution_count(&self) -> Option<u32> {
        self.snapshot.borrow().execution_count
    }

    pub fn kernel_info(&self) -> Option<KernelInfoReply> {
        self.snapshot.borrow().kernel_info.clone()
    }

    /// Receiver that observes every snapshot change.
    pub fn watch_status(&self) -> watch::Receiver<KernelSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the kernel reaches `status`. Fails if it dies first.
    pub async fn wait_for_status(&self, status: KernelStatus) -> KernelResult<()> {
        let mut snapshot = self.snapshot.clone();
        let reached = snapshot
            .wait_for(|current| current.status == status || current.status.is_dead())
            .await
            .map_err(|_| self.unavailable())?
            .status;
        if reached == status {
            Ok(())
        } else {
            Err(self.unavailable())
        }
    }

    /// Raw subscription to every inbound message, uncorrelated.
    pub fn subscribe(&self) -> MessageStream {
        self.transport.observe()
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<KernelResult<()>>) -> Command,
    ) -> KernelResult<()> {
        let (reply, done) = oneshot::channel();
        self.send(command(reply))?;
        done.await.map_err(|_| self.unavailable())?
    }

    fn send(&self, command: Command) -> KernelResult<()> {
        self.commands.send(command).map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> KernelError {
        KernelError::KernelUnavailable(self.kernel_id.clone())
    }
}

struct QueuedExecution {
    request: JupyterMessage,
    cell_id: CellId,
    submitted_at: DateTime<Utc>,
    activation: oneshot::Sender<Activation>,
    cancel: CancelSignal,
}

struct ActiveExecution {
    request_id: MessageId,
    cell_id: CellId,
    started_at: DateTime<Utc>,
    cancel: CancelSignal,
}

struct PendingInterrupt {
    request_id: MessageId,
    /// Execution running when the interrupt was sent.
    target: Option<MessageId>,
}

/// Session task state.
pub struct KernelSession {
    kernel_id: KernelId,
    transport: Arc<dyn KernelTransport>,
    factory: MessageFactory,
    config: RuntimeConfig,
    lifecycle: Lifecycle,
    kernel_info: Option<KernelInfoReply>,
    active: Option<ActiveExecution>,
    queue: VecDeque<QueuedExecution>,
    interrupt: Option<PendingInterrupt>,
    restart_request: Option<MessageId>,
    /// Our requests that are no longer pending, oldest first.
    retired: IndexSet<MessageId>,
    snapshot: watch::Sender<KernelSnapshot>,
}

impl KernelSession {
    /// Attach to `transport` and start the session task. Must be called
    /// inside a Tokio runtime.
    #[instrument(skip_all, fields(kernel_id = %kernel_id))]
    pub fn spawn(
        kernel_id: KernelId,
        transport: Arc<dyn KernelTransport>,
        config: RuntimeConfig,
    ) -> KernelHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(KernelSnapshot::default());
        // Subscribe before anything is sent so no reply can be missed.
        let messages = transport.observe();

        let mut session = Self {
            kernel_id: kernel_id.clone(),
            transport: transport.clone(),
            factory: config.message_factory(),
            config,
            lifecycle: Lifecycle::new(),
            kernel_info: None,
            active: None,
            queue: VecDeque::new(),
            interrupt: None,
            restart_request: None,
            retired: IndexSet::new(),
            snapshot: snapshot_tx,
        };
        if let Ok(transition) = session.lifecycle.connect()
            && transition.changed()
        {
            session.probe_kernel_info();
        }
        session.publish_snapshot();
        info!("kernel session attached");
        tokio::spawn(session.run(commands_rx, messages));

        KernelHandle {
            kernel_id,
            commands: commands_tx,
            snapshot: snapshot_rx,
            transport,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut messages: MessageStream,
    ) {
        let mut observing = true;
        loop {
            tokio::select! {
                biased;
                message = messages.next(), if observing => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        observing = false;
                        self.transport_lost();
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
            self.publish_snapshot();
        }
        debug!(kernel_id = %self.kernel_id, "kernel session released");
    }

    /// Replies go out after the snapshot is published, so a caller sees the
    /// command's effect on the status as soon as it returns.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Execute {
                cell_id,
                source,
                reply,
            } => {
                let result = self.submit(cell_id, source);
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            Command::Cancel { request_id, reason } => self.cancel(&request_id, reason),
            Command::Interrupt { reply } => {
                let result = self.interrupt();
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            Command::Restart { reply } => {
                let result = self.restart();
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let result = self.shutdown();
                self.publish_snapshot();
                let _ = reply.send(result);
            }
        }
    }

    #[instrument(skip(self, source), fields(kernel_id = %self.kernel_id))]
    fn submit(&mut self, cell_id: CellId, source: String) -> KernelResult<Accepted> {
        if self.lifecycle.status().is_dead() {
            return Err(self.unavailable());
        }
        let request = self
            .factory
            .execute_request(source, &self.config.execute_options)?;
        let request_id = request.msg_id().clone();
        let (task, control, accepted) = ExecutionTask::new(
            request_id.clone(),
            cell_id.clone(),
            self.transport.clone(),
            self.factory.clone(),
        );
        tokio::spawn(task.run());

        let TaskControl {
            activation,
            cancel,
            events,
        } = control;
        self.queue.push_back(QueuedExecution {
            request,
            cell_id,
            submitted_at: Utc::now(),
            activation,
            cancel,
        });
        self.activate_next();

        if let Some(index) = self
            .queue
            .iter()
            .position(|queued| *queued.request.msg_id() == request_id)
        {
            let position = index + usize::from(self.active.is_some());
            info!(%request_id, position, "execution queued");
            let _ = events.send(ExecutionEvent::Queued { position });
        }
        Ok(accepted)
    }

    /// Start queued executions while the kernel is idle. A send failure
    /// fails that execution and moves on to the next one.
    fn activate_next(&mut self) {
        while self.active.is_none() && self.lifecycle.status() == KernelStatus::Idle {
            let Some(next) = self.queue.pop_front() else {
                return;
            };
            let request_id = next.request.msg_id().clone();
            if next.cancel.is_closed() {
                debug!(%request_id, "skipping execution whose task is gone");
                continue;
            }
            // Subscribe before sending; the correlated stream is handed to the task.
            let correlated = correlate(self.transport.observe(), request_id.clone());
            if let Err(error) = self.transport.send(next.request) {
                warn!(%request_id, %error, "execute_request could not be sent");
                self.retire(request_id);
                let _ = next.activation.send(Activation::Failed(error.into()));
                continue;
            }
            let _ = self.lifecycle.activate();
            info!(
                %request_id,
                cell_id = %next.cell_id,
                waited_ms = (Utc::now() - next.submitted_at).num_milliseconds(),
                "execution started"
            );
            let _ = next.activation.send(Activation::Started(correlated));
            self.active = Some(ActiveExecution {
                request_id,
                cell_id: next.cell_id,
                started_at: Utc::now(),
                cancel: next.cancel,
            });
        }
    }

    fn cancel(&mut self, request_id: &MessageId, reason: CancelReason) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.request_id == *request_id)
        {
            self.finish_active(Some(reason));
            self.activate_next();
            return;
        }
        if let Some(index) = self
            .queue
            .iter()
            .position(|queued| queued.request.msg_id() == request_id)
            && let Some(queued) = self.queue.remove(index)
        {
            info!(%request_id, %reason, "queued execution cancelled");
            let _ = queued.cancel.send(Some(reason));
            self.retire(request_id.clone());
            return;
        }
        debug!(%request_id, "cancel for execution that is no longer pending");
    }

    /// Drop the active execution, cancelling it when `reason` is given, and
    /// return the kernel to idle.
    fn finish_active(&mut self, reason: Option<CancelReason>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let elapsed_ms = (Utc::now() - active.started_at).num_milliseconds();
        match reason {
            Some(reason) => {
                info!(request_id = %active.request_id, cell_id = %active.cell_id, %reason, elapsed_ms, "active execution cancelled");
                let _ = active.cancel.send(Some(reason));
            }
            None => {
                debug!(request_id = %active.request_id, cell_id = %active.cell_id, elapsed_ms, "active execution replied");
            }
        }
        self.retire(active.request_id);
        if !self.lifecycle.status().is_dead() && self.lifecycle.status() != KernelStatus::Restarting
        {
            let _ = self.lifecycle.complete();
        }
    }

    /// Cancel the active execution and everything queued behind it.
    fn cancel_all(&mut self, reason: CancelReason) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(Some(reason));
            self.retire(active.request_id);
        }
        let cancelled = self.queue.len();
        for queued in std::mem::take(&mut self.queue) {
            let _ = queued.cancel.send(Some(reason));
            self.retire(queued.request.msg_id().clone());
        }
        if cancelled > 0 {
            info!(cancelled, %reason, "queued executions cancelled");
        }
        self.interrupt = None;
    }

    fn interrupt(&mut self) -> KernelResult<()> {
        let transition = self.guard_dead(|lifecycle| lifecycle.interrupt())?;
        if !transition.changed() {
            return Ok(());
        }
        let request = self.factory.interrupt_request();
        let request_id = request.msg_id().clone();
        if let Err(error) = self.transport.send(request) {
            let _ = self.lifecycle.acknowledge_interrupt(self.active.is_some());
            return Err(error.into());
        }
        info!(%request_id, "interrupt requested");
        self.retire(request_id.clone());
        self.interrupt = Some(PendingInterrupt {
            request_id,
            target: self.active.as_ref().map(|active| active.request_id.clone()),
        });
        Ok(())
    }

    fn restart(&mut self) -> KernelResult<()> {
        let transition = self.guard_dead(|lifecycle| lifecycle.restart())?;
        if !transition.changed() {
            return Ok(());
        }
        self.cancel_all(CancelReason::KernelRestarted);
        self.kernel_info = None;
        let request = self.factory.shutdown_request(true);
        let request_id = request.msg_id().clone();
        self.transport.send(request)?;
        info!(%request_id, "restart requested");
        self.retire(request_id.clone());
        self.restart_request = Some(request_id);
        Ok(())
    }

    fn shutdown(&mut self) -> KernelResult<()> {
        self.guard_dead(|lifecycle| lifecycle.shutdown())?;
        self.cancel_all(CancelReason::KernelShutdown);
        if let Err(error) = self.transport.send(self.factory.shutdown_request(false)) {
            warn!(%error, "shutdown_request could not be sent");
        }
        self.transport.close();
        info!("kernel shut down");
        Ok(())
    }

    /// Transport severed: the kernel is dead and nothing pending survives.
    fn transport_lost(&mut self) {
        if self.lifecycle.shutdown().is_ok() {
            warn!(kernel_id = %self.kernel_id, "kernel transport lost");
            self.cancel_all(CancelReason::KernelShutdown);
        }
    }

    fn handle_message(&mut self, message: JupyterMessage) {
        if self.lifecycle.status().is_dead() {
            return;
        }
        if let Err(violation) = message.check_channel() {
            warn!(%violation, "message dropped");
            return;
        }
        match &message.content {
            MessageContent::Status(status) => {
                // The old process reports on its own shutdown; only the reply ends a restart.
                if self.is_restart_request(message.parent_id()) {
                    debug!(state = ?status.execution_state, "status for restart request ignored");
                    return;
                }
                self.on_status(status.execution_state);
            }
            MessageContent::ExecuteInput(input) => {
                if let Some(count) = input.execution_count {
                    self.lifecycle.observe_execution_count(count);
                }
            }
            MessageContent::ExecuteReply(reply) => {
                if let Some(count) = reply.execution_count {
                    self.lifecycle.observe_execution_count(count);
                }
                if self.is_active(message.parent_id()) {
                    self.finish_active(None);
                    self.activate_next();
                    return;
                }
            }
            MessageContent::InterruptReply(_) => {
                if self
                    .interrupt
                    .as_ref()
                    .is_some_and(|pending| message.is_reply_to(&pending.request_id))
                {
                    self.on_interrupt_acknowledged();
                    return;
                }
            }
            MessageContent::ShutdownReply(reply) => {
                if reply.restart
                    && self
                        .restart_request
                        .as_ref()
                        .is_some_and(|request_id| message.is_reply_to(request_id))
                {
                    self.restart_request = None;
                    if let Ok(transition) = self.lifecycle.restarted()
                        && transition.changed()
                    {
                        self.probe_kernel_info();
                    }
                    return;
                }
            }
            MessageContent::KernelInfoReply(reply) => {
                if self.is_retired(message.parent_id()) {
                    self.kernel_info = Some(reply.clone());
                    return;
                }
            }
            _ => {}
        }
        self.check_parent(&message);
    }

    fn on_status(&mut self, state: ExecutionState) {
        match self.lifecycle.report_status(state) {
            Ok(Transition::Changed {
                from: KernelStatus::Restarting,
                ..
            }) => {
                self.restart_request = None;
                self.probe_kernel_info();
            }
            Ok(Transition::Changed {
                to: KernelStatus::Idle,
                ..
            }) => self.activate_next(),
            Ok(_) => {}
            Err(error) => debug!(%error, "status report ignored"),
        }
    }

    fn on_interrupt_acknowledged(&mut self) {
        let Some(pending) = self.interrupt.take() else {
            return;
        };
        info!(request_id = %pending.request_id, "interrupt acknowledged");
        if let Some(target) = pending.target
            && self.is_active(Some(&target))
        {
            self.finish_active(Some(CancelReason::Interrupted));
        } else {
            let _ = self.lifecycle.acknowledge_interrupt(self.active.is_some());
        }
        self.activate_next();
    }

    /// Warn about messages that claim one of our requests as parent but
    /// match nothing this session sent.
    fn check_parent(&self, message: &JupyterMessage) {
        let Some(parent) = &message.parent_header else {
            return;
        };
        if parent.session != *self.factory.session() {
            return;
        }
        if self.is_active(Some(&parent.msg_id))
            || self
                .queue
                .iter()
                .any(|queued| *queued.request.msg_id() == parent.msg_id)
        {
            return;
        }
        if self.is_retired(Some(&parent.msg_id)) {
            debug!(
                msg_type = message.msg_type(),
                parent = %parent.msg_id,
                "message for finished request dropped"
            );
            return;
        }
        let violation = KernelError::ProtocolViolation(format!(
            "{} {} references unknown request {}",
            message.msg_type(),
            message.msg_id(),
            parent.msg_id
        ));
        warn!(%violation, "message dropped");
    }

    fn probe_kernel_info(&mut self) {
        if !self.config.probe_kernel_info {
            return;
        }
        let request = self.factory.kernel_info_request();
        let request_id = request.msg_id().clone();
        match self.transport.send(request) {
            Ok(()) => {
                debug!(%request_id, "kernel_info_request sent");
                self.retire(request_id);
            }
            Err(error) => warn!(%error, "kernel_info_request could not be sent"),
        }
    }

    fn is_active(&self, request_id: Option<&MessageId>) -> bool {
        match (&self.active, request_id) {
            (Some(active), Some(request_id)) => active.request_id == *request_id,
            _ => false,
        }
    }

    fn is_restart_request(&self, request_id: Option<&MessageId>) -> bool {
        match (&self.restart_request, request_id) {
            (Some(restart), Some(request_id)) => restart == request_id,
            _ => false,
        }
    }

    fn is_retired(&self, request_id: Option<&MessageId>) -> bool {
        request_id.is_some_and(|request_id| self.retired.contains(request_id))
    }

    fn retire(&mut self, request_id: MessageId) {
        self.retired.insert(request_id);
        while self.retired.len() > self.config.retired_capacity.max(1) {
            self.retired.shift_remove_index(0);
        }
    }

    /// Run a lifecycle request, reporting transitions out of `dead` as an
    /// unavailable kernel.
    fn guard_dead(
        &mut self,
        request: impl FnOnce(&mut Lifecycle) -> KernelResult<Transition>,
    ) -> KernelResult<Transition> {
        if self.lifecycle.status().is_dead() {
            return Err(self.unavailable());
        }
        request(&mut self.lifecycle)
    }

    fn unavailable(&self) -> KernelError {
        KernelError::KernelUnavailable(self.kernel_id.clone())
    }

    fn publish_snapshot(&self) {
        let snapshot = KernelSnapshot {
            status: self.lifecycle.status(),
            execution_count: self.lifecycle.execution_count(),
            kernel_info: self.kernel_info.clone(),
            active: self.active.as_ref().map(|active| active.request_id.clone()),
            queued: self.queue.len(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
