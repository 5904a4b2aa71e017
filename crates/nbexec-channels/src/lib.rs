//! # nbexec-channels — in-process kernel plumbing
//!
//! [`MessageHub`] fans inbound kernel messages out to every observer.
//! [`InMemoryTransport`] and its [`KernelEndpoint`] form a connected
//! client/kernel pair without any sockets, for tests and in-process kernels.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use nbexec_protocol::{
    ChannelKind, ExecutionState, JupyterMessage, KernelTransport, MessageContent, MessageFactory,
    MessageStream, SessionId, StatusContent, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument};

/// Fan-out of inbound kernel messages to any number of observers.
///
/// Every subscriber owns an unbounded queue, so a slow subscriber never
/// loses messages and never holds back the others. All subscribers see the
/// same arrival order. Closing the hub ends every subscription after it
/// drains what was already published.
#[derive(Debug)]
pub struct MessageHub {
    subscribers: Mutex<Option<Vec<UnboundedSender<JupyterMessage>>>>,
}

impl Default for MessageHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Publish to current subscribers. Returns `false` once closed.
    pub fn publish(&self, message: JupyterMessage) -> bool {
        // Held across the sends so concurrent publishers keep one order.
        let mut subscribers = self.subscribers.lock();
        let Some(subscribers) = subscribers.as_mut() else {
            return false;
        };
        subscribers.retain(|subscriber| subscriber.send(message.clone()).is_ok());
        true
    }

    pub fn subscribe(&self) -> MessageStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.lock().as_mut() {
            Some(subscribers) => subscribers.push(sender),
            None => return stream::empty().boxed(),
        }
        UnboundedReceiverStream::new(receiver).boxed()
    }

    pub fn close(&self) {
        if self.subscribers.lock().take().is_some() {
            debug!("message hub closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().is_none()
    }

    /// Subscriptions still being fed.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug)]
struct Outbound {
    shell: UnboundedSender<JupyterMessage>,
    control: UnboundedSender<JupyterMessage>,
    stdin: UnboundedSender<JupyterMessage>,
}

type OutboundSlot = Arc<Mutex<Option<Outbound>>>;

/// Stream an outgoing message is written to.
///
/// Comm and unknown messages default to shell. Nothing is ever sent on
/// iopub, which is kernel-to-client only.
pub fn outbound_channel(content: &MessageContent) -> Result<ChannelKind, TransportError> {
    match content.expected_channel() {
        Some(ChannelKind::IoPub) => Err(TransportError::ChannelUnavailable(ChannelKind::IoPub)),
        Some(channel) => Ok(channel),
        None => Ok(ChannelKind::Shell),
    }
}

/// In-process duplex transport.
///
/// Client side of a connection whose kernel side is a [`KernelEndpoint`].
/// Outbound messages go into one unbounded queue per channel, so per-channel
/// order is call order; inbound messages go through a [`MessageHub`].
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    outbound: OutboundSlot,
    inbound: Arc<MessageHub>,
}

impl InMemoryTransport {
    /// Create a connected transport/endpoint pair.
    pub fn pair() -> (Self, KernelEndpoint) {
        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(Mutex::new(Some(Outbound {
            shell: shell_tx,
            control: control_tx,
            stdin: stdin_tx,
        })));
        let inbound = Arc::new(MessageHub::new());

        let transport = Self {
            outbound: outbound.clone(),
            inbound: inbound.clone(),
        };
        let endpoint = KernelEndpoint {
            shell: shell_rx,
            control: control_rx,
            stdin: stdin_rx,
            outbound,
            inbound,
            factory: MessageFactory::new(SessionId::new_uuid(), "kernel"),
        };
        (transport, endpoint)
    }
}

impl KernelTransport for InMemoryTransport {
    #[instrument(skip(self, message), fields(msg_type = %message.msg_type(), msg_id = %message.msg_id()))]
    fn send(&self, message: JupyterMessage) -> Result<(), TransportError> {
        let channel = outbound_channel(&message.content)?;
        let guard = self.outbound.lock();
        let outbound = guard.as_ref().ok_or(TransportError::Closed)?;
        let sender = match channel {
            ChannelKind::Control => &outbound.control,
            ChannelKind::Stdin => &outbound.stdin,
            _ => &outbound.shell,
        };
        sender
            .send(message.with_channel(channel))
            .map_err(|_| TransportError::Closed)?;
        debug!(%channel, "message sent");
        Ok(())
    }

    fn observe(&self) -> MessageStream {
        self.inbound.subscribe()
    }

    fn close(&self) {
        self.outbound.lock().take();
        self.inbound.close();
    }
}

/// Kernel side of an [`InMemoryTransport`].
///
/// Receives what the client sends and publishes replies and broadcasts.
/// Used by tests and by in-process kernels.
#[derive(Debug)]
pub struct KernelEndpoint {
    shell: UnboundedReceiver<JupyterMessage>,
    control: UnboundedReceiver<JupyterMessage>,
    stdin: UnboundedReceiver<JupyterMessage>,
    outbound: OutboundSlot,
    inbound: Arc<MessageHub>,
    factory: MessageFactory,
}

impl KernelEndpoint {
    pub fn factory(&self) -> &MessageFactory {
        &self.factory
    }

    /// Next message the client sent on `channel`. `None` once the client
    /// side is closed and drained, and always for iopub.
    pub async fn recv(&mut self, channel: ChannelKind) -> Option<JupyterMessage> {
        match channel {
            ChannelKind::Shell => self.shell.recv().await,
            ChannelKind::Control => self.control.recv().await,
            ChannelKind::Stdin => self.stdin.recv().await,
            ChannelKind::IoPub => None,
        }
    }

    pub fn try_recv(&mut self, channel: ChannelKind) -> Option<JupyterMessage> {
        match channel {
            ChannelKind::Shell => self.shell.try_recv().ok(),
            ChannelKind::Control => self.control.try_recv().ok(),
            ChannelKind::Stdin => self.stdin.try_recv().ok(),
            ChannelKind::IoPub => None,
        }
    }

    /// Next message on any client channel, control first.
    pub async fn next_request(&mut self) -> Option<JupyterMessage> {
        tokio::select! {
            biased;
            Some(message) = self.control.recv() => Some(message),
            Some(message) = self.shell.recv() => Some(message),
            Some(message) = self.stdin.recv() => Some(message),
            else => None,
        }
    }

    /// Deliver `message` to every client observer as arriving on `channel`.
    pub fn publish(&self, channel: ChannelKind, message: JupyterMessage) -> bool {
        self.inbound.publish(message.with_channel(channel))
    }

    /// Publish `content` caused by `parent`.
    pub fn reply(
        &self,
        channel: ChannelKind,
        parent: &JupyterMessage,
        content: MessageContent,
    ) -> bool {
        self.publish(channel, self.factory.reply(parent, content))
    }

    /// Publish an iopub `status` report.
    pub fn status(&self, parent: Option<&JupyterMessage>, execution_state: ExecutionState) -> bool {
        let content = MessageContent::Status(StatusContent { execution_state });
        let message = self
            .factory
            .message(content, parent.map(|parent| &parent.header));
        self.publish(ChannelKind::IoPub, message)
    }

    /// Simulate transport loss: observers end, sends fail.
    pub fn sever(&self) {
        self.outbound.lock().take();
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use futures_util::StreamExt;
    use nbexec_protocol::{
        ChannelKind, ExecuteOptions, ExecuteReply, ExecutionState, KernelTransport,
        MessageContent, MessageFactory, SessionId, TransportError,
    };
    use tokio::time::timeout;

    use super::{InMemoryTransport, MessageHub};

    fn factory() -> MessageFactory {
        MessageFactory::new(SessionId::from_string("client"), "tester")
    }

    #[tokio::test]
    async fn hub_subscribers_are_independent() -> Result<()> {
        let hub = MessageHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let factory = factory();

        let a = factory.interrupt_request();
        let b = factory.kernel_info_request();
        assert!(hub.publish(a.clone()));
        assert!(hub.publish(b.clone()));

        assert_eq!(first.next().await, Some(a.clone()));
        assert_eq!(first.next().await, Some(b.clone()));
        assert_eq!(second.next().await, Some(a));
        assert_eq!(second.next().await, Some(b));
        Ok(())
    }

    #[tokio::test]
    async fn closing_hub_drains_then_ends_subscriptions() -> Result<()> {
        let hub = MessageHub::new();
        let mut observer = hub.subscribe();
        let message = factory().interrupt_request();
        hub.publish(message.clone());
        hub.close();

        assert_eq!(observer.next().await, Some(message));
        assert_eq!(observer.next().await, None);
        assert!(!hub.publish(factory().interrupt_request()));
        assert_eq!(hub.subscribe().next().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_loses_nothing() -> Result<()> {
        let hub = MessageHub::new();
        let mut slow = hub.subscribe();
        let factory = factory();
        let sent: Vec<_> = (0..5_000)
            .map(|_| {
                let message = factory.interrupt_request();
                assert!(hub.publish(message.clone()));
                message.msg_id().clone()
            })
            .collect();
        hub.close();

        let mut received = Vec::with_capacity(sent.len());
        while let Some(message) = slow.next().await {
            received.push(message.msg_id().clone());
        }
        assert_eq!(received, sent);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_publish() -> Result<()> {
        let hub = MessageHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(factory().interrupt_request());
        assert_eq!(hub.subscriber_count(), 1);
        drop(kept);
        hub.publish(factory().interrupt_request());
        assert_eq!(hub.subscriber_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn transport_routes_by_message_type() -> Result<()> {
        let (transport, mut endpoint) = InMemoryTransport::pair();
        let factory = factory();

        let execute = factory.execute_request("1", &ExecuteOptions::default())?;
        let interrupt = factory.interrupt_request();
        let input = factory.input_reply(&execute.header, "answer");
        transport.send(execute.clone())?;
        transport.send(interrupt.clone())?;
        transport.send(input.clone())?;

        let shell = endpoint.try_recv(ChannelKind::Shell).expect("shell message");
        assert_eq!(shell.msg_id(), execute.msg_id());
        assert_eq!(shell.channel, Some(ChannelKind::Shell));
        let control = endpoint
            .try_recv(ChannelKind::Control)
            .expect("control message");
        assert_eq!(control.msg_id(), interrupt.msg_id());
        let stdin = endpoint.try_recv(ChannelKind::Stdin).expect("stdin message");
        assert_eq!(stdin.msg_id(), input.msg_id());
        Ok(())
    }

    #[tokio::test]
    async fn per_channel_order_matches_call_order() -> Result<()> {
        let (transport, mut endpoint) = InMemoryTransport::pair();
        let factory = factory();
        let mut sent = Vec::new();
        for index in 0..5 {
            let message = factory.execute_request(format!("x = {index}"), &ExecuteOptions::default())?;
            sent.push(message.msg_id().clone());
            transport.send(message)?;
        }
        let mut received = Vec::new();
        while let Some(message) = endpoint.try_recv(ChannelKind::Shell) {
            received.push(message.msg_id().clone());
        }
        assert_eq!(received, sent);
        Ok(())
    }

    #[tokio::test]
    async fn iopub_is_not_sendable() -> Result<()> {
        let (transport, endpoint) = InMemoryTransport::pair();
        let status = endpoint.factory().message(
            MessageContent::Status(nbexec_protocol::StatusContent {
                execution_state: ExecutionState::Idle,
            }),
            None,
        );
        assert_eq!(
            transport.send(status),
            Err(TransportError::ChannelUnavailable(ChannelKind::IoPub))
        );
        Ok(())
    }

    #[tokio::test]
    async fn observers_see_interleaved_channels_in_arrival_order() -> Result<()> {
        let (transport, endpoint) = InMemoryTransport::pair();
        let mut observer = transport.observe();
        let request = factory().execute_request("1", &ExecuteOptions::default())?;

        endpoint.status(Some(&request), ExecutionState::Busy);
        endpoint.reply(
            ChannelKind::Shell,
            &request,
            MessageContent::ExecuteReply(ExecuteReply::ok(Some(1))),
        );
        endpoint.status(Some(&request), ExecutionState::Idle);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let message = timeout(Duration::from_secs(1), observer.next())
                .await?
                .expect("message");
            seen.push((message.msg_type().to_owned(), message.channel));
        }
        assert_eq!(
            seen,
            vec![
                ("status".to_owned(), Some(ChannelKind::IoPub)),
                ("execute_reply".to_owned(), Some(ChannelKind::Shell)),
                ("status".to_owned(), Some(ChannelKind::IoPub)),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn severed_transport_fails_sends_and_ends_observers() -> Result<()> {
        let (transport, mut endpoint) = InMemoryTransport::pair();
        let mut observer = transport.observe();
        endpoint.sever();

        assert_eq!(observer.next().await, None);
        assert_eq!(
            transport.send(factory().interrupt_request()),
            Err(TransportError::Closed)
        );
        assert_eq!(endpoint.next_request().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn close_from_client_side_ends_endpoint_queues() -> Result<()> {
        let (transport, mut endpoint) = InMemoryTransport::pair();
        transport.send(factory().kernel_info_request())?;
        transport.close();

        let drained = endpoint.next_request().await.expect("queued message");
        assert_eq!(drained.msg_type(), "kernel_info_request");
        assert_eq!(endpoint.next_request().await, None);
        assert_eq!(transport.observe().next().await, None);
        Ok(())
    }
}
