//! Per-request view over the interleaved inbound stream.

use futures_util::StreamExt;
use nbexec_protocol::{JupyterMessage, MessageContent, MessageId, MessageStream};
use tracing::debug;

/// Messages caused by `request_id`, in arrival order.
///
/// Keeps only messages whose parent is the request, skips those that arrived
/// on the wrong channel for their type, and ends right after the request's
/// own terminal reply. Also ends when `messages` ends. The caller must create
/// `messages` before sending the request or early replies are lost.
pub fn correlate(messages: MessageStream, request_id: MessageId) -> MessageStream {
    async_stream::stream! {
        let mut messages = messages;
        while let Some(message) = messages.next().await {
            if !message.is_reply_to(&request_id) {
                continue;
            }
            if let Err(violation) = message.check_channel() {
                debug!(%request_id, %violation, "correlated message skipped");
                continue;
            }
            let terminal = is_terminal_reply(&message);
            yield message;
            if terminal {
                break;
            }
        }
    }
    .boxed()
}

/// Replies that close a request: nothing correlated follows them.
pub fn is_terminal_reply(message: &JupyterMessage) -> bool {
    matches!(
        message.content,
        MessageContent::ExecuteReply(_)
            | MessageContent::KernelInfoReply(_)
            | MessageContent::InterruptReply(_)
            | MessageContent::ShutdownReply(_)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use futures_util::StreamExt;
    use nbexec_channels::InMemoryTransport;
    use nbexec_protocol::{
        ChannelKind, ExecuteOptions, ExecuteReply, ExecutionState, KernelTransport,
        MessageContent, MessageFactory, SessionId, StreamContent, StreamName,
    };
    use tokio::time::timeout;

    use super::correlate;

    fn factory() -> MessageFactory {
        MessageFactory::new(SessionId::from_string("client"), "tester")
    }

    fn stdout(text: &str) -> MessageContent {
        MessageContent::Stream(StreamContent {
            name: StreamName::Stdout,
            text: text.to_owned(),
        })
    }

    fn texts(messages: &[nbexec_protocol::JupyterMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|message| match &message.content {
                MessageContent::Stream(stream) => Some(stream.text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn interleaved_requests_stay_isolated() -> Result<()> {
        let (transport, endpoint) = InMemoryTransport::pair();
        let factory = factory();
        let a = factory.execute_request("a", &ExecuteOptions::default())?;
        let b = factory.execute_request("b", &ExecuteOptions::default())?;
        let for_a = correlate(transport.observe(), a.msg_id().clone());
        let for_b = correlate(transport.observe(), b.msg_id().clone());

        endpoint.reply(ChannelKind::IoPub, &a, stdout("a1"));
        endpoint.reply(ChannelKind::IoPub, &b, stdout("b1"));
        endpoint.reply(ChannelKind::IoPub, &a, stdout("a2"));
        endpoint.reply(
            ChannelKind::Shell,
            &b,
            MessageContent::ExecuteReply(ExecuteReply::ok(Some(2))),
        );
        endpoint.reply(
            ChannelKind::Shell,
            &a,
            MessageContent::ExecuteReply(ExecuteReply::ok(Some(1))),
        );

        let seen_a: Vec<_> = timeout(Duration::from_secs(1), for_a.collect()).await?;
        let seen_b: Vec<_> = timeout(Duration::from_secs(1), for_b.collect()).await?;
        assert_eq!(texts(&seen_a), vec!["a1", "a2"]);
        assert_eq!(texts(&seen_b), vec!["b1"]);
        assert!(seen_a.iter().all(|message| message.is_reply_to(a.msg_id())));
        assert_eq!(seen_b.last().map(|message| message.msg_type()), Some("execute_reply"));
        Ok(())
    }

    #[tokio::test]
    async fn ends_after_own_reply() -> Result<()> {
        let (transport, endpoint) = InMemoryTransport::pair();
        let request = factory().execute_request("x", &ExecuteOptions::default())?;
        let mut correlated = correlate(transport.observe(), request.msg_id().clone());

        endpoint.reply(
            ChannelKind::Shell,
            &request,
            MessageContent::ExecuteReply(ExecuteReply::ok(Some(1))),
        );
        endpoint.status(Some(&request), ExecutionState::Idle);

        let reply = correlated.next().await.expect("reply");
        assert_eq!(reply.msg_type(), "execute_reply");
        assert_eq!(correlated.next().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_channel_and_unparented_messages_are_skipped() -> Result<()> {
        let (transport, endpoint) = InMemoryTransport::pair();
        let request = factory().execute_request("x", &ExecuteOptions::default())?;
        let mut correlated = correlate(transport.observe(), request.msg_id().clone());

        endpoint.status(None, ExecutionState::Busy);
        endpoint.reply(ChannelKind::Shell, &request, stdout("misplaced"));
        endpoint.reply(ChannelKind::IoPub, &request, stdout("placed"));

        let message = timeout(Duration::from_secs(1), correlated.next())
            .await?
            .expect("message");
        assert_eq!(texts(&[message]), vec!["placed"]);
        Ok(())
    }

    #[tokio::test]
    async fn ends_when_transport_is_severed() -> Result<()> {
        let (transport, endpoint) = InMemoryTransport::pair();
        let request = factory().execute_request("x", &ExecuteOptions::default())?;
        let mut correlated = correlate(transport.observe(), request.msg_id().clone());

        endpoint.reply(ChannelKind::IoPub, &request, stdout("partial"));
        endpoint.sever();

        assert!(correlated.next().await.is_some());
        assert_eq!(correlated.next().await, None);
        Ok(())
    }
}
