//! In-process kernel speaking a tiny line language.
//!
//! Each line of a cell is one command:
//!
//! ```text
//! print TEXT          stdout
//! stderr TEXT         stderr
//! result TEXT         execute_result
//! display ID TEXT     display_data with a display id
//! update ID TEXT      update_display_data
//! input PROMPT        input_request, echoes the answer
//! sleep MS
//! error NAME: VALUE   error output and an error reply
//! ```
//!
//! Any other line is echoed to stdout.

use std::time::Duration;

use nbexec_channels::KernelEndpoint;
use nbexec_protocol::{
    ChannelKind, DisplayData, ErrorContent, ExecuteInput, ExecuteReply, ExecuteResult,
    ExecutionState, InputRequest, InterruptReply, JupyterMessage, KernelInfoReply, MessageContent,
    Metadata, MimeBundle, PROTOCOL_VERSION, ShutdownReply, StreamContent, StreamName, Transient,
};
use serde_json::json;
use tracing::{debug, info};

pub struct EchoKernel {
    endpoint: KernelEndpoint,
    execution_count: u32,
}

impl EchoKernel {
    pub fn new(endpoint: KernelEndpoint) -> Self {
        Self {
            endpoint,
            execution_count: 0,
        }
    }

    /// Answer requests until shut down or disconnected.
    pub async fn serve(mut self) {
        self.boot();
        while let Some(request) = self.endpoint.next_request().await {
            match &request.content {
                MessageContent::KernelInfoRequest(_) => self.kernel_info(&request),
                MessageContent::ExecuteRequest(execute) => {
                    let code = execute.code.clone();
                    self.execute(&request, &code).await;
                }
                MessageContent::InterruptRequest(_) => {
                    self.endpoint.reply(
                        ChannelKind::Control,
                        &request,
                        MessageContent::InterruptReply(InterruptReply::default()),
                    );
                }
                MessageContent::ShutdownRequest(shutdown) => {
                    let restart = shutdown.restart;
                    self.endpoint.reply(
                        ChannelKind::Control,
                        &request,
                        MessageContent::ShutdownReply(ShutdownReply {
                            restart,
                            ..ShutdownReply::default()
                        }),
                    );
                    if !restart {
                        info!("echo kernel stopped");
                        return;
                    }
                    self.execution_count = 0;
                    self.boot();
                }
                other => debug!(msg_type = other.msg_type(), "echo kernel ignored message"),
            }
        }
        info!("echo kernel disconnected");
    }

    fn boot(&self) {
        self.endpoint.status(None, ExecutionState::Starting);
        self.endpoint.status(None, ExecutionState::Idle);
    }

    fn kernel_info(&self, request: &JupyterMessage) {
        self.endpoint.status(Some(request), ExecutionState::Busy);
        self.endpoint.reply(
            ChannelKind::Shell,
            request,
            MessageContent::KernelInfoReply(KernelInfoReply {
                protocol_version: PROTOCOL_VERSION.to_owned(),
                implementation: "echo".to_owned(),
                implementation_version: env!("CARGO_PKG_VERSION").to_owned(),
                language_info: json!({ "name": "echo", "file_extension": ".txt" }),
                banner: "echo kernel".to_owned(),
                ..KernelInfoReply::default()
            }),
        );
        self.endpoint.status(Some(request), ExecutionState::Idle);
    }

    async fn execute(&mut self, request: &JupyterMessage, code: &str) {
        self.endpoint.status(Some(request), ExecutionState::Busy);
        self.execution_count += 1;
        let count = self.execution_count;
        self.publish(
            request,
            MessageContent::ExecuteInput(ExecuteInput {
                code: code.to_owned(),
                execution_count: Some(count),
            }),
        );

        let mut reply = ExecuteReply::ok(Some(count));
        for line in code.lines() {
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "print" => self.publish(request, stream(StreamName::Stdout, rest)),
                "stderr" => self.publish(request, stream(StreamName::Stderr, rest)),
                "result" => self.publish(
                    request,
                    MessageContent::ExecuteResult(ExecuteResult {
                        execution_count: Some(count),
                        data: plain(rest),
                        metadata: Metadata::new(),
                    }),
                ),
                "display" | "update" => {
                    let (display_id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    let display = DisplayData {
                        data: plain(text),
                        metadata: Metadata::new(),
                        transient: Transient {
                            display_id: Some(display_id.to_owned()),
                        },
                    };
                    let content = if command == "display" {
                        MessageContent::DisplayData(display)
                    } else {
                        MessageContent::UpdateDisplayData(display)
                    };
                    self.publish(request, content);
                }
                "input" => match self.ask(request, rest).await {
                    Some(value) => {
                        self.publish(request, stream(StreamName::Stdout, &format!("{rest} {value}")))
                    }
                    None => break,
                },
                "sleep" => {
                    let millis = rest.trim().parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                "error" => {
                    let (ename, evalue) = rest
                        .split_once(':')
                        .map(|(name, value)| (name.trim(), value.trim()))
                        .unwrap_or((rest, ""));
                    let traceback = vec![format!("line: {line}")];
                    self.publish(
                        request,
                        MessageContent::Error(ErrorContent {
                            ename: ename.to_owned(),
                            evalue: evalue.to_owned(),
                            traceback: traceback.clone(),
                        }),
                    );
                    reply = ExecuteReply::error(Some(count), ename, evalue, traceback);
                    break;
                }
                _ => self.publish(request, stream(StreamName::Stdout, line)),
            }
        }

        self.endpoint.reply(
            ChannelKind::Shell,
            request,
            MessageContent::ExecuteReply(reply),
        );
        self.endpoint.status(Some(request), ExecutionState::Idle);
    }

    async fn ask(&mut self, request: &JupyterMessage, prompt: &str) -> Option<String> {
        let input_request = self.endpoint.factory().reply(
            request,
            MessageContent::InputRequest(InputRequest {
                prompt: prompt.to_owned(),
                password: false,
            }),
        );
        self.endpoint.publish(ChannelKind::Stdin, input_request);
        match self.endpoint.recv(ChannelKind::Stdin).await?.content {
            MessageContent::InputReply(reply) => Some(reply.value),
            _ => None,
        }
    }

    fn publish(&self, request: &JupyterMessage, content: MessageContent) {
        self.endpoint.reply(ChannelKind::IoPub, request, content);
    }
}

fn stream(name: StreamName, text: &str) -> MessageContent {
    MessageContent::Stream(StreamContent {
        name,
        text: format!("{text}\n"),
    })
}

fn plain(text: &str) -> MimeBundle {
    let mut data = MimeBundle::new();
    data.insert("text/plain".to_owned(), json!(text));
    data
}
