use nbexec_protocol::{ExecuteOptions, MessageFactory, PROTOCOL_VERSION, SessionId};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub session_id: SessionId,
    pub username: String,
    pub protocol_version: String,
    /// Send `kernel_info_request` on attach and after a restart so a kernel
    /// that is already up reports its status.
    pub probe_kernel_info: bool,
    /// How many finished or cancelled request ids are remembered, so their
    /// trailing messages are not reported as protocol violations.
    pub retired_capacity: usize,
    pub execute_options: ExecuteOptions,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            session_id: SessionId::new_uuid(),
            username: "nbexec".to_owned(),
            protocol_version: PROTOCOL_VERSION.to_owned(),
            probe_kernel_info: true,
            retired_capacity: 256,
            execute_options: ExecuteOptions::default(),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn probe_kernel_info(mut self, probe: bool) -> Self {
        self.probe_kernel_info = probe;
        self
    }

    pub fn allow_stdin(mut self, allow: bool) -> Self {
        self.execute_options.allow_stdin = allow;
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.execute_options.stop_on_error = stop;
        self
    }

    pub fn message_factory(&self) -> MessageFactory {
        MessageFactory::new(self.session_id.clone(), self.username.clone())
            .with_version(self.protocol_version.clone())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
