//! # nbexec-engine — notebook-facing facade
//!
//! [`EngineBuilder`] configures and [`NotebookEngine`] owns a registry of
//! kernel sessions, one per attached or launched kernel. Operations take a
//! [`KernelId`] and delegate to that kernel's session; kernels share nothing.

use std::sync::Arc;

use indexmap::IndexMap;
use nbexec_protocol::{
    CellId, KernelError, KernelId, KernelLauncher, KernelResult, KernelSpec, KernelStatus,
    KernelTransport,
};
use nbexec_runtime::{ExecutionHandle, KernelHandle, KernelSession, RuntimeConfig};
use parking_lot::Mutex;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: RuntimeConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> NotebookEngine {
        NotebookEngine {
            config: self.config,
            kernels: Arc::new(Mutex::new(IndexMap::new())),
        }
    }
}

/// Registry of kernel sessions keyed by kernel id.
///
/// Each kernel runs its own session; nothing is shared between kernels. Must
/// be used inside a Tokio runtime.
#[derive(Clone)]
pub struct NotebookEngine {
    config: RuntimeConfig,
    kernels: Arc<Mutex<IndexMap<KernelId, KernelHandle>>>,
}

impl NotebookEngine {
    /// Start a session over an already-connected transport.
    #[instrument(skip_all)]
    pub fn attach(&self, transport: Arc<dyn KernelTransport>) -> KernelHandle {
        let kernel_id = KernelId::new_uuid();
        let handle = KernelSession::spawn(kernel_id.clone(), transport, self.config.clone());
        self.kernels.lock().insert(kernel_id.clone(), handle.clone());
        info!(%kernel_id, "kernel attached");
        handle
    }

    /// Launch a kernel through `launcher` and attach to it.
    #[instrument(skip_all, fields(kernel = %spec.name))]
    pub async fn launch(
        &self,
        launcher: &dyn KernelLauncher,
        spec: &KernelSpec,
    ) -> KernelResult<KernelHandle> {
        let transport = launcher.launch(spec).await?;
        Ok(self.attach(transport))
    }

    #[instrument(skip_all, fields(kernel_id = %kernel_id))]
    pub async fn execute(
        &self,
        kernel_id: &KernelId,
        cell_id: impl Into<CellId>,
        source: impl Into<String>,
    ) -> KernelResult<ExecutionHandle> {
        self.kernel(kernel_id)?.execute(cell_id, source).await
    }

    pub async fn interrupt(&self, kernel_id: &KernelId) -> KernelResult<()> {
        self.kernel(kernel_id)?.interrupt().await
    }

    pub async fn restart(&self, kernel_id: &KernelId) -> KernelResult<()> {
        self.kernel(kernel_id)?.restart().await
    }

    /// Shut the kernel down and forget it.
    #[instrument(skip_all, fields(kernel_id = %kernel_id))]
    pub async fn shutdown(&self, kernel_id: &KernelId) -> KernelResult<()> {
        let handle = self
            .kernels
            .lock()
            .shift_remove(kernel_id)
            .ok_or_else(|| KernelError::KernelUnavailable(kernel_id.clone()))?;
        let result = handle.shutdown().await;
        info!(%kernel_id, "kernel removed");
        result
    }

    /// Shut every kernel down. Kernels that already died are just removed.
    pub async fn shutdown_all(&self) {
        let handles: Vec<KernelHandle> = self
            .kernels
            .lock()
            .drain(..)
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            if let Err(error) = handle.shutdown().await {
                info!(kernel_id = %handle.kernel_id(), %error, "kernel already stopped");
            }
        }
    }

    pub fn status(&self, kernel_id: &KernelId) -> KernelResult<KernelStatus> {
        Ok(self.kernel(kernel_id)?.status())
    }

    pub fn kernel(&self, kernel_id: &KernelId) -> KernelResult<KernelHandle> {
        self.kernels
            .lock()
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| KernelError::KernelUnavailable(kernel_id.clone()))
    }

    /// Registered kernels in attach order.
    pub fn kernels(&self) -> Vec<KernelId> {
        self.kernels.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use nbexec_channels::{InMemoryTransport, KernelEndpoint};
    use nbexec_protocol::{
        CancelReason, ChannelKind, ExecuteReply, ExecutionState, KernelError, KernelId,
        KernelLauncher, KernelResult, KernelSpec, KernelStatus, KernelTransport, MessageContent,
        TransportError,
    };
    use nbexec_runtime::{ExecutionOutcome, RuntimeConfig};
    use parking_lot::Mutex;
    use tokio::time::timeout;

    use crate::EngineBuilder;

    #[derive(Default)]
    struct InMemoryLauncher {
        endpoints: Mutex<Vec<KernelEndpoint>>,
    }

    #[async_trait]
    impl KernelLauncher for InMemoryLauncher {
        async fn launch(&self, _spec: &KernelSpec) -> KernelResult<Arc<dyn KernelTransport>> {
            let (transport, endpoint) = InMemoryTransport::pair();
            self.endpoints.lock().push(endpoint);
            Ok(Arc::new(transport))
        }
    }

    struct BrokenLauncher;

    #[async_trait]
    impl KernelLauncher for BrokenLauncher {
        async fn launch(&self, _spec: &KernelSpec) -> KernelResult<Arc<dyn KernelTransport>> {
            Err(TransportError::Io("no such kernel".to_owned()).into())
        }
    }

    fn quiet_config() -> RuntimeConfig {
        RuntimeConfig::new().probe_kernel_info(false)
    }

    /// Report the kernel ready without a probe round trip.
    async fn ready(endpoint: &KernelEndpoint, handle: &nbexec_runtime::KernelHandle) -> Result<()> {
        endpoint.status(None, ExecutionState::Idle);
        timeout(
            Duration::from_secs(2),
            handle.wait_for_status(KernelStatus::Idle),
        )
        .await??;
        Ok(())
    }

    #[tokio::test]
    async fn attached_kernels_are_independent() -> Result<()> {
        let engine = EngineBuilder::new().config(quiet_config()).build();
        let (first_transport, first_endpoint) = InMemoryTransport::pair();
        let (second_transport, mut second_endpoint) = InMemoryTransport::pair();
        let first = engine.attach(Arc::new(first_transport));
        let second = engine.attach(Arc::new(second_transport));
        assert_eq!(
            engine.kernels(),
            vec![first.kernel_id().clone(), second.kernel_id().clone()]
        );
        ready(&first_endpoint, &first).await?;
        ready(&second_endpoint, &second).await?;

        let doomed = engine.execute(first.kernel_id(), "a", "x").await?;
        first_endpoint.sever();
        let outcome = timeout(Duration::from_secs(2), doomed.wait()).await?.outcome;
        assert_eq!(
            outcome,
            ExecutionOutcome::Cancelled(CancelReason::KernelShutdown)
        );
        timeout(
            Duration::from_secs(2),
            first.wait_for_status(KernelStatus::Dead),
        )
        .await??;
        assert!(matches!(
            engine.execute(first.kernel_id(), "b", "y").await,
            Err(KernelError::KernelUnavailable(_))
        ));

        let survivor = engine.execute(second.kernel_id(), "c", "z").await?;
        let request = timeout(
            Duration::from_secs(2),
            second_endpoint.recv(ChannelKind::Shell),
        )
        .await?
        .context("execute_request")?;
        second_endpoint.reply(
            ChannelKind::Shell,
            &request,
            MessageContent::ExecuteReply(ExecuteReply::ok(Some(1))),
        );
        let summary = timeout(Duration::from_secs(2), survivor.wait()).await?;
        assert!(summary.outcome.is_completed());
        timeout(
            Duration::from_secs(2),
            second.wait_for_status(KernelStatus::Idle),
        )
        .await??;
        assert_eq!(engine.status(second.kernel_id())?, KernelStatus::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn launch_registers_the_kernel() -> Result<()> {
        let engine = EngineBuilder::new().config(quiet_config()).build();
        let launcher = InMemoryLauncher::default();
        let handle = engine.launch(&launcher, &KernelSpec::new("python3")).await?;
        assert_eq!(engine.kernels(), vec![handle.kernel_id().clone()]);
        assert_eq!(engine.status(handle.kernel_id())?, KernelStatus::Starting);
        assert_eq!(launcher.endpoints.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_launch_registers_nothing() -> Result<()> {
        let engine = EngineBuilder::new().build();
        let error = engine
            .launch(&BrokenLauncher, &KernelSpec::new("missing"))
            .await
            .expect_err("launch should fail");
        assert_eq!(
            error,
            KernelError::Transport(TransportError::Io("no such kernel".to_owned()))
        );
        assert!(engine.kernels().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_forgets_the_kernel() -> Result<()> {
        let engine = EngineBuilder::new().config(quiet_config()).build();
        let (transport, mut endpoint) = InMemoryTransport::pair();
        let handle = engine.attach(Arc::new(transport));
        let kernel_id = handle.kernel_id().clone();

        engine.shutdown(&kernel_id).await?;
        let request = timeout(Duration::from_secs(2), endpoint.recv(ChannelKind::Control))
            .await?
            .context("shutdown_request")?;
        assert_eq!(request.msg_type(), "shutdown_request");
        assert_eq!(handle.status(), KernelStatus::Dead);
        assert!(engine.kernels().is_empty());
        assert_eq!(
            engine.status(&kernel_id),
            Err(KernelError::KernelUnavailable(kernel_id.clone()))
        );
        assert!(matches!(
            engine.shutdown(&kernel_id).await,
            Err(KernelError::KernelUnavailable(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kernel_is_unavailable() -> Result<()> {
        let engine = EngineBuilder::new().build();
        let missing = KernelId::from_string("missing");
        assert!(matches!(
            engine.execute(&missing, "cell", "1").await,
            Err(KernelError::KernelUnavailable(id)) if id == missing
        ));
        assert_eq!(
            engine.interrupt(&missing).await,
            Err(KernelError::KernelUnavailable(missing.clone()))
        );
        assert_eq!(
            engine.restart(&missing).await,
            Err(KernelError::KernelUnavailable(missing.clone()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_all_empties_the_registry() -> Result<()> {
        let engine = EngineBuilder::new().config(quiet_config()).build();
        let (first, _first_endpoint) = InMemoryTransport::pair();
        let (second, second_endpoint) = InMemoryTransport::pair();
        let kept = engine.attach(Arc::new(first));
        let lost = engine.attach(Arc::new(second));
        second_endpoint.sever();
        timeout(
            Duration::from_secs(2),
            lost.wait_for_status(KernelStatus::Dead),
        )
        .await??;

        engine.shutdown_all().await;
        assert!(engine.kernels().is_empty());
        assert_eq!(kept.status(), KernelStatus::Dead);
        Ok(())
    }
}
