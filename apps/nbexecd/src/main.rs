mod echo_kernel;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use echo_kernel::EchoKernel;
use futures_util::StreamExt;
use nbexec_channels::InMemoryTransport;
use nbexec_engine::EngineBuilder;
use nbexec_protocol::KernelStatus;
use nbexec_runtime::{ExecutionEvent, ExecutionHandle, ExecutionOutcome, RuntimeConfig};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "nbexecd")]
#[command(about = "Run notebook cells against an in-process echo kernel")]
struct Cli {
    /// Cell source; repeat for several cells. Defaults to a demo notebook.
    #[arg(long = "cell")]
    cells: Vec<String>,
    #[arg(long, default_value = "nbexecd")]
    username: String,
    /// Answer given to every input prompt.
    #[arg(long, default_value = "world")]
    input: String,
    /// Skip the kernel_info probe on connect.
    #[arg(long)]
    no_probe: bool,
    /// Restart the kernel after the cells and run the first one again.
    #[arg(long)]
    restart: bool,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();
    let deadline = Duration::from_secs(cli.timeout_secs);
    let engine = EngineBuilder::new()
        .config(
            RuntimeConfig::new()
                .username(cli.username.clone())
                .probe_kernel_info(!cli.no_probe),
        )
        .build();

    let (transport, endpoint) = InMemoryTransport::pair();
    let kernel = engine.attach(Arc::new(transport));
    let kernel_task = tokio::spawn(EchoKernel::new(endpoint).serve());
    let kernel_id = kernel.kernel_id().clone();

    let mut raw = kernel.subscribe();
    let trace_task = tokio::spawn(async move {
        while let Some(message) = raw.next().await {
            debug!(
                msg_type = message.msg_type(),
                channel = message.channel.as_ref().map(|channel| channel.as_str()),
                "kernel message"
            );
        }
    });

    timeout(deadline, kernel.wait_for_status(KernelStatus::Idle))
        .await
        .context("kernel never became idle")??;
    info!(
        %kernel_id,
        implementation = kernel
            .kernel_info()
            .map(|info| info.implementation)
            .unwrap_or_default(),
        "kernel ready"
    );

    let cells = if cli.cells.is_empty() {
        demo_cells()
    } else {
        cli.cells.clone()
    };
    // Submit everything up front; the session runs them one at a time.
    let mut handles = Vec::with_capacity(cells.len());
    for (index, source) in cells.iter().enumerate() {
        handles.push(
            engine
                .execute(&kernel_id, format!("cell-{index}"), source.as_str())
                .await?,
        );
    }
    for handle in handles {
        timeout(deadline, follow(handle, &cli.input))
            .await
            .context("cell timed out")??;
    }

    if cli.restart {
        engine.restart(&kernel_id).await?;
        timeout(deadline, kernel.wait_for_status(KernelStatus::Idle))
            .await
            .context("kernel never came back")??;
        info!(%kernel_id, "kernel restarted");
        if let Some(source) = cells.first() {
            let handle = engine
                .execute(&kernel_id, "cell-0", source.as_str())
                .await?;
            timeout(deadline, follow(handle, &cli.input))
                .await
                .context("cell timed out")??;
        }
    }

    engine.shutdown_all().await;
    if let Err(error) = timeout(deadline, kernel_task).await {
        warn!(%error, "echo kernel did not stop");
    }
    trace_task.abort();
    if let Err(error) = trace_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "message trace task failed");
    }
    Ok(())
}

/// Log one execution's events and print its final outputs as JSON.
async fn follow(mut handle: ExecutionHandle, input: &str) -> Result<()> {
    let cell_id = handle.cell_id().clone();
    let mut outputs = Vec::new();
    while let Some(event) = handle.next_event().await {
        match event {
            ExecutionEvent::Queued { position } => info!(%cell_id, position, "cell queued"),
            ExecutionEvent::Started => info!(%cell_id, "cell started"),
            ExecutionEvent::ExecutionCount(count) => info!(%cell_id, count, "execution count"),
            ExecutionEvent::Outputs(latest) => outputs = latest,
            ExecutionEvent::InputRequested { prompt, .. } => {
                info!(%cell_id, %prompt, "input requested");
                handle.reply_input(input)?;
            }
            ExecutionEvent::Finished(outcome) => {
                for output in &outputs {
                    println!("{}", serde_json::to_string(output)?);
                }
                match outcome {
                    ExecutionOutcome::Completed { execution_count } => {
                        info!(%cell_id, ?execution_count, outputs = outputs.len(), "cell completed")
                    }
                    ExecutionOutcome::Failed(error) => warn!(%cell_id, %error, "cell failed"),
                    ExecutionOutcome::Cancelled(reason) => {
                        warn!(%cell_id, ?reason, "cell cancelled")
                    }
                }
            }
        }
    }
    Ok(())
}

fn demo_cells() -> Vec<String> {
    [
        "print hello",
        "stderr careful\nresult 42",
        "display progress 0%\nupdate progress 100%",
        "input name?",
        "error ValueError: bad input\nprint unreachable",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}
