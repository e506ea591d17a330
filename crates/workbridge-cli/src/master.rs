//! Controller: launch a worker subprocess, feed it events, shut it down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Value, json};
use tracing::info;
use workbridge::ops::{
    AddEditEvent, AddViewEvent, ImportIpynb, ImportMode, UpdateKernelSpecs, UpdateKernels,
    UpdateSessions, ViewEvent,
};
use workbridge::supervisor::{DEFAULT_CHANNEL, Supervisor};
use workbridge::{
    BridgeConfig, ChannelHub, CommandSpawner, HandlerRegistry, SupervisorConfig,
    WORKBRIDGE_VERSION, call_queue,
};

#[derive(Args, Debug)]
pub struct MasterArgs {
    /// Hub channel shared with the worker
    #[arg(long, env = "WORKBRIDGE_CHANNEL", default_value = DEFAULT_CHANNEL)]
    channel: String,

    /// Delay between readiness pings after spawning
    #[arg(long, env = "WORKBRIDGE_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Give up after this many readiness pings (unbounded if unset)
    #[arg(long, env = "WORKBRIDGE_MAX_POLLS")]
    max_polls: Option<u32>,

    /// Liveness probe deadline
    #[arg(long, env = "WORKBRIDGE_PING_TIMEOUT_MS", default_value_t = 2000)]
    ping_timeout_ms: u64,

    /// Deadline for ordinary calls (none if unset)
    #[arg(long, env = "WORKBRIDGE_CALL_TIMEOUT_MS")]
    call_timeout_ms: Option<u64>,

    /// JSON file passed to the worker's updateConfig
    #[arg(long, env = "WORKBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Notebook (.ipynb) to import into the block
    #[arg(long)]
    import: Option<PathBuf>,

    /// Replace the block instead of appending to it
    #[arg(long, requires = "import")]
    replace: bool,

    /// Block id that events and imports refer to
    #[arg(long, default_value = "20240101000000-workbrg")]
    block: String,

    /// Worker executable (defaults to this binary)
    #[arg(long, env = "WORKBRIDGE_WORKER")]
    worker_program: Option<PathBuf>,

    /// Keep the worker running until interrupted
    #[arg(long)]
    stay: bool,
}

impl MasterArgs {
    fn supervisor_config(&self) -> SupervisorConfig {
        let mut bridge =
            BridgeConfig::new().with_ping_timeout(Duration::from_millis(self.ping_timeout_ms));
        if let Some(ms) = self.call_timeout_ms {
            bridge = bridge.with_call_timeout(Duration::from_millis(ms));
        }
        let mut config = SupervisorConfig::new()
            .with_channel(&self.channel)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_bridge_config(bridge);
        if let Some(max) = self.max_polls {
            config = config.with_max_polls(max);
        }
        config
    }
}

async fn read_json(path: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn master_handlers() -> Result<HandlerRegistry, workbridge::RegistryError> {
    HandlerRegistry::new()
        .with::<UpdateKernelSpecs, _, _>(|(specs,)| async move {
            info!(default = %specs["default"], "Kernel specs updated");
            Ok(())
        })?
        .with::<UpdateKernels, _, _>(|(kernels,)| async move {
            info!(count = kernels.len(), "Kernels updated");
            Ok(())
        })?
        .with::<UpdateSessions, _, _>(|(sessions,)| async move {
            info!(count = sessions.len(), "Sessions updated");
            Ok(())
        })
}

pub async fn run(args: MasterArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => read_json(path).await?,
        None => json!({}),
    };
    let program = match &args.worker_program {
        Some(program) => program.clone(),
        None => std::env::current_exe().context("cannot locate the workbridge executable")?,
    };

    let spawner = CommandSpawner::new(program).arg("worker");
    let supervisor = Supervisor::with_handlers(
        ChannelHub::new(),
        Arc::new(spawner),
        args.supervisor_config(),
        |_peer| master_handlers(),
    )?;

    let extra = json!({"version": WORKBRIDGE_VERSION, "channel": &args.channel});
    let launch = supervisor.launch(&config, Some(extra)).await?;
    info!(?launch, pid = ?supervisor.worker_pid().await, "Worker launched");

    let (events, pump) = call_queue(Arc::clone(supervisor.bridge()));
    events.notify::<AddViewEvent>((ViewEvent {
        id: args.block.clone(),
        notebook: "20240101000000-notebk".to_string(),
        path: format!("/{}.sy", args.block),
    },));
    events.notify::<AddEditEvent>((args.block.clone(),));
    drop(events);
    let posted = pump.await?;
    info!(posted, "Events sent");

    if let Some(path) = &args.import {
        let notebook = read_json(path).await?;
        let mode = if args.replace {
            ImportMode::Override
        } else {
            ImportMode::Append
        };
        supervisor
            .bridge()
            .call::<ImportIpynb>((args.block.clone(), notebook, mode))
            .await?;
        info!(path = %path.display(), ?mode, "Notebook imported");
    }

    if args.stay {
        info!("Running until interrupted");
        tokio::signal::ctrl_c().await?;
    }

    supervisor.shutdown().await;
    Ok(())
}
