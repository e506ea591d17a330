//! Controller-side worker supervision.
//!
//! The supervisor owns a master [`Bridge`] bound to a named hub channel that
//! outlives individual workers. Launching is probe-before-spawn:
//!
//! 1. Ping. If the worker answers, it is reused: push config and restart.
//! 2. Otherwise spawn a worker on a fresh endpoint of the same channel, then
//!    ping every `poll_interval` until it answers.
//! 3. Call `onload` once, then push config and restart.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{Mutex, watch};

use crate::bridge::channel::{Channel, ChannelHub};
use crate::endpoint::{Bridge, BridgeConfig, Peer, Role};
use crate::error::BridgeError;
use crate::health::WorkerHealth;
use crate::ops::{Onload, Restart, Unload, UpdateConfig};
use crate::registry::{HandlerRegistry, RegistryError};
use crate::version::{VERSION_ENV, VersionInfo};
use crate::worker::WorkerHandle;

pub const DEFAULT_CHANNEL: &str = "workbridge";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The spawner receives the worker's end of the channel and must start
/// serving it without waiting; readiness is detected by pinging.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, channel: Channel) -> Result<WorkerHandle, SpawnError>;
}

type TaskFn = dyn Fn(Channel) -> BoxFuture<'static, ()> + Send + Sync;

/// Runs the worker as a task in the current runtime.
#[derive(Clone)]
pub struct TaskSpawner {
    run: Arc<TaskFn>,
}

impl TaskSpawner {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            run: Arc::new(move |channel| run(channel).boxed()),
        }
    }
}

impl WorkerSpawner for TaskSpawner {
    fn spawn(&self, channel: Channel) -> Result<WorkerHandle, SpawnError> {
        tracing::debug!(channel = %channel.label(), "Spawning worker task");
        Ok(WorkerHandle::task(tokio::spawn((self.run)(channel))))
    }
}

/// Runs the worker as a child process speaking framed envelopes on stdio.
///
/// Envelopes are forwarded between the hub endpoint and the child's pipes.
/// The expected version is passed to the child in `WORKBRIDGE_VERSION`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    version: String,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            version: VersionInfo::new().bridge,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, channel: Channel) -> Result<WorkerHandle, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(VERSION_ENV, &self.version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("child stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("child stdout was not captured".to_string()))?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(program = %self.program.display(), pid, "Spawned worker process");

        let (hub_sink, hub_stream) = channel.into_parts();
        let (child_sink, child_stream) =
            Channel::from_io(format!("process:{pid}"), stdout, stdin).into_parts();

        let from_child = tokio::spawn(async move {
            if let Err(e) = child_stream.forward(hub_sink).await {
                tracing::warn!(pid, error = %e, "Worker stdout forwarding failed");
            }
            tracing::debug!(pid, "Worker stdout closed");
        });
        let to_child = tokio::spawn(async move {
            if let Err(e) = hub_stream.forward(child_sink).await {
                tracing::debug!(pid, error = %e, "Worker stdin forwarding stopped");
            }
        });

        Ok(WorkerHandle::process(child, vec![from_child, to_child]))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Hub channel name shared by controller and worker.
    pub channel: String,
    /// Delay between readiness pings after spawning.
    pub poll_interval: Duration,
    /// Give up after this many readiness pings. None polls forever.
    pub max_polls: Option<u32>,
    pub bridge: BridgeConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: None,
            bridge: BridgeConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    pub fn with_bridge_config(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker did not answer after {attempts} pings")]
    NeverReady { attempts: u32 },
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How a launch reached a ready worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// A worker was already answering on the channel.
    Reused,
    /// A worker was spawned and answered on the given ping.
    Spawned { polls: u32 },
}

pub struct Supervisor {
    config: SupervisorConfig,
    hub: ChannelHub,
    spawner: Arc<dyn WorkerSpawner>,
    bridge: Arc<Bridge>,
    worker: Mutex<Option<WorkerHandle>>,
    health: watch::Sender<WorkerHealth>,
}

impl Supervisor {
    /// Bind a master bridge to the configured hub channel.
    pub fn new(
        hub: ChannelHub,
        spawner: Arc<dyn WorkerSpawner>,
        config: SupervisorConfig,
        registry: HandlerRegistry,
    ) -> Self {
        let bridge = Bridge::start(
            Role::Master,
            hub.open(&config.channel),
            config.bridge.clone(),
            registry,
        );
        Self::assemble(hub, spawner, config, bridge)
    }

    /// Like [`new`](Self::new), for handlers that call back into the worker.
    pub fn with_handlers<F>(
        hub: ChannelHub,
        spawner: Arc<dyn WorkerSpawner>,
        config: SupervisorConfig,
        build: F,
    ) -> Result<Self, SupervisorError>
    where
        F: FnOnce(Peer) -> Result<HandlerRegistry, RegistryError>,
    {
        let bridge = Bridge::start_with(
            Role::Master,
            hub.open(&config.channel),
            config.bridge.clone(),
            build,
        )?;
        Ok(Self::assemble(hub, spawner, config, bridge))
    }

    fn assemble(
        hub: ChannelHub,
        spawner: Arc<dyn WorkerSpawner>,
        config: SupervisorConfig,
        bridge: Bridge,
    ) -> Self {
        Self {
            config,
            hub,
            spawner,
            bridge: Arc::new(bridge),
            worker: Mutex::new(None),
            health: watch::channel(WorkerHealth::Unknown).0,
        }
    }

    /// The master bridge, shareable with event pumps.
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn health(&self) -> WorkerHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<WorkerHealth> {
        self.health.subscribe()
    }

    /// Pid of the spawned worker process, if this supervisor spawned one.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.worker.lock().await.as_ref().and_then(WorkerHandle::pid)
    }

    /// Ensure a worker is running and configured.
    pub async fn launch(&self, config: &Value, extra: Option<Value>) -> Result<Launch, SupervisorError> {
        if !self.bridge.is_open() {
            return Err(BridgeError::Terminated.into());
        }

        self.set_health(WorkerHealth::Probing);
        match self.bridge.ping_info().await {
            Ok(remote) => {
                self.check_version(&remote);
                tracing::info!(channel = %self.config.channel, "Worker already running, reusing");
                self.configure(config, extra).await?;
                self.set_health(WorkerHealth::Ready);
                return Ok(Launch::Reused);
            }
            Err(e) => {
                tracing::debug!(channel = %self.config.channel, error = %e, "Worker not running");
            }
        }

        self.set_health(WorkerHealth::Starting);
        let handle = match self.spawner.spawn(self.hub.open(&self.config.channel)) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn worker");
                self.set_health(WorkerHealth::Defunct);
                return Err(e.into());
            }
        };
        if let Some(mut previous) = self.worker.lock().await.replace(handle) {
            previous.terminate().await;
        }

        let polls = match self.wait_ready().await {
            Ok(polls) => polls,
            Err(e) => {
                self.set_health(WorkerHealth::Defunct);
                return Err(e);
            }
        };
        tracing::info!(channel = %self.config.channel, polls, "Worker ready");

        self.bridge.call::<Onload>(()).await?;
        self.configure(config, extra).await?;
        self.set_health(WorkerHealth::Ready);
        Ok(Launch::Spawned { polls })
    }

    /// Push a new configuration to a running worker and restart it.
    pub async fn update_config(&self, config: &Value, extra: Option<Value>) -> Result<(), SupervisorError> {
        self.configure(config, extra).await
    }

    /// Unload the worker, then terminate the bridge and the worker.
    ///
    /// Unload failures are logged, never returned: shutdown always completes.
    pub async fn shutdown(&self) {
        if self.health().is_ready() {
            let deadline = self.config.bridge.ping_timeout;
            if let Err(e) = self.bridge.call_with_timeout::<Unload>((), deadline).await {
                tracing::warn!(error = %e, "Worker unload failed");
            }
        }
        self.bridge.terminate();
        if let Some(mut worker) = self.worker.lock().await.take() {
            worker.terminate().await;
        }
        self.set_health(WorkerHealth::Terminated);
        tracing::info!(channel = %self.config.channel, "Supervisor shut down");
    }

    async fn configure(&self, config: &Value, extra: Option<Value>) -> Result<(), SupervisorError> {
        self.bridge.call::<UpdateConfig>((config.clone(), extra)).await?;
        self.bridge.call::<Restart>(()).await?;
        tracing::debug!(channel = %self.config.channel, "Worker configured and restarted");
        Ok(())
    }

    async fn wait_ready(&self) -> Result<u32, SupervisorError> {
        let mut polls = 0;
        loop {
            polls += 1;
            match self.bridge.ping_info().await {
                Ok(remote) => {
                    self.check_version(&remote);
                    return Ok(polls);
                }
                Err(BridgeError::Terminated) => return Err(BridgeError::Terminated.into()),
                Err(e) => tracing::trace!(polls, error = %e, "Worker not answering yet"),
            }
            if self.config.max_polls.is_some_and(|max| polls >= max) {
                return Err(SupervisorError::NeverReady { attempts: polls });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn check_version(&self, remote: &VersionInfo) {
        let local = &self.config.bridge.version;
        if !local.is_compatible(remote) {
            tracing::warn!(
                local_protocol = local.protocol,
                remote_protocol = remote.protocol,
                remote_bridge = %remote.bridge,
                "Worker speaks a different protocol version"
            );
        } else if remote.worker.as_deref().is_some_and(|w| w != local.bridge) {
            tracing::warn!(
                expected = %local.bridge,
                worker = ?remote.worker,
                "Worker was started for a different version"
            );
        }
    }

    fn set_health(&self, health: WorkerHealth) {
        let previous = self.health.send_replace(health);
        if previous != health {
            tracing::debug!(?previous, current = ?health, "Worker health changed");
        }
    }
}
