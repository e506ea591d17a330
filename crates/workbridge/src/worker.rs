//! Worker side: serving the lifecycle operations and tracking what was spawned.
//!
//! A worker is just a [`Bridge`] in the worker role whose registry serves at
//! least the lifecycle operations. [`run_worker`] serves until the controller
//! terminates the channel; [`WorkerHandle`] is the controller's grip on a
//! worker it spawned, either an in-process task or a child process.

use std::sync::Arc;

use serde_json::Value;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::bridge::channel::Channel;
use crate::endpoint::{Bridge, BridgeConfig, Peer, Role};
use crate::ops::{Onload, Restart, Unload, UpdateConfig};
use crate::registry::{HandlerRegistry, RegistryError};

/// Lifecycle every worker implements. Defaults accept and do nothing.
#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// Called once, after the worker first answers a ping.
    async fn onload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Must be idempotent: the controller resends config on every launch.
    async fn update_config(&self, config: Value, extra: Option<Value>) -> anyhow::Result<()>;

    async fn restart(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Register the four lifecycle operations against `lifecycle`.
pub fn register_lifecycle<L: Lifecycle>(
    registry: &HandlerRegistry,
    lifecycle: Arc<L>,
) -> Result<(), RegistryError> {
    registry.register_with::<Onload, _, _, _>(Arc::clone(&lifecycle), |l, ()| async move {
        l.onload().await
    })?;
    registry.register_with::<Unload, _, _, _>(Arc::clone(&lifecycle), |l, ()| async move {
        l.unload().await
    })?;
    registry.register_with::<UpdateConfig, _, _, _>(
        Arc::clone(&lifecycle),
        |l, (config, extra)| async move { l.update_config(config, extra).await },
    )?;
    registry.register_with::<Restart, _, _, _>(lifecycle, |l, ()| async move {
        l.restart().await
    })?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to register handlers: {0}")]
    Registry(#[from] RegistryError),
}

/// Serve `channel` as a worker until the controller terminates it or the
/// channel closes.
///
/// `build` receives a [`Peer`] so handlers can call back into the controller.
pub async fn run_worker<F>(channel: Channel, config: BridgeConfig, build: F) -> Result<(), WorkerError>
where
    F: FnOnce(Peer) -> Result<HandlerRegistry, RegistryError>,
{
    let label = channel.label().to_string();
    let bridge = Bridge::start_with(Role::Worker, channel, config, build)?;
    tracing::info!(
        channel = %label,
        version = %bridge.config().version.bridge,
        operations = ?bridge.operations(),
        "Worker ready"
    );

    bridge.closed().await;
    tracing::info!(channel = %label, "Worker channel closed, exiting");
    Ok(())
}

enum HandleKind {
    Task(JoinHandle<()>),
    Process {
        child: Child,
        forwarders: Vec<JoinHandle<()>>,
    },
}

/// A spawned worker, owned by whoever spawned it.
pub struct WorkerHandle {
    kind: HandleKind,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HandleKind::Task(_) => f.write_str("WorkerHandle::Task"),
            HandleKind::Process { child, .. } => f
                .debug_struct("WorkerHandle::Process")
                .field("pid", &child.id())
                .finish(),
        }
    }
}

impl WorkerHandle {
    pub fn task(handle: JoinHandle<()>) -> Self {
        Self {
            kind: HandleKind::Task(handle),
        }
    }

    /// A child process plus the tasks moving envelopes to and from its stdio.
    pub fn process(child: Child, forwarders: Vec<JoinHandle<()>>) -> Self {
        Self {
            kind: HandleKind::Process { child, forwarders },
        }
    }

    /// OS pid for process workers that have not been reaped.
    pub fn pid(&self) -> Option<u32> {
        match &self.kind {
            HandleKind::Task(_) => None,
            HandleKind::Process { child, .. } => child.id(),
        }
    }

    pub fn is_finished(&mut self) -> bool {
        match &mut self.kind {
            HandleKind::Task(handle) => handle.is_finished(),
            HandleKind::Process { child, .. } => !matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Stop the worker. Safe to call on a worker that already exited.
    pub async fn terminate(&mut self) {
        match &mut self.kind {
            HandleKind::Task(handle) => handle.abort(),
            HandleKind::Process { child, forwarders } => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Worker process already gone");
                }
                for forwarder in forwarders.drain(..) {
                    forwarder.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Lifecycle for Recorder {
        async fn update_config(&self, config: Value, extra: Option<Value>) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("updateConfig {config} {}", extra.is_some()));
            Ok(())
        }

        async fn restart(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("restart".to_string());
            Ok(())
        }
    }

    #[test]
    fn lifecycle_registers_all_four() {
        let registry = HandlerRegistry::new();
        register_lifecycle(&registry, Arc::new(Recorder::default())).unwrap();
        assert_eq!(
            registry.names(),
            vec!["onload", "restart", "unload", "updateConfig"]
        );
        assert_eq!(
            register_lifecycle(&registry, Arc::new(Recorder::default())),
            Err(RegistryError::Duplicate("onload"))
        );
    }

    #[tokio::test]
    async fn worker_serves_until_terminated() {
        let recorder = Arc::new(Recorder::default());
        let (master_side, worker_side) = Channel::pair();

        let served = Arc::clone(&recorder);
        let worker = tokio::spawn(async move {
            run_worker(worker_side, BridgeConfig::default(), move |_peer| {
                let registry = HandlerRegistry::new();
                register_lifecycle(&registry, served)?;
                Ok(registry)
            })
            .await
        });

        let master = Bridge::master(master_side, HandlerRegistry::new());
        master.ping().await.unwrap();
        master
            .call::<UpdateConfig>((serde_json::json!({"key": 1}), None))
            .await
            .unwrap();
        master.call::<Restart>(()).await.unwrap();
        master.terminate();

        worker.await.unwrap().unwrap();
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["updateConfig {\"key\":1} false".to_string(), "restart".to_string()]
        );
    }

    #[tokio::test]
    async fn task_handle_terminates() {
        let mut handle = WorkerHandle::task(tokio::spawn(std::future::pending::<()>()));
        assert!(handle.pid().is_none());
        assert!(!handle.is_finished());
        handle.terminate().await;
        for _ in 0..10 {
            if handle.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());
    }
}
