//! Demo worker served over stdio.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info};
use workbridge::ops::{
    AddEditEvent, AddViewEvent, ImportIpynb, ImportMode, UpdateKernelSpecs, UpdateKernels,
    UpdateSessions, ViewEvent,
};
use workbridge::{
    BridgeConfig, Channel, HandlerRegistry, Lifecycle, Peer, VersionInfo, register_lifecycle,
    run_worker,
};

struct DemoWorker {
    peer: Peer,
    config: Mutex<Value>,
    edits: AtomicUsize,
    views: Mutex<Vec<ViewEvent>>,
}

impl DemoWorker {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            config: Mutex::new(Value::Null),
            edits: AtomicUsize::new(0),
            views: Mutex::new(Vec::new()),
        }
    }

    fn record_edit(&self, block: &str) {
        let edits = self.edits.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(block, edits, "Edit recorded");
    }

    fn record_view(&self, event: ViewEvent) {
        info!(id = %event.id, notebook = %event.notebook, path = %event.path, "View recorded");
        if let Ok(mut views) = self.views.lock() {
            views.push(event);
        }
    }

    fn import(&self, block: &str, notebook: &Value, mode: ImportMode) -> Result<()> {
        let cells = notebook
            .get("cells")
            .and_then(Value::as_array)
            .context("notebook has no cells array")?;
        info!(block, cells = cells.len(), ?mode, "Notebook imported");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Lifecycle for DemoWorker {
    async fn onload(&self) -> Result<()> {
        info!("Worker loaded");
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        let views = self.views.lock().map(|v| v.len()).unwrap_or_default();
        info!(
            edits = self.edits.load(Ordering::Relaxed),
            views,
            "Worker unloading"
        );
        Ok(())
    }

    async fn update_config(&self, config: Value, extra: Option<Value>) -> Result<()> {
        debug!(%config, ?extra, "Config updated");
        if let Ok(mut current) = self.config.lock() {
            *current = config;
        }
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        info!("Worker restarted");
        // Tell the controller what this worker can run.
        let specs = json!({
            "default": "python3",
            "kernelspecs": {"python3": {"display_name": "Python 3", "language": "python"}},
        });
        self.peer.call::<UpdateKernelSpecs>((specs,)).await?;
        self.peer.call::<UpdateKernels>((Vec::new(),)).await?;
        self.peer.call::<UpdateSessions>((Vec::new(),)).await?;
        Ok(())
    }
}

pub async fn run() -> Result<()> {
    let version = VersionInfo::from_env();
    info!(expected = ?version.worker, "Starting worker on stdio");

    run_worker(
        Channel::stdio(),
        BridgeConfig::new().with_version(version),
        |peer| {
            let worker = Arc::new(DemoWorker::new(peer));
            let registry = HandlerRegistry::new();
            register_lifecycle(&registry, Arc::clone(&worker))?;
            registry.register_with::<AddEditEvent, _, _, _>(
                Arc::clone(&worker),
                |worker, (block,)| async move {
                    worker.record_edit(&block);
                    Ok(())
                },
            )?;
            registry.register_with::<AddViewEvent, _, _, _>(
                Arc::clone(&worker),
                |worker, (event,)| async move {
                    worker.record_view(event);
                    Ok(())
                },
            )?;
            registry.register_with::<ImportIpynb, _, _, _>(
                worker,
                |worker, (block, notebook, mode)| async move {
                    worker.import(&block, &notebook, mode)
                },
            )?;
            Ok(registry)
        },
    )
    .await?;
    Ok(())
}
