//! Wires the watcher, backup engine and attachment loop together.
//!
//! [`Controller`] is the validated but idle tracker; [`RunningController`]
//! owns every background resource and tears them down in order on shutdown.

use crate::attachment::{AttachmentTask, LoopState, ProcessAttachmentLoop};
use crate::capture::CaptureGateway;
use crate::config::Config;
use crate::engine::{BackupEngine, BackupOutcome};
use crate::naming::NameAllocator;
use crate::types::{BackupError, FileChange, Result};
use crate::watcher::ChangeWatcher;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A validated tracker that has not started any background work
pub struct Controller {
    config: Config,
    engine: Arc<BackupEngine>,
    attach_loop: ProcessAttachmentLoop,
}

impl Controller {
    /// Validate `config` and assemble the components.
    ///
    /// Fails before anything is spawned if the configuration cannot work.
    pub fn new(config: Config, gateway: Arc<dyn CaptureGateway>) -> Result<Self> {
        let template = config.validate()?;
        let log_policy = config.logging.attach_log_policy()?;
        let tracking = &config.tracking;

        let (attach_loop, view) = ProcessAttachmentLoop::new(
            gateway.clone(),
            tracking.process_name.clone(),
            config.timing.poll_interval(),
            log_policy,
        );

        let allocator = NameAllocator::new(tracking.backup_dir(), template);
        let engine = BackupEngine::new(allocator, gateway, view)
            .with_debounce(config.timing.debounce())
            .with_image_size(tracking.image_size);

        Ok(Self {
            config,
            engine: Arc::new(engine),
            attach_loop,
        })
    }

    pub fn engine(&self) -> &Arc<BackupEngine> {
        &self.engine
    }

    /// Start watching and attaching
    pub fn start(self) -> Result<RunningController> {
        let tracking = &self.config.tracking;
        let (tx, rx) = mpsc::unbounded_channel();

        // Watcher first: if it fails nothing has been spawned yet
        let watcher = ChangeWatcher::start(&tracking.watch_path, &tracking.watch_pattern, tx)?;
        let attachment = self.attach_loop.spawn(CancellationToken::new());

        info!("STARTING TRACKING ...");

        Ok(RunningController {
            engine: self.engine,
            watcher: Some(watcher),
            rx: Some(rx),
            tasks: JoinSet::new(),
            attachment,
            shutdown_timeout: self.config.timing.shutdown_timeout(),
        })
    }
}

/// A tracker with its watcher and attachment loop live
pub struct RunningController {
    engine: Arc<BackupEngine>,
    watcher: Option<ChangeWatcher>,
    rx: Option<UnboundedReceiver<FileChange>>,
    tasks: JoinSet<BackupOutcome>,
    attachment: AttachmentTask,
    shutdown_timeout: Duration,
}

impl RunningController {
    pub fn engine(&self) -> &Arc<BackupEngine> {
        &self.engine
    }

    pub fn attachment_state(&self) -> LoopState {
        self.attachment.state()
    }

    /// Number of backups currently in flight
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Drain change events until `shutdown` completes or the watcher goes away
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => return,
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("EXITING ...");
                    break;
                }
                change = rx.recv() => match change {
                    Some(change) => self.dispatch(change),
                    None => {
                        debug!("Change channel closed");
                        break;
                    }
                },
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => reap(res),
            }
        }

        self.rx = Some(rx);
    }

    /// Hand one change to the engine on its own task
    pub fn dispatch(&mut self, change: FileChange) {
        debug!(
            "File event = {}, name = {}, path = {:?}",
            change.kind.as_str(),
            change.file_name,
            change.full_path
        );

        let engine = self.engine.clone();
        self.tasks
            .spawn(async move { engine.on_file_changed(&change.full_path).await });
    }

    /// Stop watching, finish in-flight backups, then detach.
    ///
    /// Each wait is bounded by the configured shutdown timeout; exceeding
    /// either is reported as [`BackupError::ShutdownTimeout`] after the
    /// remaining work has been aborted.
    pub async fn shutdown(mut self) -> Result<()> {
        drop(self.watcher.take());
        drop(self.rx.take());

        let timeout = self.shutdown_timeout;
        let mut result = Ok(());

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = tasks.join_next().await {
                reap(res);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} backups still running after {:?}, aborting",
                self.tasks.len(),
                timeout
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            result = Err(BackupError::ShutdownTimeout(timeout));
        }

        if let Err(e) = self.attachment.shutdown(timeout).await {
            result = Err(e);
        }

        let records = self.engine.records().await;
        info!("Backed up {} unique saves this session", records.len());
        for record in &records {
            info!("  {}", record);
        }

        let unrecorded = self.engine.unrecorded_copies();
        if !unrecorded.is_empty() {
            warn!("{} copies were interrupted before being recorded:", unrecorded.len());
            for path in &unrecorded {
                warn!("  {:?}", path);
            }
        }

        result
    }
}

fn reap(res: std::result::Result<BackupOutcome, JoinError>) {
    match res {
        Ok(outcome) => debug!("Backup task finished: {:?}", outcome),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Backup task failed: {}", e),
    }
}
