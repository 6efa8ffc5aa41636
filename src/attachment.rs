//! Background attachment to the game process.
//!
//! A single long-lived task polls the [`CaptureGateway`] until it binds to the
//! target executable, watches the binding for as long as the game runs, and
//! releases it on shutdown. The current binding is published on a `watch`
//! channel; the loop is its only writer.

use crate::capture::CaptureGateway;
use crate::types::{AttachmentError, AttachmentHandle, AttachmentState, BackupError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Level};

/// State of the attachment loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Detached,
    Attached,
    ShuttingDown,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Detached => "detached",
            LoopState::Attached => "attached",
            LoopState::ShuttingDown => "shutting-down",
        }
    }
}

/// Log severities for failed attach attempts.
///
/// Both kinds are retried forever; only how loudly they are reported differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachLogPolicy {
    /// Target process not running (the normal state before the game starts)
    pub not_found: Level,
    /// Anything else that went wrong while attaching
    pub failure: Level,
}

impl Default for AttachLogPolicy {
    fn default() -> Self {
        Self {
            not_found: Level::TRACE,
            failure: Level::ERROR,
        }
    }
}

impl AttachLogPolicy {
    fn report(&self, executable: &str, err: &AttachmentError) {
        if err.is_not_found() {
            log_at(self.not_found, &format!("Cannot attach to game process (yet): {}", err));
        } else {
            log_at(
                self.failure,
                &format!("Failed to attach to game process '{}': {}", executable, err),
            );
        }
    }
}

fn log_at(level: Level, message: &str) {
    if level == Level::ERROR {
        error!("{}", message);
    } else if level == Level::WARN {
        warn!("{}", message);
    } else if level == Level::INFO {
        info!("{}", message);
    } else if level == Level::DEBUG {
        debug!("{}", message);
    } else {
        trace!("{}", message);
    }
}

/// Read side of the published attachment, handed to the backup engine
#[derive(Debug, Clone)]
pub struct AttachmentView {
    rx: watch::Receiver<Option<AttachmentHandle>>,
}

impl AttachmentView {
    /// A view that never attaches, for running without a loop
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    #[cfg(test)]
    pub(crate) fn attached(handle: AttachmentHandle) -> Self {
        let (_tx, rx) = watch::channel(Some(handle));
        Self { rx }
    }

    pub fn current(&self) -> Option<AttachmentHandle> {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> AttachmentState {
        if self.rx.borrow().is_some() {
            AttachmentState::Attached
        } else {
            AttachmentState::Detached
        }
    }
}

/// The attachment state machine, before it is spawned
pub struct ProcessAttachmentLoop {
    gateway: Arc<dyn CaptureGateway>,
    executable: String,
    poll_interval: Duration,
    log_policy: AttachLogPolicy,
    handle_tx: watch::Sender<Option<AttachmentHandle>>,
    state_tx: watch::Sender<LoopState>,
}

impl ProcessAttachmentLoop {
    pub fn new(
        gateway: Arc<dyn CaptureGateway>,
        executable: impl Into<String>,
        poll_interval: Duration,
        log_policy: AttachLogPolicy,
    ) -> (Self, AttachmentView) {
        let (handle_tx, rx) = watch::channel(None);
        let (state_tx, _) = watch::channel(LoopState::Detached);

        let this = Self {
            gateway,
            executable: executable.into(),
            poll_interval,
            log_policy,
            handle_tx,
            state_tx,
        };

        (this, AttachmentView { rx })
    }

    /// Start the loop on the runtime. Consumes the loop so it can only run once.
    pub fn spawn(self, cancel: CancellationToken) -> AttachmentTask {
        let state_rx = self.state_tx.subscribe();
        let token = cancel.clone();
        let join = tokio::spawn(self.run(token));

        AttachmentTask {
            cancel,
            join,
            state_rx,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            "Attachment loop started for '{}' ({:?} interval)",
            self.executable, self.poll_interval
        );

        let mut current: Option<AttachmentHandle> = None;

        while !cancel.is_cancelled() {
            current = match current.take() {
                None => self.try_attach().await,
                Some(handle) => self.check_alive(handle).await,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.state_tx.send_replace(LoopState::ShuttingDown);
        info!("Detaching from game process ...");

        if let Some(handle) = current {
            self.handle_tx.send_replace(None);
            self.gateway.detach(handle).await;
        }

        debug!("Attachment loop stopped");
    }

    /// Attempt a bind; at most one attempt is ever in flight
    async fn try_attach(&self) -> Option<AttachmentHandle> {
        match self.gateway.attach(&self.executable).await {
            Ok(handle) => {
                info!("Attached to game process {} (pid {})", handle.executable, handle.pid);
                self.handle_tx.send_replace(Some(handle.clone()));
                self.state_tx.send_replace(LoopState::Attached);
                Some(handle)
            }
            Err(e) => {
                self.log_policy.report(&self.executable, &e);
                None
            }
        }
    }

    async fn check_alive(&self, handle: AttachmentHandle) -> Option<AttachmentHandle> {
        if self.gateway.is_attached(&handle).await {
            return Some(handle);
        }

        info!("Game process {} (pid {}) is gone", handle.executable, handle.pid);
        self.handle_tx.send_replace(None);
        self.state_tx.send_replace(LoopState::Detached);
        self.gateway.detach(handle).await;
        None
    }
}

/// Handle to the running attachment loop
pub struct AttachmentTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    state_rx: watch::Receiver<LoopState>,
}

impl AttachmentTask {
    pub fn state(&self) -> LoopState {
        *self.state_rx.borrow()
    }

    /// Cancel the loop and wait for it to detach and exit, up to `timeout`
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        debug!("Stopping attachment loop ({})", self.state().as_str());
        self.cancel.cancel();

        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Attachment loop ended abnormally: {}", e);
                Ok(())
            }
            Err(_) => {
                warn!("Attachment loop did not stop within {:?}, aborting", timeout);
                self.join.abort();
                Err(BackupError::ShutdownTimeout(timeout))
            }
        }
    }
}
