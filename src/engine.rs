//! Save deduplication and backup.
//!
//! Every change notification funnels through [`BackupEngine::on_file_changed`].
//! Content is fingerprinted outside the lock; everything from the catalog
//! lookup to recording the new entry runs under one mutex so two events with
//! identical content can never both be backed up, and two allocations can
//! never pick the same name. File reads, copies and image encoding run on the
//! blocking pool.

use crate::attachment::AttachmentView;
use crate::capture::{self, CaptureGateway};
use crate::catalog::SaveCatalog;
use crate::hasher::{self, short_fingerprint};
use crate::naming::NameAllocator;
use crate::types::{BackupError, ImageSize, SaveRecord};
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Default wait before reading a freshly notified file
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// What happened to a single change notification
#[derive(Debug, Clone, PartialEq)]
pub enum BackupOutcome {
    /// A new unique save was copied and recorded
    BackedUp(SaveRecord),
    /// Content already backed up this session
    Duplicate(String),
    /// File vanished before it could be read
    Missing,
    /// File could not be read or changed mid-copy; the next event retries
    Unreadable,
    /// Copy to the backup directory failed; nothing was recorded
    CopyFailed,
}

impl BackupOutcome {
    pub fn record(&self) -> Option<&SaveRecord> {
        match self {
            BackupOutcome::BackedUp(record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    catalog: SaveCatalog,
    /// Next sequence to try; advances past every allocation
    next_sequence: u64,
}

/// Result of copying a save and re-reading the copy
enum CopyCheck {
    Verified,
    /// Source content differs from the fingerprint taken before the copy
    Changed,
}

/// Orchestrates hashing, dedup, naming, copying and screenshots
pub struct BackupEngine {
    allocator: NameAllocator,
    gateway: Arc<dyn CaptureGateway>,
    attachment: AttachmentView,
    image_size: Option<ImageSize>,
    debounce: Duration,
    state: Mutex<EngineState>,
    /// Copies whose task was dropped before the record step
    unrecorded: std::sync::Mutex<Vec<PathBuf>>,
}

/// Notes a finished copy that never reached the catalog
struct UnrecordedGuard<'a> {
    engine: &'a BackupEngine,
    path: Option<PathBuf>,
}

impl UnrecordedGuard<'_> {
    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for UnrecordedGuard<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            warn!("Backup {:?} was interrupted before it was recorded; file kept", path);
            self.engine
                .unrecorded
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(path);
        }
    }
}

impl BackupEngine {
    pub fn new(
        allocator: NameAllocator,
        gateway: Arc<dyn CaptureGateway>,
        attachment: AttachmentView,
    ) -> Self {
        Self {
            allocator,
            gateway,
            attachment,
            image_size: None,
            debounce: DEFAULT_DEBOUNCE,
            state: Mutex::new(EngineState::default()),
            unrecorded: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Delay before reading a notified file. Zero disables it.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Size screenshots are scaled to
    pub fn with_image_size(mut self, image_size: Option<ImageSize>) -> Self {
        self.image_size = image_size;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        self.allocator.backup_dir()
    }

    /// Handle one raw change notification for `source`.
    ///
    /// Never fails: every problem is logged and reflected in the outcome.
    pub async fn on_file_changed(&self, source: &Path) -> BackupOutcome {
        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }

        match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                trace!("{:?} no longer exists, ignoring event", source);
                return BackupOutcome::Missing;
            }
        }

        let path = source.to_path_buf();
        let fingerprint = match run_blocking(move || {
            hasher::fingerprint(&path).map_err(|source| BackupError::TransientIo { path, source })
        })
        .await
        {
            Ok(fp) => fp,
            Err(e) => {
                warn!("{} (will retry on next change)", e);
                return BackupOutcome::Unreadable;
            }
        };
        let short = short_fingerprint(&fingerprint).to_string();

        let mut state = self.state.lock().await;

        if let Some(existing) = state.catalog.get(&fingerprint) {
            debug!(
                "Save {:?} unchanged ({}), already backed up as {}",
                source, short, existing.location_name
            );
            return BackupOutcome::Duplicate(fingerprint);
        }

        let captured_at = Local::now();
        let allocation = match self
            .allocator
            .allocate(&fingerprint, state.next_sequence, &captured_at)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                error!("Problem with saving backup ({}): {}", short, e);
                return BackupOutcome::CopyFailed;
            }
        };
        state.next_sequence = allocation.sequence.wrapping_add(1);

        let backup_path = self.allocator.save_path(&allocation.name);
        let (from, to, expected) = (source.to_path_buf(), backup_path.clone(), fingerprint.clone());
        match run_blocking(move || copy_verified(&from, &to, &expected)).await {
            Ok(CopyCheck::Verified) => {}
            Ok(CopyCheck::Changed) => {
                debug!("{:?} changed while copying ({}), discarding copy", source, short);
                return BackupOutcome::Unreadable;
            }
            Err(e) => {
                error!("Problem with saving backup ({}): {}", short, e);
                return BackupOutcome::CopyFailed;
            }
        }

        let guard = UnrecordedGuard {
            engine: self,
            path: Some(backup_path.clone()),
        };

        let screenshot_path = self.grab_screenshot(&allocation.name).await;

        let record = SaveRecord {
            fingerprint,
            backup_path,
            screenshot_path,
            captured_at,
            location_name: allocation.name,
            source_path: source.to_path_buf(),
        };

        let recorded = state.catalog.record(record.clone());
        guard.disarm();
        if let Err(e) = recorded {
            // Unreachable while the lock is held across check and record
            error!("Catalog rejected {}: {}", record.location_name, e);
            return BackupOutcome::Duplicate(record.fingerprint);
        }

        info!("New save location: {}", record);
        BackupOutcome::BackedUp(record)
    }

    /// Capture and store a screenshot if the game is attached.
    ///
    /// Failures only cost the screenshot, never the backup.
    async fn grab_screenshot(&self, name: &str) -> Option<PathBuf> {
        let handle = self.attachment.current()?;

        if !self.gateway.is_attached(&handle).await {
            debug!("Game process {} no longer attached, skipping screenshot", handle.pid);
            return None;
        }

        let image = match self.gateway.capture_screenshot(&handle, self.image_size).await {
            Ok(image) => image,
            Err(e) => {
                warn!("Screenshot for {} failed: {}", name, e);
                return None;
            }
        };

        let path = self.allocator.screenshot_path(name);
        let target = path.clone();
        match run_blocking(move || Ok(capture::save_screenshot(&image, &target)?)).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Cannot write screenshot {:?}: {}", path, e);
                remove_quietly(&path);
                None
            }
        }
    }

    pub async fn catalog_len(&self) -> usize {
        self.state.lock().await.catalog.len()
    }

    /// Snapshot of recorded saves in backup order
    pub async fn records(&self) -> Vec<SaveRecord> {
        self.state.lock().await.catalog.iter().cloned().collect()
    }

    /// Backups copied to disk whose task was cancelled before recording them
    pub fn unrecorded_copies(&self) -> Vec<PathBuf> {
        self.unrecorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, BackupError>
where
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BackupError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Copy `from` to the fresh path `to` and check the copy against `expected`.
///
/// A copy that fails or no longer matches is removed.
fn copy_verified(from: &Path, to: &Path, expected: &str) -> Result<CopyCheck, BackupError> {
    copy_new(from, to)?;

    match hasher::fingerprint(to) {
        Ok(copied) if copied == expected => Ok(CopyCheck::Verified),
        Ok(_) => {
            remove_quietly(to);
            Ok(CopyCheck::Changed)
        }
        Err(source) => {
            remove_quietly(to);
            Err(BackupError::TransientIo {
                path: to.to_path_buf(),
                source,
            })
        }
    }
}

/// Copy `from` to a destination that must not exist yet.
///
/// A partially written destination is removed; a pre-existing one is left alone.
fn copy_new(from: &Path, to: &Path) -> Result<u64, BackupError> {
    let copy_err = |source: io::Error| BackupError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    let mut src = File::open(from).map_err(copy_err)?;
    let mut dst = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .map_err(copy_err)?;

    let written = io::copy(&mut src, &mut dst).and_then(|n| dst.sync_all().map(|_| n));
    match written {
        Ok(n) => Ok(n),
        Err(e) => {
            drop(dst);
            remove_quietly(to);
            Err(copy_err(e))
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Cannot remove {:?}: {}", path, e);
        }
    }
}
