//! Core types used throughout the save tracker.
//!
//! This module defines the data carried between the watcher, the backup engine
//! and the capture gateway, plus the error taxonomy shared by all of them.

use chrono::{DateTime, Local, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Operating system process identifier
pub type Pid = u32;

lazy_static! {
    static ref IMAGE_SIZE: Regex = Regex::new(r"^\s*([0-9]+)x([0-9]+)\s*$").unwrap();
}

/// Target size for captured screenshots, written as `WIDTHxHEIGHT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for ImageSize {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BackupError::Config(format!("invalid image size '{}', expected WIDTHxHEIGHT", s));

        let caps = IMAGE_SIZE.captures(s).ok_or_else(invalid)?;
        let width: u32 = caps[1].parse().map_err(|_| invalid())?;
        let height: u32 = caps[2].parse().map_err(|_| invalid())?;

        if width == 0 || height == 0 {
            return Err(invalid());
        }

        Ok(Self { width, height })
    }
}

impl TryFrom<String> for ImageSize {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageSize> for String {
    fn from(size: ImageSize) -> Self {
        size.to_string()
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Opaque token for an established binding to the game process.
///
/// Issued by a [`CaptureGateway`](crate::capture::CaptureGateway) and handed
/// back to it for liveness checks, screenshots and detaching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHandle {
    /// Process the gateway is bound to
    pub pid: Pid,
    /// Executable name as reported by the process list
    pub executable: String,
    /// When the binding was established
    pub attached_at: DateTime<Utc>,
}

impl AttachmentHandle {
    pub fn new(pid: Pid, executable: impl Into<String>) -> Self {
        Self {
            pid,
            executable: executable.into(),
            attached_at: Utc::now(),
        }
    }
}

/// Whether a screenshot can currently be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentState {
    Detached,
    Attached,
}

/// Kind of filesystem change reported by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Renamed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Renamed => "renamed",
        }
    }
}

/// A single raw change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeKind,
    /// File name relative to the watched directory
    pub file_name: String,
    /// Absolute path of the changed file
    pub full_path: PathBuf,
}

impl FileChange {
    pub fn new(kind: ChangeKind, full_path: PathBuf) -> Self {
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            kind,
            file_name,
            full_path,
        }
    }
}

/// A save that has been backed up this session. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveRecord {
    /// Content fingerprint (dedup key)
    pub fingerprint: String,
    /// Path of the `.sav` copy in the backup directory
    pub backup_path: PathBuf,
    /// Path of the `.jpg` screenshot, if one was captured
    pub screenshot_path: Option<PathBuf>,
    /// When the backup was taken
    pub captured_at: DateTime<Local>,
    /// Allocated backup name (file stem)
    pub location_name: String,
    /// Save file that triggered the backup
    pub source_path: PathBuf,
}

impl fmt::Display for SaveRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} ({})]",
            self.captured_at.format("%Y-%m-%d %H:%M:%S"),
            self.location_name,
            self.fingerprint
        )
    }
}

/// Errors raised while binding to the game process
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    /// Expected steady state while the game is not running
    #[error("No executable found matching '{0}'")]
    NoMatchingProcess(String),

    #[error("Attach failed: {0}")]
    Failed(String),

    #[error("Process enumeration failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AttachmentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AttachmentError::NoMatchingProcess(_))
    }
}

/// Errors raised while requesting a screenshot
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Game returned no image")]
    NoImage,

    #[error("Screen capture is not supported on this platform")]
    Unsupported,

    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("Capture failed: {0}")]
    Failed(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Errors produced by the tracker
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// File momentarily unreadable; the next change event retries naturally
    #[error("Cannot read {}: {source}", path.display())]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Catalog invariant violation; never expected with correct call order
    #[error("Fingerprint already recorded: {0}")]
    DuplicateFingerprint(String),

    #[error("Cannot copy {} to {}: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Background task did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BackupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size_parse() {
        let size: ImageSize = "1280x720".parse().unwrap();
        assert_eq!(size, ImageSize::new(1280, 720));
        assert_eq!(size.to_string(), "1280x720");
    }

    #[test]
    fn test_image_size_rejects_garbage() {
        assert!("1280".parse::<ImageSize>().is_err());
        assert!("0x720".parse::<ImageSize>().is_err());
        assert!("axb".parse::<ImageSize>().is_err());
    }

    #[test]
    fn test_file_change_name() {
        let change = FileChange::new(ChangeKind::Modified, PathBuf::from("/saves/slot1.sav"));
        assert_eq!(change.file_name, "slot1.sav");
        assert_eq!(change.kind.as_str(), "modified");
    }

    #[test]
    fn test_save_record_display() {
        let record = SaveRecord {
            fingerprint: "abc123".to_string(),
            backup_path: PathBuf::from("/backup/save_1.sav"),
            screenshot_path: None,
            captured_at: Local::now(),
            location_name: "save_1".to_string(),
            source_path: PathBuf::from("/saves/slot1.sav"),
        };

        let shown = record.to_string();
        assert!(shown.contains("save_1"));
        assert!(shown.ends_with("(abc123)]"));
    }

    #[test]
    fn test_attachment_error_not_found() {
        assert!(AttachmentError::NoMatchingProcess("game".into()).is_not_found());
        assert!(!AttachmentError::Failed("boom".into()).is_not_found());
    }
}
