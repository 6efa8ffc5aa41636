//! Save Tracker - game save backups with screenshots
//!
//! Watches a game's save directory and keeps a copy of every distinct save
//! the game writes. Saves are deduplicated by a content fingerprint, so a
//! slot the game rewrites with unchanged data is only backed up once.
//!
//! # Architecture
//!
//! - **Watcher**: forwards matching filesystem events onto a channel
//! - **Engine**: fingerprints, deduplicates, names and copies each save
//! - **Attachment loop**: keeps a binding to the running game so a screenshot
//!   can be stored next to each backup
//!
//! The [`Controller`] wires these together and owns their shutdown.

pub mod attachment;
pub mod capture;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod controller;
pub mod engine;
pub mod hasher;
pub mod naming;
pub mod process;
pub mod types;
pub mod watcher;

// Re-export commonly used types
pub use attachment::{AttachLogPolicy, AttachmentView, LoopState, ProcessAttachmentLoop};
pub use capture::{CaptureGateway, SystemCaptureGateway};
pub use catalog::SaveCatalog;
pub use cli::Cli;
pub use config::{Config, ConfigSource};
pub use controller::{Controller, RunningController};
pub use engine::{BackupEngine, BackupOutcome};
pub use naming::{NameAllocator, NamingTemplate};
pub use types::{
    AttachmentError, AttachmentHandle, AttachmentState, BackupError, CaptureError, ChangeKind,
    FileChange, ImageSize, SaveRecord,
};
pub use watcher::ChangeWatcher;
