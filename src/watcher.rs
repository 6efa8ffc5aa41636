//! Filesystem notifications for the save directory.

use crate::types::{BackupError, ChangeKind, FileChange, Result};
use glob::Pattern;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Watches one directory and forwards matching save changes.
///
/// Delivery is at least once; the same write commonly produces several
/// events. Dropping the watcher stops delivery.
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    watch_path: PathBuf,
    pattern: Pattern,
}

impl ChangeWatcher {
    pub fn start(
        watch_path: &Path,
        pattern: &str,
        sender: UnboundedSender<FileChange>,
    ) -> Result<Self> {
        let pattern = compile_pattern(pattern)?;
        let filter = pattern.clone();

        let handler = move |res: notify::Result<Event>| match res {
            Ok(event) => forward(&filter, event, &sender),
            Err(e) => warn!("Watch error: {}", e),
        };

        let mut watcher = RecommendedWatcher::new(handler, Config::default())?;
        watcher.watch(watch_path, RecursiveMode::NonRecursive)?;

        info!("Watching {:?} for '{}'", watch_path, pattern.as_str());

        Ok(Self {
            _watcher: watcher,
            watch_path: watch_path.to_path_buf(),
            pattern,
        })
    }

    pub fn watch_path(&self) -> &Path {
        &self.watch_path
    }

    pub fn matches_pattern(&self, file_name: &str) -> bool {
        self.pattern.matches(file_name)
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|e| BackupError::Config(format!("invalid watch pattern '{}': {}", pattern, e)))
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        _ => None,
    }
}

fn forward(pattern: &Pattern, event: Event, sender: &UnboundedSender<FileChange>) {
    let kind = match change_kind(&event.kind) {
        Some(kind) => kind,
        None => {
            trace!("Ignoring {:?} for {:?}", event.kind, event.paths);
            return;
        }
    };

    for path in event.paths {
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| pattern.matches(n))
            .unwrap_or(false);

        if !matches || path.is_dir() {
            continue;
        }

        if sender.send(FileChange::new(kind, path)).is_err() {
            debug!("Change receiver closed, dropping event");
            return;
        }
    }
}
