//! Backup name allocation.
//!
//! Backup names come from a user-supplied template such as
//! `save_{time}_{seq:03}_{hash}`. The allocator renders the template and bumps
//! the sequence number until the resulting `<name>.sav` does not exist yet in
//! the backup directory.
//!
//! Placeholders (the numeric aliases mirror positional format strings):
//!
//! - `{time}` / `{0}`: local timestamp, optional strftime format (default `%y%m%d_%H%M%S`).
//!   A format without `%` is read as a date pattern such as `yyMMdd_HHmmss`.
//! - `{seq}` / `{1}`: sequence number, optional zero-pad width (`{seq:03}`), or
//!   a run of zeros giving the width by its length (`{1:000}`)
//! - `{hash}` / `{2}`: fingerprint prefix, optional length (default 6)
//!
//! `{{` and `}}` produce literal braces.

use crate::hasher::SHORT_FINGERPRINT_LEN;
use crate::types::{BackupError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Extension of backed-up save files
pub const SAVE_EXTENSION: &str = "sav";

/// Extension of captured screenshots
pub const SCREENSHOT_EXTENSION: &str = "jpg";

const DEFAULT_TIME_FORMAT: &str = "%y%m%d_%H%M%S";

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{|\}\}|\{([A-Za-z0-9_]+)(?::([^{}]*))?\}").unwrap();
    static ref DATE_PATTERN_TOKEN: Regex = Regex::new(r"yyyy|yy|MM|dd|HH|mm|ss|[A-Za-z]").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Time(String),
    Sequence { width: usize },
    Hash { len: usize },
}

/// Parsed naming template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl NamingTemplate {
    /// Parse a template, rejecting unknown placeholders and malformed formats
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let whole = match caps.get(0) {
                Some(m) => m,
                None => continue,
            };
            push_literal(&mut literal, &template[last..whole.start()], template)?;
            last = whole.end();

            match whole.as_str() {
                "{{" => literal.push('{'),
                "}}" => literal.push('}'),
                _ => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let name = &caps[1];
                    let spec = caps.get(2).map(|m| m.as_str());
                    segments.push(parse_placeholder(name, spec, template)?);
                }
            }
        }

        push_literal(&mut literal, &template[last..], template)?;
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if segments.is_empty() {
            return Err(BackupError::Config("naming format is empty".to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// The template as written in the configuration
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the template embeds the sequence number.
    ///
    /// Without it a name collision cannot be resolved.
    pub fn has_sequence(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Sequence { .. }))
    }

    /// Render a candidate name
    pub fn render(&self, now: &DateTime<Local>, sequence: u64, fingerprint: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Time(format) => out.push_str(&now.format(format).to_string()),
                Segment::Sequence { width } => {
                    out.push_str(&format!("{:0width$}", sequence, width = *width))
                }
                Segment::Hash { len } => out.extend(fingerprint.chars().take(*len)),
            }
        }
        out
    }
}

fn push_literal(buf: &mut String, text: &str, template: &str) -> Result<()> {
    if text.contains('{') || text.contains('}') {
        return Err(BackupError::Config(format!(
            "unbalanced brace in naming format '{}'",
            template
        )));
    }
    if text.contains('/') || text.contains('\\') {
        return Err(BackupError::Config(format!(
            "naming format '{}' must not contain path separators",
            template
        )));
    }
    buf.push_str(text);
    Ok(())
}

fn parse_placeholder(name: &str, spec: Option<&str>, template: &str) -> Result<Segment> {
    let bad_spec = |spec: &str| {
        BackupError::Config(format!(
            "invalid format '{}' for '{{{}}}' in naming format '{}'",
            spec, name, template
        ))
    };

    match name {
        "time" | "0" => {
            let format = match spec {
                None => DEFAULT_TIME_FORMAT.to_string(),
                Some(s) if s.contains('%') => s.to_string(),
                Some(s) => date_pattern_to_strftime(s).ok_or_else(|| bad_spec(s))?,
            };

            let mut has_field = false;
            for item in StrftimeItems::new(&format) {
                match item {
                    Item::Error => return Err(bad_spec(&format)),
                    Item::Literal(_) | Item::OwnedLiteral(_) | Item::Space(_) | Item::OwnedSpace(_) => {}
                    _ => has_field = true,
                }
            }
            if !has_field || format.contains('/') || format.contains('\\') {
                return Err(bad_spec(&format));
            }
            Ok(Segment::Time(format))
        }
        "seq" | "1" => {
            let width = match spec {
                Some(s) if !s.is_empty() && s.bytes().all(|b| b == b'0') => s.len(),
                Some(s) => s.parse::<usize>().map_err(|_| bad_spec(s))?,
                None => 0,
            };
            Ok(Segment::Sequence { width })
        }
        "hash" | "2" => {
            let len = match spec {
                Some(s) => s
                    .parse::<usize>()
                    .ok()
                    .filter(|len| *len > 0)
                    .ok_or_else(|| bad_spec(s))?,
                None => SHORT_FINGERPRINT_LEN,
            };
            Ok(Segment::Hash { len })
        }
        other => Err(BackupError::Config(format!(
            "unknown placeholder '{{{}}}' in naming format '{}'",
            other, template
        ))),
    }
}

/// Translate a `yyMMdd_HHmmss` style date pattern into strftime.
///
/// Letters outside the known fields are rejected rather than copied.
fn date_pattern_to_strftime(pattern: &str) -> Option<String> {
    let mut out = String::new();
    let mut last = 0;

    for token in DATE_PATTERN_TOKEN.find_iter(pattern) {
        out.push_str(&pattern[last..token.start()]);
        out.push_str(match token.as_str() {
            "yyyy" => "%Y",
            "yy" => "%y",
            "MM" => "%m",
            "dd" => "%d",
            "HH" => "%H",
            "mm" => "%M",
            "ss" => "%S",
            _ => return None,
        });
        last = token.end();
    }

    out.push_str(&pattern[last..]);
    Some(out)
}

/// A name chosen by the allocator together with the sequence it used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub name: String,
    pub sequence: u64,
}

/// Generates backup names that do not collide with existing files
#[derive(Debug, Clone)]
pub struct NameAllocator {
    backup_dir: PathBuf,
    template: NamingTemplate,
}

impl NameAllocator {
    pub fn new(backup_dir: impl Into<PathBuf>, template: NamingTemplate) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            template,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn template(&self) -> &NamingTemplate {
        &self.template
    }

    /// Pick the first name at or after `seed` whose `.sav` is free.
    ///
    /// Nothing is created or reserved. A template without `{seq}` renders the
    /// same name for every sequence, so a taken name is an error there.
    pub fn allocate(&self, fingerprint: &str, seed: u64, now: &DateTime<Local>) -> Result<Allocation> {
        let mut sequence = seed;
        loop {
            let name = self.template.render(now, sequence, fingerprint);
            // A dangling symlink still blocks `create_new`
            if fs::symlink_metadata(self.save_path(&name)).is_err() {
                return Ok(Allocation { name, sequence });
            }
            if !self.template.has_sequence() {
                return Err(BackupError::Config(format!(
                    "backup name '{}' already exists and '{}' has no {{seq}} to resolve it",
                    name,
                    self.template.as_str()
                )));
            }
            trace!("Backup name {} taken, trying next sequence", name);
            sequence = sequence.wrapping_add(1);
        }
    }

    /// Path of the `.sav` backup for a name
    pub fn save_path(&self, name: &str) -> PathBuf {
        self.backup_dir.join(format!("{}.{}", name, SAVE_EXTENSION))
    }

    /// Path of the `.jpg` screenshot for a name
    pub fn screenshot_path(&self, name: &str) -> PathBuf {
        self.backup_dir.join(format!("{}.{}", name, SCREENSHOT_EXTENSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_render_default_style() {
        let template = NamingTemplate::parse("save_{time}_{seq:03}_{hash}").unwrap();
        let name = template.render(&fixed_time(), 7, "abcdef0123456789");
        assert_eq!(name, "save_240309_140507_007_abcdef");
    }

    #[test]
    fn test_positional_aliases() {
        let template = NamingTemplate::parse("hellblade_{0:%Y}_{1:2}_{2:4}").unwrap();
        let name = template.render(&fixed_time(), 3, "abcdef");
        assert_eq!(name, "hellblade_2024_03_abcd");
    }

    #[test]
    fn test_legacy_positional_format() {
        let template = NamingTemplate::parse("hellblade_{0:yyMMdd_HHmmss}_{1:000}_{2}").unwrap();
        let name = template.render(&fixed_time(), 7, "abcdef0123");
        assert_eq!(name, "hellblade_240309_140507_007_abcdef");
    }

    #[test]
    fn test_date_pattern_fields() {
        let template = NamingTemplate::parse("{time:yyyy-MM-dd}").unwrap();
        assert_eq!(template.render(&fixed_time(), 0, ""), "2024-03-09");
    }

    #[test]
    fn test_time_format_needs_a_field() {
        assert!(NamingTemplate::parse("a_{time:__}_{seq}").is_err());
        assert!(NamingTemplate::parse("a_{0:literal}_{seq}").is_err());
        assert!(NamingTemplate::parse("a_{time:%%}_{seq}").is_err());
    }

    #[test]
    fn test_escaped_braces() {
        let template = NamingTemplate::parse("{{x}}{seq}").unwrap();
        assert_eq!(template.render(&fixed_time(), 1, ""), "{x}1");
    }

    #[test]
    fn test_rejects_bad_templates() {
        assert!(NamingTemplate::parse("").is_err());
        assert!(NamingTemplate::parse("name{bogus}").is_err());
        assert!(NamingTemplate::parse("name{seq:abc}").is_err());
        assert!(NamingTemplate::parse("name{hash:0}").is_err());
        assert!(NamingTemplate::parse("name{seq").is_err());
        assert!(NamingTemplate::parse("dir/name{seq}").is_err());
        assert!(NamingTemplate::parse("name{time:%Y/%m}").is_err());
    }

    #[test]
    fn test_has_sequence() {
        assert!(NamingTemplate::parse("a{seq}").unwrap().has_sequence());
        assert!(NamingTemplate::parse("a{1}").unwrap().has_sequence());
        assert!(!NamingTemplate::parse("a{hash}").unwrap().has_sequence());
    }

    #[test]
    fn test_allocate_free_name() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = NameAllocator::new(dir.path(), NamingTemplate::parse("name{seq}").unwrap());

        let allocation = allocator.allocate("ff", 0, &fixed_time()).unwrap();
        assert_eq!(allocation, Allocation { name: "name0".to_string(), sequence: 0 });
    }

    #[test]
    fn test_allocate_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("name0.sav"), b"x").unwrap();
        let allocator = NameAllocator::new(dir.path(), NamingTemplate::parse("name{seq}").unwrap());

        let allocation = allocator.allocate("ff", 0, &fixed_time()).unwrap();
        assert_eq!(allocation.name, "name1");
        assert_eq!(allocation.sequence, 1);
        assert!(!allocator.save_path(&allocation.name).exists());
    }

    #[test]
    fn test_allocate_skips_run_of_collisions() {
        let dir = tempfile::tempdir().unwrap();
        for i in 2..6 {
            std::fs::write(dir.path().join(format!("slot_{:02}.sav", i)), b"x").unwrap();
        }
        let allocator = NameAllocator::new(dir.path(), NamingTemplate::parse("slot_{seq:02}").unwrap());

        let allocation = allocator.allocate("ff", 2, &fixed_time()).unwrap();
        assert_eq!(allocation.name, "slot_06");
    }

    #[test]
    fn test_only_sav_counts_as_collision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("name0.jpg"), b"x").unwrap();
        let allocator = NameAllocator::new(dir.path(), NamingTemplate::parse("name{seq}").unwrap());

        assert_eq!(allocator.allocate("ff", 0, &fixed_time()).unwrap().name, "name0");
    }

    #[test]
    fn test_collision_without_sequence_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("save_abcdef.sav"), b"x").unwrap();
        let allocator = NameAllocator::new(dir.path(), NamingTemplate::parse("save_{hash}").unwrap());

        assert!(allocator.allocate("abcdef99", 0, &fixed_time()).is_err());
        assert_eq!(allocator.allocate("123456", 0, &fixed_time()).unwrap().name, "save_123456");
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_counts_as_taken() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("name0.sav")).unwrap();
        let allocator = NameAllocator::new(dir.path(), NamingTemplate::parse("name{seq}").unwrap());

        assert_eq!(allocator.allocate("ff", 0, &fixed_time()).unwrap().name, "name1");
    }

    #[test]
    fn test_paths() {
        let allocator = NameAllocator::new("/backup", NamingTemplate::parse("n{seq}").unwrap());
        assert_eq!(allocator.save_path("n1"), PathBuf::from("/backup/n1.sav"));
        assert_eq!(allocator.screenshot_path("n1"), PathBuf::from("/backup/n1.jpg"));
    }
}
