//! Command line interface.

use crate::config::Config;
use crate::types::ImageSize;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "save-tracker",
    version,
    about = "Back up every unique game save, with a screenshot of where it was made"
)]
pub struct Cli {
    /// Directory the game writes its saves to
    #[arg(short = 'i', long)]
    pub input_path: Option<PathBuf>,

    /// Directory backups are written to (default: <input>/Backup)
    #[arg(short = 'o', long)]
    pub output_path: Option<PathBuf>,

    /// Save file pattern, e.g. "*.sav"
    #[arg(short = 'w', long)]
    pub wildcard: Option<String>,

    /// Backup naming format, e.g. "save_{time}_{seq:03}_{hash}"
    #[arg(short = 'f', long)]
    pub format: Option<String>,

    /// Game executable name
    #[arg(short = 'p', long)]
    pub process_name: Option<String>,

    /// Screenshot size as WIDTHxHEIGHT
    #[arg(short = 's', long)]
    pub image_size: Option<ImageSize>,

    /// 0 = trace, 1 = info, 2 = warn, 3+ = error
    #[arg(short = 'v', long)]
    pub verbosity: Option<u8>,

    /// Config file path
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_config_path)
    }

    /// Layer command line values over `config`
    pub fn apply_to(&self, config: &mut Config) {
        let tracking = &mut config.tracking;

        if let Some(path) = &self.input_path {
            tracking.watch_path = path.clone();
        }
        if let Some(path) = &self.output_path {
            tracking.backup_path = Some(path.clone());
        }
        if let Some(pattern) = &self.wildcard {
            tracking.watch_pattern = pattern.clone();
        }
        if let Some(format) = &self.format {
            tracking.naming_format = format.clone();
        }
        if let Some(name) = &self.process_name {
            tracking.process_name = name.clone();
        }
        if let Some(size) = self.image_size {
            tracking.image_size = Some(size);
        }
        if let Some(verbosity) = self.verbosity {
            config.logging.level = verbosity_level(verbosity).to_string();
        }
    }
}

pub fn verbosity_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "trace",
        1 => "info",
        2 => "warn",
        _ => "error",
    }
}
