//! CLI Tooling
//!
//! `cachefsd daemon` runs the daemon in the foreground; every other command is a
//! client of the running daemon's control socket.

use crate::config::{ConfigLoader, DaemonConfig};
use crate::control::{ControlClient, ControlRequest, DebugReport, GcReport};
use crate::daemon::{Daemon, DaemonDeps};
use crate::error::DaemonError;
use crate::logging::{LogFormat, LogOutput, LoggingConfig};
use crate::store::ImageRecord;
use clap::{Parser, Subcommand};
use comfy_table::Table;
use std::path::PathBuf;

/// cachefsd - on-demand package-store delivery through cachefiles
#[derive(Parser)]
#[command(name = "cachefsd")]
#[command(about = "Serve content-addressed trees on demand through the kernel cachefiles facility")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (overrides default config loading)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, global = true, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log line format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log destination
    #[arg(long, global = true, value_enum)]
    pub log_output: Option<LogOutput>,

    /// Log file path (if output includes "file")
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Daemon,
    /// Mount a tree
    Mount {
        /// Store path, `<dir>/<hash>-<name>`
        tree_path: String,
        /// Where to mount it
        mount_point: String,
        /// Binary cache to resolve the tree from (default: configured upstream)
        #[arg(long)]
        upstream: Option<String>,
    },
    /// Unmount a tree
    Umount {
        tree_path: String,
    },
    /// Forget unmounted trees and release their chunks
    Gc,
    /// Show allocator, image and open-object state
    Debug {
        /// Include every image record
        #[arg(long)]
        images: bool,
        /// Include every allocated chunk
        #[arg(long)]
        chunks: bool,
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
}

impl Cli {
    /// Logging settings from config with command-line overrides applied.
    pub fn logging_config(&self, base: &LoggingConfig) -> LoggingConfig {
        let mut logging = base.clone();
        if !matches!(self.command, Commands::Daemon) && !self.verbose {
            // clients only report problems unless asked
            logging.level = "warn".to_string();
        }
        if self.verbose {
            logging.level = "debug".to_string();
        }
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            logging.format = format;
        }
        if let Some(output) = self.log_output {
            logging.output = output;
        }
        if let Some(file) = &self.log_file {
            logging.file = Some(file.clone());
        }
        logging
    }
}

/// CLI context: resolved configuration plus a control client.
pub struct CliContext {
    config: DaemonConfig,
    client: ControlClient,
}

impl CliContext {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, DaemonError> {
        let config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load()?,
        };
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: DaemonConfig) -> Self {
        let client = ControlClient::new(config.socket_path());
        Self { config, client }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Execute a CLI command
    pub async fn execute(&self, command: &Commands) -> Result<String, DaemonError> {
        match command {
            Commands::Daemon => {
                let deps = DaemonDeps::system(&self.config)?;
                let daemon = Daemon::start(self.config.clone(), deps).await?;
                daemon.run_until_signal().await?;
                Ok("cachefsd stopped".to_string())
            }
            Commands::Mount {
                tree_path,
                mount_point,
                upstream,
            } => {
                let upstream = upstream.clone().unwrap_or_else(|| self.config.upstream.clone());
                let record: ImageRecord = self
                    .client
                    .request(&ControlRequest::Mount {
                        tree_path: tree_path.clone(),
                        upstream,
                        mount_point: mount_point.clone(),
                    })
                    .await?
                    .into_data()?;
                Ok(format!("Mounted {} at {}", record.tree_path, record.mount_point))
            }
            Commands::Umount { tree_path } => {
                let record: ImageRecord = self
                    .client
                    .request(&ControlRequest::Unmount {
                        tree_path: tree_path.clone(),
                    })
                    .await?
                    .into_data()?;
                Ok(format!("Unmounted {}", record.tree_path))
            }
            Commands::Gc => {
                let report: GcReport = self.client.request(&ControlRequest::Gc {}).await?.into_data()?;
                Ok(format!("Removed {} images", report.images_removed.len()))
            }
            Commands::Debug {
                images,
                chunks,
                format,
            } => {
                let report: DebugReport = self
                    .client
                    .request(&ControlRequest::Debug {
                        include_images: *images,
                        include_chunks: *chunks,
                    })
                    .await?
                    .into_data()?;
                format_debug_report(&report, format)
            }
        }
    }
}

/// Render a debug report as JSON or as tables.
pub fn format_debug_report(report: &DebugReport, format: &str) -> Result<String, DaemonError> {
    if format == "json" {
        return serde_json::to_string_pretty(report)
            .map_err(|e| DaemonError::Fault(format!("encoding debug report: {}", e)));
    }
    if format != "text" {
        return Err(DaemonError::InvalidRequest(format!(
            "unknown format {} (expected text or json)",
            format
        )));
    }

    let mut out = format!(
        "Params: chunk_shift={} digest={}/{} block_shift={}\nChunks: {}\n\n",
        report.params.chunk_shift,
        report.params.digest_algo,
        report.params.digest_bits,
        report.block_shift,
        report.chunk_count
    );

    let mut slabs = Table::new();
    slabs.load_preset(comfy_table::presets::UTF8_FULL);
    slabs.set_header(vec!["Slab", "Next Address"]);
    for s in &report.slabs {
        slabs.add_row(vec![s.slab_id.to_string(), s.next_addr.to_string()]);
    }
    out.push_str(&slabs.to_string());
    out.push('\n');

    if !report.open_objects.is_empty() {
        let mut objects = Table::new();
        objects.load_preset(comfy_table::presets::UTF8_FULL);
        objects.set_header(vec!["Object", "Kind", "Cookie"]);
        for o in &report.open_objects {
            objects.add_row(vec![o.object_id.to_string(), o.kind.clone(), o.cookie.clone()]);
        }
        out.push_str(&objects.to_string());
        out.push('\n');
    }

    if !report.images.is_empty() {
        let mut images = Table::new();
        images.load_preset(comfy_table::presets::UTF8_FULL);
        images.set_header(vec!["Tree", "State", "Mount Point", "Image Bytes", "Error"]);
        for r in &report.images {
            images.add_row(vec![
                r.tree_path.clone(),
                format!("{:?}", r.mount_state),
                r.mount_point.clone(),
                r.image_size.to_string(),
                r.last_error.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }
        out.push_str(&images.to_string());
        out.push('\n');
    }

    if !report.chunks.is_empty() {
        let mut chunks = Table::new();
        chunks.load_preset(comfy_table::presets::UTF8_FULL);
        chunks.set_header(vec!["Digest", "Location", "Blocks", "Owners"]);
        for c in &report.chunks {
            chunks.add_row(vec![
                c.digest.clone(),
                format!("{}:{}", c.slab_id, c.addr),
                c.blocks.to_string(),
                c.owners.len().to_string(),
            ]);
        }
        out.push_str(&chunks.to_string());
        out.push('\n');
    }
    Ok(out)
}
