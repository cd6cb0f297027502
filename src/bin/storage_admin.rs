//! storage_admin - offline maintenance for the camera's storage card
//!
//! Runs the same administrative operations the daemon exposes, against a
//! card root, while the daemon is stopped.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use timelapse_kernel::{
    CameraConfig, DirStorage, ManualMemoryProbe, Pipeline, PipelineLimits, StorageSettings,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Card mount point. Defaults to the daemon's configured storage root.
    #[arg(long, env = "CAMERA_STORAGE_ROOT")]
    root: Option<PathBuf>,
    /// Format the card if it will not mount.
    #[arg(long)]
    format_if_mount_failed: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete the oldest photos.
    Delete {
        /// Photos per call (0 = configured maximum).
        #[arg(long, default_value_t = 0)]
        batch: usize,
        /// Repeat until the card holds no photos.
        #[arg(long)]
        all: bool,
    },
    /// Delete everything and rebuild the mount.
    Reformat,
    /// Rebuild the mount and report what is on the card.
    Remount,
    /// List photos, newest first.
    List {
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        per_page: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let (storage, limits) = match args.root {
        Some(root) => (
            StorageSettings {
                root,
                format_if_mount_failed: args.format_if_mount_failed,
            },
            PipelineLimits::default(),
        ),
        None => {
            let config = CameraConfig::load()?;
            (config.storage, config.limits)
        }
    };
    // No capture runs here, so there is nothing to let settle.
    let limits = PipelineLimits {
        admin_settle: Duration::ZERO,
        ..limits
    };

    let pipeline = Pipeline::open(
        limits,
        Box::new(DirStorage::new(&storage)),
        Arc::new(ManualMemoryProbe::new(u64::MAX)),
    )?;
    if !pipeline.status().storage_ready && !matches!(args.command, Command::Reformat) {
        return Err(anyhow!(
            "storage at {} did not mount",
            storage.root.display()
        ));
    }

    match args.command {
        Command::Delete { batch, all } => {
            let mut total = 0u64;
            loop {
                let report = pipeline.request_bulk_delete(batch)?;
                total += report.deleted;
                if !report.success {
                    return Err(anyhow!(
                        "delete stopped after {} photos, {} remaining",
                        total,
                        report.remaining
                    ));
                }
                if !all || report.remaining == 0 || report.deleted == 0 {
                    println!(
                        "{}",
                        serde_json::json!({"deleted": total, "remaining": report.remaining})
                    );
                    break;
                }
            }
        }
        Command::Reformat => {
            let report = pipeline.request_reformat()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                return Err(anyhow!("reformat did not leave the card empty"));
            }
        }
        Command::Remount => {
            let report = pipeline.request_remount()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                return Err(anyhow!("remount failed"));
            }
        }
        Command::List { page, per_page } => {
            let listing = pipeline.list_photos(page, per_page)?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}
