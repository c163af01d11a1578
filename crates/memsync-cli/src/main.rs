use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use memsync_core::{ConflictPolicy, DestinationOptions, MediaType, Record, SyncOptions};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum DestKind {
    Local,
    Drive,
}

#[derive(Clone, Copy, ValueEnum)]
enum Conflict {
    Skip,
    Overwrite,
    New,
}

impl From<Conflict> for ConflictPolicy {
    fn from(c: Conflict) -> Self {
        match c {
            Conflict::Skip => ConflictPolicy::Skip,
            Conflict::Overwrite => ConflictPolicy::Overwrite,
            Conflict::New => ConflictPolicy::New,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MediaFilter {
    Image,
    Video,
}

impl From<MediaFilter> for MediaType {
    fn from(m: MediaFilter) -> Self {
        match m {
            MediaFilter::Image => MediaType::Image,
            MediaFilter::Video => MediaType::Video,
        }
    }
}

#[derive(Parser)]
#[command(name = "memsync", version, about = "Download exported memories, burn in overlays and sync them to a folder or Google Drive")]
struct Cli {
    /// JSON array of records with their filename prefixes assigned
    records: PathBuf,

    /// Where to store the results
    #[arg(long, value_enum, default_value = "local")]
    dest: DestKind,

    /// Output directory for --dest local
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Existing Drive folder ID (a new folder is created when omitted)
    #[arg(long)]
    drive_folder: Option<String>,

    /// Name for a newly created Drive folder
    #[arg(long, default_value = "Snapchat Memories")]
    drive_folder_name: String,

    /// OAuth access token with Drive file scope
    #[arg(long, env = "MEMSYNC_DRIVE_TOKEN", hide_env_values = true)]
    drive_token: Option<String>,

    /// What to do when a file with the same name already exists
    #[arg(long, value_enum, default_value = "skip")]
    conflict: Conflict,

    /// Write a url -> outcomes JSON report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Download timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Path to ffmpeg (default: look it up on PATH)
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Only process records of this media type
    #[arg(long, value_enum)]
    media_type: Option<MediaFilter>,

    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let t_total = std::time::Instant::now();

    let text = std::fs::read_to_string(&cli.records)
        .with_context(|| format!("failed to read {}", cli.records.display()))?;
    let records: Vec<Record> =
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", cli.records.display()))?;

    let destination = match cli.dest {
        DestKind::Local => DestinationOptions::Local {
            dir: cli.output.context("--output is required for --dest local")?,
        },
        DestKind::Drive => DestinationOptions::Drive {
            folder_id: cli.drive_folder,
            folder_name: cli.drive_folder_name,
            access_token: cli
                .drive_token
                .context("--drive-token or MEMSYNC_DRIVE_TOKEN is required for --dest drive")?,
        },
    };

    let options = SyncOptions {
        destination,
        conflict: cli.conflict.into(),
        report: cli.report,
        download_timeout_secs: cli.timeout,
        ffmpeg: cli.ffmpeg,
        media_type: cli.media_type.map(MediaType::from),
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} {msg}")?,
    );
    let bar = pb.clone();
    let result = memsync_core::run(&options, records, &move |_stage, current, total, message| {
        bar.set_length(total);
        bar.set_position(current + 1);
        bar.set_message(message.to_string());
    });
    pb.finish_and_clear();
    let result = result?;

    eprintln!(
        "Done! {} records, {} files written, {} skipped, {} already present, {} filtered, {} without output ({:.2}s)",
        result.total_records,
        result.files_written,
        result.files_skipped,
        result.already_present,
        result.filtered_out,
        result.records_without_output,
        t_total.elapsed().as_secs_f64()
    );

    Ok(())
}
