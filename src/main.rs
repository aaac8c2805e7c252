use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

use gps_tracker_rs::archive::{split_track_segments, track_length, Archiver, DatasetId, DEFAULT_SEGMENT_GAP};
use gps_tracker_rs::merger::{self, StreamMerger};
use gps_tracker_rs::types::TRANSFER_DATA;
use gps_tracker_rs::{BusMessage, Config, JsonLinesStore, MessageBus, Publisher};

#[derive(Parser, Debug)]
#[command(name = "gps_tracker")]
#[command(about = "GPS/barometer/IMU stream merger and track log archiver", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Live log directory (overrides config)
    #[arg(long, global = true)]
    live_dir: Option<PathBuf>,

    /// Archive directory (overrides config)
    #[arg(long, global = true)]
    archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge newline-delimited {"channel", "data"} messages and print accepted fixes
    Merge {
        /// Message file (stdin when omitted)
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Move one live dataset to its archive file
    Archive { dataset: String },

    /// Archive every live dataset outside the given month
    ArchiveStale {
        /// YYYYMM, defaults to the current UTC month
        #[arg(long)]
        month: Option<String>,
    },

    /// Load an archive file back into the live log
    Restore { dataset: String },

    /// List datasets
    Datasets {
        #[arg(long, default_value = "*")]
        category: String,

        /// YYYYMMDD, `*` wildcards allowed
        #[arg(long, default_value = "*")]
        date: String,

        /// List archive files instead of live logs
        #[arg(long, default_value_t = false)]
        archived: bool,
    },

    /// Print the rows of a dataset as JSON
    Show {
        dataset: String,

        #[arg(long)]
        utc_min: Option<f64>,

        #[arg(long)]
        utc_max: Option<f64>,

        #[arg(long, default_value_t = false)]
        from_archive: bool,

        /// Split into segments at time gaps
        #[arg(long, default_value_t = false)]
        segments: bool,

        /// Gap that starts a new segment (seconds)
        #[arg(long, default_value_t = DEFAULT_SEGMENT_GAP)]
        segment_gap: f64,

        /// Print the track length instead of the rows
        #[arg(long, default_value_t = false)]
        length: bool,
    },
}

#[derive(Deserialize)]
struct Envelope {
    channel: String,
    data: Value,
}

fn parse_envelope(line: &str) -> Result<BusMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(line)?;
    let data = match envelope.data {
        Value::String(text) => text,
        other => other.to_string(),
    };
    Ok(BusMessage::new(envelope.channel, data))
}

fn local_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn open_archiver(config: &Config) -> Result<Archiver<JsonLinesStore>> {
    let store = JsonLinesStore::open(&config.storage.live_dir)
        .with_context(|| format!("Failed to open live log at {}", config.storage.live_dir.display()))?;
    Ok(Archiver::new(store, &config.storage.archive_dir))
}

fn dataset_id(text: &str) -> Result<DatasetId> {
    text.parse::<DatasetId>()
        .with_context(|| format!("Bad dataset id '{}'", text))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = args.live_dir {
        config.storage.live_dir = dir;
    }
    if let Some(dir) = args.archive_dir {
        config.storage.archive_dir = dir;
    }

    match args.command {
        Command::Merge { input } => run_merge(config, input).await,
        Command::Archive { dataset } => {
            let outcome = open_archiver(&config)?.move_to_archive(&dataset_id(&dataset)?)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::ArchiveStale { month } => {
            let month = month.unwrap_or_else(|| Utc::now().format("%Y%m").to_string());
            let results = open_archiver(&config)?.archive_stale(&month)?;
            let failed = results.iter().filter(|(_, result)| result.is_err()).count();
            for (id, result) in &results {
                match result {
                    Ok(outcome) => println!("{} -> {} ({} entries)", id, outcome.path.display(), outcome.entries),
                    Err(e) => println!("{} failed: {}", id, e),
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} datasets could not be archived", failed, results.len());
            }
            Ok(())
        }
        Command::Restore { dataset } => {
            let id = dataset_id(&dataset)?;
            let restored = open_archiver(&config)?.restore_from_archive(&id)?;
            println!("restored {} entries into {}", restored, id.key());
            Ok(())
        }
        Command::Datasets { category, date, archived } => {
            let archiver = open_archiver(&config)?;
            let datasets = if archived {
                archiver.archived_datasets(&category, &date)?
            } else {
                archiver.available_datasets(&category, &date)?
            };
            for id in datasets {
                println!("{}", id);
            }
            Ok(())
        }
        Command::Show {
            dataset,
            utc_min,
            utc_max,
            from_archive,
            segments,
            segment_gap,
            length,
        } => {
            let rows = open_archiver(&config)?.read_dataset(&dataset_id(&dataset)?, utc_min, utc_max, from_archive)?;
            let text = if length {
                let summary = json!({
                    "dataset": dataset,
                    "points": rows.len(),
                    "segments": split_track_segments(&rows, segment_gap).len(),
                    "length_m": track_length(&rows, segment_gap),
                });
                serde_json::to_string_pretty(&summary)?
            } else if segments {
                serde_json::to_string_pretty(&split_track_segments(&rows, segment_gap))?
            } else {
                serde_json::to_string_pretty(&rows)?
            };
            println!("{}", text);
            Ok(())
        }
    }
}

async fn run_merge(mut config: Config, input: Option<PathBuf>) -> Result<()> {
    if config.merger.hostname.is_none() {
        config.merger.hostname = local_hostname();
    }
    let archiver = open_archiver(&config)?;
    info!(
        "live log {}, archive {}",
        config.storage.live_dir.display(),
        config.storage.archive_dir.display()
    );

    let inputs = MessageBus::new();
    let outputs = MessageBus::new();
    let subscription = merger::subscribe_inputs(&inputs);
    let mut output = outputs.subscribe([TRANSFER_DATA]);
    let mut merger = StreamMerger::new(&config, archiver, outputs.clone());

    let (stop_printer, mut printer_stopped) = oneshot::channel::<()>();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = output.recv() => match message {
                    Some(message) => println!("{}", message.data),
                    None => break,
                },
                _ = &mut printer_stopped => break,
            }
        }
    });

    let feeder = tokio::spawn(feed(inputs.clone(), input));
    let stats = merger.run(subscription, shutdown_signal()).await;

    if feeder.is_finished() {
        match feeder.await {
            Ok(Ok(count)) => info!("input exhausted after {} messages", count),
            Ok(Err(e)) => error!("input failed: {:#}", e),
            Err(e) => error!("input task failed: {}", e),
        }
    } else {
        feeder.abort();
    }
    let _ = stop_printer.send(());
    printer.await.context("printer task failed")?;
    info!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

/// Publish the input on `bus`, then close it so the merger stops once drained.
async fn feed(bus: MessageBus, input: Option<PathBuf>) -> Result<usize> {
    let result = publish_lines(&bus, input).await;
    bus.close();
    result
}

/// Publish every envelope line of `input` (or stdin) on the bus.
async fn publish_lines(bus: &MessageBus, input: Option<PathBuf>) -> Result<usize> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
        Some(path) => Box::new(BufReader::new(open_input(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();
    let mut published = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_envelope(line) {
            Ok(message) => {
                bus.publish(&message.channel, &message.data);
                published += 1;
            }
            Err(e) => warn!("Skipping input line: {}", e),
        }
    }
    Ok(published)
}

async fn open_input(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
