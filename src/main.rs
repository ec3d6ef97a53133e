//! CLI Entry Point for ultrasonic-daq
//!
//! Provides command-line interface for:
//! - Running an immersion scan (real rig or simulated dry run)
//! - Inspecting a scan archive
//! - Writing the channel-map files for manual acquisition
//!
//! # Usage
//!
//! Run a scan:
//! ```bash
//! ultrasonic-daq scan --config config/scan.toml
//! ultrasonic-daq scan --simulate
//! ```
//!
//! Inspect an archive:
//! ```bash
//! ultrasonic-daq inspect p_test.h5 --entry 2 3
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use ultrasonic_daq::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use ultrasonic_daq::experiment::{AbortSignal, ScanSummary, SweepCoordinator, SweepPlan};
use ultrasonic_daq::hardware::acquisition::{AcquisitionTrigger, CaptureTiming, ExternalEngine};
use ultrasonic_daq::hardware::mock::{SimulatedEndpoint, SimulatedEngine};
use ultrasonic_daq::hardware::motion::MotionController;
use ultrasonic_daq::logging::{self, TracingConfig};
use ultrasonic_daq::storage::archive::{EntryKey, MemoryArchive};
use ultrasonic_daq::storage::channel_map::{AcqMode, ChannelFiles};
use ultrasonic_daq::storage::inspect::{open_reader, ArchiveReader, InspectReport};
use ultrasonic_daq::storage;
use ultrasonic_daq::storage::writer::ArchiveWriter;

/// Summary file written next to the archive.
const SUMMARY_FILE: &str = "scan_summary.json";

/// Matrix shape produced by the simulated engine: samples x sources x receivers.
const SIMULATED_SHAPE: [usize; 3] = [512, 32, 32];

/// Acknowledgment latency of the simulated controllers at 9600 baud.
const SIMULATED_REPLY_DELAY: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "ultrasonic-daq")]
#[command(about = "Two-axis ultrasonic immersion scan controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full transmitter/receiver sweep
    Scan {
        /// Scan configuration file (TOML format)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Use simulated stages, engine and an in-memory archive
        #[arg(long)]
        simulate: bool,

        /// Where to write the JSON run summary (default: next to the archive)
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Print the structure of a scan archive
    Inspect {
        /// Archive file
        file: PathBuf,

        /// Also read one entry
        #[arg(long, num_args = 2, value_names = ["SOURCE", "RECEIVER"])]
        entry: Option<Vec<u32>>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the channel-map files for an acquisition mode
    Channels {
        /// Acquisition mode
        #[arg(long, value_enum, default_value_t = AcqMode::Fmc)]
        mode: AcqMode,

        /// Directory receiving the files
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            config,
            simulate,
            summary,
        } => run_scan(&config, simulate, summary).await,
        Commands::Inspect { file, entry, json } => {
            logging::init(TracingConfig::default())?;
            inspect(&file, entry, json)
        }
        Commands::Channels { mode, output_dir } => {
            logging::init(TracingConfig::default())?;
            let files = ChannelFiles::write(&output_dir, mode)?;
            println!("📝 {mode} channel maps written:");
            println!("   {}", files.source_path().display());
            println!("   {}", files.receiver_path().display());
            Ok(())
        }
    }
}

async fn run_scan(config_path: &Path, simulate: bool, summary_path: Option<PathBuf>) -> Result<()> {
    let config = ScanConfig::load_from(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    println!("🔊 {}", config.application.name);
    println!(
        "   {} x {} positions, {} mode{}",
        config.scan.source_count,
        config.scan.receiver_count,
        config.scan.mode,
        if simulate { " (simulated)" } else { "" }
    );

    let coordinator = if simulate {
        simulated_coordinator(&config)?
    } else {
        rig_coordinator(&config).await?
    };

    let abort = coordinator.abort_signal();
    tokio::spawn(watch_ctrl_c(abort));

    let summary = coordinator.run().await?;
    println!();
    print!("{summary}");

    let summary_path =
        summary_path.unwrap_or_else(|| config.storage.output_dir.join(SUMMARY_FILE));
    summary
        .save(&summary_path)
        .with_context(|| format!("writing {}", summary_path.display()))?;

    finish(&summary)
}

fn finish(summary: &ScanSummary) -> Result<()> {
    if !summary.is_complete() {
        bail!(
            "scan incomplete: {}/{} entries archived",
            summary.archived.len(),
            summary.expected
        );
    }
    println!("✅ Scan complete");
    Ok(())
}

fn simulated_coordinator(config: &ScanConfig) -> Result<SweepCoordinator> {
    let mut plan = SweepPlan::from_config(config)?;
    plan.archive_path = None;

    let motion = MotionController::new(
        config.motion.clone(),
        Box::new(SimulatedEndpoint::new().with_reply_delay(SIMULATED_REPLY_DELAY)),
        Box::new(SimulatedEndpoint::new().with_reply_delay(SIMULATED_REPLY_DELAY)),
    );
    let engine = SimulatedEngine::new(SIMULATED_SHAPE.to_vec())
        .with_busy_for(Duration::from_millis(200));
    let trigger = AcquisitionTrigger::new(Box::new(engine), CaptureTiming::from(&config.acquisition));
    let archive = ArchiveWriter::spawn(MemoryArchive::new(), config.storage.queue_capacity);

    Ok(SweepCoordinator::new(plan, motion, trigger, archive))
}

async fn rig_coordinator(config: &ScanConfig) -> Result<SweepCoordinator> {
    let plan = SweepPlan::from_config(config)?;
    let motion = connect_motion(config).await?;
    let trigger = AcquisitionTrigger::new(
        Box::new(ExternalEngine::new(config.acquisition.clone())),
        CaptureTiming::from(&config.acquisition),
    );
    let archive = storage::open_hdf5_archive(&config.storage)?;
    println!("   archive: {}", config.storage.archive_path().display());

    Ok(SweepCoordinator::new(plan, motion, trigger, archive))
}

#[cfg(feature = "instrument_serial")]
async fn connect_motion(config: &ScanConfig) -> Result<MotionController> {
    Ok(MotionController::connect(&config.motion).await?)
}

#[cfg(not(feature = "instrument_serial"))]
async fn connect_motion(_config: &ScanConfig) -> Result<MotionController> {
    Err(ultrasonic_daq::ScanError::FeatureNotEnabled("instrument_serial".to_string()).into())
}

/// First Ctrl-C aborts the sweep gracefully, the second exits immediately.
async fn watch_ctrl_c(abort: AbortSignal) {
    if signal::ctrl_c().await.is_err() {
        return;
    }
    abort.raise();
    eprintln!();
    eprintln!("⚠️  Abort requested: returning stages and closing the archive");
    eprintln!("   Press Ctrl+C again to exit immediately");

    if signal::ctrl_c().await.is_ok() {
        eprintln!("👋 Exiting without cleanup");
        std::process::exit(130);
    }
}

fn inspect(file: &Path, entry: Option<Vec<u32>>, json: bool) -> Result<()> {
    let reader = open_reader(file).with_context(|| format!("opening {}", file.display()))?;
    let report = InspectReport::collect(reader.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("📂 {}", file.display());
        println!("   groups: {}", report.groups.join(", "));
        println!("   attributes:");
        for (name, value) in &report.attributes {
            println!("     {name} = {value}");
        }
        println!("   entries: {}", report.entries.len());
        for summary in &report.entries {
            println!("     {} {:?}", summary.path, summary.shape);
        }

        let count = |name: &str| report.attributes.get(name).and_then(|v| v.parse::<u32>().ok());
        if let (Some(sources), Some(receivers)) = (count("NSrcPos"), count("NRecPos")) {
            let missing = report.missing(sources, receivers);
            if !missing.is_empty() {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                println!("   missing: {}", names.join(", "));
            }
        }
    }

    if let Some(pair) = entry {
        let [source, receiver] = pair.as_slice() else {
            bail!("--entry takes a source and a receiver index");
        };
        let key = EntryKey::new(*source, *receiver)?;
        let stored = reader.read_entry(key)?;
        let preview: Vec<i16> = stored.matrix.as_slice().iter().take(8).copied().collect();
        println!();
        println!("🔎 {key}");
        println!("   SrcPos = {}, RecPos = {}", stored.source_position, stored.receiver_position);
        println!("   shape  = {:?}", stored.matrix.shape());
        println!("   first samples: {preview:?}");
    }
    Ok(())
}
