//! CLI entry point for the timelapse pipeline
//!
//! Feeds a directory of local photos through the creator, prints the result and
//! optionally publishes it.

mod photos;

use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use timelapse_core::{run_startup_checks, Config, JobProgress, TimelapseCreator, TimelapseResult};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Timelapse - Build a video from an ordered set of photos
#[derive(Parser, Debug)]
#[command(name = "timelapse")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults and env overrides when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of photos (jpg/jpeg/png), ordered by file name
    #[arg(short, long)]
    photos: Option<PathBuf>,

    /// Device the photos belong to; selects the publish destination
    #[arg(short, long, default_value_t = 0)]
    device_id: i64,

    /// Output frames per second
    #[arg(short = 'r', long, default_value_t = 10)]
    frame_rate: u32,

    /// Use full-resolution renditions instead of thumbnails
    #[arg(long, default_value = "false")]
    high_quality: bool,

    /// Publish the timelapse after a successful run
    #[arg(long, default_value = "false")]
    save: bool,

    /// Delete the frame cache (after the run, if photos are given)
    #[arg(long, default_value = "false")]
    clear: bool,

    /// Print the result as JSON
    #[arg(long, default_value = "false")]
    json: bool,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path)
            .map_err(|e| format!("Failed to load {}: {}", path.display(), e)),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

/// Render progress snapshots on stderr until the channel closes
async fn report_progress(mut progress: watch::Receiver<JobProgress>) {
    while progress.changed().await.is_ok() {
        let snapshot = *progress.borrow_and_update();
        eprint!(
            "\rdownload {:>3.0}% | encode {:>3.0}%",
            snapshot.download_progress * 100.0,
            snapshot.process_progress * 100.0
        );
        let _ = std::io::stderr().flush();
    }
}

fn print_result(result: &TimelapseResult, json: bool) -> Result<(), String> {
    if json {
        let rendered = serde_json::to_string_pretty(result)
            .map_err(|e| format!("Failed to render result: {}", e))?;
        println!("{}", rendered);
    } else {
        println!("Timelapse: {}", result.output_path.display());
        println!("Size: {}", result.size_display);
        println!("Duration: {}", result.duration_display);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let creator = Arc::new(TimelapseCreator::from_config(&config));

    let Some(dir) = args.photos.as_deref() else {
        if args.clear {
            creator.clear().await;
            println!("Frame cache cleared: {}", creator.cache().root().display());
            return ExitCode::SUCCESS;
        }
        eprintln!("Nothing to do: pass --photos <dir> or --clear");
        return ExitCode::FAILURE;
    };

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        eprintln!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let photos = match photos::scan_photos(dir, args.device_id) {
        Ok(photos) if photos.is_empty() => {
            eprintln!("No photos found in {}", dir.display());
            return ExitCode::FAILURE;
        }
        Ok(photos) => photos,
        Err(e) => {
            eprintln!("Failed to scan {}: {}", dir.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let reporter = tokio::spawn(report_progress(creator.subscribe_progress()));
    let interrupt = {
        let creator = Arc::clone(&creator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling timelapse job");
                creator.cancel();
            }
        })
    };

    let outcome = creator
        .create_timelapse(&photos, args.high_quality, args.frame_rate)
        .await;
    reporter.abort();
    interrupt.abort();
    eprintln!();

    let mut code = ExitCode::SUCCESS;
    match outcome {
        Ok(result) => {
            if let Err(e) = print_result(&result, args.json) {
                eprintln!("{}", e);
                code = ExitCode::FAILURE;
            }

            if args.save {
                match creator.save_timelapse(args.device_id).await {
                    Ok(()) => println!(
                        "Published for device {} under {}",
                        args.device_id,
                        config.publish.directory.display()
                    ),
                    Err(e) => {
                        eprintln!("Failed to publish timelapse: {}", e);
                        code = ExitCode::FAILURE;
                    }
                }
            }
        }
        Err(e) => {
            eprintln!("Timelapse failed: {}", e);
            code = ExitCode::FAILURE;
        }
    }

    if args.clear {
        creator.clear().await;
    }

    code
}
