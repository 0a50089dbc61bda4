//! Command-line front end.
//!
//! ```bash
//! capture-volume calibrate --config capture.yaml --corners corners.csv --output out/
//! capture-volume triangulate --config capture.yaml --cameras out/cameras.json \
//!   --landmarks landmarks.csv --output out/
//! capture-volume simulate --cameras 3 --output demo/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use capture_volume::board::BoardTemplate;
use capture_volume::config::CameraSpec;
use capture_volume::io::{self, BoardCornerRecord, LandmarkRecord};
use capture_volume::progress::LogObserver;
use capture_volume::synthetic::SyntheticRig;
use capture_volume::{process_landmarks, run_calibration, CalibrationConfig, CancellationToken};
use clap::{Parser, Subcommand};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{info, warn};

/// Multi-camera calibration and landmark triangulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate intrinsics and extrinsics from board corner detections
    Calibrate {
        /// YAML configuration (board, cameras, stage settings)
        #[arg(short, long)]
        config: PathBuf,
        /// CSV of camera_id,frame_id,corner_id,x,y
        #[arg(long)]
        corners: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = "output")]
        output: PathBuf,
    },
    /// Triangulate landmark detections with a calibrated camera array
    Triangulate {
        #[arg(short, long)]
        config: PathBuf,
        /// Camera array written by `calibrate`
        #[arg(long)]
        cameras: PathBuf,
        /// CSV of camera_id,frame_id,landmark_id,x,y,confidence
        #[arg(long)]
        landmarks: PathBuf,
        #[arg(short, long, default_value = "output")]
        output: PathBuf,
    },
    /// Write a synthetic rig's configuration and detections
    Simulate {
        #[arg(long, default_value = "3")]
        cameras: usize,
        #[arg(long, default_value = "100")]
        frames: u64,
        #[arg(long, default_value = "4")]
        landmarks: u32,
        #[arg(short, long, default_value = "synthetic")]
        output: PathBuf,
    },
}

fn calibrate(config: &Path, corners: &Path, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = CalibrationConfig::load_from_yaml(config)?;
    let records: Vec<BoardCornerRecord> = io::read_records(corners)?;
    info!("Loaded {} board corner detections", records.len());

    let template = BoardTemplate::shared(config.board)?;
    let store = io::observation_store(template, &config.cameras, &records);
    if store.dropped() > 0 {
        warn!("Dropped {} corner detections: {:?}", store.dropped(), store.dropped_by_reason());
    }

    let result = run_calibration(config, store, &LogObserver, &CancellationToken::new())?;
    let report = &result.report;
    for (camera, error) in &report.intrinsics_failures {
        warn!("Camera {} not calibrated: {}", camera, error);
    }
    for failure in &report.pair_failures {
        info!("No edge {}-{}: {}", failure.camera_a, failure.camera_b, failure.error);
    }
    for error in report.unreachable.values() {
        warn!("{}", error);
    }
    for error in report.unrefined.values() {
        warn!("Not posed: {}", error);
    }
    for camera in &report.flagged {
        warn!("Camera {} exceeds the reprojection error limit", camera);
    }

    fs::create_dir_all(output)?;
    io::write_records(output.join("intrinsics.csv"), &io::intrinsics_records(&result.cameras))?;
    io::write_records(output.join("extrinsics.csv"), &io::extrinsics_records(&result.cameras))?;
    io::save_camera_array(output.join("cameras.json"), &result.cameras)?;
    info!(
        "Posed {} of {} cameras; results in {}",
        result.cameras.posed_count(),
        result.cameras.len(),
        output.display()
    );
    Ok(())
}

fn triangulate(
    config: &Path,
    cameras: &Path,
    landmarks: &Path,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = CalibrationConfig::load_from_yaml(config)?;
    let cameras = io::load_camera_array(cameras)?;
    let records: Vec<LandmarkRecord> = io::read_records(landmarks)?;
    let bundles = io::frame_bundles(&records);
    info!("Loaded {} landmark detections in {} frames", records.len(), bundles.len());

    let result = process_landmarks(&cameras, &bundles, &config, &LogObserver, &CancellationToken::new())?;

    fs::create_dir_all(output)?;
    io::write_records(output.join("points.csv"), &io::point_records(&result.triangulation.points))?;
    io::write_records(output.join("trajectories.csv"), &io::trajectory_records(&result.tracks))?;
    Ok(())
}

fn simulate(cameras: usize, frames: u64, landmarks: u32, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let rig = SyntheticRig::standard(cameras);
    let specs = rig
        .cameras
        .iter()
        .map(|c| CameraSpec {
            id: c.id,
            width: c.model.resolution.width,
            height: c.model.resolution.height,
        })
        .collect();

    fs::create_dir_all(output)?;
    CalibrationConfig::new(rig.geometry, specs).save_to_yaml(output.join("capture.yaml"))?;
    io::write_records(
        output.join("corners.csv"),
        &io::board_corner_records(&rig.board_observations()),
    )?;
    let truths = rig.landmark_paths(frames, landmarks);
    io::write_records(
        output.join("landmarks.csv"),
        &io::landmark_records(&rig.frame_bundles(&truths)),
    )?;
    io::save_camera_array(output.join("truth.json"), &rig.camera_array()?)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _logger = Logger::try_with_str(&cli.log_level)?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    match &cli.command {
        Command::Calibrate {
            config,
            corners,
            output,
        } => calibrate(config, corners, output),
        Command::Triangulate {
            config,
            cameras,
            landmarks,
            output,
        } => triangulate(config, cameras, landmarks, output),
        Command::Simulate {
            cameras,
            frames,
            landmarks,
            output,
        } => simulate(*cameras, *frames, *landmarks, output),
    }
}
