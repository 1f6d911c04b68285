// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Runs the flat calibration items against simulated equipment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};
use tracing_appender::{non_blocking::NonBlockingBuilder};

use flatcal::auto_flats::{AutoBrightnessFlat, AutoExposureFlat};
use flatcal::calibration_params::{FlatBrightnessParams, FlatExposureParams};
use flatcal::flat_error::FlatError;
use flatcal::flat_sequence::{FlatItemCore, FlatRig, FlatRunOutcome, SharedCamera,
                             SharedFilterWheel, SharedFlatDevice, SharedGuider};
use flatcal::simulated_rig::{CollectingFrameSaver, RecordingStatus, SimCamera,
                             SimFilterWheel, SimFlatPanel, SimGuider, SimScene};
use flatcal::sky_flat::{SkyFlat, TwilightSource};
use flatcal::trained_flats::{InMemoryTrainedFlatStore, TrainedDarkFlatExposure,
                             TrainedFlatExposure};
use flatcal::twilight_model::TWILIGHT_DECAY_RATE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Solve exposure time at a fixed panel brightness.
    AutoExposure,
    /// Solve panel brightness at a fixed exposure time.
    AutoBrightness,
    /// Train with an auto brightness run, then replay the trained setting for
    /// flats and dark flats.
    Trained,
    /// Twilight sky flats.
    Sky,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    #[arg(long, value_enum, default_value = "auto-brightness")]
    mode: Mode,

    /// Filter to use; empty for none.
    #[arg(long, default_value = "L")]
    filter: String,

    /// Number of flats to capture.
    #[arg(long, default_value = "5")]
    iterations: u32,

    /// Histogram target, fraction of full well.
    #[arg(long, default_value = "0.5")]
    target: f64,

    /// Histogram tolerance, fraction of the target.
    #[arg(long, default_value = "0.1")]
    tolerance: f64,

    /// Minimum exposure duration, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "0.01")]
    min_exposure: Duration,

    /// Maximum exposure duration, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "10.0")]
    max_exposure: Duration,

    /// Exposure duration used when brightness is solved, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "1.0")]
    exposure: Duration,

    /// Panel brightness used when exposure time is solved.
    #[arg(long, default_value = "1000")]
    brightness: i32,

    #[arg(long, default_value = "0")]
    min_brightness: i32,

    #[arg(long, default_value = "32000")]
    max_brightness: i32,

    /// Leave the panel cover closed afterwards.
    #[arg(long, default_value = "false")]
    keep_panel_closed: bool,

    /// Simulated sensor bit depth.
    #[arg(long, default_value = "16")]
    bit_depth: u8,

    /// Simulated panel output, ADU per second per unit brightness.
    #[arg(long, default_value = "3.0")]
    panel_flux: f64,

    /// Simulated sky brightness at the start, ADU per second.
    #[arg(long, default_value = "20000.0")]
    sky_flux: f64,

    /// Observer latitude, degrees. Without latitude and longitude the sky is
    /// taken to be an evening sky at the equinox rate.
    #[arg(long)]
    latitude: Option<f64>,

    /// Observer longitude, degrees east.
    #[arg(long)]
    longitude: Option<f64>,

    /// Dither between sky flats.
    #[arg(long, default_value = "false")]
    dither: bool,

    /// Take as long as real exposures would.
    #[arg(long, default_value = "false")]
    real_time: bool,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "flatcal_log.txt")]
    log_file: String,
}

fn parse_duration(arg: &str)
                  -> Result<std::time::Duration, std::num::ParseFloatError> {
    let seconds = arg.parse()?;
    Ok(std::time::Duration::from_secs_f64(seconds))
}

struct SimSetup {
    rig: FlatRig,
    saver: Arc<CollectingFrameSaver>,
    status: Arc<RecordingStatus>,
    filter_wheel: Arc<tokio::sync::Mutex<SimFilterWheel>>,
}

fn build_rig(args: &Args) -> SimSetup {
    let scene = if args.mode == Mode::Sky {
        // Evening sky, fading at the equinox rate.
        SimScene::new(0.0, 200.0)
            .with_sky(SimScene::twilight_sky(args.sky_flux, -TWILIGHT_DECAY_RATE))
    } else {
        SimScene::new(args.panel_flux, 200.0)
    };
    let scene = Arc::new(scene);
    let mut camera = SimCamera::new(scene.clone(), args.bit_depth).with_noise(20.0);
    if args.real_time {
        camera = camera.with_real_time(Duration::from_millis(300));
    }
    let camera: SharedCamera = Arc::new(tokio::sync::Mutex::new(camera));
    let flat_device: Option<SharedFlatDevice> = if args.mode == Mode::Sky {
        None
    } else {
        Some(Arc::new(tokio::sync::Mutex::new(SimFlatPanel::new(scene.clone(), true, true))))
    };
    let filter_wheel = Arc::new(tokio::sync::Mutex::new(
        SimFilterWheel::new(&["L", "R", "G", "B", "Ha"])));
    let shared_wheel: SharedFilterWheel = filter_wheel.clone();
    let settle = if args.real_time { Duration::from_secs(2) } else { Duration::ZERO };
    let guider: SharedGuider = Arc::new(tokio::sync::Mutex::new(SimGuider::new(settle)));
    let status = Arc::new(RecordingStatus::default());
    let saver = Arc::new(CollectingFrameSaver::default());
    SimSetup{
        rig: FlatRig{
            camera,
            flat_device,
            filter_wheel: Some(shared_wheel),
            guider: Some(guider),
            status: status.clone(),
            frame_saver: saver.clone(),
        },
        saver,
        status,
        filter_wheel,
    }
}

fn log_outcome(core: &FlatItemCore, result: &Result<FlatRunOutcome, FlatError>) {
    match result {
        Ok(FlatRunOutcome::AlreadyComplete) => {
            info!("{}: already complete", core.name);
        }
        Ok(FlatRunOutcome::Completed(report)) => {
            info!("{}: {} frames, brightness {:?}, exposure {:?}, \
                   mean ADU {:.1} (stddev {:.1}, last {} frames {:.1}), \
                   {} drift corrections",
                  core.name, report.frames_captured, report.solved_brightness,
                  report.solved_exposure, report.adu_stats.mean, report.adu_stats.stddev,
                  report.recent_adu_stats.count, report.recent_adu_stats.mean,
                  report.drift_corrections);
            for (step, outcome) in &report.steps {
                info!("  {:?}: {:?}", step, outcome);
            }
        }
        Err(e) => error!("{}: {}", core.name, e),
    }
}

fn report_issues(core: &FlatItemCore) {
    for issue in &core.issues {
        warn!("{}: {}", core.name, issue);
    }
}

async fn run_mode(args: &Args, setup: &SimSetup, cancel: &AtomicBool) -> bool {
    let filter = if args.filter.is_empty() {
        None
    } else {
        match setup.filter_wheel.lock().await.filter(&args.filter) {
            Some(filter) => Some(filter),
            None => {
                error!("Unknown filter {}", args.filter);
                return false;
            }
        }
    };
    let store = Arc::new(InMemoryTrainedFlatStore::new());
    let exposure_params = FlatExposureParams::default()
        .with_max_exposure(args.max_exposure)
        .with_min_exposure(args.min_exposure)
        .with_histogram_target(args.target)
        .with_histogram_tolerance(args.tolerance)
        .with_keep_panel_closed(args.keep_panel_closed);
    let brightness_params = FlatBrightnessParams::default()
        .with_max_brightness(args.max_brightness)
        .with_min_brightness(args.min_brightness)
        .with_histogram_target(args.target)
        .with_histogram_tolerance(args.tolerance)
        .with_keep_panel_closed(args.keep_panel_closed);
    let rig = &setup.rig;

    match args.mode {
        Mode::AutoExposure => {
            let mut item = AutoExposureFlat::new(args.iterations, exposure_params,
                                                 args.brightness, filter, store);
            if !item.validate(rig).await {
                report_issues(&item.core);
                return false;
            }
            let result = item.execute(rig, cancel).await;
            log_outcome(&item.core, &result);
            result.is_ok()
        }
        Mode::AutoBrightness => {
            let mut item = AutoBrightnessFlat::new(args.iterations, brightness_params,
                                                   args.exposure, filter, store);
            if !item.validate(rig).await {
                report_issues(&item.core);
                return false;
            }
            let result = item.execute(rig, cancel).await;
            log_outcome(&item.core, &result);
            result.is_ok()
        }
        Mode::Trained => {
            let mut training = AutoBrightnessFlat::new(1, brightness_params, args.exposure,
                                                       filter.clone(), store.clone());
            if !training.validate(rig).await {
                report_issues(&training.core);
                return false;
            }
            let result = training.execute(rig, cancel).await;
            log_outcome(&training.core, &result);
            if result.is_err() {
                return false;
            }
            let mut flats = TrainedFlatExposure::new(args.iterations, filter.clone(),
                                                     store.clone());
            flats.keep_panel_closed = true;
            let mut dark_flats = TrainedDarkFlatExposure::new(args.iterations, filter, store);
            dark_flats.keep_panel_closed = args.keep_panel_closed;
            if !flats.validate(rig).await || !dark_flats.validate(rig).await {
                report_issues(&flats.core);
                report_issues(&dark_flats.core);
                return false;
            }
            let result = flats.execute(rig, cancel).await;
            log_outcome(&flats.core, &result);
            if result.is_err() {
                return false;
            }
            let result = dark_flats.execute(rig, cancel).await;
            log_outcome(&dark_flats.core, &result);
            result.is_ok()
        }
        Mode::Sky => {
            let twilight = match (args.latitude, args.longitude) {
                (Some(latitude), Some(longitude)) => TwilightSource::Observer{
                    latitude: latitude.to_radians(), longitude: longitude.to_radians()},
                _ => TwilightSource::Fixed{morning: false, tau: 1.0},
            };
            let mut item = SkyFlat::new(args.iterations, exposure_params, filter, twilight);
            item.dither = args.dither;
            if !item.validate(rig).await {
                report_issues(&item.core);
                return false;
            }
            let result = item.execute(rig, cancel).await;
            log_outcome(&item.core, &result);
            result.is_ok()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = tracing_appender::rolling::never(&args.log_dir, &args.log_file);
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    // Control-c cancels the running item, which then restores the equipment.
    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        warn!("Could not install control-c handler: {}", e);
    }

    info!("Flat calibration simulation, mode {:?}", args.mode);
    let setup = build_rig(&args);
    let ok = run_mode(&args, &setup, &got_signal).await;
    info!("{} frames saved, {} warnings",
          setup.saver.count(), setup.status.warnings.lock().unwrap().len());
    if !ok {
        std::process::exit(1);
    }
}
