use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use gpsdo_gm::config::SystemConfig;
use gpsdo_gm::controller::{CycleOutcome, GrandmasterController};
use gpsdo_gm::sim::{self, SimConfig, SimWorld};
use gpsdo_gm::status::GrandmasterStatus;
use gpsdo_gm::traits::LogSink;

/// Runs the discipline loop against simulated GPS, PHC and RTC hardware.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; defaults are used for missing sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated run length in seconds (one edge per second)
    #[arg(long, default_value_t = 3_600)]
    seconds: u64,

    /// Natural PHC oscillator error
    #[arg(long, default_value_t = 80.0)]
    drift_ppm: f64,

    /// PHC read noise (1 sigma)
    #[arg(long, default_value_t = 20.0)]
    jitter_ns: f64,

    /// Natural RTC oscillator error
    #[arg(long, default_value_t = 1.5)]
    rtc_drift_ppm: f64,

    /// Delay from PPS edge to its time-of-day sentence
    #[arg(long, default_value_t = 300)]
    label_latency_ms: i64,

    /// Drop the GPS reference at this second ...
    #[arg(long)]
    dropout_at: Option<u64>,

    /// ... for this many seconds
    #[arg(long, default_value_t = 60)]
    dropout_seconds: u64,

    /// Skip calibration and use this oscillator drift correction
    #[arg(long, allow_hyphen_values = true)]
    preset_baseline_ppb: Option<i32>,

    /// Print the JSON status every N seconds (0 = only at the end)
    #[arg(long, default_value_t = 300)]
    status_every: u64,

    /// Pace the simulation at one edge per wall-clock second
    #[arg(long, default_value_t = false)]
    realtime: bool,

    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn print_status(status: &GrandmasterStatus) {
    match serde_json::to_string(status) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to serialize status: {}", e),
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if args.preset_baseline_ppb.is_some() {
        config.calibration.preset_baseline_ppb = args.preset_baseline_ppb;
    }

    let world = SimWorld::new(SimConfig {
        utc_to_tai_offset_s: config.reference.utc_to_tai_offset_s,
        label_latency_ns: args.label_latency_ms * 1_000_000,
        phc_drift_ppm: args.drift_ppm,
        phc_jitter_ns: args.jitter_ns,
        rtc_drift_ppm: args.rtc_drift_ppm,
        seed: args.seed,
        ..SimConfig::default()
    });
    let (reference, phc, rtc) = sim::adapters(&world);

    let status = Arc::new(RwLock::new(GrandmasterStatus::default()));
    let mut controller = GrandmasterController::new(reference, phc, rtc, LogSink, status, config);

    let running = controller.stop_handle();
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Simulating {}s: PHC {:+}ppm, RTC {:+}ppm, label latency {}ms",
          args.seconds, args.drift_ppm, args.rtc_drift_ppm, args.label_latency_ms);

    for second in 1..=args.seconds {
        if let Some(start) = args.dropout_at {
            if second == start {
                warn!("GPS reference lost (simulated, {}s)", args.dropout_seconds);
                world.borrow_mut().set_reference_available(false);
            } else if second == start + args.dropout_seconds {
                info!("GPS reference restored (simulated)");
                world.borrow_mut().set_reference_available(true);
            }
        }

        world.borrow_mut().advance_second();
        if controller.on_edge() == CycleOutcome::Stopped {
            break;
        }

        if args.status_every > 0 && second % args.status_every == 0 {
            let phc_error_ns = world.borrow().phc_offset_ns();
            info!("t={}s true PHC error {:.1}ns", second, phc_error_ns);
            print_status(&controller.get_state());
        }

        if args.realtime {
            thread::sleep(Duration::from_secs(1));
        }
    }

    controller.shutdown();
    print_status(&controller.get_state());
    info!("Exiting.");
    Ok(())
}
