//! Hardware probe: checks that the PHC and RTC adapters work on this machine.

#[cfg(target_os = "linux")]
mod probe {
    use anyhow::Result;
    use clap::Parser;
    use log::{info, warn};
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    use gpsdo_gm::clock::PhcClock;
    use gpsdo_gm::rtc::LinuxRtc;
    use gpsdo_gm::timestamp::NANOS_PER_SEC;
    use gpsdo_gm::traits::{LocalClock, SecondaryClock};

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Probe PHC and RTC hardware", long_about = None)]
    struct Args {
        #[arg(long, default_value = "/dev/ptp0")]
        phc: PathBuf,

        #[arg(long, default_value = "/dev/rtc0")]
        rtc: PathBuf,

        /// I2C bus with a DS3231 at 0x68, for the aging trim
        #[arg(long)]
        i2c_bus: Option<PathBuf>,

        /// Apply this frequency offset during the rate test, then restore 0
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        test_ppb: i32,

        /// Rate test length
        #[arg(long, default_value_t = 5)]
        seconds: u64,

        #[arg(long, default_value_t = 37)]
        utc_to_tai_offset_s: i64,
    }

    /// PHC rate against the host monotonic clock, in ppm.
    fn measure_rate_ppm(phc: &mut PhcClock, seconds: u64) -> Result<f64> {
        let start_host = Instant::now();
        let start_phc = phc.read()?;
        thread::sleep(Duration::from_secs(seconds));
        let end_phc = phc.read()?;
        let host_ns = start_host.elapsed().as_nanos() as i64;
        let phc_ns = end_phc.as_nanos() - start_phc.as_nanos();
        Ok((phc_ns - host_ns) as f64 / host_ns as f64 * 1e6)
    }

    pub fn run() -> Result<()> {
        env_logger::builder()
            .format_timestamp(None)
            .filter_level(log::LevelFilter::Info)
            .init();

        let args = Args::parse();

        let mut phc = PhcClock::open(&args.phc)?;
        info!("PHC time: {}", phc.read()?);
        info!("PHC max adjustment: {}ppb", phc.max_frequency_ppb());

        phc.adjust_frequency(0)?;
        let natural = measure_rate_ppm(&mut phc, args.seconds)?;
        info!("PHC rate vs host at 0ppb: {:+.3}ppm", natural);

        if args.test_ppb != 0 {
            phc.adjust_frequency(args.test_ppb)?;
            let adjusted = measure_rate_ppm(&mut phc, args.seconds)?;
            let effect_ppb = (adjusted - natural) * 1_000.0;
            info!("PHC rate at {:+}ppb: {:+.3}ppm (effect {:+.0}ppb)", args.test_ppb, adjusted, effect_ppb);
            if (effect_ppb - args.test_ppb as f64).abs() > args.test_ppb.abs() as f64 * 0.1 + 1_000.0 {
                warn!("Frequency adjustment does not take effect as requested");
            }
            phc.adjust_frequency(0)?;
        }

        let mut rtc = LinuxRtc::open(&args.rtc, args.i2c_bus.as_deref(), args.utc_to_tai_offset_s)?;
        let rtc_now = rtc.read()?;
        let phc_now = phc.read()?;
        info!("RTC time: {} (TAI), PHC - RTC = {:.3}s", rtc_now,
              (phc_now.as_nanos() - rtc_now.as_nanos()) as f64 / NANOS_PER_SEC as f64);
        info!("RTC aging trim: {}", rtc.read_trim()?);

        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    probe::run()
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("clocktest requires Linux (PTP hardware clock and RTC device interfaces)");
}
