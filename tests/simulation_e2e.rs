use std::sync::{Arc, RwLock};
use gpsdo_gm::config::SystemConfig;
use gpsdo_gm::controller::{CycleOutcome, GrandmasterController, Phase};
use gpsdo_gm::sim::{self, SharedWorld, SimConfig, SimPhc, SimReference, SimRtc, SimWorld};
use gpsdo_gm::state::SyncState;
use gpsdo_gm::status::GrandmasterStatus;
use gpsdo_gm::traits::LogSink;

// --- Harness ---

struct Harness {
    world: SharedWorld,
    controller: GrandmasterController<SimReference, SimPhc, SimRtc, LogSink>,
    elapsed_s: u64,
}

impl Harness {
    fn new(config: SystemConfig, sim_config: SimConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let world = SimWorld::new(sim_config);
        let (reference, phc, rtc) = sim::adapters(&world);
        let status = Arc::new(RwLock::new(GrandmasterStatus::default()));
        let controller = GrandmasterController::new(reference, phc, rtc, LogSink, status, config);
        Harness { world, controller, elapsed_s: 0 }
    }

    /// Runs one edge per simulated second. Returns the largest true PHC
    /// error seen during the last `tail_s` seconds.
    fn run(&mut self, seconds: u64, tail_s: u64) -> f64 {
        let mut max_error_ns: f64 = 0.0;
        for i in 0..seconds {
            self.world.borrow_mut().advance_second();
            let outcome = self.controller.on_edge();
            assert_ne!(outcome, CycleOutcome::Stopped);
            self.elapsed_s += 1;

            if i >= seconds.saturating_sub(tail_s) {
                max_error_ns = max_error_ns.max(self.world.borrow().phc_offset_ns().abs());
            }
        }
        max_error_ns
    }

    fn set_reference(&mut self, available: bool) {
        self.world.borrow_mut().set_reference_available(available);
    }

    fn status(&self) -> GrandmasterStatus {
        self.controller.get_state()
    }
}

fn quiet_sim() -> SimConfig {
    SimConfig { phc_jitter_ns: 10.0, ..SimConfig::default() }
}

// --- Scenarios ---

#[test]
fn test_cold_start_calibrates_steps_and_locks() {
    let mut h = Harness::new(SystemConfig::default(), quiet_sim());

    // Association needs 5 labelled edges
    h.run(4, 0);
    assert_eq!(h.controller.phase(), Phase::Acquiring);

    h.run(1, 0);
    assert_eq!(h.controller.phase(), Phase::Calibrating);
    // PHC started on UTC; stepped onto TAI
    assert!(h.world.borrow().phc_offset_ns().abs() < 1_000.0);

    let max_error = h.run(895, 120);
    let status = h.status();
    println!("Cold start: baseline {}ppb, max error {:.1}ns, steps {}",
             status.baseline_ppb, max_error, status.step_count);

    assert_eq!(h.controller.phase(), Phase::Disciplining);
    assert!(status.calibrated);
    assert!((status.baseline_ppb + 80_000).abs() <= 100, "baseline {}", status.baseline_ppb);
    // Start-up alignment and post-calibration alignment only
    assert_eq!(status.step_count, 2);
    assert!(h.controller.is_locked());
    assert_eq!(status.sync_state, SyncState::Locked);
    assert_eq!(status.clock_quality.clock_class, 6);
    assert!(max_error < 200.0, "max error {:.1}ns", max_error);
}

#[test]
fn test_preset_baseline_skips_calibration() {
    let mut config = SystemConfig::default();
    config.calibration.preset_baseline_ppb = Some(-80_000);
    let mut h = Harness::new(config, quiet_sim());

    h.run(5, 0);
    assert_eq!(h.controller.phase(), Phase::Disciplining);
    assert_eq!(h.world.borrow().phc_frequency_ppb(), -80_000);

    let max_error = h.run(595, 120);
    let status = h.status();
    assert_eq!(status.step_count, 1);
    assert_eq!(status.baseline_ppb, -80_000);
    assert!(h.controller.is_locked());
    assert!(max_error < 200.0, "max error {:.1}ns", max_error);
}

#[test]
fn test_residual_frequency_error_is_absorbed() {
    // Preset baseline is 20ppb short of the real oscillator error
    let mut config = SystemConfig::default();
    config.calibration.preset_baseline_ppb = Some(-80_000);
    let mut h = Harness::new(config, SimConfig { phc_drift_ppm: 80.02, ..quiet_sim() });

    let max_error = h.run(900, 120);
    let status = h.status();
    let frequency = h.world.borrow().phc_frequency_ppb();
    println!("Residual: freq {}ppb, max error {:.1}ns", frequency, max_error);

    // Integral term carries the residual; the loop settles instead of ringing
    assert!((frequency + 80_020).abs() <= 3, "frequency {}", frequency);
    assert_eq!(status.step_count, 1);
    assert!(max_error < 100.0, "max error {:.1}ns", max_error);
}

#[test]
fn test_reference_dropout_holds_over_and_relocks() {
    let mut config = SystemConfig::default();
    config.calibration.preset_baseline_ppb = Some(-80_000);
    let mut h = Harness::new(config, quiet_sim());

    h.run(900, 0);
    assert_eq!(h.status().sync_state, SyncState::Locked);
    let steps_before = h.status().step_count;

    h.set_reference(false);
    h.run(60, 0);
    let status = h.status();
    assert_eq!(status.sync_state, SyncState::Holdover);
    assert_eq!(status.clock_quality.clock_class, 7);
    assert!(!status.association_locked);
    // Free-running on the held frequency
    let holdover_error = h.world.borrow().phc_offset_ns().abs();
    println!("Holdover: PHC error after 60s {:.1}ns", holdover_error);
    assert!(holdover_error < 2_000.0);

    h.set_reference(true);
    // Association is re-learned first; no edge reaches the servo before that
    h.run(5, 0);
    assert_eq!(h.status().sync_state, SyncState::Recovering);

    let max_error = h.run(300, 60);
    let status = h.status();
    assert_eq!(status.sync_state, SyncState::Locked);
    assert!(status.association_locked);
    assert_eq!(status.step_count, steps_before, "recovery must not step");
    assert!(max_error < 200.0, "max error {:.1}ns", max_error);
}

#[test]
fn test_rtc_trim_learned_while_locked() {
    let mut config = SystemConfig::default();
    config.calibration.preset_baseline_ppb = Some(-80_000);
    let mut h = Harness::new(config, SimConfig { rtc_drift_ppm: 1.5, ..quiet_sim() });

    h.run(5, 0);
    // Synced on acquisition
    assert!(h.world.borrow().rtc_offset_ns().abs() < 1.0);

    h.run(1_000, 0);
    assert_eq!(h.world.borrow().rtc_trim(), 0, "trimmed before the minimum interval");

    h.run(500, 0);
    let status = h.status();
    println!("RTC: trim {:?}, drift {:.3}ppm", status.secondary_trim, status.secondary_drift_ppm);
    // 1.5ppm asks for 15 LSB, limited to 3 per adjustment
    assert_eq!(h.world.borrow().rtc_trim(), 3);
    assert_eq!(status.secondary_trim, Some(3));
}

#[test]
fn test_frequency_write_faults_do_not_break_lock() {
    let mut config = SystemConfig::default();
    config.calibration.preset_baseline_ppb = Some(-80_000);
    let mut h = Harness::new(config, quiet_sim());

    h.run(400, 0);
    h.world.borrow_mut().inject_frequency_faults(3);
    let max_error = h.run(300, 100);

    let status = h.status();
    assert_eq!(status.hardware_faults, 3);
    assert!(h.controller.is_locked());
    assert!(max_error < 200.0, "max error {:.1}ns", max_error);
}

#[test]
fn test_labels_naming_next_edge_give_same_time() {
    let mut config = SystemConfig::default();
    config.calibration.preset_baseline_ppb = Some(-80_000);
    let mut h = Harness::new(config, SimConfig { label_latency_ns: 980_000_000, ..quiet_sim() });

    let max_error = h.run(600, 120);
    let status = h.status();
    assert!(status.association_locked);
    assert_eq!(status.step_count, 1);
    assert!(h.controller.is_locked());
    assert!(max_error < 200.0, "max error {:.1}ns", max_error);
}

#[test]
fn test_shutdown_stops_loop() {
    let mut h = Harness::new(SystemConfig::default(), quiet_sim());
    h.run(10, 0);

    let stop = h.controller.stop_handle();
    stop.store(false, std::sync::atomic::Ordering::SeqCst);
    h.world.borrow_mut().advance_second();
    assert_eq!(h.controller.on_edge(), CycleOutcome::Stopped);
    assert_eq!(h.status().edges_processed, 6);
}
