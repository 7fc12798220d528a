//! Frequency Calibrator - open-loop drift measurement before servoing
//!
//! Counts reference edges by sequence number and compares the local clock's
//! elapsed time over a fixed number of pulses. Each measurement that is still
//! too far off applies a partial correction and starts a fresh window, up to
//! a bounded number of iterations.

use log::{debug, info, warn};
use crate::config::CalibrationConfig;
use crate::timestamp::NANOS_PER_SEC;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationState {
    pub baseline_edge_sequence: u64,
    pub baseline_local_ns: i64,
    /// Frequency handed to the hardware, clamped to what it accepts.
    pub cumulative_correction_ppb: i32,
    /// Correction the oscillator actually needs, before any clamping.
    pub measured_drift_ppb: i32,
    pub iterations: u32,
    pub rejections: u32,
    pub last_drift_ppm: f64,
    pub calibrated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationUpdate {
    /// Still measuring. `frequency_ppb` is set when a new partial
    /// correction must be applied before the next window.
    InProgress { frequency_ppb: Option<i32> },
    Converged { frequency_ppb: i32, baseline_ppb: i32, drift_ppm: f64 },
    /// Implausible measurement; the window was restarted.
    Rejected { drift_ppm: f64 },
}

pub struct FrequencyCalibrator {
    config: CalibrationConfig,
    max_frequency_ppb: i32,
    state: CalibrationState,
    started: bool,
    last_sequence: u64,
    last_progress_pulses: u64,
}

impl FrequencyCalibrator {
    pub fn new(config: CalibrationConfig, max_frequency_ppb: i32) -> Self {
        let config = config.validated();
        info!("[Calibrator] interval={} pulses, threshold={}ppm, sanity={}ppm, max {} iterations",
              config.interval_pulses, config.drift_threshold_ppm,
              config.sanity_threshold_ppm, config.max_iterations);
        FrequencyCalibrator {
            config,
            max_frequency_ppb: max_frequency_ppb.max(1),
            state: CalibrationState::default(),
            started: false,
            last_sequence: 0,
            last_progress_pulses: 0,
        }
    }

    /// Begins a fresh calibration run. The hardware is assumed to be at 0 ppb.
    pub fn start(&mut self, edge_sequence: u64, local_time_ns: i64) {
        self.state = CalibrationState {
            baseline_edge_sequence: edge_sequence,
            baseline_local_ns: local_time_ns,
            ..CalibrationState::default()
        };
        self.started = true;
        self.last_sequence = edge_sequence;
        self.last_progress_pulses = 0;
        info!("[Calibrator] Baseline at edge #{} (local {}ns), measuring over {} pulses",
              edge_sequence, local_time_ns, self.config.interval_pulses);
    }

    pub fn update(&mut self, edge_sequence: u64, local_time_ns: i64) -> CalibrationUpdate {
        if !self.started {
            self.start(edge_sequence, local_time_ns);
            return CalibrationUpdate::InProgress { frequency_ppb: None };
        }
        if self.state.calibrated {
            return CalibrationUpdate::Converged {
                frequency_ppb: self.state.cumulative_correction_ppb,
                baseline_ppb: self.state.measured_drift_ppb,
                drift_ppm: self.state.last_drift_ppm,
            };
        }

        // Same edge seen again: the caller polled faster than the edge rate
        if edge_sequence <= self.last_sequence {
            debug!("[Calibrator] Ignoring repeated edge #{}", edge_sequence);
            return CalibrationUpdate::InProgress { frequency_ppb: None };
        }

        if edge_sequence > self.last_sequence + 1 {
            warn!("[Calibrator] Edge dropout ({} -> {}), restarting window",
                  self.last_sequence, edge_sequence);
            self.rebaseline(edge_sequence, local_time_ns);
            return CalibrationUpdate::InProgress { frequency_ppb: None };
        }
        self.last_sequence = edge_sequence;

        let elapsed = edge_sequence - self.state.baseline_edge_sequence;
        if elapsed < self.config.interval_pulses as u64 {
            if elapsed % 5 == 0 && elapsed != self.last_progress_pulses {
                debug!("[Calibrator] Progress {}/{} pulses", elapsed, self.config.interval_pulses);
                self.last_progress_pulses = elapsed;
            }
            return CalibrationUpdate::InProgress { frequency_ppb: None };
        }

        let local_delta_ns = local_time_ns - self.state.baseline_local_ns;
        let reference_delta_ns = elapsed as i64 * NANOS_PER_SEC;
        let drift_ppm = (local_delta_ns - reference_delta_ns) as f64 / reference_delta_ns as f64 * 1e6;
        self.state.last_drift_ppm = drift_ppm;

        if drift_ppm.abs() > self.config.sanity_threshold_ppm {
            warn!("[Calibrator] Rejected {:.1}ppm (limit {}ppm): local delta {}ns over {} pulses. \
                   Wrong clock device or a step during measurement?",
                  drift_ppm, self.config.sanity_threshold_ppm, local_delta_ns, elapsed);
            self.state.rejections += 1;
            self.rebaseline(edge_sequence, local_time_ns);
            return CalibrationUpdate::Rejected { drift_ppm };
        }

        self.state.iterations += 1;

        let correction_ppb = (-drift_ppm * 1000.0).round() as i64;
        let in_effect = self.state.cumulative_correction_ppb as i64;
        self.state.measured_drift_ppb = saturate_i32(in_effect + correction_ppb);

        let step = correction_ppb.clamp(-(self.config.max_correction_ppb as i64), self.config.max_correction_ppb as i64);
        let max = self.max_frequency_ppb as i64;
        self.state.cumulative_correction_ppb = (in_effect + step).clamp(-max, max) as i32;

        let converged = drift_ppm.abs() <= self.config.drift_threshold_ppm;
        if !converged && self.state.iterations < self.config.max_iterations {
            info!("[Calibrator] Iteration {}: {:.3}ppm, correction {:+}ppb, total {:+}ppb",
                  self.state.iterations, drift_ppm, step, self.state.cumulative_correction_ppb);
            self.rebaseline(edge_sequence, local_time_ns);
            return CalibrationUpdate::InProgress {
                frequency_ppb: Some(self.state.cumulative_correction_ppb),
            };
        }

        if !converged {
            warn!("[Calibrator] Max iterations reached with {:.3}ppm residual", drift_ppm);
        }
        self.state.calibrated = true;
        info!("[Calibrator] Complete after {} iterations: {:.3}ppm, baseline {:+}ppb, applied {:+}ppb",
              self.state.iterations, drift_ppm, self.state.measured_drift_ppb,
              self.state.cumulative_correction_ppb);

        CalibrationUpdate::Converged {
            frequency_ppb: self.state.cumulative_correction_ppb,
            baseline_ppb: self.state.measured_drift_ppb,
            drift_ppm,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.calibrated
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn rebaseline(&mut self, edge_sequence: u64, local_time_ns: i64) {
        self.state.baseline_edge_sequence = edge_sequence;
        self.state.baseline_local_ns = local_time_ns;
        self.last_sequence = edge_sequence;
        self.last_progress_pulses = 0;
    }
}

fn saturate_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = NANOS_PER_SEC;

    fn calibrator() -> FrequencyCalibrator {
        FrequencyCalibrator::new(CalibrationConfig::default(), 62_500_000)
    }

    /// Local time at edge `seq` for an oscillator `ppm` fast, relative to edge 0.
    fn local_at(seq: u64, ppm: f64) -> i64 {
        let t = seq as i64 * SEC;
        t + (t as f64 * ppm * 1e-6) as i64
    }

    fn run_window(cal: &mut FrequencyCalibrator, from: u64, ppm: f64) -> CalibrationUpdate {
        let mut last = CalibrationUpdate::InProgress { frequency_ppb: None };
        for seq in from + 1..=from + 20 {
            last = cal.update(seq, local_at(seq, ppm));
        }
        last
    }

    #[test]
    fn test_converges_in_one_window_under_threshold() {
        let mut cal = calibrator();
        cal.start(0, 0);
        match run_window(&mut cal, 0, 80.0) {
            CalibrationUpdate::Converged { frequency_ppb, baseline_ppb, drift_ppm } => {
                assert!((drift_ppm - 80.0).abs() < 0.001);
                assert_eq!(frequency_ppb, -80_000);
                assert_eq!(baseline_ppb, -80_000);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
        assert!(cal.is_calibrated());
        assert_eq!(cal.state().iterations, 1);
    }

    #[test]
    fn test_duplicate_edges_do_not_advance() {
        let mut cal = calibrator();
        cal.start(100, 100 * SEC);
        for seq in 101..=119 {
            cal.update(seq, local_at(seq, 10.0));
            // Polling twice per edge must be harmless
            assert_eq!(cal.update(seq, local_at(seq, 10.0)),
                       CalibrationUpdate::InProgress { frequency_ppb: None });
        }
        assert!(!cal.is_calibrated());
        assert!(matches!(cal.update(120, local_at(120, 10.0)), CalibrationUpdate::Converged { .. }));
    }

    #[test]
    fn test_large_drift_iterates_with_partial_corrections() {
        let mut cal = calibrator();
        cal.start(0, 0);
        // 700ppm: first correction clamps to 500000ppb
        match run_window(&mut cal, 0, 700.0) {
            CalibrationUpdate::InProgress { frequency_ppb: Some(f) } => assert_eq!(f, -500_000),
            other => panic!("expected partial correction, got {:?}", other),
        }
        assert_eq!(cal.state().baseline_edge_sequence, 20);

        // Oscillator now runs 200ppm fast relative to the new window
        let base = local_at(20, 700.0);
        let mut last = CalibrationUpdate::InProgress { frequency_ppb: None };
        for seq in 21..=40 {
            let elapsed = (seq - 20) as i64 * SEC;
            last = cal.update(seq, base + elapsed + (elapsed as f64 * 200e-6) as i64);
        }
        match last {
            CalibrationUpdate::InProgress { frequency_ppb: Some(f) } => assert_eq!(f, -700_000),
            other => panic!("expected second correction, got {:?}", other),
        }
        assert_eq!(cal.state().measured_drift_ppb, -700_000);
    }

    #[test]
    fn test_measured_baseline_survives_hardware_clamp() {
        let mut cal = FrequencyCalibrator::new(CalibrationConfig::default(), 62_500);
        cal.start(0, 0);
        match run_window(&mut cal, 0, 80.0) {
            CalibrationUpdate::Converged { frequency_ppb, baseline_ppb, .. } => {
                assert_eq!(frequency_ppb, -62_500);
                assert_eq!(baseline_ppb, -80_000);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
    }

    #[test]
    fn test_implausible_drift_rejected_and_rebaselined() {
        let mut cal = calibrator();
        cal.start(0, 0);
        let result = run_window(&mut cal, 0, 5000.0);
        assert!(matches!(result, CalibrationUpdate::Rejected { drift_ppm } if drift_ppm > 2000.0));
        let state = cal.state();
        assert_eq!(state.baseline_edge_sequence, 20);
        assert_eq!(state.iterations, 0);
        assert_eq!(state.rejections, 1);
        assert_eq!(state.cumulative_correction_ppb, 0);
    }

    #[test]
    fn test_gap_restarts_window() {
        let mut cal = calibrator();
        cal.start(0, 0);
        for seq in 1..=10 {
            cal.update(seq, local_at(seq, 5.0));
        }
        // Edges 11..13 never reached us
        cal.update(14, local_at(14, 5.0));
        assert_eq!(cal.state().baseline_edge_sequence, 14);
        for seq in 15..=33 {
            assert!(matches!(cal.update(seq, local_at(seq, 5.0)), CalibrationUpdate::InProgress { .. }));
        }
        assert!(matches!(cal.update(34, local_at(34, 5.0)), CalibrationUpdate::Converged { .. }));
    }

    #[test]
    fn test_max_iterations_forces_convergence() {
        let config = CalibrationConfig { max_iterations: 2, drift_threshold_ppm: 0.001, ..CalibrationConfig::default() };
        let mut cal = FrequencyCalibrator::new(config, 62_500_000);
        cal.start(0, 0);
        // The simulated oscillator ignores corrections, so drift never improves
        assert!(matches!(run_window(&mut cal, 0, 3.0), CalibrationUpdate::InProgress { frequency_ppb: Some(_) }));
        assert!(matches!(run_window(&mut cal, 20, 3.0), CalibrationUpdate::Converged { .. }));
        assert_eq!(cal.state().iterations, 2);
    }

    #[test]
    fn test_update_before_start_sets_baseline() {
        let mut cal = calibrator();
        assert_eq!(cal.update(7, 7 * SEC), CalibrationUpdate::InProgress { frequency_ppb: None });
        assert!(cal.is_started());
        assert_eq!(cal.state().baseline_edge_sequence, 7);
    }
}
