use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub reference: ReferenceConfig,
    pub servo: ServoConfig,
    pub calibration: CalibrationConfig,
    /// Reference vs. local clock residual drift tracking.
    pub drift: ObserverConfig,
    pub holdover: HoldoverConfig,
    pub state: StateConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub association_samples: u32,
    pub last_edge_min_latency_ns: i64,   // labels arriving inside this window name the last edge
    pub last_edge_max_latency_ns: i64,
    pub utc_to_tai_offset_s: i64,        // leap seconds
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
    pub integral_max_ns: f64,
    pub freq_max_ppb: i32,
    pub phase_lock_threshold_ns: i64,
    pub freq_lock_threshold_ppb: i32,
    pub lock_stability_samples: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub interval_pulses: u32,
    pub max_iterations: u32,
    pub drift_threshold_ppm: f64,     // converged below this
    pub sanity_threshold_ppm: f64,    // measurement rejected above this
    pub max_correction_ppb: i32,      // per iteration
    pub timeout_edges: u64,
    /// Skip calibration and start from a previously measured drift.
    pub preset_baseline_ppb: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub window_size: usize,
    pub min_valid_samples: usize,
    pub expected_interval_ns: i64,
    pub max_interval_deviation_ns: i64,
    pub max_offset_step_ns: i64,
    pub max_drift_ppm: f64,
    pub use_linear_regression: bool,
    pub holdoff_after_step_ticks: u32,
    pub holdoff_after_freq_ticks: u32,
    pub holdoff_after_ref_ticks: u32,
    pub max_drift_stddev_ppm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldoverConfig {
    pub enabled: bool,
    pub sample_interval_edges: u64,
    pub buffer_size: usize,
    pub min_samples: usize,
    pub min_interval_s: i64,
    pub stability_threshold_ppm: f64,
    pub ppm_per_lsb: f64,
    pub max_lsb_delta: i32,
    /// Secondary clock vs. reference drift tracking.
    pub observer: ObserverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub phase_lock_threshold_ns: i64,
    pub freq_lock_threshold_ppb: f64,
    pub lock_dwell_samples: u32,
    pub holdover_phase_limit_ns: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub step_threshold_ns: i64,
    pub alignment_threshold_ns: i64,   // initial / post-calibration alignment
    pub settle_cycles: u32,
    pub edge_timeout_ns: i64,
    pub max_acquire_edges: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            association_samples: 5,
            last_edge_min_latency_ns: 50_000_000,
            last_edge_max_latency_ns: 950_000_000,
            utc_to_tai_offset_s: 37,
        }
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: 0.01,
            ki: 0.0001,
            integral_max_ns: 10_000_000.0, // 10ms
            freq_max_ppb: 10_000,
            phase_lock_threshold_ns: 100,
            freq_lock_threshold_ppb: 5,
            lock_stability_samples: 10,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            interval_pulses: 20,
            max_iterations: 5,
            drift_threshold_ppm: 100.0,
            sanity_threshold_ppm: 2000.0,
            max_correction_ppb: 500_000,
            timeout_edges: 300,
            preset_baseline_ppb: None,
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            window_size: 120,
            min_valid_samples: 30,
            expected_interval_ns: 1_000_000_000,
            max_interval_deviation_ns: 2_000_000,
            max_offset_step_ns: 1_000_000,
            max_drift_ppm: 500.0,
            use_linear_regression: true,
            holdoff_after_step_ticks: 5,
            holdoff_after_freq_ticks: 2,
            holdoff_after_ref_ticks: 10,
            max_drift_stddev_ppm: 5.0,
        }
    }
}

impl Default for HoldoverConfig {
    fn default() -> Self {
        HoldoverConfig {
            enabled: true,
            sample_interval_edges: 10,
            buffer_size: 120,
            min_samples: 60,
            min_interval_s: 1200,
            stability_threshold_ppm: 0.3,
            ppm_per_lsb: 0.1,
            max_lsb_delta: 3,
            observer: ObserverConfig {
                window_size: 60,
                min_valid_samples: 12,
                expected_interval_ns: 10_000_000_000,
                max_interval_deviation_ns: 100_000_000,
                max_offset_step_ns: 50_000_000,
                holdoff_after_step_ticks: 2,
                holdoff_after_freq_ticks: 6,
                holdoff_after_ref_ticks: 2,
                ..ObserverConfig::default()
            },
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            phase_lock_threshold_ns: 100,
            freq_lock_threshold_ppb: 5.0,
            lock_dwell_samples: 10,
            holdover_phase_limit_ns: 100_000_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            step_threshold_ns: 100_000_000,
            alignment_threshold_ns: 10_000,
            settle_cycles: 10,
            edge_timeout_ns: 3_000_000_000,
            max_acquire_edges: 120,
        }
    }
}

// ============================================================================
// VALIDATION
// ============================================================================
// Invalid values are replaced with defaults and reported. A bad config file
// must never keep the clock from running.

fn positive<T: PartialOrd + Default + Copy + std::fmt::Display>(section: &str, field: &str, value: T, fallback: T) -> T {
    if value > T::default() {
        value
    } else {
        warn!("[Config] {}.{} = {} is not positive, using {}", section, field, value, fallback);
        fallback
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config.validated())
    }

    pub fn validated(self) -> Self {
        SystemConfig {
            reference: self.reference.validated(),
            servo: self.servo.validated(),
            calibration: self.calibration.validated(),
            drift: self.drift.validated("drift"),
            holdover: self.holdover.validated(),
            state: self.state.validated(),
            control: self.control.validated(),
        }
    }
}

impl ReferenceConfig {
    pub fn validated(self) -> Self {
        let d = ReferenceConfig::default();
        let mut c = self;
        // The decision needs at least a handful of latencies to average
        if c.association_samples < 5 {
            warn!("[Config] reference.association_samples = {} is below 5, using {}",
                  c.association_samples, d.association_samples);
            c.association_samples = d.association_samples;
        }
        if c.last_edge_min_latency_ns < 0
            || c.last_edge_max_latency_ns <= c.last_edge_min_latency_ns
            || c.last_edge_max_latency_ns > 1_000_000_000
        {
            warn!("[Config] reference latency window {}..{}ns is invalid, using defaults",
                  c.last_edge_min_latency_ns, c.last_edge_max_latency_ns);
            c.last_edge_min_latency_ns = d.last_edge_min_latency_ns;
            c.last_edge_max_latency_ns = d.last_edge_max_latency_ns;
        }
        if c.utc_to_tai_offset_s < 0 {
            warn!("[Config] reference.utc_to_tai_offset_s = {} is negative, using {}",
                  c.utc_to_tai_offset_s, d.utc_to_tai_offset_s);
            c.utc_to_tai_offset_s = d.utc_to_tai_offset_s;
        }
        c
    }
}

impl ServoConfig {
    pub fn validated(self) -> Self {
        let d = ServoConfig::default();
        let mut c = self;
        if !(c.kp > 0.0 && c.kp.is_finite()) || !(c.ki >= 0.0 && c.ki.is_finite()) {
            warn!("[Config] Invalid servo gains (kp={}, ki={}), using kp={} ki={}", c.kp, c.ki, d.kp, d.ki);
            c.kp = d.kp;
            c.ki = d.ki;
        }
        c.integral_max_ns = positive("servo", "integral_max_ns", c.integral_max_ns, d.integral_max_ns);
        c.freq_max_ppb = positive("servo", "freq_max_ppb", c.freq_max_ppb, d.freq_max_ppb);
        c.phase_lock_threshold_ns = positive("servo", "phase_lock_threshold_ns", c.phase_lock_threshold_ns, d.phase_lock_threshold_ns);
        c.freq_lock_threshold_ppb = positive("servo", "freq_lock_threshold_ppb", c.freq_lock_threshold_ppb, d.freq_lock_threshold_ppb);
        c.lock_stability_samples = positive("servo", "lock_stability_samples", c.lock_stability_samples, d.lock_stability_samples);
        c
    }
}

impl CalibrationConfig {
    pub fn validated(self) -> Self {
        let d = CalibrationConfig::default();
        let mut c = self;
        c.interval_pulses = positive("calibration", "interval_pulses", c.interval_pulses, d.interval_pulses);
        c.max_iterations = positive("calibration", "max_iterations", c.max_iterations, d.max_iterations);
        c.drift_threshold_ppm = positive("calibration", "drift_threshold_ppm", c.drift_threshold_ppm, d.drift_threshold_ppm);
        c.sanity_threshold_ppm = positive("calibration", "sanity_threshold_ppm", c.sanity_threshold_ppm, d.sanity_threshold_ppm);
        c.max_correction_ppb = positive("calibration", "max_correction_ppb", c.max_correction_ppb, d.max_correction_ppb);
        c.timeout_edges = positive("calibration", "timeout_edges", c.timeout_edges, d.timeout_edges);
        c
    }
}

impl ObserverConfig {
    pub fn validated(self, section: &str) -> Self {
        let d = ObserverConfig::default();
        let mut c = self;
        c.window_size = positive(section, "window_size", c.window_size, d.window_size);
        if c.min_valid_samples < 2 || c.min_valid_samples > c.window_size {
            let fallback = d.min_valid_samples.min(c.window_size).max(2);
            warn!("[Config] {}.min_valid_samples = {} does not fit window {}, using {}",
                  section, c.min_valid_samples, c.window_size, fallback);
            c.min_valid_samples = fallback;
        }
        c.expected_interval_ns = positive(section, "expected_interval_ns", c.expected_interval_ns, d.expected_interval_ns);
        c.max_interval_deviation_ns = positive(section, "max_interval_deviation_ns", c.max_interval_deviation_ns, d.max_interval_deviation_ns);
        c.max_offset_step_ns = positive(section, "max_offset_step_ns", c.max_offset_step_ns, d.max_offset_step_ns);
        c.max_drift_ppm = positive(section, "max_drift_ppm", c.max_drift_ppm, d.max_drift_ppm);
        c.max_drift_stddev_ppm = positive(section, "max_drift_stddev_ppm", c.max_drift_stddev_ppm, d.max_drift_stddev_ppm);
        c
    }
}

impl HoldoverConfig {
    pub fn validated(self) -> Self {
        let d = HoldoverConfig::default();
        let mut c = self;
        c.sample_interval_edges = positive("holdover", "sample_interval_edges", c.sample_interval_edges, d.sample_interval_edges);
        c.buffer_size = positive("holdover", "buffer_size", c.buffer_size, d.buffer_size);
        if c.min_samples == 0 || c.min_samples > c.buffer_size {
            warn!("[Config] holdover.min_samples = {} does not fit buffer {}, using {}",
                  c.min_samples, c.buffer_size, c.buffer_size / 2);
            c.min_samples = (c.buffer_size / 2).max(1);
        }
        c.min_interval_s = positive("holdover", "min_interval_s", c.min_interval_s, d.min_interval_s);
        c.stability_threshold_ppm = positive("holdover", "stability_threshold_ppm", c.stability_threshold_ppm, d.stability_threshold_ppm);
        c.ppm_per_lsb = positive("holdover", "ppm_per_lsb", c.ppm_per_lsb, d.ppm_per_lsb);
        c.max_lsb_delta = positive("holdover", "max_lsb_delta", c.max_lsb_delta, d.max_lsb_delta);
        c.observer = c.observer.validated("holdover.observer");
        c
    }
}

impl StateConfig {
    pub fn validated(self) -> Self {
        let d = StateConfig::default();
        let mut c = self;
        c.phase_lock_threshold_ns = positive("state", "phase_lock_threshold_ns", c.phase_lock_threshold_ns, d.phase_lock_threshold_ns);
        c.freq_lock_threshold_ppb = positive("state", "freq_lock_threshold_ppb", c.freq_lock_threshold_ppb, d.freq_lock_threshold_ppb);
        c.lock_dwell_samples = positive("state", "lock_dwell_samples", c.lock_dwell_samples, d.lock_dwell_samples);
        c.holdover_phase_limit_ns = positive("state", "holdover_phase_limit_ns", c.holdover_phase_limit_ns, d.holdover_phase_limit_ns);
        c
    }
}

impl ControlConfig {
    pub fn validated(self) -> Self {
        let d = ControlConfig::default();
        let mut c = self;
        c.step_threshold_ns = positive("control", "step_threshold_ns", c.step_threshold_ns, d.step_threshold_ns);
        c.alignment_threshold_ns = positive("control", "alignment_threshold_ns", c.alignment_threshold_ns, d.alignment_threshold_ns);
        c.edge_timeout_ns = positive("control", "edge_timeout_ns", c.edge_timeout_ns, d.edge_timeout_ns);
        c.max_acquire_edges = positive("control", "max_acquire_edges", c.max_acquire_edges, d.max_acquire_edges);
        c
    }
}
