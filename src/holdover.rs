//! Holdover Discipline - slow trim of the secondary clock's aging register
//!
//! Collects drift estimates of the secondary clock against the reference and,
//! once they are numerous and stable enough, proposes a small bounded step to
//! the trim register. DS3231: 0.1ppm per LSB, positive LSB slows the clock.

use log::{debug, info};
use std::collections::VecDeque;
use crate::config::HoldoverConfig;

pub struct HoldoverDiscipline {
    config: HoldoverConfig,
    samples: VecDeque<f64>,
    first_sample_s: Option<i64>,
    last_adjustment_s: Option<i64>,
    adjustments: u32,
}

impl HoldoverDiscipline {
    pub fn new(config: HoldoverConfig) -> Self {
        let config = config.validated();
        HoldoverDiscipline {
            samples: VecDeque::with_capacity(config.buffer_size),
            config,
            first_sample_s: None,
            last_adjustment_s: None,
            adjustments: 0,
        }
    }

    pub fn add_sample(&mut self, drift_ppm: f64, time_s: i64) {
        if !drift_ppm.is_finite() {
            return;
        }
        if self.samples.len() >= self.config.buffer_size {
            self.samples.pop_front();
        }
        self.samples.push_back(drift_ppm);
        self.first_sample_s.get_or_insert(time_s);
    }

    pub fn should_adjust(&self, time_s: i64) -> bool {
        if self.samples.len() < self.config.min_samples {
            return false;
        }

        // Before the first adjustment, measure from the first sample
        let since = self.last_adjustment_s.or(self.first_sample_s).unwrap_or(time_s);
        if time_s - since < self.config.min_interval_s {
            return false;
        }

        let stddev = self.stddev_ppm();
        if stddev >= self.config.stability_threshold_ppm {
            debug!("[Holdover] Drift too noisy to trim ({:.3}ppm stddev)", stddev);
            return false;
        }
        true
    }

    /// Trim register delta, in LSB.
    pub fn calculate_adjustment(&self) -> i32 {
        let lsb = (self.average_drift_ppm() / self.config.ppm_per_lsb).round() as i32;
        lsb.clamp(-self.config.max_lsb_delta, self.config.max_lsb_delta)
    }

    /// Call after the trim was written. Samples taken at the old trim no longer apply.
    pub fn record_adjustment(&mut self, time_s: i64) {
        info!("[Holdover] Trim adjusted at {}s (avg drift was {:.3}ppm over {} samples), re-learning",
              time_s, self.average_drift_ppm(), self.samples.len());
        self.last_adjustment_s = Some(time_s);
        self.adjustments += 1;
        self.samples.clear();
    }

    pub fn average_drift_ppm(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn stddev_ppm(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let avg = self.average_drift_ppm();
        let var = self.samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / self.samples.len() as f64;
        var.sqrt()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn adjustment_count(&self) -> u32 {
        self.adjustments
    }
}

/// Applies an LSB delta to a trim register value without wrapping.
pub fn apply_trim_delta(current: i8, delta: i32) -> i8 {
    (current as i32 + delta).clamp(i8::MIN as i32, i8::MAX as i32) as i8
}
