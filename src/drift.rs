//! Drift Observer - epoch-aware frequency offset estimator
//!
//! Takes one `(reference, local)` timestamp pair per tick and keeps a bounded
//! window of samples. Every recognised discontinuity (a step, a new reference,
//! an explicit warm start, or an offset jump large enough that it can only be
//! a step) opens a new epoch. Statistics only ever look at the current epoch,
//! so a step can never leak into a drift average.

use log::{debug, info, warn};
use std::collections::VecDeque;
use crate::config::ObserverConfig;
use crate::timestamp::NANOS_PER_SEC;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriftSample {
    pub seq: u64,
    pub epoch_id: u32,
    pub reference_time_ns: i64,
    pub local_time_ns: i64,
    /// local - reference
    pub offset_ns: i64,
    pub delta_reference_ns: i64,
    pub delta_local_ns: i64,
    /// Offset change normalised to one second of reference time.
    pub drift_ns_per_s: f64,
    pub valid: bool,
    pub flags: u32,
}

impl DriftSample {
    pub const OFFSET_SPIKE: u32 = 1 << 0;
    pub const DRIFT_SPIKE: u32 = 1 << 1;
    pub const DT_REF_INVALID: u32 = 1 << 2;
    pub const DT_CLK_INVALID: u32 = 1 << 3;
    pub const EPOCH_BOUNDARY: u32 = 1 << 4;
    pub const IN_HOLDOFF: u32 = 1 << 5;

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

// Estimate health flags
pub const HF_NOT_READY: u32 = 1 << 0;
pub const HF_IN_HOLDOFF: u32 = 1 << 1;
pub const HF_MISSING_TICKS: u32 = 1 << 2;
pub const HF_STEP_DETECTED: u32 = 1 << 3;
pub const HF_WINDOW_CONTAMINATED: u32 = 1 << 4;
pub const HF_JITTER_TOO_HIGH: u32 = 1 << 5;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriftEstimate {
    pub drift_ppm: f64,
    pub drift_stddev_ppm: f64,
    pub offset_mean_ns: f64,
    pub offset_stddev_ns: f64,
    pub ready: bool,
    pub trustworthy: bool,
    pub ticks_in_holdoff: u32,
    pub valid_samples: usize,
    pub total_samples: usize,
    pub epoch: u32,
    pub health_flags: u32,
}

impl DriftEstimate {
    pub fn can_correct_offset(&self) -> bool {
        self.ready && self.health_flags & HF_NOT_READY == 0
    }

    pub fn can_correct_drift(&self) -> bool {
        self.trustworthy && self.health_flags & (HF_IN_HOLDOFF | HF_STEP_DETECTED) == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    ClockStepped,
    ReferenceChanged,
    WarmStartRequested,
    FrequencyAdjusted,
}

pub struct DriftObserver {
    name: String,
    config: ObserverConfig,
    samples: VecDeque<DriftSample>,
    epoch: u32,
    next_seq: u64,
    holdoff_remaining: u32,
    /// Next sample starts a new epoch; its deltas span the discontinuity.
    boundary_pending: bool,
    /// Set by an automatic epoch change, cleared once the holdoff expires.
    step_detected: bool,
    previous: Option<DriftSample>,
}

impl DriftObserver {
    pub fn new(name: &str, config: ObserverConfig) -> Self {
        let config = config.validated(name);
        DriftObserver {
            name: name.to_string(),
            samples: VecDeque::with_capacity(config.window_size),
            config,
            epoch: 0,
            next_seq: 0,
            holdoff_remaining: 0,
            boundary_pending: true,
            step_detected: false,
            previous: None,
        }
    }

    pub fn update(&mut self, reference_time_ns: i64, local_time_ns: i64) {
        let mut sample = DriftSample {
            seq: self.next_seq,
            epoch_id: self.epoch,
            reference_time_ns,
            local_time_ns,
            offset_ns: local_time_ns - reference_time_ns,
            valid: true,
            ..DriftSample::default()
        };
        self.next_seq += 1;

        match self.previous {
            Some(prev) if !self.boundary_pending => {
                sample.delta_reference_ns = reference_time_ns - prev.reference_time_ns;
                sample.delta_local_ns = local_time_ns - prev.local_time_ns;
                let offset_delta = sample.offset_ns - prev.offset_ns;
                sample.drift_ns_per_s = if sample.delta_reference_ns > 0 {
                    offset_delta as f64 * NANOS_PER_SEC as f64 / sample.delta_reference_ns as f64
                } else {
                    offset_delta as f64
                };

                if offset_delta.abs() > self.config.max_offset_step_ns {
                    // Nobody told us, but a jump this size is a step
                    warn!("[Drift:{}] Offset jumped {}ns without notification, new epoch", self.name, offset_delta);
                    self.open_epoch(self.config.holdoff_after_step_ticks);
                    // This sample is the boundary itself
                    self.boundary_pending = false;
                    self.step_detected = true;
                    sample.epoch_id = self.epoch;
                    sample.flags |= DriftSample::OFFSET_SPIKE | DriftSample::EPOCH_BOUNDARY;
                    sample.valid = false;
                } else {
                    self.check_outliers(&mut sample);
                }
            }
            _ => {
                sample.flags |= DriftSample::EPOCH_BOUNDARY;
                self.boundary_pending = false;
            }
        }

        if self.holdoff_remaining > 0 {
            sample.flags |= DriftSample::IN_HOLDOFF;
            self.holdoff_remaining -= 1;
            if self.holdoff_remaining == 0 {
                self.step_detected = false;
            }
        }

        if self.samples.len() >= self.config.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.previous = Some(sample);
    }

    pub fn notify(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::ClockStepped => {
                self.open_epoch(self.config.holdoff_after_step_ticks);
            }
            ObserverEvent::ReferenceChanged => {
                self.open_epoch(self.config.holdoff_after_ref_ticks);
            }
            ObserverEvent::WarmStartRequested => {
                self.samples.clear();
                self.previous = None;
                self.open_epoch(self.config.holdoff_after_step_ticks);
            }
            ObserverEvent::FrequencyAdjusted => {
                // Same epoch, but the rate just changed under recent samples
                self.holdoff_remaining = self.holdoff_remaining.max(self.config.holdoff_after_freq_ticks);
            }
        }
        debug!("[Drift:{}] {:?} -> epoch {}, holdoff {}", self.name, event, self.epoch, self.holdoff_remaining);
    }

    pub fn estimate(&self) -> DriftEstimate {
        let current: Vec<&DriftSample> = self.samples.iter()
            .filter(|s| s.epoch_id == self.epoch)
            .collect();
        let valid: Vec<&DriftSample> = current.iter().copied().filter(|s| s.valid).collect();

        let mut est = DriftEstimate {
            ticks_in_holdoff: self.holdoff_remaining,
            valid_samples: valid.len(),
            total_samples: self.samples.len(),
            epoch: self.epoch,
            ready: valid.len() >= self.config.min_valid_samples,
            ..DriftEstimate::default()
        };

        if !est.ready {
            est.health_flags |= HF_NOT_READY;
        }
        if self.holdoff_remaining > 0 {
            est.health_flags |= HF_IN_HOLDOFF;
        }
        if self.step_detected {
            est.health_flags |= HF_STEP_DETECTED;
        }
        if current.iter().any(|s| s.has(DriftSample::DT_REF_INVALID)) {
            est.health_flags |= HF_MISSING_TICKS;
        }
        if !current.is_empty() && (current.len() - valid.len()) * 4 > current.len() {
            est.health_flags |= HF_WINDOW_CONTAMINATED;
        }

        if !est.ready {
            return est;
        }

        let n = valid.len() as f64;
        est.offset_mean_ns = valid.iter().map(|s| s.offset_ns as f64).sum::<f64>() / n;
        est.offset_stddev_ns = (valid.iter()
            .map(|s| (s.offset_ns as f64 - est.offset_mean_ns).powi(2))
            .sum::<f64>() / n)
            .sqrt();

        // Per-sample rates; a boundary sample's delta spans the discontinuity
        let rates: Vec<f64> = valid.iter()
            .filter(|s| !s.has(DriftSample::EPOCH_BOUNDARY))
            .map(|s| s.drift_ns_per_s / 1000.0)
            .collect();

        est.drift_ppm = if self.config.use_linear_regression {
            regression_ppm(&valid)
        } else if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        if !rates.is_empty() {
            est.drift_stddev_ppm = (rates.iter()
                .map(|r| (r - est.drift_ppm).powi(2))
                .sum::<f64>() / rates.len() as f64)
                .sqrt();
        }
        if est.drift_stddev_ppm > self.config.max_drift_stddev_ppm {
            est.health_flags |= HF_JITTER_TOO_HIGH;
        }

        est.trustworthy = self.holdoff_remaining == 0
            && est.drift_stddev_ppm <= self.config.max_drift_stddev_ppm;
        est
    }

    /// Window contents, oldest first.
    pub fn samples(&self) -> Vec<DriftSample> {
        self.samples.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<DriftSample> {
        self.samples.back().copied()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn reset(&mut self) {
        info!("[Drift:{}] Reset", self.name);
        self.samples.clear();
        self.epoch = 0;
        self.holdoff_remaining = 0;
        self.boundary_pending = true;
        self.step_detected = false;
        self.previous = None;
    }

    fn open_epoch(&mut self, holdoff: u32) {
        self.epoch += 1;
        self.holdoff_remaining = holdoff;
        self.boundary_pending = true;
    }

    fn check_outliers(&self, sample: &mut DriftSample) {
        if (sample.drift_ns_per_s / 1000.0).abs() > self.config.max_drift_ppm {
            sample.valid = false;
            sample.flags |= DriftSample::DRIFT_SPIKE;
        }
        let dt_dev = (sample.delta_reference_ns - self.config.expected_interval_ns).abs();
        if dt_dev > self.config.max_interval_deviation_ns {
            sample.valid = false;
            sample.flags |= DriftSample::DT_REF_INVALID;
        }
        if sample.delta_local_ns <= 0 {
            sample.valid = false;
            sample.flags |= DriftSample::DT_CLK_INVALID;
        }
    }
}

/// Least-squares slope of offset against reference time, in ppm.
fn regression_ppm(samples: &[&DriftSample]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let t0 = samples[0].reference_time_ns;
    let n = samples.len() as f64;
    let xs: Vec<f64> = samples.iter()
        .map(|s| (s.reference_time_ns - t0) as f64 / NANOS_PER_SEC as f64)
        .collect();
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = samples.iter().map(|s| s.offset_ns as f64).sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (x, s) in xs.iter().zip(samples) {
        let dx = x - x_mean;
        num += dx * (s.offset_ns as f64 - y_mean);
        den += dx * dx;
    }
    if den < 1e-9 {
        return 0.0;
    }
    let slope_ns_per_s = num / den;
    if slope_ns_per_s.is_finite() { slope_ns_per_s / 1000.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = NANOS_PER_SEC;

    fn observer(regression: bool) -> DriftObserver {
        DriftObserver::new("test", ObserverConfig {
            window_size: 40,
            min_valid_samples: 10,
            use_linear_regression: regression,
            ..ObserverConfig::default()
        })
    }

    /// Feeds `count` one-second ticks of a clock running `ppm` fast.
    fn feed(obs: &mut DriftObserver, start_s: i64, count: i64, ppm: f64, base_offset_ns: i64) {
        for i in 0..count {
            let t = (start_s + i) * SEC;
            let offset = base_offset_ns + (ppm * 1000.0 * i as f64) as i64;
            obs.update(t, t + offset);
        }
    }

    #[test]
    fn test_constant_drift_mean_and_regression_agree() {
        for regression in [false, true] {
            let mut obs = observer(regression);
            feed(&mut obs, 100, 20, 12.0, 0);
            let est = obs.estimate();
            assert!(est.ready);
            assert!(est.trustworthy);
            assert!((est.drift_ppm - 12.0).abs() < 0.01, "regression={} got {}", regression, est.drift_ppm);
            assert!(est.drift_stddev_ppm < 0.01);
        }
    }

    #[test]
    fn test_not_ready_until_min_samples() {
        let mut obs = observer(true);
        feed(&mut obs, 0, 9, 1.0, 0);
        let est = obs.estimate();
        assert!(!est.ready);
        assert!(!est.trustworthy);
        assert!(est.health_flags & HF_NOT_READY != 0);
        assert!(!est.can_correct_offset());
    }

    #[test]
    fn test_clock_stepped_isolates_epoch() {
        let mut obs = observer(false);
        feed(&mut obs, 0, 20, 50.0, 0);
        obs.notify(ObserverEvent::ClockStepped);

        let est = obs.estimate();
        assert!(est.ticks_in_holdoff > 0);
        assert!(!est.trustworthy);
        assert_eq!(est.valid_samples, 0);

        // After the step the clock drifts the other way from a new origin
        feed(&mut obs, 20, 15, -3.0, 5_000_000);
        let est = obs.estimate();
        assert_eq!(est.valid_samples, 15);
        assert!((est.drift_ppm + 3.0).abs() < 0.01, "pre-step samples leaked: {}", est.drift_ppm);
        assert!(obs.samples().iter().filter(|s| s.epoch_id == est.epoch).all(|s| s.reference_time_ns >= 20 * SEC));
    }

    #[test]
    fn test_holdoff_counts_down_per_update() {
        let mut obs = observer(true);
        feed(&mut obs, 0, 12, 1.0, 0);
        obs.notify(ObserverEvent::ClockStepped);
        assert_eq!(obs.estimate().ticks_in_holdoff, 5);

        feed(&mut obs, 12, 4, 1.0, 0);
        assert_eq!(obs.estimate().ticks_in_holdoff, 1);
        feed(&mut obs, 16, 1, 1.0, 0);
        assert_eq!(obs.estimate().ticks_in_holdoff, 0);
        assert!(obs.samples().iter().rev().skip(1).take(4).all(|s| s.has(DriftSample::IN_HOLDOFF)));
    }

    #[test]
    fn test_frequency_adjusted_keeps_epoch() {
        let mut obs = observer(true);
        feed(&mut obs, 0, 15, 2.0, 0);
        let epoch = obs.epoch();
        obs.notify(ObserverEvent::FrequencyAdjusted);
        let est = obs.estimate();
        assert_eq!(est.epoch, epoch);
        assert_eq!(est.ticks_in_holdoff, 2);
        assert_eq!(est.valid_samples, 15);
        assert!(!est.trustworthy);
    }

    #[test]
    fn test_frequency_adjusted_does_not_shorten_step_holdoff() {
        let mut obs = observer(true);
        obs.notify(ObserverEvent::ReferenceChanged);
        obs.notify(ObserverEvent::FrequencyAdjusted);
        assert_eq!(obs.estimate().ticks_in_holdoff, 10);
    }

    #[test]
    fn test_unannounced_jump_opens_epoch() {
        let mut obs = observer(false);
        feed(&mut obs, 0, 15, 1.0, 0);
        let before = obs.epoch();

        // 150ms jump, nobody called notify()
        obs.update(15 * SEC, 15 * SEC + 150_000_000);
        let latest = obs.latest().unwrap();
        assert!(latest.has(DriftSample::OFFSET_SPIKE));
        assert!(!latest.valid);
        assert_eq!(obs.epoch(), before + 1);

        let est = obs.estimate();
        assert!(est.health_flags & HF_STEP_DETECTED != 0);
        assert!(!est.can_correct_drift());
    }

    #[test]
    fn test_drift_spike_and_cadence_outliers_excluded() {
        let mut obs = observer(false);
        feed(&mut obs, 0, 12, 0.0, 0);

        // 800ppm in one second: implausible, but below the step threshold
        obs.update(12 * SEC, 12 * SEC + 800_000);
        assert!(obs.latest().unwrap().has(DriftSample::DRIFT_SPIKE));

        // Missed edge: two seconds of reference time
        obs.update(14 * SEC, 14 * SEC + 800_000);
        assert!(obs.latest().unwrap().has(DriftSample::DT_REF_INVALID));

        let est = obs.estimate();
        assert_eq!(est.valid_samples, 12);
        assert!(est.health_flags & HF_MISSING_TICKS != 0);
        assert!(est.drift_ppm.abs() < 0.001);
    }

    #[test]
    fn test_regression_resists_single_noisy_delta() {
        let mut mean = observer(false);
        let mut reg = observer(true);
        for i in 0..30 {
            let t = i * SEC;
            // Alternating +-400ns jitter on a 5ppm slope
            let jitter = if i % 2 == 0 { 400 } else { -400 };
            let offset = 5_000 * i + jitter;
            mean.update(t, t + offset);
            reg.update(t, t + offset);
        }
        let mean_err = (mean.estimate().drift_ppm - 5.0).abs();
        let reg_err = (reg.estimate().drift_ppm - 5.0).abs();
        assert!(reg_err < mean_err);
        assert!(reg_err < 0.05);
    }

    #[test]
    fn test_warm_start_clears_window() {
        let mut obs = observer(true);
        feed(&mut obs, 0, 20, 1.0, 0);
        obs.notify(ObserverEvent::WarmStartRequested);
        assert!(obs.samples().is_empty());
        assert!(obs.estimate().ticks_in_holdoff > 0);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut obs = observer(true);
        feed(&mut obs, 0, 100, 1.0, 0);
        let samples = obs.samples();
        assert_eq!(samples.len(), 40);
        assert_eq!(samples.first().unwrap().seq, 60);
        assert_eq!(samples.last().unwrap().seq, 99);
    }

    #[test]
    fn test_cadence_follows_config() {
        // Ten-second sampling, as used for the secondary clock
        let mut obs = DriftObserver::new("rtc", ObserverConfig {
            window_size: 30,
            min_valid_samples: 10,
            expected_interval_ns: 10 * SEC,
            max_interval_deviation_ns: 100_000_000,
            ..ObserverConfig::default()
        });
        for i in 0..15 {
            let t = i * 10 * SEC;
            obs.update(t, t + 2_000 * 10 * i); // 2ppm
        }
        let est = obs.estimate();
        assert!(est.trustworthy);
        assert!((est.drift_ppm - 2.0).abs() < 0.001);
    }

    #[test]
    fn test_reset_returns_to_epoch_zero() {
        let mut obs = observer(true);
        feed(&mut obs, 0, 5, 1.0, 0);
        obs.notify(ObserverEvent::ClockStepped);
        obs.reset();
        assert_eq!(obs.epoch(), 0);
        assert!(obs.latest().is_none());
        assert_eq!(obs.estimate().ticks_in_holdoff, 0);
    }
}
