use log::{debug, info, warn};
use crate::config::ServoConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServoState {
    pub integral_ns: f64,
    pub last_correction_ppb: i32,
    pub locked: bool,
    pub consecutive_locked_samples: u32,
    pub sample_count: u64,
}

pub struct PiServo {
    kp: f64,
    ki: f64,
    integral_max_ns: f64,
    freq_max_ppb: i32,
    phase_threshold_ns: i64,
    freq_threshold_ppb: i32,
    lock_samples: u32,
    state: ServoState,
}

impl PiServo {
    pub fn new(config: ServoConfig) -> Self {
        let config = config.validated();
        info!("[Servo] Kp={} Ki={} integral_max={}ns freq_max={}ppb lock: <{}ns, <{}ppb x{}",
              config.kp, config.ki, config.integral_max_ns, config.freq_max_ppb,
              config.phase_lock_threshold_ns, config.freq_lock_threshold_ppb,
              config.lock_stability_samples);
        PiServo {
            kp: config.kp,
            ki: config.ki,
            integral_max_ns: config.integral_max_ns,
            freq_max_ppb: config.freq_max_ppb,
            phase_threshold_ns: config.phase_lock_threshold_ns,
            freq_threshold_ppb: config.freq_lock_threshold_ppb,
            lock_samples: config.lock_stability_samples,
            state: ServoState::default(),
        }
    }

    pub fn reset(&mut self) {
        self.state.integral_ns = 0.0;
        self.state.last_correction_ppb = 0;
        self.state.locked = false;
        self.state.consecutive_locked_samples = 0;
        debug!("[Servo] Reset");
    }

    /// Frequency correction (ppb) for one phase offset sample.
    /// `offset_ns`: reference - local (positive if local is behind)
    pub fn correct(&mut self, offset_ns: i64) -> i32 {
        self.state.sample_count += 1;

        // Anti-windup
        self.state.integral_ns = (self.state.integral_ns + offset_ns as f64)
            .clamp(-self.integral_max_ns, self.integral_max_ns);

        let proportional = self.kp * offset_ns as f64;
        let integral = self.ki * self.state.integral_ns;
        let max = self.freq_max_ppb as f64;
        let correction = (proportional + integral).clamp(-max, max) as i32;

        self.state.last_correction_ppb = correction;
        self.update_lock(offset_ns, correction);

        debug!("[Servo] Err={}ns, P={:.3}, I={:.3}, Corr={}ppb",
               offset_ns, proportional, integral, correction);

        correction
    }

    pub fn is_locked(&self) -> bool {
        self.state.locked
    }

    pub fn state(&self) -> ServoState {
        self.state
    }

    fn update_lock(&mut self, offset_ns: i64, correction: i32) {
        let within = offset_ns.abs() < self.phase_threshold_ns
            && correction.abs() < self.freq_threshold_ppb;

        if within {
            self.state.consecutive_locked_samples += 1;
            if !self.state.locked && self.state.consecutive_locked_samples >= self.lock_samples {
                self.state.locked = true;
                info!("[Servo] Locked (phase={}ns, freq={}ppb)", offset_ns, correction);
            }
        } else {
            self.state.consecutive_locked_samples = 0;
            if self.state.locked {
                self.state.locked = false;
                warn!("[Servo] Lost lock (phase={}ns, freq={}ppb)", offset_ns, correction);
            }
        }
    }
}
