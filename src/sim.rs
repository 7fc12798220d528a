//! Simulated hardware for running the control loop without a receiver
//!
//! One shared world drives all three adapters so they agree on true time:
//! - reference: 1PPS edges on whole TAI seconds plus a late UTC label per edge
//! - PHC: natural drift, frequency adjustment, step, read jitter
//! - RTC: natural drift, aging trim (0.1ppm per LSB, positive slows)
//!
//! Time only moves in `advance_second()`, so every adapter call made during
//! one control cycle sees the same instant.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;
use crate::timestamp::{Timestamp, NANOS_PER_SEC};
use crate::traits::{CalendarSample, EdgeEvent, LocalClock, ReferenceTimeSource, SecondaryClock};

const RTC_PPM_PER_LSB: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub start_tai_s: i64,
    pub utc_to_tai_offset_s: i64,
    /// Label arrival after its edge. Under 950ms the label names that edge.
    pub label_latency_ns: i64,
    pub capture_jitter_ns: f64,

    pub phc_drift_ppm: f64,
    /// PHC - true time at start
    pub phc_initial_offset_ns: f64,
    pub phc_jitter_ns: f64,
    pub phc_max_frequency_ppb: i32,

    pub rtc_drift_ppm: f64,
    pub rtc_initial_offset_ns: f64,
    pub rtc_initial_trim: i8,

    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            start_tai_s: 1_760_000_037,
            utc_to_tai_offset_s: 37,
            label_latency_ns: 300_000_000,
            capture_jitter_ns: 1_000.0,
            phc_drift_ppm: 80.0,
            phc_initial_offset_ns: -37.0e9, // PHC left on UTC
            phc_jitter_ns: 20.0,
            phc_max_frequency_ppb: 62_499_999,
            rtc_drift_ppm: 1.5,
            rtc_initial_offset_ns: 2.0e9,
            rtc_initial_trim: 0,
            seed: 1,
        }
    }
}

pub struct SimWorld {
    config: SimConfig,
    rng: StdRng,
    true_ns: i64,

    reference_available: bool,
    edge_sequence: u64,
    last_edge: Option<EdgeEvent>,
    pending_label: Option<CalendarSample>,

    phc_offset_ns: f64,
    phc_adj_ppb: i32,
    phc_steps: u32,
    phc_frequency_faults: u32,
    phc_step_faults: u32,

    rtc_offset_ns: f64,
    rtc_trim: i8,
}

pub type SharedWorld = Rc<RefCell<SimWorld>>;

impl SimWorld {
    pub fn new(config: SimConfig) -> SharedWorld {
        Rc::new(RefCell::new(SimWorld {
            rng: StdRng::seed_from_u64(config.seed),
            true_ns: config.start_tai_s * NANOS_PER_SEC,
            reference_available: true,
            edge_sequence: 0,
            last_edge: None,
            pending_label: None,
            phc_offset_ns: config.phc_initial_offset_ns,
            phc_adj_ppb: 0,
            phc_steps: 0,
            phc_frequency_faults: 0,
            phc_step_faults: 0,
            rtc_offset_ns: config.rtc_initial_offset_ns,
            rtc_trim: config.rtc_initial_trim,
            config,
        }))
    }

    /// Moves true time forward one second and fires the edge on the boundary.
    pub fn advance_second(&mut self) {
        self.true_ns += NANOS_PER_SEC;

        let phc_rate_ppb = self.config.phc_drift_ppm * 1_000.0 + self.phc_adj_ppb as f64;
        self.phc_offset_ns += phc_rate_ppb;

        let rtc_rate_ppm = self.config.rtc_drift_ppm - self.rtc_trim as f64 * RTC_PPM_PER_LSB;
        self.rtc_offset_ns += rtc_rate_ppm * 1_000.0;

        if !self.reference_available {
            return;
        }

        // Kernel counts only edges that actually fired
        self.edge_sequence += 1;
        let captured_at_ns = self.true_ns + self.gaussian(self.config.capture_jitter_ns) as i64;
        self.last_edge = Some(EdgeEvent { sequence: self.edge_sequence, captured_at_ns });

        let latency = self.config.label_latency_ns;
        let labelled_ns = if latency < 950_000_000 { self.true_ns } else { self.true_ns + NANOS_PER_SEC };
        self.pending_label = Some(CalendarSample {
            utc_seconds: labelled_ns / NANOS_PER_SEC - self.config.utc_to_tai_offset_s,
            received_at_ns: captured_at_ns + latency % NANOS_PER_SEC,
        });
    }

    pub fn set_reference_available(&mut self, available: bool) {
        self.reference_available = available;
        if !available {
            self.pending_label = None;
        }
    }

    pub fn true_time_ns(&self) -> i64 {
        self.true_ns
    }

    /// PHC - true time, without read noise
    pub fn phc_offset_ns(&self) -> f64 {
        self.phc_offset_ns
    }

    pub fn phc_frequency_ppb(&self) -> i32 {
        self.phc_adj_ppb
    }

    pub fn phc_steps(&self) -> u32 {
        self.phc_steps
    }

    pub fn rtc_offset_ns(&self) -> f64 {
        self.rtc_offset_ns
    }

    pub fn rtc_trim(&self) -> i8 {
        self.rtc_trim
    }

    /// The next `count` frequency writes fail.
    pub fn inject_frequency_faults(&mut self, count: u32) {
        self.phc_frequency_faults = count;
    }

    /// The next `count` steps fail.
    pub fn inject_step_faults(&mut self, count: u32) {
        self.phc_step_faults = count;
    }

    // Box-Muller
    fn gaussian(&mut self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        let u1: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = self.rng.random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * sigma
    }
}

// --- Adapters ---

pub struct SimReference(pub SharedWorld);

impl ReferenceTimeSource for SimReference {
    fn poll(&mut self) -> Option<CalendarSample> {
        self.0.borrow_mut().pending_label.take()
    }

    fn next_edge(&mut self) -> Option<EdgeEvent> {
        self.0.borrow().last_edge
    }

    fn is_locked(&self) -> bool {
        self.0.borrow().reference_available
    }
}

pub struct SimPhc(pub SharedWorld);

impl LocalClock for SimPhc {
    fn read(&mut self) -> Result<Timestamp> {
        let mut world = self.0.borrow_mut();
        let sigma = world.config.phc_jitter_ns;
        let noise = world.gaussian(sigma);
        let ns = world.true_ns as f64 + world.phc_offset_ns + noise;
        Ok(Timestamp::from_nanos(ns.round() as i64))
    }

    fn step(&mut self, to: Timestamp) -> Result<()> {
        let mut world = self.0.borrow_mut();
        if world.phc_step_faults > 0 {
            world.phc_step_faults -= 1;
            bail!("clock_settime: simulated failure");
        }
        world.phc_offset_ns = (to.as_nanos() - world.true_ns) as f64;
        world.phc_steps += 1;
        Ok(())
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        let mut world = self.0.borrow_mut();
        if world.phc_frequency_faults > 0 {
            world.phc_frequency_faults -= 1;
            bail!("clock_adjtime: simulated failure");
        }
        let max = world.config.phc_max_frequency_ppb;
        world.phc_adj_ppb = ppb.clamp(-max, max);
        Ok(())
    }

    fn max_frequency_ppb(&self) -> i32 {
        self.0.borrow().config.phc_max_frequency_ppb
    }
}

pub struct SimRtc(pub SharedWorld);

impl SecondaryClock for SimRtc {
    fn read(&mut self) -> Result<Timestamp> {
        let world = self.0.borrow();
        Ok(Timestamp::from_nanos(world.true_ns + world.rtc_offset_ns.round() as i64))
    }

    fn sync_to(&mut self, time: Timestamp) -> Result<()> {
        let mut world = self.0.borrow_mut();
        world.rtc_offset_ns = (time.as_nanos() - world.true_ns) as f64;
        Ok(())
    }

    fn read_trim(&mut self) -> Result<i8> {
        Ok(self.0.borrow().rtc_trim)
    }

    fn write_trim(&mut self, value: i8) -> Result<()> {
        self.0.borrow_mut().rtc_trim = value;
        Ok(())
    }
}

/// Adapters sharing one world.
pub fn adapters(world: &SharedWorld) -> (SimReference, SimPhc, SimRtc) {
    (SimReference(world.clone()), SimPhc(world.clone()), SimRtc(world.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SimConfig {
        SimConfig { phc_jitter_ns: 0.0, capture_jitter_ns: 0.0, ..SimConfig::default() }
    }

    #[test]
    fn test_edges_carry_labels_for_the_same_second() {
        let world = SimWorld::new(quiet());
        let (mut reference, _, _) = adapters(&world);

        world.borrow_mut().advance_second();
        let label = reference.poll().unwrap();
        let edge = reference.next_edge().unwrap();
        assert_eq!(edge.sequence, 1);
        assert_eq!(label.utc_seconds, 1_760_000_001);
        assert_eq!(label.received_at_ns - edge.captured_at_ns, 300_000_000);

        // Label consumed, edge repeats
        assert!(reference.poll().is_none());
        assert_eq!(reference.next_edge().unwrap().sequence, 1);
    }

    #[test]
    fn test_no_edges_while_reference_unavailable() {
        let world = SimWorld::new(quiet());
        let (mut reference, _, _) = adapters(&world);

        world.borrow_mut().advance_second();
        world.borrow_mut().set_reference_available(false);
        for _ in 0..5 {
            world.borrow_mut().advance_second();
        }
        assert!(!reference.is_locked());
        assert!(reference.poll().is_none());

        world.borrow_mut().set_reference_available(true);
        world.borrow_mut().advance_second();
        // Sequence continues from the last real edge
        assert_eq!(reference.next_edge().unwrap().sequence, 2);
    }

    #[test]
    fn test_phc_drift_and_frequency_cancel() {
        let world = SimWorld::new(quiet());
        let (_, mut phc, _) = adapters(&world);

        phc.step(Timestamp::new(1_760_000_037, 0)).unwrap();
        phc.adjust_frequency(-80_000).unwrap();
        for _ in 0..100 {
            world.borrow_mut().advance_second();
        }
        assert!(world.borrow().phc_offset_ns().abs() < 1e-6);
        assert_eq!(phc.read().unwrap(), Timestamp::new(1_760_000_137, 0));
    }

    #[test]
    fn test_rtc_trim_slows_clock() {
        let world = SimWorld::new(quiet());
        let (_, _, mut rtc) = adapters(&world);

        rtc.sync_to(Timestamp::new(1_760_000_037, 0)).unwrap();
        rtc.write_trim(15).unwrap();
        for _ in 0..1000 {
            world.borrow_mut().advance_second();
        }
        assert!(world.borrow().rtc_offset_ns().abs() < 1e-3);
    }

    #[test]
    fn test_injected_faults_are_consumed() {
        let world = SimWorld::new(quiet());
        let (_, mut phc, _) = adapters(&world);

        world.borrow_mut().inject_frequency_faults(1);
        assert!(phc.adjust_frequency(100).is_err());
        assert!(phc.adjust_frequency(100).is_ok());
        assert_eq!(world.borrow().phc_frequency_ppb(), 100);
    }
}
