//! Grandmaster Controller - per-edge clock discipline loop
//!
//! One cycle per reference edge, identified by its sequence number only.
//! Startup runs as a bounded state machine polled by the caller:
//! 1. **Acquiring**: wait for the label/edge association, then align the
//!    local clock and sync the secondary clock
//! 2. **Calibrating**: open-loop drift measurement (skipped with a preset baseline)
//! 3. **Disciplining**: step-or-slew on every edge, RTC trim on its own cadence
//!
//! The PI servo only ever contributes a correction on top of the calibrated
//! baseline. A step restores the baseline and blocks the servo for a settle
//! window, since setting the clock disturbs the hardware's frequency.

use anyhow::Error;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use crate::calibrator::{CalibrationUpdate, FrequencyCalibrator};
use crate::config::SystemConfig;
use crate::drift::{DriftObserver, ObserverEvent};
use crate::fusion::{ReferenceFusion, TimeSample};
use crate::holdover::{apply_trim_delta, HoldoverDiscipline};
use crate::servo::{PiServo, ServoState};
use crate::state::{ClockQuality, SyncState, SyncStateMachine, Transition};
use crate::status::GrandmasterStatus;
use crate::timestamp::{Timestamp, NANOS_PER_SEC};
use crate::traits::{AnnounceSink, ControlEvent, EdgeEvent, LocalClock, ReferenceTimeSource, SecondaryClock};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Status line cadence, in processed edges
const STATUS_LOG_INTERVAL: u64 = 60;

/// Host-timebase spacing between edges may differ from the sequence delta by this much
/// before we assume edges were lost and the label mapping is stale.
const EDGE_CONTINUITY_TOLERANCE_NS: i64 = 500_000_000;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Acquiring,
    Calibrating,
    Disciplining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionAction {
    Step,
    Slew,
}

/// What one control cycle decided. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionDecision {
    pub offset_ns: i64,
    pub action: CorrectionAction,
    /// Servo output for a slew; frequency restored after a step.
    pub correction_ppb: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Stopped,
    NoEdge,
    /// No edge within the timeout; now in holdover.
    EdgeTimeout,
    /// Edges went missing; the label association is being learned again.
    Reassociating,
    Calibrating,
    Calibrated { baseline_ppb: i32 },
    Corrected(CorrectionDecision),
    Settling { remaining: u32 },
    /// Large offset but the association is not locked; nothing applied.
    Withheld { offset_ns: i64 },
    Holdover,
    HardwareFault,
}

pub struct GrandmasterController<R, C, S, A>
where
    R: ReferenceTimeSource,
    C: LocalClock,
    S: SecondaryClock,
    A: AnnounceSink,
{
    // Adapters
    reference: R,
    local: C,
    secondary: S,
    announce: A,
    config: SystemConfig,

    // Engines
    fusion: ReferenceFusion,
    calibrator: FrequencyCalibrator,
    servo: PiServo,
    state_machine: SyncStateMachine,
    local_observer: DriftObserver,
    secondary_observer: DriftObserver,
    holdover: HoldoverDiscipline,

    phase: Phase,
    running: Arc<AtomicBool>,
    status_shared: Arc<RwLock<GrandmasterStatus>>,

    // Frequency bookkeeping
    baseline_ppb: i32,
    frequency_ppb: i32,
    last_correction_ppb: i32,
    calibrated: bool,

    // Edge tracking
    last_raw_sequence: Option<u64>,
    last_sequence: Option<u64>,
    last_capture_ns: Option<i64>,
    last_edge_local_ns: Option<i64>,
    edge_timed_out: bool,
    last_offset_ns: i64,
    last_reference_s: i64,

    // Counters
    settle_remaining: u32,
    acquire_edges: u64,
    calibration_edges: u64,
    secondary_edges: u64,
    edges_processed: u64,
    step_count: u64,
    hardware_faults: u64,

    secondary_synced: bool,
    secondary_trim: Option<i8>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl<R, C, S, A> GrandmasterController<R, C, S, A>
where
    R: ReferenceTimeSource,
    C: LocalClock,
    S: SecondaryClock,
    A: AnnounceSink,
{
    pub fn new(
        reference: R,
        local: C,
        secondary: S,
        announce: A,
        status_shared: Arc<RwLock<GrandmasterStatus>>,
        config: SystemConfig,
    ) -> Self {
        let config = config.validated();
        let max_ppb = local.max_frequency_ppb();

        info!("=== Grandmaster Controller Initialization ===");
        info!("Local clock range: +-{}ppb", max_ppb);
        info!("Step threshold: {}ms, settle: {} edges",
              config.control.step_threshold_ns / 1_000_000, config.control.settle_cycles);
        match config.calibration.preset_baseline_ppb {
            Some(b) => info!("Calibration: skipped (preset baseline {:+}ppb)", b),
            None => info!("Calibration: {} pulses x up to {} iterations",
                          config.calibration.interval_pulses, config.calibration.max_iterations),
        }
        info!("Holdover discipline: {}", if config.holdover.enabled { "enabled" } else { "disabled" });
        info!("=== Ready ===");

        GrandmasterController {
            reference,
            local,
            secondary,
            announce,
            fusion: ReferenceFusion::new(config.reference.clone()),
            calibrator: FrequencyCalibrator::new(config.calibration.clone(), max_ppb),
            servo: PiServo::new(config.servo.clone()),
            state_machine: SyncStateMachine::new(config.state.clone()),
            local_observer: DriftObserver::new("local", config.drift.clone()),
            secondary_observer: DriftObserver::new("secondary", config.holdover.observer.clone()),
            holdover: HoldoverDiscipline::new(config.holdover.clone()),
            config,
            phase: Phase::Acquiring,
            running: Arc::new(AtomicBool::new(true)),
            status_shared,
            baseline_ppb: 0,
            frequency_ppb: 0,
            last_correction_ppb: 0,
            calibrated: false,
            last_raw_sequence: None,
            last_sequence: None,
            last_capture_ns: None,
            last_edge_local_ns: None,
            edge_timed_out: false,
            last_offset_ns: 0,
            last_reference_s: 0,
            settle_remaining: 0,
            acquire_edges: 0,
            calibration_edges: 0,
            secondary_edges: 0,
            edges_processed: 0,
            step_count: 0,
            hardware_faults: 0,
            secondary_synced: false,
            secondary_trim: None,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    /// Runs one cycle. Cheap to call faster than the edge rate: an edge
    /// already processed is never processed again.
    pub fn on_edge(&mut self) -> CycleOutcome {
        if !self.running.load(Ordering::SeqCst) {
            return CycleOutcome::Stopped;
        }

        let calendar = self.reference.poll();
        let edge = self.reference.next_edge();
        self.track_acquisition(edge);

        let sample = match self.fusion.observe(calendar, edge) {
            Some(s) => s,
            None => return self.check_edge_timeout(),
        };

        if !self.edge_sequence_is_continuous(&sample) {
            warn!("[Controller] Edge #{} does not match elapsed host time, re-learning association",
                  sample.edge_sequence);
            self.fusion.request_reassociation();
            self.last_capture_ns = None;
            return CycleOutcome::Reassociating;
        }

        let local_now = match self.local.read() {
            Ok(t) => t,
            Err(e) => {
                self.report_fault("read local clock", e);
                return CycleOutcome::HardwareFault;
            }
        };

        self.last_sequence = Some(sample.edge_sequence);
        self.last_capture_ns = Some(sample.local_time_ns);
        self.last_edge_local_ns = Some(local_now.as_nanos());
        self.edge_timed_out = false;
        self.edges_processed += 1;

        let offset_ns = sample.reference_time_ns - local_now.as_nanos();
        self.last_offset_ns = offset_ns;
        self.last_reference_s = sample.reference_time_ns.div_euclid(NANOS_PER_SEC);

        let reference_valid = self.reference.is_locked();

        if self.phase != Phase::Acquiring {
            self.local_observer.update(sample.reference_time_ns, local_now.as_nanos());
            if reference_valid {
                self.feed_secondary(&sample);
            }
        }

        let outcome = match self.phase {
            Phase::Acquiring => self.acquire(&sample, offset_ns),
            Phase::Calibrating => self.calibrate(&sample, local_now, offset_ns),
            Phase::Disciplining => self.discipline(&sample, offset_ns, reference_valid),
        };

        if self.edges_processed % STATUS_LOG_INTERVAL == 0 {
            info!("[Controller] #{} {:?}/{:?} offset={}ns freq={:+}ppb baseline={:+}ppb locked={}",
                  sample.edge_sequence, self.phase, self.state_machine.state(), offset_ns,
                  self.frequency_ppb, self.baseline_ppb, self.servo.is_locked());
        }
        self.publish_status();
        outcome
    }

    pub fn get_state(&self) -> GrandmasterStatus {
        self.status_shared.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn get_status_shared(&self) -> Arc<RwLock<GrandmasterStatus>> {
        self.status_shared.clone()
    }

    /// Cooperative stop; takes effect at the next cycle. In-flight writes complete.
    pub fn shutdown(&self) {
        info!("[Controller] Shutting down...");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Flag shared with signal handlers; clearing it is the same as `shutdown()`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.servo.is_locked()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sync_state(&self) -> SyncState {
        self.state_machine.state()
    }

    pub fn frequency_ppb(&self) -> i32 {
        self.frequency_ppb
    }

    pub fn baseline_ppb(&self) -> i32 {
        self.baseline_ppb
    }

    pub fn servo_state(&self) -> ServoState {
        self.servo.state()
    }

    // ========================================================================
    // PHASES
    // ========================================================================

    fn acquire(&mut self, sample: &TimeSample, offset_ns: i64) -> CycleOutcome {
        let lock = self.fusion.lock_state();
        self.announce.announce(&ControlEvent::AssociationLocked {
            mode: lock.association_mode,
            base_sequence: lock.base_edge_sequence,
            base_utc_seconds: lock.base_utc_seconds,
        });
        info!("[Controller] Reference acquired after {} edges, offset {}ns", self.acquire_edges, offset_ns);

        self.sync_secondary(sample.reference_time_ns);

        if let Some(baseline) = self.config.calibration.preset_baseline_ppb {
            self.baseline_ppb = baseline;
            self.calibrated = true;
            self.phase = Phase::Disciplining;
            info!("[Controller] Using preset baseline {:+}ppb", baseline);
            return self.align(sample, offset_ns, CycleOutcome::Calibrated { baseline_ppb: baseline });
        }

        // Calibration measures from a known 0ppb starting point
        self.baseline_ppb = 0;
        self.phase = Phase::Calibrating;
        self.calibration_edges = 0;
        if !self.set_frequency(0) {
            return CycleOutcome::HardwareFault;
        }
        self.align(sample, offset_ns, CycleOutcome::Calibrating)
    }

    fn calibrate(&mut self, sample: &TimeSample, local_now: Timestamp, offset_ns: i64) -> CycleOutcome {
        self.calibration_edges += 1;
        if self.calibration_edges > self.config.calibration.timeout_edges {
            warn!("[Controller] Calibration incomplete after {} edges, continuing with 0ppb baseline",
                  self.config.calibration.timeout_edges);
            return self.finish_calibration(sample, offset_ns, 0, 0);
        }

        // Let a fresh step settle before it pollutes the measurement
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            return CycleOutcome::Settling { remaining: self.settle_remaining };
        }

        if !self.calibrator.is_started() {
            self.calibrator.start(sample.edge_sequence, local_now.as_nanos());
            return CycleOutcome::Calibrating;
        }

        match self.calibrator.update(sample.edge_sequence, local_now.as_nanos()) {
            CalibrationUpdate::InProgress { frequency_ppb: None } | CalibrationUpdate::Rejected { .. } => {
                CycleOutcome::Calibrating
            }
            CalibrationUpdate::InProgress { frequency_ppb: Some(ppb) } => {
                if self.set_frequency(ppb) {
                    self.local_observer.notify(ObserverEvent::FrequencyAdjusted);
                    CycleOutcome::Calibrating
                } else {
                    CycleOutcome::HardwareFault
                }
            }
            CalibrationUpdate::Converged { frequency_ppb, baseline_ppb, drift_ppm } => {
                self.announce.announce(&ControlEvent::CalibrationComplete {
                    baseline_ppb,
                    drift_ppm,
                    iterations: self.calibrator.state().iterations,
                });
                self.finish_calibration(sample, offset_ns, frequency_ppb, baseline_ppb)
            }
        }
    }

    fn finish_calibration(&mut self, sample: &TimeSample, offset_ns: i64, frequency_ppb: i32, baseline_ppb: i32) -> CycleOutcome {
        self.baseline_ppb = baseline_ppb;
        self.calibrated = true;
        self.phase = Phase::Disciplining;
        self.settle_remaining = 0;
        if !self.set_frequency(frequency_ppb) {
            return CycleOutcome::HardwareFault;
        }
        self.local_observer.notify(ObserverEvent::FrequencyAdjusted);
        // Phase wandered during the open-loop measurement
        self.align(sample, offset_ns, CycleOutcome::Calibrated { baseline_ppb })
    }

    fn discipline(&mut self, sample: &TimeSample, offset_ns: i64, reference_valid: bool) -> CycleOutcome {
        let transition = self.state_machine.update(
            reference_valid,
            true,
            offset_ns,
            self.last_correction_ppb as f64,
            self.last_reference_s,
        );
        if let Some(t) = transition {
            self.on_transition(t, Some(sample.reference_time_ns));
        }

        // Never correct from a reference we do not trust
        if self.state_machine.state() == SyncState::Holdover {
            return CycleOutcome::Holdover;
        }

        if offset_ns.abs() > self.config.control.step_threshold_ns {
            if !self.fusion.is_locked() {
                // A step on an unresolved association can be off by a whole second
                warn!("[Controller] Offset {}ns but association not locked, withholding step", offset_ns);
                return CycleOutcome::Withheld { offset_ns };
            }
            return self.apply_step(sample.reference_time_ns, offset_ns);
        }

        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            debug!("[Controller] Settling after step ({} edges left)", self.settle_remaining);
            return CycleOutcome::Settling { remaining: self.settle_remaining };
        }

        let correction = self.servo.correct(offset_ns);
        self.last_correction_ppb = correction;
        let target = self.clamp_to_hardware(self.baseline_ppb as i64 + correction as i64);
        if !self.set_frequency(target) {
            return CycleOutcome::HardwareFault;
        }

        CycleOutcome::Corrected(CorrectionDecision {
            offset_ns,
            action: CorrectionAction::Slew,
            correction_ppb: correction,
        })
    }

    // ========================================================================
    // CORRECTIONS
    // ========================================================================

    /// Steps on the first edge of a phase if the clock is visibly off.
    fn align(&mut self, sample: &TimeSample, offset_ns: i64, otherwise: CycleOutcome) -> CycleOutcome {
        if offset_ns.abs() > self.config.control.alignment_threshold_ns {
            return self.apply_step(sample.reference_time_ns, offset_ns);
        }
        if self.phase == Phase::Disciplining {
            let restored = self.clamp_to_hardware(self.baseline_ppb as i64);
            if !self.set_frequency(restored) {
                return CycleOutcome::HardwareFault;
            }
        }
        otherwise
    }

    fn apply_step(&mut self, reference_time_ns: i64, offset_ns: i64) -> CycleOutcome {
        let target = Timestamp::from_nanos(reference_time_ns);
        info!("[Controller] Stepping local clock to {} (offset {}ns)", target, offset_ns);

        if let Err(e) = self.local.step(target) {
            // Not retried this cycle; a second step could land on top of a late first one
            self.report_fault("step local clock", e);
            return CycleOutcome::HardwareFault;
        }

        self.step_count += 1;
        self.servo.reset();
        self.last_correction_ppb = 0;
        self.settle_remaining = self.config.control.settle_cycles;
        self.local_observer.notify(ObserverEvent::ClockStepped);
        self.announce.announce(&ControlEvent::ClockStepped { offset_ns, to: target });

        // Setting the clock may reset the hardware frequency; restore the measured drift
        let restored = self.clamp_to_hardware(self.baseline_ppb as i64);
        if !self.set_frequency(restored) {
            return CycleOutcome::HardwareFault;
        }

        CycleOutcome::Corrected(CorrectionDecision {
            offset_ns,
            action: CorrectionAction::Step,
            correction_ppb: restored,
        })
    }

    /// Writes a new cumulative frequency; it is only recorded once the
    /// hardware accepts it. False on failure.
    fn set_frequency(&mut self, ppb: i32) -> bool {
        match self.local.adjust_frequency(ppb) {
            Ok(()) => {
                let delta = ppb - self.frequency_ppb;
                self.frequency_ppb = ppb;
                self.announce.announce(&ControlEvent::FrequencyAdjusted { cumulative_ppb: ppb, delta_ppb: delta });
                true
            }
            Err(e) => {
                self.report_fault("adjust frequency", e);
                false
            }
        }
    }

    fn clamp_to_hardware(&self, ppb: i64) -> i32 {
        let max = self.local.max_frequency_ppb().max(0) as i64;
        ppb.clamp(-max, max) as i32
    }

    // ========================================================================
    // REFERENCE HEALTH
    // ========================================================================

    fn track_acquisition(&mut self, edge: Option<EdgeEvent>) {
        if self.phase != Phase::Acquiring {
            return;
        }
        if let Some(edge) = edge {
            if self.last_raw_sequence.map_or(true, |s| edge.sequence > s) {
                self.last_raw_sequence = Some(edge.sequence);
                self.acquire_edges += 1;
                if self.acquire_edges == self.config.control.max_acquire_edges {
                    warn!("[Controller] No label association after {} edges. Is the receiver sending time of day?",
                          self.acquire_edges);
                }
            }
        }
    }

    /// Kernel edge counters only advance on real edges. If edges were lost,
    /// the count falls behind wall time and the base mapping would be wrong.
    fn edge_sequence_is_continuous(&self, sample: &TimeSample) -> bool {
        let (last_seq, last_capture) = match (self.last_sequence, self.last_capture_ns) {
            (Some(s), Some(c)) => (s, c),
            _ => return true,
        };
        let expected_ns = sample.edge_sequence.saturating_sub(last_seq) as i64 * NANOS_PER_SEC;
        let elapsed_ns = sample.local_time_ns - last_capture;
        (elapsed_ns - expected_ns).abs() <= EDGE_CONTINUITY_TOLERANCE_NS
    }

    fn check_edge_timeout(&mut self) -> CycleOutcome {
        let last = match self.last_edge_local_ns {
            Some(t) if !self.edge_timed_out && self.phase != Phase::Acquiring => t,
            _ => return CycleOutcome::NoEdge,
        };

        let now = match self.local.read() {
            Ok(t) => t,
            Err(e) => {
                self.report_fault("read local clock", e);
                return CycleOutcome::HardwareFault;
            }
        };
        if now.as_nanos() - last <= self.config.control.edge_timeout_ns {
            return CycleOutcome::NoEdge;
        }

        self.edge_timed_out = true;
        warn!("[Controller] No reference edge for {}ms", (now.as_nanos() - last) / 1_000_000);

        // Sequence numbers stop while edges are missing; the mapping must be re-learned
        self.fusion.request_reassociation();
        self.last_capture_ns = None;

        let transition = self.state_machine.update(
            self.reference.is_locked(),
            false,
            self.last_offset_ns,
            self.last_correction_ppb as f64,
            now.seconds,
        );
        if let Some(t) = transition {
            self.on_transition(t, None);
        }
        self.publish_status();
        CycleOutcome::EdgeTimeout
    }

    fn on_transition(&mut self, t: Transition, reference_time_ns: Option<i64>) {
        self.announce.announce(&ControlEvent::StateChanged {
            from: t.from,
            to: t.to,
            quality: ClockQuality::for_state(t.to, 0),
        });

        if t.from == SyncState::Holdover && t.to == SyncState::Recovering {
            self.local_observer.notify(ObserverEvent::ReferenceChanged);
            self.secondary_observer.notify(ObserverEvent::ReferenceChanged);
            if let Some(ns) = reference_time_ns {
                self.sync_secondary(ns);
            }
        }
    }

    // ========================================================================
    // SECONDARY CLOCK
    // ========================================================================

    fn sync_secondary(&mut self, reference_time_ns: i64) {
        if !self.config.holdover.enabled {
            return;
        }
        let target = Timestamp::from_nanos(reference_time_ns);
        match self.secondary.sync_to(target) {
            Ok(()) => {
                info!("[Controller] Secondary clock synced to {}", target);
                self.secondary_synced = true;
                self.secondary_edges = 0;
                self.secondary_observer.notify(ObserverEvent::ClockStepped);
            }
            Err(e) => self.report_fault("sync secondary clock", e),
        }

        if self.secondary_trim.is_none() {
            match self.secondary.read_trim() {
                Ok(trim) => self.secondary_trim = Some(trim),
                Err(e) => self.report_fault("read secondary trim", e),
            }
        }
    }

    fn feed_secondary(&mut self, sample: &TimeSample) {
        if !self.config.holdover.enabled || !self.secondary_synced {
            return;
        }
        self.secondary_edges += 1;
        if self.secondary_edges < self.config.holdover.sample_interval_edges {
            return;
        }
        self.secondary_edges = 0;

        let secondary_now = match self.secondary.read() {
            Ok(t) => t,
            Err(e) => {
                self.report_fault("read secondary clock", e);
                return;
            }
        };
        self.secondary_observer.update(sample.reference_time_ns, secondary_now.as_nanos());

        let est = self.secondary_observer.estimate();
        if !est.ready || est.ticks_in_holdoff > 0 {
            return;
        }
        let now_s = sample.reference_time_ns.div_euclid(NANOS_PER_SEC);
        self.holdover.add_sample(est.drift_ppm, now_s);
        if self.holdover.should_adjust(now_s) {
            self.trim_secondary(now_s);
        }
    }

    fn trim_secondary(&mut self, now_s: i64) {
        let delta = self.holdover.calculate_adjustment();
        if delta == 0 {
            return;
        }
        let current = match self.secondary.read_trim() {
            Ok(t) => t,
            Err(e) => {
                self.report_fault("read secondary trim", e);
                return;
            }
        };
        let next = apply_trim_delta(current, delta);
        if next == current {
            warn!("[Controller] Secondary trim saturated at {}", current);
            return;
        }
        match self.secondary.write_trim(next) {
            Ok(()) => {
                self.secondary_trim = Some(next);
                self.holdover.record_adjustment(now_s);
                self.secondary_observer.notify(ObserverEvent::FrequencyAdjusted);
                self.announce.announce(&ControlEvent::TrimAdjusted { from: current, to: next });
            }
            Err(e) => self.report_fault("write secondary trim", e),
        }
    }

    // ========================================================================
    // REPORTING
    // ========================================================================

    fn report_fault(&mut self, operation: &'static str, err: Error) {
        self.hardware_faults += 1;
        warn!("[Controller] Failed to {}: {:#}", operation, err);
        self.announce.announce(&ControlEvent::HardwareFault {
            operation,
            message: format!("{:#}", err),
        });
    }

    fn publish_status(&self) {
        let local = self.local_observer.estimate();
        let secondary = self.secondary_observer.estimate();
        let now_s = self.last_reference_s;

        if let Ok(mut status) = self.status_shared.write() {
            status.phase = self.phase;
            status.sync_state = self.state_machine.state();
            status.clock_quality = self.state_machine.clock_quality(now_s);
            status.time_in_state_s = self.state_machine.time_in_state(now_s);
            status.offset_ns = self.last_offset_ns;
            status.frequency_ppb = self.frequency_ppb;
            status.baseline_ppb = self.baseline_ppb;
            status.last_correction_ppb = self.last_correction_ppb;
            status.servo_locked = self.servo.is_locked();
            status.calibrated = self.calibrated;
            status.association_locked = self.fusion.is_locked();
            status.last_edge_sequence = self.last_sequence.unwrap_or(0);
            status.edges_processed = self.edges_processed;
            status.settle_remaining = self.settle_remaining;
            status.step_count = self.step_count;
            status.hardware_faults = self.hardware_faults;
            status.local_drift_ppm = local.drift_ppm;
            status.local_drift_trustworthy = local.trustworthy;
            status.secondary_drift_ppm = secondary.drift_ppm;
            status.secondary_trim = self.secondary_trim;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
