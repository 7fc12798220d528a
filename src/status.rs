use serde::{Deserialize, Serialize};
use crate::controller::Phase;
use crate::state::{ClockQuality, SyncState};

/// Snapshot of the control loop, published after every processed edge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GrandmasterStatus {
    pub phase: Phase,
    pub sync_state: SyncState,
    pub clock_quality: ClockQuality,
    /// Seconds spent in `sync_state`
    pub time_in_state_s: i64,

    /// reference - local at the last edge
    pub offset_ns: i64,
    /// Frequency currently applied to the local clock
    pub frequency_ppb: i32,
    /// Calibrated oscillator drift correction, restored after every step
    pub baseline_ppb: i32,
    pub last_correction_ppb: i32,
    pub servo_locked: bool,
    pub calibrated: bool,
    pub association_locked: bool,

    pub last_edge_sequence: u64,
    pub edges_processed: u64,
    pub settle_remaining: u32,
    pub step_count: u64,
    pub hardware_faults: u64,

    /// Residual local clock drift seen by the observer (ppm)
    pub local_drift_ppm: f64,
    pub local_drift_trustworthy: bool,
    /// Secondary clock drift against the reference (ppm)
    pub secondary_drift_ppm: f64,
    pub secondary_trim: Option<i8>,
}

impl Default for GrandmasterStatus {
    fn default() -> Self {
        GrandmasterStatus {
            phase: Phase::Acquiring,
            sync_state: SyncState::Recovering,
            clock_quality: ClockQuality::for_state(SyncState::Recovering, 0),
            time_in_state_s: 0,
            offset_ns: 0,
            frequency_ppb: 0,
            baseline_ppb: 0,
            last_correction_ppb: 0,
            servo_locked: false,
            calibrated: false,
            association_locked: false,
            last_edge_sequence: 0,
            edges_processed: 0,
            settle_remaining: 0,
            step_count: 0,
            hardware_faults: 0,
            local_drift_ppm: 0.0,
            local_drift_trustworthy: false,
            secondary_drift_ppm: 0.0,
            secondary_trim: None,
        }
    }
}
