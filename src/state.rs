use log::{info, warn};
use serde::{Deserialize, Serialize};
use crate::config::StateConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Reference present, lock not yet proven.
    Recovering,
    Locked,
    /// Reference absent; the clock free-runs on its last frequency.
    Holdover,
}

/// Clock quality advertised in Announce messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

const HOLDOVER_SHORT_S: i64 = 3_600;
const HOLDOVER_LONG_S: i64 = 86_400;

impl ClockQuality {
    pub fn for_state(state: SyncState, seconds_in_state: i64) -> Self {
        let (clock_class, clock_accuracy, offset_scaled_log_variance) = match state {
            SyncState::Locked => (6, 0x21, 0x4E5D),           // primary reference, within 100ns
            SyncState::Recovering => (248, 0xFE, 0xFFFF),     // default, unknown accuracy
            SyncState::Holdover if seconds_in_state < HOLDOVER_SHORT_S => (7, 0x31, 0x5000),
            SyncState::Holdover if seconds_in_state < HOLDOVER_LONG_S => (52, 0x31, 0x6000),
            SyncState::Holdover => (187, 0x31, 0x7000),       // beyond rated holdover
        };
        ClockQuality { clock_class, clock_accuracy, offset_scaled_log_variance }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: SyncState,
    pub to: SyncState,
}

pub struct SyncStateMachine {
    config: StateConfig,
    state: SyncState,
    consecutive_good: u32,
    entered_at_s: Option<i64>,
}

impl SyncStateMachine {
    pub fn new(config: StateConfig) -> Self {
        SyncStateMachine {
            config: config.validated(),
            state: SyncState::Recovering,
            consecutive_good: 0,
            entered_at_s: None,
        }
    }

    /// Feeds one cycle of inputs. Returns the transition if the state changed.
    pub fn update(
        &mut self,
        reference_valid: bool,
        edge_valid: bool,
        offset_ns: i64,
        freq_error_ppb: f64,
        now_s: i64,
    ) -> Option<Transition> {
        self.entered_at_s.get_or_insert(now_s);

        if !reference_valid || !edge_valid {
            if self.state != SyncState::Holdover {
                warn!("[State] Reference lost (reference={}, edge={})",
                      if reference_valid { "OK" } else { "FAIL" },
                      if edge_valid { "OK" } else { "FAIL" });
            }
            return self.transition(SyncState::Holdover, now_s);
        }

        match self.state {
            SyncState::Holdover => {
                // Never straight back to LOCKED
                self.transition(SyncState::Recovering, now_s)
            }
            SyncState::Recovering => {
                if self.within_lock(offset_ns, freq_error_ppb) {
                    self.consecutive_good += 1;
                    if self.consecutive_good >= self.config.lock_dwell_samples {
                        return self.transition(SyncState::Locked, now_s);
                    }
                } else {
                    self.consecutive_good = 0;
                }
                None
            }
            SyncState::Locked => {
                if offset_ns.abs() > self.config.holdover_phase_limit_ns {
                    warn!("[State] Offset {}ns beyond holdover limit while locked", offset_ns);
                    return self.transition(SyncState::Holdover, now_s);
                }
                None
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == SyncState::Locked
    }

    pub fn time_in_state(&self, now_s: i64) -> i64 {
        self.entered_at_s.map_or(0, |t| (now_s - t).max(0))
    }

    pub fn clock_quality(&self, now_s: i64) -> ClockQuality {
        ClockQuality::for_state(self.state, self.time_in_state(now_s))
    }

    pub fn reset(&mut self) {
        info!("[State] Reset to Recovering");
        self.state = SyncState::Recovering;
        self.consecutive_good = 0;
        self.entered_at_s = None;
    }

    fn within_lock(&self, offset_ns: i64, freq_error_ppb: f64) -> bool {
        offset_ns.abs() <= self.config.phase_lock_threshold_ns
            && freq_error_ppb.abs() <= self.config.freq_lock_threshold_ppb
    }

    fn transition(&mut self, to: SyncState, now_s: i64) -> Option<Transition> {
        if to == self.state {
            return None;
        }
        let from = self.state;
        info!("[State] {:?} -> {:?}", from, to);
        self.state = to;
        self.entered_at_s = Some(now_s);
        self.consecutive_good = 0;
        Some(Transition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SyncStateMachine {
        SyncStateMachine::new(StateConfig::default())
    }

    #[test]
    fn test_starts_recovering() {
        let sm = machine();
        assert_eq!(sm.state(), SyncState::Recovering);
        assert_eq!(sm.clock_quality(0).clock_class, 248);
    }

    #[test]
    fn test_locks_after_dwell() {
        let mut sm = machine();
        for t in 0..9 {
            assert!(sm.update(true, true, 40, 1.0, t).is_none());
        }
        let tr = sm.update(true, true, 40, 1.0, 9).unwrap();
        assert_eq!(tr, Transition { from: SyncState::Recovering, to: SyncState::Locked });
        assert!(sm.is_locked());
        assert_eq!(sm.clock_quality(9), ClockQuality { clock_class: 6, clock_accuracy: 0x21, offset_scaled_log_variance: 0x4E5D });
    }

    #[test]
    fn test_bad_sample_restarts_dwell() {
        let mut sm = machine();
        for t in 0..8 {
            sm.update(true, true, 40, 1.0, t);
        }
        // Frequency error too large
        sm.update(true, true, 40, 12.0, 8);
        for t in 9..18 {
            sm.update(true, true, 40, 1.0, t);
        }
        assert_eq!(sm.state(), SyncState::Recovering);
        sm.update(true, true, 40, 1.0, 18);
        assert!(sm.is_locked());
    }

    #[test]
    fn test_any_state_to_holdover_on_invalid_input() {
        let mut sm = machine();
        assert_eq!(sm.update(false, true, 0, 0.0, 0).unwrap().to, SyncState::Holdover);

        let mut sm = machine();
        for t in 0..10 {
            sm.update(true, true, 0, 0.0, t);
        }
        assert!(sm.is_locked());
        assert_eq!(sm.update(true, false, 0, 0.0, 10).unwrap().to, SyncState::Holdover);
    }

    #[test]
    fn test_holdover_returns_through_recovering() {
        let mut sm = machine();
        for t in 0..10 {
            sm.update(true, true, 0, 0.0, t);
        }
        sm.update(false, false, 0, 0.0, 10);
        let tr = sm.update(true, true, 0, 0.0, 11).unwrap();
        assert_eq!(tr, Transition { from: SyncState::Holdover, to: SyncState::Recovering });

        // Lock must be re-proven
        for t in 12..21 {
            sm.update(true, true, 0, 0.0, t);
        }
        assert!(!sm.is_locked());
        sm.update(true, true, 0, 0.0, 21);
        assert!(sm.is_locked());
    }

    #[test]
    fn test_locked_offset_beyond_limit_enters_holdover() {
        let mut sm = machine();
        for t in 0..10 {
            sm.update(true, true, 0, 0.0, t);
        }
        // Ordinary excursion keeps lock
        assert!(sm.update(true, true, 5_000, 50.0, 10).is_none());
        let tr = sm.update(true, true, 150_000_000, 0.0, 11).unwrap();
        assert_eq!(tr.to, SyncState::Holdover);
    }

    #[test]
    fn test_holdover_class_degrades_with_time() {
        let mut sm = machine();
        sm.update(false, true, 0, 0.0, 1_000);
        assert_eq!(sm.clock_quality(1_000 + 59).clock_class, 7);
        assert_eq!(sm.clock_quality(1_000 + 3_600).clock_class, 52);
        assert_eq!(sm.clock_quality(1_000 + 86_400).clock_class, 187);
        assert_eq!(sm.time_in_state(1_500), 500);
    }
}
