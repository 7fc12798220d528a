//! Reference Fusion - pairs calendar labels with PPS edges
//!
//! A GNSS receiver delivers two independent signals: a precise edge once per
//! second and a calendar label that arrives some time later over a slow
//! serial link. The label may describe the edge that just fired or the one
//! that is about to fire. We measure the label latency over several seconds,
//! decide which, and then pin a single `(base_sequence, base_utc)` pair.
//! From that point every edge maps to `base_utc + (seq - base_seq)` without
//! consulting the labels again.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::config::ReferenceConfig;
use crate::timestamp::NANOS_PER_SEC;
use crate::traits::{CalendarSample, EdgeEvent};

/// One disciplined timing point, produced once per edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    /// Reference time of the edge on the monotonic (TAI) timescale.
    pub reference_time_ns: i64,
    /// Host capture time of the edge.
    pub local_time_ns: i64,
    pub edge_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationMode {
    /// Label arrives after the edge it names.
    LabelsLastEdge,
    /// Label arrives just before the edge it names.
    LabelsNextEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceLockState {
    pub association_mode: AssociationMode,
    pub base_edge_sequence: u64,
    pub base_utc_seconds: i64,
    pub locked: bool,
}

pub struct ReferenceFusion {
    config: ReferenceConfig,
    lock: ReferenceLockState,

    // Association learning
    latency_sum_ns: i64,
    latency_count: u32,
    /// Base guessed from the very first label. Kept for diagnostics only,
    /// it is never used to produce a sample.
    tentative_base: Option<(u64, i64)>,

    last_label_utc: Option<i64>,
    last_edge: Option<EdgeEvent>,
    last_emitted_sequence: Option<u64>,
    stale_labels: u64,
}

impl ReferenceFusion {
    pub fn new(config: ReferenceConfig) -> Self {
        let config = config.validated();
        info!("[Fusion] Association window {}..{}ms over {} labels, UTC->TAI +{}s",
              config.last_edge_min_latency_ns / 1_000_000,
              config.last_edge_max_latency_ns / 1_000_000,
              config.association_samples,
              config.utc_to_tai_offset_s);
        ReferenceFusion {
            config,
            lock: ReferenceLockState {
                association_mode: AssociationMode::LabelsLastEdge,
                base_edge_sequence: 0,
                base_utc_seconds: 0,
                locked: false,
            },
            latency_sum_ns: 0,
            latency_count: 0,
            tentative_base: None,
            last_label_utc: None,
            last_edge: None,
            last_emitted_sequence: None,
            stale_labels: 0,
        }
    }

    /// Feed whatever the reference produced since the last call.
    ///
    /// Returns a sample only for an edge that has not been emitted before,
    /// and only once the association is locked.
    pub fn observe(&mut self, calendar: Option<CalendarSample>, edge: Option<EdgeEvent>) -> Option<TimeSample> {
        if let Some(edge) = edge {
            let is_new = self.last_edge.map_or(true, |prev| edge.sequence > prev.sequence);
            if is_new {
                self.last_edge = Some(edge);
            }
        }

        if let Some(label) = calendar {
            if !self.lock.locked {
                self.learn(label);
            }
        }

        if !self.lock.locked {
            return None;
        }

        let edge = self.last_edge?;
        if self.last_emitted_sequence.map_or(false, |seq| edge.sequence <= seq) {
            return None;
        }
        self.last_emitted_sequence = Some(edge.sequence);

        let utc_seconds = self.utc_seconds_for(edge.sequence);
        let tai_seconds = utc_seconds + self.config.utc_to_tai_offset_s;

        Some(TimeSample {
            reference_time_ns: tai_seconds * NANOS_PER_SEC,
            local_time_ns: edge.captured_at_ns,
            edge_sequence: edge.sequence,
        })
    }

    pub fn lock_state(&self) -> ReferenceLockState {
        self.lock
    }

    pub fn is_locked(&self) -> bool {
        self.lock.locked
    }

    pub fn tentative_base(&self) -> Option<(u64, i64)> {
        self.tentative_base
    }

    pub fn stale_label_count(&self) -> u64 {
        self.stale_labels
    }

    /// Drop the association and learn it again from fresh labels.
    /// Edges already emitted are never emitted again.
    pub fn request_reassociation(&mut self) {
        warn!("[Fusion] Re-association requested, discarding base mapping");
        self.lock.locked = false;
        self.latency_sum_ns = 0;
        self.latency_count = 0;
        self.tentative_base = None;
        self.last_label_utc = None;
    }

    fn utc_seconds_for(&self, sequence: u64) -> i64 {
        // Sequence is monotonic and the base was taken from a seen edge, so
        // the difference is small; it can be -1 briefly in LabelsNextEdge mode.
        let delta = sequence as i64 - self.lock.base_edge_sequence as i64;
        self.lock.base_utc_seconds + delta
    }

    fn learn(&mut self, label: CalendarSample) {
        if self.last_label_utc == Some(label.utc_seconds) {
            self.stale_labels += 1;
            return;
        }
        self.last_label_utc = Some(label.utc_seconds);

        // A label with no edge to measure against tells us nothing
        let edge = match self.last_edge {
            Some(e) => e,
            None => return,
        };

        let latency_ns = label.received_at_ns - edge.captured_at_ns;
        self.latency_sum_ns += latency_ns;
        self.latency_count += 1;

        debug!("[Fusion] Label {} arrived {}ms after edge #{} ({}/{})",
               label.utc_seconds, latency_ns / 1_000_000, edge.sequence,
               self.latency_count, self.config.association_samples);

        if self.latency_count >= self.config.association_samples {
            let avg_ns = self.latency_sum_ns / self.latency_count as i64;
            let labels_last = avg_ns >= self.config.last_edge_min_latency_ns
                && avg_ns <= self.config.last_edge_max_latency_ns;

            let (mode, base_seq) = if labels_last {
                (AssociationMode::LabelsLastEdge, edge.sequence)
            } else {
                (AssociationMode::LabelsNextEdge, edge.sequence + 1)
            };

            self.lock = ReferenceLockState {
                association_mode: mode,
                base_edge_sequence: base_seq,
                base_utc_seconds: label.utc_seconds,
                locked: true,
            };
            info!("[Fusion] Association locked: {:?} (avg latency {}ms), base_seq={} base_utc={}",
                  mode, avg_ns / 1_000_000, base_seq, label.utc_seconds);
        } else if self.tentative_base.is_none() {
            self.tentative_base = Some((edge.sequence, label.utc_seconds));
        }
    }
}
