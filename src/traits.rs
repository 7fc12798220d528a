use anyhow::Result;
use log::{info, warn};
use crate::fusion::AssociationMode;
use crate::state::{ClockQuality, SyncState};
use crate::timestamp::Timestamp;

/// A calendar label (date + time of day) decoded by the reference receiver.
/// `received_at_ns` is taken on the same host timebase as `EdgeEvent::captured_at_ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarSample {
    pub utc_seconds: i64,
    pub received_at_ns: i64,
}

/// One precisely timed reference edge (PPS assert).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub sequence: u64,
    pub captured_at_ns: i64,
}

/// Notifications published for observability. Never on the critical path.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    AssociationLocked { mode: AssociationMode, base_sequence: u64, base_utc_seconds: i64 },
    CalibrationComplete { baseline_ppb: i32, drift_ppm: f64, iterations: u32 },
    ClockStepped { offset_ns: i64, to: Timestamp },
    FrequencyAdjusted { cumulative_ppb: i32, delta_ppb: i32 },
    StateChanged { from: SyncState, to: SyncState, quality: ClockQuality },
    TrimAdjusted { from: i8, to: i8 },
    HardwareFault { operation: &'static str, message: String },
}

#[cfg_attr(test, mockall::automock)]
pub trait ReferenceTimeSource {
    /// Latest calendar label, if one arrived since the last poll.
    fn poll(&mut self) -> Option<CalendarSample>;

    /// Most recent edge. May return the same edge again if no new one fired.
    fn next_edge(&mut self) -> Option<EdgeEvent>;

    /// True while the receiver reports a valid fix.
    fn is_locked(&self) -> bool;
}

#[cfg_attr(test, mockall::automock)]
pub trait LocalClock {
    fn read(&mut self) -> Result<Timestamp>;
    fn step(&mut self, to: Timestamp) -> Result<()>;
    /// Sets the absolute frequency offset, in parts per billion.
    fn adjust_frequency(&mut self, ppb: i32) -> Result<()>;
    fn max_frequency_ppb(&self) -> i32;
}

/// Slow battery-backed clock used during holdover.
#[cfg_attr(test, mockall::automock)]
pub trait SecondaryClock {
    fn read(&mut self) -> Result<Timestamp>;
    fn sync_to(&mut self, time: Timestamp) -> Result<()>;
    fn read_trim(&mut self) -> Result<i8>;
    fn write_trim(&mut self, value: i8) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait AnnounceSink {
    fn announce(&mut self, event: &ControlEvent);
}

// The controller borrows adapters; the caller keeps ownership.

impl<T: ReferenceTimeSource + ?Sized> ReferenceTimeSource for &mut T {
    fn poll(&mut self) -> Option<CalendarSample> { (**self).poll() }
    fn next_edge(&mut self) -> Option<EdgeEvent> { (**self).next_edge() }
    fn is_locked(&self) -> bool { (**self).is_locked() }
}

impl<T: LocalClock + ?Sized> LocalClock for &mut T {
    fn read(&mut self) -> Result<Timestamp> { (**self).read() }
    fn step(&mut self, to: Timestamp) -> Result<()> { (**self).step(to) }
    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> { (**self).adjust_frequency(ppb) }
    fn max_frequency_ppb(&self) -> i32 { (**self).max_frequency_ppb() }
}

impl<T: SecondaryClock + ?Sized> SecondaryClock for &mut T {
    fn read(&mut self) -> Result<Timestamp> { (**self).read() }
    fn sync_to(&mut self, time: Timestamp) -> Result<()> { (**self).sync_to(time) }
    fn read_trim(&mut self) -> Result<i8> { (**self).read_trim() }
    fn write_trim(&mut self, value: i8) -> Result<()> { (**self).write_trim(value) }
}

impl<T: AnnounceSink + ?Sized> AnnounceSink for &mut T {
    fn announce(&mut self, event: &ControlEvent) { (**self).announce(event) }
}

/// Sink that writes every event to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl AnnounceSink for LogSink {
    fn announce(&mut self, event: &ControlEvent) {
        match event {
            ControlEvent::AssociationLocked { mode, base_sequence, base_utc_seconds } => {
                info!("[Announce] Association locked: {:?} base_seq={} base_utc={}",
                      mode, base_sequence, base_utc_seconds);
            }
            ControlEvent::CalibrationComplete { baseline_ppb, drift_ppm, iterations } => {
                info!("[Announce] Calibrated: baseline={}ppb drift={:.3}ppm after {} iterations",
                      baseline_ppb, drift_ppm, iterations);
            }
            ControlEvent::ClockStepped { offset_ns, to } => {
                info!("[Announce] Clock stepped to {} (offset {}ns)", to, offset_ns);
            }
            ControlEvent::FrequencyAdjusted { cumulative_ppb, delta_ppb } => {
                log::debug!("[Announce] Frequency {:+}ppb (delta {:+}ppb)", cumulative_ppb, delta_ppb);
            }
            ControlEvent::StateChanged { from, to, quality } => {
                info!("[Announce] {:?} -> {:?} (class={} accuracy=0x{:02X})",
                      from, to, quality.clock_class, quality.clock_accuracy);
            }
            ControlEvent::TrimAdjusted { from, to } => {
                info!("[Announce] Secondary clock trim {} -> {}", from, to);
            }
            ControlEvent::HardwareFault { operation, message } => {
                warn!("[Announce] Hardware fault during {}: {}", operation, message);
            }
        }
    }
}
