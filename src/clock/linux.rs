use crate::timestamp::Timestamp;
use crate::traits::LocalClock;
use anyhow::{anyhow, Context, Result};
use libc::{self, clockid_t, timespec, timex, ADJ_FREQUENCY};
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

// Dynamic POSIX clock ids encode the fd: ((~fd) << 3) | CLOCKFD
const CLOCKFD: clockid_t = 3;

// linux/ptp_clock.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtpClockCaps {
    pub max_adj: libc::c_int,
    pub n_alarm: libc::c_int,
    pub n_ext_ts: libc::c_int,
    pub n_per_out: libc::c_int,
    pub pps: libc::c_int,
    pub n_pins: libc::c_int,
    pub cross_timestamping: libc::c_int,
    pub adjust_phase: libc::c_int,
    pub max_phase_adj: libc::c_int,
    pub rsv: [libc::c_int; 11],
}

nix::ioctl_read!(ptp_clock_getcaps, b'=', 1, PtpClockCaps);

pub fn clock_id_from_fd(fd: libc::c_int) -> clockid_t {
    ((!(fd as clockid_t)) << 3) | CLOCKFD
}

/// timex.freq is ppm with a 16-bit fractional part.
pub fn ppb_to_timex_freq(ppb: i32) -> libc::c_long {
    (ppb as i64 * 65_536 / 1_000) as libc::c_long
}

/// PTP hardware clock exposed as /dev/ptpN.
pub struct PhcClock {
    // Keeps the clock id valid
    _file: File,
    path: PathBuf,
    clock_id: clockid_t,
    max_adj_ppb: i32,
    original_freq: libc::c_long,
}

impl PhcClock {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {} (are you root?)", path.display()))?;
        let clock_id = clock_id_from_fd(file.as_raw_fd());

        let mut caps = PtpClockCaps::default();
        unsafe { ptp_clock_getcaps(file.as_raw_fd(), &mut caps) }
            .with_context(|| format!("PTP_CLOCK_GETCAPS failed on {}", path.display()))?;

        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0; // Query mode
        let ret = unsafe { libc::clock_adjtime(clock_id, &mut tx) };
        if ret < 0 {
            return Err(anyhow!("clock_adjtime query failed on {}: {}",
                               path.display(), std::io::Error::last_os_error()));
        }

        info!("[PHC] {} opened: max_adj={}ppb, pps={}, current freq={}",
              path.display(), caps.max_adj, caps.pps, tx.freq);

        Ok(PhcClock {
            _file: file,
            path: path.to_path_buf(),
            clock_id,
            max_adj_ppb: caps.max_adj,
            original_freq: tx.freq,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalClock for PhcClock {
    fn read(&mut self) -> Result<Timestamp> {
        let mut ts: timespec = unsafe { mem::zeroed() };
        let ret = unsafe { libc::clock_gettime(self.clock_id, &mut ts) };
        if ret < 0 {
            return Err(anyhow!("clock_gettime failed: {}", std::io::Error::last_os_error()));
        }
        Ok(Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as u32))
    }

    fn step(&mut self, to: Timestamp) -> Result<()> {
        let mut ts: timespec = unsafe { mem::zeroed() };
        ts.tv_sec = to.seconds as libc::time_t;
        ts.tv_nsec = to.nanoseconds as libc::c_long;

        let ret = unsafe { libc::clock_settime(self.clock_id, &ts) };
        if ret < 0 {
            return Err(anyhow!("clock_settime failed: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        let ppb = ppb.clamp(-self.max_adj_ppb, self.max_adj_ppb);

        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = ppb_to_timex_freq(ppb);

        let ret = unsafe { libc::clock_adjtime(self.clock_id, &mut tx) };
        if ret < 0 {
            return Err(anyhow!("clock_adjtime failed to set frequency: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn max_frequency_ppb(&self) -> i32 {
        self.max_adj_ppb
    }
}

impl Drop for PhcClock {
    fn drop(&mut self) {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = self.original_freq;
        if unsafe { libc::clock_adjtime(self.clock_id, &mut tx) } < 0 {
            warn!("[PHC] Failed to restore frequency on {}", self.path.display());
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
