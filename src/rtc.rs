#![cfg(target_os = "linux")]

//! Battery-backed RTC used as the holdover reference.
//!
//! Time goes through the kernel RTC interface. The DS3231 aging offset is
//! not exposed there, so trim is read and written over I2C directly.
//! The RTC keeps UTC; the control loop works in TAI.

use crate::timestamp::Timestamp;
use crate::traits::SecondaryClock;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use log::{info, warn};
use nix::{ioctl_read, ioctl_write_int_bad, ioctl_write_ptr};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

// Linux RTC Time Struct
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RtcTime {
    pub tm_sec: i32,
    pub tm_min: i32,
    pub tm_hour: i32,
    pub tm_mday: i32,
    pub tm_mon: i32,
    pub tm_year: i32,
    pub tm_wday: i32,
    pub tm_yday: i32,
    pub tm_isdst: i32,
}

// Magic 'p' (0x70)
const RTC_MAGIC: u8 = b'p';
const RTC_RD_TIME_CMD: u8 = 0x09;
const RTC_SET_TIME_CMD: u8 = 0x0a;

ioctl_read!(rtc_rd_time, RTC_MAGIC, RTC_RD_TIME_CMD, RtcTime);
ioctl_write_ptr!(rtc_set_time, RTC_MAGIC, RTC_SET_TIME_CMD, RtcTime);

// linux/i2c-dev.h I2C_SLAVE
ioctl_write_int_bad!(i2c_set_slave, 0x0703);

pub const DS3231_ADDRESS: u8 = 0x68;
const DS3231_AGING_REG: u8 = 0x10;
const DS3231_CONTROL_REG: u8 = 0x0E;
const DS3231_CONV: u8 = 0x20;

pub fn rtc_time_from_utc(dt: &DateTime<Utc>) -> RtcTime {
    RtcTime {
        tm_sec: dt.second() as i32,
        tm_min: dt.minute() as i32,
        tm_hour: dt.hour() as i32,
        tm_mday: dt.day() as i32,
        tm_mon: dt.month0() as i32, // rtc_time tm_mon is 0-11
        tm_year: dt.year() - 1900, // rtc_time tm_year is years since 1900
        tm_wday: dt.weekday().num_days_from_sunday() as i32,
        tm_yday: dt.ordinal0() as i32,
        tm_isdst: 0,
    }
}

pub fn utc_from_rtc_time(tm: &RtcTime) -> Result<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(tm.tm_year + 1900, (tm.tm_mon + 1) as u32, tm.tm_mday as u32)
        .and_then(|d| d.and_hms_opt(tm.tm_hour as u32, tm.tm_min as u32, tm.tm_sec as u32))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("RTC returned an invalid date: {:?}", tm))
}

pub struct LinuxRtc {
    rtc: File,
    i2c: Option<File>,
    utc_to_tai_offset_s: i64,
}

impl LinuxRtc {
    /// `i2c_bus`: e.g. /dev/i2c-1 with a DS3231 at 0x68. Without it, trim reads as 0
    /// and writes fail.
    pub fn open(rtc_path: &Path, i2c_bus: Option<&Path>, utc_to_tai_offset_s: i64) -> Result<Self> {
        let rtc = OpenOptions::new()
            .read(true)
            .write(true)
            .open(rtc_path)
            .with_context(|| format!("Failed to open {}", rtc_path.display()))?;

        let i2c = match i2c_bus {
            Some(bus) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(bus)
                    .with_context(|| format!("Failed to open {}", bus.display()))?;
                unsafe { i2c_set_slave(file.as_raw_fd(), DS3231_ADDRESS as libc::c_int) }
                    .with_context(|| format!("I2C_SLAVE 0x{:02X} failed on {}", DS3231_ADDRESS, bus.display()))?;
                Some(file)
            }
            None => None,
        };

        info!("[RTC] {} opened, aging trim {}", rtc_path.display(),
              if i2c.is_some() { "available" } else { "unavailable" });
        Ok(LinuxRtc { rtc, i2c, utc_to_tai_offset_s })
    }

    fn read_register(&mut self, reg: u8) -> Result<u8> {
        let bus = self.i2c.as_mut().ok_or_else(|| anyhow!("No I2C bus configured"))?;
        bus.write_all(&[reg]).context("I2C register select failed")?;
        let mut value = [0u8; 1];
        bus.read_exact(&mut value).context("I2C read failed")?;
        Ok(value[0])
    }

    fn write_register(&mut self, reg: u8, value: u8) -> Result<()> {
        let bus = self.i2c.as_mut().ok_or_else(|| anyhow!("No I2C bus configured"))?;
        bus.write_all(&[reg, value]).context("I2C write failed")?;
        Ok(())
    }
}

impl SecondaryClock for LinuxRtc {
    fn read(&mut self) -> Result<Timestamp> {
        let mut tm = RtcTime::default();
        unsafe { rtc_rd_time(self.rtc.as_raw_fd(), &mut tm) }.context("RTC_RD_TIME failed")?;
        let utc = utc_from_rtc_time(&tm)?;
        Ok(Timestamp::new(utc.timestamp() + self.utc_to_tai_offset_s, 0))
    }

    fn sync_to(&mut self, time: Timestamp) -> Result<()> {
        let utc_seconds = time.seconds - self.utc_to_tai_offset_s;
        let dt = DateTime::<Utc>::from_timestamp(utc_seconds, 0)
            .ok_or_else(|| anyhow!("Time {} out of RTC range", time))?;
        let tm = rtc_time_from_utc(&dt);
        unsafe { rtc_set_time(self.rtc.as_raw_fd(), &tm) }.context("RTC_SET_TIME failed")?;
        Ok(())
    }

    fn read_trim(&mut self) -> Result<i8> {
        if self.i2c.is_none() {
            return Ok(0);
        }
        Ok(self.read_register(DS3231_AGING_REG)? as i8)
    }

    fn write_trim(&mut self, value: i8) -> Result<()> {
        self.write_register(DS3231_AGING_REG, value as u8)?;

        // Aging takes effect at the next temperature conversion; force one now
        match self.read_register(DS3231_CONTROL_REG) {
            Ok(control) => self.write_register(DS3231_CONTROL_REG, control | DS3231_CONV)?,
            Err(e) => warn!("[RTC] Trim written but conversion not forced: {:#}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtc_time_fields_follow_kernel_conventions() {
        let dt = DateTime::<Utc>::from_timestamp(1_760_000_000, 0).unwrap();
        // 2025-10-09 08:53:20 UTC, a Thursday
        let tm = rtc_time_from_utc(&dt);
        assert_eq!(tm.tm_year, 125);
        assert_eq!(tm.tm_mon, 9);
        assert_eq!(tm.tm_mday, 9);
        assert_eq!((tm.tm_hour, tm.tm_min, tm.tm_sec), (8, 53, 20));
        assert_eq!(tm.tm_wday, 4);
    }

    #[test]
    fn test_rtc_time_converts_back() {
        let dt = DateTime::<Utc>::from_timestamp(1_709_251_199, 0).unwrap(); // end of a leap day
        let back = utc_from_rtc_time(&rtc_time_from_utc(&dt)).unwrap();
        assert_eq!(back, dt);
    }

    #[test]
    fn test_invalid_rtc_time_is_an_error() {
        let tm = RtcTime { tm_mday: 0, tm_year: 125, ..RtcTime::default() };
        assert!(utc_from_rtc_time(&tm).is_err());
    }
}
