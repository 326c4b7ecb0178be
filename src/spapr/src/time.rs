// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Calendar time as the RTAS clock calls exchange it.

use std::fmt;

/// Host `CLOCK_REALTIME` as seconds and nanoseconds since the epoch.
pub fn host_realtime() -> (i64, i64) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer for the duration of the call.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    (i64::from(ts.tv_sec), i64::from(ts.tv_nsec))
}

fn zeroed_tm() -> libc::tm {
    // SAFETY: `libc::tm` is plain data; all-zero is a valid value (null `tm_zone`).
    unsafe { std::mem::zeroed() }
}

/// A UTC date and time. Months and days count from 1, years are full years.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub year: u32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub nsec: u32,
}

impl RtcTime {
    /// Breaks `secs` since the epoch down in UTC. `None` before year 0 or past `time_t`.
    pub fn from_epoch(secs: i64, nsec: u32) -> Option<Self> {
        let secs = libc::time_t::try_from(secs).ok()?;
        let mut tm = zeroed_tm();
        // SAFETY: both pointers are valid and the result is checked.
        if unsafe { libc::gmtime_r(&secs, &mut tm) }.is_null() {
            return None;
        }
        Some(RtcTime {
            year: u32::try_from(tm.tm_year.checked_add(1900)?).ok()?,
            month: u32::try_from(tm.tm_mon + 1).ok()?,
            day: u32::try_from(tm.tm_mday).ok()?,
            hour: u32::try_from(tm.tm_hour).ok()?,
            minute: u32::try_from(tm.tm_min).ok()?,
            second: u32::try_from(tm.tm_sec).ok()?,
            nsec,
        })
    }

    /// The current host time.
    pub fn now() -> Option<Self> {
        let (secs, nsec) = host_realtime();
        Self::from_epoch(secs, u32::try_from(nsec).ok()?)
    }

    /// Seconds since the epoch. Out of range fields carry over the way `timegm` does, so
    /// day 32 of January is the 1st of February.
    pub fn to_epoch(&self) -> Option<i64> {
        let field = |value: u32| i32::try_from(value).ok();
        let mut tm = zeroed_tm();
        tm.tm_year = field(self.year)?.checked_sub(1900)?;
        tm.tm_mon = field(self.month)?.checked_sub(1)?;
        tm.tm_mday = field(self.day)?;
        tm.tm_hour = field(self.hour)?;
        tm.tm_min = field(self.minute)?;
        tm.tm_sec = field(self.second)?;
        // SAFETY: `tm` is initialised and exclusively borrowed.
        let secs = unsafe { libc::timegm(&mut tm) };
        (secs != -1).then_some(i64::from(secs))
    }
}

impl fmt::Display for RtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
            self.year, self.month, self.day, self.hour, self.minute, self.second, self.nsec
        )
    }
}
