// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Wall-clock date in the local timezone, with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    sec: i32,
    min: i32,
    hour: i32,
    mday: i32,
    /// Months since January.
    mon: i32,
    /// Years since 1900.
    year: i32,
    nsec: i64,
}

impl LocalTime {
    /// The current local time.
    pub fn now() -> LocalTime {
        let mut timespec = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `tm` is plain old data; all-zero is a valid value, including a null `tm_zone`.
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };

        // SAFETY: Both pointers reference live, writable locals of the expected types.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut timespec);
            libc::localtime_r(&timespec.tv_sec, &mut tm);
        }

        LocalTime {
            sec: tm.tm_sec,
            min: tm.tm_min,
            hour: tm.tm_hour,
            mday: tm.tm_mday,
            mon: tm.tm_mon,
            year: tm.tm_year,
            nsec: timespec.tv_nsec,
        }
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
            self.year + 1900,
            self.mon + 1,
            self.mday,
            self.hour,
            self.min,
            self.sec,
            self.nsec
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_time_display() {
        let time = LocalTime {
            sec: 7,
            min: 41,
            hour: 9,
            mday: 19,
            mon: 9,
            year: 126,
            nsec: 5_000,
        };
        assert_eq!(time.to_string(), "2026-10-19T09:41:07.000005000");

        let now = LocalTime::now();
        assert!((0..=11).contains(&now.mon));
        assert!(now.year >= 125);
        // YYYY-MM-DDTHH:MM:SS.nnnnnnnnn
        assert_eq!(now.to_string().len(), 29);
    }
}
