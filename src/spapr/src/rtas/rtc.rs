// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest real time clock.
//!
//! The guest clock is the host realtime clock shifted by an offset. Setting the time only moves
//! the offset, so the clock keeps running across the change.

use crate::machine::{PlatformEvent, SpaprMachine};
use crate::rtas::{RtasCall, RtasStatus};
use crate::time::{RtcTime, host_realtime};

/// Current guest time.
pub fn guest_time(rtc_offset: i64) -> Option<RtcTime> {
    let (secs, nsec) = host_realtime();
    RtcTime::from_epoch(secs.checked_add(rtc_offset)?, u32::try_from(nsec).ok()?)
}

// get-time-of-day
pub(crate) fn get_time_of_day(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(0, 8)?;
    let tm = guest_time(machine.rtc_offset()).ok_or(RtasStatus::HwError)?;
    let fields = [tm.year, tm.month, tm.day, tm.hour, tm.minute, tm.second, tm.nsec];
    for (idx, value) in (1..).zip(fields) {
        call.set_ret(idx, value);
    }
    Ok(())
}

// set-time-of-day
pub(crate) fn set_time_of_day(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(7, 1)?;
    let tm = RtcTime {
        year: call.arg(0),
        month: call.arg(1),
        day: call.arg(2),
        hour: call.arg(3),
        minute: call.arg(4),
        second: call.arg(5),
        nsec: call.arg(6),
    };
    let offset = tm
        .to_epoch()
        .and_then(|secs| secs.checked_sub(host_realtime().0))
        .ok_or(RtasStatus::ParamError)?;
    machine.set_rtc_offset(offset);
    log::debug!("rtc: guest clock set to {tm}");
    machine.push_event(PlatformEvent::RtcChange { offset });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtas::{RTAS_GET_TIME_OF_DAY, RTAS_SET_TIME_OF_DAY, RtasCall, dispatch};
    use crate::test_utils::default_machine;

    #[test]
    fn test_set_then_get() {
        let mut machine = default_machine();
        let mut call = RtasCall::new(
            RTAS_SET_TIME_OF_DAY,
            vec![2001, 2, 3, 4, 5, 6, 0],
            1,
        );
        dispatch(&mut machine, &mut call);
        assert_eq!(call.status(), 0);
        assert!(matches!(
            machine.take_events().as_slice(),
            [PlatformEvent::RtcChange { .. }]
        ));

        let mut call = RtasCall::new(RTAS_GET_TIME_OF_DAY, vec![], 8);
        dispatch(&mut machine, &mut call);
        let rets = call.rets();
        assert_eq!(rets[0], 0);
        assert_eq!(rets[1], 2001);
        assert_eq!(rets[2], 2);
        assert_eq!(rets[3], 3);
        assert_eq!(rets[4], 4);
        assert_eq!(rets[5], 5);
        // The clock keeps running after the set.
        assert!((6..=8).contains(&rets[6]));
    }

    #[test]
    fn test_get_tracks_host_clock() {
        let mut machine = default_machine();
        let mut call = RtasCall::new(RTAS_GET_TIME_OF_DAY, vec![], 8);
        dispatch(&mut machine, &mut call);
        let host = RtcTime::now().unwrap();
        assert_eq!(call.rets()[1], host.year);
    }

    #[test]
    fn test_bad_counts() {
        let mut machine = default_machine();
        let mut call = RtasCall::new(RTAS_GET_TIME_OF_DAY, vec![], 7);
        dispatch(&mut machine, &mut call);
        assert_eq!(call.status(), RtasStatus::ParamError as i32);
        let mut call = RtasCall::new(RTAS_SET_TIME_OF_DAY, vec![2001, 2, 3], 1);
        dispatch(&mut machine, &mut call);
        assert_eq!(call.status(), RtasStatus::ParamError as i32);
        // Year past what the host clock represents.
        let mut call = RtasCall::new(RTAS_SET_TIME_OF_DAY, vec![u32::MAX, 1, 1, 0, 0, 0, 0], 1);
        dispatch(&mut machine, &mut call);
        assert_eq!(call.status(), RtasStatus::ParamError as i32);
        assert_eq!(machine.rtc_offset(), 0);
    }
}
