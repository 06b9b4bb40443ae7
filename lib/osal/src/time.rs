// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wraparound-aware absolute deadlines.
//!
//! The scheduler's native timeout width is 32 bits of ticks. Everything in
//! this workspace tracks deadlines in 64 bits and converts at the last
//! moment with [`AbsoluteTimeout::get_timeout`], which never hands the
//! scheduler a "forever" unless the deadline really is [`crate::NEVER`] --
//! an over-wide remainder comes back as `NATIVE_FOREVER - 1` so the caller
//! re-enters its wait and re-derives the remainder.

use crate::{now, Ticks, NEVER};

/// The scheduler's own "block forever" value.
pub const NATIVE_FOREVER: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeError {
    /// `now + rel` does not fit in 64 bits. Nobody waits past the end of
    /// time; this is always a caller bug.
    PastEndOfTime,
}

/// A 64-bit tick deadline, or [`NEVER`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AbsoluteTimeout {
    deadline: Ticks,
}

impl AbsoluteTimeout {
    /// Builds a deadline `rel` ticks from now. `rel == NEVER` is the
    /// forever sentinel and is preserved as such.
    pub fn new_rel(rel: Ticks) -> Result<Self, TimeError> {
        if rel == NEVER {
            return Ok(Self::never());
        }
        match now().checked_add(rel) {
            Some(deadline) => Ok(Self { deadline }),
            None => Err(TimeError::PastEndOfTime),
        }
    }

    /// Builds a deadline at an absolute tick value.
    pub fn at(deadline: Ticks) -> Self {
        Self { deadline }
    }

    pub fn never() -> Self {
        Self { deadline: NEVER }
    }

    pub fn deadline(&self) -> Ticks {
        self.deadline
    }

    pub fn is_never(&self) -> bool {
        self.deadline == NEVER
    }

    pub fn is_expired(&self) -> bool {
        !self.is_never() && self.deadline <= now()
    }

    /// Remaining time, clamped into the scheduler's native width.
    ///
    /// Returns 0 once expired. If the true remainder exceeds what fits,
    /// returns `NATIVE_FOREVER - 1` so a waiting caller wakes up and blocks
    /// again rather than sleeping forever on a finite deadline.
    pub fn get_timeout(&self) -> u32 {
        if self.deadline == NEVER {
            return NATIVE_FOREVER;
        }
        let now64 = now();
        if self.deadline <= now64 {
            0
        } else if self.deadline - now64 >= u64::from(NATIVE_FOREVER) {
            NATIVE_FOREVER - 1
        } else {
            (self.deadline - now64) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_is_never() {
        let t = AbsoluteTimeout::never();
        assert!(t.is_never());
        assert!(!t.is_expired());
        assert_eq!(t.get_timeout(), NATIVE_FOREVER);
    }

    #[test]
    fn relative_deadline_counts_down() {
        let t = AbsoluteTimeout::new_rel(50_000).unwrap();
        let remaining = t.get_timeout();
        assert!(remaining > 0 && remaining <= 50_000);
    }

    #[test]
    fn expired_deadline_reads_zero() {
        let t = AbsoluteTimeout::at(now().saturating_sub(1));
        assert_eq!(t.get_timeout(), 0);
        assert!(t.is_expired());
    }

    #[test]
    fn overwide_remainder_is_not_forever() {
        let t = AbsoluteTimeout::at(now() + u64::from(NATIVE_FOREVER) + 17);
        assert_eq!(t.get_timeout(), NATIVE_FOREVER - 1);
    }

    #[test]
    fn overflow_is_refused() {
        // Make sure at least one tick has elapsed so now() + (NEVER - 1)
        // genuinely overflows.
        crate::sleep(2);
        assert_eq!(
            AbsoluteTimeout::new_rel(NEVER - 1),
            Err(TimeError::PastEndOfTime)
        );
    }

    #[test]
    fn deadlines_order_by_tick_value() {
        let early = AbsoluteTimeout::at(100);
        let late = AbsoluteTimeout::at(200);
        assert!(early < late);
        assert!(late < AbsoluteTimeout::never());
    }
}
