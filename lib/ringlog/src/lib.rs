// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded diagnostic trace rings.
//!
//! Each task defines a small `Trace` enum of the events worth remembering
//! and records them into a `TraceBuf<Trace, N>` it owns. The buffer keeps
//! the last `N` distinct entries; recording the same entry repeatedly bumps
//! a repeat count instead of burning a slot, so a quiet loop that polls the
//! same state for an hour still leaves room for the interesting part of its
//! history.
//!
//! Entries are read back oldest-first with a debugger or, on the host, by
//! tests asserting on an engine's recent behavior.

#![cfg_attr(target_os = "none", no_std)]

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Entry<T> {
    payload: T,
    count: u32,
}

pub struct TraceBuf<T, const N: usize> {
    entries: [Option<Entry<T>>; N],
    /// Index of the slot the next distinct entry goes into.
    next: usize,
    /// Total entries recorded, including coalesced repeats.
    recorded: u64,
}

impl<T, const N: usize> Default for TraceBuf<T, N>
where
    T: Copy + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> TraceBuf<T, N>
where
    T: Copy + PartialEq,
{
    const EMPTY: Option<Entry<T>> = None;

    pub const fn new() -> Self {
        assert!(N > 0);
        Self {
            entries: [Self::EMPTY; N],
            next: 0,
            recorded: 0,
        }
    }

    /// Records one entry, coalescing consecutive duplicates.
    pub fn entry(&mut self, payload: T) {
        self.recorded += 1;
        let last = self.next.checked_sub(1).unwrap_or(N - 1);
        if let Some(prev) = &mut self.entries[last] {
            if prev.payload == payload {
                prev.count = prev.count.saturating_add(1);
                return;
            }
        }
        self.entries[self.next] = Some(Entry { payload, count: 1 });
        self.next = if self.next + 1 == N { 0 } else { self.next + 1 };
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&T> {
        let last = self.next.checked_sub(1).unwrap_or(N - 1);
        self.entries[last].as_ref().map(|e| &e.payload)
    }

    /// Total number recorded since creation, repeats included.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Iterates retained entries oldest-first as `(payload, repeat_count)`.
    pub fn iter(&self) -> impl Iterator<Item = (&T, u32)> {
        let (wrapped, fresh) = self.entries.split_at(self.next);
        fresh
            .iter()
            .chain(wrapped.iter())
            .filter_map(|slot| slot.as_ref().map(|e| (&e.payload, e.count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Trace {
        Tick,
        Fault(u8),
    }

    #[test]
    fn empty_buffer_has_no_last() {
        let buf: TraceBuf<Trace, 4> = TraceBuf::new();
        assert_eq!(buf.last(), None);
        assert_eq!(buf.iter().count(), 0);
    }

    #[test]
    fn consecutive_duplicates_coalesce() {
        let mut buf: TraceBuf<Trace, 4> = TraceBuf::new();
        for _ in 0..1000 {
            buf.entry(Trace::Tick);
        }
        buf.entry(Trace::Fault(3));
        assert_eq!(buf.recorded(), 1001);
        let collected: Vec<_> =
            buf.iter().map(|(t, n)| (*t, n)).collect();
        assert_eq!(
            collected,
            vec![(Trace::Tick, 1000), (Trace::Fault(3), 1)]
        );
    }

    #[test]
    fn distinct_entries_wrap_and_evict_oldest() {
        let mut buf: TraceBuf<Trace, 3> = TraceBuf::new();
        for i in 0..5 {
            buf.entry(Trace::Fault(i));
        }
        let collected: Vec<_> = buf.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            collected,
            vec![Trace::Fault(2), Trace::Fault(3), Trace::Fault(4)]
        );
        assert_eq!(buf.last(), Some(&Trace::Fault(4)));
    }

    #[test]
    fn interleaved_duplicates_do_not_coalesce() {
        let mut buf: TraceBuf<Trace, 4> = TraceBuf::new();
        buf.entry(Trace::Tick);
        buf.entry(Trace::Fault(1));
        buf.entry(Trace::Tick);
        assert_eq!(buf.iter().count(), 3);
    }
}
