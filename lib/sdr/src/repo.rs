// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ordered, reservation-protected record store.
//!
//! Invariants:
//! - the record at position `i` has `record_id == i`, always;
//! - `add` replaces an existing record with the same type+key in place;
//! - every mutator takes a reservation; 0 means "take a one-shot
//!   reservation for this call", anything else must match the current one;
//! - the binary export is checksummed and the import of a damaged stream
//!   changes nothing.
//!
//! Timestamps are wall-clock seconds when the platform has wired a clock,
//! and boot-relative seconds otherwise. Boot-relative values (at or below
//! `BOOT_RELATIVE_CEILING`) are promoted on read once real time appears,
//! and are persisted as zero — a boot-relative number would be a lie one
//! reboot later.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::{Record, SdrError};

pub type Reservation = u16;

/// Timestamps at or below this are "seconds since boot", not wall time.
pub const BOOT_RELATIVE_CEILING: u64 = 0x2000_0000;

pub struct SdrRepository {
    records: Vec<Record>,
    reservation: Reservation,
    last_update_ts: u64,
    clock: Box<dyn Fn() -> u64 + Send>,
}

impl Default for SdrRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SdrRepository {
    /// A repository timestamping with seconds since boot until the
    /// platform provides better.
    pub fn new() -> Self {
        Self::with_clock(Box::new(|| osal::now() / osal::TICK_HZ))
    }

    /// A repository with an explicit seconds clock.
    pub fn with_clock(clock: Box<dyn Fn() -> u64 + Send>) -> Self {
        Self {
            records: Vec::new(),
            reservation: 0,
            last_update_ts: 0,
            clock,
        }
    }

    /// Takes a new reservation, cancelling the previous one. Wraps, but
    /// never hands out zero.
    pub fn reserve(&mut self) -> Reservation {
        self.reservation = self.reservation.wrapping_add(1);
        if self.reservation == 0 {
            self.reservation = 1;
        }
        self.reservation
    }

    pub fn current_reservation(&self) -> Reservation {
        self.reservation
    }

    /// Resolves a caller-supplied reservation: zero takes a one-shot,
    /// anything else must match.
    fn check_reservation(
        &mut self,
        reservation: Reservation,
    ) -> Result<(), SdrError> {
        let reservation = if reservation == 0 {
            self.reserve()
        } else {
            reservation
        };
        if reservation != self.reservation {
            return Err(SdrError::ReservationCancelled);
        }
        Ok(())
    }

    /// Adds `record`, replacing any record with the same type+key.
    /// Returns the assigned record id. The update timestamp moves only
    /// when content actually changed.
    pub fn add(
        &mut self,
        mut record: Record,
        reservation: Reservation,
    ) -> Result<u16, SdrError> {
        self.check_reservation(reservation)?;
        for (i, existing) in self.records.iter_mut().enumerate() {
            if existing.same_identity(&record) {
                record.set_record_id(i as u16);
                if !existing.identical_content(&record) {
                    self.last_update_ts = (self.clock)();
                }
                *existing = record;
                return Ok(i as u16);
            }
        }
        let id = self.records.len() as u16;
        record.set_record_id(id);
        self.records.push(record);
        self.last_update_ts = (self.clock)();
        Ok(id)
    }

    /// Removes the record at `id` and renumbers the rest.
    pub fn remove(
        &mut self,
        id: u16,
        reservation: Reservation,
    ) -> Result<(), SdrError> {
        self.check_reservation(reservation)?;
        if usize::from(id) >= self.records.len() {
            return Err(SdrError::NotFound);
        }
        self.records.remove(usize::from(id));
        self.renumber();
        self.last_update_ts = (self.clock)();
        Ok(())
    }

    pub fn clear(&mut self, reservation: Reservation) -> Result<(), SdrError> {
        self.check_reservation(reservation)?;
        self.records.clear();
        self.last_update_ts = (self.clock)();
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<&Record> {
        self.records.get(usize::from(id))
    }

    /// Linear scan by key bytes.
    pub fn find(&self, key: &[u8]) -> Option<&Record> {
        self.records.iter().find(|r| r.record_key() == key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Last-update timestamp, promoting a boot-relative value to wall time
    /// if the clock has since learned it.
    pub fn last_update_timestamp(&mut self) -> u64 {
        if self.last_update_ts <= BOOT_RELATIVE_CEILING {
            let now = (self.clock)();
            if now > BOOT_RELATIVE_CEILING {
                self.last_update_ts = now;
            }
        }
        self.last_update_ts
    }

    fn renumber(&mut self) {
        for (i, record) in self.records.iter_mut().enumerate() {
            record.set_record_id(i as u16);
        }
    }

    /// Binary export: `[checksum][timestamp; 8 LE][{len, bytes}...]`.
    /// The checksum byte makes the whole stream sum to zero.
    pub fn u8export(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0); // checksum, patched below

        let ts = if self.last_update_ts <= BOOT_RELATIVE_CEILING {
            0
        } else {
            self.last_update_ts
        };
        out.extend_from_slice(&ts.to_le_bytes());

        for record in &self.records {
            let bytes = record.bytes();
            if bytes.is_empty() || bytes.len() > 255 {
                continue; // not representable in the length prefix
            }
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }

        out[0] = ipmi::checksum(&out[1..]);
        out
    }

    /// Imports an export stream, merging into this repository. Entirely a
    /// no-op on checksum failure or framing damage; individually invalid
    /// records are skipped.
    pub fn u8import(
        &mut self,
        data: &[u8],
        reservation: Reservation,
    ) -> Result<(), SdrError> {
        self.check_reservation(reservation)?;
        if data.len() < 9 {
            return Err(SdrError::ImportFormat);
        }
        {
            let mut sum = 0u8;
            for &b in data {
                sum = sum.wrapping_add(b);
            }
            if sum != 0 {
                return Err(SdrError::ImportFormat);
            }
        }

        let imported_ts = u64::from_le_bytes(
            data[1..9].try_into().map_err(|_| SdrError::ImportFormat)?,
        );

        // Stage everything in a scratch repository so a framing error
        // partway through cannot leave this one half-updated.
        let mut scratch = SdrRepository::with_clock(Box::new(|| 0));
        let mut cur = 9;
        while cur < data.len() {
            let record_len = usize::from(data[cur]);
            if record_len == 0 || cur + 1 + record_len > data.len() {
                return Err(SdrError::ImportFormat);
            }
            if let Ok(record) =
                Record::interpret(&data[cur + 1..cur + 1 + record_len])
            {
                scratch.add(record, 0)?;
            }
            cur += 1 + record_len;
        }

        for record in scratch.records {
            self.add(record, self.reservation)?;
        }
        if imported_ts > self.last_update_ts {
            self.last_update_ts = imported_ts;
        }
        Ok(())
    }
}
