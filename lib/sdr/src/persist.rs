// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Repository persistence over the platform's tagged storage sections.
//!
//! The storage service itself (EEPROM layout, wear handling) lives outside
//! this workspace; its contract is byte-aligned variable-length sections
//! identified by 16-bit type tags, with a flush barrier. We persist the
//! repository's checksummed export under one tag and treat any read
//! problem — missing section, bad checksum, torn write — as "no snapshot":
//! the repository simply starts empty and the platform re-adds its
//! built-in records.

use alloc::vec::Vec;

use crate::{Reservation, SdrError, SdrRepository};

/// Section tag holding the SDR repository snapshot.
pub const SDR_SNAPSHOT_TAG: u16 = 0x0101;

/// The persistent storage service, as consumed here.
pub trait PersistentStore {
    /// Reads a whole section; `None` if absent or unreadable.
    fn read_section(&mut self, tag: u16) -> Option<Vec<u8>>;
    /// Rewrites a whole section. False if storage refused it.
    fn write_section(&mut self, tag: u16, data: &[u8]) -> bool;
    /// Blocks until previously written data is durable.
    fn flush(&mut self);
}

/// Merges the persisted snapshot, if there is a usable one, into `repo`.
/// Returns whether a snapshot was applied; every failure path leaves the
/// repository exactly as it was.
pub fn load_repository(
    store: &mut dyn PersistentStore,
    repo: &mut SdrRepository,
    reservation: Reservation,
) -> Result<bool, SdrError> {
    let Some(snapshot) = store.read_section(SDR_SNAPSHOT_TAG) else {
        return Ok(false);
    };
    match repo.u8import(&snapshot, reservation) {
        Ok(()) => Ok(true),
        // A damaged snapshot is a fall-through to defaults, not an error
        // the boot path needs to handle.
        Err(SdrError::ImportFormat) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Writes the current repository image and waits for it to stick.
pub fn save_repository(
    store: &mut dyn PersistentStore,
    repo: &SdrRepository,
) -> bool {
    let image = repo.u8export();
    if !store.write_section(SDR_SNAPSHOT_TAG, &image) {
        return false;
    }
    store.flush();
    true
}
