// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sensor Data Records and their repository.
//!
//! An SDR is a variable-length byte record in the IPMI layout; this crate
//! keeps records in raw form and interprets them by type byte into typed
//! views ([`Record`]). Interpretation validates; a record that fails
//! validation never yields an accessor, which is how "accessor on a
//! non-validating record" is made unrepresentable here.
//!
//! [`SdrRepository`] is the ordered, reservation-protected store:
//! `record_id` always equals position, adds replace by type+key, exports
//! are checksummed, imports are all-or-nothing.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod commands;
mod full_sensor;
pub mod persist;
mod record;
mod repo;

pub use full_sensor::{FullSensorRecord, Linearization, Threshold};
pub use record::{
    CompactSensorRecord, EventOnlySensorRecord, FruDeviceLocatorRecord,
    McDeviceLocatorRecord, Record, RecordType, EVENT_TYPE_THRESHOLD,
};
pub use repo::{Reservation, SdrRepository};

/// SDR version this implementation speaks (IPMI v1.5/2.0 records).
pub const SDR_VERSION: u8 = 0x51;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdrError {
    /// Record shorter than its header or its type's minimum.
    TooShort,
    /// Header length byte disagrees with the byte count supplied.
    LengthMismatch,
    /// Record type byte names a type this firmware does not model.
    UnsupportedType(u8),
    /// A field setter was handed a value that does not fit its packed
    /// width.
    FieldRange,
    /// The supplied reservation is stale.
    ReservationCancelled,
    /// No record with the requested id.
    NotFound,
    /// Import stream failed its checksum or lost framing.
    ImportFormat,
}
