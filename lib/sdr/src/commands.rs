// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage (netFn 0Ah) command handlers over the SDR repository.
//!
//! The repository sits behind one mutex; handlers lock per command. Partial
//! Add keeps its accumulation buffer here, keyed to the reservation it was
//! started under — a new reservation abandons a half-assembled record, which
//! is exactly what a shelf manager expects after it re-reserves.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ipmi::{cmd::storage, netfn, CommandRouter, CompletionCode, Msg, MsgSender};

use crate::{Record, Reservation, SdrError, SdrRepository, SDR_VERSION};

/// Get SDR responses carry the 2-byte next-record id before record data.
const GET_SDR_WINDOW: usize = ipmi::MAX_DATA_LEN - 3;

/// "No more records" marker for record-id fields.
const LAST_RECORD_ID: u16 = 0xFFFF;

/// Operation support byte in Get SDR Repository Info: reserve, partial
/// add, and delete are implemented; allocation info is not.
const OPERATION_SUPPORT: u8 = 0x0E;

struct PartialAdd {
    reservation: Reservation,
    bytes: Vec<u8>,
}

pub struct SdrService {
    repo: osal::Mutex<SdrRepository>,
    partial: osal::Mutex<Option<PartialAdd>>,
}

impl SdrService {
    pub fn new(repo: SdrRepository) -> Arc<Self> {
        Arc::new(Self {
            repo: osal::Mutex::new(repo),
            partial: osal::Mutex::new(None),
        })
    }

    /// Direct repository access for the sensor subsystems.
    pub fn repo(&self) -> &osal::Mutex<SdrRepository> {
        &self.repo
    }

    pub fn register_handlers(self: &Arc<Self>, router: &mut CommandRouter) {
        let commands: [(u8, fn(&SdrService, &Msg) -> Msg); 7] = [
            (storage::GET_SDR_REPOSITORY_INFO, Self::repository_info),
            (storage::RESERVE_SDR_REPOSITORY, Self::reserve),
            (storage::GET_SDR, Self::get_sdr),
            (storage::ADD_SDR, Self::add_sdr),
            (storage::PARTIAL_ADD_SDR, Self::partial_add_sdr),
            (storage::DELETE_SDR, Self::delete_sdr),
            (storage::CLEAR_SDR_REPOSITORY, Self::clear_repository),
        ];
        for (cmd, handler) in commands {
            let service = self.clone();
            router.register(
                netfn::STORAGE,
                cmd,
                Box::new(move |tx: &dyn MsgSender, req: &Msg| {
                    tx.send(handler(&service, req), None);
                }),
            );
        }
    }

    fn repository_info(&self, req: &Msg) -> Msg {
        let mut repo = self.repo.lock();
        let ts = repo.last_update_timestamp() as u32;
        let count = (repo.len() as u16).to_le_bytes();
        let ts = ts.to_le_bytes();
        let mut payload = Vec::with_capacity(14);
        payload.push(SDR_VERSION);
        payload.extend_from_slice(&count);
        payload.extend_from_slice(&[0xFF, 0xFF]); // free space unspecified
        payload.extend_from_slice(&ts); // most recent addition
        payload.extend_from_slice(&ts); // most recent erase
        payload.push(OPERATION_SUPPORT);
        req.reply_with(CompletionCode::Success, &payload)
    }

    fn reserve(&self, req: &Msg) -> Msg {
        let reservation = self.repo.lock().reserve();
        req.reply_with(CompletionCode::Success, &reservation.to_le_bytes())
    }

    fn get_sdr(&self, req: &Msg) -> Msg {
        let d = &req.data;
        if d.len() != 6 {
            return req
                .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
        }
        let reservation = u16::from_le_bytes([d[0], d[1]]);
        let record_id = u16::from_le_bytes([d[2], d[3]]);
        let offset = usize::from(d[4]);
        let requested = d[5];

        let repo = self.repo.lock();
        // The reservation only gates windowed reads.
        if offset != 0 && reservation != repo.current_reservation() {
            return req
                .reply_with(CompletionCode::ReservationCancelled, &[]);
        }
        let record_id = if record_id == LAST_RECORD_ID {
            match repo.len() {
                0 => 0,
                n => (n - 1) as u16,
            }
        } else {
            record_id
        };
        let record = match repo.get(record_id) {
            Some(r) => r,
            None => {
                return req.reply_with(
                    CompletionCode::RequestedDataNotPresent,
                    &[],
                )
            }
        };
        let bytes = record.bytes();
        if offset > bytes.len() {
            return req
                .reply_with(CompletionCode::ParameterOutOfRange, &[]);
        }
        let window = match requested {
            0xFF => bytes.len() - offset,
            n => usize::from(n),
        };
        if window > GET_SDR_WINDOW {
            return req
                .reply_with(CompletionCode::CannotReturnRequestedBytes, &[]);
        }
        let end = (offset + window).min(bytes.len());

        let next = if usize::from(record_id) + 1 < repo.len() {
            record_id + 1
        } else {
            LAST_RECORD_ID
        };
        let mut payload = Vec::with_capacity(2 + end - offset);
        payload.extend_from_slice(&next.to_le_bytes());
        payload.extend_from_slice(&bytes[offset..end]);
        req.reply_with(CompletionCode::Success, &payload)
    }

    fn add_sdr(&self, req: &Msg) -> Msg {
        match Record::interpret(&req.data) {
            Ok(record) => match self.repo.lock().add(record, 0) {
                Ok(id) => req.reply_with(
                    CompletionCode::Success,
                    &id.to_le_bytes(),
                ),
                Err(e) => req.reply_with(completion_for(e), &[]),
            },
            Err(_) => req.reply_with(CompletionCode::InvalidDataField, &[]),
        }
    }

    fn partial_add_sdr(&self, req: &Msg) -> Msg {
        let d = &req.data;
        if d.len() < 7 {
            return req
                .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
        }
        let reservation = u16::from_le_bytes([d[0], d[1]]);
        let record_id = u16::from_le_bytes([d[2], d[3]]);
        let offset = usize::from(d[4]);
        let last = d[5] & 0x01 != 0;
        let data = &d[6..];

        if reservation != self.repo.lock().current_reservation() {
            *self.partial.lock() = None;
            return req
                .reply_with(CompletionCode::ReservationCancelled, &[]);
        }

        let mut partial = self.partial.lock();
        // A fresh sequence starts at record id 0, offset 0; a new
        // reservation implicitly abandons any stale buffer.
        let continuing = matches!(
            partial.as_ref(),
            Some(p) if p.reservation == reservation
        );
        if !continuing {
            if record_id != 0 || offset != 0 {
                return req
                    .reply_with(CompletionCode::ParameterOutOfRange, &[]);
            }
            *partial = Some(PartialAdd {
                reservation,
                bytes: Vec::new(),
            });
        }
        let accumulated = partial.as_ref().map_or(0, |p| p.bytes.len());
        if offset != accumulated {
            *partial = None;
            return req
                .reply_with(CompletionCode::ParameterOutOfRange, &[]);
        }
        if let Some(p) = partial.as_mut() {
            p.bytes.extend_from_slice(data);
        }

        if !last {
            return req.reply_with(CompletionCode::Success, &[0, 0]);
        }
        let Some(assembled) = partial.take() else {
            return req.reply_with(CompletionCode::ParameterOutOfRange, &[]);
        };
        let assembled = assembled.bytes;
        match Record::interpret(&assembled) {
            Ok(record) => match self.repo.lock().add(record, reservation) {
                Ok(id) => req.reply_with(
                    CompletionCode::Success,
                    &id.to_le_bytes(),
                ),
                Err(e) => req.reply_with(completion_for(e), &[]),
            },
            Err(_) => req.reply_with(CompletionCode::InvalidDataField, &[]),
        }
    }

    fn delete_sdr(&self, req: &Msg) -> Msg {
        let d = &req.data;
        if d.len() != 4 {
            return req
                .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
        }
        let reservation = u16::from_le_bytes([d[0], d[1]]);
        let record_id = u16::from_le_bytes([d[2], d[3]]);
        match self.repo.lock().remove(record_id, reservation) {
            Ok(()) => req.reply_with(
                CompletionCode::Success,
                &record_id.to_le_bytes(),
            ),
            Err(e) => req.reply_with(completion_for(e), &[]),
        }
    }

    fn clear_repository(&self, req: &Msg) -> Msg {
        let d = &req.data;
        if d.len() != 6 {
            return req
                .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
        }
        let reservation = u16::from_le_bytes([d[0], d[1]]);
        if &d[2..5] != b"CLR" {
            return req.reply_with(CompletionCode::InvalidDataField, &[]);
        }
        match d[5] {
            0xAA => match self.repo.lock().clear(reservation) {
                Ok(()) => {
                    req.reply_with(CompletionCode::Success, &[0x01])
                }
                Err(e) => req.reply_with(completion_for(e), &[]),
            },
            // Erasure status poll: erasure is synchronous, always done.
            0x00 => req.reply_with(CompletionCode::Success, &[0x01]),
            _ => req.reply_with(CompletionCode::InvalidDataField, &[]),
        }
    }
}

fn completion_for(e: SdrError) -> CompletionCode {
    match e {
        SdrError::ReservationCancelled => {
            CompletionCode::ReservationCancelled
        }
        SdrError::NotFound => CompletionCode::RequestedDataNotPresent,
        SdrError::TooShort
        | SdrError::LengthMismatch
        | SdrError::UnsupportedType(_)
        | SdrError::FieldRange
        | SdrError::ImportFormat => CompletionCode::InvalidDataField,
    }
}
