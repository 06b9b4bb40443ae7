// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPMI message model, IPMB wire codec, and command dispatch.
//!
//! One [`Msg`] is one IPMB transaction: requester and responder addressing,
//! the network function (even = request, odd = response), a command byte,
//! and up to 32 bytes of data. The transport owns messages while they are
//! pending; handlers see them by shared reference and answer through a
//! [`MsgSender`].

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

mod device_id;
mod msg;
mod router;

pub use device_id::{
    register_app_handlers, DeviceCapabilities, DeviceIdent, IPMI_VERSION_2_0,
};
pub use msg::{checksum, Msg, ParseError, MAX_DATA_LEN, MAX_FRAME_LEN};
pub use router::{CommandRouter, Handler, MsgSender, ResponseHook};

use num_derive::FromPrimitive;

/// Network function codes (even request halves).
pub mod netfn {
    pub const CHASSIS: u8 = 0x00;
    pub const BRIDGE: u8 = 0x02;
    pub const SENSOR_EVENT: u8 = 0x04;
    pub const APP: u8 = 0x06;
    pub const FIRMWARE: u8 = 0x08;
    pub const STORAGE: u8 = 0x0A;
    pub const TRANSPORT: u8 = 0x0C;
    /// Group extension; PICMG commands live here.
    pub const GROUP_EXT: u8 = 0x2C;
}

/// Command numbers, grouped by network function.
pub mod cmd {
    pub mod app {
        pub const GET_DEVICE_ID: u8 = 0x01;
    }
    pub mod sensor_event {
        pub const PLATFORM_EVENT: u8 = 0x02;
        pub const REARM_SENSOR_EVENTS: u8 = 0x2A;
        pub const GET_SENSOR_READING: u8 = 0x2D;
    }
    pub mod storage {
        pub const GET_SDR_REPOSITORY_INFO: u8 = 0x20;
        pub const RESERVE_SDR_REPOSITORY: u8 = 0x22;
        pub const GET_SDR: u8 = 0x23;
        pub const ADD_SDR: u8 = 0x24;
        pub const PARTIAL_ADD_SDR: u8 = 0x25;
        pub const DELETE_SDR: u8 = 0x26;
        pub const CLEAR_SDR_REPOSITORY: u8 = 0x27;
    }
    pub mod picmg {
        pub const GET_PICMG_PROPERTIES: u8 = 0x00;
        pub const SET_FRU_ACTIVATION: u8 = 0x0C;
        pub const SET_PORT_STATE: u8 = 0x0E;
        pub const GET_PORT_STATE: u8 = 0x0F;
        pub const COMPUTE_POWER_PROPERTIES: u8 = 0x10;
        pub const SET_POWER_LEVEL: u8 = 0x11;
        pub const GET_POWER_LEVEL: u8 = 0x12;
    }
}

/// First data byte of every PICMG request and response.
pub const PICMG_IDENTIFIER: u8 = 0x00;

/// IPMI 2.0 completion codes, the subset this firmware produces or
/// interprets. The first response data byte is always one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum CompletionCode {
    Success = 0x00,
    NodeBusy = 0xC0,
    InvalidCommand = 0xC1,
    InvalidCommandForLun = 0xC2,
    Timeout = 0xC3,
    OutOfSpace = 0xC4,
    ReservationCancelled = 0xC5,
    RequestDataTruncated = 0xC6,
    RequestDataLengthInvalid = 0xC7,
    RequestDataFieldLengthLimitExceeded = 0xC8,
    ParameterOutOfRange = 0xC9,
    CannotReturnRequestedBytes = 0xCA,
    RequestedDataNotPresent = 0xCB,
    InvalidDataField = 0xCC,
    CommandIllegalForSensor = 0xCD,
    ResponseUnavailable = 0xCE,
    DuplicateRequest = 0xCF,
    SdrRepositoryInUpdate = 0xD0,
    FirmwareUpdateMode = 0xD1,
    InitializationInProgress = 0xD2,
    DestinationUnavailable = 0xD3,
    InsufficientPrivilege = 0xD4,
    NotSupportedInPresentState = 0xD5,
    SubFunctionDisabled = 0xD6,
    UnspecifiedError = 0xFF,
}

impl From<CompletionCode> for u8 {
    fn from(cc: CompletionCode) -> u8 {
        cc as u8
    }
}
