// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Get Device ID (App 01h).

use alloc::boxed::Box;
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{Immutable, IntoBytes, Unaligned};

use crate::{cmd, netfn, CommandRouter, CompletionCode};

/// IPMI version 2.0 in the response's reversed-nibble BCD encoding.
pub const IPMI_VERSION_2_0: u8 = 0x02;

bitflags! {
    /// "Additional device support" flags in the Get Device ID response.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DeviceCapabilities: u8 {
        const SENSOR_DEVICE = 1 << 0;
        const SDR_REPOSITORY_DEVICE = 1 << 1;
        const SEL_DEVICE = 1 << 2;
        const FRU_INVENTORY_DEVICE = 1 << 3;
        const IPMB_EVENT_RECEIVER = 1 << 4;
        const IPMB_EVENT_GENERATOR = 1 << 5;
        const BRIDGE = 1 << 6;
        const CHASSIS_DEVICE = 1 << 7;
    }
}

/// Identity reported by Get Device ID. Filled in once by the platform at
/// bring-up; the aux revision carries the first four bytes of the build's
/// source revision.
#[derive(Copy, Clone, Debug)]
pub struct DeviceIdent {
    pub device_id: u8,
    /// Low nibble of the device revision byte.
    pub hardware_revision: u8,
    pub provides_sdrs: bool,
    /// 7-bit major firmware revision.
    pub firmware_major: u8,
    pub update_in_progress: bool,
    /// BCD minor firmware revision.
    pub firmware_minor_bcd: u8,
    pub capabilities: DeviceCapabilities,
    /// 20-bit IANA enterprise number; 0 = unspecified.
    pub manufacturer_id: u32,
    pub product_id: u16,
    /// Auxiliary firmware revision (source revision bytes).
    pub aux_revision: [u8; 4],
}

/// The 15 bytes following the completion code, in wire order.
#[derive(IntoBytes, Immutable, Unaligned)]
#[repr(C)]
struct DeviceIdRecord {
    device_id: u8,
    device_revision: u8,
    firmware_major: u8,
    firmware_minor: u8,
    ipmi_version: u8,
    additional_support: u8,
    manufacturer_id: [u8; 3],
    product_id: [u8; 2],
    aux_revision: [u8; 4],
}

// The response is the completion code plus exactly these 15 bytes.
const_assert_eq!(core::mem::size_of::<DeviceIdRecord>(), 15);

impl DeviceIdent {
    fn record(&self) -> DeviceIdRecord {
        let mfg = self.manufacturer_id.to_le_bytes();
        DeviceIdRecord {
            device_id: self.device_id,
            device_revision: (self.hardware_revision & 0x0F)
                | if self.provides_sdrs { 0x80 } else { 0 },
            firmware_major: (self.firmware_major & 0x7F)
                | if self.update_in_progress { 0x80 } else { 0 },
            firmware_minor: self.firmware_minor_bcd,
            ipmi_version: IPMI_VERSION_2_0,
            additional_support: self.capabilities.bits(),
            manufacturer_id: [mfg[0], mfg[1], mfg[2]],
            product_id: self.product_id.to_le_bytes(),
            aux_revision: self.aux_revision,
        }
    }
}

/// Registers the App netFn handlers.
pub fn register_app_handlers(router: &mut CommandRouter, ident: DeviceIdent) {
    router.register(
        netfn::APP,
        cmd::app::GET_DEVICE_ID,
        Box::new(move |tx, req| {
            let record = ident.record();
            tx.send(
                req.reply_with(CompletionCode::Success, record.as_bytes()),
                None,
            );
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::CapturingSender;
    use crate::Msg;

    fn ident() -> DeviceIdent {
        DeviceIdent {
            device_id: 0x00,
            hardware_revision: 0x0A,
            provides_sdrs: false,
            firmware_major: 0x0A,
            update_in_progress: false,
            firmware_minor_bcd: 0x01,
            capabilities: DeviceCapabilities::IPMB_EVENT_GENERATOR,
            manufacturer_id: 0,
            product_id: 0,
            aux_revision: *b"git0",
        }
    }

    #[test]
    fn response_is_sixteen_bytes_in_wire_order() {
        let mut router = CommandRouter::new();
        register_app_handlers(&mut router, ident());
        let sender = CapturingSender::default();
        let mut req =
            Msg::new(0, 0x20, 0, 0x82, netfn::APP, cmd::app::GET_DEVICE_ID, &[])
                .unwrap();
        req.rq_seq = 3;
        router.dispatch(&sender, &req);

        let sent = sender.sent.lock().unwrap();
        let data = &sent[0].data;
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], 0x00); // completion code
        assert_eq!(data[1], 0x00); // device id
        assert_eq!(data[2], 0x0A); // device revision, no SDRs
        assert_eq!(data[3], 0x0A); // firmware major
        assert_eq!(data[4], 0x01); // firmware minor, BCD
        assert_eq!(data[5], IPMI_VERSION_2_0);
        assert_eq!(data[6], DeviceCapabilities::IPMB_EVENT_GENERATOR.bits());
        assert_eq!(&data[7..10], &[0, 0, 0]); // manufacturer
        assert_eq!(&data[10..12], &[0, 0]); // product
        assert_eq!(&data[12..16], b"git0");
        assert_eq!(sent[0].rq_seq, 3);
    }
}
