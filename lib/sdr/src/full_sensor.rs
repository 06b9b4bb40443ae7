// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Type 01h: the full sensor record.
//!
//! This is the record the threshold engine feeds on: the analog conversion
//! block (M, B, exponents, linearization), the six threshold raw values,
//! hysteresis, and the three event-mask words. Field packing follows the
//! IPMI full sensor record layout; offsets below are 0-based into the raw
//! record, common header included.

use alloc::vec;
use alloc::vec::Vec;

use crate::record::{write_header, RecordType};
use crate::SdrError;

/// Linearization selector (byte 23). Only `Linear` is given meaning;
/// every other curve reads as "no conversion available".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Linearization {
    Linear,
    Other(u8),
}

/// One of the six threshold levels, with its raw-value byte offset and its
/// bit position in the readable/settable masks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Threshold {
    LowerNonCritical,
    LowerCritical,
    LowerNonRecoverable,
    UpperNonCritical,
    UpperCritical,
    UpperNonRecoverable,
}

impl Threshold {
    pub const ALL: [Threshold; 6] = [
        Threshold::LowerNonCritical,
        Threshold::LowerCritical,
        Threshold::LowerNonRecoverable,
        Threshold::UpperNonCritical,
        Threshold::UpperCritical,
        Threshold::UpperNonRecoverable,
    ];

    fn byte_offset(self) -> usize {
        match self {
            Threshold::UpperNonRecoverable => 36,
            Threshold::UpperCritical => 37,
            Threshold::UpperNonCritical => 38,
            Threshold::LowerNonRecoverable => 39,
            Threshold::LowerCritical => 40,
            Threshold::LowerNonCritical => 41,
        }
    }

    /// Bit position in the readable/settable threshold masks.
    pub fn mask_bit(self) -> u8 {
        match self {
            Threshold::LowerNonCritical => 0,
            Threshold::LowerCritical => 1,
            Threshold::LowerNonRecoverable => 2,
            Threshold::UpperNonCritical => 3,
            Threshold::UpperCritical => 4,
            Threshold::UpperNonRecoverable => 5,
        }
    }

    pub fn is_upper(self) -> bool {
        matches!(
            self,
            Threshold::UpperNonCritical
                | Threshold::UpperCritical
                | Threshold::UpperNonRecoverable
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullSensorRecord {
    pub(crate) bytes: Vec<u8>,
}

/// Sign-extends a 4-bit two's-complement field.
fn sext4(nibble: u8) -> i8 {
    let mut v = nibble & 0x0F;
    if v & 0x08 != 0 {
        v |= 0xF0;
    }
    v as i8
}

/// `10^e` for the 4-bit exponent range, without pulling a float runtime
/// into the image.
fn pow10(e: i8) -> f32 {
    const POS: [f32; 8] = [1e0, 1e1, 1e2, 1e3, 1e4, 1e5, 1e6, 1e7];
    const NEG: [f32; 9] =
        [1e0, 1e-1, 1e-2, 1e-3, 1e-4, 1e-5, 1e-6, 1e-7, 1e-8];
    if e >= 0 {
        POS[e as usize]
    } else {
        NEG[(-e) as usize]
    }
}

impl FullSensorRecord {
    /// A blank record carrying `name`, all masks and thresholds zero,
    /// identity conversion. The platform fills it in at bring-up.
    pub fn blank(name: &str) -> Self {
        let name = &name.as_bytes()[..name.len().min(16)];
        let mut bytes = vec![0u8; 48 + name.len()];
        write_header(&mut bytes, RecordType::FullSensor);
        bytes[13] = crate::EVENT_TYPE_THRESHOLD;
        bytes[24] = 1; // M = 1
        bytes[47] = 0xC0 | name.len() as u8; // 8-bit ASCII type/length
        bytes[48..].copy_from_slice(name);
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sensor_owner_id(&self) -> u8 {
        self.bytes[5]
    }
    pub fn set_sensor_owner(&mut self, id: u8, lun: u8) {
        self.bytes[5] = id;
        self.bytes[6] = (self.bytes[6] & !0x03) | (lun & 0x03);
    }
    pub fn sensor_owner_lun(&self) -> u8 {
        self.bytes[6] & 0x03
    }
    pub fn sensor_number(&self) -> u8 {
        self.bytes[7]
    }
    pub fn set_sensor_number(&mut self, number: u8) {
        self.bytes[7] = number;
    }
    pub fn entity_id(&self) -> u8 {
        self.bytes[8]
    }
    pub fn entity_instance(&self) -> u8 {
        self.bytes[9] & 0x7F
    }

    pub fn events_enabled_default(&self) -> bool {
        self.bytes[10] & 0x02 != 0
    }
    pub fn scanning_enabled_default(&self) -> bool {
        self.bytes[10] & 0x01 != 0
    }
    pub fn auto_rearm(&self) -> bool {
        self.bytes[11] & 0x40 != 0
    }

    pub fn sensor_type_code(&self) -> u8 {
        self.bytes[12]
    }
    pub fn set_sensor_type_code(&mut self, code: u8) {
        self.bytes[12] = code;
    }
    pub fn event_type_reading_code(&self) -> u8 {
        self.bytes[13]
    }

    /// Supported assertion events: the low 12 bits of the assertion mask
    /// word (bytes 14-15).
    pub fn assertion_event_mask(&self) -> u16 {
        (u16::from(self.bytes[15] & 0x0F) << 8) | u16::from(self.bytes[14])
    }
    pub fn set_assertion_event_mask(&mut self, mask: u16) {
        self.bytes[14] = mask as u8;
        self.bytes[15] = (self.bytes[15] & 0xF0) | ((mask >> 8) as u8 & 0x0F);
    }

    /// Supported deassertion events (bytes 16-17).
    pub fn deassertion_event_mask(&self) -> u16 {
        (u16::from(self.bytes[17] & 0x0F) << 8) | u16::from(self.bytes[16])
    }
    pub fn set_deassertion_event_mask(&mut self, mask: u16) {
        self.bytes[16] = mask as u8;
        self.bytes[17] = (self.bytes[17] & 0xF0) | ((mask >> 8) as u8 & 0x0F);
    }

    /// Readable thresholds, one bit per [`Threshold::mask_bit`].
    pub fn readable_thresholds(&self) -> u8 {
        self.bytes[18] & 0x3F
    }
    pub fn set_readable_thresholds(&mut self, mask: u8) {
        self.bytes[18] = (self.bytes[18] & !0x3F) | (mask & 0x3F);
    }
    pub fn settable_thresholds(&self) -> u8 {
        self.bytes[19] & 0x3F
    }

    pub fn units_percentage(&self) -> bool {
        self.bytes[20] & 0x01 != 0
    }
    pub fn units_base_unit(&self) -> u8 {
        self.bytes[21]
    }
    pub fn set_units_base_unit(&mut self, unit: u8) {
        self.bytes[21] = unit;
    }

    pub fn linearization(&self) -> Linearization {
        match self.bytes[23] & 0x7F {
            0 => Linearization::Linear,
            other => Linearization::Other(other),
        }
    }

    /// Signed 10-bit M coefficient.
    pub fn conversion_m(&self) -> i16 {
        let signed_ms = i16::from((self.bytes[25] as i8) >> 6);
        (signed_ms << 8) | i16::from(self.bytes[24])
    }

    /// Signed 10-bit B coefficient.
    pub fn conversion_b(&self) -> i16 {
        let signed_ms = i16::from((self.bytes[27] as i8) >> 6);
        (signed_ms << 8) | i16::from(self.bytes[26])
    }

    /// Signed 4-bit result exponent.
    pub fn conversion_r_exp(&self) -> i8 {
        sext4(self.bytes[29] >> 4)
    }

    /// Signed 4-bit B exponent.
    pub fn conversion_b_exp(&self) -> i8 {
        sext4(self.bytes[29])
    }

    /// Installs the conversion block. M and B are 10-bit signed; the
    /// exponents are 4-bit signed.
    pub fn set_conversion(
        &mut self,
        m: i16,
        b: i16,
        b_exp: i8,
        r_exp: i8,
    ) -> Result<(), SdrError> {
        if !(-512..=511).contains(&m)
            || !(-512..=511).contains(&b)
            || !(-8..=7).contains(&b_exp)
            || !(-8..=7).contains(&r_exp)
        {
            return Err(SdrError::FieldRange);
        }
        self.bytes[24] = m as u8;
        self.bytes[25] = (self.bytes[25] & 0x3F) | (((m & 0x0300) >> 2) as u8);
        self.bytes[26] = b as u8;
        self.bytes[27] = (self.bytes[27] & 0x3F) | (((b & 0x0300) >> 2) as u8);
        self.bytes[29] = ((r_exp as u8) << 4) | (b_exp as u8 & 0x0F);
        Ok(())
    }

    pub fn nominal_reading_raw(&self) -> u8 {
        self.bytes[31]
    }
    pub fn sensor_max_raw(&self) -> u8 {
        self.bytes[34]
    }
    pub fn sensor_min_raw(&self) -> u8 {
        self.bytes[35]
    }

    pub fn threshold_raw(&self, t: Threshold) -> u8 {
        self.bytes[t.byte_offset()]
    }
    pub fn set_threshold_raw(&mut self, t: Threshold, raw: u8) {
        self.bytes[t.byte_offset()] = raw;
    }

    /// Positive-going (upper-direction) hysteresis, raw counts.
    pub fn hysteresis_high(&self) -> u8 {
        self.bytes[42]
    }
    /// Negative-going (lower-direction) hysteresis, raw counts.
    pub fn hysteresis_low(&self) -> u8 {
        self.bytes[43]
    }
    pub fn set_hysteresis(&mut self, high: u8, low: u8) {
        self.bytes[42] = high;
        self.bytes[43] = low;
    }

    pub fn id_string(&self) -> &str {
        let len = usize::from(self.bytes[47] & 0x1F);
        let end = (48 + len).min(self.bytes.len());
        core::str::from_utf8(&self.bytes[48..end]).unwrap_or("")
    }

    fn ext_data_offset(&self) -> usize {
        48 + usize::from(self.bytes[47] & 0x1F)
    }

    /// User-enabled assertion events. Stored past the id string; if the
    /// extension is absent or uninitialized, the supported mask stands in,
    /// so a factory record has everything it supports enabled.
    pub fn ext_assertion_events_enabled(&self) -> u16 {
        let off = self.ext_data_offset();
        if self.bytes.len() < off + 2 || self.bytes[off + 1] & 0x80 == 0 {
            return self.assertion_event_mask();
        }
        0x7FFF
            & ((u16::from(self.bytes[off + 1]) << 8)
                | u16::from(self.bytes[off]))
    }

    pub fn set_ext_assertion_events_enabled(&mut self, mask: u16) {
        let off = self.ext_data_offset();
        if self.bytes.len() < off + 2 {
            self.bytes.resize(off + 2, 0);
        }
        let stored = mask | 0x8000; // initialized marker
        self.bytes[off] = stored as u8;
        self.bytes[off + 1] = (stored >> 8) as u8;
        self.refresh_length();
    }

    /// User-enabled deassertion events; same fallback rule.
    pub fn ext_deassertion_events_enabled(&self) -> u16 {
        let off = self.ext_data_offset();
        if self.bytes.len() < off + 4 || self.bytes[off + 3] & 0x80 == 0 {
            return self.deassertion_event_mask();
        }
        0x7FFF
            & ((u16::from(self.bytes[off + 3]) << 8)
                | u16::from(self.bytes[off + 2]))
    }

    pub fn set_ext_deassertion_events_enabled(&mut self, mask: u16) {
        let off = self.ext_data_offset();
        if self.bytes.len() < off + 4 {
            self.bytes.resize(off + 4, 0);
        }
        let stored = mask | 0x8000;
        self.bytes[off + 2] = stored as u8;
        self.bytes[off + 3] = (stored >> 8) as u8;
        self.refresh_length();
    }

    fn refresh_length(&mut self) {
        self.bytes[4] = (self.bytes.len() - 5) as u8;
    }

    /// Raw reading to engineering units:
    /// `L((M * raw + B * 10^Bexp) * 10^Rexp)`. Non-linear curves read NaN.
    pub fn to_float(&self, raw: u8) -> f32 {
        if self.linearization() != Linearization::Linear {
            return f32::NAN;
        }
        (f32::from(self.conversion_m()) * f32::from(raw)
            + f32::from(self.conversion_b()) * pow10(self.conversion_b_exp()))
            * pow10(self.conversion_r_exp())
    }

    /// Engineering units back to the nearest raw count, saturating into
    /// [0, 255]. Non-linear curves answer 0xFF, the obviously-wrong value
    /// that trips alarms rather than hiding.
    pub fn from_float(&self, value: f32) -> u8 {
        if self.linearization() != Linearization::Linear {
            return 0xFF;
        }
        let mut v = value / pow10(self.conversion_r_exp());
        v -= f32::from(self.conversion_b()) * pow10(self.conversion_b_exp());
        v /= f32::from(self.conversion_m());
        if v.is_nan() {
            return 0xFF;
        }
        // Round to nearest; float-to-int casts saturate.
        (v + 0.5) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;

    #[test]
    fn blank_record_interprets_cleanly() {
        let rec = FullSensorRecord::blank("+12VPYLD");
        assert_eq!(rec.id_string(), "+12VPYLD");
        let rec = Record::interpret(rec.bytes()).unwrap();
        assert!(matches!(rec, Record::FullSensor(_)));
    }

    #[test]
    fn identity_conversion_round_trips() {
        let rec = FullSensorRecord::blank("t");
        assert_eq!(rec.conversion_m(), 1);
        assert_eq!(rec.conversion_b(), 0);
        assert_eq!(rec.to_float(50), 50.0);
        assert_eq!(rec.from_float(50.0), 50);
    }

    #[test]
    fn negative_coefficients_sign_extend() {
        let mut rec = FullSensorRecord::blank("t");
        rec.set_conversion(-2, -10, 0, -1).unwrap();
        assert_eq!(rec.conversion_m(), -2);
        assert_eq!(rec.conversion_b(), -10);
        assert_eq!(rec.conversion_b_exp(), 0);
        assert_eq!(rec.conversion_r_exp(), -1);
        // (-2 * 10 + -10) * 10^-1 = -3.0
        assert_eq!(rec.to_float(10), -3.0);
    }

    #[test]
    fn conversion_rejects_out_of_range_fields() {
        let mut rec = FullSensorRecord::blank("t");
        assert_eq!(rec.set_conversion(512, 0, 0, 0), Err(SdrError::FieldRange));
        assert_eq!(rec.set_conversion(0, -513, 0, 0), Err(SdrError::FieldRange));
        assert_eq!(rec.set_conversion(0, 0, 8, 0), Err(SdrError::FieldRange));
        assert_eq!(rec.set_conversion(0, 0, 0, -9), Err(SdrError::FieldRange));
    }

    #[test]
    fn nonlinear_curves_refuse_conversion() {
        let mut rec = FullSensorRecord::blank("t");
        rec.bytes[23] = 0x07; // e^x
        assert!(rec.to_float(10).is_nan());
        assert_eq!(rec.from_float(10.0), 0xFF);
    }

    #[test]
    fn from_float_saturates() {
        let rec = FullSensorRecord::blank("t");
        assert_eq!(rec.from_float(300.0), 255);
        assert_eq!(rec.from_float(-5.0), 0);
    }

    #[test]
    fn ext_masks_default_to_supported() {
        let mut rec = FullSensorRecord::blank("t");
        rec.set_assertion_event_mask(0x0A95);
        rec.set_deassertion_event_mask(0x0A95);
        assert_eq!(rec.ext_assertion_events_enabled(), 0x0A95);

        rec.set_ext_assertion_events_enabled(0x0080);
        assert_eq!(rec.ext_assertion_events_enabled(), 0x0080);
        // Deassertion mask still falls back.
        assert_eq!(rec.ext_deassertion_events_enabled(), 0x0A95);
        rec.set_ext_deassertion_events_enabled(0x0001);
        assert_eq!(rec.ext_deassertion_events_enabled(), 0x0001);

        // The record still interprets after growing its extension.
        assert!(Record::interpret(rec.bytes()).is_ok());
    }

    #[test]
    fn threshold_bytes_follow_ipmi_order() {
        let mut rec = FullSensorRecord::blank("t");
        rec.set_threshold_raw(Threshold::UpperNonCritical, 50);
        rec.set_threshold_raw(Threshold::LowerCritical, 10);
        assert_eq!(rec.bytes()[38], 50);
        assert_eq!(rec.bytes()[40], 10);
        assert_eq!(rec.threshold_raw(Threshold::UpperNonCritical), 50);
    }
}
