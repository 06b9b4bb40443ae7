// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The threshold sensor engine.
//!
//! A threshold sensor pairs runtime state (last value, asserted events,
//! context) with a type-01 SDR that supplies the conversion block,
//! thresholds, hysteresis, and event enables. The SDR is looked up fresh
//! for every update rather than retained, so repository edits take effect
//! on the next cycle and nothing here holds a record hostage.
//!
//! Twelve event bits, packed low to high:
//!
//! | bit | meaning                              |
//! |-----|--------------------------------------|
//! | 0/1 | lower non-critical going low / high  |
//! | 2/3 | lower critical going low / high      |
//! | 4/5 | lower non-recoverable going low/high |
//! | 6/7 | upper non-critical going low / high  |
//! | 8/9 | upper critical going low / high      |
//! | 10/11 | upper non-recoverable going low/high |
//!
//! Values cross thresholds in their natural direction (upper thresholds
//! assert going high, lower going low); the opposite-direction bits only
//! fire when injected as extra events, e.g. by the hardware sensor
//! processor. Deassertion is hysteresis-guarded: a falling reading releases
//! an upper threshold only `hysteresis_low` raw counts below it, a rising
//! reading releases a lower threshold only `hysteresis_high` raw counts
//! above it.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

mod hotswap;

pub use hotswap::{HotswapSensor, MState, StateChangeCause, HOTSWAP_SENSOR_TYPE};

use alloc::vec::Vec;
use bitflags::bitflags;

use osal::Ticks;
use sdr::{FullSensorRecord, Threshold};

bitflags! {
    /// The 12 threshold event bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Events: u16 {
        const LNC_LOW = 1 << 0;
        const LNC_HIGH = 1 << 1;
        const LCR_LOW = 1 << 2;
        const LCR_HIGH = 1 << 3;
        const LNR_LOW = 1 << 4;
        const LNR_HIGH = 1 << 5;
        const UNC_LOW = 1 << 6;
        const UNC_HIGH = 1 << 7;
        const UCR_LOW = 1 << 8;
        const UCR_HIGH = 1 << 9;
        const UNR_LOW = 1 << 10;
        const UNR_HIGH = 1 << 11;
    }
}

/// All twelve event bits.
pub const ALL_EVENTS: u16 = 0x0FFF;

/// Event/Reading Type Code for threshold sensors.
pub const EVENT_TYPE_THRESHOLD: u8 = 0x01;

/// Override value meaning "no override".
pub const NO_OVERRIDE: u16 = 0xFFFF;

/// One Platform Event Message, ready to put on the IPMB.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlatformEvent {
    pub assertion: bool,
    /// Event offset: the bit index from the table above.
    pub offset: u8,
    pub sensor_type: u8,
    pub sensor_number: u8,
    pub event_type: u8,
    pub data: [u8; 3],
}

impl PlatformEvent {
    /// Renders as a Platform Event Message request (netFn 04h, cmd 02h)
    /// addressed to the event receiver.
    pub fn into_msg(self, own_addr: u8, receiver_addr: u8) -> ipmi::Msg {
        let dir = if self.assertion { 0x00 } else { 0x80 };
        let payload = [
            0x04, // event message revision
            self.sensor_type,
            self.sensor_number,
            dir | self.event_type,
            self.data[0],
            self.data[1],
            self.data[2],
        ];
        // Seven bytes always fit; the unwrap cannot fire.
        ipmi::Msg::new(
            0,
            own_addr,
            0,
            receiver_addr,
            ipmi::netfn::SENSOR_EVENT,
            ipmi::cmd::sensor_event::PLATFORM_EVENT,
            &payload,
        )
        .unwrap_or_default()
    }
}

/// The (going-low bit, going-high bit) pair for a threshold.
fn bits_for(t: Threshold) -> (u8, u8) {
    match t {
        Threshold::LowerNonCritical => (0, 1),
        Threshold::LowerCritical => (2, 3),
        Threshold::LowerNonRecoverable => (4, 5),
        Threshold::UpperNonCritical => (6, 7),
        Threshold::UpperCritical => (8, 9),
        Threshold::UpperNonRecoverable => (10, 11),
    }
}

/// The threshold whose pair contains event bit `bit`.
fn threshold_for_bit(bit: u8) -> Threshold {
    Threshold::ALL[usize::from(bit / 2)]
}

pub struct ThresholdSensor {
    sensor_number: u8,
    sensor_type: u8,
    last_value: f32,
    value_expiration: Ticks,
    active_events: u16,
    enabled_assertions: u16,
    enabled_deassertions: u16,
    nominal_event_status_override: u16,
}

impl ThresholdSensor {
    pub fn new(sensor_number: u8, sensor_type: u8) -> Self {
        Self {
            sensor_number,
            sensor_type,
            last_value: f32::NAN,
            value_expiration: 0,
            active_events: 0,
            enabled_assertions: 0,
            enabled_deassertions: 0,
            nominal_event_status_override: NO_OVERRIDE,
        }
    }

    pub fn sensor_number(&self) -> u8 {
        self.sensor_number
    }

    pub fn sensor_type(&self) -> u8 {
        self.sensor_type
    }

    /// The reading as of the last update, unless it has aged out.
    pub fn current_value(&self, now: Ticks) -> Option<f32> {
        if self.last_value.is_nan() || now > self.value_expiration {
            None
        } else {
            Some(self.last_value)
        }
    }

    /// Currently asserted events, unless overridden.
    pub fn event_status(&self) -> u16 {
        if self.nominal_event_status_override == NO_OVERRIDE {
            self.active_events
        } else {
            self.nominal_event_status_override
        }
    }

    /// Forces the reported event status to a fixed mask (0x0000..=0x0FFF),
    /// or restores live reporting with [`NO_OVERRIDE`].
    pub fn set_nominal_event_status_override(&mut self, value: u16) {
        self.nominal_event_status_override = value;
    }

    /// Clears all asserted events without emitting deassertions. The next
    /// update recomputes from first principles.
    pub fn rearm(&mut self) {
        self.active_events = 0;
    }

    /// Feeds one reading through the threshold comparator.
    ///
    /// `reading` is in engineering units (`None` when the source could not
    /// produce one); `in_context` masks which event bits are currently
    /// meaningful — a sensor in a powered-down zone runs with 0 and can
    /// only deassert. Returned events are ordered assertions first, then
    /// deassertions, each in ascending bit order.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        sdr: &FullSensorRecord,
        reading: Option<f32>,
        now: Ticks,
        in_context: u16,
        value_max_age: Ticks,
        extra_assertions: u16,
        extra_deassertions: u16,
    ) -> Vec<PlatformEvent> {
        self.enabled_assertions = sdr.assertion_event_mask()
            & sdr.ext_assertion_events_enabled()
            & ALL_EVENTS;
        self.enabled_deassertions = sdr.deassertion_event_mask()
            & sdr.ext_deassertion_events_enabled()
            & ALL_EVENTS;

        let usable = match reading {
            Some(v) if !v.is_nan() && in_context != 0 => Some(v),
            _ => None,
        };

        let Some(value) = usable else {
            // Reading unavailable: nothing can assert, and whatever fell
            // out of context deasserts now.
            self.last_value = f32::NAN;
            let dropping = self.active_events & !in_context;
            let deassertions =
                dropping & self.enabled_deassertions;
            self.active_events &= in_context;
            return self.frames(sdr, 0, deassertions, 0);
        };

        let raw = sdr.from_float(value);
        self.last_value = value;
        self.value_expiration = now.saturating_add(value_max_age);

        let readable = sdr.readable_thresholds();
        let mut candidate: u16 = 0;
        for t in Threshold::ALL {
            if readable & (1 << t.mask_bit()) == 0 {
                continue;
            }
            let threshold = i16::from(sdr.threshold_raw(t));
            let raw = i16::from(raw);
            let (low_bit, high_bit) = bits_for(t);
            let natural_bit = if t.is_upper() { high_bit } else { low_bit };
            let crossed = if t.is_upper() {
                raw >= threshold
            } else {
                raw <= threshold
            };
            // Hysteresis: an asserted threshold holds until the reading
            // backs off far enough past it.
            let held = self.active_events & (1 << natural_bit) != 0
                && if t.is_upper() {
                    raw >= threshold - i16::from(sdr.hysteresis_low())
                } else {
                    raw <= threshold + i16::from(sdr.hysteresis_high())
                };
            if crossed || held {
                candidate |= 1 << natural_bit;
            }
        }

        let assertions = ((candidate & !self.active_events)
            | extra_assertions)
            & self.enabled_assertions
            & in_context;
        let deassertions = ((self.active_events & !candidate)
            | extra_deassertions)
            & self.enabled_deassertions
            & in_context;

        self.active_events =
            (self.active_events | assertions) & !deassertions;

        self.frames(sdr, assertions, deassertions, raw)
    }

    /// Builds the ordered event frames for one update.
    fn frames(
        &self,
        sdr: &FullSensorRecord,
        assertions: u16,
        deassertions: u16,
        raw: u8,
    ) -> Vec<PlatformEvent> {
        let mut out = Vec::new();
        for (mask, assertion) in [(assertions, true), (deassertions, false)] {
            for bit in 0..12u8 {
                if mask & (1 << bit) == 0 {
                    continue;
                }
                let threshold = sdr.threshold_raw(threshold_for_bit(bit));
                out.push(PlatformEvent {
                    assertion,
                    offset: bit,
                    sensor_type: self.sensor_type,
                    sensor_number: self.sensor_number,
                    event_type: EVENT_TYPE_THRESHOLD,
                    // 50h: trigger reading in data2, threshold in data3.
                    data: [0x50 | bit, raw, threshold],
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdr::FullSensorRecord;

    /// Scenario sensor: M=1, B=0, UNC raw 50, hysteresis low 2, every
    /// event supported and enabled.
    fn unc_sensor() -> (ThresholdSensor, FullSensorRecord) {
        let mut rec = FullSensorRecord::blank("12V");
        rec.set_sensor_number(3);
        rec.set_sensor_type_code(0x02); // voltage
        rec.set_assertion_event_mask(ALL_EVENTS);
        rec.set_deassertion_event_mask(ALL_EVENTS);
        rec.set_readable_thresholds(
            1 << Threshold::UpperNonCritical.mask_bit(),
        );
        rec.set_threshold_raw(Threshold::UpperNonCritical, 50);
        rec.set_hysteresis(0, 2);
        (ThresholdSensor::new(3, 0x02), rec)
    }

    fn update(
        s: &mut ThresholdSensor,
        rec: &FullSensorRecord,
        value: f32,
    ) -> Vec<PlatformEvent> {
        s.update(rec, Some(value), 1000, ALL_EVENTS, 5000, 0, 0)
    }

    #[test]
    fn unc_asserts_holds_and_deasserts_with_hysteresis() {
        let (mut s, rec) = unc_sensor();

        // Steady state below threshold.
        assert!(update(&mut s, &rec, 40.0).is_empty());

        // Crossing up asserts bit 7 exactly once.
        let events = update(&mut s, &rec, 60.0);
        assert_eq!(events.len(), 1);
        assert!(events[0].assertion);
        assert_eq!(events[0].offset, 7);
        assert_eq!(events[0].data, [0x50 | 7, 60, 50]);
        assert!(update(&mut s, &rec, 60.0).is_empty());

        // Inside the hysteresis band: still asserted, nothing emitted.
        assert!(update(&mut s, &rec, 49.0).is_empty());
        assert_eq!(s.event_status(), Events::UNC_HIGH.bits());

        // Past the band: one deassertion.
        let events = update(&mut s, &rec, 47.0);
        assert_eq!(events.len(), 1);
        assert!(!events[0].assertion);
        assert_eq!(events[0].offset, 7);
        assert_eq!(s.event_status(), 0);
    }

    #[test]
    fn half_hysteresis_above_threshold_does_not_deassert() {
        let (mut s, rec) = unc_sensor();
        update(&mut s, &rec, 60.0);
        // threshold + hysteresis/2
        assert!(update(&mut s, &rec, 51.0).is_empty());
        assert_eq!(s.event_status(), Events::UNC_HIGH.bits());
    }

    #[test]
    fn events_never_escape_enables_or_context() {
        let (mut s, mut rec) = unc_sensor();
        rec.set_ext_assertion_events_enabled(0); // user disabled them all
        assert!(update(&mut s, &rec, 60.0).is_empty());
        assert_eq!(s.event_status(), 0);

        rec.set_ext_assertion_events_enabled(ALL_EVENTS);
        // Out of context: no assertion either.
        let events = s.update(&rec, Some(60.0), 0, 0, 5000, 0, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn leaving_context_deasserts_active_bits() {
        let (mut s, rec) = unc_sensor();
        update(&mut s, &rec, 60.0);
        let events = s.update(&rec, Some(60.0), 2000, 0, 5000, 0, 0);
        assert_eq!(events.len(), 1);
        assert!(!events[0].assertion);
        assert_eq!(events[0].offset, 7);
        assert_eq!(s.event_status(), 0);
        assert!(s.current_value(2000).is_none());
    }

    #[test]
    fn lower_threshold_uses_high_hysteresis() {
        let mut rec = FullSensorRecord::blank("temp");
        rec.set_sensor_number(4);
        rec.set_assertion_event_mask(ALL_EVENTS);
        rec.set_deassertion_event_mask(ALL_EVENTS);
        rec.set_readable_thresholds(
            1 << Threshold::LowerCritical.mask_bit(),
        );
        rec.set_threshold_raw(Threshold::LowerCritical, 20);
        rec.set_hysteresis(3, 0);
        let mut s = ThresholdSensor::new(4, 0x01);

        let events = update(&mut s, &rec, 15.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].offset, 2); // LCR going low
        assert!(update(&mut s, &rec, 22.0).is_empty()); // within band
        let events = update(&mut s, &rec, 24.0);
        assert_eq!(events.len(), 1);
        assert!(!events[0].assertion);
    }

    #[test]
    fn extra_bits_are_masked_but_not_value_gated() {
        let (mut s, rec) = unc_sensor();
        let events =
            s.update(&rec, Some(10.0), 0, ALL_EVENTS, 5000, Events::LNC_LOW.bits(), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].offset, 0);
        assert!(events[0].assertion);
        assert_eq!(s.event_status(), Events::LNC_LOW.bits());
    }

    #[test]
    fn rearm_clears_silently_and_recomputes() {
        let (mut s, rec) = unc_sensor();
        update(&mut s, &rec, 60.0);
        s.rearm();
        assert_eq!(s.event_status(), 0);
        // Still over threshold: the next update re-asserts.
        let events = update(&mut s, &rec, 60.0);
        assert_eq!(events.len(), 1);
        assert!(events[0].assertion);
    }

    #[test]
    fn readings_expire_to_unavailable() {
        let (mut s, rec) = unc_sensor();
        update(&mut s, &rec, 40.0);
        assert_eq!(s.current_value(1000), Some(40.0));
        assert_eq!(s.current_value(6001), None);
    }

    #[test]
    fn override_pins_reported_status() {
        let (mut s, rec) = unc_sensor();
        update(&mut s, &rec, 60.0);
        s.set_nominal_event_status_override(0x0003);
        assert_eq!(s.event_status(), 0x0003);
        s.set_nominal_event_status_override(NO_OVERRIDE);
        assert_eq!(s.event_status(), Events::UNC_HIGH.bits());
    }

    #[test]
    fn assertions_precede_deassertions_in_bit_order() {
        let mut rec = FullSensorRecord::blank("multi");
        rec.set_sensor_number(5);
        rec.set_assertion_event_mask(ALL_EVENTS);
        rec.set_deassertion_event_mask(ALL_EVENTS);
        rec.set_readable_thresholds(0x3F);
        rec.set_threshold_raw(Threshold::LowerNonCritical, 30);
        rec.set_threshold_raw(Threshold::LowerCritical, 20);
        rec.set_threshold_raw(Threshold::LowerNonRecoverable, 10);
        rec.set_threshold_raw(Threshold::UpperNonCritical, 60);
        rec.set_threshold_raw(Threshold::UpperCritical, 70);
        rec.set_threshold_raw(Threshold::UpperNonRecoverable, 80);
        let mut s = ThresholdSensor::new(5, 0x02);

        // Dive below every lower threshold.
        let events = update(&mut s, &rec, 5.0);
        let offsets: Vec<u8> = events.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 2, 4]);

        // Jump above every upper threshold: three assertions (ascending),
        // then three deassertions (ascending).
        let events = update(&mut s, &rec, 90.0);
        let order: Vec<(bool, u8)> =
            events.iter().map(|e| (e.assertion, e.offset)).collect();
        assert_eq!(
            order,
            vec![
                (true, 7),
                (true, 9),
                (true, 11),
                (false, 0),
                (false, 2),
                (false, 4),
            ]
        );
    }

    #[test]
    fn platform_event_message_layout() {
        let event = PlatformEvent {
            assertion: false,
            offset: 7,
            sensor_type: 0x02,
            sensor_number: 3,
            event_type: EVENT_TYPE_THRESHOLD,
            data: [0x57, 47, 50],
        };
        let msg = event.into_msg(0x82, 0x20);
        assert_eq!(msg.net_fn, ipmi::netfn::SENSOR_EVENT);
        assert_eq!(msg.cmd, 0x02);
        assert_eq!(
            &msg.data[..],
            &[0x04, 0x02, 3, 0x80 | 0x01, 0x57, 47, 50]
        );
        assert_eq!(msg.rs_sa, 0x20);
        assert_eq!(msg.rq_sa, 0x82);
    }
}
