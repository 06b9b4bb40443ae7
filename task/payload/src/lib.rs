// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The payload manager.
//!
//! Binds three things together: the shelf manager's power negotiation
//! (PICMG Get/Set Power Level over IPMI), the management-zone sequencer
//! that actually moves the rails, and the M-state machine that narrates
//! FRU lifecycle to the world. It also owns the board's E-keying link
//! table and the ADC-fed threshold sensors, whose event context follows
//! zone power: a sensor inside a dark zone is out of context and holds its
//! tongue instead of screaming about a rail that is off on purpose.
//!
//! Power-level changes run the zones in dependency order: power-down
//! walks the shutdown list (leaf zones first) with the configured settle
//! delay after each, power-up walks it in reverse. Completion is reported
//! to the M-state machine, whose transition event goes out on the hot-swap
//! sensor.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod commands;
mod ekey;
mod mstate;

pub use ekey::{LinkDescriptor, LinkTable};
pub use mstate::{MStateInput, MStateMachine};

use alloc::boxed::Box;
use alloc::vec::Vec;

use drv_mgmt_zone::{
    MgmtZoneCtrl, MzError, OutputConfig, PowerAction, PowerState, SeqBus,
};
use osal::Ticks;
use ringlog::TraceBuf;
use sdr::{Record, SdrRepository};
use sensor::{PlatformEvent, ThresholdSensor, ALL_EVENTS};

/// How long a sensor reading stays fresh before it reads as unavailable.
pub const SENSOR_MAX_AGE: Ticks = 5 * osal::TICK_HZ;

/// Static power description of the board, set by the platform.
#[derive(Clone, Debug)]
pub struct PowerConfig {
    pub spanned_slots: u8,
    pub controller_location: u8,
    pub dynamic_reconfiguration: bool,
    /// Tenths of a second until power is stable after enable.
    pub delay_to_stable_power: u8,
    /// Watts represented by one power-level unit.
    pub power_multiplier: u8,
    /// Power draw at level 1..=N, in multiplier units, increasing.
    pub power_levels: Vec<u8>,
    /// Early (pre-negotiation) draw levels, same shape.
    pub early_power_levels: Vec<u8>,
}

/// Negotiated power state, served to Get Power Level.
#[derive(Clone, Debug)]
pub struct PowerProperties {
    pub spanned_slots: u8,
    pub controller_location: u8,
    pub dynamic_reconfiguration: bool,
    pub current_power_level: u8,
    pub desired_power_level: u8,
    pub delay_to_stable_power: u8,
    pub power_multiplier: u8,
    pub power_levels: Vec<u8>,
    pub early_power_levels: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadError {
    /// This controller manages FRU 0 only.
    UnknownFru,
    /// Level beyond the advertised table.
    UnsupportedPowerLevel(u8),
    /// Power levels not monotonically increasing, or more than 20.
    InvalidPowerConfig,
    Zone(MzError),
}

impl From<MzError> for PayloadError {
    fn from(e: MzError) -> Self {
        PayloadError::Zone(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    PowerLevel(u8),
    ZoneCommand { zone: u32, on: bool },
    ZoneFault(u32),
    EmergencyKill,
}

/// One zone's position in the shutdown order, with the settle time the
/// sequencer needs after the OFF command (its largest enable delay).
#[derive(Copy, Clone, Debug)]
pub struct ZonePlan {
    pub zone: u32,
    pub off_settle_ms: u32,
}

/// The reading source behind a managed sensor, in engineering units.
/// `None` when the hardware could not produce a reading this cycle.
pub trait AdcReader: Send {
    fn read(&mut self) -> Option<f32>;
}

/// A threshold sensor bound to an ADC channel and, optionally, to the
/// management zone whose power gates its meaning.
pub struct ManagedSensor {
    sensor: ThresholdSensor,
    reader: Box<dyn AdcReader>,
    zone: Option<u32>,
    sdr_key: [u8; 3],
    last_raw: Option<u8>,
}

impl ManagedSensor {
    pub fn new(
        sensor_number: u8,
        sensor_type: u8,
        owner_addr: u8,
        owner_lun: u8,
        reader: Box<dyn AdcReader>,
        zone: Option<u32>,
    ) -> Self {
        Self {
            sensor: ThresholdSensor::new(sensor_number, sensor_type),
            reader,
            zone,
            sdr_key: [owner_addr, owner_lun, sensor_number],
            last_raw: None,
        }
    }
}

/// A Get Sensor Reading answer, before IPMI encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SensorReading {
    pub raw: Option<u8>,
    pub event_status: u16,
}

pub struct PayloadManager<B: SeqBus> {
    zones: MgmtZoneCtrl<B>,
    shutdown_order: Vec<ZonePlan>,
    properties: PowerProperties,
    mstate: MStateMachine,
    links: LinkTable,
    sensors: Vec<ManagedSensor>,
    trace: TraceBuf<Trace, 32>,
}

impl<B: SeqBus> PayloadManager<B> {
    pub fn new(
        zones: MgmtZoneCtrl<B>,
        shutdown_order: Vec<ZonePlan>,
        config: PowerConfig,
        mstate: MStateMachine,
        links: LinkTable,
    ) -> Result<Self, PayloadError> {
        if config.power_levels.len() > 20
            || config.early_power_levels.len() > 20
            || !config.power_levels.windows(2).all(|w| w[0] < w[1])
        {
            return Err(PayloadError::InvalidPowerConfig);
        }
        let properties = PowerProperties {
            spanned_slots: config.spanned_slots,
            controller_location: config.controller_location,
            dynamic_reconfiguration: config.dynamic_reconfiguration,
            current_power_level: 0,
            // The board wants to run: the highest level is the desire.
            desired_power_level: config.power_levels.len() as u8,
            delay_to_stable_power: config.delay_to_stable_power,
            power_multiplier: config.power_multiplier,
            power_levels: config.power_levels,
            early_power_levels: config.early_power_levels,
        };
        Ok(Self {
            zones,
            shutdown_order,
            properties,
            mstate,
            links,
            sensors: Vec::new(),
            trace: TraceBuf::new(),
        })
    }

    fn check_fru(fru: u8) -> Result<(), PayloadError> {
        if fru != 0 {
            return Err(PayloadError::UnknownFru);
        }
        Ok(())
    }

    /// Passthrough zone configuration for platform bring-up.
    pub fn configure_zone(
        &mut self,
        zone: u32,
        pen_config: &[OutputConfig],
        hardfault_mask: u64,
        holdoff_ms: u32,
    ) -> Result<(), PayloadError> {
        self.zones.set_pen_config(zone, pen_config)?;
        self.zones
            .set_hardfault_mask(zone, hardfault_mask, holdoff_ms)?;
        Ok(())
    }

    /// Current power properties; `recompute` refreshes anything derived.
    /// Nothing here is dynamic today, so recompute just re-asserts the
    /// desire for full power.
    pub fn get_power_properties(
        &mut self,
        fru: u8,
        recompute: bool,
    ) -> Result<PowerProperties, PayloadError> {
        Self::check_fru(fru)?;
        if recompute {
            self.properties.desired_power_level =
                self.properties.power_levels.len() as u8;
        }
        Ok(self.properties.clone())
    }

    /// Applies a negotiated power level. Level 0 shuts the zones down in
    /// dependency order with their settle delays; any supported non-zero
    /// level brings them up in reverse order. The returned event is the
    /// M-state transition, if one occurred.
    pub fn set_power_level(
        &mut self,
        fru: u8,
        level: u8,
        sleep: &mut dyn FnMut(u32),
    ) -> Result<Option<PlatformEvent>, PayloadError> {
        Self::check_fru(fru)?;
        if usize::from(level) > self.properties.power_levels.len() {
            return Err(PayloadError::UnsupportedPowerLevel(level));
        }
        self.properties.current_power_level = level;
        self.trace.entry(Trace::PowerLevel(level));

        if level == 0 {
            for i in 0..self.shutdown_order.len() {
                let plan = self.shutdown_order[i];
                self.zones.set_power_state(plan.zone, PowerAction::Off)?;
                self.trace.entry(Trace::ZoneCommand {
                    zone: plan.zone,
                    on: false,
                });
                sleep(plan.off_settle_ms);
            }
            Ok(self.mstate.input(MStateInput::DeactivationComplete))
        } else {
            for i in (0..self.shutdown_order.len()).rev() {
                let plan = self.shutdown_order[i];
                self.zones.set_power_state(plan.zone, PowerAction::On)?;
                self.trace.entry(Trace::ZoneCommand {
                    zone: plan.zone,
                    on: true,
                });
            }
            Ok(self.mstate.input(MStateInput::ActivationComplete))
        }
    }

    /// Emergency stop: tristate every enable in every zone, now.
    pub fn emergency_shutdown(&mut self) {
        self.trace.entry(Trace::EmergencyKill);
        self.properties.current_power_level = 0;
        self.zones.kill_all();
    }

    /// Feeds an M-state trigger through and returns the transition event.
    pub fn mstate_input(
        &mut self,
        input: MStateInput,
    ) -> Option<PlatformEvent> {
        self.mstate.input(input)
    }

    pub fn mstate(&self) -> sensor::MState {
        self.mstate.state()
    }

    pub fn links(&mut self) -> &mut LinkTable {
        &mut self.links
    }

    pub fn add_sensor(&mut self, sensor: ManagedSensor) {
        self.sensors.push(sensor);
    }

    /// Detects a zone that the hardware killed behind our back (hard
    /// fault): we believe we are powered, the sequencer says otherwise.
    /// Records the fault and moves the FRU to M6.
    pub fn poll_zone_faults(&mut self) -> Option<PlatformEvent> {
        if self.properties.current_power_level == 0 {
            return None;
        }
        for plan in &self.shutdown_order {
            if self.zones.get_power_state(plan.zone)
                == Ok(PowerState::Off)
            {
                self.trace.entry(Trace::ZoneFault(plan.zone));
                self.properties.current_power_level = 0;
                return self.mstate.input(MStateInput::Fault);
            }
        }
        None
    }

    /// One refresh cycle over every managed sensor. The SDR for each is
    /// looked up by key, never cached, so repository edits apply on the
    /// next cycle.
    pub fn poll_sensors(
        &mut self,
        repo: &SdrRepository,
        now: Ticks,
    ) -> Vec<PlatformEvent> {
        let mut out = Vec::new();
        for managed in &mut self.sensors {
            let in_context = match managed.zone {
                None => ALL_EVENTS,
                Some(zone) => {
                    if self.zones.get_power_state(zone)
                        == Ok(PowerState::On)
                    {
                        ALL_EVENTS
                    } else {
                        0
                    }
                }
            };
            let Some(Record::FullSensor(record)) =
                repo.find(&managed.sdr_key)
            else {
                continue;
            };
            let reading = managed.reader.read();
            managed.last_raw =
                reading.map(|value| record.from_float(value));
            out.extend(managed.sensor.update(
                record,
                reading,
                now,
                in_context,
                SENSOR_MAX_AGE,
                0,
                0,
            ));
        }
        out
    }

    pub fn sensor_reading(&self, sensor_number: u8) -> Option<SensorReading> {
        self.sensors
            .iter()
            .find(|m| m.sensor.sensor_number() == sensor_number)
            .map(|m| SensorReading {
                raw: m.last_raw,
                event_status: m.sensor.event_status(),
            })
    }

    pub fn rearm_sensor(&mut self, sensor_number: u8) -> bool {
        for managed in &mut self.sensors {
            if managed.sensor.sensor_number() == sensor_number {
                managed.sensor.rearm();
                return true;
            }
        }
        false
    }
}

/// The periodic sensor refresh task body.
pub fn sensor_refresh_loop<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    repo: &osal::Mutex<SdrRepository>,
    tx: &dyn ipmi::MsgSender,
    own_addr: u8,
    event_receiver: u8,
    period_ticks: u32,
) -> ! {
    loop {
        osal::sleep(period_ticks);
        let now = osal::now();
        let mut events = Vec::new();
        {
            let mut payload = payload.lock();
            if let Some(event) = payload.poll_zone_faults() {
                events.push(event);
            }
            let repo = repo.lock();
            events.extend(payload.poll_sensors(&repo, now));
        }
        for event in events {
            tx.send(event.into_msg(own_addr, event_receiver), None);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A fake sequencer register file with just enough behavior: a zone
    /// command write settles the status register instantly.
    pub struct FakeBus {
        pub words: Vec<u32>,
    }

    impl SeqBus for FakeBus {
        fn read(&self, word: usize) -> u32 {
            self.words[word]
        }
        fn write(&mut self, word: usize, value: u32) {
            self.words[word] = value;
            if word >= 0x10 && (word - 0x10) % 0x30 == 0x03 {
                self.words[word + 1] = match value {
                    1 => 0, // ON
                    _ => 3, // OFF
                };
            }
        }
    }

    pub fn zones() -> MgmtZoneCtrl<FakeBus> {
        let mut bus = FakeBus {
            words: vec![0; 0x10 + 2 * 0x30],
        };
        // Both zones idle OFF.
        bus.words[0x10 + 0x04] = 3;
        bus.words[0x10 + 0x30 + 0x04] = 3;
        MgmtZoneCtrl::new(bus, 2)
    }

    pub fn manager() -> PayloadManager<FakeBus> {
        PayloadManager::new(
            zones(),
            // Zone 1 (payload computer) drops first, then zone 0 (the
            // network back end), per the deactivation scenario.
            vec![
                ZonePlan {
                    zone: 1,
                    off_settle_ms: 50,
                },
                ZonePlan {
                    zone: 0,
                    off_settle_ms: 40,
                },
            ],
            PowerConfig {
                spanned_slots: 1,
                controller_location: 0,
                dynamic_reconfiguration: true,
                delay_to_stable_power: 0,
                power_multiplier: 1,
                power_levels: vec![65],
                early_power_levels: vec![65],
            },
            MStateMachine::new(0, 0),
            LinkTable::new(),
        )
        .unwrap()
    }

    /// Walks the M-state machine into M3 so deactivation means something.
    pub fn activate(mgr: &mut PayloadManager<FakeBus>) {
        mgr.mstate_input(MStateInput::FruInserted);
        mgr.mstate_input(MStateInput::HandleClosed);
        let mut sleep = |_ms: u32| {};
        mgr.set_power_level(0, 1, &mut sleep).unwrap();
        assert_eq!(mgr.mstate(), sensor::MState::M3);
    }
}
