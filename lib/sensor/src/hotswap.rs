// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FRU hot-swap sensor.
//!
//! PICMG models FRU lifecycle as M-states; every transition is announced
//! with a sensor-specific event on the hot-swap sensor whose offset is the
//! state just entered. Event data carries the cause and the state being
//! left, so the shelf can reconstruct the path.

use crate::PlatformEvent;

/// PICMG FRU Hot Swap sensor type.
pub const HOTSWAP_SENSOR_TYPE: u8 = 0xF0;

/// Sensor-specific event/reading type.
const EVENT_TYPE_SENSOR_SPECIFIC: u8 = 0x6F;

/// FRU lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MState {
    /// Not installed.
    M0 = 0,
    /// Inactive.
    M1 = 1,
    /// Activation in progress.
    M2 = 2,
    /// Active.
    M3 = 3,
    /// Deactivation in progress.
    M4 = 4,
    /// Communication lost.
    M5 = 5,
    /// Fault.
    M6 = 6,
}

/// Cause codes reported in hot-swap event data 2.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StateChangeCause {
    Normal = 0x0,
    ShelfCommand = 0x1,
    OperatorAction = 0x2,
    FruAction = 0x3,
    CommunicationLost = 0x4,
    Unknown = 0xF,
}

pub struct HotswapSensor {
    sensor_number: u8,
    fru_device_id: u8,
    state: MState,
}

impl HotswapSensor {
    pub fn new(sensor_number: u8, fru_device_id: u8) -> Self {
        Self {
            sensor_number,
            fru_device_id,
            // Absent until the handle/presence logic says otherwise.
            state: MState::M0,
        }
    }

    pub fn state(&self) -> MState {
        self.state
    }

    pub fn sensor_number(&self) -> u8 {
        self.sensor_number
    }

    /// Moves to `new_state`, producing the transition event. A no-op
    /// transition produces no event.
    pub fn transition(
        &mut self,
        new_state: MState,
        cause: StateChangeCause,
    ) -> Option<PlatformEvent> {
        if new_state == self.state {
            return None;
        }
        let previous = self.state;
        self.state = new_state;
        Some(PlatformEvent {
            assertion: true,
            offset: new_state as u8,
            sensor_type: HOTSWAP_SENSOR_TYPE,
            sensor_number: self.sensor_number,
            event_type: EVENT_TYPE_SENSOR_SPECIFIC,
            data: [
                // A0h: offset in data1, cause/previous state in data2.
                0xA0 | (new_state as u8 & 0x0F),
                ((cause as u8) << 4) | (previous as u8 & 0x0F),
                self.fru_device_id,
            ],
        })
    }
}
