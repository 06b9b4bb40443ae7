// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The FRU lifecycle (M-state) machine.
//!
//! States: M0 absent, M1 inactive, M2 activation in progress, M3 active,
//! M4 deactivation in progress, M5 communication lost, M6 fault.
//! Transitions come from three places: the hot-swap handle GPIO, the
//! payload manager's activation/deactivation completion callbacks, and the
//! shelf manager's Set FRU Activation command. Every accepted transition
//! produces a hot-swap sensor event whose offset is the state entered.

use sensor::{HotswapSensor, MState, PlatformEvent, StateChangeCause};

/// Inputs that can move the machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MStateInput {
    /// FRU presence established (power-on, insertion detected).
    FruInserted,
    /// Hot-swap handle latched closed.
    HandleClosed,
    /// Hot-swap handle opened.
    HandleOpened,
    /// Shelf manager Set FRU Activation: activate.
    ShelfActivate,
    /// Shelf manager Set FRU Activation: deactivate.
    ShelfDeactivate,
    /// Payload manager finished bringing the payload up.
    ActivationComplete,
    /// Payload manager finished taking the payload down.
    DeactivationComplete,
    /// Shelf heartbeat lost.
    CommunicationLost,
    /// Shelf heartbeat restored.
    CommunicationRestored,
    /// Unrecoverable payload fault.
    Fault,
}

pub struct MStateMachine {
    sensor: HotswapSensor,
}

impl MStateMachine {
    pub fn new(sensor_number: u8, fru_device_id: u8) -> Self {
        Self {
            sensor: HotswapSensor::new(sensor_number, fru_device_id),
        }
    }

    pub fn state(&self) -> MState {
        self.sensor.state()
    }

    /// Applies one input. Returns the transition event if the input was
    /// meaningful in the current state; inputs that don't apply (a
    /// completion callback arriving out of order, a repeated handle edge)
    /// are ignored rather than faulted — the bus retries make them
    /// routine.
    pub fn input(&mut self, input: MStateInput) -> Option<PlatformEvent> {
        use MState::*;
        use MStateInput::*;

        let (next, cause) = match (self.sensor.state(), input) {
            (M0, FruInserted) => (M1, StateChangeCause::Normal),
            (M1, HandleClosed) => (M2, StateChangeCause::OperatorAction),
            (M1, ShelfActivate) => (M2, StateChangeCause::ShelfCommand),
            (M2, ActivationComplete) => (M3, StateChangeCause::Normal),
            (M3, HandleOpened) => (M4, StateChangeCause::OperatorAction),
            (M3, ShelfDeactivate) => (M4, StateChangeCause::ShelfCommand),
            (M4, DeactivationComplete) => (M1, StateChangeCause::Normal),
            // Activation abandoned mid-flight: the handle reopened.
            (M2, HandleOpened) => (M4, StateChangeCause::OperatorAction),
            (M1 | M2 | M3 | M4, CommunicationLost) => {
                (M5, StateChangeCause::CommunicationLost)
            }
            (M5, CommunicationRestored) => (M1, StateChangeCause::Normal),
            (_, Fault) => (M6, StateChangeCause::FruAction),
            _ => return None,
        };
        self.sensor.transition(next, cause)
    }
}
