// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Management-zone power sequencer driver.
//!
//! A management zone is a group of power enables the sequencer drives as
//! one unit: ON asserts them in ascending delay order, OFF deasserts in
//! descending delay order, and a hard fault in the zone's mask slams every
//! enable to its inactive level in hardware with no software in the loop.
//! Software's whole job is programming the per-enable control words and the
//! fault plumbing, then issuing commands and reading status back.
//!
//! Register map (32-bit word offsets from the device base):
//!
//! | offset | register |
//! |--------|----------|
//! | 0x00/0x01 | live hard-fault vector, low/high (RO) |
//! | 0x02      | aggregate power-enable logical states (RO) |
//! | per zone at `0x10 + zone * 0x30`: | |
//! | +0x00/+0x01 | hard-fault mask, low/high |
//! | +0x02       | fault holdoff, ms |
//! | +0x03       | command: 1 = ON sequence, 2 = OFF sequence, 3 = kill |
//! | +0x04       | status: 2-bit power state (RO) |
//! | +0x05       | soft-fault dispatch (WO) |
//! | +0x08..+0x28 | 32 enable control words |
//!
//! Control word: `[15:0]` delay in ms, `[16]` active level, `[17]` drive
//! enable. An all-zero word means "this enable is not controlled by this
//! zone".

#![cfg_attr(target_os = "none", no_std)]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

/// Enables per zone, fixed by the sequencer's register file.
pub const PEN_COUNT: usize = 32;

const GLOBAL_HF_LIVE_LO: usize = 0x00;
const GLOBAL_HF_LIVE_HI: usize = 0x01;
const GLOBAL_PEN_STATUS: usize = 0x02;

const ZONE_BASE: usize = 0x10;
const ZONE_STRIDE: usize = 0x30;
const ZONE_HF_MASK_LO: usize = 0x00;
const ZONE_HF_MASK_HI: usize = 0x01;
const ZONE_HOLDOFF: usize = 0x02;
const ZONE_COMMAND: usize = 0x03;
const ZONE_STATUS: usize = 0x04;
const ZONE_SOFT_FAULT: usize = 0x05;
const ZONE_PEN_BASE: usize = 0x08;

const CMD_PWR_ON_SEQ: u32 = 1;
const CMD_PWR_OFF_SEQ: u32 = 2;
const CMD_KILL: u32 = 3;

const PEN_ACTIVE_LEVEL: u32 = 1 << 16;
const PEN_DRIVE_ENABLED: u32 = 1 << 17;

/// Word-granular access to the sequencer register file. MMIO on the
/// target; tests substitute a register-array fake.
pub trait SeqBus {
    fn read(&self, word: usize) -> u32;
    fn write(&mut self, word: usize, value: u32);
}

/// Memory-mapped register file.
#[cfg(target_os = "none")]
pub struct MmioBus {
    base: *mut u32,
}

#[cfg(target_os = "none")]
impl MmioBus {
    /// # Safety
    ///
    /// `base` must be the mapped, word-aligned base of a management-zone
    /// sequencer register file, valid for the device's whole span.
    pub unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }
}

#[cfg(target_os = "none")]
impl SeqBus for MmioBus {
    fn read(&self, word: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.base.add(word)) }
    }
    fn write(&mut self, word: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.base.add(word), value) }
    }
}

/// Zone power state as encoded in the status register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum PowerState {
    On = 0,
    TransitionOn = 1,
    TransitionOff = 2,
    Off = 3,
}

/// Commanded transitions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerAction {
    /// Sequenced power-up, ascending delay order.
    On,
    /// Sequenced power-down, descending delay order.
    Off,
    /// Tristate every drive in one register write. Emergency/destructor
    /// path only.
    Kill,
}

/// One enable's configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputConfig {
    pub active_high: bool,
    pub drive_enabled: bool,
    /// Sequencing delay, ms. Enables rise in ascending and fall in
    /// descending delay order.
    pub enable_delay: u16,
}

impl OutputConfig {
    fn to_word(self) -> u32 {
        u32::from(self.enable_delay)
            | if self.active_high { PEN_ACTIVE_LEVEL } else { 0 }
            | if self.drive_enabled { PEN_DRIVE_ENABLED } else { 0 }
    }

    fn from_word(word: u32) -> Self {
        Self {
            active_high: word & PEN_ACTIVE_LEVEL != 0,
            drive_enabled: word & PEN_DRIVE_ENABLED != 0,
            enable_delay: word as u16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MzError {
    /// Zone index beyond the configured zone count.
    ZoneOutOfRange,
}

pub struct MgmtZoneCtrl<B: SeqBus> {
    bus: B,
    zone_count: u32,
}

impl<B: SeqBus> MgmtZoneCtrl<B> {
    pub fn new(bus: B, zone_count: u32) -> Self {
        Self { bus, zone_count }
    }

    pub fn zone_count(&self) -> u32 {
        self.zone_count
    }

    fn zone_word(&self, zone: u32, offset: usize) -> Result<usize, MzError> {
        if zone >= self.zone_count {
            return Err(MzError::ZoneOutOfRange);
        }
        Ok(ZONE_BASE + zone as usize * ZONE_STRIDE + offset)
    }

    /// Programs every enable control word for `zone`. Entries beyond
    /// `config.len()` are cleared (not controlled by this zone).
    pub fn set_pen_config(
        &mut self,
        zone: u32,
        config: &[OutputConfig],
    ) -> Result<(), MzError> {
        let base = self.zone_word(zone, ZONE_PEN_BASE)?;
        for pen in 0..PEN_COUNT {
            let word =
                config.get(pen).map(|c| c.to_word()).unwrap_or(0);
            self.bus.write(base + pen, word);
        }
        Ok(())
    }

    pub fn get_pen_config(
        &self,
        zone: u32,
    ) -> Result<[OutputConfig; PEN_COUNT], MzError> {
        let base = self.zone_word(zone, ZONE_PEN_BASE)?;
        let mut out = [OutputConfig::default(); PEN_COUNT];
        for (pen, slot) in out.iter_mut().enumerate() {
            *slot = OutputConfig::from_word(self.bus.read(base + pen));
        }
        Ok(out)
    }

    /// Sets the zone's hard-fault mask and the post-power-on holdoff
    /// during which faults are ignored.
    pub fn set_hardfault_mask(
        &mut self,
        zone: u32,
        mask: u64,
        holdoff_ms: u32,
    ) -> Result<(), MzError> {
        let lo = self.zone_word(zone, ZONE_HF_MASK_LO)?;
        let hi = self.zone_word(zone, ZONE_HF_MASK_HI)?;
        self.bus.write(lo, mask as u32);
        self.bus.write(hi, (mask >> 32) as u32);
        let holdoff = self.zone_word(zone, ZONE_HOLDOFF)?;
        self.bus.write(holdoff, holdoff_ms);
        Ok(())
    }

    pub fn get_hardfault_mask(&self, zone: u32) -> Result<u64, MzError> {
        let lo = self.zone_word(zone, ZONE_HF_MASK_LO)?;
        let hi = self.zone_word(zone, ZONE_HF_MASK_HI)?;
        Ok(u64::from(self.bus.read(lo))
            | (u64::from(self.bus.read(hi)) << 32))
    }

    pub fn set_power_state(
        &mut self,
        zone: u32,
        action: PowerAction,
    ) -> Result<(), MzError> {
        let command = self.zone_word(zone, ZONE_COMMAND)?;
        let value = match action {
            PowerAction::On => CMD_PWR_ON_SEQ,
            PowerAction::Off => CMD_PWR_OFF_SEQ,
            PowerAction::Kill => CMD_KILL,
        };
        self.bus.write(command, value);
        Ok(())
    }

    pub fn get_power_state(&self, zone: u32) -> Result<PowerState, MzError> {
        let status = self.zone_word(zone, ZONE_STATUS)?;
        let raw = self.bus.read(status) & 0x3;
        // The mask above makes every value decodable.
        Ok(PowerState::from_u32(raw).unwrap_or(PowerState::Off))
    }

    /// Kills every zone as near-simultaneously as the bus allows. One
    /// register write per zone, under a critical section so nothing can
    /// interleave a power-up between them.
    pub fn kill_all(&mut self) {
        critical_section::with(|_| {
            for zone in 0..self.zone_count {
                if let Ok(command) = self.zone_word(zone, ZONE_COMMAND) {
                    self.bus.write(command, CMD_KILL);
                }
            }
        });
    }

    /// Dispatches a soft (software-originated) fault to `zone`.
    pub fn dispatch_soft_fault(&mut self, zone: u32) -> Result<(), MzError> {
        let reg = self.zone_word(zone, ZONE_SOFT_FAULT)?;
        self.bus.write(reg, 1);
        Ok(())
    }

    /// The live hard-fault input vector, shared by all zones.
    pub fn get_hard_fault_status(&self) -> u64 {
        u64::from(self.bus.read(GLOBAL_HF_LIVE_LO))
            | (u64::from(self.bus.read(GLOBAL_HF_LIVE_HI)) << 32)
    }

    /// Aggregate logical state of every power enable.
    pub fn get_pen_status(&self) -> u32 {
        self.bus.read(GLOBAL_PEN_STATUS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Register-array fake with just enough sequencer behavior: a command
    /// write lands the zone in the corresponding settled state.
    struct FakeBus {
        words: Vec<u32>,
    }

    impl FakeBus {
        fn new() -> Self {
            Self {
                words: vec![0; 0x10 + 4 * ZONE_STRIDE],
            }
        }
    }

    impl SeqBus for FakeBus {
        fn read(&self, word: usize) -> u32 {
            self.words[word]
        }
        fn write(&mut self, word: usize, value: u32) {
            self.words[word] = value;
            // Command register: settle status immediately.
            if word >= ZONE_BASE
                && (word - ZONE_BASE) % ZONE_STRIDE == ZONE_COMMAND
            {
                let status = word - ZONE_COMMAND + ZONE_STATUS;
                self.words[status] = match value {
                    CMD_PWR_ON_SEQ => PowerState::On as u32,
                    _ => PowerState::Off as u32,
                };
            }
        }
    }

    fn ctrl() -> MgmtZoneCtrl<FakeBus> {
        let mut ctrl = MgmtZoneCtrl::new(FakeBus::new(), 2);
        // Fake powers up "off".
        for zone in 0..2 {
            ctrl.bus.words
                [ZONE_BASE + zone * ZONE_STRIDE + ZONE_STATUS] =
                PowerState::Off as u32;
        }
        ctrl
    }

    #[test]
    fn pen_config_round_trips_and_clears_tail() {
        let mut ctrl = ctrl();
        let config = [
            OutputConfig {
                active_high: true,
                drive_enabled: true,
                enable_delay: 10,
            },
            OutputConfig {
                active_high: false,
                drive_enabled: true,
                enable_delay: 500,
            },
        ];
        ctrl.set_pen_config(0, &config).unwrap();
        let read_back = ctrl.get_pen_config(0).unwrap();
        assert_eq!(&read_back[..2], &config[..]);
        assert_eq!(read_back[2], OutputConfig::default());

        // Word encoding: delay low, level bit 16, drive bit 17.
        let word = ctrl.bus.words[ZONE_BASE + ZONE_PEN_BASE];
        assert_eq!(word, 10 | (1 << 16) | (1 << 17));
    }

    #[test]
    fn hardfault_mask_spans_two_words() {
        let mut ctrl = ctrl();
        ctrl.set_hardfault_mask(1, 0x0000_0005_8000_0001, 140).unwrap();
        assert_eq!(
            ctrl.get_hardfault_mask(1).unwrap(),
            0x0000_0005_8000_0001
        );
        assert_eq!(
            ctrl.bus.words[ZONE_BASE + ZONE_STRIDE + ZONE_HOLDOFF],
            140
        );
    }

    #[test]
    fn power_commands_reach_the_command_register() {
        let mut ctrl = ctrl();
        assert_eq!(ctrl.get_power_state(0).unwrap(), PowerState::Off);
        ctrl.set_power_state(0, PowerAction::On).unwrap();
        assert_eq!(ctrl.get_power_state(0).unwrap(), PowerState::On);
        ctrl.set_power_state(0, PowerAction::Off).unwrap();
        assert_eq!(ctrl.get_power_state(0).unwrap(), PowerState::Off);
    }

    #[test]
    fn kill_all_writes_every_zone() {
        let mut ctrl = ctrl();
        ctrl.set_power_state(0, PowerAction::On).unwrap();
        ctrl.set_power_state(1, PowerAction::On).unwrap();
        ctrl.kill_all();
        for zone in 0..2 {
            assert_eq!(
                ctrl.bus.words
                    [ZONE_BASE + zone as usize * ZONE_STRIDE + ZONE_COMMAND],
                CMD_KILL
            );
            assert_eq!(
                ctrl.get_power_state(zone).unwrap(),
                PowerState::Off
            );
        }
    }

    #[test]
    fn zone_bounds_are_enforced() {
        let mut ctrl = ctrl();
        assert_eq!(
            ctrl.set_power_state(2, PowerAction::On),
            Err(MzError::ZoneOutOfRange)
        );
        assert_eq!(ctrl.get_power_state(7), Err(MzError::ZoneOutOfRange));
    }

    #[test]
    fn global_status_registers_read_through() {
        let mut ctrl = ctrl();
        ctrl.bus.words[GLOBAL_HF_LIVE_LO] = 0x21;
        ctrl.bus.words[GLOBAL_HF_LIVE_HI] = 0x1;
        ctrl.bus.words[GLOBAL_PEN_STATUS] = 0x3F;
        assert_eq!(ctrl.get_hard_fault_status(), 0x0000_0001_0000_0021);
        assert_eq!(ctrl.get_pen_status(), 0x3F);
    }
}
