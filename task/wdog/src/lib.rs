// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fail-secure multi-slot software watchdog.
//!
//! The hardware reset timer fires 5 seconds after its last restart; a
//! supervisor pass runs once per second and restarts it only when every
//! registered slot checks out and the canary agreement holds. Slot state is
//! deliberately hostile to corruption: the enable field is only valid as
//! all-ones or all-zeros, and both the configuration and the timeout carry
//! complement-XOR checksums under a compile-time key. Any single bit flip
//! in a slot record or the canary leaves the watchdog unserviced, and the
//! machine reboots within 5 seconds.
//!
//! Nothing here tries to recover. Corruption latches, the `on_trip` hook
//! runs once (to flush whatever diagnostics can be flushed), and the
//! supervisor parks until the reset takes the system.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;

use critical_section::Mutex;
use osal::Ticks;
use ringlog::TraceBuf;

/// Supervisor cadence: once per second against a 5-second hardware timer.
pub const SUPERVISOR_PERIOD: u32 = osal::TICK_HZ as u32;

/// The live canary value, stored shifted so the expected constant never
/// appears in the binary image verbatim.
const GLOBAL_CANARY_LSHIFTED1: u32 = 0x87D6_4518;
const GLOBAL_CANARY_RSHIFTED1: u32 = 0x21F5_9146;
const GLOBAL_CANARY_COMPLEMENT: u32 = !(GLOBAL_CANARY_LSHIFTED1 >> 1);

/// Key component of the slot checksums, also stored shifted.
const SLOT_KEY_LSHIFTED1: u64 = 0x09B0_B3BE_EE93_1A24;

/// Callers must pass `DEACTIVATE_CODE_LSHIFTED1 >> 1` to deactivate a
/// slot; anything else is treated as corruption of the caller.
pub const DEACTIVATE_CODE_LSHIFTED1: u32 = 0x5080_30A4;

/// The hardware reset timer. Once started it must be restarted at least
/// every 5 seconds or the reset line fires.
pub trait ResetTimer: Send {
    fn start(&mut self);
    fn restart(&mut self);
}

/// Opaque slot handle: `0x8000_0000 | id<<24 | (!id & 0xFF)<<16 | id`.
pub type SlotHandle = u32;

fn encode_handle(slotid: u8) -> SlotHandle {
    0x8000_0000
        | (u32::from(slotid) << 24)
        | (u32::from(!slotid) << 16)
        | u32::from(slotid)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WdogError {
    /// Handle malformed or slot id beyond the configured count.
    OutOfRange,
    /// Every slot is registered.
    NoFreeSlots,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    SlotActivated(u8),
    SlotDeactivated(u8),
    ConfigCksumMismatch(u8),
    TimeoutCksumMismatch(u8),
    EnableInvalid(u8),
    TimeoutExpired(u8),
    IllegalDeactivateCode(u8),
    ServiceStopped,
}

struct WdtSlot {
    /// `u32::MAX` when live, 0 when disabled; anything else is corruption.
    enabled: u32,
    lifetime: u32,
    timeout: Ticks,
    config_cksum: u64,
    timeout_cksum: u64,
    last_serviced_by: heapless::String<16>,
}

impl WdtSlot {
    fn expected_config_cksum(&self) -> u64 {
        !((u64::from(self.enabled) << 32) | u64::from(self.lifetime))
            ^ (SLOT_KEY_LSHIFTED1 >> 1)
    }

    fn expected_timeout_cksum(&self) -> u64 {
        !self.timeout ^ (SLOT_KEY_LSHIFTED1 >> 1)
    }

    fn seal_config(&mut self) {
        self.config_cksum = self.expected_config_cksum();
    }

    fn seal_timeout(&mut self) {
        self.timeout_cksum = self.expected_timeout_cksum();
    }
}

struct Table {
    slots: Vec<WdtSlot>,
    free_slot: u8,
    canary: u32,
    on_trip: Option<Box<dyn FnMut() + Send>>,
    trace: TraceBuf<Trace, 32>,
}

pub struct WatchdogScheduler<R: ResetTimer> {
    table: Mutex<RefCell<Table>>,
    timer: Mutex<RefCell<R>>,
}

impl<R: ResetTimer> WatchdogScheduler<R> {
    pub fn new(
        num_slots: u8,
        timer: R,
        on_trip: Option<Box<dyn FnMut() + Send>>,
    ) -> Self {
        let mut slots = Vec::with_capacity(usize::from(num_slots));
        for _ in 0..num_slots {
            let mut slot = WdtSlot {
                enabled: 0,
                lifetime: 0,
                timeout: 0,
                config_cksum: 0,
                timeout_cksum: 0,
                last_serviced_by: heapless::String::new(),
            };
            slot.seal_config();
            slot.seal_timeout();
            slots.push(slot);
        }
        Self {
            table: Mutex::new(RefCell::new(Table {
                slots,
                free_slot: 0,
                canary: GLOBAL_CANARY_LSHIFTED1 >> 1,
                on_trip,
                trace: TraceBuf::new(),
            })),
            timer: Mutex::new(RefCell::new(timer)),
        }
    }

    /// Allocates a slot with the given lifetime in ticks. The slot comes
    /// back inactive; `activate_slot` arms it.
    pub fn register_slot(
        &self,
        lifetime: u32,
    ) -> Result<SlotHandle, WdogError> {
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            if usize::from(table.free_slot) >= table.slots.len() {
                return Err(WdogError::NoFreeSlots);
            }
            let slotid = table.free_slot;
            table.free_slot += 1;
            let slot = &mut table.slots[usize::from(slotid)];
            slot.enabled = 0;
            slot.lifetime = lifetime;
            slot.seal_config();
            slot.seal_timeout();
            Ok(encode_handle(slotid))
        })
    }

    fn decode_handle(
        table: &Table,
        handle: SlotHandle,
    ) -> Result<u8, WdogError> {
        let slotid = (handle & 0xFF) as u8;
        if handle != encode_handle(slotid)
            || usize::from(slotid) >= table.slots.len()
        {
            return Err(WdogError::OutOfRange);
        }
        Ok(slotid)
    }

    /// Enables and services the slot in one step.
    pub fn activate_slot(
        &self,
        handle: SlotHandle,
        now: Ticks,
    ) -> Result<(), WdogError> {
        let name = osal::current_task_name();
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            let slotid = Self::decode_handle(&table, handle)?;
            Self::verify_config(&mut table, slotid);
            let slot = &mut table.slots[usize::from(slotid)];
            slot.enabled = u32::MAX;
            slot.seal_config();
            slot.timeout = now.saturating_add(u64::from(slot.lifetime));
            slot.seal_timeout();
            slot.last_serviced_by = name.clone();
            table.trace.entry(Trace::SlotActivated(slotid));
            Ok(())
        })
    }

    /// Refreshes the slot's deadline.
    pub fn service_slot(
        &self,
        handle: SlotHandle,
        now: Ticks,
    ) -> Result<(), WdogError> {
        let name = osal::current_task_name();
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            let slotid = Self::decode_handle(&table, handle)?;
            Self::verify_config(&mut table, slotid);
            Self::verify_timeout(&mut table, slotid);
            let slot = &mut table.slots[usize::from(slotid)];
            slot.timeout = now.saturating_add(u64::from(slot.lifetime));
            slot.seal_timeout();
            slot.last_serviced_by = name.clone();
            Ok(())
        })
    }

    /// Disables the slot. `code` must be `DEACTIVATE_CODE_LSHIFTED1 >> 1`;
    /// a wrong code latches corruption — a caller that cannot produce the
    /// code is itself suspect.
    pub fn deactivate_slot(
        &self,
        handle: SlotHandle,
        code: u32,
    ) -> Result<(), WdogError> {
        let name = osal::current_task_name();
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            let slotid = Self::decode_handle(&table, handle)?;
            if code != DEACTIVATE_CODE_LSHIFTED1 >> 1 {
                Self::latch(
                    &mut table,
                    Trace::IllegalDeactivateCode(slotid),
                );
            }
            Self::verify_config(&mut table, slotid);
            let slot = &mut table.slots[usize::from(slotid)];
            slot.enabled = 0;
            slot.seal_config();
            slot.last_serviced_by = name.clone();
            table.trace.entry(Trace::SlotDeactivated(slotid));
            Ok(())
        })
    }

    fn latch(table: &mut Table, reason: Trace) {
        if table.canary != 0 {
            table.canary = 0;
            table.trace.entry(reason);
            table.trace.entry(Trace::ServiceStopped);
        }
    }

    fn verify_config(table: &mut Table, slotid: u8) {
        let slot = &table.slots[usize::from(slotid)];
        if slot.config_cksum != slot.expected_config_cksum() {
            Self::latch(table, Trace::ConfigCksumMismatch(slotid));
        }
    }

    fn verify_timeout(table: &mut Table, slotid: u8) {
        let slot = &table.slots[usize::from(slotid)];
        if slot.timeout_cksum != slot.expected_timeout_cksum() {
            Self::latch(table, Trace::TimeoutCksumMismatch(slotid));
        }
    }

    /// One supervisor pass. Restarts the hardware timer and returns true
    /// only when every slot and the canary agreement check out; otherwise
    /// runs the trip hook (once) and returns false, forever.
    pub fn supervise(&self, now: Ticks) -> bool {
        let (healthy, tripped_hook) = critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            for slotid in 0..table.slots.len() as u8 {
                Self::verify_config(&mut table, slotid);
                Self::verify_timeout(&mut table, slotid);
                let slot = &table.slots[usize::from(slotid)];
                if slot.enabled == 0 {
                    continue;
                }
                if slot.enabled != u32::MAX {
                    Self::latch(&mut table, Trace::EnableInvalid(slotid));
                    continue;
                }
                if table.slots[usize::from(slotid)].timeout < now {
                    Self::latch(&mut table, Trace::TimeoutExpired(slotid));
                }
            }

            // Three-way canary agreement: the live value must equal both
            // shifted images of the constant and the complement's inverse.
            let canary = table.canary;
            let healthy = canary == GLOBAL_CANARY_LSHIFTED1 >> 1
                && canary == GLOBAL_CANARY_RSHIFTED1 << 1
                && canary == !GLOBAL_CANARY_COMPLEMENT;
            let hook = if healthy { None } else { table.on_trip.take() };
            (healthy, hook)
        });

        if healthy {
            critical_section::with(|cs| {
                self.timer.borrow_ref_mut(cs).restart();
            });
        } else if let Some(mut hook) = tripped_hook {
            // First unhealthy pass: flush diagnostics while we still can.
            hook();
        }
        healthy
    }

    /// The supervisor task body: start the hardware timer, then service it
    /// at 1 Hz until the system is no longer trustworthy, then park and
    /// let the reset happen.
    pub fn run(&self) -> ! {
        critical_section::with(|cs| {
            self.timer.borrow_ref_mut(cs).start();
        });
        loop {
            osal::sleep(SUPERVISOR_PERIOD);
            if !self.supervise(osal::now()) {
                break;
            }
        }
        loop {
            osal::sleep(u32::MAX);
        }
    }

    /// Test access: flip bits in a slot record to emulate memory damage.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn corrupt_timeout_for_test(&self, handle: SlotHandle, bit: u8) {
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            let slotid = (handle & 0xFF) as usize;
            table.slots[slotid].timeout ^= 1 << bit;
        });
    }
}
