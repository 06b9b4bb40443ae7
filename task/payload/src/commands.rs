// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PICMG (netFn 2Ch) and Sensor/Event (netFn 04h) command handlers.
//!
//! Every PICMG request leads with the PICMG identifier byte (00h) and
//! every response echoes it right after the completion code. M-state
//! transitions triggered here produce hot-swap events, which go out to the
//! event receiver through the same transport the reply does.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use drv_mgmt_zone::SeqBus;
use ipmi::{
    cmd::picmg, cmd::sensor_event, netfn, CommandRouter, CompletionCode,
    Msg, MsgSender, PICMG_IDENTIFIER,
};
use sensor::PlatformEvent;

use crate::{ekey::LinkDescriptor, MStateInput, PayloadError, PayloadManager};

/// PICMG extension version reported by Get PICMG Properties (2.2).
const PICMG_EXTENSION_VERSION: u8 = 0x22;

/// Where hot-swap and threshold events are sent.
#[derive(Copy, Clone, Debug)]
pub struct EventAddressing {
    pub own_addr: u8,
    pub event_receiver: u8,
}

fn completion_for(e: PayloadError) -> CompletionCode {
    match e {
        PayloadError::UnknownFru
        | PayloadError::UnsupportedPowerLevel(_) => {
            CompletionCode::ParameterOutOfRange
        }
        PayloadError::InvalidPowerConfig => {
            CompletionCode::InvalidDataField
        }
        PayloadError::Zone(_) => CompletionCode::UnspecifiedError,
    }
}

fn send_event(
    tx: &dyn MsgSender,
    addressing: EventAddressing,
    event: Option<PlatformEvent>,
) {
    if let Some(event) = event {
        tx.send(
            event.into_msg(addressing.own_addr, addressing.event_receiver),
            None,
        );
    }
}

/// Registers the PICMG FRU-control, power-negotiation, and E-keying
/// handlers.
pub fn register_picmg_handlers<B: SeqBus + Send + 'static>(
    router: &mut CommandRouter,
    payload: &Arc<osal::Mutex<PayloadManager<B>>>,
    addressing: EventAddressing,
) {
    type PicmgHandler<B> = fn(
        &osal::Mutex<PayloadManager<B>>,
        EventAddressing,
        &dyn MsgSender,
        &Msg,
        &[u8],
    ) -> Msg;

    let commands: [(u8, PicmgHandler<B>); 7] = [
        (picmg::GET_PICMG_PROPERTIES, picmg_properties),
        (picmg::SET_FRU_ACTIVATION, set_fru_activation),
        (picmg::SET_PORT_STATE, set_port_state),
        (picmg::GET_PORT_STATE, get_port_state),
        (picmg::COMPUTE_POWER_PROPERTIES, compute_power_properties),
        (picmg::SET_POWER_LEVEL, set_power_level),
        (picmg::GET_POWER_LEVEL, get_power_level),
    ];
    for (cmd, handler) in commands {
        let payload = payload.clone();
        router.register(
            netfn::GROUP_EXT,
            cmd,
            Box::new(move |tx: &dyn MsgSender, req: &Msg| {
                let reply = match req.data.split_first() {
                    Some((&PICMG_IDENTIFIER, rest)) => {
                        handler(&payload, addressing, tx, req, rest)
                    }
                    _ => req
                        .reply_with(CompletionCode::InvalidDataField, &[]),
                };
                tx.send(reply, None);
            }),
        );
    }
}

fn picmg_properties<B: SeqBus>(
    _payload: &osal::Mutex<PayloadManager<B>>,
    _addressing: EventAddressing,
    _tx: &dyn MsgSender,
    req: &Msg,
    _data: &[u8],
) -> Msg {
    // Extension version, max FRU device id, FRU device id of this IPMC.
    req.reply_with(
        CompletionCode::Success,
        &[PICMG_IDENTIFIER, PICMG_EXTENSION_VERSION, 0, 0],
    )
}

fn set_fru_activation<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    addressing: EventAddressing,
    tx: &dyn MsgSender,
    req: &Msg,
    data: &[u8],
) -> Msg {
    let &[fru, activate] = data else {
        return req
            .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
    };
    if fru != 0 {
        return req.reply_with(CompletionCode::ParameterOutOfRange, &[]);
    }
    let input = match activate {
        0 => MStateInput::ShelfDeactivate,
        1 => MStateInput::ShelfActivate,
        _ => {
            return req.reply_with(CompletionCode::InvalidDataField, &[])
        }
    };
    let event = payload.lock().mstate_input(input);
    send_event(tx, addressing, event);
    req.reply_with(CompletionCode::Success, &[PICMG_IDENTIFIER])
}

fn compute_power_properties<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    _addressing: EventAddressing,
    _tx: &dyn MsgSender,
    req: &Msg,
    data: &[u8],
) -> Msg {
    let &[fru] = data else {
        return req
            .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
    };
    match payload.lock().get_power_properties(fru, true) {
        Ok(props) => req.reply_with(
            CompletionCode::Success,
            &[
                PICMG_IDENTIFIER,
                props.spanned_slots,
                props.controller_location,
            ],
        ),
        Err(e) => req.reply_with(completion_for(e), &[]),
    }
}

fn set_power_level<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    addressing: EventAddressing,
    tx: &dyn MsgSender,
    req: &Msg,
    data: &[u8],
) -> Msg {
    let &[fru, level, _set_present] = data else {
        return req
            .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
    };
    // FFh: leave the present level alone.
    if level == 0xFF {
        return req
            .reply_with(CompletionCode::Success, &[PICMG_IDENTIFIER]);
    }
    let result = payload.lock().set_power_level(
        fru,
        level,
        &mut |ms| osal::sleep(ms),
    );
    match result {
        Ok(event) => {
            send_event(tx, addressing, event);
            req.reply_with(CompletionCode::Success, &[PICMG_IDENTIFIER])
        }
        Err(e) => req.reply_with(completion_for(e), &[]),
    }
}

fn get_power_level<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    _addressing: EventAddressing,
    _tx: &dyn MsgSender,
    req: &Msg,
    data: &[u8],
) -> Msg {
    let &[fru, power_type] = data else {
        return req
            .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
    };
    let props = match payload.lock().get_power_properties(fru, false) {
        Ok(props) => props,
        Err(e) => return req.reply_with(completion_for(e), &[]),
    };
    let (level, table) = match power_type {
        0 => (props.current_power_level, &props.power_levels),
        1 => (props.desired_power_level, &props.power_levels),
        2 => (props.current_power_level, &props.early_power_levels),
        3 => (props.desired_power_level, &props.early_power_levels),
        _ => {
            return req.reply_with(CompletionCode::InvalidDataField, &[])
        }
    };
    let mut payload_bytes = Vec::with_capacity(4 + table.len());
    payload_bytes.push(PICMG_IDENTIFIER);
    payload_bytes.push(
        (level & 0x1F)
            | if props.dynamic_reconfiguration {
                0x80
            } else {
                0
            },
    );
    payload_bytes.push(props.delay_to_stable_power);
    payload_bytes.push(props.power_multiplier);
    payload_bytes.extend_from_slice(table);
    req.reply_with(CompletionCode::Success, &payload_bytes)
}

fn set_port_state<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    _addressing: EventAddressing,
    _tx: &dyn MsgSender,
    req: &Msg,
    data: &[u8],
) -> Msg {
    let &[l0, l1, l2, l3, state] = data else {
        return req
            .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
    };
    let word = u32::from_le_bytes([l0, l1, l2, l3]);
    let link = LinkDescriptor::from_word(word);
    let known = payload
        .lock()
        .links()
        .set_port_state(link, state & 0x01 != 0);
    if known {
        req.reply_with(CompletionCode::Success, &[PICMG_IDENTIFIER])
    } else {
        req.reply_with(CompletionCode::ParameterOutOfRange, &[])
    }
}

fn get_port_state<B: SeqBus>(
    payload: &osal::Mutex<PayloadManager<B>>,
    _addressing: EventAddressing,
    _tx: &dyn MsgSender,
    req: &Msg,
    data: &[u8],
) -> Msg {
    let &[designator] = data else {
        return req
            .reply_with(CompletionCode::RequestDataLengthInvalid, &[]);
    };
    let channel = designator & 0x3F;
    let interface = designator >> 6;
    let mut payload_bytes = alloc::vec![PICMG_IDENTIFIER];
    let mut any = false;
    {
        let mut mgr = payload.lock();
        for (link, enabled) in mgr.links().port_state(channel, interface) {
            any = true;
            payload_bytes
                .extend_from_slice(&link.to_word().to_le_bytes());
            payload_bytes.push(u8::from(enabled));
        }
    }
    if !any {
        return req
            .reply_with(CompletionCode::RequestedDataNotPresent, &[]);
    }
    req.reply_with(CompletionCode::Success, &payload_bytes)
}

/// Registers Get Sensor Reading and Re-arm over the payload's ADC
/// sensors.
pub fn register_sensor_handlers<B: SeqBus + Send + 'static>(
    router: &mut CommandRouter,
    payload: &Arc<osal::Mutex<PayloadManager<B>>>,
) {
    {
        let payload = payload.clone();
        router.register(
            netfn::SENSOR_EVENT,
            sensor_event::GET_SENSOR_READING,
            Box::new(move |tx: &dyn MsgSender, req: &Msg| {
                let reply = match req.data.first() {
                    Some(&number) => {
                        match payload.lock().sensor_reading(number) {
                            Some(reading) => {
                                let status = reading.event_status;
                                let flags = 0xC0 // events + scanning on
                                    | if reading.raw.is_none() {
                                        0x20 // reading unavailable
                                    } else {
                                        0
                                    };
                                req.reply_with(
                                    CompletionCode::Success,
                                    &[
                                        reading.raw.unwrap_or(0),
                                        flags,
                                        status as u8,
                                        (status >> 8) as u8,
                                    ],
                                )
                            }
                            None => req.reply_with(
                                CompletionCode::RequestedDataNotPresent,
                                &[],
                            ),
                        }
                    }
                    None => req.reply_with(
                        CompletionCode::RequestDataLengthInvalid,
                        &[],
                    ),
                };
                tx.send(reply, None);
            }),
        );
    }
    {
        let payload = payload.clone();
        router.register(
            netfn::SENSOR_EVENT,
            sensor_event::REARM_SENSOR_EVENTS,
            Box::new(move |tx: &dyn MsgSender, req: &Msg| {
                let reply = match req.data.first() {
                    Some(&number) => {
                        if payload.lock().rearm_sensor(number) {
                            req.reply_with(CompletionCode::Success, &[])
                        } else {
                            req.reply_with(
                                CompletionCode::RequestedDataNotPresent,
                                &[],
                            )
                        }
                    }
                    None => req.reply_with(
                        CompletionCode::RequestDataLengthInvalid,
                        &[],
                    ),
                };
                tx.send(reply, None);
            }),
        );
    }
}
