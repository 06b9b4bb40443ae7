// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IPMB transport task.
//!
//! One engine task drives both redundant buses. Bus drivers push received
//! frames into a merged event queue from interrupt context; every other
//! task submits outgoing messages into the same queue through
//! [`IpmbTransport`]. The engine task blocks on the queue with a timeout
//! equal to the earliest pending retry deadline, so it wakes exactly when
//! there is work: a frame, a send, or a retransmit falling due.
//!
//! Requests ride a retry schedule of 64, 128, then 250-tick intervals
//! (inside the IPMB retry window), alternating buses per attempt, up to
//! [`engine::MAX_RETRIES`] attempts; then the submitter's callback gets a
//! `None` response and the message is abandoned. Responses are sent once,
//! ever; the far end's retry is the recovery path for a lost response.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

mod engine;

pub use engine::{IpmbEngine, MAX_RETRIES};

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use ipmi::{CommandRouter, Msg, MsgSender, ResponseHook};
use osal::AbsoluteTimeout;

/// Bounded depth of the merged event queue.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// The two redundant IPMB buses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusId {
    A,
    B,
}

/// One physical IPMB interface: accepts a complete wire frame for
/// transmission. Reception is driver-push through [`FrameIntake`].
pub trait IpmbPhy: Send {
    fn send_frame(&mut self, frame: &[u8]) -> bool;
}

/// Transport statistics, readable from any task.
#[derive(Default)]
pub struct Stats {
    pub messages_received: AtomicU32,
    pub messages_sent: AtomicU32,
    pub send_attempts: AtomicU32,
    pub send_failures: AtomicU32,
    pub no_available_sequence_number: AtomicU32,
    pub unexpected_replies: AtomicU32,
    pub bad_checksums: AtomicU32,
    pub recvq_overflows: AtomicU32,
    pub sendq_overflows: AtomicU32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Trace {
    Attempt { bus: BusId, retry: u8 },
    ResponsePaired,
    UnexpectedReply,
    DuplicateRequest,
    BadChecksum,
    SequenceExhausted,
    RetryAbandoned,
}

enum Event {
    Frame {
        frame: heapless::Vec<u8, { ipmi::MAX_FRAME_LEN }>,
    },
    Send {
        msg: Msg,
        hook: Option<ResponseHook>,
    },
}

/// The send-side handle held by every other subsystem. Cheap to clone;
/// never blocks on the bus.
#[derive(Clone)]
pub struct IpmbTransport {
    events: Arc<osal::Queue<Event>>,
    stats: Arc<Stats>,
}

impl IpmbTransport {
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

impl MsgSender for IpmbTransport {
    fn send(&self, msg: Msg, on_response: Option<ResponseHook>) {
        let event = Event::Send {
            msg,
            hook: on_response,
        };
        if let Err(Event::Send { msg, hook }) = self.events.try_send(event)
        {
            // Backpressure: the queue is full, the delivery fails now.
            self.stats.sendq_overflows.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = hook {
                hook(&msg, None);
            }
        }
    }
}

/// The receive-side handle handed to the bus drivers. Wait-free from the
/// driver's interrupt path: a full queue sheds the frame and counts it,
/// and the requester's retry recovers it later.
#[derive(Clone)]
pub struct FrameIntake {
    events: Arc<osal::Queue<Event>>,
    stats: Arc<Stats>,
}

impl FrameIntake {
    pub fn deliver(&self, bytes: &[u8]) {
        let frame = match heapless::Vec::from_slice(bytes) {
            Ok(frame) => frame,
            Err(()) => {
                // Longer than any legal IPMB frame.
                self.stats.bad_checksums.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if self.events.try_send(Event::Frame { frame }).is_err() {
            self.stats.recvq_overflows.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The engine task: owns the buses, the router, and the pending list.
pub struct IpmbServer {
    engine: IpmbEngine,
    events: Arc<osal::Queue<Event>>,
    stats: Arc<Stats>,
    bus_a: Box<dyn IpmbPhy>,
    bus_b: Box<dyn IpmbPhy>,
    router: CommandRouter,
    sender: IpmbTransport,
    next_deadline: osal::Ticks,
}

impl IpmbServer {
    pub fn new(
        bus_a: Box<dyn IpmbPhy>,
        bus_b: Box<dyn IpmbPhy>,
        router: CommandRouter,
    ) -> (Self, IpmbTransport, FrameIntake) {
        let events = Arc::new(osal::Queue::new(EVENT_QUEUE_DEPTH));
        let stats = Arc::new(Stats::default());
        let sender = IpmbTransport {
            events: events.clone(),
            stats: stats.clone(),
        };
        let intake = FrameIntake {
            events: events.clone(),
            stats: stats.clone(),
        };
        let server = Self {
            engine: IpmbEngine::new(),
            events,
            stats,
            bus_a,
            bus_b,
            router,
            sender: sender.clone(),
            next_deadline: osal::NEVER,
        };
        (server, sender, intake)
    }

    /// One scheduling quantum: wait for an event or the earliest retry
    /// deadline, absorb whatever arrived, then pump the pending list.
    pub fn step(&mut self) {
        let wakeup = AbsoluteTimeout::at(self.next_deadline);
        if let Some(event) = self.events.recv(wakeup) {
            self.handle_event(event);
            // Drain whatever else queued up while we slept.
            while let Some(event) = self.events.recv(AbsoluteTimeout::at(0))
            {
                self.handle_event(event);
            }
        }
        let now = osal::now();
        self.next_deadline = self.engine.pump(
            now,
            &mut *self.bus_a,
            &mut *self.bus_b,
            &self.stats,
        );
    }

    pub fn run(mut self) -> ! {
        loop {
            self.step();
        }
    }

    fn handle_event(&mut self, event: Event) {
        let now = osal::now();
        match event {
            Event::Frame { frame } => {
                let router = &self.router;
                let sender = &self.sender;
                self.engine.handle_frame(&frame, now, &self.stats, |msg| {
                    router.dispatch(sender, msg)
                });
            }
            Event::Send { msg, hook } => {
                self.engine.submit(msg, hook, now, &self.stats);
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressError {
    /// The geographic-address pins failed their odd-parity check; the
    /// slot wiring cannot be trusted.
    BadParity,
}

/// The backplane hardware-address pins.
pub trait HwAddrPins {
    /// Reads pin `index` (0..8), true = high.
    fn read_pin(&self, index: usize) -> bool;
}

/// Derives this node's IPMB address from the hardware address pins. The
/// eight pins carry the address under odd parity; bit 0 of the result is
/// always cleared, IPMB addresses being even.
pub fn lookup_ipmb_address(
    pins: &dyn HwAddrPins,
) -> Result<u8, AddressError> {
    let mut address = 0u8;
    let mut parity = false;
    for i in 0..8 {
        let bit = pins.read_pin(i);
        address |= u8::from(bit) << i;
        parity ^= bit;
    }
    if !parity {
        return Err(AddressError::BadParity);
    }
    Ok(address & 0xFE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipmi::CompletionCode;
    use std::sync::Mutex as StdMutex;

    struct SharedPhy {
        frames: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl IpmbPhy for SharedPhy {
        fn send_frame(&mut self, frame: &[u8]) -> bool {
            self.frames.lock().unwrap().push(frame.to_vec());
            true
        }
    }

    fn server_with_echo_handler(
    ) -> (IpmbServer, IpmbTransport, FrameIntake, Arc<StdMutex<Vec<Vec<u8>>>>)
    {
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let mut router = CommandRouter::new();
        router.register(
            0x06,
            0x01,
            Box::new(|tx, req| {
                tx.send(
                    req.reply_with(CompletionCode::Success, &[0x55]),
                    None,
                );
            }),
        );
        let (server, transport, intake) = IpmbServer::new(
            Box::new(SharedPhy {
                frames: frames.clone(),
            }),
            Box::new(SharedPhy {
                frames: frames.clone(),
            }),
            router,
        );
        (server, transport, intake, frames)
    }

    #[test]
    fn inbound_request_is_answered_on_the_bus() {
        let (mut server, _transport, intake, frames) =
            server_with_echo_handler();

        let mut request =
            Msg::new(0, 0x20, 0, 0x82, 0x06, 0x01, &[]).unwrap();
        request.rq_seq = 3;
        intake.deliver(&request.unparse());

        server.step();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let reply = Msg::parse(&frames[0]).unwrap();
        assert!(request.match_reply(&reply));
        assert_eq!(&reply.data[..], &[0x00, 0x55]);
    }

    #[test]
    fn duplicate_request_still_gets_a_reply() {
        let (mut server, _transport, intake, frames) =
            server_with_echo_handler();
        let mut request =
            Msg::new(0, 0x20, 0, 0x82, 0x06, 0x01, &[]).unwrap();
        request.rq_seq = 3;
        intake.deliver(&request.unparse());
        intake.deliver(&request.unparse());
        // One step drains both frames and pumps out both replies.
        server.step();
        assert_eq!(frames.lock().unwrap().len(), 2);
    }

    #[test]
    fn unknown_command_is_answered_c1() {
        let (mut server, _transport, intake, frames) =
            server_with_echo_handler();
        let request =
            Msg::new(0, 0x20, 0, 0x82, 0x06, 0x7E, &[]).unwrap();
        intake.deliver(&request.unparse());
        server.step();
        let frames = frames.lock().unwrap();
        let reply = Msg::parse(&frames[0]).unwrap();
        assert_eq!(&reply.data[..], &[0xC1]);
    }

    #[test]
    fn address_lookup_checks_parity() {
        struct Pins(u8);
        impl HwAddrPins for Pins {
            fn read_pin(&self, index: usize) -> bool {
                self.0 & (1 << index) != 0
            }
        }
        // 0x43: three bits set, odd parity holds, bit 0 masked off.
        assert_eq!(lookup_ipmb_address(&Pins(0x43)), Ok(0x42));
        // 0x41: even parity, reject.
        assert_eq!(
            lookup_ipmb_address(&Pins(0x41)),
            Err(AddressError::BadParity)
        );
    }
}
