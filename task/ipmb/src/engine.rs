// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport state machine, independent of queues and clocks.
//!
//! Everything time-dependent takes `now` as a parameter; the task loop in
//! `lib.rs` feeds it the live tick counter, the tests feed it a script.
//!
//! Pending requests live on one FIFO list. Responses pair against it in
//! order (first match wins), retries walk it in order, and exhaustion
//! removes from it — so the ordering guarantees fall straight out of the
//! data structure.

use alloc::collections::{BTreeMap, VecDeque};
use core::sync::atomic::Ordering;

use ipmi::{Msg, ResponseHook};
use osal::Ticks;
use ringlog::TraceBuf;

use crate::{BusId, IpmbPhy, Stats, Trace};

/// Requests are attempted this many times before the delivery fails.
pub const MAX_RETRIES: u8 = 10;

/// Outgoing sequence numbers are unavailable for reuse for 6 seconds (the
/// IPMB expiration interval is 5; one extra second of margin).
const OUTGOING_SEQ_WINDOW: Ticks = 6 * osal::TICK_HZ;

/// Incoming requests within this window with an identical composite key
/// are retransmissions.
const INCOMING_SEQ_WINDOW: Ticks = 5 * osal::TICK_HZ;

/// Retry backoff: 64, 128, then 250-tick steps, inside the IPMB
/// 60..250 ms retry window.
fn retry_delay(prior_retries: u8) -> Ticks {
    (1u64 << (6 + u32::from(prior_retries).min(20))).min(250)
}

struct MsgRec {
    msg: Msg,
    hook: Option<ResponseHook>,
    retry_count: u8,
    next_retry: Ticks,
}

pub struct IpmbEngine {
    used_sequence_numbers: BTreeMap<u32, Ticks>,
    incoming_sequence_numbers: BTreeMap<u32, Ticks>,
    outgoing: VecDeque<MsgRec>,
    pub(crate) trace: TraceBuf<Trace, 64>,
}

impl Default for IpmbEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IpmbEngine {
    pub fn new() -> Self {
        Self {
            used_sequence_numbers: BTreeMap::new(),
            incoming_sequence_numbers: BTreeMap::new(),
            outgoing: VecDeque::new(),
            trace: TraceBuf::new(),
        }
    }

    /// Accepts a message for delivery. Requests get a sequence number
    /// here; with none available the delivery fails up front and the
    /// hook hears about it immediately.
    pub fn submit(
        &mut self,
        mut msg: Msg,
        hook: Option<ResponseHook>,
        now: Ticks,
        stats: &Stats,
    ) {
        if !self.assign_sequence(&mut msg, now) {
            stats
                .no_available_sequence_number
                .fetch_add(1, Ordering::Relaxed);
            self.trace.entry(Trace::SequenceExhausted);
            if let Some(hook) = hook {
                hook(&msg, None);
            }
            return;
        }
        self.outgoing.push_back(MsgRec {
            msg,
            hook,
            retry_count: 0,
            next_retry: now, // due immediately
        });
    }

    /// Handles one received wire frame. Requests are flagged for
    /// duplication and handed to `dispatch`; responses pair against the
    /// pending list.
    pub fn handle_frame(
        &mut self,
        frame: &[u8],
        now: Ticks,
        stats: &Stats,
        dispatch: impl FnOnce(&Msg),
    ) {
        let mut msg = match Msg::parse(frame) {
            Ok(msg) => msg,
            Err(_) => {
                stats.bad_checksums.fetch_add(1, Ordering::Relaxed);
                self.trace.entry(Trace::BadChecksum);
                return;
            }
        };
        stats.messages_received.fetch_add(1, Ordering::Relaxed);

        if msg.is_response() {
            // First pending request it answers wins.
            let position = self
                .outgoing
                .iter()
                .position(|rec| rec.msg.match_reply(&msg));
            match position {
                Some(i) => {
                    let mut rec = match self.outgoing.remove(i) {
                        Some(rec) => rec,
                        None => return,
                    };
                    stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.trace.entry(Trace::ResponsePaired);
                    if let Some(hook) = rec.hook.take() {
                        hook(&rec.msg, Some(&msg));
                    }
                }
                None => {
                    stats
                        .unexpected_replies
                        .fetch_add(1, Ordering::Relaxed);
                    self.trace.entry(Trace::UnexpectedReply);
                }
            }
            return;
        }

        // Requests are dispatched even when duplicated; handlers are
        // idempotent and the requester needs a reply for every retry.
        msg.duplicate = self.check_duplicate(&msg, now);
        if msg.duplicate {
            self.trace.entry(Trace::DuplicateRequest);
        }
        dispatch(&msg);
    }

    /// Sends everything due, schedules retries, reaps exhausted entries.
    /// Returns the tick at which the next retry falls due ([`osal::NEVER`]
    /// with nothing pending).
    pub fn pump<'a>(
        &mut self,
        now: Ticks,
        bus_a: &'a mut dyn IpmbPhy,
        bus_b: &'a mut dyn IpmbPhy,
        stats: &Stats,
    ) -> Ticks {
        let mut next_wait = osal::NEVER;
        let mut i = 0;
        while i < self.outgoing.len() {
            let due = self.outgoing[i].next_retry <= now;
            if due {
                if self.outgoing[i].retry_count >= MAX_RETRIES {
                    // Our last retry timed out.
                    let mut rec = match self.outgoing.remove(i) {
                        Some(rec) => rec,
                        None => break,
                    };
                    stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    self.trace.entry(Trace::RetryAbandoned);
                    if let Some(hook) = rec.hook.take() {
                        hook(&rec.msg, None);
                    }
                    continue;
                }

                let rec = &mut self.outgoing[i];
                stats.send_attempts.fetch_add(1, Ordering::Relaxed);
                // Alternate buses between attempts.
                let bus = if rec.retry_count % 2 == 0 {
                    &mut *bus_a
                } else {
                    &mut *bus_b
                };
                let frame = rec.msg.unparse();
                let success = bus.send_frame(&frame);
                let is_response = rec.msg.is_response();
                self.trace.entry(Trace::Attempt {
                    bus: if rec.retry_count % 2 == 0 {
                        BusId::A
                    } else {
                        BusId::B
                    },
                    retry: rec.retry_count,
                });

                if is_response {
                    // Responses get exactly one attempt; the requester's
                    // own retry will re-solicit if the bus ate it.
                    let mut rec = match self.outgoing.remove(i) {
                        Some(rec) => rec,
                        None => break,
                    };
                    if success {
                        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        stats.send_failures.fetch_add(1, Ordering::Relaxed);
                        if let Some(hook) = rec.hook.take() {
                            hook(&rec.msg, None);
                        }
                    }
                    continue;
                }

                // Success or not, requests wait for a response or a
                // retry deadline.
                rec.next_retry = now + retry_delay(rec.retry_count);
                rec.retry_count += 1;
            }

            if self.outgoing[i].next_retry < next_wait {
                next_wait = self.outgoing[i].next_retry;
            }
            i += 1;
        }
        next_wait
    }

    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    /// Stamps an unused sequence number into an outgoing request.
    /// Responses keep the requester's sequence untouched.
    fn assign_sequence(&mut self, msg: &mut Msg, now: Ticks) -> bool {
        if msg.is_response() {
            return true;
        }
        self.used_sequence_numbers.retain(|_, stamp| {
            *stamp + OUTGOING_SEQ_WINDOW > now
        });

        let prefix = (u32::from(msg.rs_sa) << 24)
            | (u32::from(msg.net_fn) << 16)
            | (u32::from(msg.cmd) << 8);
        for seq in 1..=254u8 {
            let key = prefix | u32::from(seq);
            if self.used_sequence_numbers.contains_key(&key) {
                continue;
            }
            self.used_sequence_numbers.insert(key, now);
            msg.rq_seq = seq;
            return true;
        }
        false
    }

    /// True when this request's composite key was already seen inside the
    /// dedup window. The sighting is (re)stamped either way.
    fn check_duplicate(&mut self, msg: &Msg, now: Ticks) -> bool {
        self.incoming_sequence_numbers.retain(|_, stamp| {
            *stamp + INCOMING_SEQ_WINDOW > now
        });
        let key = (u32::from(msg.rq_sa) << 24)
            | (u32::from(msg.net_fn) << 16)
            | (u32::from(msg.cmd) << 8)
            | u32::from(msg.rq_seq);
        let duplicate = self.incoming_sequence_numbers.contains_key(&key);
        self.incoming_sequence_numbers.insert(key, now);
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    /// Records frames; scripted to accept or refuse.
    struct FakePhy {
        frames: Vec<Vec<u8>>,
        accept: bool,
    }

    impl FakePhy {
        fn new() -> Self {
            Self {
                frames: Vec::new(),
                accept: true,
            }
        }
    }

    impl IpmbPhy for FakePhy {
        fn send_frame(&mut self, frame: &[u8]) -> bool {
            self.frames.push(frame.to_vec());
            self.accept
        }
    }

    fn request(cmd: u8) -> Msg {
        Msg::new(0, 0x82, 0, 0x20, 0x06, cmd, &[]).unwrap()
    }

    /// A hook that pushes `(had_response)` into shared storage.
    fn capture_hook(
        results: &Arc<Mutex<Vec<bool>>>,
    ) -> ResponseHook {
        let results = results.clone();
        Box::new(move |_original, response| {
            results.lock().unwrap().push(response.is_some());
        })
    }

    struct Rig {
        engine: IpmbEngine,
        stats: Stats,
        bus_a: FakePhy,
        bus_b: FakePhy,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                engine: IpmbEngine::new(),
                stats: Stats::default(),
                bus_a: FakePhy::new(),
                bus_b: FakePhy::new(),
            }
        }

        fn pump(&mut self, now: Ticks) -> Ticks {
            self.engine.pump(
                now,
                &mut self.bus_a,
                &mut self.bus_b,
                &self.stats,
            )
        }
    }

    fn stat(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::Relaxed)
    }

    #[test]
    fn request_goes_out_with_assigned_sequence() {
        let mut rig = Rig::new();
        rig.engine.submit(request(0x01), None, 0, &rig.stats);
        rig.pump(0);
        assert_eq!(rig.bus_a.frames.len(), 1);
        let sent = Msg::parse(&rig.bus_a.frames[0]).unwrap();
        assert_eq!(sent.rq_seq, 1);
        assert_eq!(sent.cmd, 0x01);
    }

    #[test]
    fn retry_schedule_is_64_128_then_250s_alternating_buses() {
        let mut rig = Rig::new();
        rig.engine.submit(request(0x01), None, 0, &rig.stats);

        let mut now = 0;
        let mut deadlines = Vec::new();
        for _ in 0..MAX_RETRIES {
            let next = rig.pump(now);
            deadlines.push(next - now);
            now = next;
        }
        assert_eq!(
            deadlines,
            vec![64, 128, 250, 250, 250, 250, 250, 250, 250, 250]
        );
        // Attempts alternate A, B, A, B, ...
        assert_eq!(rig.bus_a.frames.len(), 5);
        assert_eq!(rig.bus_b.frames.len(), 5);
    }

    #[test]
    fn exhausted_request_fails_exactly_once_with_none() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut rig = Rig::new();
        rig.engine.submit(
            request(0x01),
            Some(capture_hook(&results)),
            0,
            &rig.stats,
        );

        let mut now = 0;
        loop {
            let next = rig.pump(now);
            if next == osal::NEVER {
                break;
            }
            now = next;
        }
        assert_eq!(*results.lock().unwrap(), vec![false]);
        assert_eq!(stat(&rig.stats.send_failures), 1);
        assert_eq!(stat(&rig.stats.send_attempts), u32::from(MAX_RETRIES));
        assert_eq!(rig.engine.pending(), 0);
        // The whole affair fits inside MAX_RETRIES retry windows.
        assert!(now <= u64::from(MAX_RETRIES) * 250);
    }

    #[test]
    fn response_pairs_and_stops_retries() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut rig = Rig::new();
        rig.engine.submit(
            request(0x01),
            Some(capture_hook(&results)),
            0,
            &rig.stats,
        );
        rig.pump(0);

        // Build the matching response from the frame that went out.
        let sent = Msg::parse(&rig.bus_a.frames[0]).unwrap();
        let response = sent.reply_with(ipmi::CompletionCode::Success, &[]);
        rig.engine.handle_frame(
            &response.unparse(),
            10,
            &rig.stats,
            |_| panic!("responses are not dispatched"),
        );

        assert_eq!(*results.lock().unwrap(), vec![true]);
        assert_eq!(rig.engine.pending(), 0);
        assert_eq!(rig.pump(64), osal::NEVER);
        assert_eq!(stat(&rig.stats.messages_sent), 1);
    }

    #[test]
    fn unmatched_response_is_counted_not_dispatched() {
        let mut rig = Rig::new();
        let stray = request(0x33).reply_with(
            ipmi::CompletionCode::Success,
            &[],
        );
        rig.engine.handle_frame(&stray.unparse(), 0, &rig.stats, |_| {
            panic!("must not dispatch")
        });
        assert_eq!(stat(&rig.stats.unexpected_replies), 1);
    }

    #[test]
    fn corrupt_frames_are_counted_and_dropped() {
        let mut rig = Rig::new();
        let mut frame = request(0x01).unparse();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        rig.engine.handle_frame(&frame, 0, &rig.stats, |_| {
            panic!("must not dispatch")
        });
        assert_eq!(stat(&rig.stats.bad_checksums), 1);
        assert_eq!(stat(&rig.stats.messages_received), 0);
    }

    #[test]
    fn duplicate_detection_answers_false_true_true() {
        let mut rig = Rig::new();
        let mut msg = request(0x01);
        msg.rq_seq = 9;
        let mut flags = Vec::new();
        for _ in 0..3 {
            rig.engine.handle_frame(
                &msg.unparse(),
                100,
                &rig.stats,
                |m| flags.push(m.duplicate),
            );
        }
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn duplicate_window_expires_after_five_seconds() {
        let mut rig = Rig::new();
        let mut msg = request(0x01);
        msg.rq_seq = 9;
        let mut flags = Vec::new();
        rig.engine.handle_frame(&msg.unparse(), 0, &rig.stats, |m| {
            flags.push(m.duplicate)
        });
        rig.engine.handle_frame(
            &msg.unparse(),
            5 * osal::TICK_HZ,
            &rig.stats,
            |m| flags.push(m.duplicate),
        );
        assert_eq!(flags, vec![false, false]);
    }

    #[test]
    fn sequence_space_exhausts_at_254_outstanding() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut rig = Rig::new();
        for _ in 0..254 {
            rig.engine.submit(request(0x01), None, 0, &rig.stats);
        }
        assert_eq!(rig.engine.pending(), 254);
        rig.engine.submit(
            request(0x01),
            Some(capture_hook(&results)),
            0,
            &rig.stats,
        );
        assert_eq!(rig.engine.pending(), 254, "255th is refused");
        assert_eq!(*results.lock().unwrap(), vec![false]);
        assert_eq!(stat(&rig.stats.no_available_sequence_number), 1);

        // A different command has its own sequence space.
        rig.engine.submit(request(0x02), None, 0, &rig.stats);
        assert_eq!(rig.engine.pending(), 255);
    }

    #[test]
    fn sequence_numbers_recycle_after_the_window() {
        let mut rig = Rig::new();
        let mut msg = request(0x01);
        assert!(rig.engine.assign_sequence(&mut msg, 0));
        assert_eq!(msg.rq_seq, 1);
        let mut msg = request(0x01);
        assert!(rig.engine.assign_sequence(&mut msg, 0));
        assert_eq!(msg.rq_seq, 2, "seq 1 still in the window");

        let mut msg = request(0x01);
        let later = 6 * osal::TICK_HZ + 1;
        assert!(rig.engine.assign_sequence(&mut msg, later));
        assert_eq!(msg.rq_seq, 1, "window expired, lowest seq reused");
    }

    #[test]
    fn responses_are_sent_once_and_never_retried() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut rig = Rig::new();
        let reply = request(0x01).reply_with(
            ipmi::CompletionCode::Success,
            &[0x12],
        );
        rig.engine.submit(
            reply.clone(),
            Some(capture_hook(&results)),
            0,
            &rig.stats,
        );
        assert_eq!(rig.pump(0), osal::NEVER);
        assert_eq!(rig.bus_a.frames.len(), 1);
        assert_eq!(rig.engine.pending(), 0);
        // Delivered: the hook stays silent.
        assert!(results.lock().unwrap().is_empty());

        // A refused response fails once, with the failure indicated.
        rig.bus_a.accept = false;
        rig.engine.submit(
            reply,
            Some(capture_hook(&results)),
            10,
            &rig.stats,
        );
        assert_eq!(rig.pump(10), osal::NEVER);
        assert_eq!(*results.lock().unwrap(), vec![false]);
        assert_eq!(rig.engine.pending(), 0);
    }

    #[test]
    fn response_sequence_is_preserved_not_reassigned() {
        let mut rig = Rig::new();
        let mut incoming = request(0x01);
        incoming.rq_seq = 37;
        let reply =
            incoming.reply_with(ipmi::CompletionCode::Success, &[]);
        rig.engine.submit(reply, None, 0, &rig.stats);
        rig.pump(0);
        let sent = Msg::parse(&rig.bus_a.frames[0]).unwrap();
        assert_eq!(sent.rq_seq, 37);
    }

    #[test]
    fn send_failure_of_request_still_follows_retry_schedule() {
        let mut rig = Rig::new();
        rig.bus_a.accept = false;
        rig.bus_b.accept = false;
        rig.engine.submit(request(0x01), None, 0, &rig.stats);
        let next = rig.pump(0);
        assert_eq!(next, 64, "bus refusal does not shortcut the backoff");
        assert_eq!(rig.engine.pending(), 1);
    }
}
