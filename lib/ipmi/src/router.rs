// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command dispatch: `(netFn, cmd)` to handler.
//!
//! Handlers are registered by the subsystem that owns the relevant state
//! (storage commands next to the SDR repository, PICMG commands next to the
//! payload manager) and looked up in O(log n). An unknown command gets the
//! standard "Invalid command" (C1h) response; every request gets *some*
//! response, duplicates included.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::{CompletionCode, Msg};

/// The transport seam handlers answer through. Sends are queued; this never
/// blocks on the bus, so it is safe to call from any task and from inside
/// handlers running on the transport task itself.
pub trait MsgSender: Send + Sync {
    /// Queues `msg` for delivery. For requests, `on_response` is invoked
    /// exactly once with the pairing response, or with `None` once retries
    /// are exhausted. For responses it reports one-shot send failure.
    fn send(&self, msg: Msg, on_response: Option<ResponseHook>);
}

/// Callback receiving `(original_message, response_or_none)`.
pub type ResponseHook = Box<dyn FnOnce(&Msg, Option<&Msg>) + Send>;

pub type Handler = Box<dyn Fn(&dyn MsgSender, &Msg) + Send>;

#[derive(Default)]
pub struct CommandRouter {
    handlers: BTreeMap<u16, Handler>,
}

/// Routing key: the even (request) netFn in the high byte, command low.
fn key(net_fn: u8, cmd: u8) -> u16 {
    (u16::from(net_fn & 0xFE) << 8) | u16::from(cmd)
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `(net_fn, cmd)`, replacing any predecessor.
    pub fn register(&mut self, net_fn: u8, cmd: u8, handler: Handler) {
        self.handlers.insert(key(net_fn, cmd), handler);
    }

    /// Dispatches an incoming request. Unknown commands are answered with
    /// C1h on the caller's behalf.
    pub fn dispatch(&self, sender: &dyn MsgSender, msg: &Msg) {
        match self.handlers.get(&key(msg.net_fn, msg.cmd)) {
            Some(handler) => handler(sender, msg),
            None => {
                let reply =
                    msg.reply_with(CompletionCode::InvalidCommand, &[]);
                sender.send(reply, None);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Collects sent messages for assertions.
    #[derive(Default)]
    pub struct CapturingSender {
        pub sent: Mutex<Vec<Msg>>,
    }

    impl MsgSender for CapturingSender {
        fn send(&self, msg: Msg, _on_response: Option<ResponseHook>) {
            self.sent.lock().unwrap().push(msg);
        }
    }
}
