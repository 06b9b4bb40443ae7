// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IPMB message record and its wire codec.
//!
//! Frame layout, per IPMB: an optional leading `00h` for broadcast
//! requests, then `rsSA, (netFn<<2)|rsLUN, hdr_cksum, rqSA,
//! (rqSeq<<2)|rqLUN, cmd, data..., body_cksum`. The header checksum covers
//! `rsSA` through the netFn byte; the body checksum covers `rqSA` through
//! the last data byte. Both are 2's-complement sums, so verification is
//! "sum of the covered bytes plus the checksum is zero".

use core::fmt;

use crate::CompletionCode;

/// IPMB messages carry at most 32 data bytes.
pub const MAX_DATA_LEN: usize = 32;

/// Worst-case frame: broadcast prefix + 6 header/checksum bytes + data +
/// body checksum.
pub const MAX_FRAME_LEN: usize = MAX_DATA_LEN + 8;

/// 2's-complement checksum over `bytes`. A buffer with its checksum
/// appended sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    let mut sum = 0u8;
    for &b in bytes {
        sum = sum.wrapping_add(b);
    }
    (!sum).wrapping_add(1)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Shorter than the minimum 7-byte frame.
    TooShort,
    HeaderChecksum,
    BodyChecksum,
    /// More data bytes than an IPMB frame may carry.
    DataTooLong,
}

/// One IPMB transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Msg {
    /// Responder slave address.
    pub rs_sa: u8,
    /// 6-bit network function; LSB clear = request, set = response.
    pub net_fn: u8,
    /// Responder logical unit (2 bits).
    pub rs_lun: u8,
    /// Requester slave address.
    pub rq_sa: u8,
    /// 6-bit sequence number, assigned by the transport for requests.
    pub rq_seq: u8,
    /// Requester logical unit (2 bits).
    pub rq_lun: u8,
    pub cmd: u8,
    pub data: heapless::Vec<u8, MAX_DATA_LEN>,
    /// Set when the frame arrived with the broadcast prefix.
    pub broadcast: bool,
    /// Set by the transport when this request is a retransmit of one seen
    /// within the dedup window. Handlers still reply; this is advisory.
    pub duplicate: bool,
}

impl Msg {
    /// Builds a request/response with the given addressing and data.
    /// Fails only if `data` exceeds [`MAX_DATA_LEN`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rq_lun: u8,
        rq_sa: u8,
        rs_lun: u8,
        rs_sa: u8,
        net_fn: u8,
        cmd: u8,
        data: &[u8],
    ) -> Result<Self, ParseError> {
        let data = heapless::Vec::from_slice(data)
            .map_err(|_| ParseError::DataTooLong)?;
        Ok(Self {
            rs_sa,
            net_fn,
            rs_lun,
            rq_sa,
            rq_seq: 0,
            rq_lun,
            cmd,
            data,
            broadcast: false,
            duplicate: false,
        })
    }

    /// True for response messages (netFn LSB set).
    pub fn is_response(&self) -> bool {
        self.net_fn & 1 != 0
    }

    /// Parses a complete IPMB frame, verifying both checksums.
    pub fn parse(frame: &[u8]) -> Result<Self, ParseError> {
        let (broadcast, frame) = match frame.split_first() {
            Some((0x00, rest)) if !rest.is_empty() => (true, rest),
            _ => (false, frame),
        };
        if frame.len() < 7 {
            return Err(ParseError::TooShort);
        }
        if checksum(&frame[..2]) != frame[2] {
            return Err(ParseError::HeaderChecksum);
        }
        let (body, body_cksum) = frame[3..].split_at(frame.len() - 4);
        if checksum(body) != body_cksum[0] {
            return Err(ParseError::BodyChecksum);
        }
        let data = heapless::Vec::from_slice(&body[3..])
            .map_err(|_| ParseError::DataTooLong)?;
        Ok(Self {
            rs_sa: frame[0],
            net_fn: frame[1] >> 2,
            rs_lun: frame[1] & 0x03,
            rq_sa: body[0],
            rq_seq: body[1] >> 2,
            rq_lun: body[1] & 0x03,
            cmd: body[2],
            data,
            broadcast,
            duplicate: false,
        })
    }

    /// Formats this message as a wire frame, checksums included.
    pub fn unparse(&self) -> heapless::Vec<u8, MAX_FRAME_LEN> {
        let mut out = heapless::Vec::new();
        if self.broadcast {
            let _ = out.push(0x00);
        }
        let _ = out.push(self.rs_sa);
        let _ = out.push((self.net_fn << 2) | (self.rs_lun & 0x03));
        let hdr_start = out.len() - 2;
        let hdr = checksum(&out[hdr_start..]);
        let _ = out.push(hdr);
        let body_start = out.len();
        let _ = out.push(self.rq_sa);
        let _ = out.push((self.rq_seq << 2) | (self.rq_lun & 0x03));
        let _ = out.push(self.cmd);
        let _ = out.extend_from_slice(&self.data);
        let body = checksum(&out[body_start..]);
        let _ = out.push(body);
        out
    }

    /// Builds the skeleton of a reply to this message: addressing mirrored,
    /// netFn marked response, sequence preserved, data cleared. The caller
    /// fills data\[0\] with a completion code.
    pub fn prepare_reply(&self) -> Msg {
        Msg {
            rs_sa: self.rq_sa,
            net_fn: self.net_fn | 1,
            rs_lun: self.rq_lun,
            rq_sa: self.rs_sa,
            rq_seq: self.rq_seq,
            rq_lun: self.rs_lun,
            cmd: self.cmd,
            data: heapless::Vec::new(),
            broadcast: false,
            duplicate: false,
        }
    }

    /// Convenience: a finished reply carrying `cc` and then `payload`,
    /// truncated to frame capacity.
    pub fn reply_with(&self, cc: CompletionCode, payload: &[u8]) -> Msg {
        let mut reply = self.prepare_reply();
        let _ = reply.data.push(cc.into());
        for &b in payload {
            if reply.data.push(b).is_err() {
                break;
            }
        }
        reply
    }

    /// Header-identical comparison (everything but data and flags).
    pub fn matches(&self, other: &Msg) -> bool {
        self.rq_sa == other.rq_sa
            && self.rs_sa == other.rs_sa
            && self.rq_lun == other.rq_lun
            && self.rs_lun == other.rs_lun
            && self.rq_seq == other.rq_seq
            && self.net_fn == other.net_fn
            && self.cmd == other.cmd
    }

    /// Is `response` the response pairing with this request? Addressing is
    /// mirrored, netFn matches with the response bit ignored, sequence and
    /// command match.
    pub fn match_reply(&self, response: &Msg) -> bool {
        self.rq_sa == response.rs_sa
            && self.rs_sa == response.rq_sa
            && self.rq_lun == response.rs_lun
            && self.rs_lun == response.rq_lun
            && self.rq_seq == response.rq_seq
            && self.net_fn == (response.net_fn & 0xFE)
            && self.cmd == response.cmd
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02x} -> {}{}.{:02x}: {:02x}.{:02x} (seq {:02x}) [",
            self.rq_lun,
            self.rq_sa,
            if self.broadcast { "*" } else { "" },
            self.rs_lun,
            self.rs_sa,
            self.net_fn,
            self.cmd,
            self.rq_seq,
        )?;
        for (i, b) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        write!(f, "]")
    }
}
