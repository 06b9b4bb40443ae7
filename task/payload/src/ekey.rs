// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! E-keying: the backplane link table.
//!
//! Each board link is described by a 32-bit link designator; the shelf
//! manager enables and disables links with Set Port State after matching
//! both ends' capabilities. We keep the table, flip the enables, and let
//! the platform act on the transitions.
//!
//! Designator packing: `[5:0]` channel, `[7:6]` interface, `[11:8]` port
//! mask, `[19:12]` link type, `[23:20]` link type extension, `[31:24]`
//! grouping id.

use alloc::vec::Vec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkDescriptor {
    pub channel: u8,
    pub interface: u8,
    pub ports: u8,
    pub link_type: u8,
    pub link_type_extension: u8,
    pub grouping_id: u8,
}

impl LinkDescriptor {
    pub fn from_word(word: u32) -> Self {
        Self {
            channel: (word & 0x3F) as u8,
            interface: ((word >> 6) & 0x03) as u8,
            ports: ((word >> 8) & 0x0F) as u8,
            link_type: ((word >> 12) & 0xFF) as u8,
            link_type_extension: ((word >> 20) & 0x0F) as u8,
            grouping_id: (word >> 24) as u8,
        }
    }

    pub fn to_word(self) -> u32 {
        u32::from(self.channel & 0x3F)
            | (u32::from(self.interface & 0x03) << 6)
            | (u32::from(self.ports & 0x0F) << 8)
            | (u32::from(self.link_type) << 12)
            | (u32::from(self.link_type_extension & 0x0F) << 20)
            | (u32::from(self.grouping_id) << 24)
    }
}

/// The board's link table with per-link enable state.
#[derive(Default)]
pub struct LinkTable {
    links: Vec<(LinkDescriptor, bool)>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a link the board supports. Links start disabled; the
    /// shelf enables them after E-keying negotiation.
    pub fn declare(&mut self, link: LinkDescriptor) {
        if !self.links.iter().any(|(l, _)| *l == link) {
            self.links.push((link, false));
        }
    }

    /// Set Port State: returns false if the designator names no declared
    /// link.
    pub fn set_port_state(
        &mut self,
        link: LinkDescriptor,
        enabled: bool,
    ) -> bool {
        for (declared, state) in &mut self.links {
            if *declared == link {
                *state = enabled;
                return true;
            }
        }
        false
    }

    /// Get Port State: every declared link on `channel`/`interface`.
    pub fn port_state(
        &self,
        channel: u8,
        interface: u8,
    ) -> impl Iterator<Item = (LinkDescriptor, bool)> + '_ {
        self.links
            .iter()
            .filter(move |(l, _)| {
                l.channel == channel && l.interface == interface
            })
            .map(|(l, s)| (*l, *s))
    }

    pub fn is_enabled(&self, link: &LinkDescriptor) -> bool {
        self.links
            .iter()
            .any(|(l, s)| l == link && *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_fabric_link() -> LinkDescriptor {
        LinkDescriptor {
            channel: 1,
            interface: 1, // fabric
            ports: 0x1,
            link_type: 0x02,
            link_type_extension: 0,
            grouping_id: 0,
        }
    }

    #[test]
    fn designator_word_round_trips() {
        let link = base_fabric_link();
        assert_eq!(LinkDescriptor::from_word(link.to_word()), link);

        let word = 0x554A_B142; // arbitrary fully-packed designator
        assert_eq!(LinkDescriptor::from_word(word).to_word(), word);
    }

    #[test]
    fn set_port_state_flips_declared_links_only() {
        let mut table = LinkTable::new();
        let link = base_fabric_link();
        table.declare(link);
        assert!(!table.is_enabled(&link));

        assert!(table.set_port_state(link, true));
        assert!(table.is_enabled(&link));

        let mut other = link;
        other.channel = 9;
        assert!(!table.set_port_state(other, true));
    }

    #[test]
    fn port_state_filters_by_channel_and_interface() {
        let mut table = LinkTable::new();
        let a = base_fabric_link();
        let mut b = a;
        b.channel = 2;
        table.declare(a);
        table.declare(b);
        table.set_port_state(b, true);

        let on_2: Vec<_> = table.port_state(2, 1).collect();
        assert_eq!(on_2, vec![(b, true)]);
        assert_eq!(table.port_state(3, 1).count(), 0);
    }
}
