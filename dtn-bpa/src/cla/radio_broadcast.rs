// Copyright (C) 2023 Felix Huettner
//
// This file is part of DTRD.
//
// DTRD is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// DTRD is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! A point-to-point radio broadcast CLA, framed compatibly with the widely
//! used RH_RF95 LoRa header (TO, FROM, ID, FLAGS — here always the
//! broadcast values `FF FF 00 00`). The concrete radio hardware is behind
//! [`RadioLink`] since no SPI/LoRa driver crate appears anywhere in the
//! corpus — this crate owns only the framing, not the transport.

use bp7::bundle::Bundle;

use super::PushCla;
use crate::data::Node;

const HEADER: [u8; 4] = [0xFF, 0xFF, 0x00, 0x00];

/// The byte-level transport a concrete radio module provides.
pub trait RadioLink {
    /// Non-blocking: returns `None` if nothing has arrived.
    fn try_receive(&mut self) -> Option<Vec<u8>>;
    fn send(&mut self, message: &[u8]);
}

pub struct RadioBroadcastCla {
    link: Box<dyn RadioLink>,
}

impl RadioBroadcastCla {
    pub fn new(link: Box<dyn RadioLink>) -> Self {
        RadioBroadcastCla { link }
    }
}

impl PushCla for RadioBroadcastCla {
    fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
        let Some(message) = self.link.try_receive() else {
            return (None, None);
        };
        log::debug!("received a message over the radio broadcast cla");
        if message.len() < HEADER.len() {
            log::warn!("radio broadcast cla received a message shorter than its header, discarding");
            return (None, None);
        }
        match Bundle::try_from(&message[HEADER.len()..]) {
            Ok(bundle) => (Some(bundle), None),
            Err(e) => {
                log::warn!("error during radio-broadcast bundle deserialization, ignoring bundle: {e}");
                (None, None)
            }
        }
    }

    fn send_to(&mut self, node: Option<&Node>, bytes: &[u8]) -> bool {
        if node.is_some() {
            log::warn!("cannot address a specific node with a broadcast cla");
            return false;
        }
        let mut message = Vec::with_capacity(HEADER.len() + bytes.len());
        message.extend_from_slice(&HEADER);
        message.extend_from_slice(bytes);
        log::debug!("sending a bundle over the radio broadcast cla");
        self.link.send(&message);
        true
    }

    fn is_broadcast(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoopbackLink {
        pending: Option<Vec<u8>>,
    }

    impl RadioLink for LoopbackLink {
        fn try_receive(&mut self) -> Option<Vec<u8>> {
            self.pending.take()
        }

        fn send(&mut self, message: &[u8]) {
            self.pending = Some(message.to_vec());
        }
    }

    #[test]
    fn strips_the_four_byte_header_on_receive() {
        let link = LoopbackLink { pending: None };
        let mut cla = RadioBroadcastCla::new(Box::new(link));
        cla.link.send(b"not-enough");
        let (bundle, from) = cla.poll();
        assert!(bundle.is_none());
        assert!(from.is_none());
    }
}
