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

//! A generic link-layer broadcast CLA: one packet per bundle, no per-node
//! addressing, bounded by the link's MTU. Generalized from a vendor
//! point-to-point wireless radio's broadcast mode to any datagram socket
//! that supports broadcast, since the framing the agent cares about is
//! identical either way.

use std::net::UdpSocket;

use bp7::bundle::Bundle;

use super::PushCla;
use crate::data::Node;

pub const DEFAULT_MTU: usize = 250;
const BROADCAST_ADDRESS: &str = "255.255.255.255";

pub struct DatagramBroadcastCla {
    socket: UdpSocket,
    broadcast_port: u16,
    mtu: usize,
}

impl DatagramBroadcastCla {
    pub fn bind(port: u16, mtu: usize) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(DatagramBroadcastCla {
            socket,
            broadcast_port: port,
            mtu,
        })
    }
}

impl PushCla for DatagramBroadcastCla {
    fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
        let mut buf = vec![0u8; self.mtu];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _from)) => match Bundle::try_from(&buf[..len]) {
                Ok(bundle) => (Some(bundle), None),
                Err(e) => {
                    log::warn!("error during datagram-broadcast bundle deserialization, ignoring bundle: {e}");
                    (None, None)
                }
            },
            Err(_) => (None, None),
        }
    }

    fn send_to(&mut self, node: Option<&Node>, bytes: &[u8]) -> bool {
        if node.is_some() {
            log::warn!("cannot address a specific node with a broadcast cla");
            return false;
        }
        if bytes.len() > self.mtu {
            log::warn!("cannot forward bundle through datagram-broadcast cla: {} bytes exceeds the {} byte mtu", bytes.len(), self.mtu);
            return false;
        }
        self.socket.send_to(bytes, (BROADCAST_ADDRESS, self.broadcast_port)).is_ok()
    }

    fn is_broadcast(&self) -> bool {
        true
    }
}
