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

//! IP Neighbor Discovery: periodic UDP broadcast of a beacon describing
//! this node's EID and advertised CLA services, and learning of peers
//! from the beacons they send back.

use std::collections::HashMap;
use std::net::UdpSocket;

use bitflags::bitflags;
use serde_cbor::Value;

use crate::clock::Clock;
use crate::data::Node;
use crate::store::Store;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BeaconFlags: u8 {
        const EID_PRESENT = 0x01;
        const SERVICE_BLOCK_PRESENT = 0x02;
        const PERIOD_PRESENT = 0x04;
    }
}

const UNICAST_MARKER_KEY: i64 = 42;
const UNICAST_MARKER_VALUE: &[u8] = b"unicast";

#[derive(Debug, Clone)]
pub struct Beacon {
    pub version: u8,
    pub flags: BeaconFlags,
    pub eid: Option<(u64, String)>,
    pub sequence_number: u32,
    pub services: (Vec<(String, u16)>, HashMap<i64, Vec<u8>>),
    pub period: Option<u32>,
}

#[derive(Debug)]
pub struct BeaconDecodeError(String);

impl std::fmt::Display for BeaconDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "could not decode beacon: {}", self.0)
    }
}
impl std::error::Error for BeaconDecodeError {}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(n) => u64::try_from(*n).ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        _ => None,
    }
}

impl Beacon {
    pub fn new(eid: Option<(u64, String)>, services: (Vec<(String, u16)>, HashMap<i64, Vec<u8>>)) -> Self {
        let mut flags = BeaconFlags::empty();
        if eid.is_some() {
            flags |= BeaconFlags::EID_PRESENT;
        }
        flags |= BeaconFlags::SERVICE_BLOCK_PRESENT;
        Beacon {
            version: 7,
            flags,
            eid,
            sequence_number: 0,
            services,
            period: None,
        }
    }

    pub fn increment_sequence_number(&mut self) {
        self.sequence_number = self.sequence_number.wrapping_add(1);
    }

    pub fn is_continuous_with(&self, previous_sequence_number: u32) -> bool {
        self.sequence_number == previous_sequence_number.wrapping_add(1)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut items = vec![Value::Integer(i128::from(self.version)), Value::Integer(i128::from(self.flags.bits()))];
        if self.flags.contains(BeaconFlags::EID_PRESENT) {
            if let Some((scheme, specific)) = &self.eid {
                items.push(Value::Array(vec![Value::Integer(i128::from(*scheme)), Value::Text(specific.clone())]));
            }
        }
        items.push(Value::Integer(i128::from(self.sequence_number)));
        if self.flags.contains(BeaconFlags::SERVICE_BLOCK_PRESENT) {
            let list = Value::Array(
                self.services
                    .0
                    .iter()
                    .map(|(id, port)| Value::Array(vec![Value::Text(id.clone()), Value::Integer(i128::from(*port))]))
                    .collect(),
            );
            let map = Value::Map(
                self.services
                    .1
                    .iter()
                    .map(|(k, v)| (Value::Integer(i128::from(*k)), Value::Bytes(v.clone())))
                    .collect(),
            );
            items.push(Value::Array(vec![list, map]));
        }
        if let Some(period) = self.period {
            items.push(Value::Integer(i128::from(period)));
        }
        serde_cbor::to_vec(&Value::Array(items)).expect("a beacon built from plain values always serializes")
    }

    /// Tolerates the EID/sequence-number field-order ambiguity between the
    /// ipnd thesis layout and dtn7rs' own convention by dispatching on CBOR
    /// type rather than a fixed position.
    pub fn from_bytes(data: &[u8]) -> Result<Beacon, BeaconDecodeError> {
        let value: Value = serde_cbor::from_slice(data).map_err(|e| BeaconDecodeError(e.to_string()))?;
        let Value::Array(items) = value else {
            return Err(BeaconDecodeError("beacon is not a cbor array".into()));
        };
        if items.len() < 3 {
            return Err(BeaconDecodeError("beacon array too short".into()));
        }
        let version = as_u64(&items[0]).ok_or_else(|| BeaconDecodeError("version is not an integer".into()))? as u8;
        if version != 7 {
            return Err(BeaconDecodeError(format!("unsupported beacon version {version}")));
        }
        let flags = BeaconFlags::from_bits_truncate(as_u64(&items[1]).ok_or_else(|| BeaconDecodeError("flags is not an integer".into()))? as u8);

        let expected_len = 3
            + usize::from(flags.contains(BeaconFlags::EID_PRESENT))
            + usize::from(flags.contains(BeaconFlags::SERVICE_BLOCK_PRESENT))
            + usize::from(flags.contains(BeaconFlags::PERIOD_PRESENT));
        if items.len() != expected_len {
            return Err(BeaconDecodeError(format!("beacon length {} does not match flags (expected {})", items.len(), expected_len)));
        }

        let mut sequence_number = None;
        let mut period = None;
        let mut eid = None;
        let mut services = (Vec::new(), HashMap::new());

        for item in &items[2..] {
            match item {
                Value::Integer(_) => {
                    let n = as_u64(item).ok_or_else(|| BeaconDecodeError("non-integer in integer slot".into()))?;
                    if sequence_number.is_none() {
                        sequence_number = Some(n as u32);
                    } else if flags.contains(BeaconFlags::PERIOD_PRESENT) {
                        period = Some(n as u32);
                    }
                }
                Value::Array(inner) => {
                    if eid.is_none() && flags.contains(BeaconFlags::EID_PRESENT) {
                        if inner.len() != 2 {
                            return Err(BeaconDecodeError("eid tuple must have 2 elements".into()));
                        }
                        let scheme = as_u64(&inner[0]).ok_or_else(|| BeaconDecodeError("eid scheme is not an integer".into()))?;
                        let specific = as_string(&inner[1]).ok_or_else(|| BeaconDecodeError("eid specific part is not text".into()))?;
                        eid = Some((scheme, specific));
                    } else if flags.contains(BeaconFlags::SERVICE_BLOCK_PRESENT) {
                        if inner.len() != 2 {
                            return Err(BeaconDecodeError("service block must have 2 elements".into()));
                        }
                        let Value::Array(list_items) = &inner[0] else {
                            return Err(BeaconDecodeError("service list is not an array".into()));
                        };
                        let mut list = Vec::with_capacity(list_items.len());
                        for entry in list_items {
                            let Value::Array(pair) = entry else {
                                return Err(BeaconDecodeError("service list entry is not an array".into()));
                            };
                            if pair.len() != 2 {
                                return Err(BeaconDecodeError("service list entry must have 2 elements".into()));
                            }
                            let id = as_string(&pair[0]).ok_or_else(|| BeaconDecodeError("service id is not text".into()))?;
                            let port = as_u64(&pair[1]).ok_or_else(|| BeaconDecodeError("service port is not an integer".into()))? as u16;
                            list.push((id, port));
                        }
                        let Value::Map(map_items) = &inner[1] else {
                            return Err(BeaconDecodeError("service map is not a map".into()));
                        };
                        let mut map = HashMap::with_capacity(map_items.len());
                        for (k, v) in map_items {
                            let Some(key) = as_u64(k) else { continue };
                            if let Value::Bytes(bytes) = v {
                                map.insert(key as i64, bytes.clone());
                            }
                        }
                        services = (list, map);
                    }
                }
                _ => {}
            }
        }

        let sequence_number = sequence_number.ok_or_else(|| BeaconDecodeError("no sequence number present".into()))?;
        Ok(Beacon {
            version,
            flags,
            eid,
            sequence_number,
            services,
            period,
        })
    }
}

pub struct Ipnd {
    socket: UdpSocket,
    own_beacon: Beacon,
    broadcast_addresses: Vec<String>,
    own_addresses: Vec<String>,
    ipnd_port: u16,
    beacon_max_size: usize,
    send_interval_ms: u64,
    last_broadcast_ms: u64,
}

impl Ipnd {
    pub fn bind(
        bind_port: u16,
        ipnd_port: u16,
        beacon_max_size: usize,
        send_interval_ms: u64,
        broadcast_addresses: Vec<String>,
        own_addresses: Vec<String>,
        own_beacon: Beacon,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", bind_port))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(Ipnd {
            socket,
            own_beacon,
            broadcast_addresses,
            own_addresses,
            ipnd_port,
            beacon_max_size,
            send_interval_ms,
            last_broadcast_ms: 0,
        })
    }

    /// One non-blocking receive pass, plus a broadcast if the send
    /// interval has elapsed. Holds `&mut self` across the whole call so
    /// the service-block mutation used for the unicast-reply marker can
    /// never race a concurrent broadcast (see design notes).
    pub fn update(&mut self, store: &mut Store, clock: &dyn Clock) {
        let mut buf = vec![0u8; self.beacon_max_size];
        if let Ok((len, from)) = self.socket.recv_from(&mut buf) {
            let address = from.ip().to_string();
            if !self.own_addresses.contains(&address) {
                match Beacon::from_bytes(&buf[..len]) {
                    Ok(beacon) => self.handle_beacon(store, clock, &address, &beacon),
                    Err(e) => log::warn!("could not decode beacon from {address}: {e}"),
                }
            }
        }

        if crate::util::is_timestamp_older_than_timeout(clock.now_ms(), self.last_broadcast_ms, self.send_interval_ms) {
            for address in self.broadcast_addresses.clone() {
                self.send_own_beacon_to(&address);
            }
            self.own_beacon.increment_sequence_number();
            self.last_broadcast_ms = clock.now_ms();
        }
    }

    fn handle_beacon(&mut self, store: &mut Store, clock: &dyn Clock, address: &str, beacon: &Beacon) {
        let clas: HashMap<String, u16> = beacon.services.0.iter().cloned().collect();
        let (eid_scheme, eid_specific) = beacon.eid.clone().unwrap_or((0, String::new()));

        let sequence_continuous = match store.get_node(address) {
            None => {
                log::debug!("received beacon from new node: {address}");
                let mut node = Node::new(address.to_string(), eid_scheme, eid_specific, beacon.sequence_number, clock.now_ms());
                node.clas = clas;
                store.add_node(node);
                false
            }
            Some(mut node) => {
                log::debug!("received beacon from known node: {address}");
                let sequence_continuous = beacon.is_continuous_with(node.sequence_number);
                node.eid_scheme = eid_scheme;
                node.eid_specific = eid_specific;
                node.clas = clas;
                node.sequence_number = beacon.sequence_number;
                node.last_seen_ms = clock.now_ms();
                store.add_node(node);
                sequence_continuous
            }
        };

        if !sequence_continuous {
            let already_marked = beacon.services.1.get(&UNICAST_MARKER_KEY).is_some_and(|v| v == UNICAST_MARKER_VALUE);
            if !already_marked {
                self.own_beacon.services.1.insert(UNICAST_MARKER_KEY, UNICAST_MARKER_VALUE.to_vec());
                self.send_own_beacon_to(address);
                self.own_beacon.services.1.remove(&UNICAST_MARKER_KEY);
            }
        }
    }

    fn send_own_beacon_to(&self, address: &str) {
        let message = self.own_beacon.to_bytes();
        if let Err(e) = self.socket.send_to(&message, (address, self.ipnd_port)) {
            log::debug!("failed to send beacon to {address}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_round_trips_through_cbor() {
        let mut services = HashMap::new();
        services.insert(42_i64, b"unicast".to_vec());
        let beacon = Beacon::new(Some((1, "//n1/".to_string())), (vec![("mtcp".to_string(), 16162)], services));
        let encoded = beacon.to_bytes();
        let decoded = Beacon::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.eid, beacon.eid);
        assert_eq!(decoded.sequence_number, beacon.sequence_number);
        assert_eq!(decoded.services.0, beacon.services.0);
        assert_eq!(decoded.services.1.get(&42), Some(&b"unicast".to_vec()));
    }

    #[test]
    fn sequence_wraps_around_at_32_bits() {
        let mut beacon = Beacon::new(None, (Vec::new(), HashMap::new()));
        beacon.sequence_number = u32::MAX;
        assert!(beacon.is_continuous_with(u32::MAX - 1));
        beacon.increment_sequence_number();
        assert_eq!(beacon.sequence_number, 0);
    }

    #[test]
    fn rejects_non_version_7_beacons() {
        let value = Value::Array(vec![Value::Integer(6), Value::Integer(0), Value::Integer(0)]);
        let bytes = serde_cbor::to_vec(&value).unwrap();
        assert!(Beacon::from_bytes(&bytes).is_err());
    }
}
