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

//! MTCP: each bundle travels as one CBOR byte-string item over its own TCP
//! stream. The hardest CLA here, since it juggles three connection states
//! per the spec: waiting-accept (the listener's own backlog), open-receive
//! (accepted, still producing messages), gracefully-shutdown (half-closed,
//! draining whatever the remote still has in flight).

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};

use bp7::bundle::Bundle;

use super::PushCla;
use crate::clock::Clock;
use crate::data::Node;
use crate::util::is_timestamp_older_than_timeout;

pub const CLA_IDENTIFIER: &str = "mtcp";

const TYPE_BYTES: u8 = 0x40;
const CBOR_TYPE_MASK: u8 = 0xE0;
const CBOR_INFO_BITS: u8 = 0x1F;
const CBOR_UINT8_FOLLOWS: u8 = 24;
const CBOR_UINT16_FOLLOWS: u8 = 25;
const CBOR_UINT32_FOLLOWS: u8 = 26;
const CBOR_UINT64_FOLLOWS: u8 = 27;

#[derive(Debug)]
enum ReadOutcome {
    Pending,
    RemoteClosed,
    ProtocolViolation,
    Message(Vec<u8>),
}

/// Reads one non-blocking step of "one CBOR byte-string header, then
/// exactly that many payload bytes". Once the header is known this busy-
/// loops the stream until the remainder arrives or the peer closes —
/// matching the reference implementation's own blocking behavior once a
/// message has started.
fn read_one_message(stream: &mut TcpStream) -> ReadOutcome {
    let mut header_byte = [0u8; 1];
    match stream.read(&mut header_byte) {
        Ok(0) => return ReadOutcome::RemoteClosed,
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::Pending,
        Err(_) => return ReadOutcome::RemoteClosed,
    }

    let header = header_byte[0];
    if header & CBOR_TYPE_MASK != TYPE_BYTES {
        return ReadOutcome::ProtocolViolation;
    }
    let info = header & CBOR_INFO_BITS;

    let length = if info <= 23 {
        u64::from(info)
    } else {
        let extra = match info {
            CBOR_UINT8_FOLLOWS => 1,
            CBOR_UINT16_FOLLOWS => 2,
            CBOR_UINT32_FOLLOWS => 4,
            CBOR_UINT64_FOLLOWS => 8,
            _ => return ReadOutcome::ProtocolViolation,
        };
        match read_exactly_blocking(stream, extra) {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf[8 - extra..].copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            }
            None => return ReadOutcome::RemoteClosed,
        }
    };

    match read_exactly_blocking(stream, length as usize) {
        Some(bytes) => ReadOutcome::Message(bytes),
        None => ReadOutcome::RemoteClosed,
    }
}

fn read_exactly_blocking(stream: &mut TcpStream, num_bytes: usize) -> Option<Vec<u8>> {
    let mut result = Vec::with_capacity(num_bytes);
    let mut remaining = num_bytes;
    let mut chunk = [0u8; 4096];
    while remaining > 0 {
        let to_read = remaining.min(chunk.len());
        match stream.read(&mut chunk[..to_read]) {
            Ok(0) => return None,
            Ok(n) => {
                result.extend_from_slice(&chunk[..n]);
                remaining -= n;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(_) => return None,
        }
    }
    Some(result)
}

struct OpenReceiveConnection {
    stream: TcpStream,
    last_received_ms: u64,
}

pub struct MtcpCla {
    listener: TcpListener,
    max_open_receive: usize,
    timeout_inactive_receive_ms: u64,
    timeout_stalled_send_ms: u64,
    open_receive: HashMap<SocketAddr, OpenReceiveConnection>,
    gracefully_shutdown: HashMap<SocketAddr, TcpStream>,
}

impl MtcpCla {
    pub fn bind(
        port: u16,
        max_open_receive: usize,
        timeout_inactive_receive_ms: u64,
        timeout_stalled_send_ms: u64,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(MtcpCla {
            listener,
            max_open_receive,
            timeout_inactive_receive_ms,
            timeout_stalled_send_ms,
            open_receive: HashMap::new(),
            gracefully_shutdown: HashMap::new(),
        })
    }

    fn accept_new_connections(&mut self) {
        if self.open_receive.len() >= self.max_open_receive {
            return;
        }
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let _ = stream.set_nonblocking(true);
                // Multiple connections from the same address are allowed:
                // by the time we could refuse one, the whole bundle may
                // already be in flight.
                self.open_receive.insert(
                    addr,
                    OpenReceiveConnection {
                        stream,
                        last_received_ms: 0,
                    },
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => {}
        }
    }

    fn poll_open_receive(&mut self, clock: &dyn Clock) -> (Option<Vec<u8>>, Option<String>) {
        let mut timed_out = Vec::new();
        let mut found = None;
        for (addr, conn) in &mut self.open_receive {
            match read_one_message(&mut conn.stream) {
                ReadOutcome::Message(bytes) => {
                    conn.last_received_ms = clock.now_ms();
                    found = Some((*addr, bytes));
                    break;
                }
                ReadOutcome::RemoteClosed => {
                    log::debug!("remote closed incoming mtcp connection {addr}");
                    timed_out.push((*addr, false));
                }
                ReadOutcome::ProtocolViolation => {
                    log::warn!("incoming mtcp connection {addr} sent a malformed header, discarding");
                    timed_out.push((*addr, false));
                }
                ReadOutcome::Pending => {
                    if conn.last_received_ms != 0
                        && is_timestamp_older_than_timeout(clock.now_ms(), conn.last_received_ms, self.timeout_inactive_receive_ms)
                    {
                        timed_out.push((*addr, true));
                    }
                }
            }
        }

        for (addr, graceful) in timed_out {
            if let Some(conn) = self.open_receive.remove(&addr) {
                if graceful {
                    log::debug!("gracefully closing idle mtcp connection {addr}");
                    if conn.stream.shutdown(Shutdown::Write).is_ok() {
                        self.gracefully_shutdown.insert(addr, conn.stream);
                    }
                } else {
                    let _ = conn.stream.shutdown(Shutdown::Both);
                }
            }
        }

        match found {
            Some((addr, bytes)) => (Some(bytes), Some(addr.ip().to_string())),
            None => (None, None),
        }
    }

    fn poll_gracefully_shutdown(&mut self) -> (Option<Vec<u8>>, Option<String>) {
        let mut closed = Vec::new();
        let mut found = None;
        for (addr, stream) in &mut self.gracefully_shutdown {
            match read_one_message(stream) {
                ReadOutcome::Message(bytes) => {
                    found = Some((*addr, bytes));
                    break;
                }
                ReadOutcome::RemoteClosed | ReadOutcome::ProtocolViolation => closed.push(*addr),
                ReadOutcome::Pending => {}
            }
        }
        for addr in closed {
            self.gracefully_shutdown.remove(&addr);
        }
        match found {
            Some((addr, bytes)) => (Some(bytes), Some(addr.ip().to_string())),
            None => (None, None),
        }
    }

    pub fn poll_with_clock(&mut self, clock: &dyn Clock) -> (Option<Bundle>, Option<String>) {
        self.accept_new_connections();

        let (bytes, from) = match self.poll_open_receive(clock) {
            (Some(bytes), from) => (Some(bytes), from),
            (None, _) => self.poll_gracefully_shutdown(),
        };

        let Some(bytes) = bytes else { return (None, None) };
        match Bundle::try_from(bytes.as_slice()) {
            Ok(bundle) => (Some(bundle), from),
            Err(e) => {
                log::warn!("error during mtcp bundle deserialization, ignoring bundle: {e}");
                (None, None)
            }
        }
    }
}

impl PushCla for MtcpCla {
    fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
        // When not driven with an explicit clock (tests aside) the system
        // clock is close enough for the inactivity timeout.
        struct NowOnly;
        impl Clock for NowOnly {
            fn now_ms(&self) -> u64 {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            }
            fn dtn_now(&self) -> Option<bp7::time::DtnTime> {
                None
            }
        }
        self.poll_with_clock(&NowOnly)
    }

    fn send_to(&mut self, node: Option<&Node>, bytes: &[u8]) -> bool {
        let Some(node) = node else {
            log::warn!("cannot send with mtcp cla without a destination node");
            return false;
        };
        let Some(&port) = node.clas.get(CLA_IDENTIFIER) else {
            return false;
        };

        match send_message(&node.address, port, bytes, self.timeout_stalled_send_ms) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("mtcp send to {}:{port} failed: {e}", node.address);
                false
            }
        }
    }

    fn is_broadcast(&self) -> bool {
        false
    }
}

fn send_message(address: &str, port: u16, payload: &[u8], timeout_stalled_send_ms: u64) -> std::io::Result<()> {
    let mut header = Vec::with_capacity(9 + payload.len());
    encode_byte_string_header(payload.len(), &mut header);
    header.extend_from_slice(payload);

    let stream = TcpStream::connect((address, port))?;
    stream.set_nonblocking(true)?;
    let mut stream = stream;

    let mut remaining: &[u8] = &header;
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_stalled_send_ms);
    while !remaining.is_empty() {
        if std::time::Instant::now() > deadline {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "mtcp send stalled"));
        }
        match stream.write(remaining) {
            Ok(0) => return Err(std::io::Error::new(ErrorKind::ConnectionReset, "remote closed during send")),
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn encode_byte_string_header(len: usize, out: &mut Vec<u8>) {
    if len <= 23 {
        out.push(TYPE_BYTES | len as u8);
    } else if len <= 0xFF {
        out.push(TYPE_BYTES | CBOR_UINT8_FOLLOWS);
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(TYPE_BYTES | CBOR_UINT16_FOLLOWS);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(TYPE_BYTES | CBOR_UINT32_FOLLOWS);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_short_and_long_byte_string_headers() {
        let mut out = Vec::new();
        encode_byte_string_header(5, &mut out);
        assert_eq!(out, vec![TYPE_BYTES | 5]);

        let mut out = Vec::new();
        encode_byte_string_header(300, &mut out);
        assert_eq!(out[0], TYPE_BYTES | CBOR_UINT16_FOLLOWS);
        assert_eq!(u16::from_be_bytes([out[1], out[2]]), 300);
    }
}
