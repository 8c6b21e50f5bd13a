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

//! Pull-based CLA talking to a peer exposing a small bundle-index HTTP
//! API. A minimal HTTP/1.1 client lives directly in this file: the only
//! HTTP dependency this crate has is this adapter's own request/response
//! handling, not a general-purpose client library (no HTTP client crate
//! appears anywhere in the corpus for this kind of peer).

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bp7::bundle::Bundle;

use super::PullCla;
use crate::data::Node;

pub const CLA_IDENTIFIER: &str = "http";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpPeerCla {
    /// Nodes we have successfully talked to at least once; a failed
    /// request drops the node from this set so the next attempt starts
    /// fresh, mirroring "drop the client on failure".
    known_good: HashSet<String>,
}

impl Default for HttpPeerCla {
    fn default() -> Self {
        HttpPeerCla { known_good: HashSet::new() }
    }
}

impl HttpPeerCla {
    pub fn new() -> Self {
        Self::default()
    }
}

fn connect(address: &str, port: u16) -> std::io::Result<TcpStream> {
    let socket_addr = format!("{address}:{port}")
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid address"))?;
    let stream = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(stream)
}

fn send_request(stream: &mut TcpStream, request: &[u8]) -> std::io::Result<()> {
    stream.write_all(request)
}

/// Reads a full HTTP/1.1 response (headers + body) off a stream opened
/// for exactly one request, relying on the server closing the connection
/// or sending `Content-Length`.
fn read_response(stream: &mut TcpStream) -> std::io::Result<(u16, Vec<u8>)> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no header terminator"))?;
    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.lines();
    let status_line = lines.next().unwrap_or_default();
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let body = raw[header_end + 4..].to_vec();
    Ok((status_code, body))
}

fn http_get(address: &str, port: u16, path: &str) -> std::io::Result<(u16, Vec<u8>)> {
    let mut stream = connect(address, port)?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {address}\r\nConnection: close\r\n\r\n");
    send_request(&mut stream, request.as_bytes())?;
    read_response(&mut stream)
}

fn http_post(address: &str, port: u16, path: &str, body: &[u8]) -> std::io::Result<(u16, Vec<u8>)> {
    let mut stream = connect(address, port)?;
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: {address}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    send_request(&mut stream, &request)?;
    read_response(&mut stream)
}

impl PullCla for HttpPeerCla {
    fn poll_ids(&mut self, node: &Node) -> Option<Vec<String>> {
        let port = *node.clas.get(CLA_IDENTIFIER)?;
        match http_get(&node.address, port, "/bundles") {
            Ok((200, body)) => {
                let text = String::from_utf8_lossy(&body);
                Some(text.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
            }
            _ => {
                self.known_good.remove(&node.address);
                None
            }
        }
    }

    fn poll(&mut self, bundle_id: &str, node: &Node) -> (Option<Bundle>, Option<String>) {
        let Some(&port) = node.clas.get(CLA_IDENTIFIER) else {
            return (None, None);
        };
        let path = format!("/download?bundle_id={bundle_id}");
        match http_get(&node.address, port, &path) {
            Ok((200, body)) if body != b"Bundle not found" => match Bundle::try_from(body.as_slice()) {
                Ok(bundle) => {
                    self.known_good.insert(node.address.clone());
                    (Some(bundle), Some(node.address.clone()))
                }
                Err(e) => {
                    log::warn!("error during http-peer bundle deserialization, ignoring bundle: {e}");
                    (None, None)
                }
            },
            _ => (None, None),
        }
    }

    fn send_to(&mut self, node: &Node, bytes: &[u8]) -> bool {
        let Some(&port) = node.clas.get(CLA_IDENTIFIER) else {
            return false;
        };
        match http_post(&node.address, port, "/push", bytes) {
            Ok((200, _)) => {
                self.known_good.insert(node.address.clone());
                true
            }
            Ok((status, _)) => {
                log::warn!("connection {} did not accept our bundle: status {status}", node.address);
                self.known_good.remove(&node.address);
                false
            }
            Err(e) => {
                log::warn!("removing bad http-peer connection {}: {e}", node.address);
                self.known_good.remove(&node.address);
                false
            }
        }
    }
}
