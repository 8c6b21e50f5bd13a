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

//! Application-facing mailboxes. A [`LocalEndpoint`]/[`LocalGroupEndpoint`]
//! is the handle an application holds to send and receive bundles; the
//! [`EndpointState`] it shares with the BPA's registry is the actual
//! delivery target, so registration never requires the BPA to hold a
//! reference back to the endpoint object itself.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bp7::block::bundle_age_block::BundleAgeBlock;
use bp7::block::hop_count_block::HopCountBlock;
use bp7::block::payload_block::PayloadBlock;
use bp7::block::{Block, CanonicalBlock};
use bp7::blockflags::BlockFlags;
use bp7::bundle::Bundle;
use bp7::bundleflags::BundleFlags;
use bp7::crc::CRCType;
use bp7::endpoint::Endpoint;
use bp7::primaryblock::PrimaryBlock;
use bp7::time::{CreationTimestamp, DtnTime};

use crate::bpa::Bpa;
use crate::error::BpaError;

pub type BpaHandle = Rc<RefCell<Bpa>>;

/// Where a delivered bundle goes: straight to a callback, or into a FIFO
/// buffer the application drains with `poll()`.
pub enum Receiver {
    Callback(Box<dyn Fn(Bundle)>),
    Buffered(VecDeque<Bundle>),
}

/// The BPA's side of a registration: owned jointly by the registry and by
/// every [`LocalEndpoint`]/[`LocalGroupEndpoint`] handle pointing at it.
pub struct EndpointState {
    pub uri: String,
    pub receiver: Receiver,
}

impl EndpointState {
    pub fn deliver(&mut self, bundle: Bundle) {
        match &mut self.receiver {
            Receiver::Callback(callback) => callback(bundle),
            Receiver::Buffered(queue) => queue.push_back(bundle),
        }
    }
}

fn derive_endpoint_uri(node_uri: &str, endpoint_identifier: &str) -> String {
    if node_uri.starts_with("dtn://") {
        format!("{node_uri}{endpoint_identifier}")
    } else if endpoint_identifier.is_empty() {
        node_uri.to_string()
    } else {
        format!("{node_uri}.{endpoint_identifier}")
    }
}

fn anonymous_uri(destination_uri: &str) -> &'static str {
    if destination_uri.starts_with("dtn://") || destination_uri == "dtn:none" {
        "dtn:none"
    } else {
        "ipn:none"
    }
}

/// The application's handle to a unicast local endpoint.
pub struct LocalEndpoint {
    bpa: BpaHandle,
    endpoint_identifier: String,
    full_uri: String,
    state: Rc<RefCell<EndpointState>>,
    last_bundle_creation_time: Cell<u64>,
    last_sequence_number: Cell<u32>,
}

impl LocalEndpoint {
    pub fn endpoint_identifier(&self) -> &str {
        &self.endpoint_identifier
    }

    pub fn full_endpoint_uri(&self) -> &str {
        &self.full_uri
    }

    /// Builds a Primary Block addressed at `destination_uri`, appends it to
    /// the BPA's local dispatch queue, and returns its bundle id.
    pub fn start_transmission(&self, payload: Vec<u8>, destination_uri: &str, lifetime_ms: u64, anonymous: bool) -> Result<String, BpaError> {
        let destination = Endpoint::new(destination_uri).ok_or_else(|| BpaError::InvalidEndpointUri(destination_uri.to_string()))?;

        let source = if anonymous {
            Endpoint::new(anonymous_uri(destination_uri)).expect("the anonymous uri constants always parse")
        } else {
            Endpoint::new(&self.full_uri).expect("full_uri was validated at registration time")
        };
        let report_to = if anonymous {
            source.clone()
        } else {
            Endpoint::new(&self.bpa.borrow().node_uri).expect("node_uri was validated at bpa construction")
        };

        let clockless = self.bpa.borrow().clock.dtn_now().is_none();
        let (creation_time, sequence_number) = if clockless {
            let seq = self.last_sequence_number.get() + 1;
            self.last_sequence_number.set(seq);
            (DtnTime { timestamp: 0 }, u64::from(seq))
        } else {
            let now = self.bpa.borrow().clock.dtn_now().expect("checked above");
            if now.timestamp == self.last_bundle_creation_time.get() {
                let seq = self.last_sequence_number.get() + 1;
                self.last_sequence_number.set(seq);
            } else {
                self.last_bundle_creation_time.set(now.timestamp);
                self.last_sequence_number.set(0);
            }
            (now, u64::from(self.last_sequence_number.get()))
        };

        let mut blocks = vec![CanonicalBlock {
            block: Block::Payload(PayloadBlock { data: payload }),
            block_number: 1,
            block_flags: BlockFlags::empty(),
            crc: CRCType::NoCRC,
        }];
        blocks.push(CanonicalBlock {
            block: Block::HopCount(HopCountBlock { limit: 32, count: 0 }),
            block_number: 2,
            block_flags: BlockFlags::empty(),
            crc: CRCType::NoCRC,
        });
        if clockless {
            blocks.push(CanonicalBlock {
                block: Block::BundleAge(BundleAgeBlock { age: 0 }),
                block_number: 3,
                block_flags: BlockFlags::empty(),
                crc: CRCType::NoCRC,
            });
        }

        let bundle = Bundle {
            primary_block: PrimaryBlock {
                version: 7,
                bundle_processing_flags: BundleFlags::MUST_NOT_FRAGMENT,
                crc: CRCType::NoCRC,
                destination_endpoint: destination,
                source_node: source,
                report_to,
                creation_timestamp: CreationTimestamp {
                    creation_time,
                    sequence_number,
                },
                lifetime: lifetime_ms,
            },
            blocks,
        };

        let bundle_id = bundle.bundle_id();
        log::debug!("starting transmission of bundle {bundle_id}");
        self.bpa.borrow_mut().enqueue_for_dispatch(bundle);
        Ok(bundle_id)
    }

    pub fn cancel_transmission(&self, bundle_id: &str) -> bool {
        self.bpa.borrow_mut().cancel_transmission(bundle_id)
    }

    /// Returns the next buffered bundle, or an error if this endpoint is
    /// callback-based and therefore never buffers anything to poll.
    pub fn poll(&self) -> Result<Option<Bundle>, BpaError> {
        let mut state = self.state.borrow_mut();
        match &mut state.receiver {
            Receiver::Callback(_) => Err(BpaError::EndpointIsCallbackBased),
            Receiver::Buffered(queue) => Ok(queue.pop_front()),
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.bpa.borrow_mut().endpoints.remove(&self.full_uri);
    }
}

/// The application's handle to a group endpoint. Multiple registrants may
/// share the same group uri; each gets its own `EndpointState`.
pub struct LocalGroupEndpoint {
    bpa: BpaHandle,
    full_uri: String,
    state: Rc<RefCell<EndpointState>>,
}

impl LocalGroupEndpoint {
    pub fn full_endpoint_uri(&self) -> &str {
        &self.full_uri
    }

    pub fn poll(&self) -> Result<Option<Bundle>, BpaError> {
        let mut state = self.state.borrow_mut();
        match &mut state.receiver {
            Receiver::Callback(_) => Err(BpaError::EndpointIsCallbackBased),
            Receiver::Buffered(queue) => Ok(queue.pop_front()),
        }
    }
}

impl Drop for LocalGroupEndpoint {
    fn drop(&mut self) {
        let mut bpa = self.bpa.borrow_mut();
        if let Some(list) = bpa.group_endpoints.get_mut(&self.full_uri) {
            list.retain(|s| !Rc::ptr_eq(s, &self.state));
            if list.is_empty() {
                bpa.group_endpoints.remove(&self.full_uri);
            }
        }
    }
}

/// Registers a unicast local endpoint under `node_uri + endpoint_identifier`.
pub fn register_endpoint(bpa: &BpaHandle, endpoint_identifier: &str, callback: Option<Box<dyn Fn(Bundle)>>) -> Result<LocalEndpoint, BpaError> {
    let node_uri = bpa.borrow().node_uri.clone();
    let full_uri = derive_endpoint_uri(&node_uri, endpoint_identifier);
    if !crate::util::is_correct_endpoint_uri(&full_uri) {
        return Err(BpaError::InvalidEndpointUri(full_uri));
    }

    let mut bpa_mut = bpa.borrow_mut();
    if bpa_mut.endpoints.contains_key(&full_uri) {
        return Err(BpaError::EndpointAlreadyRegistered(full_uri));
    }
    let receiver = match callback {
        Some(callback) => Receiver::Callback(callback),
        None => Receiver::Buffered(VecDeque::new()),
    };
    let state = Rc::new(RefCell::new(EndpointState { uri: full_uri.clone(), receiver }));
    bpa_mut.endpoints.insert(full_uri.clone(), state.clone());
    drop(bpa_mut);

    Ok(LocalEndpoint {
        bpa: bpa.clone(),
        endpoint_identifier: endpoint_identifier.to_string(),
        full_uri,
        state,
        last_bundle_creation_time: Cell::new(0),
        last_sequence_number: Cell::new(0),
    })
}

pub fn unregister_endpoint(bpa: &BpaHandle, full_uri: &str) -> Result<(), BpaError> {
    let mut bpa_mut = bpa.borrow_mut();
    if bpa_mut.endpoints.remove(full_uri).is_none() {
        return Err(BpaError::EndpointNotRegistered(full_uri.to_string()));
    }
    Ok(())
}

/// Registers a new registrant under a caller-supplied full group uri
/// (which must already contain a `~`-prefixed final segment).
pub fn register_group_endpoint(bpa: &BpaHandle, full_group_uri: &str, callback: Option<Box<dyn Fn(Bundle)>>) -> Result<LocalGroupEndpoint, BpaError> {
    if !crate::util::is_correct_group_uri(full_group_uri) {
        return Err(BpaError::InvalidGroupUri(full_group_uri.to_string()));
    }
    let receiver = match callback {
        Some(callback) => Receiver::Callback(callback),
        None => Receiver::Buffered(VecDeque::new()),
    };
    let state = Rc::new(RefCell::new(EndpointState {
        uri: full_group_uri.to_string(),
        receiver,
    }));
    bpa.borrow_mut().group_endpoints.entry(full_group_uri.to_string()).or_default().push(state.clone());

    Ok(LocalGroupEndpoint {
        bpa: bpa.clone(),
        full_uri: full_group_uri.to_string(),
        state,
    })
}

pub fn unregister_group_endpoint(bpa: &BpaHandle, endpoint: &LocalGroupEndpoint) -> Result<(), BpaError> {
    let mut bpa_mut = bpa.borrow_mut();
    let Some(list) = bpa_mut.group_endpoints.get_mut(&endpoint.full_uri) else {
        return Err(BpaError::EndpointNotRegistered(endpoint.full_uri.clone()));
    };
    let before = list.len();
    list.retain(|s| !Rc::ptr_eq(s, &endpoint.state));
    if list.len() == before {
        return Err(BpaError::EndpointNotRegistered(endpoint.full_uri.clone()));
    }
    if list.is_empty() {
        bpa_mut.group_endpoints.remove(&endpoint.full_uri);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_dtn_endpoint_uri_by_concatenation() {
        assert_eq!(derive_endpoint_uri("dtn://n1/", "echo"), "dtn://n1/echo");
    }

    #[test]
    fn derives_ipn_endpoint_uri_with_dot_separator() {
        assert_eq!(derive_endpoint_uri("ipn://5", "3"), "ipn://5.3");
    }

    #[test]
    fn empty_ipn_identifier_yields_the_node_uri_itself() {
        assert_eq!(derive_endpoint_uri("ipn://5", ""), "ipn://5");
    }
}
