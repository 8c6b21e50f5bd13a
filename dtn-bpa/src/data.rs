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

//! The three records the store keeps: a known neighbor, a bundle's in-agent
//! wrapper, and the reason codes attached to a deletion.

use std::collections::HashSet;

use bp7::bundle::Bundle;

/// A known neighbor, keyed by its address (the only identity this node has).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub address: String,
    pub eid_scheme: u64,
    pub eid_specific: String,
    pub clas: std::collections::HashMap<String, u16>,
    pub sequence_number: u32,
    pub last_seen_ms: u64,
}

impl Node {
    pub fn new(address: String, eid_scheme: u64, eid_specific: String, sequence_number: u32, last_seen_ms: u64) -> Self {
        Node {
            address,
            eid_scheme,
            eid_specific,
            clas: std::collections::HashMap::new(),
            sequence_number,
            last_seen_ms,
        }
    }
}

/// RFC9171 §3.3 retention constraints this agent actually tracks.
/// `reassembly-pending` does not appear: fragmentation is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionConstraint {
    DispatchPending,
    ForwardPending,
}

/// Reasons carried by a Bundle Status Report, RFC9171 §6.1.1. The agent
/// never emits the report itself (see the deletion-report hook) but still
/// needs the codes internally to pick the eventual log reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    NoAdditionalInformation = 0,
    LifetimeExpired = 1,
    ForwardedOverUnidirectionalLink = 2,
    TransmissionCanceled = 3,
    DepletedStorage = 4,
    DestinationEndpointIdUnavailable = 5,
    NoKnownRouteToDestination = 6,
    NoTimelyContactWithNextNode = 7,
    BlockUnintelligible = 8,
    HopLimitExceeded = 9,
    TrafficPared = 10,
    BlockUnsupported = 11,
}

/// A delayable reason means the forwarding failure may resolve itself later
/// (a neighbor shows up, a link clears) and the bundle should sit in the
/// store rather than be deleted outright.
impl ReasonCode {
    pub fn is_delayable(self) -> bool {
        matches!(
            self,
            ReasonCode::NoKnownRouteToDestination
                | ReasonCode::NoTimelyContactWithNextNode
                | ReasonCode::TrafficPared
        )
    }
}

/// The in-agent wrapper around a `Bundle`. Owns the bundle so it can be
/// mutated in place across many cooperative-loop ticks (the retry queue)
/// instead of being re-parsed each time.
#[derive(Debug, Clone)]
pub struct BundleInformation {
    pub bundle: Bundle,
    pub retention_constraint: Option<RetentionConstraint>,
    pub locally_delivered: bool,
    pub received_at_ms: u64,
    pub forwarded_to_nodes: HashSet<String>,
}

impl BundleInformation {
    pub fn new(bundle: Bundle, received_at_ms: u64) -> Self {
        BundleInformation {
            bundle,
            retention_constraint: None,
            locally_delivered: false,
            received_at_ms,
            forwarded_to_nodes: HashSet::new(),
        }
    }
}
