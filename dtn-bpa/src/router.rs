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

//! Epidemic routing: forward to every known neighbor not already known to
//! have the bundle. Owns the convergence-layer registry; the store is
//! passed in by reference on each call rather than held, since the BPA
//! also needs direct access to it.

use std::collections::VecDeque;

use bp7::block::previous_node_block::PreviousNodeBlock;
use bp7::block::{Block, CanonicalBlock};
use bp7::blockflags::BlockFlags;
use bp7::crc::CRCType;
use bp7::endpoint::Endpoint;

use crate::cla::{ClaEntry, PullCla, PushCla};
use crate::data::{BundleInformation, ReasonCode};
use crate::store::Store;

pub struct EpidemicRouter {
    clas: Vec<(String, ClaEntry)>,
    min_nodes_to_forward_to: usize,
    attach_previous_node_block: bool,
}

impl EpidemicRouter {
    pub fn new(min_nodes_to_forward_to: usize, attach_previous_node_block: bool) -> Self {
        EpidemicRouter {
            clas: Vec::new(),
            min_nodes_to_forward_to,
            attach_previous_node_block,
        }
    }

    pub fn register_cla(&mut self, identifier: impl Into<String>, cla: ClaEntry) {
        self.clas.push((identifier.into(), cla));
    }

    /// Builds a resumable cursor over every configured CLA. The cursor is
    /// driven one yield at a time by the BPA's update tick; it must
    /// survive across ticks so long neighbor lists are scanned fairly.
    pub fn poll(&self) -> PollCursor {
        PollCursor { state: PollState::NextCla(0) }
    }

    /// RFC9171 §5.4 step 4: a fresh, per-hop copy of the bundle ready to
    /// hand to a CLA's `send_to`.
    fn prepare_and_serialize(&self, node_uri: &str, info: &BundleInformation, now_ms: u64) -> Vec<u8> {
        let mut bundle = info.bundle.clone();
        bundle.remove_previous_node_block();

        if self.attach_previous_node_block {
            let block_number = bundle.next_block_number();
            bundle.blocks.push(CanonicalBlock {
                block: Block::PreviousNode(PreviousNodeBlock {
                    previous_node: Endpoint::new(node_uri).expect("node uri is validated at BPA construction"),
                }),
                block_number,
                block_flags: BlockFlags::DELETE_BLOCK_WHEN_NOT_PROCESSABLE,
                crc: CRCType::NoCRC,
            });
        }

        if let Some(age) = bundle.bundle_age_block_mut() {
            age.age += now_ms.saturating_sub(info.received_at_ms);
        }
        if let Some(hop) = bundle.hop_count_block_mut() {
            hop.count += 1;
        }

        (&bundle).try_into().expect("a previously-validated bundle always re-serializes")
    }

    /// For each neighbor not already in `forwarded_to_nodes`, try every
    /// non-broadcast CLA; afterwards push once through any broadcast CLA.
    pub fn immediate_forwarding_attempt(&mut self, node_uri: &str, info: &mut BundleInformation, store: &Store, now_ms: u64) -> (bool, ReasonCode) {
        let serialized = self.prepare_and_serialize(node_uri, info, now_ms);
        let mut reason = ReasonCode::NoTimelyContactWithNextNode;

        for node in store.get_nodes() {
            if info.forwarded_to_nodes.contains(&node.address) {
                continue;
            }
            for (_, cla) in &mut self.clas {
                let success = match cla {
                    ClaEntry::Pull(cla) => cla.send_to(&node, &serialized),
                    ClaEntry::Push(cla) if !cla.is_broadcast() => cla.send_to(Some(&node), &serialized),
                    ClaEntry::Push(_) => continue,
                };
                if success {
                    info.forwarded_to_nodes.insert(node.address.clone());
                } else {
                    reason = ReasonCode::TrafficPared;
                }
            }
        }

        for (_, cla) in &mut self.clas {
            if let ClaEntry::Push(cla) = cla {
                if cla.is_broadcast() {
                    cla.send_to(None, &serialized);
                    reason = ReasonCode::ForwardedOverUnidirectionalLink;
                }
            }
        }

        (info.forwarded_to_nodes.len() >= self.min_nodes_to_forward_to, reason)
    }

    /// Best-effort recovery via the Previous Node Block: try every
    /// non-broadcast CLA in turn, stop at the first success.
    pub fn send_to_previous_node(&mut self, node_uri: &str, info: &BundleInformation, store: &Store, now_ms: u64) -> bool {
        let bundle_id = info.bundle.bundle_id();
        let Some(previous_address) = store.get_seen(&bundle_id) else {
            log::warn!("previous node of bundle {bundle_id} is not known, cannot send back to it");
            return false;
        };
        let Some(previous_node) = store.get_node(&previous_address) else {
            log::warn!("previous node of bundle {bundle_id} is not known (any more), cannot send back to it");
            return false;
        };

        let serialized = self.prepare_and_serialize(node_uri, info, now_ms);
        for (_, cla) in &mut self.clas {
            let success = match cla {
                ClaEntry::Pull(cla) => cla.send_to(&previous_node, &serialized),
                ClaEntry::Push(cla) if !cla.is_broadcast() => cla.send_to(Some(&previous_node), &serialized),
                ClaEntry::Push(_) => continue,
            };
            if success {
                return true;
            }
        }
        false
    }
}

enum PollState {
    NextCla(usize),
    PullNodes { cla_index: usize, node_addrs: VecDeque<String> },
    PushDrain { cla_index: usize },
    Done,
}

/// The reified cursor behind epidemic polling. `next` takes the router and
/// store by reference each call rather than owning them, since both are
/// also used directly by the BPA between cursor advances.
pub struct PollCursor {
    state: PollState,
}

impl PollCursor {
    pub fn next(&mut self, router: &mut EpidemicRouter, store: &mut Store, now_ms: u64) -> Option<BundleInformation> {
        loop {
            match &mut self.state {
                PollState::NextCla(idx) => {
                    if *idx >= router.clas.len() {
                        self.state = PollState::Done;
                        return None;
                    }
                    let i = *idx;
                    match &router.clas[i].1 {
                        ClaEntry::Pull(_) => {
                            let node_addrs = store.get_nodes().into_iter().map(|n| n.address).collect();
                            self.state = PollState::PullNodes { cla_index: i, node_addrs };
                        }
                        ClaEntry::Push(_) => {
                            self.state = PollState::PushDrain { cla_index: i };
                        }
                    }
                }
                PollState::PullNodes { cla_index, node_addrs } => {
                    let cla_index = *cla_index;
                    let Some(addr) = node_addrs.pop_front() else {
                        self.state = PollState::NextCla(cla_index + 1);
                        continue;
                    };
                    let Some(node) = store.get_node(&addr) else { continue };
                    let ClaEntry::Pull(cla) = &mut router.clas[cla_index].1 else {
                        unreachable!("cla_index in PullNodes state always names a pull cla")
                    };
                    let Some(ids) = cla.poll_ids(&node) else { continue };
                    for id in ids {
                        if store.was_seen(&id) {
                            continue;
                        }
                        let (bundle, from) = cla.poll(&id, &node);
                        let Some(bundle) = bundle else { continue };
                        store.store_seen(id, from.clone());
                        let mut info = BundleInformation::new(bundle, now_ms);
                        if let Some(from_addr) = &from {
                            if store.get_node(from_addr).is_some() {
                                info.forwarded_to_nodes.insert(from_addr.clone());
                            }
                        }
                        return Some(info);
                    }
                }
                PollState::PushDrain { cla_index } => {
                    let cla_index = *cla_index;
                    let ClaEntry::Push(cla) = &mut router.clas[cla_index].1 else {
                        unreachable!("cla_index in PushDrain state always names a push cla")
                    };
                    let (bundle, from) = cla.poll();
                    let Some(bundle) = bundle else {
                        self.state = PollState::NextCla(cla_index + 1);
                        continue;
                    };
                    let id = bundle.bundle_id();
                    if store.was_seen(&id) {
                        continue;
                    }
                    store.store_seen(id, from.clone());
                    let mut info = BundleInformation::new(bundle, now_ms);
                    if let Some(from_addr) = &from {
                        if store.get_node(from_addr).is_some() {
                            info.forwarded_to_nodes.insert(from_addr.clone());
                        }
                    }
                    return Some(info);
                }
                PollState::Done => return None,
            }
        }
    }
}
