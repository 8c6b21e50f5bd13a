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

//! In-memory catalog of delayed bundles, seen bundle-ids, and known
//! neighbors, with bounded eviction. A single concrete implementation
//! covers every deployment target (constrained or host) since the only
//! axis that varies between them is the caps passed at construction.

use std::collections::HashMap;

use crate::data::{BundleInformation, Node};
use crate::util::get_oldest_bundle_id;

pub struct Store {
    bundles: HashMap<String, BundleInformation>,
    seen: HashMap<String, Option<String>>,
    nodes: HashMap<String, Node>,
    max_stored_bundles: usize,
    max_known_bundle_ids: usize,
}

impl Store {
    pub fn new(max_stored_bundles: usize, max_known_bundle_ids: usize) -> Self {
        Store {
            bundles: HashMap::new(),
            seen: HashMap::new(),
            nodes: HashMap::new(),
            max_stored_bundles,
            max_known_bundle_ids,
        }
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.address.clone(), node);
    }

    pub fn get_node(&self, address: &str) -> Option<Node> {
        self.nodes.get(address).cloned()
    }

    pub fn get_nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn was_seen(&self, bundle_id: &str) -> bool {
        self.seen.contains_key(bundle_id)
    }

    pub fn get_seen(&self, bundle_id: &str) -> Option<String> {
        self.seen.get(bundle_id).cloned().flatten()
    }

    /// Idempotent: a later call with `node_address = None` never overwrites
    /// an already-known previous hop (§8 law: `store_seen(id, None)` after
    /// `store_seen(id, addr)` leaves the mapping at `addr`).
    pub fn store_seen(&mut self, bundle_id: String, node_address: Option<String>) {
        if node_address.is_none() {
            if let Some(Some(_existing)) = self.seen.get(&bundle_id) {
                return;
            }
        }
        if !self.seen.contains_key(&bundle_id) && self.seen.len() >= self.max_known_bundle_ids {
            if let Some(oldest) = get_oldest_bundle_id(self.seen.keys()) {
                let oldest = oldest.clone();
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(bundle_id, node_address);
    }

    pub fn remove_bundle(&mut self, bundle_id: &str) -> Option<BundleInformation> {
        self.bundles.remove(bundle_id)
    }

    /// Stores a bundle for later retry, returning any bundles evicted to
    /// make room (the caller deletes each of those with its own reason
    /// code). On failure (still over cap after eviction) the bundle that
    /// could not be stored is handed back unchanged, since it was never
    /// absorbed into `self.bundles` for the caller to look up again.
    pub fn delay_bundle(&mut self, info: BundleInformation) -> Result<Vec<BundleInformation>, BundleInformation> {
        let id = info.bundle.bundle_id();
        if self.bundles.contains_key(&id) {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        if self.bundles.len() >= self.max_stored_bundles {
            self.garbage_collect();
        }
        if self.bundles.len() >= self.max_stored_bundles {
            if let Some(oldest_id) = self
                .bundles
                .values()
                .min_by_key(|info| info.received_at_ms)
                .map(|info| info.bundle.bundle_id())
            {
                if let Some(evicted) = self.bundles.remove(&oldest_id) {
                    removed.push(evicted);
                }
            }
        }
        if self.bundles.len() >= self.max_stored_bundles {
            return Err(info);
        }

        self.store_seen(id.clone(), None);
        self.bundles.insert(id, info);
        Ok(removed)
    }

    /// Removes every stored bundle with no pending retention constraint:
    /// it has either already been forwarded+delivered, or it never needed
    /// to be (RFC9171 §5.6 invariant).
    fn garbage_collect(&mut self) {
        self.bundles.retain(|_, info| info.retention_constraint.is_some());
    }

    /// Snapshot of ids currently in the store, taken at call time. Feeding
    /// a `RetryCursor` this way (rather than holding live references) means
    /// an id evicted between snapshot and retry is simply skipped instead
    /// of resurrecting a bundle the store no longer tracks.
    pub fn bundles_to_retry(&self) -> Vec<String> {
        self.bundles.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp7::block::payload_block::PayloadBlock;
    use bp7::block::{Block, CanonicalBlock};
    use bp7::blockflags::BlockFlags;
    use bp7::bundle::Bundle;
    use bp7::bundleflags::BundleFlags;
    use bp7::crc::CRCType;
    use bp7::endpoint::Endpoint;
    use bp7::primaryblock::PrimaryBlock;
    use bp7::time::{CreationTimestamp, DtnTime};

    fn sample(seq: u64, received_at_ms: u64) -> BundleInformation {
        let bundle = Bundle {
            primary_block: PrimaryBlock {
                version: 7,
                bundle_processing_flags: BundleFlags::empty(),
                crc: CRCType::NoCRC,
                destination_endpoint: Endpoint::new("dtn://n2/b").unwrap(),
                source_node: Endpoint::new("dtn://n1/a").unwrap(),
                report_to: Endpoint::new("dtn://n1/a").unwrap(),
                creation_timestamp: CreationTimestamp {
                    creation_time: DtnTime { timestamp: 1000 + seq },
                    sequence_number: seq,
                },
                lifetime: 86_400_000,
            },
            blocks: vec![CanonicalBlock {
                block: Block::Payload(PayloadBlock { data: b"hi".to_vec() }),
                block_number: 1,
                block_flags: BlockFlags::empty(),
                crc: CRCType::NoCRC,
            }],
        };
        BundleInformation::new(bundle, received_at_ms)
    }

    #[test]
    fn store_seen_keeps_known_hop_over_later_unknown() {
        let mut store = Store::new(10, 10);
        store.store_seen("id-1".into(), Some("10.0.0.1".into()));
        store.store_seen("id-1".into(), None);
        assert_eq!(store.get_seen("id-1"), Some("10.0.0.1".into()));
    }

    #[test]
    fn delay_bundle_evicts_oldest_by_reception_time_when_full() {
        let mut store = Store::new(2, 10);
        assert!(store.delay_bundle(sample(1, 100)).unwrap().is_empty());
        assert!(store.delay_bundle(sample(2, 200)).unwrap().is_empty());
        let evicted = store.delay_bundle(sample(3, 300)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].received_at_ms, 100);
    }

    #[test]
    fn garbage_collect_frees_space_before_evicting_by_time() {
        let mut store = Store::new(2, 10);
        let mut first = sample(1, 100);
        first.retention_constraint = None;
        store.delay_bundle(first).unwrap();
        store.delay_bundle(sample(2, 200)).unwrap();
        let evicted = store.delay_bundle(sample(3, 300)).unwrap();
        assert!(evicted.is_empty(), "garbage collection should have freed the none-retention bundle");
    }

    #[test]
    fn store_full_with_no_evictable_bundle_reports_failure() {
        let mut store = Store::new(0, 10);
        let result = store.delay_bundle(sample(1, 100));
        assert!(result.is_err());
    }

    #[test]
    fn seen_set_evicts_oldest_by_time_seq_ordering_when_full() {
        let mut store = Store::new(10, 2);
        store.store_seen("dtn://n1/a-100-1".into(), None);
        store.store_seen("dtn://n1/a-200-1".into(), None);
        store.store_seen("dtn://n1/a-300-1".into(), None);
        assert!(!store.was_seen("dtn://n1/a-100-1"));
        assert!(store.was_seen("dtn://n1/a-200-1"));
        assert!(store.was_seen("dtn://n1/a-300-1"));
    }
}
