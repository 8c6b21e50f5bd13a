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

//! The Bundle Protocol Agent itself: RFC9171 §5.6 reception, dispatching,
//! forwarding and deletion, driven one step at a time by [`Bpa::update`].
//! Nothing here blocks or recurses across ticks; every multi-step process
//! (storage retry, CLA polling) is represented by a cursor that is resumed
//! on the next call instead of run to completion in one.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bp7::block::Block;
use bp7::blockflags::BlockFlags;
use bp7::bundle::Bundle;
use bp7::endpoint::Endpoint;
use bp7::Validate;

use crate::cla::ClaEntry;
use crate::clock::Clock;
use crate::config::Config;
use crate::data::{BundleInformation, ReasonCode, RetentionConstraint};
use crate::endpoint::{BpaHandle, EndpointState};
use crate::error::BpaError;
use crate::ipnd::Ipnd;
use crate::router::{EpidemicRouter, PollCursor};
use crate::store::Store;

pub struct Bpa {
    pub(crate) node_uri: String,
    pub(crate) clock: Box<dyn Clock>,
    send_status_reports_enabled: bool,
    store: Store,
    router: EpidemicRouter,
    ipnd: Option<Ipnd>,
    pub(crate) endpoints: HashMap<String, Rc<RefCell<EndpointState>>>,
    pub(crate) group_endpoints: HashMap<String, Vec<Rc<RefCell<EndpointState>>>>,
    local_bundle_dispatch_queue: VecDeque<Bundle>,
    retry_cursor: RetryCursor,
    poll_cursor: Option<PollCursor>,
}

impl Bpa {
    /// Validates `config.node_uri` and builds the store and router from the
    /// matching config sections. CLAs and IPND are wired in afterward
    /// through [`Bpa::register_cla`]/[`Bpa::bind_ipnd`], since both are
    /// fallible I/O setup that the BPA itself has no opinion on.
    pub fn new(config: Config, clock: Box<dyn Clock>) -> Result<BpaHandle, BpaError> {
        if !crate::util::is_correct_node_uri(&config.node_uri) {
            return Err(BpaError::InvalidNodeUri(config.node_uri));
        }
        let store = Store::new(config.store.max_stored_bundles, config.store.max_known_bundle_ids);
        let router = EpidemicRouter::new(config.router.min_nodes_to_forward_to, config.attach_previous_node_block);
        Ok(Rc::new(RefCell::new(Bpa {
            node_uri: config.node_uri,
            clock,
            send_status_reports_enabled: config.send_status_reports_enabled,
            store,
            router,
            ipnd: None,
            endpoints: HashMap::new(),
            group_endpoints: HashMap::new(),
            local_bundle_dispatch_queue: VecDeque::new(),
            retry_cursor: RetryCursor::default(),
            poll_cursor: None,
        })))
    }

    pub fn node_uri(&self) -> &str {
        &self.node_uri
    }

    pub fn register_cla(&mut self, identifier: impl Into<String>, cla: ClaEntry) {
        self.router.register_cla(identifier, cla);
    }

    pub fn bind_ipnd(&mut self, ipnd: Ipnd) {
        self.ipnd = Some(ipnd);
    }

    /// Statically registers a neighbor, bypassing IP neighbor discovery.
    /// Useful for CLAs addressed at a fixed peer (MTCP to a known host,
    /// HTTP peer polling) and for tests that wire up agents directly.
    pub fn add_known_node(&mut self, node: crate::data::Node) {
        self.store.add_node(node);
    }

    /// One cooperative step, in the fixed order: IPND update, one storage-
    /// retry pull, one local-submission pull, one CLA-poll pull. Never
    /// returns an error; everything below this call logs and advances.
    pub fn update(&mut self) {
        let now_ms = self.clock.now_ms();

        if let Some(ipnd) = &mut self.ipnd {
            ipnd.update(&mut self.store, self.clock.as_ref());
        }

        if let Some(id) = self.retry_cursor.next(&self.store) {
            if let Some(info) = self.store.remove_bundle(&id) {
                self.bundle_dispatching(info);
            }
        }

        if let Some(bundle) = self.local_bundle_dispatch_queue.pop_front() {
            self.bundle_reception(BundleInformation::new(bundle, now_ms));
        }

        let mut cursor = self.poll_cursor.take().unwrap_or_else(|| self.router.poll());
        let received = cursor.next(&mut self.router, &mut self.store, now_ms);
        self.poll_cursor = Some(cursor);
        if let Some(info) = received {
            self.bundle_reception(info);
        }
    }

    pub(crate) fn enqueue_for_dispatch(&mut self, bundle: Bundle) {
        self.local_bundle_dispatch_queue.push_back(bundle);
    }

    /// Removes `bundle_id` from the store if still present, or from the
    /// local submission queue if it has not even entered reception yet.
    pub(crate) fn cancel_transmission(&mut self, bundle_id: &str) -> bool {
        if self.store.remove_bundle(bundle_id).is_some() {
            return true;
        }
        let before = self.local_bundle_dispatch_queue.len();
        self.local_bundle_dispatch_queue.retain(|bundle| bundle.bundle_id() != bundle_id);
        self.local_bundle_dispatch_queue.len() != before
    }

    /// RFC9171 §5.6: accept or reject a bundle that has just arrived, from
    /// either a local application or a convergence layer.
    fn bundle_reception(&mut self, mut info: BundleInformation) {
        let bundle_id = info.bundle.bundle_id();
        self.store.store_seen(bundle_id.clone(), None);

        if !info.bundle.validate() {
            log::warn!("dropping malformed bundle {bundle_id}");
            return;
        }

        if self.is_expired(&info) {
            self.delete_bundle(info, ReasonCode::LifetimeExpired);
            return;
        }

        if let Some(hop) = info.bundle.blocks.iter().find_map(|b| match &b.block {
            Block::HopCount(h) => Some(h),
            _ => None,
        }) {
            if hop.count >= hop.limit {
                self.delete_bundle(info, ReasonCode::HopLimitExceeded);
                return;
            }
        }

        if self.discard_unsupported_blocks(&mut info) {
            self.delete_bundle(info, ReasonCode::BlockUnsupported);
            return;
        }

        info.retention_constraint = Some(RetentionConstraint::DispatchPending);
        self.bundle_dispatching(info);
    }

    /// True once the bundle's age reaches its lifetime: from the Bundle Age
    /// Block if one is attached (clock-less origin), otherwise from the
    /// creation timestamp against this node's own wall clock, if it has one.
    fn is_expired(&self, info: &BundleInformation) -> bool {
        if let Some(age) = info.bundle.blocks.iter().find_map(|b| match &b.block {
            Block::BundleAge(a) => Some(a),
            _ => None,
        }) {
            return age.age >= info.bundle.primary_block.lifetime;
        }
        if let Some(now) = self.clock.dtn_now() {
            let created = info.bundle.primary_block.creation_timestamp.creation_time.timestamp;
            return now.timestamp.saturating_sub(created) >= info.bundle.primary_block.lifetime;
        }
        false
    }

    /// Walks unknown extension blocks in priority order: delete-bundle wins
    /// over delete-block, which wins over a (unimplementable) status report
    /// request that is merely logged. Returns whether the whole bundle must
    /// be deleted; block-level deletions are applied in place.
    fn discard_unsupported_blocks(&self, info: &mut BundleInformation) -> bool {
        let bundle_id = info.bundle.bundle_id();
        let mut delete_bundle = false;
        info.bundle.blocks.retain(|block| {
            let Block::Unkown(_) = &block.block else { return true };
            if block.block_flags.contains(BlockFlags::DELETE_BUNDLE_WHEN_NOT_PROCESSABLE) {
                delete_bundle = true;
                return true;
            }
            if block.block_flags.contains(BlockFlags::STATUS_REPORT_REQUESTED_WHEN_NOT_PROCESSABLE) {
                log::debug!("bundle {bundle_id} requested a status report for an unsupported block; status reports are not implemented");
            }
            if block.block_flags.contains(BlockFlags::DELETE_BLOCK_WHEN_NOT_PROCESSABLE) {
                log::debug!("discarding unsupported block in bundle {bundle_id}");
                return false;
            }
            true
        });
        delete_bundle
    }

    /// RFC9171 §5.3: deliver to a registered local endpoint or group (unless
    /// already delivered on an earlier dispatching pass), reject a bundle
    /// addressed at this node under no registered endpoint, or hand off to
    /// forwarding. A locally delivered bundle still proceeds to forwarding
    /// (a group's other registrants may live elsewhere); this is also the
    /// re-entry point for a bundle pulled back out of the store by the
    /// retry cursor, so delivery is guarded by `locally_delivered` to avoid
    /// handing the application the same bundle twice across retries.
    fn bundle_dispatching(&mut self, mut info: BundleInformation) {
        let destination_uri = info.bundle.primary_block.destination_endpoint.to_string();

        if !info.locally_delivered {
            let mut delivered = false;
            if let Some(state) = self.endpoints.get(&destination_uri) {
                state.borrow_mut().deliver(info.bundle.clone());
                delivered = true;
            }
            if let Some(registrants) = self.group_endpoints.get(&destination_uri) {
                for state in registrants {
                    state.borrow_mut().deliver(info.bundle.clone());
                }
                delivered = true;
            }

            if delivered {
                log::debug!("delivered bundle {} locally", info.bundle.bundle_id());
                info.locally_delivered = true;
            } else if info.bundle.primary_block.destination_endpoint.matches_node(&self.own_node_endpoint()) {
                self.delete_bundle(info, ReasonCode::DestinationEndpointIdUnavailable);
                return;
            }
        }

        self.bundle_forwarding(info);
    }

    /// RFC9171 §5.4: one immediate forwarding attempt through the router.
    /// On success the retention constraint clears and the bundle is simply
    /// dropped (it was never queued in the store, nothing left to do). On a
    /// delayable failure it is handed to the store for retry on a future
    /// tick. On a non-delayable failure, best-effort send-back to the
    /// previous hop is attempted and the bundle is deleted — unless it was
    /// already delivered to a local registrant, in which case it has
    /// already served its purpose here and just has its retention cleared.
    fn bundle_forwarding(&mut self, mut info: BundleInformation) {
        info.retention_constraint = Some(RetentionConstraint::ForwardPending);
        let now_ms = self.clock.now_ms();
        let (success, reason) = self.router.immediate_forwarding_attempt(&self.node_uri, &mut info, &self.store, now_ms);

        if success {
            info.retention_constraint = None;
            if self.send_status_reports_enabled && !info.bundle.primary_block.report_to.is_null_endpoint() {
                log::debug!("forward status report to {} for bundle {} suppressed: status report emission is not implemented", info.bundle.primary_block.report_to, info.bundle.bundle_id());
            }
            return;
        }

        if reason.is_delayable() {
            self.store_or_evict(info);
            return;
        }

        self.router.send_to_previous_node(&self.node_uri, &info, &self.store, now_ms);
        if info.locally_delivered {
            info.retention_constraint = None;
        } else {
            self.delete_bundle(info, reason);
        }
    }

    /// Delays `info` in the store, deleting whatever it displaces (or itself,
    /// if the store is full and nothing could be freed) with a reason that
    /// reflects whether that bundle was ever successfully forwarded.
    fn store_or_evict(&mut self, info: BundleInformation) {
        match self.store.delay_bundle(info) {
            Ok(evicted) => {
                for bundle_info in evicted {
                    self.delete_evicted(bundle_info);
                }
            }
            Err(undelivered) => self.delete_evicted(undelivered),
        }
    }

    fn delete_evicted(&mut self, info: BundleInformation) {
        let reason = if info.forwarded_to_nodes.is_empty() {
            ReasonCode::DepletedStorage
        } else {
            ReasonCode::NoAdditionalInformation
        };
        self.delete_bundle(info, reason);
    }

    /// RFC9171 §5.13: removes the bundle from the store and logs why. This
    /// agent never emits the Bundle Status Report itself (see `data::ReasonCode`);
    /// a report-to endpoint other than the null endpoint is only noted.
    fn delete_bundle(&mut self, info: BundleInformation, reason: ReasonCode) {
        let bundle_id = info.bundle.bundle_id();
        self.store.remove_bundle(&bundle_id);
        log::info!("deleting bundle {bundle_id}: {reason:?}");
        if self.send_status_reports_enabled && !info.bundle.primary_block.report_to.is_null_endpoint() {
            log::debug!("status report to {} for bundle {bundle_id} suppressed: status report emission is not implemented", info.bundle.primary_block.report_to);
        }
    }

    fn own_node_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.node_uri).expect("node_uri is validated in Bpa::new")
    }
}

/// Resumable view over the store's retryable bundles: a snapshot of ids
/// taken once and drained one-by-one, refilled once exhausted. A bundle
/// that the store has meanwhile dropped (evicted, delivered) is simply
/// skipped rather than resurrected.
#[derive(Default)]
struct RetryCursor {
    ids: VecDeque<String>,
}

impl RetryCursor {
    fn next(&mut self, store: &Store) -> Option<String> {
        if self.ids.is_empty() {
            self.ids = store.bundles_to_retry().into();
        }
        self.ids.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::endpoint::register_endpoint;

    fn new_bpa(node_uri: &str, clock: Rc<FakeClock>) -> BpaHandle {
        let config = Config {
            node_uri: node_uri.to_string(),
            ..Config::default()
        };
        Bpa::new(config, Box::new(FakeClockHandle(clock))).unwrap()
    }

    /// `Bpa` owns its clock, but tests want to keep advancing the same
    /// clock after construction; this thin handle shares one `FakeClock`
    /// between the test and the agent.
    struct FakeClockHandle(Rc<FakeClock>);
    impl Clock for FakeClockHandle {
        fn now_ms(&self) -> u64 {
            self.0.now_ms()
        }
        fn dtn_now(&self) -> Option<bp7::time::DtnTime> {
            self.0.dtn_now()
        }
    }

    #[test]
    fn local_loopback_delivers_within_a_few_ticks() {
        let clock = Rc::new(FakeClock::new(1_000_000, false));
        let bpa = new_bpa("dtn://n1/", clock.clone());
        let a = register_endpoint(&bpa, "a", None).unwrap();
        let b = register_endpoint(&bpa, "b", None).unwrap();

        a.start_transmission(b"hi".to_vec(), "dtn://n1/b", 86_400_000, false).unwrap();
        for _ in 0..3 {
            bpa.borrow_mut().update();
        }

        let delivered = b.poll().unwrap().expect("bundle should have been delivered by now");
        assert_eq!(delivered.payload_block().data, b"hi");
        assert_eq!(delivered.primary_block.source_node.to_string(), "dtn://n1/a");
        assert_eq!(delivered.primary_block.destination_endpoint.to_string(), "dtn://n1/b");
    }

    #[test]
    fn hop_limit_exceeded_deletes_without_forwarding() {
        use bp7::block::hop_count_block::HopCountBlock;
        use bp7::block::payload_block::PayloadBlock;
        use bp7::block::{Block, CanonicalBlock};
        use bp7::blockflags::BlockFlags;
        use bp7::bundle::Bundle;
        use bp7::bundleflags::BundleFlags;
        use bp7::crc::CRCType;
        use bp7::primaryblock::PrimaryBlock;
        use bp7::time::{CreationTimestamp, DtnTime};

        let clock = Rc::new(FakeClock::new(1_000_000, false));
        let bpa = new_bpa("dtn://n1/", clock.clone());

        let bundle = Bundle {
            primary_block: PrimaryBlock {
                version: 7,
                bundle_processing_flags: BundleFlags::empty(),
                crc: CRCType::NoCRC,
                destination_endpoint: Endpoint::new("dtn://n2/b").unwrap(),
                source_node: Endpoint::new("dtn://n3/a").unwrap(),
                report_to: Endpoint::new("dtn://n3/a").unwrap(),
                creation_timestamp: CreationTimestamp {
                    creation_time: DtnTime { timestamp: 1_000_000 },
                    sequence_number: 1,
                },
                lifetime: 86_400_000,
            },
            blocks: vec![
                CanonicalBlock {
                    block: Block::Payload(PayloadBlock { data: b"hi".to_vec() }),
                    block_number: 1,
                    block_flags: BlockFlags::empty(),
                    crc: CRCType::NoCRC,
                },
                CanonicalBlock {
                    block: Block::HopCount(HopCountBlock { limit: 1, count: 1 }),
                    block_number: 2,
                    block_flags: BlockFlags::empty(),
                    crc: CRCType::NoCRC,
                },
            ],
        };
        let bundle_id = bundle.bundle_id();

        bpa.borrow_mut().enqueue_for_dispatch(bundle);
        bpa.borrow_mut().update();

        assert!(!bpa.borrow_mut().cancel_transmission(&bundle_id), "bundle should already have been deleted, not sitting in the store");
    }

    #[test]
    fn clockless_lifetime_expiry_deletes_via_bundle_age_block() {
        use bp7::block::bundle_age_block::BundleAgeBlock;
        use bp7::block::payload_block::PayloadBlock;
        use bp7::block::{Block, CanonicalBlock};
        use bp7::blockflags::BlockFlags;
        use bp7::bundle::Bundle;
        use bp7::bundleflags::BundleFlags;
        use bp7::crc::CRCType;
        use bp7::primaryblock::PrimaryBlock;
        use bp7::time::{CreationTimestamp, DtnTime};

        let clock = Rc::new(FakeClock::new(0, true));
        let bpa = new_bpa("dtn://n1/", clock.clone());

        let bundle = Bundle {
            primary_block: PrimaryBlock {
                version: 7,
                bundle_processing_flags: BundleFlags::empty(),
                crc: CRCType::NoCRC,
                destination_endpoint: Endpoint::new("dtn://n2/b").unwrap(),
                source_node: Endpoint::new("dtn://n3/a").unwrap(),
                report_to: Endpoint::new("dtn://n3/a").unwrap(),
                creation_timestamp: CreationTimestamp {
                    creation_time: DtnTime { timestamp: 0 },
                    sequence_number: 1,
                },
                lifetime: 1000,
            },
            blocks: vec![
                CanonicalBlock {
                    block: Block::Payload(PayloadBlock { data: b"hi".to_vec() }),
                    block_number: 1,
                    block_flags: BlockFlags::empty(),
                    crc: CRCType::NoCRC,
                },
                CanonicalBlock {
                    block: Block::BundleAge(BundleAgeBlock { age: 1000 }),
                    block_number: 2,
                    block_flags: BlockFlags::empty(),
                    crc: CRCType::NoCRC,
                },
            ],
        };
        let bundle_id = bundle.bundle_id();

        bpa.borrow_mut().enqueue_for_dispatch(bundle);
        bpa.borrow_mut().update();

        assert!(!bpa.borrow_mut().cancel_transmission(&bundle_id));
    }

    #[test]
    fn successful_forward_clears_retention_instead_of_sitting_in_the_store_forever() {
        use crate::cla::loopback::loopback_pair;
        use crate::cla::ClaEntry;
        use crate::data::Node;

        let clock = Rc::new(FakeClock::new(1_000_000, false));
        let config = Config {
            node_uri: "dtn://n1/".to_string(),
            router: crate::config::RouterConfig { min_nodes_to_forward_to: 1 },
            ..Config::default()
        };
        let bpa = Bpa::new(config, Box::new(FakeClockHandle(clock))).unwrap();

        let (cla_for_n1, _cla_for_peer) = loopback_pair("n1", "peer");
        bpa.borrow_mut().register_cla("loop", ClaEntry::Push(Box::new(cla_for_n1)));
        bpa.borrow_mut().add_known_node(Node::new("peer".into(), 1, "//peer/".into(), 0, 0));

        let a = register_endpoint(&bpa, "a", None).unwrap();
        let bundle_id = a.start_transmission(b"hi".to_vec(), "dtn://n3/elsewhere", 86_400_000, false).unwrap();
        bpa.borrow_mut().update();

        assert!(
            !bpa.borrow_mut().cancel_transmission(&bundle_id),
            "a bundle forwarded to enough neighbors must be dropped, not left sitting in the store for endless retry"
        );
    }
}
