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

//! End-to-end scenarios driving a full `Bpa` through its public API: local
//! delivery, the reception-time checks, store eviction, neighbor discovery
//! over a real loopback socket, and epidemic forwarding between two agents
//! wired together with the in-process loopback CLA. Bundles that need to be
//! hand-built (to pin an exact hop count or Bundle Age Block) are injected
//! through a one-shot fake CLA rather than through the crate-private local
//! dispatch queue, so these tests only ever go through public entry points.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

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

use dtn_bpa::bpa::Bpa;
use dtn_bpa::cla::loopback::{loopback_pair, LoopbackCla};
use dtn_bpa::cla::{ClaEntry, PushCla};
use dtn_bpa::clock::{Clock, FakeClock};
use dtn_bpa::config::Config;
use dtn_bpa::data::Node;
use dtn_bpa::endpoint::{register_endpoint, BpaHandle};
use dtn_bpa::ipnd::{Beacon, Ipnd};

/// `Bpa` owns its clock, but a test wants to keep advancing the same clock
/// after handing it over; this shares one `FakeClock` between the two.
struct FakeClockHandle(Rc<FakeClock>);
impl Clock for FakeClockHandle {
    fn now_ms(&self) -> u64 {
        self.0.now_ms()
    }
    fn dtn_now(&self) -> Option<DtnTime> {
        self.0.dtn_now()
    }
}

fn new_bpa(node_uri: &str, clock: &Rc<FakeClock>, configure: impl FnOnce(Config) -> Config) -> BpaHandle {
    let config = configure(Config::constrained(node_uri));
    Bpa::new(config, Box::new(FakeClockHandle(clock.clone()))).unwrap()
}

fn bundle_with_blocks(source: &str, destination: &str, lifetime: u64, creation_time: u64, extra_blocks: Vec<CanonicalBlock>) -> Bundle {
    let mut blocks = vec![CanonicalBlock {
        block: Block::Payload(PayloadBlock { data: b"hi".to_vec() }),
        block_number: 1,
        block_flags: BlockFlags::empty(),
        crc: CRCType::NoCRC,
    }];
    blocks.extend(extra_blocks);
    Bundle {
        primary_block: PrimaryBlock {
            version: 7,
            bundle_processing_flags: BundleFlags::empty(),
            crc: CRCType::NoCRC,
            destination_endpoint: Endpoint::new(destination).unwrap(),
            source_node: Endpoint::new(source).unwrap(),
            report_to: Endpoint::new(source).unwrap(),
            creation_timestamp: CreationTimestamp {
                creation_time: DtnTime { timestamp: creation_time },
                sequence_number: 1,
            },
            lifetime,
        },
        blocks,
    }
}

/// Hands a single hand-built bundle to the agent through the CLA-poll path,
/// then never yields anything else. Lets a test pin an exact hop count or
/// Bundle Age Block without going through `LocalEndpoint::start_transmission`,
/// which always builds its own blocks.
struct OneShotCla {
    bundle: Option<Bundle>,
}

impl PushCla for OneShotCla {
    fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
        (self.bundle.take(), None)
    }
    fn send_to(&mut self, _node: Option<&Node>, _bytes: &[u8]) -> bool {
        false
    }
    fn is_broadcast(&self) -> bool {
        false
    }
}

fn deliver_once(bpa: &BpaHandle, bundle: Bundle) {
    bpa.borrow_mut().register_cla("one-shot", ClaEntry::Push(Box::new(OneShotCla { bundle: Some(bundle) })));
    bpa.borrow_mut().update();
}

#[test]
fn local_loopback_delivers_within_a_few_ticks() {
    let clock = Rc::new(FakeClock::new(1_000_000, false));
    let bpa = new_bpa("dtn://n1/", &clock, |c| c);
    let a = register_endpoint(&bpa, "a", None).unwrap();
    let b = register_endpoint(&bpa, "b", None).unwrap();

    a.start_transmission(b"hi".to_vec(), "dtn://n1/b", 86_400_000, false).unwrap();
    for _ in 0..3 {
        bpa.borrow_mut().update();
    }

    let delivered = b.poll().unwrap().expect("bundle should have been delivered by now");
    assert_eq!(delivered.payload_block().data, b"hi");
    assert_eq!(delivered.primary_block.source_node.to_string(), "dtn://n1/a");
}

#[test]
fn hop_limit_exceeded_is_deleted_without_being_forwarded() {
    let clock = Rc::new(FakeClock::new(1_000_000, false));
    let bpa = new_bpa("dtn://n1/", &clock, |c| c);

    let bundle = bundle_with_blocks(
        "dtn://n3/a",
        "dtn://n2/b",
        86_400_000,
        1_000_000,
        vec![CanonicalBlock {
            block: Block::HopCount(HopCountBlock { limit: 1, count: 1 }),
            block_number: 2,
            block_flags: BlockFlags::empty(),
            crc: CRCType::NoCRC,
        }],
    );
    let bundle_id = bundle.bundle_id();

    deliver_once(&bpa, bundle);

    assert!(!bpa.borrow_mut().cancel_transmission(&bundle_id), "bundle exceeding its hop limit must already be gone, not sitting in the store");
}

#[test]
fn clockless_lifetime_expiry_is_deleted_via_the_bundle_age_block() {
    let clock = Rc::new(FakeClock::new(0, true));
    let bpa = new_bpa("dtn://n1/", &clock, |c| c);

    let bundle = bundle_with_blocks(
        "dtn://n3/a",
        "dtn://n2/b",
        1000,
        0,
        vec![CanonicalBlock {
            block: Block::BundleAge(BundleAgeBlock { age: 1000 }),
            block_number: 2,
            block_flags: BlockFlags::empty(),
            crc: CRCType::NoCRC,
        }],
    );
    let bundle_id = bundle.bundle_id();

    deliver_once(&bpa, bundle);

    assert!(!bpa.borrow_mut().cancel_transmission(&bundle_id));
}

/// A push CLA that never succeeds at delivering anything, used to force
/// every forwarding attempt in the eviction scenario to fail and fall back
/// to the store.
struct RefusingCla;
impl PushCla for RefusingCla {
    fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
        (None, None)
    }
    fn send_to(&mut self, _node: Option<&Node>, _bytes: &[u8]) -> bool {
        false
    }
    fn is_broadcast(&self) -> bool {
        false
    }
}

#[test]
fn store_evicts_the_oldest_bundle_once_over_capacity() {
    let clock = Rc::new(FakeClock::new(1_000_000, false));
    let bpa = new_bpa("dtn://n1/", &clock, |mut c| {
        c.store.max_stored_bundles = 2;
        c
    });
    bpa.borrow_mut().register_cla("refuse", ClaEntry::Push(Box::new(RefusingCla)));
    bpa.borrow_mut().add_known_node(Node::new("peer".into(), 1, "//peer/".into(), 0, 0));

    let a = register_endpoint(&bpa, "a", None).unwrap();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = a.start_transmission(b"hi".to_vec(), "dtn://n3/elsewhere", 86_400_000, false).unwrap();
        ids.push(id);
        bpa.borrow_mut().update();
        clock.advance(10);
    }

    assert!(!bpa.borrow_mut().cancel_transmission(&ids[0]), "the oldest bundle should have been evicted to make room");
    assert!(bpa.borrow_mut().cancel_transmission(&ids[1]), "the second bundle should still be held, awaiting a neighbor");
    assert!(bpa.borrow_mut().cancel_transmission(&ids[2]), "the third bundle should still be held, awaiting a neighbor");
}

#[test]
fn ipnd_first_contact_triggers_a_unicast_reply() {
    let clock = FakeClock::new(1_000_000, false);

    let mut store_x = dtn_bpa::store::Store::new(16, 16);
    let mut store_y = dtn_bpa::store::Store::new(16, 16);

    let mut beacon_x = Beacon::new(Some((1, "//x/".to_string())), (vec![("mtcp".to_string(), 17001)], HashMap::new()));
    beacon_x.sequence_number = 5;
    let beacon_y = Beacon::new(Some((1, "//y/".to_string())), (vec![("mtcp".to_string(), 17002)], HashMap::new()));

    let mut ipnd_x = Ipnd::bind(39001, 39002, 4096, 0, vec!["127.0.0.1".to_string()], Vec::new(), beacon_x).unwrap();
    let mut ipnd_y = Ipnd::bind(39002, 39001, 4096, 0, vec!["127.0.0.1".to_string()], Vec::new(), beacon_y).unwrap();

    // x has never had a reason to broadcast before; its first update sends
    // the seq=5 beacon, since send_interval_ms is 0 here.
    ipnd_x.update(&mut store_x, &clock);
    std::thread::sleep(Duration::from_millis(50));

    // y has never heard of x: the jump to seq=5 looks discontinuous, so it
    // records x and immediately answers with a unicast beacon of its own.
    ipnd_y.update(&mut store_y, &clock);
    std::thread::sleep(Duration::from_millis(50));

    let learned = store_y.get_node("127.0.0.1").expect("y should have learned of x from its beacon");
    assert_eq!(learned.sequence_number, 5);
    assert_eq!(learned.eid_specific, "//x/");

    // x's next update drains y's unicast reply.
    ipnd_x.update(&mut store_x, &clock);
    let learned_by_x = store_x.get_node("127.0.0.1").expect("x should have learned of y from the unicast reply");
    assert_eq!(learned_by_x.eid_specific, "//y/");
}

/// Wraps a real [`LoopbackCla`] and records every node a send was attempted
/// against, so a test can assert on who the router tried to reach without
/// the router exposing that itself.
struct SpyCla {
    inner: LoopbackCla,
    sent_to: Rc<std::cell::RefCell<Vec<Option<String>>>>,
}

impl PushCla for SpyCla {
    fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
        self.inner.poll()
    }
    fn send_to(&mut self, node: Option<&Node>, bytes: &[u8]) -> bool {
        self.sent_to.borrow_mut().push(node.map(|n| n.address.clone()));
        self.inner.send_to(node, bytes)
    }
    fn is_broadcast(&self) -> bool {
        self.inner.is_broadcast()
    }
}

#[test]
fn epidemic_forwarding_never_sends_a_bundle_back_to_where_it_came_from() {
    let clock = Rc::new(FakeClock::new(1_000_000, false));
    let x = new_bpa("dtn://x/", &clock, |c| c);
    let y = new_bpa("dtn://y/", &clock, |c| c);

    // `loopback_pair`'s first argument is the label the first handle reports
    // as the sender on poll, so pass each side the other's name.
    let (cla_for_x, cla_for_y) = loopback_pair("y", "x");
    let y_sent_to = Rc::new(std::cell::RefCell::new(Vec::new()));
    x.borrow_mut().register_cla("loop", ClaEntry::Push(Box::new(cla_for_x)));
    y.borrow_mut().register_cla(
        "loop",
        ClaEntry::Push(Box::new(SpyCla {
            inner: cla_for_y,
            sent_to: y_sent_to.clone(),
        })),
    );
    x.borrow_mut().add_known_node(Node::new("y".into(), 1, "//y/".into(), 0, 0));
    y.borrow_mut().add_known_node(Node::new("x".into(), 1, "//x/".into(), 0, 0));

    let a = register_endpoint(&x, "a", None).unwrap();
    a.start_transmission(b"hi".to_vec(), "dtn://z/unreachable", 86_400_000, false).unwrap();

    // x: local dispatch -> reception -> forwarding, sends to y over the loop.
    x.borrow_mut().update();
    // y: drains the loop, receives the bundle (recording x in
    // forwarded_to_nodes since the sender is a known neighbor), then makes
    // its own forwarding attempt, which must skip x.
    y.borrow_mut().update();

    assert!(
        !y_sent_to.borrow().iter().any(|addr| addr.as_deref() == Some("x")),
        "y must never attempt to forward the bundle back to the neighbor it just received it from"
    );
}
