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

//! Convergence-layer adapter abstraction: two polling disciplines a
//! concrete CLA can implement, plus the four concrete CLAs and a
//! loopback fake used by the integration tests.

pub mod datagram_broadcast;
pub mod http_peer;
pub mod mtcp;
pub mod radio_broadcast;

use bp7::bundle::Bundle;

use crate::data::Node;

/// Appropriate for peers exposing a bundle-index API: the agent first asks
/// what is available, then fetches specific ids.
pub trait PullCla {
    fn poll_ids(&mut self, node: &Node) -> Option<Vec<String>>;
    fn poll(&mut self, bundle_id: &str, node: &Node) -> (Option<Bundle>, Option<String>);
    fn send_to(&mut self, node: &Node, bytes: &[u8]) -> bool;
}

/// Appropriate for stream/broadcast links: the agent drains whatever has
/// arrived and sends by handing bytes directly to the link.
pub trait PushCla {
    /// Non-blocking; returns `None` once nothing more is immediately
    /// available. `from_addr` is `None` for broadcast-style links that
    /// cannot identify a sender.
    fn poll(&mut self) -> (Option<Bundle>, Option<String>);
    fn send_to(&mut self, node: Option<&Node>, bytes: &[u8]) -> bool;
    /// Broadcast-style CLAs (datagram/radio) are sent to once per round
    /// rather than iterated per neighbor, since the link has no per-node
    /// addressing and success can't be attributed to any one recipient.
    fn is_broadcast(&self) -> bool;
}

pub enum ClaEntry {
    Pull(Box<dyn PullCla>),
    Push(Box<dyn PushCla>),
}

/// An in-process loopback CLA: hands bundles directly between two agents
/// under test without touching a real socket, per §8's "test tooling".
/// Two handles constructed via [`loopback_pair`] share a channel in each
/// direction.
pub mod loopback {
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::cell::RefCell;

    use bp7::bundle::Bundle;

    use super::PushCla;
    use crate::data::Node;

    #[derive(Default)]
    struct Channel {
        queue: VecDeque<Vec<u8>>,
    }

    pub struct LoopbackCla {
        label: String,
        inbox: Rc<RefCell<Channel>>,
        outbox: Rc<RefCell<Channel>>,
    }

    impl PushCla for LoopbackCla {
        fn poll(&mut self) -> (Option<Bundle>, Option<String>) {
            let bytes = self.inbox.borrow_mut().queue.pop_front();
            match bytes {
                Some(bytes) => match Bundle::try_from(bytes.as_slice()) {
                    Ok(bundle) => (Some(bundle), Some(self.label.clone())),
                    Err(_) => (None, None),
                },
                None => (None, None),
            }
        }

        fn send_to(&mut self, _node: Option<&Node>, bytes: &[u8]) -> bool {
            self.outbox.borrow_mut().queue.push_back(bytes.to_vec());
            true
        }

        fn is_broadcast(&self) -> bool {
            false
        }
    }

    /// Builds two loopback CLAs, `a` and `b`, wired so that sending on one
    /// is received on the other.
    pub fn loopback_pair(label_a: &str, label_b: &str) -> (LoopbackCla, LoopbackCla) {
        let a_to_b = Rc::new(RefCell::new(Channel::default()));
        let b_to_a = Rc::new(RefCell::new(Channel::default()));
        (
            LoopbackCla {
                label: label_a.to_string(),
                inbox: b_to_a.clone(),
                outbox: a_to_b.clone(),
            },
            LoopbackCla {
                label: label_b.to_string(),
                inbox: a_to_b,
                outbox: b_to_a,
            },
        )
    }
}
