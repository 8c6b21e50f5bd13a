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

//! URI validation and the two "oldest" comparisons the store's eviction
//! policy relies on.

use once_cell::sync::Lazy;
use regex::Regex;

static NODE_URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(dtn://[^~/]+/$)|(ipn://\d+(\.\d+)*$)").unwrap());

static ENDPOINT_URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(dtn://none$)|(dtn://[^~/]+/([^~/]+/)*[^~/]+$)|(ipn://\d+(\.\d+)+$)").unwrap()
});

static GROUP_URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dtn://[^~/]+/([^~]+/)*~[^/]+$").unwrap());

pub fn is_correct_node_uri(uri: &str) -> bool {
    NODE_URI_RE.is_match(uri)
}

pub fn is_correct_endpoint_uri(uri: &str) -> bool {
    ENDPOINT_URI_RE.is_match(uri) || is_correct_node_uri(uri)
}

pub fn is_correct_group_uri(uri: &str) -> bool {
    GROUP_URI_RE.is_match(uri)
}

pub fn is_timestamp_older_than_timeout(now_ms: u64, timestamp_ms: u64, timeout_ms: u64) -> bool {
    now_ms.saturating_sub(timestamp_ms) >= timeout_ms
}

/// Parses the `time-seq` suffix of a bundle id (after the last two `-`
/// separated components) for the ordering below.
fn parse_time_seq(bundle_id: &str) -> Option<(u64, u64)> {
    let mut parts = bundle_id.rsplitn(3, '-');
    let seq: u64 = parts.next()?.parse().ok()?;
    let time: u64 = parts.next()?.parse().ok()?;
    Some((time, seq))
}

/// Ordering used to pick an eviction candidate among bundle ids: bundles
/// with creation_time == 0 (no accurate clock) always rank *newer* than any
/// dated bundle, so clock-less devices keep their own bundles longest.
/// Among bundles that agree on having (or lacking) a clock, lower
/// `(time, seq)` is older.
pub fn get_oldest_bundle_id<'a>(bundle_ids: impl IntoIterator<Item = &'a String>) -> Option<&'a String> {
    bundle_ids.into_iter().min_by(|a, b| {
        let a_ts = parse_time_seq(a);
        let b_ts = parse_time_seq(b);
        match (a_ts, b_ts) {
            (Some((0, _)), Some((bt, _))) if bt != 0 => std::cmp::Ordering::Greater,
            (Some((at, _)), Some((0, _))) if at != 0 => std::cmp::Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
            _ => std::cmp::Ordering::Equal,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_example_uris() {
        assert!(is_correct_node_uri("dtn://n1/"));
        assert!(is_correct_node_uri("ipn://5"));
        assert!(is_correct_node_uri("ipn://5.3"));
        assert!(is_correct_endpoint_uri("dtn://none"));
        assert!(is_correct_endpoint_uri("dtn://n1/a"));
        assert!(is_correct_endpoint_uri("dtn://n1/a/b"));
        assert!(is_correct_endpoint_uri("ipn://5.3"));
        assert!(is_correct_group_uri("dtn://n1/a/~g"));
    }

    #[test]
    fn rejects_malformed_uris() {
        assert!(!is_correct_node_uri("dtn://node"));
        assert!(!is_correct_group_uri("dtn://node/~"));
        assert!(!is_correct_node_uri("ipn://12."));
        assert!(!is_correct_node_uri("dtn:/foo"));
        assert!(!is_correct_endpoint_uri("dtn:/foo"));
    }

    #[test]
    fn clockless_bundles_rank_newer_than_dated() {
        let ids = vec![
            String::from("dtn://n1/a-0-5"),
            String::from("dtn://n1/a-1000-1"),
        ];
        assert_eq!(get_oldest_bundle_id(&ids).unwrap(), "dtn://n1/a-1000-1");
    }

    #[test]
    fn dated_bundles_order_by_time_then_sequence() {
        let ids = vec![
            String::from("dtn://n1/a-1000-5"),
            String::from("dtn://n1/a-1000-1"),
            String::from("dtn://n1/a-900-9"),
        ];
        assert_eq!(get_oldest_bundle_id(&ids).unwrap(), "dtn://n1/a-900-9");
    }
}
