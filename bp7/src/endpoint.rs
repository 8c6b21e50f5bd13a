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

use std::fmt::Display;
use std::str::FromStr;

use serde::{
    Deserialize, Serialize,
    de::{Error, Unexpected, Visitor},
    ser::SerializeSeq,
};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::Validate;

#[derive(Debug, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u64)]
enum EndpointType {
    Dtn = 1,
    Ipn = 2,
}

/// A fully-qualified endpoint id, either `dtn://node/path` or `ipn://node.service`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub enum Endpoint {
    DTN(DTNEndpoint),
    IPN(IPNEndpoint),
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        match self {
            Endpoint::DTN(e) => {
                seq.serialize_element(&EndpointType::Dtn)?;
                seq.serialize_element(e)?;
            }
            Endpoint::IPN(e) => {
                seq.serialize_element(&EndpointType::Ipn)?;
                seq.serialize_element(e)?;
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EndpointVisitor;
        impl<'de> Visitor<'de> for EndpointVisitor {
            type Value = Endpoint;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("endpoint")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let endpoint_type: EndpointType = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'endpoint_type'"))?;
                match endpoint_type {
                    EndpointType::Dtn => {
                        let dtn_endpoint: DTNEndpoint = seq
                            .next_element()?
                            .ok_or(Error::custom("Error for field 'dtn_endpoint'"))?;
                        Ok(Endpoint::DTN(dtn_endpoint))
                    }
                    EndpointType::Ipn => {
                        let ipn_endpoint: IPNEndpoint = seq
                            .next_element()?
                            .ok_or(Error::custom("Error for field 'ipn_endpoint'"))?;
                        Ok(Endpoint::IPN(ipn_endpoint))
                    }
                }
            }
        }
        deserializer.deserialize_seq(EndpointVisitor)
    }
}

impl Validate for Endpoint {
    fn validate(&self) -> bool {
        match self {
            Endpoint::DTN(e) => e.validate(),
            Endpoint::IPN(e) => e.validate(),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::DTN(e) => e.fmt(f),
            Endpoint::IPN(e) => e.fmt(f),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ();

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = uri.strip_prefix("dtn://") {
            return Ok(Endpoint::DTN(DTNEndpoint::from_node_relative(rest)));
        }
        if uri == "dtn:none" {
            return Ok(Endpoint::DTN(DTNEndpoint::null()));
        }
        if let Some(rest) = uri.strip_prefix("ipn://") {
            return IPNEndpoint::from_hier(rest).map(Endpoint::IPN).ok_or(());
        }
        Err(())
    }
}

impl Endpoint {
    pub fn new(uri: &str) -> Option<Self> {
        uri.parse().ok()
    }

    pub fn is_null_endpoint(&self) -> bool {
        match self {
            Endpoint::DTN(e) => e.is_null_endpoint(),
            Endpoint::IPN(_) => false,
        }
    }

    pub fn matches_node(&self, other: &Endpoint) -> bool {
        match self {
            Endpoint::DTN(s) => matches!(other, Endpoint::DTN(o) if s.matches_node(o)),
            Endpoint::IPN(s) => matches!(other, Endpoint::IPN(o) if s.matches_node(o)),
        }
    }

    pub fn get_node_endpoint(&self) -> Endpoint {
        match self {
            Endpoint::DTN(s) => Endpoint::DTN(s.get_node_endpoint()),
            Endpoint::IPN(s) => Endpoint::IPN(s.get_node_endpoint()),
        }
    }
}

/// `dtn://node/path...` (or the null endpoint `dtn:none`). `uri` holds the
/// part after the `dtn:` scheme, i.e. `//node/path` or `none`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct DTNEndpoint {
    pub uri: String,
}

impl DTNEndpoint {
    fn from_node_relative(rest: &str) -> Self {
        DTNEndpoint {
            uri: format!("//{rest}"),
        }
    }

    fn null() -> Self {
        DTNEndpoint {
            uri: String::from("none"),
        }
    }

    fn is_null_endpoint(&self) -> bool {
        self.uri == "none"
    }

    pub fn node_name(&self) -> &str {
        self.uri[2..]
            .split('/')
            .next()
            .expect("split always yields at least one element")
    }

    pub fn matches_node(&self, other: &DTNEndpoint) -> bool {
        self.node_name() == other.node_name()
    }

    pub fn get_node_endpoint(&self) -> DTNEndpoint {
        DTNEndpoint::from_node_relative(&(self.node_name().to_owned() + "/"))
    }
}

impl Serialize for DTNEndpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.is_null_endpoint() {
            serializer.serialize_u64(0)
        } else {
            serializer.serialize_str(&self.uri)
        }
    }
}

impl<'de> Deserialize<'de> for DTNEndpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DTNEndpointVisitor;
        impl Visitor<'_> for DTNEndpointVisitor {
            type Value = DTNEndpoint;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("DTN Endpoint")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: Error,
            {
                if v == 0 {
                    return Ok(DTNEndpoint::null());
                }
                Err(Error::invalid_value(
                    Unexpected::Unsigned(v),
                    &"DTN Endpoints may only have 0 as a value",
                ))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: Error,
            {
                Ok(DTNEndpoint {
                    uri: String::from(v),
                })
            }
        }
        deserializer.deserialize_any(DTNEndpointVisitor)
    }
}

impl Validate for DTNEndpoint {
    fn validate(&self) -> bool {
        if self.uri != "none" && !self.uri.starts_with("//") {
            return false;
        }
        true
    }
}

impl Display for DTNEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null_endpoint() {
            f.write_str("dtn:none")
        } else {
            f.write_fmt(format_args!("dtn:{}", self.uri))
        }
    }
}

/// `ipn://node.service`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct IPNEndpoint {
    pub node: u64,
    pub service: u64,
}

impl Validate for IPNEndpoint {
    fn validate(&self) -> bool {
        true
    }
}

impl IPNEndpoint {
    /// Parses the part after `ipn://`, e.g. `"5.3"`.
    fn from_hier(hier: &str) -> Option<Self> {
        let (node, service) = hier.split_once('.')?;
        Some(IPNEndpoint {
            node: node.parse().ok()?,
            service: service.parse().ok()?,
        })
    }

    pub fn matches_node(&self, other: &IPNEndpoint) -> bool {
        self.node == other.node
    }

    pub fn get_node_endpoint(&self) -> IPNEndpoint {
        IPNEndpoint {
            node: self.node,
            service: 0,
        }
    }
}

impl Display for IPNEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("ipn://{}.{}", self.node, self.service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dtn_endpoint() {
        let e = Endpoint::new("dtn://n1/a").unwrap();
        assert_eq!(e, Endpoint::DTN(DTNEndpoint::from_node_relative("n1/a")));
        assert_eq!(e.to_string(), "dtn://n1/a");
    }

    #[test]
    fn parses_dtn_null_endpoint() {
        let e = Endpoint::new("dtn:none").unwrap();
        assert!(e.is_null_endpoint());
        assert_eq!(e.to_string(), "dtn:none");
    }

    #[test]
    fn parses_ipn_endpoint() {
        let e = Endpoint::new("ipn://5.3").unwrap();
        assert_eq!(e, Endpoint::IPN(IPNEndpoint { node: 5, service: 3 }));
        assert_eq!(e.to_string(), "ipn://5.3");
    }

    #[test]
    fn dtn_node_name_and_matching() {
        let a = DTNEndpoint::from_node_relative("n1/a");
        let b = DTNEndpoint::from_node_relative("n1/b");
        let other = DTNEndpoint::from_node_relative("n2/a");
        assert_eq!(a.node_name(), "n1");
        assert!(a.matches_node(&b));
        assert!(!a.matches_node(&other));
        assert_eq!(a.get_node_endpoint().uri, "//n1/");
    }

    #[test]
    fn ipn_matches_node_ignores_service() {
        let a = IPNEndpoint { node: 5, service: 3 };
        let b = IPNEndpoint { node: 5, service: 9 };
        assert!(a.matches_node(&b));
        assert_eq!(a.get_node_endpoint(), IPNEndpoint { node: 5, service: 0 });
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Endpoint::new("foo://bar").is_none());
    }
}
