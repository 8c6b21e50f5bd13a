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

use serde::{Deserialize, Serialize, de::Error, de::Visitor, ser::SerializeSeq};

use crate::{
    Validate, bundleflags::BundleFlags, crc::CRCType, endpoint::Endpoint, time::CreationTimestamp,
};

/// The RFC9171 primary block. Fragmentation fields are intentionally absent:
/// this agent never fragments and rejects fragments at the wire boundary.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PrimaryBlock {
    pub version: u64,
    pub bundle_processing_flags: BundleFlags,
    pub crc: CRCType,
    pub destination_endpoint: Endpoint,
    pub source_node: Endpoint,
    pub report_to: Endpoint,
    pub creation_timestamp: CreationTimestamp,
    pub lifetime: u64,
}

impl Serialize for PrimaryBlock {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let len = if self.crc == CRCType::NoCRC { 8 } else { 9 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.version)?;
        seq.serialize_element(&self.bundle_processing_flags)?;
        seq.serialize_element(&self.crc)?;
        seq.serialize_element(&self.destination_endpoint)?;
        seq.serialize_element(&self.source_node)?;
        seq.serialize_element(&self.report_to)?;
        seq.serialize_element(&self.creation_timestamp)?;
        seq.serialize_element(&self.lifetime)?;
        match self.crc {
            CRCType::NoCRC => {}
            CRCType::CRC16(x) => seq.serialize_element(&x)?,
            CRCType::CRC32(x) => seq.serialize_element(&x)?,
        };
        seq.end()
    }
}

impl<'de> Deserialize<'de> for PrimaryBlock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrimaryBlockVisitor;
        impl<'de> Visitor<'de> for PrimaryBlockVisitor {
            type Value = PrimaryBlock;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("primary block")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let size = seq.size_hint().ok_or_else(|| {
                    Error::custom("Primary block must know the length of its contents")
                })?;
                // A primary block with fragmentation fields present (10 or 11
                // elements) is structurally valid RFC9171 but this agent never
                // fragments; reject such bundles rather than silently drop offset.
                if !(8..=9).contains(&size) {
                    return Err(Error::invalid_length(
                        size,
                        &"Primary block has 8 or 9 elements (fragmentation unsupported)",
                    ));
                }
                let version = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'version'"))?;
                let bundle_processing_flags = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'bundle_processing_flags'"))?;
                let mut crc: CRCType = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'crc_type'"))?;
                let destination_endpoint = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'destination_endpoint'"))?;
                let source_node = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'source_node'"))?;
                let report_to = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'report_to'"))?;
                let creation_timestamp = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'creation_timestamp'"))?;
                let lifetime = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'lifetime'"))?;

                if size == 9 {
                    crc = crc.deserialize_value(seq)?;
                }

                Ok(PrimaryBlock {
                    version,
                    bundle_processing_flags,
                    crc,
                    destination_endpoint,
                    source_node,
                    report_to,
                    creation_timestamp,
                    lifetime,
                })
            }
        }
        deserializer.deserialize_seq(PrimaryBlockVisitor)
    }
}

impl Validate for PrimaryBlock {
    fn validate(&self) -> bool {
        if self.version != 7 {
            return false;
        }
        if self.crc != CRCType::NoCRC {
            return false;
        }
        if !self.source_node.validate() {
            return false;
        }
        if !self.destination_endpoint.validate() {
            return false;
        }
        if !self.report_to.validate() {
            return false;
        }
        true
    }
}
