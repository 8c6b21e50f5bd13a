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

use std::convert::{TryFrom, TryInto};
use std::fmt::Write;

use serde::{Deserialize, Serialize, de::Error, de::Visitor, ser::SerializeSeq};

use crate::{
    SerializationError, Validate,
    block::{Block, CanonicalBlock, payload_block::PayloadBlock},
};

/// A complete RFC9171 bundle: one primary block plus one or more canonical
/// (extension) blocks, always including exactly one payload block.
///
/// Unlike the wire format this crate parses, the in-memory representation
/// owns all of its data rather than borrowing from a decode buffer: a
/// `BundleInformation` wrapping this type lives in the store across many
/// cooperative-loop ticks and is mutated in place per hop (hop-count
/// increment, bundle-age update, previous-node-block replacement), which a
/// buffer-tied borrow could not survive.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Bundle {
    pub primary_block: crate::primaryblock::PrimaryBlock,
    pub blocks: Vec<CanonicalBlock>,
}

impl Serialize for Bundle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(1 + self.blocks.len()))?;
        seq.serialize_element(&self.primary_block)?;
        for block in &self.blocks {
            seq.serialize_element(&block)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Bundle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct BundleVisitor;
        impl<'de> Visitor<'de> for BundleVisitor {
            type Value = Bundle;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("bundle")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut blocks: Vec<CanonicalBlock> = match seq.size_hint() {
                    Some(v) => Vec::with_capacity(v.saturating_sub(1)),
                    None => Vec::new(),
                };
                let primary_block = seq
                    .next_element()?
                    .ok_or(Error::custom("Error for field 'primary_block'"))?;
                while let Some(block) = seq.next_element()? {
                    blocks.push(block);
                }

                if blocks.is_empty() {
                    return Err(Error::invalid_length(0, &"must have at least one block"));
                }

                Ok(Bundle {
                    primary_block,
                    blocks,
                })
            }
        }
        deserializer.deserialize_seq(BundleVisitor)
    }
}

impl Validate for Bundle {
    fn validate(&self) -> bool {
        if !self.primary_block.validate() {
            return false;
        }
        if !self.blocks.iter().any(|b| matches!(b.block, Block::Payload(_))) {
            return false;
        }
        self.blocks.iter().all(CanonicalBlock::validate)
    }
}

impl TryFrom<&[u8]> for Bundle {
    type Error = SerializationError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        serde_cbor::from_slice(value).map_err(SerializationError::SerializationError)
    }
}

impl TryFrom<Bundle> for Vec<u8> {
    type Error = SerializationError;

    fn try_from(value: Bundle) -> Result<Self, Self::Error> {
        (&value).try_into()
    }
}

impl TryFrom<&Bundle> for Vec<u8> {
    type Error = SerializationError;

    fn try_from(value: &Bundle) -> Result<Self, Self::Error> {
        serde_cbor::to_vec(value).map_err(SerializationError::SerializationError)
    }
}

impl Bundle {
    pub fn as_hex(&self) -> Result<String, SerializationError> {
        let vec: Vec<u8> = self.try_into()?;
        let mut s = String::with_capacity(2 * vec.len());
        for b in vec {
            write!(&mut s, "{b:02X?}").map_err(|_| SerializationError::ConversionError)?;
        }
        Ok(s)
    }

    /// The RFC9171 bundle id: `source_uri-creation_time-sequence_number`.
    /// Creation time of 0 marks a clock-less node; see the Bundle Age Block
    /// it carries in that case.
    pub fn bundle_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.primary_block.source_node,
            self.primary_block.creation_timestamp.creation_time.timestamp,
            self.primary_block.creation_timestamp.sequence_number,
        )
    }

    pub fn payload_canonical_block(&self) -> &CanonicalBlock {
        self.blocks
            .iter()
            .find(|block| matches!(block.block, Block::Payload(_)))
            .expect("Bundle::validate ensures a payload block is present")
    }

    pub fn payload_canonical_block_mut(&mut self) -> &mut CanonicalBlock {
        self.blocks
            .iter_mut()
            .find(|block| matches!(block.block, Block::Payload(_)))
            .expect("Bundle::validate ensures a payload block is present")
    }

    pub fn payload_block(&self) -> &PayloadBlock {
        match &self.payload_canonical_block().block {
            Block::Payload(p) => p,
            _ => unreachable!("payload_canonical_block always returns a payload block"),
        }
    }

    pub fn previous_node_block(&self) -> Option<&crate::block::previous_node_block::PreviousNodeBlock> {
        self.blocks.iter().find_map(|b| match &b.block {
            Block::PreviousNode(p) => Some(p),
            _ => None,
        })
    }

    pub fn bundle_age_block_mut(&mut self) -> Option<&mut crate::block::bundle_age_block::BundleAgeBlock> {
        self.blocks.iter_mut().find_map(|b| match &mut b.block {
            Block::BundleAge(a) => Some(a),
            _ => None,
        })
    }

    pub fn hop_count_block_mut(&mut self) -> Option<&mut crate::block::hop_count_block::HopCountBlock> {
        self.blocks.iter_mut().find_map(|b| match &mut b.block {
            Block::HopCount(h) => Some(h),
            _ => None,
        })
    }

    /// Removes any existing Previous Node Block, returning whether one was present.
    pub fn remove_previous_node_block(&mut self) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| !matches!(b.block, Block::PreviousNode(_)));
        self.blocks.len() != before
    }

    pub fn next_block_number(&self) -> u64 {
        self.blocks.iter().map(|b| b.block_number).max().unwrap_or(0) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::bundle_age_block::BundleAgeBlock;
    use crate::block::hop_count_block::HopCountBlock;
    use crate::blockflags::BlockFlags;
    use crate::bundleflags::BundleFlags;
    use crate::crc::CRCType;
    use crate::endpoint::Endpoint;
    use crate::primaryblock::PrimaryBlock;
    use crate::time::{CreationTimestamp, DtnTime};

    fn sample_bundle() -> Bundle {
        Bundle {
            primary_block: PrimaryBlock {
                version: 7,
                bundle_processing_flags: BundleFlags::empty(),
                crc: CRCType::NoCRC,
                destination_endpoint: Endpoint::new("dtn://n2/b").unwrap(),
                source_node: Endpoint::new("dtn://n1/a").unwrap(),
                report_to: Endpoint::new("dtn://n1/a").unwrap(),
                creation_timestamp: CreationTimestamp {
                    creation_time: DtnTime { timestamp: 1000 },
                    sequence_number: 1,
                },
                lifetime: 86_400_000,
            },
            blocks: vec![
                CanonicalBlock {
                    block: Block::HopCount(HopCountBlock { limit: 32, count: 0 }),
                    block_number: 2,
                    block_flags: BlockFlags::empty(),
                    crc: CRCType::NoCRC,
                },
                CanonicalBlock {
                    block: Block::Payload(PayloadBlock { data: b"hi".to_vec() }),
                    block_number: 1,
                    block_flags: BlockFlags::empty(),
                    crc: CRCType::NoCRC,
                },
            ],
        }
    }

    #[test]
    fn round_trips_through_cbor() {
        let bundle = sample_bundle();
        let encoded: Vec<u8> = (&bundle).try_into().unwrap();
        let decoded = Bundle::try_from(encoded.as_slice()).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn bundle_id_uses_source_and_creation_timestamp() {
        let bundle = sample_bundle();
        assert_eq!(bundle.bundle_id(), "dtn://n1/a-1000-1");
    }

    #[test]
    fn rejects_bundle_without_payload_block() {
        let mut bundle = sample_bundle();
        bundle.blocks.retain(|b| !matches!(b.block, Block::Payload(_)));
        assert!(!bundle.validate());
    }

    #[test]
    fn hop_count_increment_and_previous_node_replacement() {
        let mut bundle = sample_bundle();
        bundle.hop_count_block_mut().unwrap().count += 1;
        assert_eq!(bundle.hop_count_block_mut().unwrap().count, 1);

        assert!(!bundle.remove_previous_node_block());
        bundle.blocks.push(CanonicalBlock {
            block: Block::PreviousNode(crate::block::previous_node_block::PreviousNodeBlock {
                previous_node: Endpoint::new("dtn://n1/").unwrap(),
            }),
            block_number: bundle.next_block_number(),
            block_flags: BlockFlags::empty(),
            crc: CRCType::NoCRC,
        });
        assert!(bundle.remove_previous_node_block());
        assert!(bundle.previous_node_block().is_none());
    }

    #[test]
    fn bundle_age_block_defaults_absent_unless_added() {
        let mut bundle = sample_bundle();
        assert!(bundle.bundle_age_block_mut().is_none());
        bundle.blocks.push(CanonicalBlock {
            block: Block::BundleAge(BundleAgeBlock { age: 0 }),
            block_number: bundle.next_block_number(),
            block_flags: BlockFlags::empty(),
            crc: CRCType::NoCRC,
        });
        bundle.bundle_age_block_mut().unwrap().age += 500;
        assert_eq!(bundle.bundle_age_block_mut().unwrap().age, 500);
    }
}
