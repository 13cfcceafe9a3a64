//! Block parts. A block is gossiped as an ordered set of parts committed
//! to by a Merkle root, so that peers can validate every part on arrival.
use super::{merkle, Block, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a single block part.
pub const PART_SIZE: usize = 65536;

/// Commitment to a part set: the number of parts and their Merkle root.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, core::hash::Hash, Serialize, Deserialize,
)]
pub struct PartSetHeader {
    /// Number of parts.
    pub total: u32,
    /// Merkle root over the part bytes.
    pub hash: Hash,
}

impl PartSetHeader {
    /// Whether this is the zero header (of a nil block id).
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// A single part of a block, with its inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Index of the part.
    pub index: u32,
    /// Raw bytes of the part.
    pub bytes: Vec<u8>,
    /// Proof of inclusion under the part-set root.
    pub proof: merkle::Proof,
}

/// Errors rejecting a block part.
#[derive(Debug, thiserror::Error)]
pub enum PartSetError {
    /// Part index does not fit the header.
    #[error("part index out of range (index: {index}, total: {total})")]
    OutOfRange {
        /// Index of the rejected part.
        index: u32,
        /// Number of parts in the set.
        total: u32,
    },
    /// Part proof does not match the part-set root.
    #[error("part proof does not match the part set root")]
    InvalidProof(#[from] merkle::InvalidProofError),
}

/// Tracks the parts of one block as they arrive.
#[derive(Clone, Debug)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: u64,
}

impl PartSet {
    /// Splits serialized block data into proven parts.
    pub fn from_data(data: &[u8]) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(PART_SIZE).collect()
        };
        let (root, proofs) = merkle::proofs(chunks.iter());
        let parts: Vec<Option<Part>> = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                Some(Part {
                    index: index as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();
        Self {
            header: PartSetHeader {
                total: parts.len() as u32,
                hash: root,
            },
            count: parts.len() as u32,
            byte_size: data.len() as u64,
            parts,
        }
    }

    /// An empty set expecting parts matching the given header.
    pub fn from_header(header: PartSetHeader) -> Self {
        Self {
            header,
            parts: vec![None; header.total as usize],
            count: 0,
            byte_size: 0,
        }
    }

    /// The commitment this set is filling.
    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    /// Whether this set fills the given commitment.
    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    /// Adds a part. Returns `Ok(false)` if the part was already present;
    /// rejects parts with an out-of-range index or a proof that does not
    /// match the root.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::OutOfRange {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        part.proof.verify(&self.header.hash, &part.bytes)?;
        self.count += 1;
        self.byte_size += part.bytes.len() as u64;
        let index = part.index as usize;
        self.parts[index] = Some(part);
        Ok(true)
    }

    /// The part at the given index, if it has arrived.
    pub fn part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)?.as_ref()
    }

    /// Number of parts received so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Sum of the sizes of the received parts.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Whether all parts have arrived.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Iterates over the received parts.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().flatten()
    }

    /// Reassembles the block from a complete set.
    pub fn assemble(&self) -> anyhow::Result<Block> {
        anyhow::ensure!(self.is_complete(), "part set is incomplete");
        let mut data = Vec::with_capacity(self.byte_size as usize);
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }
        Ok(bincode::deserialize(&data)?)
    }
}

impl fmt::Display for PartSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} parts", self.count, self.header.total)
    }
}
