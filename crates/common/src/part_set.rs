//! Blocks travel as fixed-size parts, each carrying a merkle proof against
//! the part set hash in the block id.
use serde::{Deserialize, Serialize};

use crate::macros::hex_bytes;
use crate::{merkle, Hash, PartSetHeader};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub proof: merkle::Proof,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartSetError {
    #[error("part index {index} out of range for {total} parts")]
    UnexpectedIndex { index: u32, total: u32 },
    #[error("invalid merkle proof for part {0}")]
    InvalidProof(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartSet {
    hash: Hash,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Splits `data` into parts of at most `part_size` bytes.
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(part_size.max(1)).collect()
        };
        let (hash, proofs) = merkle::proofs(&chunks);
        let parts: Vec<Option<Part>> = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (chunk, proof))| {
                Some(Part {
                    index: i as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();
        Self {
            hash,
            count: parts.len() as u32,
            parts,
            byte_size: data.len(),
        }
    }

    /// An empty set waiting for the parts announced by `header`.
    pub fn from_header(header: &PartSetHeader) -> Self {
        Self {
            hash: header.hash,
            parts: vec![None; header.total as usize],
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total(),
            hash: self.hash,
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        &self.header() == header
    }

    pub fn total(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total()
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(Option::as_ref)
    }

    /// Which parts are present, by index.
    pub fn bit_array(&self) -> Vec<bool> {
        self.parts.iter().map(Option::is_some).collect()
    }

    /// Adds a part, returning `false` if it was already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        let total = self.total();
        let Some(slot) = self.parts.get_mut(part.index as usize) else {
            return Err(PartSetError::UnexpectedIndex {
                index: part.index,
                total,
            });
        };
        if slot.is_some() {
            return Ok(false);
        }
        if part.proof.index != part.index as usize
            || part.proof.total != total as usize
            || !part.proof.verify(&self.hash, &part.bytes)
        {
            return Err(PartSetError::InvalidProof(part.index));
        }
        self.byte_size += part.bytes.len();
        self.count += 1;
        *slot = Some(part);
        Ok(true)
    }

    /// Concatenated payload, once every part is present.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut data = Vec::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }
        Some(data)
    }
}
