use serde::{Deserialize, Serialize};

use crate::vote::put_chain_id;
use crate::{BlockId, PubKey, Signature, Timestamp};

/// A signed block proposal for one round. `pol_round` names the earlier round
/// whose prevote quorum justifies re-proposing `block_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub pol_round: Option<u32>,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl Proposal {
    pub fn new(height: u64, round: u32, pol_round: Option<u32>, block_id: BlockId) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp: Timestamp::now(),
            signature: Signature::ZERO,
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        self.sign_bytes_at(chain_id, self.timestamp)
    }

    pub fn sign_bytes_at(&self, chain_id: &str, timestamp: Timestamp) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        put_chain_id(&mut buf, chain_id);
        buf.push(0x20);
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.round.to_be_bytes());
        // -1 encodes "no POL round".
        let pol = self.pol_round.map(i64::from).unwrap_or(-1);
        buf.extend_from_slice(&pol.to_be_bytes());
        self.block_id.encode_into(&mut buf);
        buf.extend_from_slice(&timestamp.0.to_be_bytes());
        buf
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PubKey) -> bool {
        pub_key.verify(&self.sign_bytes(chain_id), &self.signature)
    }

    /// `pol_round`, when present, must precede `round`.
    pub fn validate_basic(&self) -> bool {
        self.block_id.is_complete() && self.pol_round.map_or(true, |pol| pol < self.round)
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} ({}, pol {:?})}}",
            self.height, self.round, self.block_id, self.pol_round
        )
    }
}
