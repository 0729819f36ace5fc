use serde::{Deserialize, Serialize};

use crate::{Address, BlockId, PubKey, Signature, Timestamp};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    fn tag(self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("prevote"),
            VoteType::Precommit => f.write_str("precommit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("signer address does not match the public key")]
    InvalidValidatorAddress,
    #[error("invalid signature")]
    InvalidSignature,
}

/// A signed prevote or precommit. A nil `block_id` is a vote for no block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: Signature,
}

impl Vote {
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        self.sign_bytes_at(chain_id, self.timestamp)
    }

    /// Sign bytes as they would be with a different timestamp.
    pub fn sign_bytes_at(&self, chain_id: &str, timestamp: Timestamp) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        put_chain_id(&mut buf, chain_id);
        buf.push(self.vote_type.tag());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.round.to_be_bytes());
        self.block_id.encode_into(&mut buf);
        buf.extend_from_slice(&timestamp.0.to_be_bytes());
        buf
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PubKey) -> Result<(), VerifyError> {
        if pub_key.address() != self.validator_address {
            return Err(VerifyError::InvalidValidatorAddress);
        }
        if !pub_key.verify(&self.sign_bytes(chain_id), &self.signature) {
            return Err(VerifyError::InvalidSignature);
        }
        Ok(())
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vote{{{}:{} {}/{} {} {}}}",
            self.validator_index,
            &self.validator_address.to_string()[..8],
            self.height,
            self.round,
            self.vote_type,
            self.block_id
        )
    }
}

pub(crate) fn put_chain_id(buf: &mut Vec<u8>, chain_id: &str) {
    let len = u16::try_from(chain_id.len()).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&chain_id.as_bytes()[..len as usize]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hash, PartSetHeader};

    fn signed_vote(key: &ed25519_consensus::SigningKey) -> Vote {
        let pub_key = PubKey(key.verification_key().to_bytes());
        let mut vote = Vote {
            vote_type: VoteType::Prevote,
            height: 3,
            round: 1,
            block_id: BlockId {
                hash: Hash::digest(b"block"),
                parts: PartSetHeader {
                    total: 1,
                    hash: Hash::digest(b"parts"),
                },
            },
            timestamp: Timestamp(1_000),
            validator_address: pub_key.address(),
            validator_index: 0,
            signature: Signature::ZERO,
        };
        vote.signature = Signature(key.sign(&vote.sign_bytes("test-chain")).to_bytes());
        vote
    }

    #[test]
    fn verify_checks_signature_and_address() {
        let key = ed25519_consensus::SigningKey::from([4; 32]);
        let vote = signed_vote(&key);
        let pub_key = PubKey(key.verification_key().to_bytes());
        assert_eq!(vote.verify("test-chain", &pub_key), Ok(()));
        assert_eq!(
            vote.verify("other-chain", &pub_key),
            Err(VerifyError::InvalidSignature)
        );

        let other = PubKey(
            ed25519_consensus::SigningKey::from([5; 32])
                .verification_key()
                .to_bytes(),
        );
        assert_eq!(
            vote.verify("test-chain", &other),
            Err(VerifyError::InvalidValidatorAddress)
        );
    }

    #[test]
    fn sign_bytes_depend_on_timestamp() {
        let key = ed25519_consensus::SigningKey::from([4; 32]);
        let vote = signed_vote(&key);
        assert_ne!(
            vote.sign_bytes("c"),
            vote.sign_bytes_at("c", Timestamp(2_000))
        );
        assert_eq!(vote.sign_bytes("c"), vote.sign_bytes_at("c", vote.timestamp));
    }
}
