//! Validator signing with double-sign protection.
//!
//! The signer remembers the height/round/step and sign bytes of the last
//! thing it signed. Signing anything at an earlier position fails. Signing
//! again at the same position only succeeds when the request is the same
//! payload, possibly with a different timestamp, in which case the previous
//! signature and timestamp are handed back. This keeps WAL replay from ever
//! producing a second, different signature for the same vote.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ed25519_consensus::SigningKey;
use serde::{Deserialize, Serialize};

use crate::macros::hex_bytes;
use crate::{Address, Proposal, PubKey, Signature, Timestamp, Vote, VoteType};

const STEP_PROPOSE: i8 = 1;
const STEP_PREVOTE: i8 = 2;
const STEP_PRECOMMIT: i8 = 3;

fn vote_step(vote_type: VoteType) -> i8 {
    match vote_type {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("height regression: got {got}, last signed {last}")]
    HeightRegression { got: u64, last: u64 },
    #[error("round regression at height {height}: got {got}, last signed {last}")]
    RoundRegression { height: u64, got: u32, last: u32 },
    #[error("step regression at {height}/{round}: got {got}, last signed {last}")]
    StepRegression {
        height: u64,
        round: u32,
        got: i8,
        last: i8,
    },
    #[error("conflicting data at {height}/{round} step {step}")]
    DoubleSign { height: u64, round: u32, step: i8 },
    #[error("signer state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("signer state encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid key file: {0}")]
    InvalidKey(String),
}

/// Signing capability of a validator.
pub trait PrivValidator: Send + Sync {
    fn pub_key(&self) -> PubKey;

    fn address(&self) -> Address {
        self.pub_key().address()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSignState {
    pub height: u64,
    pub round: u32,
    pub step: i8,
    pub signature: Option<Signature>,
    #[serde(with = "hex_bytes")]
    pub sign_bytes: Vec<u8>,
    pub timestamp: Option<Timestamp>,
}

impl LastSignState {
    /// Returns `true` if `(height, round, step)` is exactly the last signed
    /// position, `false` if it is strictly later.
    fn check_hrs(&self, height: u64, round: u32, step: i8) -> Result<bool, SignerError> {
        if height < self.height {
            return Err(SignerError::HeightRegression {
                got: height,
                last: self.height,
            });
        }
        if height > self.height {
            return Ok(false);
        }
        if round < self.round {
            return Err(SignerError::RoundRegression {
                height,
                got: round,
                last: self.round,
            });
        }
        if round > self.round {
            return Ok(false);
        }
        if step < self.step {
            return Err(SignerError::StepRegression {
                height,
                round,
                got: step,
                last: self.step,
            });
        }
        Ok(step == self.step && self.signature.is_some())
    }
}

pub struct LocalSigner {
    key: SigningKey,
    last: Mutex<LastSignState>,
    state_file: Option<PathBuf>,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.pub_key().address())
            .field("state_file", &self.state_file)
            .finish()
    }
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            last: Mutex::new(LastSignState::default()),
            state_file: None,
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from(seed))
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::new(rand::rngs::OsRng))
    }

    /// Loads the hex seed in `key_file`, creating a fresh key there if the
    /// file does not exist.
    pub fn load_or_generate(key_file: &Path) -> Result<Self, SignerError> {
        match std::fs::read_to_string(key_file) {
            Ok(contents) => {
                let mut seed = [0u8; 32];
                hex::decode_to_slice(contents.trim(), &mut seed)
                    .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
                Ok(Self::from_seed(seed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let signer = Self::generate();
                if let Some(parent) = key_file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(key_file, hex::encode(signer.key.to_bytes()))?;
                tracing::info!(path = %key_file.display(), address = %signer.pub_key().address(), "Generated validator key");
                Ok(signer)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persists the last sign state to `path` after every signature, loading
    /// any state already stored there.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Result<Self, SignerError> {
        let path = path.into();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let state: LastSignState = serde_json::from_slice(&bytes)?;
                *self.lock() = state;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state_file = Some(path);
        Ok(self)
    }

    pub fn last_sign_state(&self) -> LastSignState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, LastSignState> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, state: &LastSignState) -> Result<(), SignerError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Signs `sign_bytes` at `(height, round, step)` or returns the previous
    /// signature (and its timestamp) when the request is a repeat.
    fn sign_at(
        &self,
        height: u64,
        round: u32,
        step: i8,
        sign_bytes: Vec<u8>,
        timestamp: Timestamp,
        bytes_at: impl Fn(Timestamp) -> Vec<u8>,
    ) -> Result<(Signature, Timestamp), SignerError> {
        let mut last = self.lock();
        if last.check_hrs(height, round, step)? {
            if let Some(signature) = last.signature {
                if sign_bytes == last.sign_bytes {
                    return Ok((signature, timestamp));
                }
                if let Some(last_ts) = last.timestamp {
                    if bytes_at(last_ts) == last.sign_bytes {
                        return Ok((signature, last_ts));
                    }
                }
            }
            return Err(SignerError::DoubleSign {
                height,
                round,
                step,
            });
        }

        let signature = Signature(self.key.sign(&sign_bytes).to_bytes());
        let next = LastSignState {
            height,
            round,
            step,
            signature: Some(signature),
            sign_bytes,
            timestamp: Some(timestamp),
        };
        self.save(&next)?;
        *last = next;
        Ok((signature, timestamp))
    }
}

impl PrivValidator for LocalSigner {
    fn pub_key(&self) -> PubKey {
        PubKey(self.key.verification_key().to_bytes())
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let (signature, timestamp) = self.sign_at(
            vote.height,
            vote.round,
            vote_step(vote.vote_type),
            vote.sign_bytes(chain_id),
            vote.timestamp,
            |ts| vote.sign_bytes_at(chain_id, ts),
        )?;
        vote.signature = signature;
        vote.timestamp = timestamp;
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        let (signature, timestamp) = self.sign_at(
            proposal.height,
            proposal.round,
            STEP_PROPOSE,
            proposal.sign_bytes(chain_id),
            proposal.timestamp,
            |ts| proposal.sign_bytes_at(chain_id, ts),
        )?;
        proposal.signature = signature;
        proposal.timestamp = timestamp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{BlockId, Hash, PartSetHeader};

    const CHAIN: &str = "test-chain";

    fn vote(signer: &LocalSigner, round: u32, vote_type: VoteType, block: Option<&str>) -> Vote {
        let block_id = block
            .map(|b| BlockId {
                hash: Hash::digest(b),
                parts: PartSetHeader {
                    total: 1,
                    hash: Hash::digest(b),
                },
            })
            .unwrap_or_default();
        Vote {
            vote_type,
            height: 5,
            round,
            block_id,
            timestamp: Timestamp(1_000 + round as u64),
            validator_address: signer.address(),
            validator_index: 0,
            signature: Signature::ZERO,
        }
    }

    #[test]
    fn signature_verifies() {
        let signer = LocalSigner::from_seed([1; 32]);
        let mut v = vote(&signer, 0, VoteType::Prevote, Some("a"));
        signer.sign_vote(CHAIN, &mut v).unwrap();
        v.verify(CHAIN, &signer.pub_key()).unwrap();
    }

    #[test]
    fn conflicting_vote_at_same_step_is_refused() {
        let signer = LocalSigner::from_seed([1; 32]);
        let mut a = vote(&signer, 0, VoteType::Prevote, Some("a"));
        signer.sign_vote(CHAIN, &mut a).unwrap();
        let mut b = vote(&signer, 0, VoteType::Prevote, Some("b"));
        assert_matches!(
            signer.sign_vote(CHAIN, &mut b),
            Err(SignerError::DoubleSign { height: 5, round: 0, .. })
        );
    }

    #[test]
    fn repeat_with_new_timestamp_reuses_signature() {
        let signer = LocalSigner::from_seed([1; 32]);
        let mut first = vote(&signer, 0, VoteType::Precommit, Some("a"));
        signer.sign_vote(CHAIN, &mut first).unwrap();

        let mut again = first.clone();
        again.timestamp = Timestamp(99_999);
        again.signature = Signature::ZERO;
        signer.sign_vote(CHAIN, &mut again).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn regressions_are_refused() {
        let signer = LocalSigner::from_seed([1; 32]);
        let mut later = vote(&signer, 2, VoteType::Precommit, None);
        signer.sign_vote(CHAIN, &mut later).unwrap();

        let mut earlier_round = vote(&signer, 1, VoteType::Precommit, None);
        assert_matches!(
            signer.sign_vote(CHAIN, &mut earlier_round),
            Err(SignerError::RoundRegression { .. })
        );
        let mut earlier_step = vote(&signer, 2, VoteType::Prevote, None);
        assert_matches!(
            signer.sign_vote(CHAIN, &mut earlier_step),
            Err(SignerError::StepRegression { .. })
        );
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sign_state.json");

        let signer = LocalSigner::from_seed([7; 32]).with_state_file(&path).unwrap();
        let mut a = vote(&signer, 0, VoteType::Prevote, Some("a"));
        signer.sign_vote(CHAIN, &mut a).unwrap();
        drop(signer);

        let restarted = LocalSigner::from_seed([7; 32]).with_state_file(&path).unwrap();
        assert_eq!(restarted.last_sign_state().height, 5);
        let mut b = vote(&restarted, 0, VoteType::Prevote, Some("b"));
        assert_matches!(
            restarted.sign_vote(CHAIN, &mut b),
            Err(SignerError::DoubleSign { .. })
        );
    }

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("validator.key");
        let first = LocalSigner::load_or_generate(&path).unwrap();
        let second = LocalSigner::load_or_generate(&path).unwrap();
        assert_eq!(first.pub_key(), second.pub_key());
    }
}
