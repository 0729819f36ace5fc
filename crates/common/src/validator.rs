//! Validators, validator sets and weighted round-robin proposer selection.
use std::cmp::Ordering;

use ed25519_consensus::{Signature as EdSignature, VerificationKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::macros::fixed_bytes;
use crate::{merkle, Hash};

fixed_bytes!(Address, 20);
fixed_bytes!(PubKey, 32);
fixed_bytes!(Signature, 64);

/// Priorities are kept within `PRIORITY_WINDOW_SIZE_FACTOR * total_power` of
/// each other.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

/// Upper bound for the total voting power so that priority arithmetic cannot
/// overflow.
pub const MAX_TOTAL_VOTING_POWER: i64 = i64::MAX / 8;

impl PubKey {
    pub fn address(&self) -> Address {
        let digest = Sha256::digest(self.0);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[..20]);
        Address(address)
    }

    pub fn verify(&self, msg: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerificationKey::try_from(self.0) else {
            return false;
        };
        key.verify(&EdSignature::from(signature.0), msg).is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PubKey,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PubKey, voting_power: i64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Higher priority wins, ties go to the lower address.
    fn compare_priority(&self, other: &Validator) -> Ordering {
        self.proposer_priority
            .cmp(&other.proposer_priority)
            .then_with(|| other.address.cmp(&self.address))
    }

    fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 8);
        bytes.extend_from_slice(self.pub_key.as_bytes());
        bytes.extend_from_slice(&self.voting_power.to_be_bytes());
        bytes
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,
    #[error("duplicate validator {0}")]
    Duplicate(Address),
    #[error("validator {0} has non-positive voting power {1}")]
    NonPositivePower(Address, i64),
    #[error("total voting power exceeds {MAX_TOTAL_VOTING_POWER}")]
    TotalPowerTooLarge,
}

/// Ordered (by address) set of validators for one height.
///
/// The proposer for each round is chosen by a weighted round-robin: each
/// increment adds every validator's power to its priority, the highest
/// priority proposes and has the total power subtracted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Validator>,
    total_voting_power: i64,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let mut total: i64 = 0;
        for (i, v) in validators.iter().enumerate() {
            if v.voting_power <= 0 {
                return Err(ValidatorSetError::NonPositivePower(v.address, v.voting_power));
            }
            if i > 0 && validators[i - 1].address == v.address {
                return Err(ValidatorSetError::Duplicate(v.address));
            }
            total = total
                .checked_add(v.voting_power)
                .filter(|t| *t <= MAX_TOTAL_VOTING_POWER)
                .ok_or(ValidatorSetError::TotalPowerTooLarge)?;
        }

        let mut set = Self {
            validators,
            proposer: None,
            total_voting_power: total,
        };
        set.increment_proposer_priority(1);
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    /// Voting power strictly above which a value has a two-thirds majority.
    pub fn two_thirds_threshold(&self) -> i64 {
        self.total_voting_power * 2 / 3
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| (i as u32, &self.validators[i]))
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn proposer(&self) -> Option<&Validator> {
        self.proposer.as_ref()
    }

    pub fn hash(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self.validators.iter().map(Validator::hash_bytes).collect();
        merkle::root(&leaves)
    }

    /// Returns a copy with the proposer priorities advanced `times` rounds.
    pub fn copy_increment_proposer_priority(&self, times: u32) -> Self {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    pub fn increment_proposer_priority(&mut self, times: u32) {
        if times == 0 || self.validators.is_empty() {
            return;
        }
        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        let mut proposer = None;
        for _ in 0..times {
            proposer = Some(self.increment_proposer_priority_once());
        }
        self.proposer = proposer;
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 {
            return;
        }
        let (min, max) = self
            .validators
            .iter()
            .fold((i64::MAX, i64::MIN), |(min, max), v| {
                (min.min(v.proposer_priority), max.max(v.proposer_priority))
            });
        let diff = max.saturating_sub(min);
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for v in &mut self.validators {
                v.proposer_priority /= ratio;
            }
        }
    }

    fn shift_by_avg_proposer_priority(&mut self) {
        let n = self.validators.len() as i128;
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority as i128)
            .sum();
        let avg = sum.div_euclid(n) as i64;
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_sub(avg);
        }
    }

    fn increment_proposer_priority_once(&mut self) -> Validator {
        for v in &mut self.validators {
            v.proposer_priority = v.proposer_priority.saturating_add(v.voting_power);
        }
        let mut mostest = 0;
        for i in 1..self.validators.len() {
            if self.validators[i].compare_priority(&self.validators[mostest]) == Ordering::Greater {
                mostest = i;
            }
        }
        let proposer = &mut self.validators[mostest];
        proposer.proposer_priority = proposer
            .proposer_priority
            .saturating_sub(self.total_voting_power);
        proposer.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn validator(seed: u8, power: i64) -> Validator {
        let key = ed25519_consensus::SigningKey::from([seed; 32]);
        Validator::new(PubKey(key.verification_key().to_bytes()), power)
    }

    #[test]
    fn rejects_invalid_sets() {
        assert_eq!(ValidatorSet::new(vec![]), Err(ValidatorSetError::Empty));
        let v = validator(1, 10);
        assert_eq!(
            ValidatorSet::new(vec![v.clone(), v.clone()]),
            Err(ValidatorSetError::Duplicate(v.address))
        );
        let zero = validator(2, 0);
        assert_eq!(
            ValidatorSet::new(vec![zero.clone()]),
            Err(ValidatorSetError::NonPositivePower(zero.address, 0))
        );
    }

    #[test]
    fn proposer_frequency_is_proportional_to_power() {
        let set = ValidatorSet::new(vec![validator(1, 1), validator(2, 2), validator(3, 7)]).unwrap();
        let mut counts: HashMap<Address, usize> = HashMap::new();
        let mut current = set;
        for _ in 0..1000 {
            let proposer = current.proposer().unwrap().address;
            *counts.entry(proposer).or_default() += 1;
            current.increment_proposer_priority(1);
        }
        assert_eq!(counts[&validator(1, 1).address], 100);
        assert_eq!(counts[&validator(2, 2).address], 200);
        assert_eq!(counts[&validator(3, 7).address], 700);
    }

    #[test]
    fn equal_power_rotates_through_everyone() {
        let vals: Vec<_> = (1..=4).map(|i| validator(i, 10)).collect();
        let mut set = ValidatorSet::new(vals).unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(set.proposer().unwrap().address);
            set.increment_proposer_priority(1);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn copy_increment_matches_repeated_increment() {
        let set = ValidatorSet::new(vec![validator(1, 3), validator(2, 5)]).unwrap();
        let mut stepped = set.clone();
        stepped.increment_proposer_priority(1);
        stepped.increment_proposer_priority(1);
        let copied = set.copy_increment_proposer_priority(2);
        assert_eq!(stepped.proposer(), copied.proposer());
    }

    #[test]
    fn signature_verification() {
        let key = ed25519_consensus::SigningKey::from([9; 32]);
        let pub_key = PubKey(key.verification_key().to_bytes());
        let sig = Signature(key.sign(b"payload").to_bytes());
        assert!(pub_key.verify(b"payload", &sig));
        assert!(!pub_key.verify(b"other", &sig));
    }
}
