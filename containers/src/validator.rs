use crate::{Bytes32, Header, ValidatorIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A block producer as reported by the finality oracle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub index: ValidatorIndex,
    /// Key the producer seals headers with.
    pub signing_key: Bytes32,
}

impl Validator {
    pub fn seal(&self, header: &Header) -> Bytes32 {
        compute_seal(&self.signing_key, &header.seal_hash())
    }

    pub fn sign_header(&self, header: &mut Header) {
        header.producer = self.index;
        header.seal = self.seal(header);
    }
}

pub fn compute_seal(signing_key: &Bytes32, seal_hash: &Bytes32) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(signing_key.as_bytes());
    hasher.update(seal_hash.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Bytes32::from(digest)
}

/// Snapshot of the producer set for a span of blocks.
///
/// Verification is deterministic for a given snapshot: the same set and the
/// same headers always produce the same outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, index: ValidatorIndex) -> Option<&Validator> {
        self.validators.iter().find(|v| v.index == index)
    }

    pub fn contains(&self, index: ValidatorIndex) -> bool {
        self.get(index).is_some()
    }

    /// In-turn producer for a block number (round robin over the set).
    pub fn in_turn(&self, number: u64) -> Option<&Validator> {
        if self.validators.is_empty() {
            return None;
        }
        self.validators.get((number % self.validators.len() as u64) as usize)
    }

    pub fn verify_seal(&self, header: &Header) -> bool {
        self.get(header.producer)
            .is_some_and(|validator| validator.seal(header) == header.seal)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }
}
