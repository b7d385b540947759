//! Chain integrity checking. The validator walks blocks in ascending
//! height order, recertifies each block, and reports the first violation.
//! It never repairs anything.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::GENESIS_PREVIOUS_HASH;
use crate::{pow, Block};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Stored hash does not match the hash recomputed from the block fields.
    HashMismatch,
    /// The hash is internally consistent but misses its own difficulty.
    DifficultyNotMet,
    /// Height sequence or previous-hash linkage is broken, including a
    /// genesis block without the zero sentinel.
    BrokenLink,
}

/// First integrity violation found in a chain walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("chain integrity violated at height {height}: {kind:?}")]
pub struct IntegrityViolation {
    pub height: u64,
    pub kind: ViolationKind,
}

/// Validate `blocks`, which must be ordered by ascending height. An empty
/// chain is valid. Stops at the first violation.
pub fn validate_chain(blocks: &[Block]) -> Result<(), IntegrityViolation> {
    for (i, block) in blocks.iter().enumerate() {
        if block.computed_hash() != block.hash {
            return Err(IntegrityViolation {
                height: block.height,
                kind: ViolationKind::HashMismatch,
            });
        }
        if !pow::meets_difficulty(&block.hash, block.difficulty) {
            return Err(IntegrityViolation {
                height: block.height,
                kind: ViolationKind::DifficultyNotMet,
            });
        }
        let linked = if i == 0 {
            block.height == 0 && block.previous_hash == GENESIS_PREVIOUS_HASH
        } else {
            let prev = &blocks[i - 1];
            block.height == prev.height + 1 && block.previous_hash == prev.hash
        };
        if !linked {
            return Err(IntegrityViolation {
                height: block.height,
                kind: ViolationKind::BrokenLink,
            });
        }
    }
    Ok(())
}
