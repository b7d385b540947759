//! Donation ledger core: block and transaction model, proof-of-work hash
//! chain, integrity validation, and the `Ledger` service that ties them to
//! a pluggable storage backend.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod constants;
pub mod error;
pub mod ledger;
pub mod pow;
pub mod validate;

pub use error::{LedgerError, StateError};

/// One mined block of the donation chain. Immutable once committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// 64 lowercase hex chars, `sha256` over the canonical hash input.
    pub hash: String,
    /// Hash of the previous block; the genesis block carries the zero sentinel.
    pub previous_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Canonical JSON payload this block commits to.
    pub content: String,
    pub nonce: u64,
    /// Leading zero hex chars required of `hash`.
    pub difficulty: u32,
}

impl Block {
    /// Recompute the hash from the block's own fields.
    pub fn computed_hash(&self) -> String {
        pow::block_hash(
            self.height,
            &pow::canonical_timestamp(&self.timestamp),
            &self.content,
            &self.previous_hash,
            self.nonce,
        )
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

/// A donation recorded inside a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub id: Uuid,
    /// Height of the owning block. Blocks are keyed by height, which is
    /// unique and gapless, so no surrogate block id is needed.
    pub block_height: u64,
    pub project_id: u64,
    pub donor: Option<String>,
    pub remark: Option<String>,
    /// Serialized as a string; the default decimal codec needs
    /// self-describing formats, which bincode is not.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub tx_hash: String,
    /// Position within the block, 0-based.
    pub tx_index: u32,
    pub timestamp: DateTime<Utc>,
    /// Business-side donation id; unique across the chain when present.
    pub external_donate_id: Option<u64>,
}

#[derive(Serialize)]
struct DonationPayload<'a> {
    kind: &'static str,
    project_id: u64,
    amount: &'a Decimal,
    donor: Option<&'a str>,
    remark: Option<&'a str>,
    external_donate_id: Option<u64>,
    timestamp: String,
}

/// Canonical JSON content a donation block commits to. Field order is fixed
/// by the struct definition, so equal inputs always serialize identically.
pub fn donation_content(
    project_id: u64,
    amount: &Decimal,
    donor: Option<&str>,
    remark: Option<&str>,
    external_donate_id: Option<u64>,
    timestamp: &DateTime<Utc>,
) -> String {
    let payload = DonationPayload {
        kind: "donation",
        project_id,
        amount,
        donor,
        remark,
        external_donate_id,
        timestamp: pow::canonical_timestamp(timestamp),
    };
    serde_json::to_string(&payload).expect("donation payload serializes")
}

/// Hash identifying a transaction: sha256 over the owning height and the
/// canonical content string.
pub fn transaction_hash(block_height: u64, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block_height.to_be_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Listing row for a block. All figures are computed from the block's
/// transactions at read time, never stored as counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: DateTime<Utc>,
    pub tx_count: u64,
    pub total_amount: Decimal,
    /// Distinct project ids touched by this block, ascending.
    pub project_ids: Vec<u64>,
}

impl BlockSummary {
    pub fn from_parts(block: &Block, txs: &[ChainTransaction]) -> Self {
        let mut project_ids: Vec<u64> = txs.iter().map(|t| t.project_id).collect();
        project_ids.sort_unstable();
        project_ids.dedup();
        Self {
            height: block.height,
            hash: block.hash.clone(),
            previous_hash: block.previous_hash.clone(),
            timestamp: block.timestamp,
            tx_count: txs.len() as u64,
            total_amount: txs.iter().map(|t| t.amount).sum(),
            project_ids,
        }
    }
}

/// Full view of one block, transactions in `tx_index` order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockDetail {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub nonce: u64,
    pub difficulty: u32,
    pub tx_count: u64,
    pub total_amount: Decimal,
    pub transactions: Vec<ChainTransaction>,
}

impl BlockDetail {
    pub fn from_parts(block: Block, transactions: Vec<ChainTransaction>) -> Self {
        Self {
            height: block.height,
            hash: block.hash,
            previous_hash: block.previous_hash,
            timestamp: block.timestamp,
            content: block.content,
            nonce: block.nonce,
            difficulty: block.difficulty,
            tx_count: transactions.len() as u64,
            total_amount: transactions.iter().map(|t| t.amount).sum(),
            transactions,
        }
    }
}

/// One page of blocks, newest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockPage {
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
    pub items: Vec<BlockSummary>,
}

/// Chain-wide figures, derived from persisted state on every call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainInfo {
    pub height: u64,
    pub block_count: u64,
    pub total_tx_count: u64,
    pub total_amount: Decimal,
    pub latest_hash: Option<String>,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

/// Raw totals a store reports by scanning its trees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainAggregate {
    pub block_count: u64,
    pub tx_count: u64,
    pub total_amount: Decimal,
}
