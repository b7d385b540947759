#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use ledger_core::constants::GENESIS_PREVIOUS_HASH;
use ledger_core::{pow, transaction_hash, Block, ChainTransaction};
use ledger_storage::SledStore;
use rust_decimal::Decimal;
use std::str::FromStr;
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

pub fn temp_store() -> (TempDir, SledStore) {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let store = SledStore::open(temp_dir.path()).expect("failed to open sled store");
    (temp_dir, store)
}

pub fn fixed_ts(height: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000 + height as i64, 0).unwrap()
}

/// Block mined at difficulty 0, so store-level tests pay no search cost
/// while the chain still validates.
pub fn sample_block(height: u64, previous_hash: &str) -> Block {
    let timestamp = fixed_ts(height);
    let content = format!(r#"{{"kind":"test","height":{height}}}"#);
    let ts_iso = pow::canonical_timestamp(&timestamp);
    let (hash, nonce) = pow::mine(height, &ts_iso, &content, previous_hash, 0);
    Block {
        height,
        hash,
        previous_hash: previous_hash.to_string(),
        timestamp,
        content,
        nonce,
        difficulty: 0,
    }
}

pub fn sample_chain(len: u64) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut previous_hash = GENESIS_PREVIOUS_HASH.to_string();
    for height in 0..len {
        let block = sample_block(height, &previous_hash);
        previous_hash = block.hash.clone();
        blocks.push(block);
    }
    blocks
}

pub fn sample_tx(
    height: u64,
    tx_index: u32,
    amount: &str,
    external_donate_id: Option<u64>,
) -> ChainTransaction {
    let content = format!("tx-{height}-{tx_index}");
    ChainTransaction {
        id: Uuid::new_v4(),
        block_height: height,
        project_id: 1 + height,
        donor: Some("alice".to_string()),
        remark: None,
        amount: Decimal::from_str(amount).expect("valid decimal"),
        tx_hash: transaction_hash(height, &content),
        tx_index,
        timestamp: fixed_ts(height),
        external_donate_id,
    }
}
