//! The ledger service: genesis bootstrap, the append critical section, and
//! the read-side queries, all over a pluggable [`ChainState`] backend.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_DIFFICULTY, GENESIS_CONTENT, GENESIS_PREVIOUS_HASH, MAX_APPEND_ATTEMPTS,
    MAX_PAGE_LIMIT, MAX_REMARK_CHARS,
};
use crate::error::{LedgerError, StateError};
use crate::validate::{validate_chain, IntegrityViolation};
use crate::{
    donation_content, pow, transaction_hash, Block, BlockDetail, BlockPage, BlockSummary,
    ChainAggregate, ChainInfo, ChainTransaction,
};

/// Trait the storage backends should implement for the ledger to operate.
/// This lives in `ledger-core` to avoid a circular dependency.
pub trait ChainState: Send + Sync {
    /// Persist a block with its transactions atomically. Must fail with a
    /// downcastable [`StateError`] and write nothing when the height is
    /// taken or an external donation id is already recorded.
    fn append_block(&self, block: &Block, txs: &[ChainTransaction]) -> anyhow::Result<()>;

    fn latest_block(&self) -> anyhow::Result<Option<Block>>;

    fn block_by_height(&self, height: u64) -> anyhow::Result<Option<Block>>;

    /// Transactions of one block, ordered by `tx_index`.
    fn transactions_for_block(&self, height: u64) -> anyhow::Result<Vec<ChainTransaction>>;

    /// One page of blocks by descending height, plus the total block count.
    fn blocks_paged(&self, offset: u64, limit: u64) -> anyhow::Result<(u64, Vec<Block>)>;

    /// Every block in ascending height order, for the integrity walk.
    fn all_blocks(&self) -> anyhow::Result<Vec<Block>>;

    /// Totals recomputed by scanning persisted state.
    fn aggregate(&self) -> anyhow::Result<ChainAggregate>;

    fn transaction_by_external_id(&self, id: u64) -> anyhow::Result<Option<ChainTransaction>>;

    fn close(&self) -> anyhow::Result<()>;
}

/// A donation to be appended to the chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DonationRequest {
    pub project_id: u64,
    pub amount: Decimal,
    #[serde(default)]
    pub donor: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub external_donate_id: Option<u64>,
}

/// Ledger facade over a [`ChainState`]. Appends are serialized through the
/// internal lock; reads go straight to the store.
pub struct Ledger<S: ChainState> {
    store: Arc<S>,
    difficulty: u32,
    append_lock: Mutex<()>,
}

impl<S: ChainState> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_difficulty(store, DEFAULT_DIFFICULTY)
    }

    pub fn with_difficulty(store: Arc<S>, difficulty: u32) -> Self {
        Self {
            store,
            difficulty,
            append_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Ensure the genesis block exists. Idempotent; a caller losing the
    /// height-0 race to a concurrent writer re-reads the winner's block.
    pub fn ensure_genesis(&self) -> Result<Block, LedgerError> {
        if let Some(genesis) = self.store.block_by_height(0)? {
            return Ok(genesis);
        }
        let timestamp = Utc::now();
        let ts_iso = pow::canonical_timestamp(&timestamp);
        let (hash, nonce) = pow::mine(0, &ts_iso, GENESIS_CONTENT, GENESIS_PREVIOUS_HASH, self.difficulty);
        let genesis = Block {
            height: 0,
            hash,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            timestamp,
            content: GENESIS_CONTENT.to_string(),
            nonce,
            difficulty: self.difficulty,
        };
        match self.store.append_block(&genesis, &[]) {
            Ok(()) => {
                info!(hash = %genesis.hash, "created genesis block");
                Ok(genesis)
            }
            Err(err) if is_height_occupied(&err) => {
                let winner = self
                    .store
                    .block_by_height(0)?
                    .ok_or_else(|| anyhow!("genesis missing after height-0 conflict"))?;
                Ok(winner)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Append one donation as a freshly mined block. Validation happens
    /// before any mining; a duplicate `external_donate_id` replays the
    /// already committed pair instead of growing the chain.
    pub fn append_donation(
        &self,
        request: DonationRequest,
    ) -> Result<(Block, ChainTransaction), LedgerError> {
        validate_request(&request)?;
        if let Some(existing) = self.replay_existing(&request)? {
            return Ok(existing);
        }

        let _guard = self.append_lock.lock().expect("append lock poisoned");
        self.ensure_genesis()?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let latest = self
                .store
                .latest_block()?
                .ok_or_else(|| anyhow!("chain empty after genesis"))?;
            let height = latest.height + 1;
            let timestamp = Utc::now();
            let content = donation_content(
                request.project_id,
                &request.amount,
                request.donor.as_deref(),
                request.remark.as_deref(),
                request.external_donate_id,
                &timestamp,
            );
            let ts_iso = pow::canonical_timestamp(&timestamp);
            let (hash, nonce) = pow::mine(height, &ts_iso, &content, &latest.hash, self.difficulty);
            let block = Block {
                height,
                hash,
                previous_hash: latest.hash.clone(),
                timestamp,
                content: content.clone(),
                nonce,
                difficulty: self.difficulty,
            };
            let tx = ChainTransaction {
                id: Uuid::new_v4(),
                block_height: height,
                project_id: request.project_id,
                donor: request.donor.clone(),
                remark: request.remark.clone(),
                amount: request.amount,
                tx_hash: transaction_hash(height, &content),
                tx_index: 0,
                timestamp,
                external_donate_id: request.external_donate_id,
            };
            match self.store.append_block(&block, std::slice::from_ref(&tx)) {
                Ok(()) => {
                    info!(height, tx = %tx.id, "appended donation block");
                    return Ok((block, tx));
                }
                Err(err) if is_height_occupied(&err) => {
                    if attempts >= MAX_APPEND_ATTEMPTS {
                        return Err(LedgerError::Conflict { attempts });
                    }
                    debug!(height, attempts, "append lost the height race, retrying");
                }
                Err(err) if is_duplicate_external(&err) => {
                    // An external writer committed the same donation id
                    // between our replay check and the append.
                    if let Some(existing) = self.replay_existing(&request)? {
                        return Ok(existing);
                    }
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn chain_info(&self) -> Result<ChainInfo, LedgerError> {
        let aggregate = self.store.aggregate()?;
        let latest = self.store.latest_block()?;
        Ok(ChainInfo {
            height: latest.as_ref().map(|b| b.height).unwrap_or(0),
            block_count: aggregate.block_count,
            total_tx_count: aggregate.tx_count,
            total_amount: aggregate.total_amount,
            latest_hash: latest.as_ref().map(|b| b.hash.clone()),
            latest_timestamp: latest.map(|b| b.timestamp),
        })
    }

    /// Blocks by descending height. `limit` is clamped to `1..=100`.
    pub fn blocks_paged(&self, offset: u64, limit: u64) -> Result<BlockPage, LedgerError> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let (total, blocks) = self.store.blocks_paged(offset, limit)?;
        let mut items = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let txs = self.store.transactions_for_block(block.height)?;
            items.push(BlockSummary::from_parts(block, &txs));
        }
        Ok(BlockPage {
            total,
            offset,
            limit,
            items,
        })
    }

    pub fn block_detail(&self, height: u64) -> Result<Option<BlockDetail>, LedgerError> {
        let Some(block) = self.store.block_by_height(height)? else {
            return Ok(None);
        };
        let txs = self.store.transactions_for_block(height)?;
        Ok(Some(BlockDetail::from_parts(block, txs)))
    }

    pub fn transaction_by_external_id(
        &self,
        id: u64,
    ) -> Result<Option<ChainTransaction>, LedgerError> {
        Ok(self.store.transaction_by_external_id(id)?)
    }

    /// Full ascending integrity walk. `None` means the chain is sound.
    pub fn validate(&self) -> Result<Option<IntegrityViolation>, LedgerError> {
        let blocks = self.store.all_blocks()?;
        Ok(validate_chain(&blocks).err())
    }

    fn replay_existing(
        &self,
        request: &DonationRequest,
    ) -> Result<Option<(Block, ChainTransaction)>, LedgerError> {
        let Some(id) = request.external_donate_id else {
            return Ok(None);
        };
        let Some(tx) = self.store.transaction_by_external_id(id)? else {
            return Ok(None);
        };
        let block = self
            .store
            .block_by_height(tx.block_height)?
            .ok_or_else(|| anyhow!("transaction {} points at missing block {}", tx.id, tx.block_height))?;
        Ok(Some((block, tx)))
    }
}

fn validate_request(request: &DonationRequest) -> Result<(), LedgerError> {
    if request.amount <= Decimal::ZERO {
        return Err(LedgerError::Validation {
            field: "amount",
            reason: format!("must be positive, got {}", request.amount),
        });
    }
    if let Some(remark) = &request.remark {
        let chars = remark.chars().count();
        if chars > MAX_REMARK_CHARS {
            return Err(LedgerError::Validation {
                field: "remark",
                reason: format!("{chars} chars exceeds the {MAX_REMARK_CHARS} char limit"),
            });
        }
    }
    Ok(())
}

fn is_height_occupied(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StateError>(),
        Some(StateError::HeightOccupied(_))
    )
}

fn is_duplicate_external(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StateError>(),
        Some(StateError::DuplicateExternalId(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory [`ChainState`] double. `forced_conflicts` makes the next N
    /// appends fail with `HeightOccupied` to exercise the retry loop.
    #[derive(Default)]
    struct MemoryState {
        inner: Mutex<MemoryInner>,
        forced_conflicts: AtomicU32,
    }

    #[derive(Default)]
    struct MemoryInner {
        blocks: BTreeMap<u64, Block>,
        txs: BTreeMap<(u64, u32), ChainTransaction>,
    }

    impl MemoryState {
        fn force_conflicts(&self, n: u32) {
            self.forced_conflicts.store(n, Ordering::SeqCst);
        }
    }

    impl ChainState for MemoryState {
        fn append_block(&self, block: &Block, txs: &[ChainTransaction]) -> anyhow::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if self
                .forced_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StateError::HeightOccupied(block.height).into());
            }
            if inner.blocks.contains_key(&block.height) {
                return Err(StateError::HeightOccupied(block.height).into());
            }
            for tx in txs {
                if let Some(id) = tx.external_donate_id {
                    if inner
                        .txs
                        .values()
                        .any(|t| t.external_donate_id == Some(id))
                    {
                        return Err(StateError::DuplicateExternalId(id).into());
                    }
                }
            }
            inner.blocks.insert(block.height, block.clone());
            for tx in txs {
                inner.txs.insert((block.height, tx.tx_index), tx.clone());
            }
            Ok(())
        }

        fn latest_block(&self) -> anyhow::Result<Option<Block>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.blocks.values().next_back().cloned())
        }

        fn block_by_height(&self, height: u64) -> anyhow::Result<Option<Block>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.blocks.get(&height).cloned())
        }

        fn transactions_for_block(&self, height: u64) -> anyhow::Result<Vec<ChainTransaction>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .txs
                .range((height, 0)..=(height, u32::MAX))
                .map(|(_, tx)| tx.clone())
                .collect())
        }

        fn blocks_paged(&self, offset: u64, limit: u64) -> anyhow::Result<(u64, Vec<Block>)> {
            let inner = self.inner.lock().unwrap();
            let total = inner.blocks.len() as u64;
            let page = inner
                .blocks
                .values()
                .rev()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect();
            Ok((total, page))
        }

        fn all_blocks(&self) -> anyhow::Result<Vec<Block>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.blocks.values().cloned().collect())
        }

        fn aggregate(&self) -> anyhow::Result<ChainAggregate> {
            let inner = self.inner.lock().unwrap();
            Ok(ChainAggregate {
                block_count: inner.blocks.len() as u64,
                tx_count: inner.txs.len() as u64,
                total_amount: inner.txs.values().map(|t| t.amount).sum(),
            })
        }

        fn transaction_by_external_id(
            &self,
            id: u64,
        ) -> anyhow::Result<Option<ChainTransaction>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .txs
                .values()
                .find(|t| t.external_donate_id == Some(id))
                .cloned())
        }

        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_ledger() -> Ledger<MemoryState> {
        // Difficulty 2 keeps mining fast while still exercising the search.
        Ledger::with_difficulty(Arc::new(MemoryState::default()), 2)
    }

    fn donation(project_id: u64, amount: &str) -> DonationRequest {
        DonationRequest {
            project_id,
            amount: Decimal::from_str(amount).unwrap(),
            donor: None,
            remark: None,
            external_donate_id: None,
        }
    }

    #[test]
    fn ensure_genesis_is_idempotent() {
        let ledger = test_ledger();
        let first = ledger.ensure_genesis().unwrap();
        let second = ledger.ensure_genesis().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.height, 0);
        assert_eq!(first.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(pow::meets_difficulty(&first.hash, 2));
        assert_eq!(ledger.chain_info().unwrap().block_count, 1);
    }

    #[test]
    fn first_donation_creates_genesis_and_block_one() {
        let ledger = test_ledger();
        let mut request = donation(7, "100.50");
        request.donor = Some("alice".to_string());
        let (block, tx) = ledger.append_donation(request).unwrap();

        assert_eq!(block.height, 1);
        assert_eq!(tx.block_height, 1);
        assert_eq!(tx.tx_index, 0);
        assert_eq!(tx.amount, Decimal::from_str("100.50").unwrap());
        assert_eq!(tx.tx_hash, transaction_hash(1, &block.content));

        let genesis = ledger.store().block_by_height(0).unwrap().unwrap();
        assert_eq!(block.previous_hash, genesis.hash);

        let info = ledger.chain_info().unwrap();
        assert_eq!(info.height, 1);
        assert_eq!(info.block_count, 2);
        assert_eq!(info.total_tx_count, 1);
        assert_eq!(info.total_amount, Decimal::from_str("100.50").unwrap());
        assert_eq!(info.latest_hash.as_deref(), Some(block.hash.as_str()));
    }

    #[test]
    fn non_positive_amounts_are_rejected_before_any_write() {
        let ledger = test_ledger();
        for amount in ["0", "-5"] {
            let err = ledger.append_donation(donation(1, amount)).unwrap_err();
            assert!(matches!(
                err,
                LedgerError::Validation { field: "amount", .. }
            ));
        }
        // Validation fails before genesis is even bootstrapped.
        assert_eq!(ledger.chain_info().unwrap().block_count, 0);
    }

    #[test]
    fn overlong_remark_is_rejected() {
        let ledger = test_ledger();
        let mut request = donation(1, "5.00");
        request.remark = Some("x".repeat(MAX_REMARK_CHARS + 1));
        let err = ledger.append_donation(request).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Validation { field: "remark", .. }
        ));
    }

    #[test]
    fn appends_produce_a_gapless_valid_chain() {
        let ledger = test_ledger();
        for i in 0..4 {
            ledger.append_donation(donation(i, "1.00")).unwrap();
        }
        let blocks = ledger.store().all_blocks().unwrap();
        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![0, 1, 2, 3, 4]);
        assert_eq!(ledger.validate().unwrap(), None);
    }

    #[test]
    fn append_retries_through_a_transient_conflict() {
        let ledger = test_ledger();
        ledger.ensure_genesis().unwrap();
        ledger.store().force_conflicts(1);
        let (block, _) = ledger.append_donation(donation(1, "2.00")).unwrap();
        assert_eq!(block.height, 1);
    }

    #[test]
    fn append_surfaces_conflict_after_exhausting_retries() {
        let ledger = test_ledger();
        ledger.ensure_genesis().unwrap();
        ledger.store().force_conflicts(MAX_APPEND_ATTEMPTS);
        let err = ledger.append_donation(donation(1, "2.00")).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Conflict {
                attempts: MAX_APPEND_ATTEMPTS
            }
        ));
        assert_eq!(ledger.chain_info().unwrap().block_count, 1);
    }

    #[test]
    fn duplicate_external_id_replays_the_committed_pair() {
        let ledger = test_ledger();
        let mut request = donation(3, "9.99");
        request.external_donate_id = Some(42);
        let (block, tx) = ledger.append_donation(request.clone()).unwrap();
        let (replay_block, replay_tx) = ledger.append_donation(request).unwrap();

        assert_eq!(replay_tx.id, tx.id);
        assert_eq!(replay_block, block);
        assert_eq!(ledger.chain_info().unwrap().block_count, 2);
    }

    #[test]
    fn transaction_lookup_by_external_id() {
        let ledger = test_ledger();
        let mut request = donation(3, "9.99");
        request.external_donate_id = Some(42);
        let (_, tx) = ledger.append_donation(request).unwrap();

        let found = ledger.transaction_by_external_id(42).unwrap().unwrap();
        assert_eq!(found.id, tx.id);
        assert_eq!(ledger.transaction_by_external_id(43).unwrap(), None);
    }

    #[test]
    fn paged_blocks_are_newest_first_and_clamped() {
        let ledger = test_ledger();
        for i in 0..5 {
            ledger.append_donation(donation(i, "1.00")).unwrap();
        }
        let page = ledger.blocks_paged(0, 3).unwrap();
        assert_eq!(page.total, 6);
        let heights: Vec<u64> = page.items.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![5, 4, 3]);

        let clamped = ledger.blocks_paged(0, 0).unwrap();
        assert_eq!(clamped.limit, 1);
        assert_eq!(clamped.items.len(), 1);
        let capped = ledger.blocks_paged(0, 10_000).unwrap();
        assert_eq!(capped.limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn block_detail_reports_transactions_or_none() {
        let ledger = test_ledger();
        let (block, tx) = ledger.append_donation(donation(8, "4.20")).unwrap();
        let detail = ledger.block_detail(block.height).unwrap().unwrap();
        assert_eq!(detail.tx_count, 1);
        assert_eq!(detail.transactions[0].id, tx.id);
        assert_eq!(detail.total_amount, tx.amount);
        assert_eq!(ledger.block_detail(99).unwrap(), None);
    }
}
