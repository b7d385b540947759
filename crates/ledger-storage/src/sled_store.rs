use anyhow::{anyhow, Context, Result};
use ledger_core::ledger::ChainState;
use ledger_core::{Block, ChainAggregate, ChainTransaction, StateError};
use rust_decimal::Decimal;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::info;

const TREE_BLOCKS: &str = "blocks";
const TREE_TXS: &str = "txs";
const TREE_TX_EXTERNAL: &str = "tx_external";

/// sled-backed chain state. Blocks are keyed by big-endian height,
/// transactions by height plus index, and the external-id tree maps a
/// business donation id to its transaction key. Appends run as one
/// multi-tree transaction, so a block never lands without its
/// transactions or index entries.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    blocks: Tree,
    txs: Tree,
    tx_external: Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let blocks = db.open_tree(TREE_BLOCKS)?;
        let txs = db.open_tree(TREE_TXS)?;
        let tx_external = db.open_tree(TREE_TX_EXTERNAL)?;
        info!("sled store opened");
        Ok(Self {
            db,
            blocks,
            txs,
            tx_external,
        })
    }

    fn block_key(height: u64) -> [u8; 8] {
        height.to_be_bytes()
    }

    fn tx_key(height: u64, tx_index: u32) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&height.to_be_bytes());
        key[8..].copy_from_slice(&tx_index.to_be_bytes());
        key
    }

    fn decode_block(bytes: &[u8]) -> Result<Block> {
        bincode::deserialize(bytes).context("corrupt block record")
    }

    fn decode_tx(bytes: &[u8]) -> Result<ChainTransaction> {
        bincode::deserialize(bytes).context("corrupt transaction record")
    }
}

impl ChainState for SledStore {
    fn append_block(&self, block: &Block, txs: &[ChainTransaction]) -> Result<()> {
        let block_key = Self::block_key(block.height);
        let block_bytes = bincode::serialize(block)?;
        let mut tx_rows = Vec::with_capacity(txs.len());
        for tx in txs {
            tx_rows.push((
                Self::tx_key(block.height, tx.tx_index),
                bincode::serialize(tx)?,
                tx.external_donate_id,
            ));
        }

        let result = (&self.blocks, &self.txs, &self.tx_external).transaction(
            |(blocks, tx_tree, external)| {
                if blocks.get(block_key)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StateError::HeightOccupied(block.height),
                    ));
                }
                blocks.insert(&block_key[..], block_bytes.clone())?;
                for (key, bytes, external_id) in &tx_rows {
                    tx_tree.insert(&key[..], bytes.clone())?;
                    if let Some(id) = external_id {
                        let id_key = id.to_be_bytes();
                        if external.get(id_key)?.is_some() {
                            return Err(ConflictableTransactionError::Abort(
                                StateError::DuplicateExternalId(*id),
                            ));
                        }
                        external.insert(&id_key[..], &key[..])?;
                    }
                }
                Ok(())
            },
        );
        match result {
            Ok(()) => {
                self.db.flush()?;
                Ok(())
            }
            Err(TransactionError::Abort(state)) => Err(anyhow::Error::new(state)),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn latest_block(&self) -> Result<Option<Block>> {
        match self.blocks.last()? {
            Some((_, bytes)) => Ok(Some(Self::decode_block(&bytes)?)),
            None => Ok(None),
        }
    }

    fn block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.blocks.get(Self::block_key(height))? {
            Some(bytes) => Ok(Some(Self::decode_block(&bytes)?)),
            None => Ok(None),
        }
    }

    fn transactions_for_block(&self, height: u64) -> Result<Vec<ChainTransaction>> {
        let mut txs = Vec::new();
        for entry in self.txs.scan_prefix(Self::block_key(height)) {
            let (_, bytes) = entry?;
            txs.push(Self::decode_tx(&bytes)?);
        }
        Ok(txs)
    }

    fn blocks_paged(&self, offset: u64, limit: u64) -> Result<(u64, Vec<Block>)> {
        let total = self.blocks.len() as u64;
        let mut page = Vec::new();
        for entry in self
            .blocks
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
        {
            let (_, bytes) = entry?;
            page.push(Self::decode_block(&bytes)?);
        }
        Ok((total, page))
    }

    fn all_blocks(&self) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        for entry in self.blocks.iter() {
            let (_, bytes) = entry?;
            blocks.push(Self::decode_block(&bytes)?);
        }
        Ok(blocks)
    }

    fn aggregate(&self) -> Result<ChainAggregate> {
        let block_count = self.blocks.len() as u64;
        let mut tx_count = 0u64;
        let mut total_amount = Decimal::ZERO;
        for entry in self.txs.iter() {
            let (_, bytes) = entry?;
            let tx = Self::decode_tx(&bytes)?;
            tx_count += 1;
            total_amount += tx.amount;
        }
        Ok(ChainAggregate {
            block_count,
            tx_count,
            total_amount,
        })
    }

    fn transaction_by_external_id(&self, id: u64) -> Result<Option<ChainTransaction>> {
        let Some(tx_key) = self.tx_external.get(id.to_be_bytes())? else {
            return Ok(None);
        };
        let bytes = self
            .txs
            .get(&tx_key)?
            .ok_or_else(|| anyhow!("external id {id} points at a missing transaction"))?;
        Ok(Some(Self::decode_tx(&bytes)?))
    }

    fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
