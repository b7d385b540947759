use thiserror::Error;

/// Failures surfaced by the ledger service.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The request was malformed; nothing was mined or written.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Every append attempt lost the height race to another writer.
    #[error("append conflicted with a concurrent writer after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Conflict signals a store raises from inside an atomic append. Carried
/// through `anyhow` and recovered by downcast.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("height {0} is already occupied")]
    HeightOccupied(u64),

    #[error("external donation id {0} is already recorded")]
    DuplicateExternalId(u64),
}
