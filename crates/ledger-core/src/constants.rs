pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// Leading zero hex characters a block hash must carry.
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Canonical content of the genesis block; hashed like any other payload.
pub const GENESIS_CONTENT: &str = r#"{"kind":"genesis"}"#;

/// Append attempts before a conflict is surfaced to the caller.
pub const MAX_APPEND_ATTEMPTS: u32 = 3;

pub const MAX_PAGE_LIMIT: u64 = 100;
pub const MAX_REMARK_CHARS: usize = 500;
