//! sled-backed persistence for the donation ledger. [`SledStore`]
//! implements the core's `ChainState` trait.

pub mod sled_store;

pub use sled_store::SledStore;
