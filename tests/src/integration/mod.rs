//! # Integration Tests
//!
//! Drive a complete [`qc_18_chain_sync::ChainSyncService`] through its public
//! API, wired to the in-memory ports from `test_utils`.

pub mod sync_flows;
