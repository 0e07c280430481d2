//! # Quantum-Chain Test Suite
//!
//! Integration flows and benchmarks for the chain sync subsystem.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── sync_benchmarks.rs   # Fork detection, network status, block queue
//! └── src/
//!     └── integration/         # Whole-engine flows over in-memory ports
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p qc-tests
//!
//! # With engine logs
//! RUST_LOG=qc_18_chain_sync=debug cargo test -p qc-tests -- --nocapture
//!
//! # Benchmarks
//! cargo bench -p qc-tests
//! ```

#![allow(dead_code)]

pub mod integration;

/// Route engine logs to the test harness. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .with_test_writer()
        .try_init();
}
