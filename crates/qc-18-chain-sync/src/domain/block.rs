//! Block and transaction entities as seen by the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::rounds::slot_number;

/// Block identifier as advertised on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex-encoded public key of a delegate or transaction sender.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub String);

impl PublicKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A transaction carried by a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub version: u8,
    pub sender_public_key: PublicKey,
    /// Sender nonce, present from version 2 onwards.
    pub nonce: Option<u64>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: TransactionId::new(id),
            version: 1,
            sender_public_key: PublicKey::new(sender),
            nonce: None,
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.version = 2;
        self.nonce = Some(nonce);
        self
    }
}

/// Block header fields used for linkage, scheduling and identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub id: BlockId,
    pub version: u8,
    pub height: u64,
    pub previous_block: BlockId,
    /// Seconds since the network epoch.
    pub timestamp: u64,
    pub generator_public_key: PublicKey,
    pub payload_hash: String,
    pub number_of_transactions: usize,
}

impl BlockHeader {
    pub fn slot(&self, block_time: u64) -> u64 {
        slot_number(self.timestamp, block_time)
    }
}

/// Result of the (external) cryptographic verification of a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVerification {
    pub verified: bool,
    pub contains_multi_signatures: bool,
    pub errors: Vec<String>,
}

impl BlockVerification {
    pub fn verified() -> Self {
        Self {
            verified: true,
            ..Default::default()
        }
    }
}

/// A block travelling through the sync engine. Never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub verification: BlockVerification,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            verification: BlockVerification::verified(),
        }
    }

    pub fn with_verification(mut self, verification: BlockVerification) -> Self {
        self.verification = verification;
        self
    }

    pub fn id(&self) -> &BlockId {
        &self.header.id
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn generator(&self) -> &PublicKey {
        &self.header.generator_public_key
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(|tx| tx.id.clone()).collect()
    }
}

/// Whether `next` extends `previous`: matching parent id, next height, later slot.
pub fn is_block_chained(previous: &BlockHeader, next: &BlockHeader, block_time: u64) -> bool {
    next.previous_block == previous.id
        && next.height == previous.height + 1
        && next.slot(block_time) > previous.slot(block_time)
}
