//! Read-only projections of on-chain contract state.

use serde::{Deserialize, Serialize};

use crate::{Cid, Fid};

/// An active storage deal as reported by the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    /// Contract identifier.
    pub cid: Cid,
    /// File backing the contract.
    pub fid: Fid,
    /// Address of the provider the deal is assigned to.
    pub provider: String,
    /// Hex-encoded Merkle root committed at contract creation.
    pub merkle_root: String,
    /// Index of the block the chain currently challenges, as a decimal string.
    pub block_to_prove: String,
    /// Whether the current challenge has already been answered.
    pub proof_verified: bool,
    /// Chain height at which the deal started.
    pub start_block: u64,
}

impl Deal {
    /// Parse [`Deal::block_to_prove`] as a block index.
    pub fn challenge_index(&self) -> Option<u64> {
        self.block_to_prove.trim().parse().ok()
    }
}

/// An unassigned contract that any provider may adopt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stray {
    /// Contract identifier.
    pub cid: Cid,
    /// File backing the contract.
    pub fid: Fid,
    /// Account owning the contract.
    pub signee: String,
    /// Declared file size in bytes.
    pub file_size: u64,
    /// Hex-encoded Merkle root committed at contract creation. Empty when unknown.
    #[serde(default)]
    pub merkle_root: String,
    /// Base URL of a peer provider that still serves the file.
    pub peer_url: String,
}
