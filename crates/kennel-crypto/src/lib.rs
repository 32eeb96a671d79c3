//! # kennel-crypto
//!
//! Hashing and Merkle primitives for the kennel storage provider.
//!
//! The hash suite is fixed by on-chain verification: leaf digests are
//! SHA-256, tree nodes are SHA3-512. Roots must be byte-identical to what
//! the chain recomputes, so nothing here is configurable except the block
//! size used to cut a file into leaves.
//!
//! ## Modules
//!
//! - [`hashing`] — SHA-256 / SHA3-512 helpers and the canonical leaf digest.
//! - [`merkle`] — Tree construction, export/import, proof generation and verification.

pub mod hashing;
pub mod merkle;

pub use merkle::{MerkleProof, MerkleTree, TreeBuilder};

/// Error types for hashing and Merkle operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A tree needs at least one block of data.
    #[error("merkle tree must contain at least one leaf")]
    EmptyTree,

    /// The requested leaf is not part of the tree.
    #[error("leaf not found in merkle tree")]
    LeafNotFound,

    /// Leaf index beyond the tree width.
    #[error("leaf index {index} out of range for {width} leaves")]
    IndexOutOfRange { index: u64, width: u64 },

    /// Block size of zero.
    #[error("block size must be non-zero")]
    InvalidBlockSize,

    /// Exported tree bytes could not be decoded.
    #[error("invalid exported tree: {0}")]
    InvalidExport(String),

    /// Reading the input stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
