//! # kennel-types
//!
//! Shared domain types for the kennel storage provider.
//!
//! Identifiers ([`Fid`], [`Cid`]) are bech32 strings over SHA-256 digests.
//! On-chain state is read through the [`Deal`] and [`Stray`] projections,
//! and everything the provider sends to the chain is a [`ChainMsg`].
//!
//! ## Modules
//!
//! - [`ids`] — File and contract identifiers.
//! - [`deal`] — Read-only projections of on-chain contracts.
//! - [`message`] — Chain message sum type and transaction responses.

pub mod deal;
pub mod ids;
pub mod message;

pub use deal::{Deal, Stray};
pub use ids::{Cid, Fid};
pub use message::{ChainMsg, TxResponse};

/// Bech32 human-readable prefix of file identifiers.
pub const FID_PREFIX: &str = "jklf";

/// Bech32 human-readable prefix of contract identifiers.
pub const CID_PREFIX: &str = "jklc";

/// Default block size in bytes used for Merkle leaves and proofs.
pub const DEFAULT_BLOCK_SIZE: usize = 10_240;

/// Default proof cycle interval in seconds.
pub const DEFAULT_PROOF_INTERVAL_SECS: u64 = 32;

/// Default number of consecutive misses tolerated before eviction.
pub const DEFAULT_MAX_MISSES: u32 = 16;

/// Default number of stray worker slots.
pub const DEFAULT_STRAY_THREADS: usize = 3;

/// Default stray polling interval in seconds.
pub const DEFAULT_STRAY_INTERVAL_SECS: u64 = 20;

/// Default cap on aggregated wire bytes for one submitted transaction.
pub const DEFAULT_MESSAGE_SIZE: usize = 500_000;

/// Default queue flush interval in seconds.
pub const DEFAULT_QUEUE_INTERVAL_SECS: u64 = 4;

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 3333;

/// Default maximum accepted upload size (32 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 32 * 1024 * 1024 * 1024;

/// Errors raised while parsing or deriving identifiers.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// The string is not valid bech32.
    #[error("invalid bech32 identifier: {0}")]
    Bech32(String),

    /// The bech32 prefix does not match the expected kind.
    #[error("wrong identifier prefix: expected {expected}, got {actual}")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The decoded payload is not a 32-byte digest.
    #[error("identifier payload must be 32 bytes, got {0}")]
    DigestLength(usize),
}

/// Convenience result type for identifier operations.
pub type Result<T> = std::result::Result<T, TypesError>;
