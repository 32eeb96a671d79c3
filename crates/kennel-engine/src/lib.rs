//! # kennel-engine
//!
//! The provider's storage and proof engine.
//!
//! All components share one [`Context`]: the provider address, the file
//! archive, the contract index, the chain port and the upload queue. The
//! proof loop and the stray claimer run as independent tasks and talk to
//! each other only through the index and the queue.
//!
//! ## Modules
//!
//! - [`context`] — Shared handles, in-flight FID pins and blocking-I/O helper.
//! - [`intake`] — Batched part-file writes for streamed bodies.
//! - [`upload`] — Upload acceptance and attestations.
//! - [`proofs`] — Periodic proof-of-storage loop with miss tracking and eviction.
//! - [`strays`] — Stray contract claimer and peer fetcher.
//! - [`prune`] — Startup removal of unreferenced files.

pub mod context;
pub mod intake;
pub mod proofs;
pub mod prune;
pub mod strays;
pub mod upload;

pub use context::{Context, FidPin, SharedDb};
pub use intake::Intake;
pub use proofs::{CycleReport, Outcome, ProofConfig, ProofLoop};
pub use prune::{prune_orphans, PruneReport};
pub use strays::{HttpFetcher, PeerFetcher, StrayClaimer, StrayConfig};
pub use upload::UploadReceipt;

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] kennel_storage::StorageError),

    #[error("database error: {0}")]
    Db(#[from] kennel_db::DbError),

    #[error("chain error: {0}")]
    Chain(#[from] kennel_chain::ChainError),

    #[error("queue error: {0}")]
    Queue(#[from] kennel_queue::QueueError),

    #[error("merkle error: {0}")]
    Merkle(#[from] kennel_crypto::CryptoError),

    #[error("identifier error: {0}")]
    Identifier(#[from] kennel_types::TypesError),

    /// Peer could not deliver the file.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Received bytes do not hash to the expected FID.
    #[error("fid mismatch: expected {expected}, got {actual}")]
    FidMismatch { expected: String, actual: String },

    /// Rebuilt tree does not match the advertised root.
    #[error("merkle root mismatch for {fid}: expected {expected}, got {actual}")]
    RootMismatch {
        fid: String,
        expected: String,
        actual: String,
    },

    /// Generated proof failed verification against the stored root.
    #[error("proof for block {index} of {fid} does not verify")]
    BadProof { fid: String, index: u64 },

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
