//! # kennel-storage
//!
//! Content-addressed file archive for the kennel storage provider.
//!
//! Every stored file lives in its own directory under `<home>/storage/<fid>/`
//! together with its exported Merkle tree. Older providers wrote files as
//! numbered per-block files without a tree; those are read transparently and
//! glued into the current layout on first full read.
//!
//! ## Modules
//!
//! - [`layout`] — FID to on-disk path mapping, current and legacy layouts.
//! - [`archive`] — Writes, block reads, legacy gluing, tree retrieval.
//! - [`ingest`] — Single-pass tee of an upload stream into file, FID hash and tree.

pub mod archive;
pub mod ingest;
pub mod layout;

pub use archive::FileArchive;
pub use ingest::{Committed, Ingest, Ingested};
pub use layout::Layout;

/// Error types for archive operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not held locally.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Legacy blocks of this file are being glued by another caller.
    #[error("file busy: {0}")]
    Busy(String),

    /// Requested block lies beyond the end of the file.
    #[error("block {index} out of range for {fid}")]
    BlockOutOfRange { fid: String, index: u64 },

    /// Upload exceeded the configured size limit.
    #[error("file exceeds maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    /// Uploaded content was empty.
    #[error("file is empty")]
    Empty,

    /// Tree build, export or import failed.
    #[error("merkle error: {0}")]
    Merkle(#[from] kennel_crypto::CryptoError),

    /// Content hash could not be encoded as an identifier.
    #[error("identifier error: {0}")]
    Identifier(#[from] kennel_types::TypesError),
}

/// Convenience result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
