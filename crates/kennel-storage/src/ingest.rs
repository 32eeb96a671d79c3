//! Single-pass upload ingest.
//!
//! An upload arrives as a stream whose FID is only known once the last byte
//! has been seen. [`Ingest`] tees every chunk into three sinks at once:
//!
//! - a part file under `.incoming/`,
//! - a [`ContentHasher`] producing the FID,
//! - a [`TreeBuilder`] producing the Merkle tree.
//!
//! [`Ingest::finish`] yields an [`Ingested`] that is moved into the archive
//! with [`Ingested::commit`]. Dropping either value before commit removes the
//! part file. A [`Committed`] reports whether this upload placed the file or
//! found identical bytes already stored.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use kennel_crypto::hashing::ContentHasher;
use kennel_crypto::{MerkleTree, TreeBuilder};
use kennel_types::Fid;

use crate::archive::FileArchive;
use crate::{Result, StorageError};

/// Removes the part file unless disarmed.
struct PartGuard {
    path: PathBuf,
    armed: bool,
}

impl PartGuard {
    fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove part file");
                }
            }
        }
    }
}

/// In-progress upload.
pub struct Ingest {
    out: BufWriter<File>,
    hasher: ContentHasher,
    tree: TreeBuilder,
    max_size: u64,
    guard: PartGuard,
}

impl Ingest {
    pub(crate) fn create(path: PathBuf, block_size: usize, max_size: u64) -> Result<Self> {
        let tree = TreeBuilder::new(block_size)?;
        let file = File::create(&path)?;
        Ok(Self {
            out: BufWriter::new(file),
            hasher: ContentHasher::new(),
            tree,
            max_size,
            guard: PartGuard { path, armed: true },
        })
    }

    /// Bytes received so far.
    pub fn len(&self) -> u64 {
        self.hasher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hasher.is_empty()
    }

    /// Path of the part file.
    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    /// Feed the next chunk of the upload.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.hasher.len() + chunk.len() as u64 > self.max_size {
            return Err(StorageError::TooLarge {
                limit: self.max_size,
            });
        }
        self.out.write_all(chunk)?;
        self.hasher.update(chunk);
        self.tree.update(chunk);
        Ok(())
    }

    /// Flush the part file and derive the FID and tree.
    pub fn finish(self) -> Result<Ingested> {
        if self.hasher.is_empty() {
            return Err(StorageError::Empty);
        }
        let Self {
            out,
            hasher,
            tree,
            guard,
            ..
        } = self;

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let size = hasher.len();
        let fid = Fid::from_digest(&hasher.finalize())?;
        let tree = tree.finish()?;
        Ok(Ingested {
            fid,
            size,
            tree,
            guard,
        })
    }
}

/// Result of [`Ingested::commit`].
#[derive(Debug)]
pub struct Committed {
    pub fid: Fid,
    pub tree: MerkleTree,
    /// This commit moved its bytes into place. False when the archive
    /// already held the FID.
    pub placed: bool,
}

/// A fully received upload awaiting commit.
pub struct Ingested {
    fid: Fid,
    size: u64,
    tree: MerkleTree,
    guard: PartGuard,
}

impl Ingested {
    pub fn fid(&self) -> &Fid {
        &self.fid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Move the part file into the archive under its FID and write the tree.
    ///
    /// If the archive already holds this FID the received copy is discarded;
    /// identical bytes hash to the same FID.
    pub fn commit(self, archive: &FileArchive) -> Result<Committed> {
        let layout = archive.layout();
        fs::create_dir_all(layout.fid_dir(&self.fid))?;

        let target = layout.file_path(&self.fid);
        let placed = !target.exists();
        if !placed {
            tracing::debug!(fid = %self.fid, "file already stored, discarding upload copy");
            // Guard drop removes the part file.
            drop(self.guard);
        } else {
            let part = self.guard.disarm();
            if let Err(e) = fs::rename(&part, &target) {
                let _ = fs::remove_file(&part);
                return Err(e.into());
            }
        }

        if !layout.tree_path(&self.fid).exists() {
            archive.write_tree(&self.fid, &self.tree)?;
        }
        tracing::info!(fid = %self.fid, size = self.size, placed, "committed file");
        Ok(Committed {
            fid: self.fid,
            tree: self.tree,
            placed,
        })
    }
}
