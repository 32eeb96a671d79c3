//! Path factory for the on-disk archive.
//!
//! ```text
//! <home>/storage/
//!   .incoming/<random>.part   uploads in flight
//!   <fid>/
//!     <fid>.jkl               file bytes (current layout)
//!     <fid>.tree              exported Merkle tree
//!     tmp-<fid>.jkl           legacy glue in progress
//!     0.jkl, 1.jkl, ...       legacy per-block files
//! ```

use std::path::{Path, PathBuf};

use kennel_types::Fid;

use crate::Result;

/// File extension of stored bytes.
pub const FILE_EXT: &str = "jkl";

/// File extension of exported trees.
pub const TREE_EXT: &str = "tree";

/// Directory holding partially received uploads.
pub const INCOMING_DIR: &str = ".incoming";

/// Maps file identifiers to paths under `<home>/storage`.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `<home>/storage`.
    pub fn new(home: impl AsRef<Path>) -> Self {
        Self {
            root: home.as_ref().join("storage"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fid_dir(&self, fid: &Fid) -> PathBuf {
        self.root.join(fid.as_str())
    }

    /// `<fid>/<fid>.jkl`
    pub fn file_path(&self, fid: &Fid) -> PathBuf {
        self.fid_dir(fid).join(format!("{fid}.{FILE_EXT}"))
    }

    /// `<fid>/<fid>.tree`
    pub fn tree_path(&self, fid: &Fid) -> PathBuf {
        self.fid_dir(fid).join(format!("{fid}.{TREE_EXT}"))
    }

    /// `<fid>/<index>.jkl`
    pub fn legacy_block_path(&self, fid: &Fid, index: u64) -> PathBuf {
        self.fid_dir(fid).join(format!("{index}.{FILE_EXT}"))
    }

    /// `<fid>/tmp-<fid>.jkl`
    pub fn glue_path(&self, fid: &Fid) -> PathBuf {
        self.fid_dir(fid).join(format!("tmp-{fid}.{FILE_EXT}"))
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join(INCOMING_DIR)
    }

    /// Whether `fid` exists only in the legacy per-block layout.
    pub fn is_legacy(&self, fid: &Fid) -> bool {
        !self.file_path(fid).exists() && self.legacy_block_path(fid, 0).exists()
    }

    /// FIDs of every file directory in the archive.
    ///
    /// Directory names that are not valid FIDs are skipped.
    pub fn list_fids(&self) -> Result<Vec<Fid>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut fids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(fid) = Fid::parse(name) {
                    fids.push(fid);
                }
            }
        }
        fids.sort();
        Ok(fids)
    }
}
