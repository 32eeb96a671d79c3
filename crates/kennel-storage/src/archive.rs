//! File archive: persisted bytes and Merkle trees keyed by FID.
//!
//! ## Legacy gluing
//!
//! A FID stored in the legacy layout has numbered block files and no tree.
//! The first [`FileArchive::retrieve_file`] on such a FID concatenates the
//! blocks into `tmp-<fid>.jkl`, renames it to `<fid>.jkl` and removes the
//! block files. The temporary file doubles as a lock: a second caller that
//! finds it fails with [`StorageError::Busy`] until the first one finishes.
//! A glue file older than [`STALE_GLUE_SECS`] is assumed to belong to a
//! crashed run and is discarded.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use kennel_crypto::MerkleTree;
use kennel_types::Fid;

use crate::ingest::Ingest;
use crate::layout::Layout;
use crate::{Result, StorageError};

/// Age after which an abandoned glue file is removed.
pub const STALE_GLUE_SECS: u64 = 600;

/// Local archive of stored files.
#[derive(Clone, Debug)]
pub struct FileArchive {
    layout: Layout,
    block_size: usize,
}

impl FileArchive {
    /// Open the archive under `<home>/storage`, creating it if missing.
    ///
    /// `block_size` is used when a tree has to be rebuilt from file bytes.
    pub fn open(home: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let layout = Layout::new(home);
        fs::create_dir_all(layout.root())?;
        Ok(Self { layout, block_size })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether any form of `fid` (current or legacy) is stored.
    pub fn contains(&self, fid: &Fid) -> bool {
        self.layout.file_path(fid).exists() || self.layout.legacy_block_path(fid, 0).exists()
    }

    /// Write the full contents of `reader` as the bytes of `fid`.
    ///
    /// The directory is created if needed. Bytes land in a temporary file
    /// first and are renamed into place, so readers never observe a partial
    /// `<fid>.jkl`.
    pub fn write_file<R: Read>(&self, mut reader: R, fid: &Fid) -> Result<u64> {
        let dir = self.layout.fid_dir(fid);
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!(".{}.{}", fid, random_suffix()));
        let written = (|| -> io::Result<u64> {
            let mut file = File::create(&tmp)?;
            let n = io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
            fs::rename(&tmp, self.layout.file_path(fid))?;
            Ok(n)
        })();

        match written {
            Ok(n) => {
                tracing::debug!(%fid, bytes = n, "wrote file");
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e.into())
            }
        }
    }

    /// Export `tree` into `<fid>.tree`.
    pub fn write_tree(&self, fid: &Fid, tree: &MerkleTree) -> Result<()> {
        let bytes = tree.export()?;
        fs::create_dir_all(self.layout.fid_dir(fid))?;
        fs::write(self.layout.tree_path(fid), bytes)?;
        Ok(())
    }

    /// Read block `index` of `fid`.
    ///
    /// A legacy block file is returned whole. Otherwise up to `block_size`
    /// bytes are read at `index * block_size`; the final block may be short.
    pub fn get_block(&self, fid: &Fid, index: u64, block_size: usize) -> Result<Vec<u8>> {
        match fs::read(self.layout.legacy_block_path(fid, index)) {
            Ok(block) if !block.is_empty() => return Ok(block),
            Ok(_) => {
                return Err(StorageError::BlockOutOfRange {
                    fid: fid.to_string(),
                    index,
                })
            }
            // Missing legacy block, or removed by a concurrent glue.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut file = self.open_current(fid)?;
        let offset = index
            .checked_mul(block_size as u64)
            .ok_or(StorageError::BlockOutOfRange {
                fid: fid.to_string(),
                index,
            })?;
        file.seek(SeekFrom::Start(offset))?;

        let mut block = Vec::with_capacity(block_size);
        file.take(block_size as u64).read_to_end(&mut block)?;
        if block.is_empty() {
            return Err(StorageError::BlockOutOfRange {
                fid: fid.to_string(),
                index,
            });
        }
        Ok(block)
    }

    /// Open `fid` for sequential reading, gluing legacy blocks first if needed.
    pub fn retrieve_file(&self, fid: &Fid) -> Result<File> {
        match self.open_current(fid) {
            Err(StorageError::NotFound(_)) if self.layout.is_legacy(fid) => {
                self.glue(fid)?;
                self.open_current(fid)
            }
            other => other,
        }
    }

    /// Size in bytes of the stored file.
    pub fn file_size(&self, fid: &Fid) -> Result<u64> {
        Ok(self.retrieve_file(fid)?.metadata()?.len())
    }

    /// Load the tree of `fid`, rebuilding and persisting it when absent.
    pub fn retrieve_tree(&self, fid: &Fid) -> Result<MerkleTree> {
        match fs::read(self.layout.tree_path(fid)) {
            Ok(bytes) => return Ok(MerkleTree::import(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = self.retrieve_file(fid)?;
        let size = file.metadata()?.len();
        let tree = MerkleTree::build(io::BufReader::new(file), size, self.block_size)?;
        self.write_tree(fid, &tree)?;
        tracing::info!(%fid, root = %tree.root_hex(), "rebuilt missing merkle tree");
        Ok(tree)
    }

    /// Remove the directory of `fid` and everything in it.
    ///
    /// Callers must first make sure no contract still references `fid`.
    pub fn delete(&self, fid: &Fid) -> Result<()> {
        match fs::remove_dir_all(self.layout.fid_dir(fid)) {
            Ok(()) => {
                tracing::info!(%fid, "deleted file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Start a single-pass ingest of a stream of unknown FID.
    pub fn begin_ingest(&self, max_size: u64) -> Result<Ingest> {
        let dir = self.layout.incoming_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.part", random_suffix()));
        Ingest::create(path, self.block_size, max_size)
    }

    /// Remove leftover partial uploads. Returns how many were removed.
    pub fn clean_incoming(&self) -> Result<usize> {
        let entries = match fs::read_dir(self.layout.incoming_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn open_current(&self, fid: &Fid) -> Result<File> {
        match File::open(self.layout.file_path(fid)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(fid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn glue(&self, fid: &Fid) -> Result<()> {
        let tmp_path = self.layout.glue_path(fid);
        let mut tmp = match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_stale(&tmp_path) {
                    return Err(StorageError::Busy(fid.to_string()));
                }
                tracing::warn!(%fid, "removing stale glue file");
                fs::remove_file(&tmp_path)?;
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&tmp_path)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::AlreadyExists => StorageError::Busy(fid.to_string()),
                        _ => e.into(),
                    })?
            }
            Err(e) => return Err(e.into()),
        };

        let glued = (|| -> io::Result<u64> {
            let mut blocks = 0;
            loop {
                let mut block = match File::open(self.layout.legacy_block_path(fid, blocks)) {
                    Ok(block) => block,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                    Err(e) => return Err(e),
                };
                io::copy(&mut block, &mut tmp)?;
                blocks += 1;
            }
            tmp.flush()?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, self.layout.file_path(fid))?;
            Ok(blocks)
        })();

        let blocks = match glued {
            Ok(blocks) => blocks,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };

        for index in 0..blocks {
            if let Err(e) = fs::remove_file(self.layout.legacy_block_path(fid, index)) {
                tracing::warn!(%fid, index, error = %e, "failed to remove legacy block");
            }
        }
        tracing::info!(%fid, blocks, "glued legacy blocks");
        Ok(())
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > Duration::from_secs(STALE_GLUE_SECS))
}

pub(crate) fn random_suffix() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kennel_crypto::hashing::leaf_digest;
    use kennel_crypto::merkle;
    use tempfile::TempDir;

    const HELLO: &[u8] = b"hello, world\n";

    fn archive(block_size: usize) -> (TempDir, FileArchive) {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = FileArchive::open(dir.path(), block_size).expect("open");
        (dir, archive)
    }

    fn read_all(archive: &FileArchive, fid: &Fid) -> Vec<u8> {
        let mut out = Vec::new();
        archive
            .retrieve_file(fid)
            .expect("retrieve")
            .read_to_end(&mut out)
            .expect("read");
        out
    }

    fn write_legacy(archive: &FileArchive, fid: &Fid, blocks: &[&[u8]]) {
        fs::create_dir_all(archive.layout().fid_dir(fid)).expect("mkdir");
        for (i, block) in blocks.iter().enumerate() {
            fs::write(archive.layout().legacy_block_path(fid, i as u64), block).expect("write");
        }
    }

    #[test]
    fn test_write_and_retrieve_roundtrip() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        let n = archive.write_file(HELLO, &fid).expect("write");
        assert_eq!(n, 13);
        assert!(archive.contains(&fid));
        assert_eq!(read_all(&archive, &fid), HELLO);
        assert_eq!(archive.file_size(&fid).expect("size"), 13);
    }

    #[test]
    fn test_get_block_offsets_and_short_tail() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        archive.write_file(HELLO, &fid).expect("write");

        assert_eq!(archive.get_block(&fid, 0, 5).expect("block"), b"hello");
        assert_eq!(archive.get_block(&fid, 1, 5).expect("block"), b", wor");
        assert_eq!(archive.get_block(&fid, 2, 5).expect("block"), b"ld\n");
        assert!(matches!(
            archive.get_block(&fid, 3, 5),
            Err(StorageError::BlockOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn test_get_block_missing_file() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(b"absent").expect("fid");
        assert!(matches!(
            archive.get_block(&fid, 0, 5),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            archive.retrieve_file(&fid),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_legacy_block_read_prefers_block_file() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        write_legacy(&archive, &fid, &[b"hello", b", world\n"]);
        assert_eq!(archive.get_block(&fid, 1, 5).expect("block"), b", world\n");
    }

    #[test]
    fn test_glue_migrates_legacy_layout() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        write_legacy(&archive, &fid, &[b"hello", b", world\n"]);

        assert_eq!(read_all(&archive, &fid), HELLO);
        let layout = archive.layout();
        assert!(layout.file_path(&fid).exists());
        assert!(!layout.glue_path(&fid).exists());
        assert!(!layout.legacy_block_path(&fid, 0).exists());
        let on_disk = fs::read(layout.file_path(&fid)).expect("read");
        assert_eq!(Fid::for_bytes(&on_disk).expect("fid"), fid);

        // Idempotent once migrated.
        assert_eq!(read_all(&archive, &fid), HELLO);
    }

    #[test]
    fn test_glue_in_progress_is_busy() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        write_legacy(&archive, &fid, &[b"hello", b", world\n"]);
        fs::write(archive.layout().glue_path(&fid), b"hel").expect("write");

        assert!(matches!(
            archive.retrieve_file(&fid),
            Err(StorageError::Busy(_))
        ));

        fs::remove_file(archive.layout().glue_path(&fid)).expect("remove");
        assert_eq!(read_all(&archive, &fid), HELLO);
    }

    #[test]
    fn test_tree_written_and_rebuilt() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        archive.write_file(HELLO, &fid).expect("write");
        let tree = MerkleTree::build(HELLO, 13, 5).expect("tree");
        archive.write_tree(&fid, &tree).expect("write tree");
        assert_eq!(archive.retrieve_tree(&fid).expect("tree"), tree);

        fs::remove_file(archive.layout().tree_path(&fid)).expect("remove");
        assert_eq!(archive.retrieve_tree(&fid).expect("rebuilt"), tree);
        assert!(archive.layout().tree_path(&fid).exists());
    }

    #[test]
    fn test_legacy_tree_rebuilt_after_glue() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        write_legacy(&archive, &fid, &[b"hello", b", wor", b"ld\n"]);

        let tree = archive.retrieve_tree(&fid).expect("tree");
        let digest = leaf_digest(2, b"ld\n");
        let proof = tree.generate_proof(&digest).expect("proof");
        assert!(merkle::verify(&digest, &proof, tree.root()));
    }

    #[test]
    fn test_delete_removes_directory() {
        let (_dir, archive) = archive(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        archive.write_file(HELLO, &fid).expect("write");
        archive.delete(&fid).expect("delete");
        assert!(!archive.layout().fid_dir(&fid).exists());
        archive.delete(&fid).expect("deleting twice is fine");
    }

    #[test]
    fn test_clean_incoming() {
        let (_dir, archive) = archive(5);
        assert_eq!(archive.clean_incoming().expect("clean"), 0);
        let ingest = archive.begin_ingest(1024).expect("ingest");
        std::mem::forget(ingest);
        assert_eq!(archive.clean_incoming().expect("clean"), 1);
    }
}
