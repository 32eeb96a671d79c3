//! Shared handles passed to every engine component.
//!
//! Besides the handles, the context tracks FIDs that an upload or claim is
//! still working on. A file committed by one task may not be indexed yet, so
//! deletions consult these pins as well as the contract index.

use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};

use kennel_chain::ChainClient;
use kennel_queue::UploadQueue;
use kennel_storage::FileArchive;
use kennel_types::{Cid, Fid};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::{EngineError, Result};

/// Contract index connection shared between tasks.
pub type SharedDb = Arc<Mutex<Connection>>;

/// In-flight FIDs with the number of tasks holding each.
type PinMap = Arc<std::sync::Mutex<HashMap<Fid, usize>>>;

fn lock_pins(pins: &PinMap) -> MutexGuard<'_, HashMap<Fid, usize>> {
    pins.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps a FID off the deletion paths until dropped.
#[must_use = "the pin is released when dropped"]
pub struct FidPin {
    pins: PinMap,
    fid: Fid,
}

impl Drop for FidPin {
    fn drop(&mut self) {
        let mut pins = lock_pins(&self.pins);
        if let Some(count) = pins.get_mut(&self.fid) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.fid);
            }
        }
    }
}

#[derive(Clone)]
pub struct Context {
    /// Bech32 account of this provider.
    pub address: String,
    pub archive: FileArchive,
    pub db: SharedDb,
    pub chain: Arc<dyn ChainClient>,
    pub queue: Arc<UploadQueue>,
    pins: PinMap,
}

impl Context {
    pub fn new(
        address: impl Into<String>,
        archive: FileArchive,
        db: SharedDb,
        chain: Arc<dyn ChainClient>,
        queue: Arc<UploadQueue>,
    ) -> Self {
        Self {
            address: address.into(),
            archive,
            db,
            chain,
            queue,
            pins: PinMap::default(),
        }
    }

    /// Pin `fid` for the lifetime of the returned guard.
    pub fn pin(&self, fid: &Fid) -> FidPin {
        *lock_pins(&self.pins).entry(fid.clone()).or_insert(0) += 1;
        FidPin {
            pins: self.pins.clone(),
            fid: fid.clone(),
        }
    }

    /// Whether any task currently pins `fid`.
    pub fn is_pinned(&self, fid: &Fid) -> bool {
        lock_pins(&self.pins).contains_key(fid)
    }

    /// Run blocking archive I/O off the async workers.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&FileArchive) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let archive = self.archive.clone();
        tokio::task::spawn_blocking(move || f(&archive))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    /// Delete `fid` from disk unless a contract other than `except` still
    /// references it or a task has it pinned. Returns whether the directory
    /// was removed.
    ///
    /// Callers holding their own pin must drop it first.
    pub async fn delete_if_unreferenced(&self, fid: &Fid, except: Option<&Cid>) -> Result<bool> {
        let referenced = {
            let conn = self.db.lock().await;
            let cids = kennel_db::queries::contracts::get_cids(&conn, fid)?;
            cids.iter().any(|cid| Some(cid) != except)
        };
        if referenced {
            return Ok(false);
        }
        let fid = fid.clone();
        let pins = self.pins.clone();
        self.blocking(move |archive| {
            // Held across the delete so a new pin waits for it to finish.
            let held = lock_pins(&pins);
            if held.contains_key(&fid) {
                tracing::debug!(%fid, "file pinned by an in-flight task, keeping it");
                return Ok(false);
            }
            archive.delete(&fid)?;
            Ok(true)
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;

    #[tokio::test]
    async fn test_delete_if_unreferenced_respects_siblings() {
        let h = harness(5);
        let (alice, fid) = store(&h.ctx, "jkl1alice", b"shared").await;
        let (bob, _) = store(&h.ctx, "jkl1bob", b"shared").await;

        assert!(!h.ctx.delete_if_unreferenced(&fid, Some(&alice)).await.expect("delete"));
        assert!(h.ctx.archive.contains(&fid));

        {
            let conn = h.ctx.db.lock().await;
            kennel_db::queries::contracts::delete_contract(&conn, &bob).expect("delete");
        }
        assert!(h.ctx.delete_if_unreferenced(&fid, Some(&alice)).await.expect("delete"));
        assert!(!h.ctx.archive.contains(&fid));
    }

    #[tokio::test]
    async fn test_pinned_file_is_not_deleted() {
        let h = harness(5);
        let (alice, fid) = store(&h.ctx, "jkl1alice", b"in flight").await;
        {
            let conn = h.ctx.db.lock().await;
            kennel_db::queries::contracts::delete_contract(&conn, &alice).expect("delete");
        }

        let first = h.ctx.pin(&fid);
        let second = h.ctx.pin(&fid);
        assert!(!h.ctx.delete_if_unreferenced(&fid, None).await.expect("delete"));
        drop(first);
        assert!(h.ctx.is_pinned(&fid), "one pin still held");
        assert!(!h.ctx.delete_if_unreferenced(&fid, None).await.expect("delete"));
        assert!(h.ctx.archive.contains(&fid));

        drop(second);
        assert!(!h.ctx.is_pinned(&fid));
        assert!(h.ctx.delete_if_unreferenced(&fid, None).await.expect("delete"));
        assert!(!h.ctx.archive.contains(&fid));
    }
}
