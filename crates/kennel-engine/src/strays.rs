//! Stray contract claimer.
//!
//! A stray is a contract the chain lists without a provider. Each cycle
//! the claimer lists strays, queues new ones FIFO and hands them to idle
//! worker slots. A worker:
//!
//! 1. downloads the file from the stray's peer into a fresh ingest,
//! 2. checks the bytes hash to the stray's FID and, if the stray advertises
//!    one, that the rebuilt tree has the same root,
//! 3. commits bytes and tree to the archive,
//! 4. queues `ClaimStray` and waits for the chain,
//! 5. indexes the contract.
//!
//! The download is capped at the size the stray declares. Any failure
//! releases the slot and removes the downloaded file if this claim placed it
//! and nothing else references or pins it. The stray is picked up again in a
//! later cycle if the chain still lists it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kennel_db::queries::contracts;
use kennel_db::DbError;
use kennel_types::{ChainMsg, Cid, Fid, Stray};
use reqwest::Client;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::{Context, EngineError, Intake, Result};

/// Source of file bytes held by other providers.
#[async_trait]
pub trait PeerFetcher: Send + Sync {
    /// Stream the file `fid` from the provider at `peer_url` into `sink`.
    async fn fetch(&self, peer_url: &str, fid: &Fid, sink: &mut Intake) -> Result<()>;
}

/// Fetches `GET <peer>/download/<fid>` over HTTP.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerFetcher for HttpFetcher {
    async fn fetch(&self, peer_url: &str, fid: &Fid, sink: &mut Intake) -> Result<()> {
        let url = format!("{}/download/{}", peer_url.trim_end_matches('/'), fid);
        let fetch_err = |e: reqwest::Error| EngineError::Fetch(format!("{url}: {e}"));

        let mut resp = self.client.get(&url).send().await.map_err(fetch_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Fetch(format!("{url}: status {status}")));
        }
        while let Some(chunk) = resp.chunk().await.map_err(fetch_err)? {
            sink.write(&chunk).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct StrayConfig {
    /// Time between stray listings.
    pub interval: Duration,
    /// Number of concurrent claims.
    pub threads: usize,
    /// Largest file a claim will download.
    pub max_file_size: u64,
}

impl Default for StrayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(kennel_types::DEFAULT_STRAY_INTERVAL_SECS),
            threads: kennel_types::DEFAULT_STRAY_THREADS,
            max_file_size: kennel_types::DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Default)]
struct Slots {
    fifo: VecDeque<Stray>,
    busy: HashSet<Cid>,
}

pub struct StrayClaimer {
    ctx: Context,
    fetcher: Arc<dyn PeerFetcher>,
    config: StrayConfig,
    slots: Mutex<Slots>,
    workers: Mutex<JoinSet<()>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Frees a worker slot when the claim finishes, however it finishes.
struct SlotGuard {
    claimer: Arc<StrayClaimer>,
    cid: Cid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.claimer.slots).busy.remove(&self.cid);
    }
}

impl StrayClaimer {
    pub fn new(ctx: Context, fetcher: Arc<dyn PeerFetcher>, config: StrayConfig) -> Self {
        Self {
            ctx,
            fetcher,
            config,
            slots: Mutex::new(Slots::default()),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Strays waiting for a slot.
    pub fn queued(&self) -> usize {
        lock(&self.slots).fifo.len()
    }

    /// Slots currently claiming.
    pub fn busy(&self) -> usize {
        lock(&self.slots).busy.len()
    }

    /// Run cycles until `shutdown` fires. In-flight claims are aborted.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            threads = self.config.threads,
            "stray claimer started"
        );
        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.recv() => break,
            }
        }
        lock(&self.workers).abort_all();
        tracing::info!("stray claimer stopped");
    }

    /// List strays, queue new ones and fill idle slots.
    pub async fn run_cycle(self: &Arc<Self>) {
        // Reap finished workers so the join set does not grow unbounded.
        {
            let mut workers = lock(&self.workers);
            while workers.try_join_next().is_some() {}
        }

        let strays = match self.ctx.chain.query_all_strays().await {
            Ok(strays) => strays,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list strays");
                return;
            }
        };

        let owned: HashSet<Cid> = {
            let conn = self.ctx.db.lock().await;
            let mut owned = HashSet::new();
            for stray in &strays {
                if matches!(contracts::get_fid(&conn, &stray.cid), Ok(Some(_))) {
                    owned.insert(stray.cid.clone());
                }
            }
            owned
        };

        let assigned = {
            let mut slots = lock(&self.slots);
            for stray in strays {
                let known = owned.contains(&stray.cid)
                    || slots.busy.contains(&stray.cid)
                    || slots.fifo.iter().any(|s| s.cid == stray.cid);
                if !known {
                    slots.fifo.push_back(stray);
                }
            }

            let mut assigned = Vec::new();
            while slots.busy.len() < self.config.threads {
                let Some(stray) = slots.fifo.pop_front() else {
                    break;
                };
                slots.busy.insert(stray.cid.clone());
                assigned.push(stray);
            }
            tracing::debug!(
                queued = slots.fifo.len(),
                busy = slots.busy.len(),
                assigned = assigned.len(),
                "stray cycle"
            );
            assigned
        };

        let mut workers = lock(&self.workers);
        for stray in assigned {
            let guard = SlotGuard {
                claimer: Arc::clone(self),
                cid: stray.cid.clone(),
            };
            workers.spawn(async move {
                let claimer = guard.claimer.clone();
                match claimer.claim(&stray).await {
                    Ok(()) => {}
                    Err(e) => {
                        tracing::warn!(cid = %stray.cid, fid = %stray.fid, error = %e, "stray claim failed");
                    }
                }
                drop(guard);
            });
        }
    }

    /// Wait for every running claim to finish.
    pub async fn wait_idle(&self) {
        let mut workers = std::mem::take(&mut *lock(&self.workers));
        while workers.join_next().await.is_some() {}
    }

    /// Download, verify, store and claim one stray.
    pub async fn claim(&self, stray: &Stray) -> Result<()> {
        let limit = match stray.file_size {
            0 => self.config.max_file_size,
            declared => declared.min(self.config.max_file_size),
        };
        let mut intake = Intake::begin(&self.ctx, limit).await?;
        self.fetcher
            .fetch(&stray.peer_url, &stray.fid, &mut intake)
            .await?;
        let ingested = intake.finish().await?;

        if ingested.fid() != &stray.fid {
            return Err(EngineError::FidMismatch {
                expected: stray.fid.to_string(),
                actual: ingested.fid().to_string(),
            });
        }
        let root = ingested.tree().root_hex();
        if !stray.merkle_root.is_empty() && !stray.merkle_root.eq_ignore_ascii_case(&root) {
            return Err(EngineError::RootMismatch {
                fid: stray.fid.to_string(),
                expected: stray.merkle_root.clone(),
                actual: root,
            });
        }

        let pin = self.ctx.pin(&stray.fid);
        let placed = self
            .ctx
            .blocking(move |archive| Ok(ingested.commit(archive)?))
            .await?
            .placed;

        let msg = ChainMsg::ClaimStray {
            creator: self.ctx.address.clone(),
            cid: stray.cid.clone(),
        };
        let claimed: Result<()> = match self.ctx.queue.append(msg) {
            Ok(completion) => match completion.wait().await {
                Ok(_) => {
                    let conn = self.ctx.db.lock().await;
                    match contracts::put_contract(&conn, &stray.cid, &stray.fid) {
                        Ok(()) | Err(DbError::Exists(_)) => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };

        drop(pin);
        match claimed {
            Ok(()) => {
                tracing::info!(cid = %stray.cid, fid = %stray.fid, peer = %stray.peer_url, "claimed stray");
                Ok(())
            }
            Err(e) => {
                if placed {
                    if let Err(cleanup) = self.ctx.delete_if_unreferenced(&stray.fid, None).await {
                        tracing::warn!(fid = %stray.fid, error = %cleanup, "failed to remove unclaimed file");
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use kennel_crypto::MerkleTree;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HELLO: &[u8] = b"hello, world\n";

    /// Serves canned bodies keyed by peer URL.
    #[derive(Default)]
    struct CannedFetcher {
        bodies: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerFetcher for CannedFetcher {
        async fn fetch(&self, peer_url: &str, _fid: &Fid, sink: &mut Intake) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self
                .bodies
                .get(peer_url)
                .ok_or_else(|| EngineError::Fetch(format!("{peer_url}: unreachable")))?;
            for chunk in body.chunks(4) {
                sink.write(chunk).await?;
            }
            Ok(())
        }
    }

    fn stray(owner: &str, data: &[u8], peer: &str) -> Stray {
        let fid = Fid::for_bytes(data).expect("fid");
        Stray {
            cid: Cid::derive(owner, "jkl1gone", &fid).expect("cid"),
            fid,
            signee: owner.into(),
            file_size: data.len() as u64,
            merkle_root: String::new(),
            peer_url: peer.into(),
        }
    }

    fn claimer(h: &Harness, fetcher: CannedFetcher, threads: usize) -> Arc<StrayClaimer> {
        Arc::new(StrayClaimer::new(
            h.ctx.clone(),
            Arc::new(fetcher),
            StrayConfig {
                interval: Duration::from_millis(20),
                threads,
                max_file_size: 1 << 20,
            },
        ))
    }

    fn fetcher(peers: &[(&str, &[u8])]) -> CannedFetcher {
        CannedFetcher {
            bodies: peers
                .iter()
                .map(|(url, body)| (url.to_string(), body.to_vec()))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_claim_stores_and_indexes() {
        let h = harness(5);
        let flusher = spawn_flusher(&h.ctx);
        let mut s = stray("jkl1alice", HELLO, "http://peer");
        s.merkle_root = MerkleTree::build(HELLO, 13, 5).expect("tree").root_hex();
        h.chain.add_stray(s.clone());

        let c = claimer(&h, fetcher(&[("http://peer", HELLO)]), 3);
        c.claim(&s).await.expect("claim");
        flusher.abort();

        assert!(h.ctx.archive.contains(&s.fid));
        let conn = h.ctx.db.lock().await;
        assert_eq!(contracts::get_fid(&conn, &s.cid).expect("get"), Some(s.fid.clone()));
        assert_eq!(
            h.chain.submitted(),
            vec![ChainMsg::ClaimStray {
                creator: PROVIDER.into(),
                cid: s.cid.clone()
            }]
        );
    }

    #[tokio::test]
    async fn test_fid_mismatch_leaves_no_trace() {
        let h = harness(5);
        let s = stray("jkl1alice", HELLO, "http://liar");
        let c = claimer(&h, fetcher(&[("http://liar", b"something else")]), 3);

        let err = c.claim(&s).await.expect_err("mismatch");
        assert!(matches!(err, EngineError::FidMismatch { .. }));
        assert!(!h.ctx.archive.contains(&s.fid));
        assert!(h.ctx.archive.layout().list_fids().expect("list").is_empty());
        assert_eq!(h.ctx.archive.clean_incoming().expect("clean"), 0);
        assert!(h.ctx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_root_mismatch_rejected() {
        let h = harness(5);
        let mut s = stray("jkl1alice", HELLO, "http://peer");
        s.merkle_root = "00".repeat(64);
        let c = claimer(&h, fetcher(&[("http://peer", HELLO)]), 3);
        assert!(matches!(
            c.claim(&s).await,
            Err(EngineError::RootMismatch { .. })
        ));
        assert!(!h.ctx.archive.contains(&s.fid));
    }

    #[tokio::test]
    async fn test_rejected_claim_removes_file() {
        let h = harness(5);
        h.chain.reject_next(9, "already claimed");
        let flusher = spawn_flusher(&h.ctx);
        let s = stray("jkl1alice", HELLO, "http://peer");
        let c = claimer(&h, fetcher(&[("http://peer", HELLO)]), 3);
        assert!(c.claim(&s).await.is_err());
        flusher.abort();
        assert!(!h.ctx.archive.contains(&s.fid));
        let conn = h.ctx.db.lock().await;
        assert_eq!(contracts::get_fid(&conn, &s.cid).expect("get"), None);
    }

    #[tokio::test]
    async fn test_download_capped_at_declared_size() {
        let h = harness(5);
        let s = stray("jkl1alice", HELLO, "http://padded");
        let mut padded = HELLO.to_vec();
        padded.extend_from_slice(b"and then some");
        let c = claimer(&h, fetcher(&[("http://padded", padded.as_slice())]), 1);

        let err = c.claim(&s).await.expect_err("too large");
        assert!(matches!(
            err,
            EngineError::Storage(kennel_storage::StorageError::TooLarge { limit: 13 })
        ));
        assert!(!h.ctx.archive.contains(&s.fid));
        assert_eq!(h.ctx.archive.clean_incoming().expect("clean"), 0);
        assert!(h.chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_claim_keeps_file_it_did_not_place() {
        let h = harness(5);
        let (_, fid) = store(&h.ctx, "jkl1bob", HELLO).await;
        {
            // Bob's contract is mid-flight: the file is on disk but unindexed.
            let conn = h.ctx.db.lock().await;
            let bob = Cid::derive("jkl1bob", PROVIDER, &fid).expect("cid");
            contracts::delete_contract(&conn, &bob).expect("unindex");
        }
        h.chain.reject_next(9, "already claimed");
        let flusher = spawn_flusher(&h.ctx);
        let s = stray("jkl1alice", HELLO, "http://peer");
        let c = claimer(&h, fetcher(&[("http://peer", HELLO)]), 1);
        assert!(c.claim(&s).await.is_err());
        flusher.abort();
        assert!(h.ctx.archive.contains(&fid));
    }

    #[tokio::test]
    async fn test_cycle_respects_slot_count_and_frees_slots() {
        let h = harness(5);
        let flusher = spawn_flusher(&h.ctx);
        let bodies: Vec<Vec<u8>> = (0..4).map(|i| format!("file {i}").into_bytes()).collect();
        let strays: Vec<Stray> = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| stray("jkl1alice", body, &format!("http://peer{i}")))
            .collect();
        for s in &strays {
            h.chain.add_stray(s.clone());
        }
        let peers: Vec<(String, Vec<u8>)> = strays
            .iter()
            .zip(&bodies)
            .map(|(s, b)| (s.peer_url.clone(), b.clone()))
            .collect();
        let peers: Vec<(&str, &[u8])> = peers
            .iter()
            .map(|(u, b)| (u.as_str(), b.as_slice()))
            .collect();
        let c = claimer(&h, fetcher(&peers), 2);

        c.run_cycle().await;
        assert_eq!(c.queued(), 2);
        c.wait_idle().await;
        assert_eq!(c.busy(), 0);

        c.run_cycle().await;
        assert_eq!(c.queued(), 0);
        c.wait_idle().await;
        flusher.abort();

        let conn = h.ctx.db.lock().await;
        assert_eq!(contracts::count(&conn).expect("count"), 4);
        drop(conn);

        // Claimed strays leave the chain's list and are not fetched again.
        c.run_cycle().await;
        c.wait_idle().await;
        assert_eq!(c.queued(), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_frees_slot() {
        let h = harness(5);
        let s = stray("jkl1alice", HELLO, "http://nowhere");
        h.chain.add_stray(s);
        let c = claimer(&h, fetcher(&[]), 1);
        c.run_cycle().await;
        c.wait_idle().await;
        assert_eq!(c.busy(), 0);
        assert_eq!(c.queued(), 0);
    }

    #[tokio::test]
    async fn test_http_fetcher_streams_body() {
        use axum::routing::get;
        let app = axum::Router::new().route(
            "/download/:fid",
            get(|| async { HELLO.to_vec() }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let h = harness(5);
        let fid = Fid::for_bytes(HELLO).expect("fid");
        let mut intake = Intake::begin(&h.ctx, 1024).await.expect("intake");
        HttpFetcher::new(Duration::from_secs(5))
            .expect("fetcher")
            .fetch(&format!("http://{addr}/"), &fid, &mut intake)
            .await
            .expect("fetch");
        assert_eq!(intake.finish().await.expect("finish").fid(), &fid);
    }
}
