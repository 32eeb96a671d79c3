//! End-to-end fixtures for the kennel provider.
//!
//! A [`Provider`] is the full provider stack in one process: archive and
//! contract index under a temporary home, a queue flusher, and the HTTP
//! facade bound to an ephemeral port. Providers share a [`LocalChain`] so
//! tests can hand contracts from one to another.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p kennel-integration-tests
//! ```

use std::sync::Arc;
use std::time::Duration;

use kennel_chain::LocalChain;
use kennel_daemon::server::{self, AppState};
use kennel_db::queries::{contracts, kv};
use kennel_engine::Context;
use kennel_queue::{QueueConfig, UploadQueue};
use kennel_storage::FileArchive;
use kennel_types::{Cid, Fid};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Block size every fixture archive is opened with.
pub const BLOCK_SIZE: usize = 5;

/// Thirteen bytes spanning three blocks of [`BLOCK_SIZE`].
pub const HELLO: &[u8] = b"hello, world\n";

/// A running provider.
pub struct Provider {
    pub ctx: Context,
    pub chain: Arc<LocalChain>,
    /// Base URL of the HTTP facade.
    pub url: String,
    http: reqwest::Client,
    tasks: Vec<JoinHandle<()>>,
    _home: TempDir,
}

impl Provider {
    /// Start a provider with account `address` against `chain`.
    pub async fn start(address: &str, chain: Arc<LocalChain>) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let archive = FileArchive::open(home.path(), BLOCK_SIZE).expect("open archive");
        let conn = kennel_db::open_dir(&home.path().join("data")).expect("open index");
        let queue = Arc::new(UploadQueue::new(
            chain.clone(),
            QueueConfig {
                message_size: 500_000,
                memo: "integration".into(),
            },
        ));
        let ctx = Context::new(
            address,
            archive,
            Arc::new(Mutex::new(conn)),
            chain.clone(),
            queue.clone(),
        );

        let flusher = tokio::spawn(async move {
            loop {
                queue.flush_once().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let app = server::router(Arc::new(AppState {
            ctx: ctx.clone(),
            max_file_size: 1 << 20,
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            ctx,
            chain,
            url,
            http: reqwest::Client::new(),
            tasks: vec![flusher, server],
            _home: home,
        }
    }

    /// `POST /upload` with the given sender and file body.
    pub async fn upload(&self, sender: &str, data: &[u8]) -> reqwest::Response {
        let form = reqwest::multipart::Form::new()
            .text("sender", sender.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(data.to_vec()).file_name("upload.bin"),
            );
        self.http
            .post(format!("{}/upload", self.url))
            .multipart(form)
            .send()
            .await
            .expect("upload request")
    }

    /// Upload and expect success, returning the new contract.
    pub async fn upload_ok(&self, sender: &str, data: &[u8]) -> (Cid, Fid) {
        let resp = self.upload(sender, data).await;
        assert!(resp.status().is_success(), "upload failed: {}", resp.status());
        let body: serde_json::Value = resp.json().await.expect("upload reply");
        let cid = Cid::parse(body["cid"].as_str().expect("cid field")).expect("cid");
        let fid = Fid::parse(body["fid"].as_str().expect("fid field")).expect("fid");
        (cid, fid)
    }

    /// `GET /download/<fid>`.
    pub async fn download(&self, fid: &Fid) -> reqwest::Response {
        self.http
            .get(format!("{}/download/{}", self.url, fid))
            .send()
            .await
            .expect("download request")
    }

    /// FID indexed under `cid`.
    pub async fn fid_of(&self, cid: &Cid) -> Option<Fid> {
        let conn = self.ctx.db.lock().await;
        contracts::get_fid(&conn, cid).expect("get fid")
    }

    /// Contracts indexed for `fid`.
    pub async fn cids_of(&self, fid: &Fid) -> Vec<Cid> {
        let conn = self.ctx.db.lock().await;
        contracts::get_cids(&conn, fid).expect("get cids")
    }

    /// Consecutive misses recorded for `cid`.
    pub async fn misses(&self, cid: &Cid) -> u32 {
        let conn = self.ctx.db.lock().await;
        contracts::miss_count(&conn, cid).expect("miss count")
    }

    /// Whether a miss counter row exists for `cid` at all.
    pub async fn has_miss_counter(&self, cid: &Cid) -> bool {
        let conn = self.ctx.db.lock().await;
        let key = format!("{}{}", contracts::MISS_PREFIX, cid);
        kv::get(&conn, &key).expect("kv get").is_some()
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
