//! Provider process wiring: opens storage, starts the background loops and
//! tears them down on shutdown.

use std::sync::Arc;

use axum::Router;
use kennel_chain::ChainClient;
use kennel_engine::{
    prune_orphans, Context, PeerFetcher, ProofConfig, ProofLoop, StrayClaimer, StrayConfig,
};
use kennel_queue::{QueueConfig, UploadQueue};
use kennel_storage::FileArchive;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::DaemonConfig;
use crate::server::{self, AppState};

/// A running provider.
pub struct Node {
    pub ctx: Context,
    pub config: DaemonConfig,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open the archive and index under the configured home and start the
    /// queue flusher, proof loop and (if enabled) stray claimer.
    pub async fn start(
        config: DaemonConfig,
        chain: Arc<dyn ChainClient>,
        fetcher: Arc<dyn PeerFetcher>,
    ) -> anyhow::Result<Self> {
        let home = config.home();
        let archive = FileArchive::open(&home, config.storage.chunk_size)?;
        let conn = kennel_db::open_dir(&config.data_dir())?;
        info!(home = %home.display(), "opened provider home");

        let queue = Arc::new(UploadQueue::new(
            chain.clone(),
            QueueConfig {
                message_size: config.queue.message_size,
                memo: config.queue.memo.clone(),
            },
        ));
        let ctx = Context::new(
            config.provider.address.clone(),
            archive,
            Arc::new(Mutex::new(conn)),
            chain,
            queue.clone(),
        );

        if config.storage.prune_on_start {
            prune_orphans(&ctx).await?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        let interval = config.queue_interval();
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { queue.run(interval, rx).await }));

        let proofs = ProofLoop::new(
            ctx.clone(),
            ProofConfig {
                interval: config.proof_interval(),
                max_misses: config.proofs.max_misses,
                block_size: config.storage.chunk_size,
            },
        );
        let rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { proofs.run(rx).await }));

        if config.strays.enabled {
            let claimer = Arc::new(StrayClaimer::new(
                ctx.clone(),
                fetcher,
                StrayConfig {
                    interval: config.stray_interval(),
                    threads: config.strays.threads,
                    max_file_size: config.storage.max_file_size,
                },
            ));
            let rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(claimer.run(rx)));
        }

        Ok(Self {
            ctx,
            config,
            shutdown_tx,
            tasks,
        })
    }

    /// HTTP router bound to this node.
    pub fn router(&self) -> Router {
        server::router(Arc::new(AppState {
            ctx: self.ctx.clone(),
            max_file_size: self.config.storage.max_file_size,
        }))
    }

    /// A receiver that fires when the node shuts down.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("node stopped");
    }
}
