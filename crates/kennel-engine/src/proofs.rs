//! Proof-of-storage loop.
//!
//! Every cycle walks the contract index and, for each contract, asks the
//! chain for the active deal:
//!
//! - deal owned by us and already verified: forgive one miss;
//! - deal owned by us and unverified: prove the challenged block, forgive
//!   one miss;
//! - deal gone or owned by someone else: count a miss, and evict once the
//!   count exceeds `max_misses`;
//! - chain unreachable: leave the contract untouched.
//!
//! Eviction deletes the file only when no other contract references it.

use std::time::{Duration, Instant};

use kennel_crypto::hashing::leaf_digest;
use kennel_crypto::merkle;
use kennel_db::queries::contracts;
use kennel_types::{ChainMsg, Cid, Deal, Fid};
use tokio::sync::broadcast;

use crate::{Context, EngineError, Result};

#[derive(Clone, Debug)]
pub struct ProofConfig {
    /// Target cycle length.
    pub interval: Duration,
    /// Misses tolerated before eviction.
    pub max_misses: u32,
    /// Block size the trees were built with.
    pub block_size: usize,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(kennel_types::DEFAULT_PROOF_INTERVAL_SECS),
            max_misses: kennel_types::DEFAULT_MAX_MISSES,
            block_size: kennel_types::DEFAULT_BLOCK_SIZE,
        }
    }
}

/// What one cycle did to one contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The chain already accepted the current challenge.
    Verified,
    /// A proof was queued for this block.
    Proved { index: u64 },
    /// The deal was not observed; consecutive miss count now `misses`.
    Missed { misses: u32 },
    /// Miss limit exceeded and the contract removed.
    Evicted { file_removed: bool },
    /// Nothing changed, for the given reason.
    Skipped(String),
}

/// Per-cycle tally.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub verified: usize,
    pub proved: usize,
    pub missed: usize,
    pub evicted: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Verified => self.verified += 1,
            Outcome::Proved { .. } => self.proved += 1,
            Outcome::Missed { .. } => self.missed += 1,
            Outcome::Evicted { .. } => self.evicted += 1,
            Outcome::Skipped(_) => self.skipped += 1,
        }
    }
}

pub struct ProofLoop {
    ctx: Context,
    config: ProofConfig,
}

impl ProofLoop {
    pub fn new(ctx: Context, config: ProofConfig) -> Self {
        Self { ctx, config }
    }

    /// Run cycles until `shutdown` fires.
    ///
    /// A cycle that overruns the interval is followed immediately by the
    /// next one; cycles never overlap.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            max_misses = self.config.max_misses,
            "proof loop started"
        );
        loop {
            let started = Instant::now();
            tokio::select! {
                report = self.run_cycle() => {
                    tracing::debug!(?report, "proof cycle finished");
                }
                _ = shutdown.recv() => break,
            }

            let elapsed = started.elapsed();
            let wait = match self.config.interval.checked_sub(elapsed) {
                Some(remaining) => remaining,
                None => {
                    tracing::warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_secs = self.config.interval.as_secs(),
                        "proof cycle overran its interval"
                    );
                    Duration::ZERO
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("proof loop stopped");
    }

    /// One pass over the contract index.
    pub async fn run_cycle(&self) -> CycleReport {
        let snapshot = {
            let conn = self.ctx.db.lock().await;
            contracts::iterate_contracts(&conn)
        };
        let contracts = match snapshot {
            Ok(contracts) => contracts,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read contract index");
                return CycleReport::default();
            }
        };

        let mut report = CycleReport::default();
        for (cid, fid) in contracts {
            let outcome = match self.check_contract(&cid, &fid).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(%cid, %fid, error = %e, "proof check failed");
                    Outcome::Skipped(e.to_string())
                }
            };
            report.record(&outcome);
        }
        report
    }

    /// Bring one contract up to date with the chain.
    pub async fn check_contract(&self, cid: &Cid, fid: &Fid) -> Result<Outcome> {
        let deal = match self.ctx.chain.query_active_deal(cid).await {
            Ok(deal) if deal.provider == self.ctx.address => deal,
            Ok(deal) => {
                tracing::debug!(%cid, provider = %deal.provider, "deal assigned elsewhere");
                return self.miss(cid, fid).await;
            }
            Err(e) if e.is_absent() => return self.miss(cid, fid).await,
            Err(e) => {
                tracing::debug!(%cid, error = %e, "chain unavailable, skipping");
                return Ok(Outcome::Skipped(e.to_string()));
            }
        };

        if deal.proof_verified {
            self.decay(cid).await?;
            return Ok(Outcome::Verified);
        }

        let Some(index) = deal.challenge_index() else {
            tracing::warn!(%cid, block = %deal.block_to_prove, "unparseable challenge");
            return Ok(Outcome::Skipped(format!(
                "bad challenge {:?}",
                deal.block_to_prove
            )));
        };

        let msg = self.build_proof(&deal, fid, index).await?;
        match self.ctx.queue.append(msg) {
            Ok(completion) => {
                let cid = cid.clone();
                tokio::spawn(async move {
                    if let Err(e) = completion.wait().await {
                        tracing::warn!(%cid, index, error = %e, "proof not accepted");
                    }
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.decay(cid).await?;
        tracing::debug!(%cid, index, "queued proof");
        Ok(Outcome::Proved { index })
    }

    async fn build_proof(&self, deal: &Deal, fid: &Fid, index: u64) -> Result<ChainMsg> {
        let block_size = self.config.block_size;
        let owned = fid.clone();
        let (block, tree) = self
            .ctx
            .blocking(move |archive| {
                let block = archive.get_block(&owned, index, block_size)?;
                let tree = archive.retrieve_tree(&owned)?;
                Ok((block, tree))
            })
            .await?;

        let digest = leaf_digest(index, &block);
        let proof = tree.generate_proof(&digest)?;
        if !merkle::verify(&digest, &proof, tree.root()) {
            return Err(EngineError::BadProof {
                fid: fid.to_string(),
                index,
            });
        }
        if !deal.merkle_root.is_empty() && !deal.merkle_root.eq_ignore_ascii_case(&tree.root_hex()) {
            tracing::warn!(cid = %deal.cid, %fid, "stored tree root differs from deal root");
        }

        let hash_list =
            serde_json::to_string(&proof).map_err(|e| EngineError::Task(e.to_string()))?;
        Ok(ChainMsg::PostProof {
            creator: self.ctx.address.clone(),
            cid: deal.cid.clone(),
            item: hex::encode(&block),
            hash_list,
        })
    }

    async fn decay(&self, cid: &Cid) -> Result<()> {
        let conn = self.ctx.db.lock().await;
        contracts::decay_miss(&conn, cid)?;
        Ok(())
    }

    async fn miss(&self, cid: &Cid, fid: &Fid) -> Result<Outcome> {
        let misses = {
            let conn = self.ctx.db.lock().await;
            contracts::bump_miss(&conn, cid)?
        };
        if misses <= self.config.max_misses {
            tracing::debug!(%cid, misses, "deal missing");
            return Ok(Outcome::Missed { misses });
        }

        let file_removed = self.ctx.delete_if_unreferenced(fid, Some(cid)).await?;
        {
            let conn = self.ctx.db.lock().await;
            contracts::delete_contract(&conn, cid)?;
        }
        tracing::info!(%cid, %fid, misses, file_removed, "evicted contract");
        Ok(Outcome::Evicted { file_removed })
    }
}
