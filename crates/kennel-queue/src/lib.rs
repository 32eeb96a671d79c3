//! # kennel-queue
//!
//! Batches provider messages into chain transactions.
//!
//! Callers [`UploadQueue::append`] a [`ChainMsg`] and get back a
//! [`Completion`] that resolves once the batch carrying the message has been
//! answered. A single flusher drains the head of the queue every interval,
//! packing as many messages as fit under the byte cap into one submission.
//!
//! ## Guarantees
//!
//! - Each completion resolves exactly once: with the chain response, the
//!   rejection, the submit error, or [`QueueError::Shutdown`].
//! - Messages in one batch keep their enqueue order.
//! - Appending a message equal to a queued one does not grow the queue; the
//!   new caller is attached to the existing entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kennel_chain::{ChainClient, ChainError};
use kennel_types::{ChainMsg, TxResponse};
use tokio::sync::{broadcast, oneshot};

/// Queue errors, delivered through a [`Completion`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The chain answered the batch with a non-zero code.
    #[error("chain rejected transaction (code {code}): {raw_log}")]
    Rejected { code: u32, raw_log: String },

    /// The batch could not be submitted or the message not encoded.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// The queue closed before the message was submitted.
    #[error("queue shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, QueueError>;

type Waiter = oneshot::Sender<Result<TxResponse>>;

struct Ticket {
    msg: ChainMsg,
    wire_len: usize,
    waiters: Vec<Waiter>,
}

impl Ticket {
    fn complete(self, outcome: &Result<TxResponse>) {
        for waiter in self.waiters {
            // Receiver may have been dropped by a fire-and-forget caller.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Resolves once the message has been answered.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<TxResponse>>,
}

impl Completion {
    /// Wait for the outcome of the batch carrying this message.
    pub async fn wait(self) -> Result<TxResponse> {
        self.rx.await.map_err(|_| QueueError::Shutdown)?
    }
}

/// Queue settings.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Upper bound on the summed wire length of one batch.
    pub message_size: usize,
    /// Annotation attached to every submitted transaction.
    pub memo: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_size: kennel_types::DEFAULT_MESSAGE_SIZE,
            memo: String::new(),
        }
    }
}

pub struct UploadQueue {
    chain: Arc<dyn ChainClient>,
    config: QueueConfig,
    pending: Mutex<VecDeque<Ticket>>,
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl UploadQueue {
    pub fn new(chain: Arc<dyn ChainClient>, config: QueueConfig) -> Self {
        Self {
            chain,
            config,
            pending: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue `msg` for the next flush.
    ///
    /// Fails immediately if the message cannot be encoded or the queue is
    /// closed.
    pub fn append(&self, msg: ChainMsg) -> Result<Completion> {
        if self.is_closed() {
            return Err(QueueError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();

        let mut pending = lock(&self.pending);
        if let Some(existing) = pending.iter_mut().find(|t| t.msg == msg) {
            tracing::debug!(kind = msg.kind(), "message already queued");
            existing.waiters.push(tx);
            return Ok(Completion { rx });
        }

        let wire_len = self.chain.wire_len(&msg)?;
        tracing::debug!(kind = msg.kind(), wire_len, queued = pending.len() + 1, "queued message");
        pending.push_back(Ticket {
            msg,
            wire_len,
            waiters: vec![tx],
        });
        Ok(Completion { rx })
    }

    /// Submit the longest head of the queue that fits the byte cap.
    ///
    /// Returns the number of messages submitted. Returns 0 without waiting
    /// when another flush is running or the head message alone is over the
    /// cap.
    pub async fn flush_once(&self) -> usize {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return 0;
        };

        let batch: Vec<ChainMsg> = {
            let pending = lock(&self.pending);
            let mut total = 0usize;
            let mut batch = Vec::new();
            for ticket in pending.iter() {
                if total + ticket.wire_len > self.config.message_size {
                    break;
                }
                total += ticket.wire_len;
                batch.push(ticket.msg.clone());
            }
            if batch.is_empty() {
                if let Some(head) = pending.front() {
                    tracing::warn!(
                        kind = head.msg.kind(),
                        wire_len = head.wire_len,
                        cap = self.config.message_size,
                        "head message exceeds batch size cap"
                    );
                }
                return 0;
            }
            batch
        };

        let outcome = match self.chain.submit(&batch, &self.config.memo).await {
            Ok(tx) if tx.is_accepted() => {
                tracing::debug!(messages = batch.len(), txhash = %tx.txhash, "batch accepted");
                Ok(tx)
            }
            Ok(tx) => {
                tracing::warn!(messages = batch.len(), code = tx.code, raw_log = %tx.raw_log, "batch rejected");
                Err(QueueError::Rejected {
                    code: tx.code,
                    raw_log: tx.raw_log,
                })
            }
            Err(e) => {
                tracing::warn!(messages = batch.len(), error = %e, "batch submit failed");
                Err(QueueError::Chain(e))
            }
        };

        // Only the flusher removes from the head, so the first `batch.len()`
        // tickets are the ones just submitted.
        let done: Vec<Ticket> = {
            let mut pending = lock(&self.pending);
            let n = batch.len().min(pending.len());
            pending.drain(..n).collect()
        };
        for ticket in done {
            ticket.complete(&outcome);
        }
        batch.len()
    }

    /// Flush every `interval` until `shutdown` fires, then close the queue.
    pub async fn run(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = interval.as_secs(), "queue flusher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.flush_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("queue flusher stopping");
                    break;
                }
            }
        }
        self.close();
    }

    /// Refuse further appends and fail every queued message with
    /// [`QueueError::Shutdown`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Ticket> = lock(&self.pending).drain(..).collect();
        if !drained.is_empty() {
            tracing::info!(messages = drained.len(), "dropping queued messages on shutdown");
        }
        for ticket in drained {
            ticket.complete(&Err(QueueError::Shutdown));
        }
    }
}
