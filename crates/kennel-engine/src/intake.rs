//! Streaming intake into the archive.
//!
//! Network bodies arrive as many small chunks. [`Intake`] collects them and
//! hands full batches to an [`Ingest`] on the blocking pool, so part-file
//! writes never run on the async workers.

use kennel_storage::{Ingest, Ingested};

use crate::{Context, EngineError, Result};

/// Bytes buffered before a write is handed to the blocking pool.
pub const BATCH_BYTES: usize = 256 * 1024;

pub struct Intake {
    /// Taken while a batch is being written. Gone after a failed write.
    ingest: Option<Ingest>,
    buf: Vec<u8>,
}

impl Intake {
    /// Open a part file that accepts at most `max_size` bytes.
    pub async fn begin(ctx: &Context, max_size: u64) -> Result<Self> {
        let ingest = ctx
            .blocking(move |archive| Ok(archive.begin_ingest(max_size)?))
            .await?;
        Ok(Self {
            ingest: Some(ingest),
            buf: Vec::with_capacity(BATCH_BYTES),
        })
    }

    /// Bytes received so far, written or buffered.
    pub fn len(&self) -> u64 {
        let written = self.ingest.as_ref().map_or(0, Ingest::len);
        written + self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a chunk, writing out the buffer once it holds a full batch.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() >= BATCH_BYTES {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let mut ingest = self.ingest.take().ok_or_else(closed)?;
        let buf = std::mem::replace(&mut self.buf, Vec::with_capacity(BATCH_BYTES));
        let ingest = run_blocking(move || {
            ingest.write(&buf)?;
            Ok(ingest)
        })
        .await?;
        self.ingest = Some(ingest);
        Ok(())
    }

    /// Write what is left and derive FID and tree.
    pub async fn finish(mut self) -> Result<Ingested> {
        let mut ingest = self.ingest.take().ok_or_else(closed)?;
        let buf = std::mem::take(&mut self.buf);
        run_blocking(move || {
            if !buf.is_empty() {
                ingest.write(&buf)?;
            }
            Ok(ingest.finish()?)
        })
        .await
    }
}

fn closed() -> EngineError {
    EngineError::Task("intake closed after a failed write".into())
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use kennel_storage::StorageError;
    use kennel_types::Fid;

    #[tokio::test]
    async fn test_batches_cross_threshold() {
        let h = harness(5);
        let data: Vec<u8> = (0..BATCH_BYTES * 2 + 1234).map(|i| (i % 251) as u8).collect();

        let mut intake = Intake::begin(&h.ctx, u64::MAX).await.expect("begin");
        for chunk in data.chunks(10_000) {
            intake.write(chunk).await.expect("write");
        }
        assert_eq!(intake.len(), data.len() as u64);
        assert!(intake.buf.len() < BATCH_BYTES, "full batches were written out");

        let ingested = intake.finish().await.expect("finish");
        assert_eq!(ingested.fid(), &Fid::for_bytes(&data).expect("fid"));
        assert_eq!(ingested.size(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_limit_applies_to_buffered_tail() {
        let h = harness(5);
        let mut intake = Intake::begin(&h.ctx, 8).await.expect("begin");
        intake.write(b"hello, world\n").await.expect("buffered");
        assert!(matches!(
            intake.finish().await,
            Err(EngineError::Storage(StorageError::TooLarge { limit: 8 }))
        ));
        assert_eq!(h.ctx.archive.clean_incoming().expect("clean"), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_closes_intake() {
        let h = harness(5);
        let mut intake = Intake::begin(&h.ctx, 16).await.expect("begin");
        let big = vec![0u8; BATCH_BYTES];
        assert!(matches!(
            intake.write(&big).await,
            Err(EngineError::Storage(StorageError::TooLarge { .. }))
        ));
        assert!(matches!(intake.write(b"more").await, Ok(())));
        assert!(matches!(intake.finish().await, Err(EngineError::Task(_))));
        assert_eq!(h.ctx.archive.clean_incoming().expect("clean"), 0);
    }
}
