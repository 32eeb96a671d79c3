//! Startup removal of files no contract references.

use kennel_db::queries::contracts;

use crate::{Context, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// FID directories removed.
    pub files: usize,
    /// Partial uploads removed.
    pub partials: usize,
}

/// Delete every stored file that no indexed contract references, and any
/// partial upload left by a previous run.
pub async fn prune_orphans(ctx: &Context) -> Result<PruneReport> {
    let referenced = {
        let conn = ctx.db.lock().await;
        contracts::referenced_fids(&conn)?
    };

    let report = ctx
        .blocking(move |archive| {
            let mut report = PruneReport::default();
            for fid in archive.layout().list_fids()? {
                if !referenced.contains(&fid) {
                    archive.delete(&fid)?;
                    report.files += 1;
                }
            }
            report.partials = archive.clean_incoming()?;
            Ok(report)
        })
        .await?;

    tracing::info!(files = report.files, partials = report.partials, "pruned orphans");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use kennel_types::Fid;

    #[tokio::test]
    async fn test_prune_keeps_referenced_files() {
        let h = harness(5);
        let (_, kept) = store(&h.ctx, "jkl1alice", b"kept").await;

        let orphan = Fid::for_bytes(b"orphan").expect("fid");
        h.ctx.archive.write_file(&b"orphan"[..], &orphan).expect("write");
        let partial = h.ctx.archive.begin_ingest(1024).expect("ingest");
        std::mem::forget(partial);

        let report = prune_orphans(&h.ctx).await.expect("prune");
        assert_eq!(report, PruneReport { files: 1, partials: 1 });
        assert!(h.ctx.archive.contains(&kept));
        assert!(!h.ctx.archive.contains(&orphan));
    }
}
