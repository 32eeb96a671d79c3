//! Upload acceptance and attestations.
//!
//! An upload is received through an [`Intake`](crate::Intake) by the
//! HTTP layer and handed here once the body has ended. From there:
//!
//! 1. derive the CID from the uploader, this provider and the FID,
//! 2. commit bytes and tree into the archive,
//! 3. queue a `PostContract` and wait for the chain,
//! 4. index the contract.
//!
//! The FID stays pinned from commit until the contract is indexed or the
//! failure is cleaned up. If the chain refuses, no index entry is written and
//! the file is removed only when this upload placed it and no other contract
//! or in-flight task still needs it.

use kennel_db::queries::contracts;
use kennel_db::DbError;
use kennel_storage::Ingested;
use kennel_types::{ChainMsg, Cid, Fid, TxResponse};
use serde_json::json;

use crate::{Context, Result};

/// Identifiers of an accepted upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    pub cid: Cid,
    pub fid: Fid,
}

impl UploadReceipt {
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "cid": self.cid, "fid": self.fid })
    }
}

/// Accept a fully received upload from `sender`.
pub async fn accept(ctx: &Context, sender: &str, ingested: Ingested) -> Result<UploadReceipt> {
    let fid = ingested.fid().clone();
    let size = ingested.size();
    let cid = Cid::derive(sender, &ctx.address, &fid)?;

    {
        let conn = ctx.db.lock().await;
        if contracts::get_fid(&conn, &cid)?.is_some() {
            return Err(DbError::Exists(cid.to_string()).into());
        }
    }

    let pin = ctx.pin(&fid);
    let committed = ctx
        .blocking(move |archive| Ok(ingested.commit(archive)?))
        .await?;
    let (tree, placed) = (committed.tree, committed.placed);

    let msg = ChainMsg::PostContract {
        creator: ctx.address.clone(),
        signee: sender.to_string(),
        file_size: size,
        fid: fid.clone(),
        merkle: tree.root_hex(),
    };

    let outcome: Result<TxResponse> = match ctx.queue.append(msg) {
        Ok(completion) => completion.wait().await.map_err(Into::into),
        Err(e) => Err(e.into()),
    };
    let indexed: Result<()> = match outcome {
        Ok(_) => {
            let conn = ctx.db.lock().await;
            contracts::put_contract(&conn, &cid, &fid).map_err(Into::into)
        }
        Err(e) => Err(e),
    };

    drop(pin);
    match indexed {
        Ok(()) => {
            tracing::info!(%cid, %fid, size, %sender, "accepted upload");
            Ok(UploadReceipt { cid, fid })
        }
        Err(e) => {
            tracing::warn!(%cid, %fid, placed, error = %e, "upload failed");
            if placed {
                if let Err(cleanup) = ctx.delete_if_unreferenced(&fid, None).await {
                    tracing::warn!(%fid, error = %cleanup, "failed to remove file of failed upload");
                }
            }
            Err(e)
        }
    }
}

/// Attest on chain that this provider still holds the file behind `cid`.
pub async fn attest(ctx: &Context, cid: &Cid) -> Result<()> {
    let fid = {
        let conn = ctx.db.lock().await;
        contracts::get_fid(&conn, cid)?.ok_or_else(|| DbError::NotFound(cid.to_string()))?
    };
    if !ctx.archive.contains(&fid) {
        return Err(kennel_storage::StorageError::NotFound(fid.to_string()).into());
    }

    let msg = ChainMsg::Attest {
        creator: ctx.address.clone(),
        cid: cid.clone(),
    };
    ctx.queue.append(msg)?.wait().await?;
    tracing::info!(%cid, %fid, "attested");
    Ok(())
}
