//! Contract index: CID to FID, FID to CIDs, and per-contract miss counters.

use std::collections::BTreeSet;

use kennel_types::{Cid, Fid};
use rusqlite::Connection;

use crate::queries::kv;
use crate::{DbError, Result};

/// Key prefix of the forward `cid -> fid` mapping.
pub const FILE_PREFIX: &str = "FILE-";

/// Key prefix of the consecutive-miss counter.
pub const MISS_PREFIX: &str = "DWNT-";

fn file_key(cid: &Cid) -> String {
    format!("{FILE_PREFIX}{cid}")
}

fn miss_key(cid: &Cid) -> String {
    format!("{MISS_PREFIX}{cid}")
}

fn parse_fid(raw: &str) -> Result<Fid> {
    Fid::parse(raw).map_err(|e| DbError::Serialization(format!("fid {raw}: {e}")))
}

/// Record a new contract for `fid`.
///
/// Fails with [`DbError::Exists`] if `cid` is already indexed.
pub fn put_contract(conn: &Connection, cid: &Cid, fid: &Fid) -> Result<()> {
    if !kv::put_new(conn, &file_key(cid), fid.as_str())? {
        return Err(DbError::Exists(cid.to_string()));
    }
    kv::append_list(conn, fid.as_str(), cid.as_str())?;
    kv::put(conn, &miss_key(cid), "0")?;
    tracing::debug!(%cid, %fid, "indexed contract");
    Ok(())
}

/// FID backing `cid`, if indexed.
pub fn get_fid(conn: &Connection, cid: &Cid) -> Result<Option<Fid>> {
    kv::get(conn, &file_key(cid))?
        .map(|raw| parse_fid(&raw))
        .transpose()
}

/// Live contracts that reference `fid`.
///
/// Reverse-list entries whose forward mapping is gone or points elsewhere
/// are skipped, as are duplicates.
pub fn get_cids(conn: &Connection, fid: &Fid) -> Result<Vec<Cid>> {
    let Some(list) = kv::get(conn, fid.as_str())? else {
        return Ok(Vec::new());
    };

    let mut seen = BTreeSet::new();
    let mut cids = Vec::new();
    for raw in kv::split_list(&list) {
        if !seen.insert(raw) {
            continue;
        }
        let Ok(cid) = Cid::parse(raw) else {
            tracing::warn!(%fid, entry = raw, "skipping malformed reverse-list entry");
            continue;
        };
        if get_fid(conn, &cid)?.as_ref() == Some(fid) {
            cids.push(cid);
        }
    }
    Ok(cids)
}

/// Whether any contract other than `except` still references `fid`.
pub fn is_referenced_elsewhere(conn: &Connection, fid: &Fid, except: &Cid) -> Result<bool> {
    Ok(get_cids(conn, fid)?.iter().any(|cid| cid != except))
}

/// Remove the forward mapping and miss counter of `cid`.
///
/// The reverse list is left alone. Returns whether the contract existed.
pub fn delete_contract(conn: &Connection, cid: &Cid) -> Result<bool> {
    let existed = kv::delete(conn, &file_key(cid))?;
    kv::delete(conn, &miss_key(cid))?;
    if existed {
        tracing::debug!(%cid, "removed contract");
    }
    Ok(existed)
}

/// Record one more consecutive miss. Returns the new count.
pub fn bump_miss(conn: &Connection, cid: &Cid) -> Result<u32> {
    kv::increment(conn, &miss_key(cid))
}

/// Forgive one miss, saturating at zero.
pub fn decay_miss(conn: &Connection, cid: &Cid) -> Result<()> {
    kv::decrement(conn, &miss_key(cid))
}

/// Current miss count; zero when no counter exists.
pub fn miss_count(conn: &Connection, cid: &Cid) -> Result<u32> {
    kv::counter(conn, &miss_key(cid))
}

/// Snapshot of every indexed `(cid, fid)` in key order.
///
/// Malformed entries are logged and skipped so one bad row cannot stall
/// the proof loop.
pub fn iterate_contracts(conn: &Connection) -> Result<Vec<(Cid, Fid)>> {
    let rows = kv::scan_prefix(conn, FILE_PREFIX)?;
    let mut contracts = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        let raw_cid = &key[FILE_PREFIX.len()..];
        match (Cid::parse(raw_cid), Fid::parse(&value)) {
            (Ok(cid), Ok(fid)) => contracts.push((cid, fid)),
            _ => tracing::warn!(%key, %value, "skipping malformed contract entry"),
        }
    }
    Ok(contracts)
}

/// Every FID referenced by at least one indexed contract.
pub fn referenced_fids(conn: &Connection) -> Result<BTreeSet<Fid>> {
    Ok(iterate_contracts(conn)?
        .into_iter()
        .map(|(_, fid)| fid)
        .collect())
}

/// Number of indexed contracts.
pub fn count(conn: &Connection) -> Result<usize> {
    Ok(kv::scan_prefix(conn, FILE_PREFIX)?.len())
}
