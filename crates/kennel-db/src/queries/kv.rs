//! Ordered key/value primitives.

use rusqlite::{Connection, OptionalExtension};

use crate::{DbError, Result};

/// Get the value stored at `key`.
pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
        .optional()?)
}

/// Insert or replace `key`.
pub fn put(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

/// Insert `key` only if absent. Returns whether a row was written.
pub fn put_new(conn: &Connection, key: &str, value: &str) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(n == 1)
}

/// Append `item` plus a trailing comma to the list stored at `key`.
pub fn append_list(conn: &Connection, key: &str, item: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2 || ',')
         ON CONFLICT(key) DO UPDATE SET value = value || excluded.value",
        rusqlite::params![key, item],
    )?;
    Ok(())
}

/// Split a comma-joined list, skipping empty items.
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Delete `key`. Returns whether it existed.
pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
    Ok(n == 1)
}

/// Increment the decimal counter at `key`, treating absent or garbled
/// values as zero. Returns the new value.
pub fn increment(conn: &Connection, key: &str) -> Result<u32> {
    let value: String = conn.query_row(
        "INSERT INTO kv (key, value) VALUES (?1, '1')
         ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
         RETURNING value",
        [key],
        |row| row.get(0),
    )?;
    parse_counter(key, &value)
}

/// Decrement the decimal counter at `key`, saturating at zero.
///
/// An absent counter stays absent.
pub fn decrement(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "UPDATE kv SET value = CAST(MAX(CAST(value AS INTEGER) - 1, 0) AS TEXT) WHERE key = ?1",
        [key],
    )?;
    Ok(())
}

/// Read a decimal counter, defaulting to zero when absent.
pub fn counter(conn: &Connection, key: &str) -> Result<u32> {
    match get(conn, key)? {
        Some(value) => parse_counter(key, &value),
        None => Ok(0),
    }
}

fn parse_counter(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|e| DbError::Serialization(format!("counter {key}={value}: {e}")))
}

/// Every `(key, value)` whose key starts with `prefix`, in key order.
pub fn scan_prefix(conn: &Connection, prefix: &str) -> Result<Vec<(String, String)>> {
    let upper = prefix_upper_bound(prefix);
    let mut stmt = conn.prepare(
        "SELECT key, value FROM kv
         WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)
         ORDER BY key",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![prefix, upper], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
    Ok(rows)
}

/// Smallest string greater than every string starting with `prefix`, or
/// `None` when the prefix is empty or all `char::MAX`.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    #[test]
    fn test_put_get_delete() {
        let conn = test_db();
        assert_eq!(get(&conn, "a").expect("get"), None);
        put(&conn, "a", "1").expect("put");
        assert_eq!(get(&conn, "a").expect("get").as_deref(), Some("1"));
        assert!(delete(&conn, "a").expect("delete"));
        assert!(!delete(&conn, "a").expect("delete again"));
    }

    #[test]
    fn test_put_new_does_not_overwrite() {
        let conn = test_db();
        assert!(put_new(&conn, "a", "1").expect("put"));
        assert!(!put_new(&conn, "a", "2").expect("put"));
        assert_eq!(get(&conn, "a").expect("get").as_deref(), Some("1"));
    }

    #[test]
    fn test_append_list() {
        let conn = test_db();
        append_list(&conn, "l", "x").expect("append");
        append_list(&conn, "l", "y").expect("append");
        let value = get(&conn, "l").expect("get").expect("present");
        assert_eq!(value, "x,y,");
        assert_eq!(split_list(&value).collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_counter_increment_and_saturating_decrement() {
        let conn = test_db();
        assert_eq!(counter(&conn, "c").expect("counter"), 0);
        assert_eq!(increment(&conn, "c").expect("inc"), 1);
        assert_eq!(increment(&conn, "c").expect("inc"), 2);
        decrement(&conn, "c").expect("dec");
        decrement(&conn, "c").expect("dec");
        decrement(&conn, "c").expect("dec");
        assert_eq!(counter(&conn, "c").expect("counter"), 0);
        assert_eq!(get(&conn, "c").expect("get").as_deref(), Some("0"));
    }

    #[test]
    fn test_decrement_absent_stays_absent() {
        let conn = test_db();
        decrement(&conn, "missing").expect("dec");
        assert_eq!(get(&conn, "missing").expect("get"), None);
    }

    #[test]
    fn test_scan_prefix_bounds() {
        let conn = test_db();
        for key in ["FILE-a", "FILE-b", "FILE.", "FILF", "DWNT-a", "FILE"] {
            put(&conn, key, "v").expect("put");
        }
        let keys: Vec<String> = scan_prefix(&conn, "FILE-")
            .expect("scan")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["FILE-a", "FILE-b"]);
        assert_eq!(scan_prefix(&conn, "").expect("scan").len(), 6);
    }
}
