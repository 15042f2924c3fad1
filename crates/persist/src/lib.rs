//! Nimbus relational mirror: a SQLite projection of canonical records used
//! only for filtering. Never the source of truth; rebuildable from the KV store.
//! Keep code small and predictable.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use nimbus_core::{Predicate, ResourceKind, ResourceRecord};
use rusqlite::types::Value as SqlValue;
use tracing::debug;

pub trait Mirror: Send + Sync {
    /// Insert or replace the row for `(namespace, kind, id)`.
    fn upsert(&self, rec: &ResourceRecord) -> Result<()>;
    /// Returns whether a row was removed.
    fn delete(&self, namespace: &str, kind: ResourceKind, id: &str) -> Result<bool>;
    /// Rows of one kind in a namespace satisfying every predicate, ordered by id.
    fn query(&self, namespace: &str, kind: ResourceKind, preds: &[Predicate]) -> Result<Vec<ResourceRecord>>;
    /// Swap all rows of `(namespace, kind)` for `recs` in one transaction.
    fn replace_all(&self, namespace: &str, kind: ResourceKind, recs: &[ResourceRecord]) -> Result<usize>;
}

/// SQLite-backed mirror. Synchronous; calls are short.
pub struct SqliteMirror {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteMirror {
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                namespace       TEXT NOT NULL,
                kind            TEXT NOT NULL,
                id              TEXT NOT NULL,
                name            TEXT NOT NULL,
                connection_name TEXT NOT NULL,
                body            TEXT NOT NULL,
                updated_ts      INTEGER NOT NULL,
                PRIMARY KEY (namespace, kind, id)
            )",
            [],
        )
        .context("creating resources table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_resources_conn ON resources(namespace, kind, connection_name)", [])
            .ok();
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "mirror: opened");
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("mirror connection mutex poisoned"))
    }
}

const UPSERT_SQL: &str = "INSERT INTO resources(namespace, kind, id, name, connection_name, body, updated_ts)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(namespace, kind, id) DO UPDATE SET
        name = excluded.name,
        connection_name = excluded.connection_name,
        body = excluded.body,
        updated_ts = excluded.updated_ts";

fn upsert_row(db: &rusqlite::Connection, rec: &ResourceRecord) -> Result<()> {
    let body = serde_json::to_string(rec).context("encoding mirror row")?;
    db.execute(
        UPSERT_SQL,
        (&rec.namespace, rec.kind.as_str(), &rec.id, &rec.name, &rec.connection_name, &body, now_ts()),
    )
    .with_context(|| format!("upserting {}/{}/{}", rec.namespace, rec.kind, rec.id))?;
    Ok(())
}

/// Escape LIKE metacharacters; paired with `ESCAPE '\'`.
fn like_pattern(needle: &str) -> String {
    let mut s = String::with_capacity(needle.len() + 2);
    s.push('%');
    for c in needle.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            s.push('\\');
        }
        s.push(c);
    }
    s.push('%');
    s
}

/// Build the WHERE tail for `preds`. Field names come from static tables only.
fn where_clause(preds: &[Predicate], params: &mut Vec<SqlValue>) -> String {
    let mut sql = String::new();
    for p in preds {
        let path = format!("'$.\"{}\"'", p.field());
        params.push(match p {
            Predicate::Like { needle, .. } => SqlValue::Text(like_pattern(needle)),
            Predicate::AtLeast { value, .. } | Predicate::AtMost { value, .. } => SqlValue::Real(*value),
        });
        let n = params.len();
        let clause = match p {
            Predicate::Like { .. } => {
                format!(" AND LOWER(CAST(json_extract(body, {}) AS TEXT)) LIKE ?{} ESCAPE '\\'", path, n)
            }
            Predicate::AtLeast { .. } => {
                format!(" AND COALESCE(CAST(json_extract(body, {}) AS REAL), 0) >= ?{}", path, n)
            }
            Predicate::AtMost { .. } => {
                format!(" AND COALESCE(CAST(json_extract(body, {}) AS REAL), 0) <= ?{}", path, n)
            }
        };
        sql.push_str(&clause);
    }
    sql
}

impl Mirror for SqliteMirror {
    fn upsert(&self, rec: &ResourceRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        upsert_row(&db, rec)?;
        histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_upsert_total", 1u64);
        Ok(())
    }

    fn delete(&self, namespace: &str, kind: ResourceKind, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db
            .execute("DELETE FROM resources WHERE namespace = ?1 AND kind = ?2 AND id = ?3", (namespace, kind.as_str(), id))
            .with_context(|| format!("deleting {}/{}/{}", namespace, kind, id))?;
        Ok(n > 0)
    }

    fn query(&self, namespace: &str, kind: ResourceKind, preds: &[Predicate]) -> Result<Vec<ResourceRecord>> {
        let started = std::time::Instant::now();
        let mut params = vec![SqlValue::Text(namespace.to_string()), SqlValue::Text(kind.as_str().to_string())];
        let tail = where_clause(preds, &mut params);
        let sql = format!("SELECT body FROM resources WHERE namespace = ?1 AND kind = ?2{} ORDER BY id", tail);
        debug!(sql = %sql, "mirror: query");
        let db = self.conn()?;
        let mut stmt = db.prepare(&sql).context("preparing mirror query")?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            let rec: ResourceRecord = serde_json::from_str(&body).context("decoding mirror row")?;
            out.push(rec);
        }
        histogram!("persist_query_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn replace_all(&self, namespace: &str, kind: ResourceKind, recs: &[ResourceRecord]) -> Result<usize> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM resources WHERE namespace = ?1 AND kind = ?2", (namespace, kind.as_str()))?;
        for rec in recs {
            upsert_row(&tx, rec)?;
        }
        tx.commit()?;
        counter!("persist_rebuild_total", 1u64);
        Ok(recs.len())
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".nimbus");
        let _ = std::fs::create_dir_all(&p);
        p.push("nimbus.db");
        return p.to_string_lossy().to_string();
    }
    "nimbus.db".to_string()
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::FilterCriteria;

    fn spec(id: &str, vcpu: u64, provider: &str) -> ResourceRecord {
        let mut r = ResourceRecord::new(ResourceKind::Spec, id)
            .with("vCPU", vcpu)
            .with("providerName", provider);
        r.namespace = "ns01".into();
        r.id = id.into();
        r.connection_name = format!("{}-conn", provider);
        r
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let m = SqliteMirror::open_in_memory().unwrap();
        m.upsert(&spec("a", 2, "aws")).unwrap();
        m.upsert(&spec("a", 4, "aws")).unwrap();
        let rows = m.query("ns01", ResourceKind::Spec, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].num_attr("vCPU"), 4.0);
    }

    #[test]
    fn range_and_substring_are_conjunctive() {
        let m = SqliteMirror::open_in_memory().unwrap();
        for (id, v, p) in [("a", 2, "aws"), ("b", 4, "aws"), ("c", 8, "gcp"), ("d", 16, "aws")] {
            m.upsert(&spec(id, v, p)).unwrap();
        }
        let preds = FilterCriteria::new()
            .range("vCPU", 4.0, 16.0)
            .contains("providerName", "AW")
            .compile(ResourceKind::Spec)
            .unwrap();
        let ids: Vec<String> = m.query("ns01", ResourceKind::Spec, &preds).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn like_metacharacters_are_literal() {
        let m = SqliteMirror::open_in_memory().unwrap();
        m.upsert(&spec("a", 2, "aws")).unwrap();
        let preds = FilterCriteria::new().contains("providerName", "%").compile(ResourceKind::Spec).unwrap();
        assert!(m.query("ns01", ResourceKind::Spec, &preds).unwrap().is_empty());
    }

    #[test]
    fn replace_all_drops_stale_rows() {
        let m = SqliteMirror::open_in_memory().unwrap();
        m.upsert(&spec("stale", 2, "aws")).unwrap();
        let n = m.replace_all("ns01", ResourceKind::Spec, &[spec("a", 2, "aws"), spec("b", 2, "aws")]).unwrap();
        assert_eq!(n, 2);
        let ids: Vec<String> = m.query("ns01", ResourceKind::Spec, &[]).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(m.delete("ns01", ResourceKind::Spec, "a").unwrap());
        assert!(!m.delete("ns01", ResourceKind::Spec, "a").unwrap());
    }
}
