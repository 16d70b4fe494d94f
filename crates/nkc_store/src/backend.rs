//! Storage engine contract and implementations.
//!
//! A backend stores opaque rows: it only ever sees record envelopes (base64
//! ciphertext) plus plaintext sort keys. Encryption happens one layer up in
//! [`crate::repo::EncryptedStore`].
//!
//! - [`SqliteBackend`] - sqlx SQLite, migrations run on open
//! - [`MemoryBackend`] - in-process maps, for tests and ephemeral sessions

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::Row;

use crate::error::StoreError;

/// Independently encrypted record families. The family name is also the
/// record type bound into each envelope's AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordFamily {
    Profile,
    Conversation,
    Message,
    Event,
    MediaChunk,
    Contact,
    Approval,
    Outbox,
    Ratchet,
}

impl RecordFamily {
    pub const ALL: [RecordFamily; 9] = [
        RecordFamily::Profile,
        RecordFamily::Conversation,
        RecordFamily::Message,
        RecordFamily::Event,
        RecordFamily::MediaChunk,
        RecordFamily::Contact,
        RecordFamily::Approval,
        RecordFamily::Outbox,
        RecordFamily::Ratchet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Conversation => "conversation",
            Self::Message => "message",
            Self::Event => "event",
            Self::MediaChunk => "media_chunk",
            Self::Contact => "contact",
            Self::Approval => "approval",
            Self::Outbox => "outbox",
            Self::Ratchet => "ratchet",
        }
    }
}

/// One stored row. `data` is a record envelope; `scope`/`seq` are the
/// plaintext sort keys (e.g. log id + Lamport value, owner + chunk index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: String,
    pub scope: Option<String>,
    pub seq: i64,
    pub data: String,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace by `(family, row.id)`.
    async fn save(&self, family: RecordFamily, row: StoredRow) -> Result<(), StoreError>;

    async fn get(&self, family: RecordFamily, id: &str) -> Result<Option<StoredRow>, StoreError>;

    /// Rows of a family ordered by `(scope, seq, id)`. With `scope`, only that
    /// scope; with `after_seq`, only rows whose `seq` is greater.
    async fn list(
        &self,
        family: RecordFamily,
        scope: Option<&str>,
        after_seq: Option<i64>,
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Returns whether a row was removed.
    async fn delete(&self, family: RecordFamily, id: &str) -> Result<bool, StoreError>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Write all rows and metadata entries in one transaction: either every
    /// write lands or none does.
    async fn commit_batch(
        &self,
        rows: Vec<(RecordFamily, StoredRow)>,
        meta: Vec<(String, String)>,
    ) -> Result<(), StoreError>;
}

// ── SQLite ───────────────────────────────────────────────────────────────────

/// SQLite engine. Cheap to clone (pool is Arc internally).
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection, not in a migration: SQLite refuses
    /// to change `journal_mode` inside the transaction sqlx wraps migrations in.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool })
    }

    fn row_from(r: &sqlx::sqlite::SqliteRow) -> Result<StoredRow, StoreError> {
        Ok(StoredRow {
            id: r.try_get("id")?,
            scope: r.try_get("scope")?,
            seq: r.try_get("seq")?,
            data: r.try_get("data")?,
        })
    }
}

const UPSERT_SQL: &str = "INSERT INTO records (family, id, scope, seq, data, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?) \
     ON CONFLICT(family, id) DO UPDATE SET \
       scope = excluded.scope, seq = excluded.seq, data = excluded.data, updated_at = excluded.updated_at";

const META_UPSERT_SQL: &str =
    "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value";

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn save(&self, family: RecordFamily, row: StoredRow) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SQL)
            .bind(family.as_str())
            .bind(&row.id)
            .bind(&row.scope)
            .bind(row.seq)
            .bind(&row.data)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, family: RecordFamily, id: &str) -> Result<Option<StoredRow>, StoreError> {
        let row = sqlx::query("SELECT id, scope, seq, data FROM records WHERE family = ? AND id = ?")
            .bind(family.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_from).transpose()
    }

    async fn list(
        &self,
        family: RecordFamily,
        scope: Option<&str>,
        after_seq: Option<i64>,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, scope, seq, data FROM records \
             WHERE family = ?1 \
               AND (?2 IS NULL OR scope = ?2) \
               AND (?3 IS NULL OR seq > ?3) \
             ORDER BY scope, seq, id",
        )
        .bind(family.as_str())
        .bind(scope)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_from).collect()
    }

    async fn delete(&self, family: RecordFamily, id: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM records WHERE family = ? AND id = ?")
            .bind(family.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(META_UPSERT_SQL)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_batch(
        &self,
        rows: Vec<(RecordFamily, StoredRow)>,
        meta: Vec<(String, String)>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for (family, row) in &rows {
            sqlx::query(UPSERT_SQL)
                .bind(family.as_str())
                .bind(&row.id)
                .bind(&row.scope)
                .bind(row.seq)
                .bind(&row.data)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        for (key, value) in &meta {
            sqlx::query(META_UPSERT_SQL)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    records: HashMap<RecordFamily, BTreeMap<String, StoredRow>>,
    meta: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn save(&self, family: RecordFamily, row: StoredRow) -> Result<(), StoreError> {
        self.inner
            .lock()
            .records
            .entry(family)
            .or_default()
            .insert(row.id.clone(), row);
        Ok(())
    }

    async fn get(&self, family: RecordFamily, id: &str) -> Result<Option<StoredRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&family)
            .and_then(|m| m.get(id).cloned()))
    }

    async fn list(
        &self,
        family: RecordFamily,
        scope: Option<&str>,
        after_seq: Option<i64>,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let inner = self.inner.lock();
        let mut rows: Vec<StoredRow> = inner
            .records
            .get(&family)
            .map(|m| {
                m.values()
                    .filter(|r| scope.map_or(true, |s| r.scope.as_deref() == Some(s)))
                    .filter(|r| after_seq.map_or(true, |a| r.seq > a))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| (&a.scope, a.seq, &a.id).cmp(&(&b.scope, b.seq, &b.id)));
        Ok(rows)
    }

    async fn delete(&self, family: RecordFamily, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .records
            .get_mut(&family)
            .and_then(|m| m.remove(id))
            .is_some())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.lock().meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn commit_batch(
        &self,
        rows: Vec<(RecordFamily, StoredRow)>,
        meta: Vec<(String, String)>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for (family, row) in rows {
            inner.records.entry(family).or_default().insert(row.id.clone(), row);
        }
        inner.meta.extend(meta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, scope: &str, seq: i64) -> StoredRow {
        StoredRow {
            id: id.into(),
            scope: Some(scope.into()),
            seq,
            data: format!("data-{id}"),
        }
    }

    async fn exercise(backend: &dyn StorageBackend) {
        backend.save(RecordFamily::Event, row("e3", "dm:c1", 3)).await.unwrap();
        backend.save(RecordFamily::Event, row("e1", "dm:c1", 1)).await.unwrap();
        backend.save(RecordFamily::Event, row("e2", "dm:c2", 2)).await.unwrap();

        let c1 = backend.list(RecordFamily::Event, Some("dm:c1"), None).await.unwrap();
        assert_eq!(c1.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["e1", "e3"]);

        let after = backend.list(RecordFamily::Event, Some("dm:c1"), Some(1)).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "e3");

        assert!(backend.get(RecordFamily::Message, "e1").await.unwrap().is_none());
        assert!(backend.delete(RecordFamily::Event, "e1").await.unwrap());
        assert!(!backend.delete(RecordFamily::Event, "e1").await.unwrap());

        backend.set_meta("k", "v1").await.unwrap();
        backend.set_meta("k", "v2").await.unwrap();
        assert_eq!(backend.get_meta("k").await.unwrap().as_deref(), Some("v2"));

        backend
            .commit_batch(
                vec![(RecordFamily::Profile, row("p", "x", 0))],
                vec![("k".into(), "v3".into())],
            )
            .await
            .unwrap();
        assert!(backend.get(RecordFamily::Profile, "p").await.unwrap().is_some());
        assert_eq!(backend.get_meta("k").await.unwrap().as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn memory_backend_contract() {
        exercise(&MemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn sqlite_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("nkc.db")).await.unwrap();
        exercise(&backend).await;
    }
}
