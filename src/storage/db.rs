//! Persistence adapter: three logical tables —
//! `cache_index`, `cache_thread`, `cache_messages` — each keyed on
//! `(user_id, mailbox[, uid])`, all writes via insert-or-update on the
//! compound key.

use anyhow::{Context, Result};
use dirs::home_dir;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

const DB_FILE_NAME: &str = "foldercache.db";

/// A raw, still-encoded index row as persisted.
#[derive(Clone, Debug)]
pub struct RawIndexRow {
    pub data: String,
    pub valid: bool,
    pub expires: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct RawThreadRow {
    pub data: String,
    pub expires: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct RawMessageRow {
    pub uid: u32,
    pub data: String,
    pub flags: u32,
    pub expires: Option<i64>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    pub async fn new_default() -> Result<Self> {
        Self::new_named(DB_FILE_NAME).await
    }

    pub async fn new_named(file_name: &str) -> Result<Self> {
        let base = default_data_dir()?;
        let db_path = base.join(file_name);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let db = Database {
            pool,
            path: Some(db_path),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// An ephemeral, process-local database — used by tests and by
    /// short-lived tooling that does not need durability across restarts.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .context("connecting to in-memory sqlite")?;
        let db = Database { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    /// Wraps an already-open pool, e.g. one obtained from another
    /// `Database` via [`Database::pool`] so a second adapter instance can
    /// observe rows the first one wrote. `migrate` is idempotent, so
    /// re-running it here is harmless.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let db = Database { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_index (
                user_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                expires INTEGER,
                valid INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, mailbox)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating cache_index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_index_expires ON cache_index(expires);")
            .execute(&self.pool)
            .await
            .context("indexing cache_index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_thread (
                user_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                expires INTEGER,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, mailbox)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating cache_thread")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_thread_expires ON cache_thread(expires);",
        )
        .execute(&self.pool)
        .await
        .context("indexing cache_thread")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_messages (
                user_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                flags INTEGER NOT NULL,
                expires INTEGER,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, mailbox, uid)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating cache_messages")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_messages_expires ON cache_messages(expires);",
        )
        .execute(&self.pool)
        .await
        .context("indexing cache_messages")?;

        Ok(())
    }

    // ---- index ----------------------------------------------------------

    pub async fn select_index(&self, user_id: &str, mailbox: &str) -> Result<Option<RawIndexRow>> {
        let row = sqlx::query(
            "SELECT data, valid, expires FROM cache_index WHERE user_id = ?1 AND mailbox = ?2",
        )
        .bind(user_id)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await
        .context("selecting index row")?;

        Ok(row.map(|r| RawIndexRow {
            data: r.get(0),
            valid: r.get::<i64, _>(1) != 0,
            expires: r.get(2),
        }))
    }

    pub async fn upsert_index(
        &self,
        user_id: &str,
        mailbox: &str,
        data: &str,
        valid: bool,
        expires: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_index (user_id, mailbox, expires, valid, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id, mailbox) DO UPDATE SET
                expires = excluded.expires,
                valid = excluded.valid,
                data = excluded.data;
            "#,
        )
        .bind(user_id)
        .bind(mailbox)
        .bind(expires)
        .bind(if valid { 1 } else { 0 })
        .bind(data)
        .execute(&self.pool)
        .await
        .context("upserting index row")?;
        Ok(())
    }

    /// Flips `valid` to `0` in place, preserving `HIGHESTMODSEQ` in the
    /// still-encoded `data` blob.
    pub async fn set_index_invalid(&self, user_id: &str, mailbox: Option<&str>) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE cache_index SET valid = 0 WHERE user_id = ");
        qb.push_bind(user_id);
        if let Some(mailbox) = mailbox {
            qb.push(" AND mailbox = ");
            qb.push_bind(mailbox);
        }
        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("invalidating index row(s)")?;
        Ok(res.rows_affected())
    }

    pub async fn delete_index(&self, user_id: &str, mailbox: Option<&str>) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM cache_index WHERE user_id = ");
        qb.push_bind(user_id);
        if let Some(mailbox) = mailbox {
            qb.push(" AND mailbox = ");
            qb.push_bind(mailbox);
        }
        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("deleting index row(s)")?;
        Ok(res.rows_affected())
    }

    // ---- thread -----------------------------------------------------------

    pub async fn select_thread(
        &self,
        user_id: &str,
        mailbox: &str,
    ) -> Result<Option<RawThreadRow>> {
        let row = sqlx::query(
            "SELECT data, expires FROM cache_thread WHERE user_id = ?1 AND mailbox = ?2",
        )
        .bind(user_id)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await
        .context("selecting thread row")?;

        Ok(row.map(|r| RawThreadRow {
            data: r.get(0),
            expires: r.get(1),
        }))
    }

    pub async fn upsert_thread(
        &self,
        user_id: &str,
        mailbox: &str,
        data: &str,
        expires: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_thread (user_id, mailbox, expires, data)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, mailbox) DO UPDATE SET
                expires = excluded.expires,
                data = excluded.data;
            "#,
        )
        .bind(user_id)
        .bind(mailbox)
        .bind(expires)
        .bind(data)
        .execute(&self.pool)
        .await
        .context("upserting thread row")?;
        Ok(())
    }

    /// Thread rows are always physically deleted.
    pub async fn delete_thread(&self, user_id: &str, mailbox: Option<&str>) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM cache_thread WHERE user_id = ");
        qb.push_bind(user_id);
        if let Some(mailbox) = mailbox {
            qb.push(" AND mailbox = ");
            qb.push_bind(mailbox);
        }
        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("deleting thread row(s)")?;
        Ok(res.rows_affected())
    }

    // ---- messages -----------------------------------------------------

    pub async fn select_message(
        &self,
        user_id: &str,
        mailbox: &str,
        uid: u32,
    ) -> Result<Option<RawMessageRow>> {
        let row = sqlx::query(
            "SELECT uid, data, flags, expires FROM cache_messages
             WHERE user_id = ?1 AND mailbox = ?2 AND uid = ?3",
        )
        .bind(user_id)
        .bind(mailbox)
        .bind(uid as i64)
        .fetch_optional(&self.pool)
        .await
        .context("selecting message row")?;

        Ok(row.map(row_to_message))
    }

    pub async fn select_messages(
        &self,
        user_id: &str,
        mailbox: &str,
        uids: &[u32],
    ) -> Result<Vec<RawMessageRow>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT uid, data, flags, expires FROM cache_messages WHERE user_id = ",
        );
        qb.push_bind(user_id);
        qb.push(" AND mailbox = ");
        qb.push_bind(mailbox);
        qb.push(" AND uid IN (");
        {
            let mut separated = qb.separated(", ");
            for uid in uids {
                separated.push_bind(*uid as i64);
            }
        }
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("selecting message rows")?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn select_all_uids(&self, user_id: &str, mailbox: &str) -> Result<Vec<u32>> {
        let rows = sqlx::query("SELECT uid FROM cache_messages WHERE user_id = ?1 AND mailbox = ?2")
            .bind(user_id)
            .bind(mailbox)
            .fetch_all(&self.pool)
            .await
            .context("selecting all message uids")?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>(0) as u32)
            .collect())
    }

    /// Upserts a message row, returning whether it previously existed
    /// (`exists_in_store`). Runs inside one transaction so the
    /// insert-then-update decision is atomic: two concurrent sessions
    /// writing the same `(user, folder, uid)` cannot both observe "new".
    pub async fn upsert_message(
        &self,
        user_id: &str,
        mailbox: &str,
        uid: u32,
        data: &str,
        flags: u32,
        expires: Option<i64>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("beginning upsert tx")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO cache_messages (user_id, mailbox, uid, flags, expires, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, mailbox, uid) DO NOTHING;
            "#,
        )
        .bind(user_id)
        .bind(mailbox)
        .bind(uid as i64)
        .bind(flags as i64)
        .bind(expires)
        .bind(data)
        .execute(&mut *tx)
        .await
        .context("inserting message row")?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query(
                r#"
                UPDATE cache_messages
                SET flags = ?1, expires = ?2, data = ?3
                WHERE user_id = ?4 AND mailbox = ?5 AND uid = ?6;
                "#,
            )
            .bind(flags as i64)
            .bind(expires)
            .bind(data)
            .bind(user_id)
            .bind(mailbox)
            .bind(uid as i64)
            .execute(&mut *tx)
            .await
            .context("updating message row")?;
        }

        tx.commit().await.context("committing upsert tx")?;
        Ok(!inserted)
    }

    /// Conditional flag update: only writes when the
    /// stored bitmap differs, avoiding a no-op write.
    pub async fn update_message_flags_if_changed(
        &self,
        user_id: &str,
        mailbox: &str,
        uid: u32,
        new_flags: u32,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE cache_messages SET flags = ?1
            WHERE user_id = ?2 AND mailbox = ?3 AND uid = ?4 AND flags <> ?1;
            "#,
        )
        .bind(new_flags as i64)
        .bind(user_id)
        .bind(mailbox)
        .bind(uid as i64)
        .execute(&self.pool)
        .await
        .context("conditionally updating message flags")?;
        Ok(res.rows_affected() > 0)
    }

    /// Guarded bitmap toggle: adds or subtracts
    /// `bit` and only touches rows where doing so is not already a no-op.
    pub async fn toggle_message_flag(
        &self,
        user_id: &str,
        mailbox: &str,
        uids: &[u32],
        bit: u32,
        enabled: bool,
    ) -> Result<u64> {
        if uids.is_empty() {
            return Ok(0);
        }

        let op = if enabled {
            format!("flags | {bit}")
        } else {
            format!("flags & ~{bit}")
        };
        let guard_value = if enabled { 0 } else { bit as i64 };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE cache_messages SET flags = ");
        qb.push(op);
        qb.push(" WHERE user_id = ");
        qb.push_bind(user_id);
        qb.push(" AND mailbox = ");
        qb.push_bind(mailbox);
        qb.push(" AND (flags & ");
        qb.push_bind(bit as i64);
        qb.push(") = ");
        qb.push_bind(guard_value);
        qb.push(" AND uid IN (");
        {
            let mut separated = qb.separated(", ");
            for uid in uids {
                separated.push_bind(*uid as i64);
            }
        }
        qb.push(")");

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("toggling message flag")?;
        Ok(res.rows_affected())
    }

    pub async fn delete_messages(
        &self,
        user_id: &str,
        mailbox: Option<&str>,
        uids: Option<&[u32]>,
    ) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM cache_messages WHERE user_id = ");
        qb.push_bind(user_id);
        if let Some(mailbox) = mailbox {
            qb.push(" AND mailbox = ");
            qb.push_bind(mailbox);
        }
        if let Some(uids) = uids {
            if uids.is_empty() {
                return Ok(0);
            }
            qb.push(" AND uid IN (");
            {
                let mut separated = qb.separated(", ");
                for uid in uids {
                    separated.push_bind(*uid as i64);
                }
            }
            qb.push(")");
        }

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("deleting message row(s)")?;
        Ok(res.rows_affected())
    }

    /// Static garbage-collection sweep: deletes rows
    /// whose `expires` has passed, across all three tables. Takes
    /// `&Database` explicitly rather than a process-wide singleton, so it
    /// is safe to call alongside live `Cache` sessions and easy to exercise
    /// against a throwaway store in tests.
    /// Counts rows `gc_expired` would delete, without deleting them —
    /// used by the gc tool's `--dry-run` mode.
    pub async fn count_expired(&self, now: i64) -> Result<u64> {
        let mut total = 0u64;
        for table in ["cache_index", "cache_thread", "cache_messages"] {
            let sql = format!(
                "SELECT COUNT(*) FROM {table} WHERE expires IS NOT NULL AND expires < ?1"
            );
            let count: i64 = sqlx::query_scalar(&sql)
                .bind(now)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("counting expired rows in {table}"))?;
            total += count as u64;
        }
        Ok(total)
    }

    pub async fn gc_expired(&self, now: i64) -> Result<u64> {
        let mut total = 0u64;
        for table in ["cache_index", "cache_thread", "cache_messages"] {
            let sql = format!("DELETE FROM {table} WHERE expires IS NOT NULL AND expires < ?1");
            let res = sqlx::query(&sql)
                .bind(now)
                .execute(&self.pool)
                .await
                .with_context(|| format!("gc sweep on {table}"))?;
            total += res.rows_affected();
        }
        if total > 0 {
            warn!(deleted = total, "gc swept expired cache rows");
        }
        Ok(total)
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> RawMessageRow {
    RawMessageRow {
        uid: row.get::<i64, _>(0) as u32,
        data: row.get(1),
        flags: row.get::<i64, _>(2) as u32,
        expires: row.get(3),
    }
}

fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("FOLDERCACHE_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating FOLDERCACHE_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join(".foldercache");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        warn!(
            "unable to create {}/.foldercache; falling back to workspace-local storage",
            home.display()
        );
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("foldercache-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn index_round_trips_and_invalidates() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_index("u1", "INBOX", "blob-a", true, Some(100))
            .await
            .unwrap();
        let row = db.select_index("u1", "INBOX").await.unwrap().unwrap();
        assert_eq!(row.data, "blob-a");
        assert!(row.valid);

        db.set_index_invalid("u1", Some("INBOX")).await.unwrap();
        let row = db.select_index("u1", "INBOX").await.unwrap().unwrap();
        assert!(!row.valid);
        assert_eq!(row.data, "blob-a", "invalidate must not drop the blob");
    }

    #[tokio::test]
    async fn message_upsert_reports_new_vs_existing() {
        let db = Database::new_in_memory().await.unwrap();
        let was_existing = db
            .upsert_message("u1", "INBOX", 9, "blob", 1, None)
            .await
            .unwrap();
        assert!(!was_existing);

        let was_existing = db
            .upsert_message("u1", "INBOX", 9, "blob2", 3, None)
            .await
            .unwrap();
        assert!(was_existing);

        let row = db.select_message("u1", "INBOX", 9).await.unwrap().unwrap();
        assert_eq!(row.data, "blob2");
        assert_eq!(row.flags, 3);
    }

    #[tokio::test]
    async fn toggle_flag_is_guarded_against_no_ops() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_message("u1", "INBOX", 1, "blob", 0, None)
            .await
            .unwrap();
        db.upsert_message("u1", "INBOX", 2, "blob", 1, None)
            .await
            .unwrap();

        let touched = db
            .toggle_message_flag("u1", "INBOX", &[1, 2], 1, true)
            .await
            .unwrap();
        assert_eq!(touched, 1, "uid 2 already had the bit set");

        let row1 = db.select_message("u1", "INBOX", 1).await.unwrap().unwrap();
        assert_eq!(row1.flags, 1);
    }

    #[tokio::test]
    async fn gc_expired_sweeps_all_three_tables() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_index("u1", "INBOX", "blob", true, Some(10))
            .await
            .unwrap();
        db.upsert_thread("u1", "INBOX", "blob", Some(10))
            .await
            .unwrap();
        db.upsert_message("u1", "INBOX", 1, "blob", 0, Some(10))
            .await
            .unwrap();

        let deleted = db.gc_expired(100).await.unwrap();
        assert_eq!(deleted, 3);
        assert!(db.select_index("u1", "INBOX").await.unwrap().is_none());
        assert!(db.select_thread("u1", "INBOX").await.unwrap().is_none());
        assert!(db.select_message("u1", "INBOX", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gc_expired_retains_rows_with_no_expiry() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_index("u1", "INBOX", "blob", true, None)
            .await
            .unwrap();
        db.upsert_message("u1", "INBOX", 1, "blob", 0, Some(10))
            .await
            .unwrap();

        let deleted = db.gc_expired(100).await.unwrap();
        assert_eq!(deleted, 1, "only the expiring message row is swept");
        assert!(db.select_index("u1", "INBOX").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn toggling_an_already_set_flag_twice_is_a_no_op_second_time() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_message("u1", "INBOX", 1, "blob", 0, None)
            .await
            .unwrap();

        let first = db
            .toggle_message_flag("u1", "INBOX", &[1], 1, true)
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = db
            .toggle_message_flag("u1", "INBOX", &[1], 1, true)
            .await
            .unwrap();
        assert_eq!(second, 0, "the bit is already set, so the guarded UPDATE touches nothing");

        let row = db.select_message("u1", "INBOX", 1).await.unwrap().unwrap();
        assert_eq!(row.flags, 1);
    }
}
