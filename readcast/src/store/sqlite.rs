//! SQLite-backed store.
//!
//! Entries live in `kv_entries` with an absolute expiry in Unix epoch
//! milliseconds. Expired rows are invisible to reads and removed by
//! [`KeyValueStore::purge_expired`].

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};

use super::KeyValueStore;
use crate::Result;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Initialize the connection pool with WAL mode.
///
/// In-memory databases are private to a connection, so they get a single
/// connection that is never recycled.
pub async fn init_pool(database_url: &str) -> std::result::Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .create_if_missing(true);

    let mut pool_options = SqlitePoolOptions::new()
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        });

    pool_options = if is_memory_url(database_url) {
        pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(DEFAULT_POOL_SIZE)
    };

    let pool = pool_options.connect_with(connect_options).await?;

    tracing::info!(database_url, "Store pool initialized");
    Ok(pool)
}

/// Run the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running store migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Store migrations completed");
    Ok(())
}

/// Persistent key-value store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open the database, apply migrations and wrap the pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms().saturating_add(ttl_ms)
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_entries WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(now_ms())
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let expires_at: Option<i64> =
            sqlx::query_scalar("DELETE FROM kv_entries WHERE key = ? RETURNING expires_at")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(expires_at.is_some_and(|ts| ts > now_ms()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM kv_entries WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key FROM kv_entries WHERE key GLOB ? AND expires_at > ? ORDER BY key",
        )
        .bind(pattern)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("key")).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyValueStoreExt;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let store = memory_store().await;
        store
            .set_with_ttl("k", Duration::from_secs(60), "one")
            .await
            .unwrap();
        store
            .set_with_ttl("k", Duration::from_secs(60), "two")
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_live_entries_only() {
        let store = memory_store().await;
        store
            .set_with_ttl("live", Duration::from_secs(60), "x")
            .await
            .unwrap();
        store
            .set_with_ttl("dead", Duration::ZERO, "x")
            .await
            .unwrap();

        assert!(store.delete("live").await.unwrap());
        assert!(!store.delete("dead").await.unwrap());
        assert!(!store.delete("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible_and_purged() {
        let store = memory_store().await;
        store
            .set_with_ttl("gone", Duration::ZERO, "x")
            .await
            .unwrap();
        store
            .set_with_ttl("kept", Duration::from_secs(60), "y")
            .await
            .unwrap();

        assert!(store.get("gone").await.unwrap().is_none());
        assert!(!store.exists("gone").await.unwrap());
        assert_eq!(store.keys_matching("*").await.unwrap(), vec!["kept"]);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_glob_patterns() {
        let store = memory_store().await;
        for key in ["metrics:a:1", "metrics:b", "subject_progress:u1", "subject_progress:u22"] {
            store
                .set_with_ttl(key, Duration::from_secs(60), "v")
                .await
                .unwrap();
        }

        assert_eq!(
            store.keys_matching("metrics:*").await.unwrap(),
            vec!["metrics:a:1", "metrics:b"]
        );
        assert_eq!(
            store.keys_matching("subject_progress:u?").await.unwrap(),
            vec!["subject_progress:u1"]
        );
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_pools() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("store.db").display());

        {
            let store = SqliteStore::connect(&url).await.unwrap();
            store
                .set_json("subject_schedule:s1", Duration::from_secs(60), &vec![1, 2, 3])
                .await
                .unwrap();
            store.pool().close().await;
        }

        let store = SqliteStore::connect(&url).await.unwrap();
        let loaded: Option<Vec<u32>> = store.get_json("subject_schedule:s1").await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
        assert!(store.ping().await.is_ok());
    }
}
