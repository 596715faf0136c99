//! SQLite store: owns the single connection and every statement that runs on it

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row, TransactionBehavior};
use tokio::sync::Mutex;

use super::retry::RetryExhausted;
use super::schema::{self, Migration};
use super::{MutationResult, Statement, StoreConfig, StoreError, StoreResult};

/// Opens the underlying connection. The store calls this at most once per
/// successful initialization.
pub trait Connector: Send + Sync {
    fn open(&self) -> rusqlite::Result<Connection>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Database file on disk (created if missing)
#[derive(Debug, Clone)]
pub struct FileConnector {
    path: PathBuf,
}

impl FileConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connector for FileConnector {
    fn open(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Private in-memory database (for testing)
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryConnector;

impl Connector for MemoryConnector {
    fn open(&self) -> rusqlite::Result<Connection> {
        Connection::open_in_memory()
    }

    fn describe(&self) -> String {
        ":memory:".to_string()
    }
}

/// Process-scoped owner of the marker database.
///
/// Every entry point initializes lazily: the connection is opened and migrated
/// on first use, and concurrent first callers share one initialization.
pub struct Store {
    connector: Box<dyn Connector>,
    config: StoreConfig,
    migrations: Vec<Migration>,
    conn: OnceLock<Mutex<Connection>>,
    /// Held while opening + migrating. Remembers the last failure so callers
    /// that queued behind a failing attempt get its outcome.
    init_gate: Mutex<Option<Arc<StoreError>>>,
    failed_inits: AtomicU64,
}

impl Store {
    pub fn new(connector: impl Connector + 'static, config: StoreConfig) -> Self {
        Self::with_migrations(connector, config, schema::all_migrations())
    }

    /// Use a custom migration list. Migrations are applied in ascending version order.
    pub fn with_migrations(
        connector: impl Connector + 'static,
        config: StoreConfig,
        mut migrations: Vec<Migration>,
    ) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self {
            connector: Box::new(connector),
            config,
            migrations,
            conn: OnceLock::new(),
            init_gate: Mutex::new(None),
            failed_inits: AtomicU64::new(0),
        }
    }

    /// Store backed by a database file (creates if doesn't exist)
    pub fn open(path: &Path, config: StoreConfig) -> Self {
        Self::new(FileConnector::new(path), config)
    }

    /// Store backed by an in-memory database (for testing)
    pub fn open_in_memory(config: StoreConfig) -> Self {
        Self::new(MemoryConnector, config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.conn.get().is_some()
    }

    /// Open and migrate the database. Returns immediately once initialized.
    /// A failure leaves the store uninitialized so a later call can retry.
    pub async fn initialize(&self) -> StoreResult<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> StoreResult<&Mutex<Connection>> {
        if let Some(conn) = self.conn.get() {
            return Ok(conn);
        }

        let seen_failures = self.failed_inits.load(Ordering::Acquire);
        let mut gate = self.init_gate.lock().await;

        if let Some(conn) = self.conn.get() {
            return Ok(conn);
        }
        if self.failed_inits.load(Ordering::Acquire) != seen_failures {
            if let Some(cause) = gate.as_ref() {
                return Err(StoreError::InitFailed {
                    cause: Arc::clone(cause),
                });
            }
        }

        tracing::info!("Initializing database {}", self.connector.describe());
        match self.open_and_migrate() {
            Ok(conn) => {
                *gate = None;
                tracing::info!("Database initialized");
                Ok(self.conn.get_or_init(|| Mutex::new(conn)))
            }
            Err(e) => {
                tracing::error!("Database initialization failed: {}", e);
                let cause = Arc::new(e);
                *gate = Some(Arc::clone(&cause));
                self.failed_inits.fetch_add(1, Ordering::AcqRel);
                Err(StoreError::InitFailed { cause })
            }
        }
    }

    fn open_and_migrate(&self) -> StoreResult<Connection> {
        let mut conn = self
            .connector
            .open()
            .map_err(|source| StoreError::ConnectionFailed { source })?;

        conn.busy_timeout(self.config.connection_timeout)
            .map_err(|source| StoreError::ConnectionFailed { source })?;
        // Not on by default in SQLite; the images cascade depends on it.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|source| StoreError::ConnectionFailed { source })?;

        apply_migrations(&mut conn, &self.migrations)?;
        Ok(conn)
    }

    /// Apply every migration newer than the persisted version. Returns the
    /// version the database is at afterwards.
    pub async fn run_migrations(&self) -> StoreResult<u32> {
        let conn = self.connection().await?;
        let mut conn = conn.lock().await;
        apply_migrations(&mut conn, &self.migrations)
    }

    /// Persisted schema version (0 for a fresh file)
    pub async fn schema_version(&self) -> StoreResult<u32> {
        let rows = self
            .execute_query("PRAGMA user_version", &[], |row| row.get::<_, u32>(0))
            .await?;
        Ok(rows.into_iter().next().unwrap_or(0))
    }

    // ========== Statement Execution ==========

    /// Read-only query. Not retried.
    pub async fn execute_query<T, F>(&self, sql: &str, args: &[Value], map: F) -> StoreResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.connection().await?;
        let conn = conn.lock().await;
        self.log_statement(sql, args);

        let rows = query_rows(&conn, sql, args, map).map_err(|source| {
            tracing::error!("Query error: {}", source);
            StoreError::QueryFailed { source }
        })?;
        tracing::debug!(rows = rows.len(), "Query executed");
        Ok(rows)
    }

    /// Single-statement write. Not retried.
    pub async fn execute_mutation(&self, sql: &str, args: &[Value]) -> StoreResult<MutationResult> {
        let conn = self.connection().await?;
        let conn = conn.lock().await;
        self.log_statement(sql, args);

        let changes = conn
            .execute(sql, params_from_iter(args.iter()))
            .map_err(|source| {
                tracing::error!("Mutation error: {}", source);
                StoreError::MutationFailed { source }
            })?;

        tracing::debug!(changes, "Mutation executed");
        Ok(MutationResult {
            changes,
            inserted_id: (changes > 0 && is_insert(sql)).then(|| conn.last_insert_rowid()),
        })
    }

    /// Run `statements` in order as one all-or-nothing unit. A failed attempt
    /// is rolled back and the whole unit is retried under the configured policy.
    pub async fn execute_transaction(&self, statements: &[Statement]) -> StoreResult<()> {
        let conn = self.connection().await?;
        let policy = self.config.retry_policy();
        let lock_wait = self.config.transaction_timeout;

        let outcome = policy
            .run(move |attempt| async move {
                tracing::debug!(attempt, statements = statements.len(), "Executing transaction");
                let mut conn = tokio::time::timeout(lock_wait, conn.lock())
                    .await
                    .map_err(|_| connection_busy(lock_wait))?;
                self.run_in_transaction(&mut conn, statements)
            })
            .await;

        match outcome {
            Ok(()) => {
                tracing::debug!("Transaction committed");
                Ok(())
            }
            Err(RetryExhausted {
                attempts,
                last_error,
            }) => {
                tracing::error!(attempts, "Transaction failed: {}", last_error);
                Err(StoreError::TransactionFailed {
                    attempts,
                    source: last_error,
                })
            }
        }
    }

    fn run_in_transaction(&self, conn: &mut Connection, statements: &[Statement]) -> rusqlite::Result<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for stmt in statements {
            self.log_statement(&stmt.sql, &stmt.args);
            tx.execute(&stmt.sql, params_from_iter(stmt.args.iter()))?;
        }
        tx.commit()
    }

    fn log_statement(&self, sql: &str, args: &[Value]) {
        if self.config.log_statements {
            tracing::debug!(args = args.len(), "[DB Query] {}", sql.trim());
        }
    }
}

/// `last_insert_rowid` is per connection, so only trust it for inserts
fn is_insert(sql: &str) -> bool {
    let keyword = sql.trim_start().split_whitespace().next().unwrap_or("");
    keyword.eq_ignore_ascii_case("INSERT") || keyword.eq_ignore_ascii_case("REPLACE")
}

/// Attempt failure for a connection that stayed locked for `waited`
fn connection_busy(waited: Duration) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some(format!("connection busy for {:?}", waited)),
    )
}

fn query_rows<T, F>(conn: &Connection, sql: &str, args: &[Value], map: F) -> rusqlite::Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), map)?;
    rows.collect()
}

fn read_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Each pending migration runs in its own transaction together with the
/// `user_version` bump, so a failure leaves the last committed version intact.
fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> StoreResult<u32> {
    let current = read_version(conn).map_err(|source| StoreError::QueryFailed { source })?;
    tracing::debug!("Current database version: {}", current);

    let mut version = current;
    for migration in migrations.iter().filter(|m| m.version > current) {
        let target = migration.version;
        let failed = move |source| StoreError::MigrationFailed {
            version: target,
            source,
        };

        tracing::info!("Running migration v{}", target);
        let tx = conn.transaction().map_err(failed)?;
        for stmt in &migration.statements {
            tx.execute_batch(stmt).map_err(failed)?;
        }
        tx.pragma_update(None, "user_version", target).map_err(failed)?;
        tx.commit().map_err(failed)?;
        version = target;
    }

    if version != current {
        tracing::info!("Migrations completed: v{}", version);
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> StoreConfig {
        StoreConfig {
            retry_base_delay: Duration::from_millis(1),
            ..StoreConfig::default()
        }
    }

    /// In-memory connector that counts opens and can fail the first N of them
    #[derive(Clone, Default)]
    struct CountingConnector {
        opens: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl Connector for CountingConnector {
        fn open(&self) -> rusqlite::Result<Connection> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(rusqlite::Error::InvalidPath(PathBuf::from("/unavailable")));
            }
            Connection::open_in_memory()
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    fn logged_migrations() -> Vec<Migration> {
        vec![
            Migration::new(3, ["INSERT INTO migration_log (version) VALUES (3)"]),
            Migration::new(
                1,
                [
                    "CREATE TABLE migration_log (seq INTEGER PRIMARY KEY AUTOINCREMENT, version INTEGER NOT NULL)",
                    "INSERT INTO migration_log (version) VALUES (1)",
                ],
            ),
            Migration::new(2, ["INSERT INTO migration_log (version) VALUES (2)"]),
        ]
    }

    async fn logged_versions(store: &Store) -> Vec<u32> {
        store
            .execute_query("SELECT version FROM migration_log ORDER BY seq", &[], |row| row.get(0))
            .await
            .unwrap()
    }

    async fn count(store: &Store, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let rows: Vec<i64> = store.execute_query(&sql, &[], |row| row.get(0)).await.unwrap();
        rows[0]
    }

    #[tokio::test]
    async fn test_concurrent_initialize_opens_and_migrates_once() {
        let connector = CountingConnector::default();
        let opens = Arc::clone(&connector.opens);
        let store = Arc::new(Store::with_migrations(connector, fast_config(), logged_migrations()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.initialize().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(logged_versions(&store).await, vec![1, 2, 3]);
        assert_eq!(store.schema_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rerunning_migrations_is_noop() {
        let store = Store::with_migrations(MemoryConnector, fast_config(), logged_migrations());

        assert_eq!(store.run_migrations().await.unwrap(), 3);
        assert_eq!(store.run_migrations().await.unwrap(), 3);
        assert_eq!(logged_versions(&store).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lazy_init_on_first_query() {
        let store = Store::open_in_memory(fast_config());
        assert!(!store.is_initialized());

        assert_eq!(count(&store, "markers").await, 0);
        assert!(store.is_initialized());
        assert_eq!(store.schema_version().await.unwrap(), schema::latest_version());
    }

    #[tokio::test]
    async fn test_failed_init_can_be_retried() {
        let connector = CountingConnector {
            fail_first: 1,
            ..CountingConnector::default()
        };
        let opens = Arc::clone(&connector.opens);
        let store = Store::new(connector, fast_config());

        let err = store.initialize().await.unwrap_err();
        assert!(matches!(err, StoreError::InitFailed { .. }));
        assert!(!store.is_initialized());

        store.initialize().await.unwrap();
        assert!(store.is_initialized());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_committed_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maplab.db");
        let migrations = vec![
            Migration::new(1, ["CREATE TABLE first (id INTEGER)"]),
            Migration::new(2, ["CREATE TABLE second (id INTEGER)", "THIS IS NOT SQL"]),
        ];
        let store = Store::with_migrations(FileConnector::new(&path), fast_config(), migrations);

        let err = store.initialize().await.unwrap_err();
        match err {
            StoreError::InitFailed { cause } => {
                assert!(matches!(*cause, StoreError::MigrationFailed { version: 2, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }

        let conn = Connection::open(&path).unwrap();
        assert_eq!(read_version(&conn).unwrap(), 1);
        let second_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'second'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(second_exists, 0);
    }

    #[tokio::test]
    async fn test_version_persists_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maplab.db");

        let store = Store::open(&path, fast_config());
        store.initialize().await.unwrap();
        drop(store);

        let reopened = Store::open(&path, fast_config());
        assert_eq!(reopened.run_migrations().await.unwrap(), schema::latest_version());
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let store = Store::open_in_memory(fast_config());
        let enabled: Vec<i64> = store
            .execute_query("PRAGMA foreign_keys", &[], |row| row.get(0))
            .await
            .unwrap();
        assert_eq!(enabled, vec![1]);
    }

    #[tokio::test]
    async fn test_mutation_reports_changes() {
        let store = Store::open_in_memory(fast_config());
        let inserted = store
            .execute_mutation(
                "INSERT INTO markers (id, latitude, longitude, created_at) VALUES (?1, ?2, ?3, ?4)",
                &[
                    Value::from("m1".to_string()),
                    Value::Real(58.0),
                    Value::Real(56.2),
                    Value::from("2024-01-01T00:00:00.000Z".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted.changes, 1);
        assert!(inserted.inserted_id.is_some());

        let deleted = store
            .execute_mutation("DELETE FROM markers WHERE id = ?1", &[Value::from("missing".to_string())])
            .await
            .unwrap();
        assert_eq!(deleted, MutationResult { changes: 0, inserted_id: None });
    }

    #[tokio::test]
    async fn test_inserted_id_reported_for_every_table() {
        let store = Store::open_in_memory(fast_config());
        let marker = store
            .execute_mutation(
                "INSERT INTO markers (id, latitude, longitude, created_at) VALUES (?1, 0.0, 0.0, '2024-01-01T00:00:00.000Z')",
                &[Value::from("m1".to_string())],
            )
            .await
            .unwrap();
        // First row of each table, so both rowids are 1
        let image = store
            .execute_mutation(
                "INSERT INTO images (id, marker_id, uri, name, date_added) VALUES (?1, ?2, 'file://a.jpg', 'a.jpg', '2024-01-01T00:00:00.000Z')",
                &[Value::from("i1".to_string()), Value::from("m1".to_string())],
            )
            .await
            .unwrap();

        assert_eq!(marker, MutationResult { changes: 1, inserted_id: Some(1) });
        assert_eq!(image, MutationResult { changes: 1, inserted_id: Some(1) });

        let updated = store
            .execute_mutation("UPDATE markers SET title = 'Home' WHERE id = ?1", &[Value::from("m1".to_string())])
            .await
            .unwrap();
        assert_eq!(updated, MutationResult { changes: 1, inserted_id: None });
    }

    #[tokio::test]
    async fn test_malformed_query_fails() {
        let store = Store::open_in_memory(fast_config());
        let err = store
            .execute_query("SELEC * FROM markers", &[], |row| row.get::<_, String>(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QueryFailed { .. }));

        let err = store.execute_mutation("DELETE FROM nowhere", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::MutationFailed { .. }));
    }

    fn insert_marker(id: &str) -> Statement {
        Statement::new(
            "INSERT INTO markers (id, latitude, longitude, created_at) VALUES (?1, 0.0, 0.0, '2024-01-01T00:00:00.000Z')",
            vec![Value::from(id.to_string())],
        )
    }

    fn insert_image(id: &str, marker_id: &str) -> Statement {
        Statement::new(
            "INSERT INTO images (id, marker_id, uri, name, date_added) VALUES (?1, ?2, 'file://x.jpg', 'x.jpg', '2024-01-01T00:00:00.000Z')",
            vec![Value::from(id.to_string()), Value::from(marker_id.to_string())],
        )
    }

    #[tokio::test]
    async fn test_transaction_commits_in_order() {
        let store = Store::open_in_memory(fast_config());
        // The image insert only satisfies the foreign key because the marker goes first.
        store
            .execute_transaction(&[insert_marker("m1"), insert_image("i1", "m1")])
            .await
            .unwrap();

        assert_eq!(count(&store, "markers").await, 1);
        assert_eq!(count(&store, "images").await, 1);
    }

    #[tokio::test]
    async fn test_transaction_is_atomic_and_retries_to_the_limit() {
        let store = Store::open_in_memory(fast_config());
        store.execute_transaction(&[insert_marker("m1")]).await.unwrap();

        let err = store
            .execute_transaction(&[insert_image("i1", "m1"), insert_marker("m1")])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::TransactionFailed { attempts: 3, .. }));
        assert_eq!(count(&store, "images").await, 0);
    }

    #[tokio::test]
    async fn test_locked_database_uses_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maplab.db");
        // Whole sequence takes longer than the transaction timeout
        let config = StoreConfig {
            connection_timeout: Duration::from_millis(50),
            transaction_timeout: Duration::from_millis(20),
            retry_base_delay: Duration::from_millis(10),
            ..StoreConfig::default()
        };
        let store = Store::open(&path, config);
        store.initialize().await.unwrap();

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let err = store.execute_transaction(&[insert_marker("m1")]).await.unwrap_err();
        assert!(matches!(err, StoreError::TransactionFailed { attempts: 3, .. }), "got {err}");

        blocker.execute_batch("COMMIT;").unwrap();
        store.execute_transaction(&[insert_marker("m1")]).await.unwrap();
        assert_eq!(count(&store, "markers").await, 1);
    }

    #[tokio::test]
    async fn test_connection_wait_times_out_per_attempt() {
        let config = StoreConfig {
            transaction_timeout: Duration::from_millis(10),
            ..fast_config()
        };
        let store = Store::open_in_memory(config);
        let conn = store.connection().await.unwrap();
        let held = conn.lock().await;

        let err = store.execute_transaction(&[insert_marker("m1")]).await.unwrap_err();
        match err {
            StoreError::TransactionFailed { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.sqlite_error_code(), Some(rusqlite::ErrorCode::DatabaseBusy));
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(held);
        store.execute_transaction(&[insert_marker("m1")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_cascade_removes_images() {
        let store = Store::open_in_memory(fast_config());
        store
            .execute_transaction(&[insert_marker("m1"), insert_image("i1", "m1"), insert_image("i2", "m1")])
            .await
            .unwrap();

        store
            .execute_mutation("DELETE FROM markers WHERE id = ?1", &[Value::from("m1".to_string())])
            .await
            .unwrap();
        assert_eq!(count(&store, "images").await, 0);
    }
}
