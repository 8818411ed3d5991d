//! Memory database module - SQLite-backed storage for knowledge, conversations,
//! summaries and the retrieval audit trail
pub mod schema;
pub mod migration;
pub mod conversation_store;
pub mod summary_store;
pub mod knowledge_store;
pub mod operation_store;
pub mod reconciliation_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use conversation_store::ConversationStore;
pub use summary_store::SummaryStore;
pub use knowledge_store::KnowledgeItemStore;
pub use operation_store::{OperationFilter, OperationStore, TimeRange};
pub use reconciliation_store::ReconciliationStore;

use std::path::Path;
use std::sync::Arc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OpenFlags, TransactionBehavior};
use tracing::info;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

pub(crate) fn get_conn(pool: &DbPool) -> anyhow::Result<DbConnection> {
    pool.get()
        .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
}

/// Every relational store, sharing one connection pool
pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub summaries: SummaryStore,
    pub knowledge: KnowledgeItemStore,
    pub operations: OperationStore,
    pub reconciliation: ReconciliationStore,
    pool: DbPool,
}

impl MemoryDatabase {
    /// Open (or create) a file-backed database and apply migrations
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        Self::from_pool(pool)
    }

    /// Private in-memory database, used by tests and ephemeral deployments.
    ///
    /// An in-memory SQLite database lives and dies with its connection, so
    /// the pool holds exactly one connection that is never recycled. Callers
    /// must not hold a pooled connection while asking for another.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> anyhow::Result<Self> {
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            knowledge: KnowledgeItemStore::new(Arc::clone(&pool)),
            operations: OperationStore::new(Arc::clone(&pool)),
            reconciliation: ReconciliationStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    /// Shared pool, for components that keep their own tables (the SQLite vector index)
    pub fn pool(&self) -> DbPool {
        Arc::clone(&self.pool)
    }

    /// Run `f` inside an IMMEDIATE transaction; an `Err` rolls everything back.
    ///
    /// The closure must only touch the database through the given transaction.
    pub fn with_transaction<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> anyhow::Result<T>,
    {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = get_conn(&self.pool)?;
        Ok(migration::get_database_stats(&conn)?)
    }

    pub fn run_maintenance(&self) -> anyhow::Result<()> {
        let mut conn = get_conn(&self.pool)?;
        Ok(migration::run_maintenance(&mut conn)?)
    }
}
