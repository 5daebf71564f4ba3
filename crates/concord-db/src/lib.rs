//! # concord-db
//!
//! Storage backends for the concord entity resolution engine.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL implementations of the graph store and resolution repositories
//! - Nearest-neighbour search over concept embeddings with pgvector
//! - A Redis key-value cache for the score cache and reject store
//! - In-memory implementations of every store, with failure injection
//!
//! ## Example
//!
//! ```rust,ignore
//! use concord_db::{Database, GraphStore, CanonicalConcept, ConceptType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/concord").await?;
//!     let concept = CanonicalConcept::new("acme", "ISO 27001", ConceptType::Standard);
//!     db.graph.upsert_concept(&concept).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod concepts;
pub mod deferred;
pub mod memory;
pub mod pool;
pub mod proposals;
pub mod vectors;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use concord_core::*;

pub use audit::PgMergeAuditRepository;
pub use cache::RedisCache;
pub use concepts::PgGraphStore;
pub use deferred::PgDeferredRepository;
pub use memory::{
    InMemoryVectorIndex, MemoryCache, MemoryDeferredRepository, MemoryGraphStore,
    MemoryMergeAuditRepository, MemoryProposalRepository,
};
pub use pool::{open_pool, PoolSettings};
pub use proposals::PgProposalRepository;
pub use vectors::PgVectorIndex;

/// Combined database context with every PostgreSQL-backed store.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Concepts, edges, claims and document mentions.
    pub graph: PgGraphStore,
    /// Concept embeddings (pgvector).
    pub vectors: PgVectorIndex,
    /// Deferred merge candidates.
    pub deferred: PgDeferredRepository,
    /// Corpus-run merge proposals.
    pub proposals: PgProposalRepository,
    /// Merge and rollback audit log.
    pub audit: PgMergeAuditRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            graph: PgGraphStore::new(pool.clone()),
            vectors: PgVectorIndex::new(pool.clone()),
            deferred: PgDeferredRepository::new(pool.clone()),
            proposals: PgProposalRepository::new(pool.clone()),
            audit: PgMergeAuditRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with pool settings from the environment.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, &PoolSettings::from_env()).await
    }

    pub async fn connect_with(url: &str, settings: &PoolSettings) -> Result<Self> {
        let pool = open_pool(url, settings).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
