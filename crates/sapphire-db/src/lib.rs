//! # sapphire-db
//!
//! Storage layer for the sapphire annotation pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for images and annotations
//! - In-memory repositories with the same compare-and-swap semantics
//!
//! ## Example
//!
//! ```rust,ignore
//! use sapphire_db::{Database, ImageLifecycle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/sapphire").await?;
//!     let stores = db.stores();
//!     let lifecycle = ImageLifecycle::new(stores.images.clone());
//!
//!     let image = lifecycle.register(dataset_id, "s3://bucket/cat.jpg").await?;
//!     println!("Registered image: {}", image.id);
//!     Ok(())
//! }
//! ```
pub mod annotations;
pub mod images;
pub mod memory;
pub mod pool;
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use sapphire_core::*;

pub use annotations::PgAnnotationRepository;
pub use images::PgImageRepository;
pub use memory::{MemoryAnnotationRepository, MemoryImageRepository};
pub use pool::{create_pool, log_pool_metrics, PoolConfig, PoolHealth};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Image repository with lifecycle compare-and-swap.
    pub images: PgImageRepository,
    /// Annotation submission repository.
    pub annotations: PgAnnotationRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            images: PgImageRepository::new(pool.clone()),
            annotations: PgAnnotationRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url, &PoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, &config).await?;
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

    /// Trait-object handles over this database's repositories.
    pub fn stores(&self) -> Stores {
        Stores {
            images: Arc::new(self.images.clone()),
            annotations: Arc::new(self.annotations.clone()),
        }
    }
}

/// Shared repository handles, independent of the backing store.
#[derive(Clone)]
pub struct Stores {
    pub images: Arc<dyn ImageRepository>,
    pub annotations: Arc<dyn AnnotationRepository>,
}

impl Stores {
    /// Fresh, empty in-memory stores.
    pub fn memory() -> Self {
        Self {
            images: Arc::new(MemoryImageRepository::new()),
            annotations: Arc::new(MemoryAnnotationRepository::new()),
        }
    }
}
