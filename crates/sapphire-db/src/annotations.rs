//! Annotation repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use sapphire_core::{Annotation, AnnotationRepository, Error, NewAnnotation, Result};

const ANNOTATION_COLUMNS: &str = "id, image_id, dataset_id, user_id, content, is_qualified, \
     replica_count, qualified_count, delivered_count, created_at";

/// PostgreSQL implementation of AnnotationRepository.
#[derive(Clone)]
pub struct PgAnnotationRepository {
    pool: Pool<Postgres>,
}

impl PgAnnotationRepository {
    /// Create a new PgAnnotationRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_annotation_row(row: sqlx::postgres::PgRow) -> Annotation {
        Annotation {
            id: row.get("id"),
            image_id: row.get("image_id"),
            dataset_id: row.get("dataset_id"),
            user_id: row.get("user_id"),
            content: row.get("content"),
            is_qualified: row.get("is_qualified"),
            replica_count: row.get("replica_count"),
            qualified_count: row.get("qualified_count"),
            delivered_count: row.get("delivered_count"),
            created_at: row.get("created_at"),
        }
    }

    async fn list_where(&self, column: &str, value: Uuid) -> Result<Vec<Annotation>> {
        let rows = sqlx::query(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE {column} = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_annotation_row).collect())
    }
}

#[async_trait]
impl AnnotationRepository for PgAnnotationRepository {
    async fn save(&self, req: NewAnnotation) -> Result<Annotation> {
        let row = sqlx::query(&format!(
            "INSERT INTO annotations (id, image_id, dataset_id, user_id, content, is_qualified,
                                      replica_count, qualified_count, delivered_count, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {ANNOTATION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(req.image_id)
        .bind(req.dataset_id)
        .bind(req.user_id)
        .bind(&req.content)
        .bind(req.is_qualified)
        .bind(req.replica_count)
        .bind(req.qualified_count)
        .bind(req.delivered_count)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_annotation_row(row))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Annotation>> {
        let row = sqlx::query(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_annotation_row))
    }

    async fn list_by_image(&self, image_id: Uuid) -> Result<Vec<Annotation>> {
        self.list_where("image_id", image_id).await
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Annotation>> {
        self.list_where("user_id", user_id).await
    }

    async fn list_by_dataset(&self, dataset_id: Uuid) -> Result<Vec<Annotation>> {
        self.list_where("dataset_id", dataset_id).await
    }

    async fn count_by_image(&self, image_id: Uuid) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE is_qualified) AS qualified
             FROM annotations WHERE image_id = $1",
        )
        .bind(image_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok((row.get("total"), row.get("qualified")))
    }

    async fn set_qualified(&self, id: Uuid, is_qualified: bool) -> Result<()> {
        let result = sqlx::query("UPDATE annotations SET is_qualified = $2 WHERE id = $1")
            .bind(id)
            .bind(is_qualified)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("annotation {id}")));
        }
        Ok(())
    }
}
