//! Image repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use sapphire_core::{Error, Image, ImageRepository, ImageStatus, NewImage, Result, StatusFilter};

const IMAGE_COLUMNS: &str =
    "id, dataset_id, url, embedding_url, status, embedding_attempts, created_at, updated_at";

/// PostgreSQL implementation of ImageRepository.
#[derive(Clone)]
pub struct PgImageRepository {
    pool: Pool<Postgres>,
}

impl PgImageRepository {
    /// Create a new PgImageRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse an image row into an Image struct.
    fn parse_image_row(row: sqlx::postgres::PgRow) -> Result<Image> {
        let status: String = row.get("status");
        Ok(Image {
            id: row.get("id"),
            dataset_id: row.get("dataset_id"),
            url: row.get("url"),
            embedding_url: row.get("embedding_url"),
            status: status.parse()?,
            embedding_attempts: row.get("embedding_attempts"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn insert(&self, req: NewImage) -> Result<Image> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        let row = sqlx::query(&format!(
            "INSERT INTO images (id, dataset_id, url, status, embedding_attempts, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, $5, $5)
             RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(req.dataset_id)
        .bind(&req.url)
        .bind(ImageStatus::Unembedded.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_image_row(row)
    }

    async fn insert_bulk(&self, reqs: Vec<NewImage>) -> Result<Vec<Image>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut images = Vec::with_capacity(reqs.len());

        for req in reqs {
            let row = sqlx::query(&format!(
                "INSERT INTO images (id, dataset_id, url, status, embedding_attempts, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, 0, $5, $5)
                 RETURNING {IMAGE_COLUMNS}"
            ))
            .bind(Uuid::now_v7())
            .bind(req.dataset_id)
            .bind(&req.url)
            .bind(ImageStatus::Unembedded.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
            images.push(Self::parse_image_row(row)?);
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(images)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Image>> {
        let row = sqlx::query(&format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_image_row).transpose()
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Image>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE id = ANY($1) ORDER BY created_at ASC, id ASC"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_image_row).collect()
    }

    async fn list_by_status(
        &self,
        dataset_id: Option<Uuid>,
        filter: StatusFilter,
        limit: i64,
    ) -> Result<Vec<Image>> {
        let status = match filter {
            StatusFilter::Any => None,
            StatusFilter::Only(status) => Some(status.as_str()),
        };

        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images
             WHERE ($1::uuid IS NULL OR dataset_id = $1)
               AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at ASC, id ASC
             LIMIT $3"
        ))
        .bind(dataset_id)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_image_row).collect()
    }

    async fn update_status(&self, id: Uuid, from: ImageStatus, to: ImageStatus) -> Result<bool> {
        // The status predicate makes this a compare-and-swap.
        let result = sqlx::query(
            "UPDATE images SET status = $3, updated_at = $4
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_embedding_url(&self, id: Uuid, url: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE images SET embedding_url = $2, updated_at = $3 WHERE id = $1")
                .bind(id)
                .bind(url)
                .bind(Utc::now())
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ImageNotFound(id));
        }
        Ok(())
    }

    async fn record_embedding_failure(&self, id: Uuid) -> Result<i32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE images SET embedding_attempts = embedding_attempts + 1, updated_at = $2
             WHERE id = $1
             RETURNING embedding_attempts",
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        attempts.ok_or(Error::ImageNotFound(id))
    }
}
