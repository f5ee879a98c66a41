//! Simulated embedding backend.
//!
//! Stands in for the external embedding service: it waits for a configurable
//! latency and reports the embedding as stored next to the source image.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sapphire_jobs::SimulatedEmbeddingBackend;
//!
//! let backend = SimulatedEmbeddingBackend::new()
//!     .with_latency_ms(250)
//!     .with_failing_url("corrupt");
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use sapphire_core::{EmbeddingBackend, Error, Image, Result};

/// Suffix appended to an image URL to form its embedding location.
pub const EMBEDDING_SUFFIX: &str = ".embedding";

#[derive(Debug, Clone, Default)]
struct SimulatedConfig {
    latency_ms: u64,
    failing_ids: HashSet<Uuid>,
    failing_url_parts: Vec<String>,
    failure_rate: f64,
}

/// Embedding backend that sleeps instead of calling a real service.
#[derive(Clone, Default)]
pub struct SimulatedEmbeddingBackend {
    config: Arc<SimulatedConfig>,
    calls: Arc<Mutex<Vec<Uuid>>>,
}

impl SimulatedEmbeddingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set simulated latency per call.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Always fail for this image.
    pub fn with_failing_image(mut self, image_id: Uuid) -> Self {
        Arc::make_mut(&mut self.config).failing_ids.insert(image_id);
        self
    }

    /// Always fail for images whose URL contains `part`.
    pub fn with_failing_url(mut self, part: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config)
            .failing_url_parts
            .push(part.into());
        self
    }

    /// Set failure rate (0.0 - 1.0) for the remaining images.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        Arc::make_mut(&mut self.config).failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Image ids passed to `embed`, in call order.
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn should_fail(&self, image: &Image) -> bool {
        let config = &self.config;
        if config.failing_ids.contains(&image.id)
            || config
                .failing_url_parts
                .iter()
                .any(|part| image.url.contains(part.as_str()))
        {
            return true;
        }
        config.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < config.failure_rate
    }
}

#[async_trait]
impl EmbeddingBackend for SimulatedEmbeddingBackend {
    async fn embed(&self, image: &Image) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(image.id);

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        if self.should_fail(image) {
            return Err(Error::EmbeddingFailure {
                image_id: image.id,
                reason: "simulated failure".to_string(),
            });
        }

        debug!(image_id = %image.id, "Simulated embedding complete");
        Ok(format!("{}{EMBEDDING_SUFFIX}", image.url))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sapphire_core::ImageStatus;

    fn image(url: &str) -> Image {
        Image {
            id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
            url: url.to_string(),
            embedding_url: None,
            status: ImageStatus::Embedding,
            embedding_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_embed_returns_suffixed_url() {
        let backend = SimulatedEmbeddingBackend::new();
        let img = image("s3://bucket/a.jpg");

        let url = backend.embed(&img).await.unwrap();
        assert_eq!(url, "s3://bucket/a.jpg.embedding");
        assert_eq!(backend.calls(), vec![img.id]);
    }

    #[tokio::test]
    async fn test_failing_image_and_url() {
        let bad = image("s3://bucket/b.jpg");
        let backend = SimulatedEmbeddingBackend::new()
            .with_failing_image(bad.id)
            .with_failing_url("corrupt");

        assert!(matches!(
            backend.embed(&bad).await,
            Err(Error::EmbeddingFailure { .. })
        ));
        assert!(backend.embed(&image("s3://corrupt/c.jpg")).await.is_err());
        assert!(backend.embed(&image("s3://bucket/d.jpg")).await.is_ok());
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_full_failure_rate() {
        let backend = SimulatedEmbeddingBackend::new().with_failure_rate(1.0);
        assert!(backend.embed(&image("a.jpg")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_simulated() {
        let backend = SimulatedEmbeddingBackend::new().with_latency_ms(5_000);
        let start = tokio::time::Instant::now();
        backend.embed(&image("a.jpg")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5_000));
    }
}
