//! In-memory repositories.
//!
//! Used by the daemon when no database is configured and by tests. Each
//! compare-and-swap reads and writes under one lock, so concurrent callers
//! observe the same exactly-once behaviour as the PostgreSQL store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use sapphire_core::{
    Annotation, AnnotationRepository, Error, Image, ImageRepository, ImageStatus, NewAnnotation,
    NewImage, Result, StatusFilter,
};

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Internal("in-memory store lock poisoned".to_string())
}

fn oldest_first<T>(items: &mut [T], key: impl Fn(&T) -> (chrono::DateTime<Utc>, Uuid)) {
    items.sort_by_key(key);
}

/// Image store held in process memory.
#[derive(Default)]
pub struct MemoryImageRepository {
    images: RwLock<HashMap<Uuid, Image>>,
}

impl MemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored images.
    pub fn len(&self) -> usize {
        self.images.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(req: NewImage) -> Image {
        let now = Utc::now();
        Image {
            id: Uuid::now_v7(),
            dataset_id: req.dataset_id,
            url: req.url,
            embedding_url: None,
            status: ImageStatus::Unembedded,
            embedding_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl ImageRepository for MemoryImageRepository {
    async fn insert(&self, req: NewImage) -> Result<Image> {
        let image = Self::build(req);
        self.images
            .write()
            .map_err(poisoned)?
            .insert(image.id, image.clone());
        Ok(image)
    }

    async fn insert_bulk(&self, reqs: Vec<NewImage>) -> Result<Vec<Image>> {
        let mut images = self.images.write().map_err(poisoned)?;
        let created: Vec<Image> = reqs.into_iter().map(Self::build).collect();
        for image in &created {
            images.insert(image.id, image.clone());
        }
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Image>> {
        Ok(self.images.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Image>> {
        let images = self.images.read().map_err(poisoned)?;
        Ok(ids.iter().filter_map(|id| images.get(id).cloned()).collect())
    }

    async fn list_by_status(
        &self,
        dataset_id: Option<Uuid>,
        filter: StatusFilter,
        limit: i64,
    ) -> Result<Vec<Image>> {
        let mut matched: Vec<Image> = self
            .images
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|img| dataset_id.map_or(true, |d| img.dataset_id == d))
            .filter(|img| filter.matches(img.status))
            .cloned()
            .collect();
        oldest_first(&mut matched, |img| (img.created_at, img.id));
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }

    async fn update_status(&self, id: Uuid, from: ImageStatus, to: ImageStatus) -> Result<bool> {
        let mut images = self.images.write().map_err(poisoned)?;
        match images.get_mut(&id) {
            Some(image) if image.status == from => {
                image.status = to;
                image.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_embedding_url(&self, id: Uuid, url: &str) -> Result<()> {
        let mut images = self.images.write().map_err(poisoned)?;
        let image = images.get_mut(&id).ok_or(Error::ImageNotFound(id))?;
        image.embedding_url = Some(url.to_string());
        image.updated_at = Utc::now();
        Ok(())
    }

    async fn record_embedding_failure(&self, id: Uuid) -> Result<i32> {
        let mut images = self.images.write().map_err(poisoned)?;
        let image = images.get_mut(&id).ok_or(Error::ImageNotFound(id))?;
        image.embedding_attempts += 1;
        image.updated_at = Utc::now();
        Ok(image.embedding_attempts)
    }
}

/// Annotation store held in process memory.
#[derive(Default)]
pub struct MemoryAnnotationRepository {
    annotations: RwLock<HashMap<Uuid, Annotation>>,
}

impl MemoryAnnotationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_matching(&self, pred: impl Fn(&Annotation) -> bool) -> Result<Vec<Annotation>> {
        let mut matched: Vec<Annotation> = self
            .annotations
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|a| pred(a))
            .cloned()
            .collect();
        oldest_first(&mut matched, |a| (a.created_at, a.id));
        Ok(matched)
    }
}

#[async_trait]
impl AnnotationRepository for MemoryAnnotationRepository {
    async fn save(&self, req: NewAnnotation) -> Result<Annotation> {
        let annotation = Annotation {
            id: Uuid::now_v7(),
            image_id: req.image_id,
            dataset_id: req.dataset_id,
            user_id: req.user_id,
            content: req.content,
            is_qualified: req.is_qualified,
            replica_count: req.replica_count,
            qualified_count: req.qualified_count,
            delivered_count: req.delivered_count,
            created_at: Utc::now(),
        };
        self.annotations
            .write()
            .map_err(poisoned)?
            .insert(annotation.id, annotation.clone());
        Ok(annotation)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Annotation>> {
        Ok(self.annotations.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn list_by_image(&self, image_id: Uuid) -> Result<Vec<Annotation>> {
        self.list_matching(|a| a.image_id == image_id)
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Annotation>> {
        self.list_matching(|a| a.user_id == user_id)
    }

    async fn list_by_dataset(&self, dataset_id: Uuid) -> Result<Vec<Annotation>> {
        self.list_matching(|a| a.dataset_id == dataset_id)
    }

    async fn count_by_image(&self, image_id: Uuid) -> Result<(i64, i64)> {
        let annotations = self.annotations.read().map_err(poisoned)?;
        let (total, qualified) = annotations
            .values()
            .filter(|a| a.image_id == image_id)
            .fold((0i64, 0i64), |(t, q), a| (t + 1, q + i64::from(a.is_qualified)));
        Ok((total, qualified))
    }

    async fn set_qualified(&self, id: Uuid, is_qualified: bool) -> Result<()> {
        let mut annotations = self.annotations.write().map_err(poisoned)?;
        let annotation = annotations
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("annotation {id}")))?;
        annotation.is_qualified = is_qualified;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_image(dataset_id: Uuid, url: &str) -> NewImage {
        NewImage {
            dataset_id,
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_update_status_is_compare_and_swap() {
        let repo = MemoryImageRepository::new();
        let image = repo.insert(new_image(Uuid::new_v4(), "a.jpg")).await.unwrap();

        assert!(repo
            .update_status(image.id, ImageStatus::Unembedded, ImageStatus::Embedding)
            .await
            .unwrap());
        assert!(!repo
            .update_status(image.id, ImageStatus::Unembedded, ImageStatus::Embedding)
            .await
            .unwrap());
        assert!(!repo
            .update_status(Uuid::new_v4(), ImageStatus::Unembedded, ImageStatus::Embedding)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_by_status_filters_and_limits() {
        let repo = MemoryImageRepository::new();
        let dataset = Uuid::new_v4();
        let other = Uuid::new_v4();
        let urls = ["a.jpg", "b.jpg", "c.jpg"];
        let created = repo
            .insert_bulk(urls.iter().map(|u| new_image(dataset, u)).collect())
            .await
            .unwrap();
        repo.insert(new_image(other, "d.jpg")).await.unwrap();
        repo.update_status(created[1].id, ImageStatus::Unembedded, ImageStatus::Embedding)
            .await
            .unwrap();

        let unembedded = repo
            .list_by_status(Some(dataset), ImageStatus::Unembedded.into(), 10)
            .await
            .unwrap();
        assert_eq!(unembedded.len(), 2);
        assert!(unembedded.iter().all(|i| i.dataset_id == dataset));

        let everything = repo
            .list_by_status(None, StatusFilter::Any, 10)
            .await
            .unwrap();
        assert_eq!(everything.len(), 4);

        let limited = repo
            .list_by_status(None, StatusFilter::Any, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_record_embedding_failure_counts_up() {
        let repo = MemoryImageRepository::new();
        let image = repo.insert(new_image(Uuid::new_v4(), "a.jpg")).await.unwrap();

        assert_eq!(repo.record_embedding_failure(image.id).await.unwrap(), 1);
        assert_eq!(repo.record_embedding_failure(image.id).await.unwrap(), 2);
        assert!(matches!(
            repo.record_embedding_failure(Uuid::new_v4()).await,
            Err(Error::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_count_by_image_splits_qualified() {
        let repo = MemoryAnnotationRepository::new();
        let image_id = Uuid::new_v4();
        let dataset_id = Uuid::new_v4();
        for qualified in [true, true, false] {
            let req = NewAnnotation::from_regions(image_id, dataset_id, Uuid::new_v4(), &[])
                .unwrap()
                .with_qualified(qualified);
            repo.save(req).await.unwrap();
        }

        assert_eq!(repo.count_by_image(image_id).await.unwrap(), (3, 2));
        assert_eq!(repo.count_by_image(Uuid::new_v4()).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_set_qualified_missing_annotation() {
        let repo = MemoryAnnotationRepository::new();
        let err = repo.set_qualified(Uuid::new_v4(), false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
