//! Recurring embedding scheduler.
//!
//! Every tick lists `Unembedded` images, claims them through the lifecycle,
//! and hands the claimed batch to one spawned task that embeds the images
//! one after another. A tick that finds a batch still in flight is skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use sapphire_core::{
    defaults, EmbeddingBackend, Error, Image, ImageEvent, ImageLifecycle, ImageStatus, Result,
    StatusFilter, TransitionOutcome,
};

use crate::guard::SingleFlight;

/// Configuration for the embedding scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether the recurring loop runs at all.
    pub enabled: bool,
    /// Time between ticks in milliseconds.
    pub interval_ms: u64,
    /// Delay before the first tick in milliseconds.
    pub startup_delay_ms: u64,
    /// Maximum images claimed per tick.
    pub batch_size: usize,
    /// Restrict the scheduler to one dataset; `None` covers all datasets.
    pub dataset_id: Option<Uuid>,
    /// Per-image limit on the embedding call.
    pub embed_timeout_secs: u64,
    /// Failed attempts after which an image is abandoned.
    pub max_attempts: i32,
    /// Roll back images left in `Embedding` before the first tick.
    pub recover_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: defaults::SCHEDULER_INTERVAL_MS,
            startup_delay_ms: defaults::SCHEDULER_STARTUP_DELAY_MS,
            batch_size: defaults::SCHEDULER_BATCH_SIZE,
            dataset_id: None,
            embed_timeout_secs: defaults::EMBED_TIMEOUT_SECS,
            max_attempts: defaults::EMBED_MAX_ATTEMPTS,
            recover_on_start: true,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SCHEDULER_ENABLED` | `true` | Enable/disable the recurring loop |
    /// | `SCHEDULER_INTERVAL_MS` | `10000` | Time between ticks |
    /// | `SCHEDULER_STARTUP_DELAY_MS` | `10000` | Delay before the first tick |
    /// | `SCHEDULER_BATCH_SIZE` | `8` | Images claimed per tick |
    /// | `SCHEDULER_DATASET_ID` | unset | Only embed images of this dataset |
    /// | `EMBED_TIMEOUT_SECS` | `30` | Per-image embedding timeout |
    /// | `EMBED_MAX_ATTEMPTS` | `3` | Failures before an image is abandoned |
    pub fn from_env() -> Self {
        let enabled = std::env::var("SCHEDULER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let interval_ms = env_parse("SCHEDULER_INTERVAL_MS")
            .unwrap_or(defaults::SCHEDULER_INTERVAL_MS)
            .max(1);

        let startup_delay_ms =
            env_parse("SCHEDULER_STARTUP_DELAY_MS").unwrap_or(defaults::SCHEDULER_STARTUP_DELAY_MS);

        let batch_size = env_parse("SCHEDULER_BATCH_SIZE")
            .unwrap_or(defaults::SCHEDULER_BATCH_SIZE)
            .max(1);

        let dataset_id = std::env::var("SCHEDULER_DATASET_ID")
            .ok()
            .and_then(|v| match v.parse::<Uuid>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(value = %v, error = %e, "Ignoring invalid SCHEDULER_DATASET_ID");
                    None
                }
            });

        let embed_timeout_secs = env_parse("EMBED_TIMEOUT_SECS")
            .unwrap_or(defaults::EMBED_TIMEOUT_SECS)
            .max(1);

        let max_attempts = env_parse("EMBED_MAX_ATTEMPTS")
            .unwrap_or(defaults::EMBED_MAX_ATTEMPTS)
            .max(1);

        Self {
            enabled,
            interval_ms,
            startup_delay_ms,
            batch_size,
            dataset_id,
            embed_timeout_secs,
            max_attempts,
            recover_on_start: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval_ms(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    pub fn with_startup_delay_ms(mut self, ms: u64) -> Self {
        self.startup_delay_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_dataset(mut self, dataset_id: Option<Uuid>) -> Self {
        self.dataset_id = dataset_id;
        self
    }

    pub fn with_embed_timeout_secs(mut self, secs: u64) -> Self {
        self.embed_timeout_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Event emitted by the embedding scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The recurring loop started.
    SchedulerStarted,
    /// A tick found a batch still in flight and did nothing.
    TickSkipped,
    /// A batch was claimed and dispatched.
    BatchStarted { batch_id: Uuid, images: usize },
    /// One image reached `Ready`.
    ImageEmbedded { batch_id: Uuid, image_id: Uuid },
    /// One image failed to embed.
    ImageFailed {
        batch_id: Uuid,
        image_id: Uuid,
        error: String,
        abandoned: bool,
    },
    /// A batch finished.
    BatchCompleted(BatchReport),
    /// The recurring loop stopped.
    SchedulerStopped,
}

/// What happened to each image of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// Images that reached `Ready`.
    pub embedded: Vec<Uuid>,
    /// Images returned to `Unembedded` for another attempt.
    pub retried: Vec<Uuid>,
    /// Images moved to `AnnotationFailed`.
    pub abandoned: Vec<Uuid>,
    /// Images whose outcome could not be recorded; still in `Embedding`.
    pub unresolved: Vec<Uuid>,
}

impl BatchReport {
    /// Number of images the batch handled.
    pub fn total(&self) -> usize {
        self.embedded.len() + self.retried.len() + self.abandoned.len() + self.unresolved.len()
    }
}

/// A dispatched batch.
#[derive(Debug)]
pub struct BatchHandle {
    batch_id: Uuid,
    task: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the batch to finish.
    pub async fn wait(self) -> Result<BatchReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Embedding batch {} failed: {e}", self.batch_id)))
    }
}

/// Result of a single tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing to embed.
    Idle,
    /// A previous batch is still in flight; nothing was claimed.
    Busy,
    /// A batch was claimed and is running.
    Dispatched(BatchHandle),
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<SchedulerEvent>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for any in-flight batch to finish.
    pub async fn stop(self) -> Result<()> {
        if self.shutdown_tx.send(()).await.is_err() {
            debug!("Embedding scheduler already stopped");
        }
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Embedding scheduler task failed: {e}")))
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Moves images from `Unembedded` to `Ready` on a fixed interval.
#[derive(Clone)]
pub struct EmbeddingScheduler {
    lifecycle: ImageLifecycle,
    backend: Arc<dyn EmbeddingBackend>,
    config: SchedulerConfig,
    guard: SingleFlight,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl EmbeddingScheduler {
    pub fn new(
        lifecycle: ImageLifecycle,
        backend: Arc<dyn EmbeddingBackend>,
        config: SchedulerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            lifecycle,
            backend,
            config,
            guard: SingleFlight::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Whether a batch is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.guard.is_busy()
    }

    /// Get a receiver for scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the recurring loop and return a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));

        SchedulerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "scheduler"))]
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Embedding scheduler is disabled, not starting");
            return;
        }

        info!(
            interval_ms = self.config.interval_ms,
            startup_delay_ms = self.config.startup_delay_ms,
            batch_size = self.config.batch_size,
            dataset_id = ?self.config.dataset_id,
            backend = self.backend.name(),
            "Embedding scheduler started"
        );
        let _ = self.event_tx.send(SchedulerEvent::SchedulerStarted);

        if self.config.recover_on_start {
            if let Err(e) = self
                .lifecycle
                .recover_stale_claims(self.config.dataset_id, defaults::STALE_CLAIM_SWEEP_LIMIT)
                .await
            {
                error!(error = %e, "Failed to recover stale embedding claims");
            }
        }

        let first_tick =
            tokio::time::Instant::now() + Duration::from_millis(self.config.startup_delay_ms);
        let mut ticker =
            tokio::time::interval_at(first_tick, Duration::from_millis(self.config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: Option<BatchHandle> = None;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Embedding scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Dispatched(handle)) => in_flight = Some(handle),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            if !handle.is_finished() {
                info!(batch_id = %handle.batch_id(), "Waiting for in-flight batch");
            }
            if let Err(e) = handle.wait().await {
                error!(error = %e, "In-flight batch did not finish cleanly");
            }
        }

        let _ = self.event_tx.send(SchedulerEvent::SchedulerStopped);
        info!("Embedding scheduler stopped");
    }

    /// Run one scheduling step.
    ///
    /// Returns as soon as the batch is dispatched; the embedding itself runs
    /// on a spawned task that owns the single-flight permit.
    #[instrument(skip(self), fields(subsystem = "scheduler"))]
    pub async fn tick(&self) -> Result<TickOutcome> {
        let candidates = self
            .lifecycle
            .images()
            .list_by_status(
                self.config.dataset_id,
                StatusFilter::Only(ImageStatus::Unembedded),
                self.config.batch_size as i64,
            )
            .await?;
        if candidates.is_empty() {
            debug!("No images waiting for embedding");
            return Ok(TickOutcome::Idle);
        }

        let Some(permit) = self.guard.try_acquire() else {
            debug!(waiting = candidates.len(), "Previous batch still in flight, skipping tick");
            let _ = self.event_tx.send(SchedulerEvent::TickSkipped);
            return Ok(TickOutcome::Busy);
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for image in candidates {
            match self.lifecycle.transition(image.id, ImageEvent::Claim).await {
                Ok(TransitionOutcome::Applied { .. }) => claimed.push(image),
                Ok(TransitionOutcome::AlreadyInState(_)) | Err(Error::InvalidTransition { .. }) => {
                    debug!(image_id = %image.id, "Image claimed elsewhere, skipping");
                }
                Err(e) => warn!(image_id = %image.id, error = %e, "Failed to claim image"),
            }
        }
        if claimed.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        let batch_id = Uuid::now_v7();
        info!(%batch_id, images = claimed.len(), "Dispatching embedding batch");
        let _ = self.event_tx.send(SchedulerEvent::BatchStarted {
            batch_id,
            images: claimed.len(),
        });

        let runner = BatchRunner {
            lifecycle: self.lifecycle.clone(),
            backend: self.backend.clone(),
            embed_timeout: Duration::from_secs(self.config.embed_timeout_secs),
            max_attempts: self.config.max_attempts,
            event_tx: self.event_tx.clone(),
        };
        let task = tokio::spawn(async move {
            let _permit = permit;
            runner.run(batch_id, claimed).await
        });

        Ok(TickOutcome::Dispatched(BatchHandle { batch_id, task }))
    }
}

enum ImageOutcome {
    Embedded,
    Retried,
    Abandoned,
    Unresolved,
}

/// Everything a spawned batch task needs.
struct BatchRunner {
    lifecycle: ImageLifecycle,
    backend: Arc<dyn EmbeddingBackend>,
    embed_timeout: Duration,
    max_attempts: i32,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl BatchRunner {
    async fn run(self, batch_id: Uuid, images: Vec<Image>) -> BatchReport {
        let start = Instant::now();
        let mut report = BatchReport {
            batch_id,
            ..Default::default()
        };

        for image in &images {
            let bucket = match self.process(batch_id, image).await {
                ImageOutcome::Embedded => &mut report.embedded,
                ImageOutcome::Retried => &mut report.retried,
                ImageOutcome::Abandoned => &mut report.abandoned,
                ImageOutcome::Unresolved => &mut report.unresolved,
            };
            bucket.push(image.id);
        }

        info!(
            %batch_id,
            embedded = report.embedded.len(),
            retried = report.retried.len(),
            abandoned = report.abandoned.len(),
            unresolved = report.unresolved.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Embedding batch completed"
        );
        let _ = self
            .event_tx
            .send(SchedulerEvent::BatchCompleted(report.clone()));
        report
    }

    async fn process(&self, batch_id: Uuid, image: &Image) -> ImageOutcome {
        let result = match self.embed(image).await {
            Ok(url) => self.complete(image.id, &url).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(%batch_id, image_id = %image.id, "Image embedded");
                let _ = self.event_tx.send(SchedulerEvent::ImageEmbedded {
                    batch_id,
                    image_id: image.id,
                });
                ImageOutcome::Embedded
            }
            Err(e) if !e.is_per_item() => {
                error!(%batch_id, image_id = %image.id, error = %e, "Image left unresolved");
                let _ = self.event_tx.send(SchedulerEvent::ImageFailed {
                    batch_id,
                    image_id: image.id,
                    error: e.to_string(),
                    abandoned: false,
                });
                ImageOutcome::Unresolved
            }
            Err(e) => {
                let outcome = self.fail(image.id).await;
                warn!(
                    %batch_id,
                    image_id = %image.id,
                    error = %e,
                    abandoned = matches!(outcome, ImageOutcome::Abandoned),
                    "Image embedding failed"
                );
                let _ = self.event_tx.send(SchedulerEvent::ImageFailed {
                    batch_id,
                    image_id: image.id,
                    error: e.to_string(),
                    abandoned: matches!(outcome, ImageOutcome::Abandoned),
                });
                outcome
            }
        }
    }

    async fn embed(&self, image: &Image) -> Result<String> {
        match tokio::time::timeout(self.embed_timeout, self.backend.embed(image)).await {
            Ok(Ok(url)) => Ok(url),
            Ok(Err(e)) if e.is_per_item() => Err(e),
            Ok(Err(e)) => Err(Error::EmbeddingFailure {
                image_id: image.id,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::EmbeddingTimeout {
                image_id: image.id,
                timeout_secs: self.embed_timeout.as_secs(),
            }),
        }
    }

    async fn complete(&self, image_id: Uuid, embedding_url: &str) -> Result<()> {
        self.lifecycle
            .images()
            .set_embedding_url(image_id, embedding_url)
            .await?;
        self.lifecycle
            .transition(image_id, ImageEvent::EmbeddingSucceeded)
            .await?;
        Ok(())
    }

    /// Count the failed attempt and roll the image back or abandon it.
    async fn fail(&self, image_id: Uuid) -> ImageOutcome {
        let attempts = match self
            .lifecycle
            .images()
            .record_embedding_failure(image_id)
            .await
        {
            Ok(attempts) => attempts,
            Err(e) => {
                error!(%image_id, error = %e, "Failed to record embedding attempt");
                return ImageOutcome::Unresolved;
            }
        };

        let (event, outcome) = if attempts >= self.max_attempts {
            (ImageEvent::EmbeddingAbandoned, ImageOutcome::Abandoned)
        } else {
            (ImageEvent::EmbeddingFailed, ImageOutcome::Retried)
        };
        match self.lifecycle.transition(image_id, event).await {
            Ok(_) => outcome,
            Err(e) => {
                error!(%image_id, %event, error = %e, "Failed to roll back image");
                ImageOutcome::Unresolved
            }
        }
    }
}
