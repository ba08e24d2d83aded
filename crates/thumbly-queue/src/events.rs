//! Lifecycle events via Redis Pub/Sub.

use futures_util::StreamExt;
use tracing::debug;

use thumbly_models::{JobEvent, JobId, Topic};

use crate::error::QueueResult;

/// Topic-keyed publish/subscribe for job lifecycle events.
///
/// Delivery is at-least-once best-effort: publishing never blocks on
/// subscribers, and subscribers are expected to be idempotent per
/// `(job_id, status)` and to resync from the job store on reconnect.
pub struct EventBus {
    client: redis::Client,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Publish an event on its topic.
    pub async fn publish(&self, event: &JobEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let topic = event.topic();
        let payload = event.to_payload()?;

        debug!(job_id = %event.job_id(), topic = %topic, "publishing event");
        redis::cmd("PUBLISH")
            .arg(topic.as_str())
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    /// Publish `job-active`.
    pub async fn active(&self, job_id: &JobId) -> QueueResult<()> {
        self.publish(&JobEvent::active(job_id.clone())).await
    }

    /// Publish `job-progress`.
    pub async fn progress(&self, job_id: &JobId, progress: u8) -> QueueResult<()> {
        self.publish(&JobEvent::progress(job_id.clone(), progress))
            .await
    }

    /// Publish `job-completed` with the artifact URLs.
    pub async fn completed(&self, job_id: &JobId, thumbnails: Vec<String>) -> QueueResult<()> {
        self.publish(&JobEvent::completed(job_id.clone(), thumbnails))
            .await
    }

    /// Publish `job-failed`.
    pub async fn failed(&self, job_id: &JobId, error: impl Into<String>) -> QueueResult<()> {
        self.publish(&JobEvent::failed(job_id.clone(), error)).await
    }

    /// Subscribe to the given topics.
    /// Returns a pinned stream that can be polled with `.next()`.
    pub async fn subscribe(
        &self,
        topics: &[Topic],
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = JobEvent> + Send>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in topics {
            pubsub.subscribe(topic.as_str()).await?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let topic = Topic::parse(msg.get_channel_name())?;
            let payload: String = msg.get_payload().ok()?;
            JobEvent::from_payload(topic, &payload).ok()
        });

        Ok(Box::pin(stream))
    }

    /// Subscribe to every lifecycle topic.
    pub async fn subscribe_all(
        &self,
    ) -> QueueResult<std::pin::Pin<Box<dyn futures_util::Stream<Item = JobEvent> + Send>>> {
        self.subscribe(&Topic::all()).await
    }
}
