use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The single pub/sub channel carrying "new result available" events.
pub const CHANNEL: &str = "new_results";

/// Message body published for each saved result. `id` is the result-ledger
/// key (`"res_" + asset_id`), `data` the JSON-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub data: String,
}

impl Notification {
    pub fn new(asset_id: &str, payload: &serde_json::Value) -> Self {
        Self {
            id: format!("res_{asset_id}"),
            data: payload.to_string(),
        }
    }

    /// The asset id the notification refers to.
    pub fn asset_id(&self) -> &str {
        self.id.strip_prefix("res_").unwrap_or(&self.id)
    }

    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Publish/subscribe for result notifications.
///
/// Subscribers only see events published after they subscribe; there is no
/// replay or backlog.
#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn publish(&self, asset_id: &str, payload: &serde_json::Value)
        -> Result<(), NotifyError>;

    async fn subscribe(&self) -> Result<BoxStream<'static, Notification>, NotifyError>;
}

/// Redis pub/sub notifier.
pub struct RedisNotifier {
    client: redis::Client,
}

impl RedisNotifier {
    pub fn new(redis_url: &str) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResultNotifier for RedisNotifier {
    async fn publish(
        &self,
        asset_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let message = serde_json::to_string(&Notification::new(asset_id, payload))?;
        redis::cmd("PUBLISH")
            .arg(CHANNEL)
            .arg(message)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Notification>, NotifyError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(CHANNEL).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = msg.get_payload().ok()?;
                serde_json::from_str(&payload).ok()
            })
            .boxed();
        Ok(stream)
    }
}

/// In-process notifier for tests and single-process deployments.
pub struct MemoryNotifier {
    sender: broadcast::Sender<Notification>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultNotifier for MemoryNotifier {
    async fn publish(
        &self,
        asset_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        // A send error just means nobody is subscribed.
        let _ = self.sender.send(Notification::new(asset_id, payload));
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Notification>, NotifyError> {
        let rx = self.sender.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => return Some((notification, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_body_shape() {
        let payload = serde_json::json!({"faces": ["img_1.jpg_0"]});
        let notification = Notification::new("img_1.jpg", &payload);
        assert_eq!(notification.id, "res_img_1.jpg");
        assert_eq!(notification.payload().unwrap(), payload);
        assert_eq!(notification.asset_id(), "img_1.jpg");
    }

    #[tokio::test]
    async fn test_subscriber_sees_events_after_subscribing() {
        let notifier = MemoryNotifier::new();
        // Published before anyone subscribes: dropped, no backlog.
        notifier
            .publish("early", &serde_json::json!({}))
            .await
            .unwrap();

        let mut stream = notifier.subscribe().await.unwrap();
        notifier
            .publish("img_1.jpg", &serde_json::json!({"texts": ["hi"]}))
            .await
            .unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(event.id, "res_img_1.jpg");
    }
}
