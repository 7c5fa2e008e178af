use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::models::task::{QueueName, QueuedTask};

const KEY_PREFIX: &str = "photopipe";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A pool of named task queues pulled by independent worker processes.
///
/// `enqueue` routes by the task's own queue binding; dispatch never inspects
/// payload content.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Pop the next task off a queue, moving it to that queue's processing
    /// list until `complete` is called.
    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueuedTask>, QueueError>;

    /// Remove a dequeued task from the processing list.
    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Current number of pending tasks on a queue.
    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError>;
}

/// Redis-backed task queues, one list per logical queue name.
pub struct RedisTaskQueue {
    client: redis::Client,
}

impl RedisTaskQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    fn queue_key(queue: QueueName) -> String {
        format!("{KEY_PREFIX}:{}", queue.as_str())
    }

    fn processing_key(queue: QueueName) -> String {
        format!("{KEY_PREFIX}:{}:processing", queue.as_str())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(task)?;
        conn.lpush::<_, _, ()>(Self::queue_key(task.queue()), &payload)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<String> = conn
            .rpoplpush(Self::queue_key(queue), Self::processing_key(queue))
            .await?;

        match result {
            Some(payload) => {
                let task: QueuedTask = serde_json::from_str(&payload)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(task)?;
        conn.lrem::<_, _, ()>(Self::processing_key(task.queue()), 1, &payload)
            .await?;
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(Self::queue_key(queue)).await?;
        Ok(depth)
    }
}

/// In-process task queues for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTaskQueue {
    queues: Mutex<HashMap<QueueName, VecDeque<String>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let mut queues = self.queues.lock().await;
        queues.entry(task.queue()).or_default().push_back(payload);
        Ok(())
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<QueuedTask>, QueueError> {
        let mut queues = self.queues.lock().await;
        match queues.entry(queue).or_default().pop_front() {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, _task: &QueuedTask) -> Result<(), QueueError> {
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(&queue).map(|q| q.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::Domain;
    use uuid::Uuid;

    fn process_task(domain: Domain) -> QueuedTask {
        QueuedTask::ProcessBatch {
            task_id: Uuid::new_v4(),
            asset_ids: vec!["img_1.jpg".into()],
            domain,
        }
    }

    #[tokio::test]
    async fn test_enqueue_routes_to_task_queue() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&process_task(Domain::Face)).await.unwrap();

        assert_eq!(queue.depth(QueueName::ImageProcessing).await.unwrap(), 1);
        assert_eq!(queue.depth(QueueName::ImageUpload).await.unwrap(), 0);

        let task = queue.dequeue(QueueName::ImageProcessing).await.unwrap();
        assert!(matches!(task, Some(QueuedTask::ProcessBatch { .. })));
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = MemoryTaskQueue::new();
        let first = process_task(Domain::Ocr);
        let second = process_task(Domain::Face);
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let popped = queue
            .dequeue(QueueName::ImageProcessing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.task_id(), first.task_id());
    }

    #[tokio::test]
    async fn test_empty_queue_dequeues_none() {
        let queue = MemoryTaskQueue::new();
        assert!(queue
            .dequeue(QueueName::WriteCacheAndProcess)
            .await
            .unwrap()
            .is_none());
    }
}
