//! Durable work queue abstraction.
//!
//! A delivery stays claimed until it is acked (removed), retried (back to queued)
//! or dead-lettered (parked with its last error). Nothing is acknowledged before
//! the job it carries has finished.

use crate::error::QueueError;
use crate::{Job, Status};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Delivery {
    pub id: Uuid,
    pub payload: String,
    /// Number of times this message has been claimed, including this one.
    pub attempts: i32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: &str) -> Result<Uuid, QueueError>;

    /// Claim up to `limit` queued messages, oldest first.
    async fn receive(&self, limit: i64) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, id: Uuid) -> Result<(), QueueError>;

    async fn retry(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    /// Return messages left claimed by a previous run to the queue.
    async fn requeue_stalled(&self) -> Result<u64, QueueError>;
}

pub async fn enqueue_job(queue: &dyn JobQueue, job: &Job) -> Result<Uuid, QueueError> {
    let payload = job.encode()?;
    queue.enqueue(&payload).await
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub payload: String,
    pub status: Status,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, MemoryEntry>,
}

/// In-process queue with the same claim/ack semantics as the PostgreSQL one.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet acked, in any state.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, id: Uuid) -> Option<MemoryEntry> {
        self.state.lock().unwrap().entries.get(&id).cloned()
    }

    pub fn dead_letters(&self) -> Vec<MemoryEntry> {
        self.state
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.status == Status::Dead)
            .cloned()
            .collect()
    }

    fn transition(
        &self,
        id: Uuid,
        status: Status,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(QueueError::UnknownDelivery(id))?;
        entry.status = status;
        entry.last_error = error.map(str::to_owned);
        if status == Status::Queued {
            state.order.push_back(id);
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, payload: &str) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.entries.insert(
            id,
            MemoryEntry {
                payload: payload.to_string(),
                status: Status::Queued,
                attempts: 0,
                last_error: None,
            },
        );
        state.order.push_back(id);
        Ok(id)
    }

    async fn receive(&self, limit: i64) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut claimed = vec![];
        while (claimed.len() as i64) < limit {
            let Some(id) = state.order.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.status != Status::Queued {
                continue;
            }
            entry.status = Status::Processing;
            entry.attempts += 1;
            claimed.push(Delivery {
                id,
                payload: entry.payload.clone(),
                attempts: entry.attempts,
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        self.state
            .lock()
            .unwrap()
            .entries
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(id))
    }

    async fn retry(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.transition(id, Status::Queued, Some(error))
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.transition(id, Status::Dead, Some(error))
    }

    async fn requeue_stalled(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock().unwrap();
        let stalled: Vec<Uuid> = state
            .entries
            .iter()
            .filter(|(_, e)| e.status == Status::Processing)
            .map(|(id, _)| *id)
            .collect();
        for id in &stalled {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.status = Status::Queued;
            }
            state.order.push_back(*id);
        }
        Ok(stalled.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claims_in_order_and_acks() {
        let queue = MemoryQueue::new();
        let first = enqueue_job(&queue, &Job::new(1, "https://x/a.png")).await.unwrap();
        let second = queue.enqueue("not json").await.unwrap();

        let claimed = queue.receive(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first);
        assert_eq!(claimed[0].attempts, 1);

        let claimed = queue.receive(5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, second);

        queue.ack(first).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.receive(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_requeues_and_counts_attempts() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue("{}").await.unwrap();

        queue.receive(1).await.unwrap();
        queue.retry(id, "timeout").await.unwrap();

        let claimed = queue.receive(1).await.unwrap();
        assert_eq!(claimed[0].attempts, 2);
        assert_eq!(queue.entry(id).unwrap().last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn dead_letters_are_not_redelivered() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue("{}").await.unwrap();
        queue.receive(1).await.unwrap();
        queue.dead_letter(id, "poison").await.unwrap();

        assert!(queue.receive(1).await.unwrap().is_empty());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.requeue_stalled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stalled_deliveries_are_requeued() {
        let queue = MemoryQueue::new();
        queue.enqueue("{}").await.unwrap();
        queue.receive(1).await.unwrap();

        assert_eq!(queue.requeue_stalled().await.unwrap(), 1);
        assert_eq!(queue.receive(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_delivery_errors() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.ack(Uuid::new_v4()).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }
}
