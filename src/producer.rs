use crate::error::{QueueError, RecordError};
use crate::queue::{enqueue_job, JobQueue};
use crate::recorder::RecordStore;
use crate::{Job, NewRecord, Record};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("failed to enqueue image url: {0}")]
    Enqueue(#[from] QueueError),
}

/// Saves records and enqueues one job per source image.
#[derive(Clone)]
pub struct Producer {
    records: Arc<dyn RecordStore>,
    queue: Arc<dyn JobQueue>,
}

impl Producer {
    pub fn new(records: Arc<dyn RecordStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { records, queue }
    }

    pub async fn create_record(&self, new: &NewRecord) -> Result<Record, ProduceError> {
        let record = self.records.create_record(new).await?;

        for source_url in &record.source_images {
            let job = Job::new(record.id, source_url.clone());
            enqueue_job(&*self.queue, &job).await?;
        }

        info!(
            record_id = record.id,
            images = record.source_images.len(),
            "Enqueued record images"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::recorder::MemoryRecords;

    #[tokio::test]
    async fn enqueues_one_job_per_image_in_order() {
        let records = Arc::new(MemoryRecords::new());
        let queue = Arc::new(MemoryQueue::new());
        let producer = Producer::new(records.clone(), queue.clone());

        let record = producer
            .create_record(&NewRecord {
                owner_id: 4,
                name: "chair".into(),
                description: "oak".into(),
                source_images: vec!["https://x/a.png".into(), "https://x/b.gif".into()],
                price: 99.0,
            })
            .await
            .unwrap();

        let jobs: Vec<Job> = queue
            .receive(10)
            .await
            .unwrap()
            .iter()
            .map(|d| Job::decode(&d.payload).unwrap())
            .collect();
        assert_eq!(
            jobs,
            vec![
                Job::new(record.id, "https://x/a.png"),
                Job::new(record.id, "https://x/b.gif"),
            ]
        );
        assert!(records.get_record(record.id).await.unwrap().result_images.is_empty());
    }

    #[tokio::test]
    async fn record_without_images_enqueues_nothing() {
        let queue = Arc::new(MemoryQueue::new());
        let producer = Producer::new(Arc::new(MemoryRecords::new()), queue.clone());

        producer
            .create_record(&NewRecord {
                owner_id: 1,
                name: "empty".into(),
                description: String::new(),
                source_images: vec![],
                price: 0.0,
            })
            .await
            .unwrap();
        assert!(queue.is_empty());
    }
}
