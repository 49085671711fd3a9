use crate::error::{QueueError, RecordError};
use crate::queue::{Delivery, JobQueue};
use crate::recorder::{RecordStore, ResultRecorder};
use crate::{NewRecord, Record};
use anyhow::Error;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, user_id AS owner_id, product_name AS name, \
    product_description AS description, product_images AS source_images, \
    coalesce(compressed_product_images, '{}'::text[]) AS result_images, \
    product_price AS price";

/// Shared PostgreSQL handle: the durable queue and the product records live here.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
    queue: String,
}

impl DbHandle {
    // #[instrument(name = "db.new")]
    pub async fn new(url: &str, max_connections: u32, queue: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for DbHandle {
    async fn enqueue(&self, payload: &str) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO job_queue (id, queue, payload, status) VALUES ($1, $2, $3, 'QUEUED')")
            .bind(id)
            .bind(&self.queue)
            .bind(payload)
            .execute(&*self.pool)
            .await?;

        debug!(delivery_id = %id, queue = %self.queue, "Enqueued message");
        Ok(id)
    }

    async fn receive(&self, limit: i64) -> Result<Vec<Delivery>, QueueError> {
        Ok(sqlx::query_as::<_, Delivery>(
            "UPDATE job_queue \
                SET status = 'PROCESSING', \
                attempts = attempts + 1, \
                started_at = now() \
            WHERE id IN ( \
                SELECT id FROM job_queue \
                WHERE queue = $1 AND status = 'QUEUED' \
                ORDER BY enqueued_at ASC \
                LIMIT $2 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, payload, attempts",
        )
        .bind(&self.queue)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?)
    }

    // #[instrument(name = "db.ack", skip_all, fields(delivery_id = %id))]
    async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(id));
        }
        Ok(())
    }

    async fn retry(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue \
                SET status = 'QUEUED', \
                last_error = $1 \
            WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(id));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue \
                SET status = 'DEAD', \
                last_error = $1 \
            WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(id));
        }
        Ok(())
    }

    async fn requeue_stalled(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue \
                SET status = 'QUEUED' \
            WHERE queue = $1 AND status = 'PROCESSING'",
        )
        .bind(&self.queue)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ResultRecorder for DbHandle {
    // Single statement; PostgreSQL row locking serialises concurrent appends.
    async fn record(&self, record_id: i32, shareable_url: &str) -> Result<(), RecordError> {
        let result = sqlx::query(
            "UPDATE products \
                SET compressed_product_images = \
                    array_append(coalesce(compressed_product_images, '{}'::text[]), $1) \
            WHERE id = $2",
        )
        .bind(shareable_url)
        .bind(record_id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RecordError::NotFound(record_id));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for DbHandle {
    async fn create_record(&self, new: &NewRecord) -> Result<Record, RecordError> {
        debug!("Inserting record {:?}", new);
        let query = format!(
            "INSERT INTO products \
            (user_id, product_name, product_description, product_images, product_price) \
            VALUES ($1, $2, $3, $4, $5) \
            RETURNING {RECORD_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Record>(&query)
            .bind(new.owner_id)
            .bind(&new.name)
            .bind(&new.description)
            .bind(&new.source_images)
            .bind(new.price)
            .fetch_one(&*self.pool)
            .await?)
    }

    async fn get_record(&self, id: i32) -> Result<Record, RecordError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM products WHERE id = $1");
        sqlx::query_as::<_, Record>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or(RecordError::NotFound(id))
    }

    async fn list_records(&self) -> Result<Vec<Record>, RecordError> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM products ORDER BY id");
        Ok(sqlx::query_as::<_, Record>(&query)
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn delete_all_records(&self) -> Result<u64, RecordError> {
        let result = sqlx::query("DELETE FROM products")
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
