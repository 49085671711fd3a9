use crate::error::QueueError;
use crate::pipeline::Pipeline;
use crate::queue::{Delivery, JobQueue};
use crate::worker::{self, WorkMessage};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkResponseMessage {
    JobCompleted(Uuid),
    JobRetried(Uuid, String),
    JobDeadLettered(Uuid, String),
    DatabaseQueueError(QueueError),
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub workers: u16,
    /// Deliveries that fail retryably this many times are dead-lettered.
    pub max_attempts: i32,
    /// How long to wait before polling an empty queue again.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_attempts: 3,
            poll_interval: Duration::from_millis(500),
        }
    }
}

// #[instrument(level = "info")]
pub async fn serve(
    cancel_token: CancellationToken,
    queue: Arc<dyn JobQueue>,
    pipeline: Pipeline,
    config: ServerConfig,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) =
        async_channel::bounded::<Delivery>(config.workers.max(1) as usize);

    let mut workers = vec![];
    for _ in 0..config.workers {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let pipeline = pipeline.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, pipeline, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    // Workers own the only senders, so the channel closes once they have all exited.
    drop(send_to_server);

    let mut free_workers = config.workers as i64;

    // Deliveries claimed by a previous run never finished; put them back.
    let requeued = queue.requeue_stalled().await?;
    if requeued > 0 {
        info!(count = requeued, "Requeued stalled deliveries");
    }

    loop {
        if free_workers > 0 {
            match queue.receive(free_workers).await {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        send_to_queue.send(delivery).await?;
                        free_workers -= 1;
                    }
                }
                Err(err) => {
                    error!(message = "Failed to receive from queue", error = %err);
                    if !report(&send_to_client, WorkResponseMessage::DatabaseQueueError(err)) {
                        cancel_token.cancel();
                        break;
                    }
                }
            }
        }

        // Waiting for something to else to happen to continue...
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            // Poll the queue again when workers sit idle
            _ = sleep(config.poll_interval), if free_workers > 0 => {},
            // Handle responses from workers
            chan_msg = recv_from_worker.recv() => {
                let Some(msg) = chan_msg else {
                    debug!("Worker channel closed unexpectedly, exiting");
                    cancel_token.cancel();
                    break;
                };
                if let Some(response) = settle(&*queue, &config, msg, &mut free_workers).await {
                    if !report(&send_to_client, response) {
                        cancel_token.cancel();
                        break;
                    }
                }
            }
        }
    }

    // Stop handing out work, then settle whatever the workers finish on their way out.
    send_to_queue.close();
    while let Some(msg) = recv_from_worker.recv().await {
        if let Some(response) = settle(&*queue, &config, msg, &mut free_workers).await {
            report(&send_to_client, response);
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

/// Ack, retry or dead-letter the delivery a worker reported on.
async fn settle(
    queue: &dyn JobQueue,
    config: &ServerConfig,
    msg: WorkMessage,
    free_workers: &mut i64,
) -> Option<WorkResponseMessage> {
    match msg {
        WorkMessage::JobStarted(delivery_id) => {
            debug!(message = "Starting job", delivery_id = %delivery_id);
            None
        }
        WorkMessage::JobCompleted(delivery_id) => {
            debug!(message = "Completed job", delivery_id = %delivery_id);
            *free_workers += 1;
            Some(match queue.ack(delivery_id).await {
                Ok(()) => WorkResponseMessage::JobCompleted(delivery_id),
                Err(err) => WorkResponseMessage::DatabaseQueueError(err),
            })
        }
        WorkMessage::JobFailed {
            delivery,
            error,
            retryable,
        } => {
            *free_workers += 1;
            Some(settle_failure(queue, config, delivery, error, retryable).await)
        }
    }
}

async fn settle_failure(
    queue: &dyn JobQueue,
    config: &ServerConfig,
    delivery: Delivery,
    error: String,
    retryable: bool,
) -> WorkResponseMessage {
    if retryable && delivery.attempts < config.max_attempts {
        warn!(
            message = "Retrying job",
            delivery_id = %delivery.id,
            attempt = delivery.attempts,
            error = %error
        );
        match queue.retry(delivery.id, &error).await {
            Ok(()) => WorkResponseMessage::JobRetried(delivery.id, error),
            Err(err) => WorkResponseMessage::DatabaseQueueError(err),
        }
    } else {
        error!(
            message = "Dead-lettering job",
            delivery_id = %delivery.id,
            attempt = delivery.attempts,
            payload = %delivery.payload,
            error = %error
        );
        match queue.dead_letter(delivery.id, &error).await {
            Ok(()) => WorkResponseMessage::JobDeadLettered(delivery.id, error),
            Err(err) => WorkResponseMessage::DatabaseQueueError(err),
        }
    }
}

fn report(
    send_to_client: &mpsc::UnboundedSender<WorkResponseMessage>,
    message: WorkResponseMessage,
) -> bool {
    match send_to_client.send(message) {
        Ok(()) => true,
        Err(err) => {
            error!(message = "Failed to send response to client", error = ?err);
            false
        }
    }
}
