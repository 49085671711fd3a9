use crate::pipeline::Pipeline;
use crate::queue::Delivery;
use async_channel::Receiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobCompleted(Uuid),
    JobFailed {
        delivery: Delivery,
        error: String,
        retryable: bool,
    },
}

// #[instrument(level = "info")]
pub async fn start(
    cancel_token: CancellationToken,
    pipeline: Pipeline,
    recv_from_queue: Receiver<Delivery>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            delivery = recv_from_queue.recv() => {
                match delivery {
                    Err(err) => {
                        debug!(message = "Queue channel closed, worker exiting", error = ?err);
                        break;
                    },
                    Ok(delivery) => {
                        let message = process(&pipeline, delivery, &send_to_server).await;
                        if send_to_server.send(message).is_err() {
                            error!("Server channel closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(delivery_id = %delivery.id, attempt = delivery.attempts))]
async fn process(
    pipeline: &Pipeline,
    delivery: Delivery,
    send_to_server: &UnboundedSender<WorkMessage>,
) -> WorkMessage {
    let _ = send_to_server.send(WorkMessage::JobStarted(delivery.id));

    match pipeline.handle(&delivery.payload).await {
        Ok(_) => WorkMessage::JobCompleted(delivery.id),
        Err(err) => {
            warn!(error = %err, payload = %delivery.payload, "Failed to process image");
            WorkMessage::JobFailed {
                retryable: err.is_retryable(),
                error: err.to_string(),
                delivery,
            }
        }
    }
}
