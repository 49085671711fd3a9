use anyhow::Error;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use imgq::config::{self, Command, ConfigContext, WorkArgs};
use imgq::db::DbHandle;
use imgq::pipeline::Pipeline;
use imgq::producer::Producer;
use imgq::recorder::RecordStore;
use imgq::server::{self, WorkResponseMessage};
use imgq::storage::dropbox::DropboxStore;
use imgq::storage::Publisher;
use imgq::telemetry;
use imgq::transform::ImageTransformer;
use imgq::NewRecord;

async fn work(
    cancel_token: CancellationToken,
    handle: DbHandle,
    args: WorkArgs,
) -> Result<(), Error> {
    let transformer = Arc::new(ImageTransformer::new(args.transform_config())?);
    let store = Arc::new(DropboxStore::new(args.dropbox_config())?);
    let pipeline = Pipeline::new(
        transformer,
        Publisher::new(store, args.link_lookup.clone()),
        Arc::new(handle.clone()),
        args.key_strategy,
    );

    // Channel for getting responses from server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let queue = Arc::new(handle);
        let server_config = args.server_config();
        tokio::spawn(
            async move {
                if let Err(err) =
                    server::serve(cancel_token, queue, pipeline, server_config, send_to_client)
                        .await
                {
                    error!("Error starting server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(WorkResponseMessage::JobCompleted(id)) => {
                        info!(event = "Completed", delivery_id = %id);
                    },
                    Some(WorkResponseMessage::JobRetried(id, err)) => {
                        warn!(event = "Retried", delivery_id = %id, error = %err);
                    },
                    Some(WorkResponseMessage::JobDeadLettered(id, err)) => {
                        error!(event = "DeadLettered", delivery_id = %id, error = %err);
                    },
                    Some(WorkResponseMessage::DatabaseQueueError(err)) => {
                        error!(event = "QueueError", error = %err);
                    },
                    None => {
                        debug!("Server connection closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    info!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let handle =
        DbHandle::new(&config.connect_url, config.max_connections, &config.queue).await?;
    info!("Connected to PostgreSQL database successfully!");

    match config.command {
        Command::Work(args) => work(cancel_token, handle, args).await?,
        Command::Submit(args) => {
            let records = Arc::new(handle.clone());
            let producer = Producer::new(records, Arc::new(handle));
            let record = producer
                .create_record(&NewRecord {
                    owner_id: args.owner_id,
                    name: args.name,
                    description: args.description,
                    source_images: args.images,
                    price: args.price,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Show { id } => {
            let record = handle.get_record(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::List => {
            let records = handle.list_records().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Purge => {
            let deleted = handle.delete_all_records().await?;
            info!(deleted, "All records deleted");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
