use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to fetch image: {0}")]
    Fetch(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// What went wrong talking to the object store, as the store client classified it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    LinkAlreadyExists,
    NotFound,
    Unauthorized,
    Transport,
    Api,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    /// Link url the provider handed back alongside a conflict, if any.
    pub existing_url: Option<String>,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        StorageError {
            kind,
            message: message.into(),
            existing_url: None,
        }
    }

    pub fn link_exists(existing_url: Option<String>) -> Self {
        StorageError {
            kind: StorageErrorKind::LinkAlreadyExists,
            message: "shared link already exists".into(),
            existing_url,
        }
    }

    pub fn is_link_conflict(&self) -> bool {
        self.kind == StorageErrorKind::LinkAlreadyExists
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::new(StorageErrorKind::Transport, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to upload {key}: {source}")]
    Upload { key: String, source: StorageError },
    #[error("failed to create shared link for {key}: {source}")]
    LinkCreate { key: String, source: StorageError },
    #[error("failed to retrieve existing shared link for {key}: {reason}")]
    LinkLookup { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record {0} not found")]
    NotFound(i32),
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload has no image url")]
    MissingUrl,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unknown delivery {0}")]
    UnknownDelivery(uuid::Uuid),
}

/// Everything that can end a single job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl JobError {
    /// Transient failures go back on the queue; the rest are poison and get dead-lettered.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Payload(_) => false,
            JobError::Transform(TransformError::Fetch(_)) => true,
            JobError::Transform(_) => false,
            JobError::Publish(PublishError::Upload { source, .. })
            | JobError::Publish(PublishError::LinkCreate { source, .. }) => {
                source.kind != StorageErrorKind::Unauthorized
            }
            JobError::Publish(PublishError::LinkLookup { .. }) => true,
            JobError::Record(RecordError::NotFound(_)) => false,
            JobError::Record(RecordError::Persistence(_)) => true,
        }
    }
}
