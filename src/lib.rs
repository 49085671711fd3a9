use serde::{Deserialize, Serialize};

pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod recorder;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod transform;
pub mod worker;

use error::PayloadError;

/// One unit of work: transcode a single image and attach the result to its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "product_id", alias = "record_id")]
    pub record_id: i32,
    #[serde(rename = "image_url", alias = "source_url")]
    pub source_url: String,
}

impl Job {
    pub fn new(record_id: i32, source_url: impl Into<String>) -> Self {
        Job {
            record_id,
            source_url: source_url.into(),
        }
    }

    /// Decodes a queue payload. Only the structured JSON form carries a record id,
    /// so a bare URL body is rejected like any other malformed payload.
    pub fn decode(payload: &str) -> Result<Self, PayloadError> {
        let job: Job = serde_json::from_str(payload).map_err(PayloadError::Malformed)?;
        if job.source_url.trim().is_empty() {
            return Err(PayloadError::MissingUrl);
        }
        Ok(job)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Record {
    pub id: i32,
    pub owner_id: i32,
    pub name: String,
    pub description: String,
    pub source_images: Vec<String>,
    pub result_images: Vec<String>,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub owner_id: i32,
    pub name: String,
    pub description: String,
    pub source_images: Vec<String>,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Processing,
    Dead,
}
