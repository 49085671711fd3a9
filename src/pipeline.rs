use crate::error::JobError;
use crate::recorder::ResultRecorder;
use crate::storage::{KeyStrategy, Publisher, StorageKey};
use crate::transform::ImageTransformer;
use crate::Job;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, instrument};

/// Transform, publish and record for one job. Each step runs only if the previous
/// one succeeded; nothing is rolled back, so a failed record step leaves the
/// uploaded artifact and its link in storage.
#[derive(Clone)]
pub struct Pipeline {
    transformer: Arc<ImageTransformer>,
    publisher: Publisher,
    recorder: Arc<dyn ResultRecorder>,
    key_strategy: KeyStrategy,
}

impl Pipeline {
    pub fn new(
        transformer: Arc<ImageTransformer>,
        publisher: Publisher,
        recorder: Arc<dyn ResultRecorder>,
        key_strategy: KeyStrategy,
    ) -> Self {
        Self {
            transformer,
            publisher,
            recorder,
            key_strategy,
        }
    }

    /// Decode a raw queue payload and process it.
    pub async fn handle(&self, payload: &str) -> Result<String, JobError> {
        let job = Job::decode(payload)?;
        self.process(&job).await
    }

    #[instrument(skip(self, job), fields(record_id = job.record_id, source_url = %job.source_url))]
    pub async fn process(&self, job: &Job) -> Result<String, JobError> {
        let encoded = self
            .transformer
            .fetch_and_transform(&job.source_url)
            .await?;

        let key = StorageKey::derive(self.key_strategy, job.record_id, &job.source_url);
        let url = self.publisher.publish(Bytes::from(encoded), &key).await?;

        self.recorder.record(job.record_id, &url).await?;

        info!(key = %key, url = %url, "Image processed and saved");
        Ok(url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{PublishError, RecordError, TransformError};
    use crate::recorder::{MemoryRecords, RecordStore};
    use crate::storage::memory::MemoryStore;
    use crate::storage::LinkLookup;
    use crate::transform::tests::sample_image;
    use crate::transform::TransformConfig;
    use crate::NewRecord;
    use image::ImageOutputFormat;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) struct Harness {
        pub origin: MockServer,
        pub store: Arc<MemoryStore>,
        pub records: Arc<MemoryRecords>,
        pub pipeline: Pipeline,
    }

    pub(crate) async fn harness(store: MemoryStore, fetch_timeout: Duration) -> Harness {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sample_image(ImageOutputFormat::Png), "image/png"),
            )
            .mount(&origin)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sample_image(ImageOutputFormat::Png), "image/png")
                    .set_delay(fetch_timeout * 10),
            )
            .mount(&origin)
            .await;
        Mock::given(method("GET"))
            .and(path("/delayed.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sample_image(ImageOutputFormat::Png), "image/png")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&origin)
            .await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .mount(&origin)
            .await;

        let store = Arc::new(store);
        let records = Arc::new(MemoryRecords::new());
        let transformer = Arc::new(
            ImageTransformer::new(TransformConfig {
                fetch_timeout,
                ..TransformConfig::default()
            })
            .unwrap(),
        );
        let pipeline = Pipeline::new(
            transformer,
            Publisher::new(store.clone(), LinkLookup::List),
            records.clone(),
            KeyStrategy::Filename,
        );

        Harness {
            origin,
            store,
            records,
            pipeline,
        }
    }

    pub(crate) async fn seed_record(records: &MemoryRecords) -> i32 {
        records
            .create_record(&NewRecord {
                owner_id: 1,
                name: "lamp".into(),
                description: String::new(),
                source_images: vec![],
                price: 10.0,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn processes_job_end_to_end() {
        let h = harness(MemoryStore::new(), Duration::from_secs(10)).await;
        let id = seed_record(&h.records).await;
        let job = Job::new(id, format!("{}/a.png?x=1", h.origin.uri()));

        let url = h.pipeline.process(&job).await.unwrap();

        assert!(h.store.object("/a.jpg").is_some());
        assert_eq!(url, format!("{}/a.jpg", crate::storage::memory::LINK_BASE));
        assert_eq!(h.records.get_record(id).await.unwrap().result_images, vec![url]);
    }

    #[tokio::test]
    async fn redelivery_appends_same_link_again() {
        let h = harness(MemoryStore::new().with_bare_conflicts(), Duration::from_secs(10)).await;
        let id = seed_record(&h.records).await;
        let payload = format!(
            r#"{{"product_id": {id}, "image_url": "{}/a.png?x=1"}}"#,
            h.origin.uri()
        );

        let first = h.pipeline.handle(&payload).await.unwrap();
        let second = h.pipeline.handle(&payload).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            h.records.get_record(id).await.unwrap().result_images,
            vec![first.clone(), first]
        );
    }

    #[tokio::test]
    async fn fetch_timeout_has_no_side_effects() {
        let h = harness(MemoryStore::new(), Duration::from_millis(50)).await;
        let id = seed_record(&h.records).await;
        let job = Job::new(id, format!("{}/slow.png", h.origin.uri()));

        let err = h.pipeline.process(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Transform(TransformError::Fetch(_))));
        assert_eq!(h.store.object_count(), 0);
        assert!(h.records.get_record(id).await.unwrap().result_images.is_empty());
    }

    #[tokio::test]
    async fn non_image_is_unsupported() {
        let h = harness(MemoryStore::new(), Duration::from_secs(10)).await;
        let id = seed_record(&h.records).await;
        let job = Job::new(id, format!("{}/page.html", h.origin.uri()));

        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Transform(TransformError::UnsupportedFormat(_))
        ));
        assert_eq!(h.store.object_count(), 0);
    }

    #[tokio::test]
    async fn missing_record_leaves_orphaned_artifact() {
        let h = harness(MemoryStore::new(), Duration::from_secs(10)).await;
        let job = Job::new(404, format!("{}/a.png", h.origin.uri()));

        let err = h.pipeline.process(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Record(RecordError::NotFound(404))));
        assert!(h.store.object("/a.jpg").is_some());
        assert_eq!(h.store.link_count(), 1);
    }

    #[tokio::test]
    async fn upload_failure_skips_record() {
        let h = harness(MemoryStore::new(), Duration::from_secs(10)).await;
        h.store.fail_uploads(true);
        let id = seed_record(&h.records).await;
        let job = Job::new(id, format!("{}/a.png", h.origin.uri()));

        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Publish(PublishError::Upload { .. })));
        assert!(h.records.get_record(id).await.unwrap().result_images.is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let h = harness(MemoryStore::new(), Duration::from_secs(10)).await;
        let err = h.pipeline.handle("\u{fffd}not json").await.unwrap_err();
        assert!(matches!(err, JobError::Payload(_)));
        assert!(!err.is_retryable());
    }
}
