use crate::error::RecordError;
use crate::{NewRecord, Record};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Appends published links to a record's result list.
///
/// Implementations must append atomically on the store side; concurrent calls for
/// the same record may never lose an entry. Appending the same url twice keeps both.
#[async_trait]
pub trait ResultRecorder: Send + Sync {
    async fn record(&self, record_id: i32, shareable_url: &str) -> Result<(), RecordError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, record: &NewRecord) -> Result<Record, RecordError>;
    async fn get_record(&self, id: i32) -> Result<Record, RecordError>;
    async fn list_records(&self) -> Result<Vec<Record>, RecordError>;
    async fn delete_all_records(&self) -> Result<u64, RecordError>;
}

#[derive(Default)]
pub struct MemoryRecords {
    records: Mutex<BTreeMap<i32, Record>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultRecorder for MemoryRecords {
    async fn record(&self, record_id: i32, shareable_url: &str) -> Result<(), RecordError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&record_id)
            .ok_or(RecordError::NotFound(record_id))?;
        record.result_images.push(shareable_url.to_string());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecords {
    async fn create_record(&self, new: &NewRecord) -> Result<Record, RecordError> {
        let mut records = self.records.lock().unwrap();
        let id = records.keys().next_back().map_or(1, |last| last + 1);
        let record = Record {
            id,
            owner_id: new.owner_id,
            name: new.name.clone(),
            description: new.description.clone(),
            source_images: new.source_images.clone(),
            result_images: vec![],
            price: new.price,
        };
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn get_record(&self, id: i32) -> Result<Record, RecordError> {
        self.records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RecordError::NotFound(id))
    }

    async fn list_records(&self) -> Result<Vec<Record>, RecordError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn delete_all_records(&self) -> Result<u64, RecordError> {
        let mut records = self.records.lock().unwrap();
        let count = records.len() as u64;
        records.clear();
        Ok(count)
    }
}
