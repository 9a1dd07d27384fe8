//! Per-recipient delivery bookkeeping.
//!
//! The ledger is persisted as JSON next to the mirror after every mutation,
//! so separate invocations see the same pending state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use snapmatch_common::{Error, EventId, RecipientId, Result};

/// Delivery status of one recipient within one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientDeliveryRecord {
    pub recipient_id: RecipientId,
    pub event_id: EventId,
    /// Reference selfies on file.
    pub source_count: u32,
    /// Matched photos produced by the last successful job.
    pub matched_count: u32,
    pub packaged: bool,
    pub notified: bool,
    pub last_input_change_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl RecipientDeliveryRecord {
    fn new(event_id: EventId, recipient_id: RecipientId) -> Self {
        Self {
            recipient_id,
            event_id,
            source_count: 0,
            matched_count: 0,
            packaged: false,
            notified: false,
            last_input_change_at: None,
            last_processed_at: None,
        }
    }

    /// Whether the recipient has input that no job has processed yet.
    pub fn is_pending(&self) -> bool {
        if self.source_count == 0 {
            return false;
        }
        match (self.last_input_change_at, self.last_processed_at) {
            (_, None) => true,
            (Some(changed), Some(processed)) => changed > processed,
            (None, Some(_)) => false,
        }
    }
}

type Key = (EventId, RecipientId);

/// Store of [`RecipientDeliveryRecord`]s.
pub struct DeliveryLedger {
    /// `None` keeps the ledger in memory only.
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<Key, RecipientDeliveryRecord>>,
}

impl DeliveryLedger {
    /// Ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open the ledger at `path`, loading existing records.
    ///
    /// # Errors
    /// - `Serialization` if the file exists but cannot be parsed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let records = match fs::read_to_string(&path).await {
            Ok(content) => {
                let list: Vec<RecipientDeliveryRecord> = serde_json::from_str(&content)
                    .map_err(|e| {
                        Error::Serialization(format!("Corrupt ledger {}: {}", path.display(), e))
                    })?;
                list.into_iter()
                    .map(|r| ((r.event_id.clone(), r.recipient_id.clone()), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &BTreeMap<Key, RecipientDeliveryRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let list: Vec<&RecipientDeliveryRecord> = records.values().collect();
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json).await?;
        fs::rename(&temp, path).await?;
        debug!(path = %path.display(), records = list.len(), "Ledger persisted");
        Ok(())
    }

    /// Apply `update` to the record, creating it when absent, then persist.
    async fn update<F, T>(&self, event: &EventId, recipient: &RecipientId, update: F) -> Result<T>
    where
        F: FnOnce(&mut RecipientDeliveryRecord) -> Result<T>,
    {
        let mut records = self.records.lock().await;
        let record = records
            .entry((event.clone(), recipient.clone()))
            .or_insert_with(|| RecipientDeliveryRecord::new(event.clone(), recipient.clone()));
        let result = update(record)?;
        self.persist(&records).await?;
        Ok(result)
    }

    /// Register `added` new reference selfies for a recipient.
    pub async fn record_source(
        &self,
        event: &EventId,
        recipient: &RecipientId,
        added: u32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(event, recipient, |record| {
            record.source_count = record.source_count.saturating_add(added);
            record.last_input_change_at = Some(at);
            Ok(())
        })
        .await
    }

    /// New event photos change the input of every recipient of the event.
    pub async fn record_input_change_for_event(&self, event: &EventId, at: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().await;
        let mut touched = 0;
        for ((record_event, _), record) in records.iter_mut() {
            if record_event == event {
                record.last_input_change_at = Some(at);
                touched += 1;
            }
        }
        if touched > 0 {
            self.persist(&records).await?;
        }
        Ok(touched)
    }

    /// Record the outcome of a successful job for a recipient.
    ///
    /// `processed_at` is the job start time, so input that arrived while the
    /// job ran stays pending. Packaging and notification restart from false.
    pub async fn mark_processed(
        &self,
        event: &EventId,
        recipient: &RecipientId,
        source_count: u32,
        matched_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(event, recipient, |record| {
            record.source_count = source_count;
            record.matched_count = matched_count;
            record.last_processed_at = Some(processed_at);
            record.packaged = false;
            record.notified = false;
            Ok(())
        })
        .await
    }

    /// # Errors
    /// - `Precondition` unless a job has processed the recipient
    pub async fn mark_packaged(&self, event: &EventId, recipient: &RecipientId) -> Result<()> {
        self.update(event, recipient, |record| {
            require_processed(record, "packaged")?;
            record.packaged = true;
            Ok(())
        })
        .await
    }

    /// # Errors
    /// - `Precondition` unless a job has processed the recipient
    pub async fn mark_notified(&self, event: &EventId, recipient: &RecipientId) -> Result<()> {
        self.update(event, recipient, |record| {
            require_processed(record, "notified")?;
            record.notified = true;
            Ok(())
        })
        .await
    }

    pub async fn is_pending(&self, event: &EventId, recipient: &RecipientId) -> bool {
        self.get(event, recipient)
            .await
            .is_some_and(|record| record.is_pending())
    }

    pub async fn pending_recipients(&self, event: &EventId) -> Vec<RecipientId> {
        self.records(event)
            .await
            .into_iter()
            .filter(RecipientDeliveryRecord::is_pending)
            .map(|record| record.recipient_id)
            .collect()
    }

    pub async fn get(&self, event: &EventId, recipient: &RecipientId) -> Option<RecipientDeliveryRecord> {
        self.records
            .lock()
            .await
            .get(&(event.clone(), recipient.clone()))
            .cloned()
    }

    /// All records of an event, ordered by recipient.
    pub async fn records(&self, event: &EventId) -> Vec<RecipientDeliveryRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|((record_event, _), _)| record_event == event)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Drop every record of an event.
    pub async fn remove_event(&self, event: &EventId) -> Result<usize> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|(record_event, _), _| record_event != event);
        let removed = before - records.len();
        if removed > 0 {
            self.persist(&records).await?;
        }
        Ok(removed)
    }
}

fn require_processed(record: &RecipientDeliveryRecord, flag: &str) -> Result<()> {
    if record.last_processed_at.is_none() {
        return Err(Error::Precondition(format!(
            "Recipient {} of event {} cannot be marked {} before a successful job",
            record.recipient_id, record.event_id, flag
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn ids() -> (EventId, RecipientId) {
        (EventId::new("e1").unwrap(), RecipientId::new("bob").unwrap())
    }

    #[tokio::test]
    async fn test_new_source_is_pending() {
        let ledger = DeliveryLedger::in_memory();
        let (event, bob) = ids();

        assert!(!ledger.is_pending(&event, &bob).await);
        ledger.record_source(&event, &bob, 1, Utc::now()).await.unwrap();

        assert!(ledger.is_pending(&event, &bob).await);
        assert_eq!(ledger.pending_recipients(&event).await, vec![bob]);
    }

    #[tokio::test]
    async fn test_processing_clears_pending_until_next_change() {
        let ledger = DeliveryLedger::in_memory();
        let (event, bob) = ids();
        let t0 = Utc::now();

        ledger.record_source(&event, &bob, 1, t0).await.unwrap();
        ledger
            .mark_processed(&event, &bob, 1, 2, t0 + Duration::seconds(1))
            .await
            .unwrap();
        assert!(!ledger.is_pending(&event, &bob).await);

        // Photos added after the job started make bob pending again.
        let touched = ledger
            .record_input_change_for_event(&event, t0 + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(touched, 1);
        assert!(ledger.is_pending(&event, &bob).await);
    }

    #[tokio::test]
    async fn test_input_during_job_stays_pending() {
        let ledger = DeliveryLedger::in_memory();
        let (event, bob) = ids();
        let started = Utc::now();

        ledger
            .record_source(&event, &bob, 1, started + Duration::seconds(5))
            .await
            .unwrap();
        ledger.mark_processed(&event, &bob, 2, 1, started).await.unwrap();

        assert!(ledger.is_pending(&event, &bob).await);
    }

    #[tokio::test]
    async fn test_no_source_never_pending() {
        let record = RecipientDeliveryRecord::new(ids().0, ids().1);
        assert!(!record.is_pending());
    }

    #[tokio::test]
    async fn test_packaged_requires_processed() {
        let ledger = DeliveryLedger::in_memory();
        let (event, bob) = ids();
        ledger.record_source(&event, &bob, 1, Utc::now()).await.unwrap();

        assert!(matches!(
            ledger.mark_packaged(&event, &bob).await,
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            ledger.mark_notified(&event, &bob).await,
            Err(Error::Precondition(_))
        ));

        ledger.mark_processed(&event, &bob, 1, 1, Utc::now()).await.unwrap();
        ledger.mark_packaged(&event, &bob).await.unwrap();
        ledger.mark_notified(&event, &bob).await.unwrap();

        let record = ledger.get(&event, &bob).await.unwrap();
        assert!(record.packaged && record.notified);
        assert_eq!(record.matched_count, 1);
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/ledger.json");
        let (event, bob) = ids();

        {
            let ledger = DeliveryLedger::open(&path).await.unwrap();
            ledger.record_source(&event, &bob, 3, Utc::now()).await.unwrap();
        }

        let ledger = DeliveryLedger::open(&path).await.unwrap();
        let record = ledger.get(&event, &bob).await.unwrap();
        assert_eq!(record.source_count, 3);
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            DeliveryLedger::open(&path).await,
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_event() {
        let ledger = DeliveryLedger::in_memory();
        let (event, bob) = ids();
        let other = EventId::new("e2").unwrap();
        ledger.record_source(&event, &bob, 1, Utc::now()).await.unwrap();
        ledger.record_source(&other, &bob, 1, Utc::now()).await.unwrap();

        assert_eq!(ledger.remove_event(&event).await.unwrap(), 1);
        assert!(ledger.records(&event).await.is_empty());
        assert_eq!(ledger.records(&other).await.len(), 1);
    }
}
