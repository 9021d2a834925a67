use chrono::NaiveDate;
use otsync_core::Record;
use otsync_storage::{RecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {key} is malformed: {reason}")]
pub struct ReconcileError {
    pub key: String,
    pub reason: String,
}

/// Normalized records always carry an ISO date or none at all.
fn validate(record: &Record) -> Result<(), ReconcileError> {
    let date = &record.fields.date;
    if !date.is_empty() && NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        return Err(ReconcileError {
            key: record.key.to_string(),
            reason: format!("date {date:?} is not YYYY-MM-DD"),
        });
    }
    Ok(())
}

/// Merges a batch into the store: inserts unknown keys, overwrites records
/// whose fields changed, leaves everything else (including keys missing
/// from the batch) alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    pub async fn reconcile(
        &self,
        store: &dyn RecordStore,
        records: &[Record],
    ) -> Result<ReconcileCounts, StoreError> {
        let mut counts = ReconcileCounts::default();

        for record in records {
            if let Err(err) = validate(record) {
                warn!(%err, "skipping malformed record");
                counts.skipped += 1;
                continue;
            }

            let incoming = Record::new(record.key.clone(), record.fields.normalized());
            match store.get(&record.key).await? {
                None => {
                    store.upsert(&incoming).await?;
                    counts.new += 1;
                }
                Some(existing) if existing.fields.differs_from(&incoming.fields) => {
                    store.upsert(&incoming).await?;
                    counts.updated += 1;
                }
                Some(_) => counts.unchanged += 1,
            }
        }

        info!(
            new = counts.new,
            updated = counts.updated,
            unchanged = counts.unchanged,
            skipped = counts.skipped,
            "reconciled batch"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otsync_core::{RecordFields, RecordKey};
    use otsync_storage::{MemoryRecordStore, RecordFilter, SqliteRecordStore};

    fn record(key: &str, description: &str) -> Record {
        Record::new(
            RecordKey::parse(key).unwrap(),
            RecordFields {
                description: description.into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn empty_store_takes_every_distinct_record_as_new() {
        let store = MemoryRecordStore::new();
        let batch = vec![record("OT-1", "a"), record("OT-2", "b"), record("OT-3", "c")];
        let counts = Reconciler.reconcile(&store, &batch).await.unwrap();
        assert_eq!((counts.new, counts.updated), (3, 0));
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn identical_records_are_left_alone() {
        let store = MemoryRecordStore::with_records([record("OT-1", "A")]);
        let batch = vec![record("OT-1", "A"), record("OT-2", "new")];
        let counts = Reconciler.reconcile(&store, &batch).await.unwrap();
        assert_eq!((counts.new, counts.updated, counts.unchanged), (1, 0, 1));
    }

    #[tokio::test]
    async fn second_pass_over_the_same_batch_changes_nothing() {
        let store = SqliteRecordStore::open_in_memory().await.unwrap();
        let batch = vec![record("OT-1", "a"), record("OT-2", "b")];
        Reconciler.reconcile(&store, &batch).await.unwrap();
        let again = Reconciler.reconcile(&store, &batch).await.unwrap();
        assert_eq!((again.new, again.updated), (0, 0));
        assert_eq!(again.unchanged, 2);
    }

    #[tokio::test]
    async fn space_variant_key_with_one_changed_field_is_an_update() {
        let store = MemoryRecordStore::with_records([record("OT 7", "old")]);
        let batch = vec![record("OT\u{00a0}7", "new")];
        let counts = Reconciler.reconcile(&store, &batch).await.unwrap();
        assert_eq!((counts.new, counts.updated), (0, 1));

        let stored = store
            .get(&RecordKey::parse("OT 7").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields.description, "new");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn whitespace_only_differences_are_not_updates() {
        let store = MemoryRecordStore::with_records([record("OT-1", "Pump\u{00a0}seal ")]);
        let counts = Reconciler
            .reconcile(&store, &[record("OT-1", "Pump seal")])
            .await
            .unwrap();
        assert_eq!(counts.updated, 0);
        assert_eq!(counts.unchanged, 1);
    }

    #[tokio::test]
    async fn last_duplicate_in_batch_wins() {
        let store = MemoryRecordStore::new();
        let batch = vec![record("OT-1", "first"), record("OT-1", "second")];
        let counts = Reconciler.reconcile(&store, &batch).await.unwrap();
        assert_eq!((counts.new, counts.updated), (1, 1));
        let stored = store
            .get(&RecordKey::parse("OT-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields.description, "second");
    }

    #[tokio::test]
    async fn keys_missing_from_the_batch_are_kept() {
        let store = MemoryRecordStore::with_records([record("OT-OLD", "x")]);
        Reconciler
            .reconcile(&store, &[record("OT-NEW", "y")])
            .await
            .unwrap();
        let all = store.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let store = MemoryRecordStore::new();
        let mut bad = record("OT-BAD", "x");
        bad.fields.date = "24/02/26".into();
        let batch = vec![bad, record("OT-GOOD", "y")];
        let counts = Reconciler.reconcile(&store, &batch).await.unwrap();
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.new, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
