use std::sync::Arc;

use chrono::Utc;
use otsync_adapters::{FetchContext, FetchError, Normalizer, RemoteFetch};
use otsync_core::{ErrorInfo, ErrorKind, SyncOutcome, SyncTrigger};
use otsync_storage::{RecordStore, StoreError};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::reconcile::{ReconcileCounts, Reconciler};
use crate::single_flight::{SingleFlight, SyncPermit};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error("credentials are not configured")]
    MissingCredentials,
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("record store failed: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::AlreadyRunning => ErrorKind::AlreadyRunning,
            SyncError::MissingCredentials => ErrorKind::MissingCredentials,
            SyncError::Fetch(_) => ErrorKind::Fetch,
            SyncError::Store(_) => ErrorKind::Store,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            detail: self.to_string(),
        }
    }
}

/// A finished cycle that still holds the single-flight gate. The gate opens
/// when this is released or dropped, so the caller can persist the outcome
/// first.
#[derive(Debug)]
pub struct CompletedSync {
    pub trigger: SyncTrigger,
    pub outcome: SyncOutcome,
    pub clients: Vec<String>,
    pub counts: ReconcileCounts,
    permit: Option<SyncPermit>,
}

impl CompletedSync {
    fn rejected(trigger: SyncTrigger, err: SyncError) -> Self {
        Self {
            trigger,
            outcome: SyncOutcome::failed(Utc::now(), err.to_info()),
            clients: Vec::new(),
            counts: ReconcileCounts::default(),
            permit: None,
        }
    }

    pub fn release(mut self) {
        self.permit.take();
    }
}

/// One end-to-end cycle: fetch, normalize, reconcile.
pub struct SyncOrchestrator {
    source: Arc<dyn RemoteFetch>,
    store: Arc<dyn RecordStore>,
    normalizer: Normalizer,
    reconciler: Reconciler,
    gate: SingleFlight,
}

impl SyncOrchestrator {
    pub fn new(source: Arc<dyn RemoteFetch>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            source,
            store,
            normalizer: Normalizer::default(),
            reconciler: Reconciler,
            gate: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_running()
    }

    pub fn try_acquire(&self) -> Result<SyncPermit, SyncError> {
        self.gate.try_acquire().ok_or(SyncError::AlreadyRunning)
    }

    /// Acquire the gate and run a cycle. A concurrent call gets an
    /// `AlreadyRunning` outcome without touching the store.
    pub async fn run_sync(&self, trigger: SyncTrigger, ctx: FetchContext) -> CompletedSync {
        match self.try_acquire() {
            Ok(permit) => self.run_with_permit(permit, trigger, ctx).await,
            Err(err) => CompletedSync::rejected(trigger, err),
        }
    }

    pub async fn run_with_permit(
        &self,
        permit: SyncPermit,
        trigger: SyncTrigger,
        ctx: FetchContext,
    ) -> CompletedSync {
        let span = info_span!("sync_run", %trigger, source = self.source.source_id());
        let result = self.cycle(&ctx).instrument(span).await;

        let (outcome, clients, counts) = match result {
            Ok((counts, rejected, clients)) => (
                SyncOutcome::succeeded(Utc::now(), counts.new, counts.updated)
                    .with_rejected(rejected),
                clients,
                counts,
            ),
            Err(err) => {
                warn!(%trigger, error = %err, "sync cycle failed");
                (
                    SyncOutcome::failed(Utc::now(), err.to_info()),
                    Vec::new(),
                    ReconcileCounts::default(),
                )
            }
        };

        CompletedSync {
            trigger,
            outcome,
            clients,
            counts,
            permit: Some(permit),
        }
    }

    async fn cycle(
        &self,
        ctx: &FetchContext,
    ) -> Result<(ReconcileCounts, u64, Vec<String>), SyncError> {
        if self.source.requires_credentials()
            && !ctx.credentials.as_ref().is_some_and(|c| c.is_complete())
        {
            return Err(SyncError::MissingCredentials);
        }

        let rows = self.source.fetch_batch(ctx).await?;
        let batch = self.normalizer.normalize_batch(&rows);
        let counts = self
            .reconciler
            .reconcile(self.store.as_ref(), &batch.records)
            .await?;
        info!(
            rows = rows.len(),
            new = counts.new,
            updated = counts.updated,
            rejected = batch.rejected.len(),
            "sync cycle complete"
        );
        let rejected = batch.rejected.len() as u64 + counts.skipped;
        Ok((counts, rejected, batch.clients))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otsync_adapters::{Credentials, RawRow};
    use otsync_storage::MemoryRecordStore;

    struct StaticSource {
        rows: Vec<RawRow>,
        needs_credentials: bool,
    }

    #[async_trait]
    impl RemoteFetch for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        fn requires_credentials(&self) -> bool {
            self.needs_credentials
        }

        async fn fetch_batch(&self, _ctx: &FetchContext) -> Result<Vec<RawRow>, FetchError> {
            if self.rows.is_empty() {
                return Err(FetchError::Unavailable("source offline".into()));
            }
            Ok(self.rows.clone())
        }
    }

    fn row(key: &str, client: &str) -> RawRow {
        RawRow::new(vec![
            Some(key.to_string()),
            Some("desc".into()),
            None,
            Some("01/03/26 07:00:00".into()),
            Some(client.to_string()),
        ])
    }

    fn orchestrator(rows: Vec<RawRow>, needs_credentials: bool) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(StaticSource {
                rows,
                needs_credentials,
            }),
            Arc::new(MemoryRecordStore::new()),
        )
    }

    #[tokio::test]
    async fn successful_cycle_counts_new_records_and_rejections() {
        let orch = orchestrator(
            vec![row("OT-1", "ACME"), row(" ", "ACME"), row("OT-2", "Globex")],
            false,
        );
        let done = orch
            .run_sync(SyncTrigger::Manual, FetchContext::now(None))
            .await;
        assert!(done.outcome.is_success());
        assert_eq!(done.outcome.new_count, 2);
        assert_eq!(done.outcome.rejected_count, 1);
        assert_eq!(done.clients, vec!["ACME".to_string(), "Globex".to_string()]);
        assert!(orch.is_running());
        done.release();
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn gate_is_held_until_the_completion_is_released() {
        let orch = orchestrator(vec![row("OT-1", "ACME")], false);
        let first = orch
            .run_sync(SyncTrigger::Scheduled, FetchContext::now(None))
            .await;
        let second = orch
            .run_sync(SyncTrigger::Manual, FetchContext::now(None))
            .await;
        assert_eq!(
            second.outcome.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::AlreadyRunning)
        );
        drop(second);
        assert!(orch.is_running());
        drop(first);
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn fetch_failure_yields_failed_outcome() {
        let orch = orchestrator(Vec::new(), false);
        let done = orch
            .run_sync(SyncTrigger::Manual, FetchContext::now(None))
            .await;
        let error = done.outcome.error.clone().expect("failure");
        assert_eq!(error.kind, ErrorKind::Fetch);
        assert!(error.detail.contains("source offline"));
        assert_eq!(orch.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credential_gated_sources_refuse_to_run_without_credentials() {
        let orch = orchestrator(vec![row("OT-1", "ACME")], true);
        let done = orch
            .run_sync(SyncTrigger::Manual, FetchContext::now(None))
            .await;
        assert_eq!(
            done.outcome.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::MissingCredentials)
        );
        done.release();

        let creds = Credentials {
            username: "tech".into(),
            password: "pw".into(),
        };
        let done = orch
            .run_sync(SyncTrigger::Manual, FetchContext::now(Some(creds)))
            .await;
        assert!(done.outcome.is_success());
    }
}
