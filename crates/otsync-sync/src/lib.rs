//! Synchronization engine: reconciliation, the single-flight orchestrator,
//! the auto-update scheduler, release checks and the control task tying
//! them together.

use std::sync::Arc;

use anyhow::{Context, Result};
use otsync_adapters::{HtmlTableExportSource, JsonRowsSource, RemoteFetch};
use otsync_storage::{
    ExtractArchive, HttpReleaseFeed, JsonDocumentStore, MemoryRecordStore, RecordStore,
    SqliteRecordStore,
};
use tracing::info;

pub mod config;
pub mod controller;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod single_flight;
pub mod status;
pub mod version;

pub use config::{AppConfig, AppState, SyncEnv};
pub use controller::{
    ControlError, ControlHandle, Controller, Notification, StatusSnapshot, LOCAL_VERSION,
};
pub use orchestrator::{CompletedSync, SyncError, SyncOrchestrator};
pub use reconcile::{ReconcileCounts, ReconcileError, Reconciler};
pub use scheduler::{Scheduler, SchedulerPhase, Tick, TickDecision};
pub use single_flight::{SingleFlight, SyncPermit};
pub use status::{describe_outcome, failure_status, format_ok_status, startup_status, READY};
pub use version::{compare_versions, format_version_tag, is_newer, VersionChecker, VersionTriple};

/// Everything a front end needs, wired from the environment but not yet
/// running.
pub struct Runtime {
    pub controller: Controller,
    pub handle: ControlHandle,
    pub store: Arc<dyn RecordStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

pub async fn open_store(database_url: &str, memory: bool) -> Result<Arc<dyn RecordStore>> {
    if memory {
        return Ok(Arc::new(MemoryRecordStore::new()));
    }
    let store = SqliteRecordStore::connect(database_url)
        .await
        .with_context(|| format!("opening record store {database_url}"))?;
    Ok(Arc::new(store))
}

/// Load the configuration document, apply environment overrides and build
/// the controller over the export-directory source and the HTTP feed.
pub async fn bootstrap(env: &SyncEnv, memory: bool) -> Result<Runtime> {
    let document = JsonDocumentStore::new(&env.config_path);
    let mut state = AppState::load(document)
        .await
        .with_context(|| format!("loading {}", env.config_path.display()))?;
    state
        .apply_env(env)
        .await
        .context("saving environment overrides")?;

    let config = state.config().clone();
    let store = open_store(&config.database_url, memory).await?;
    let source: Arc<dyn RemoteFetch> = match &env.rows_json {
        Some(path) => Arc::new(JsonRowsSource::new(path)),
        None => Arc::new(
            HtmlTableExportSource::new(&config.export_dir)
                .with_archive(ExtractArchive::new(&config.archive_dir)),
        ),
    };
    let feed = HttpReleaseFeed::new(&config.release_url, &format!("otsync/{LOCAL_VERSION}"))?;
    info!(
        source = source.source_id(),
        export_dir = %config.export_dir.display(),
        release_url = feed.url(),
        memory,
        "runtime assembled"
    );

    let orchestrator = Arc::new(SyncOrchestrator::new(source, Arc::clone(&store)));
    let checker = Arc::new(VersionChecker::new(Arc::new(feed), LOCAL_VERSION));
    let (controller, handle) = Controller::new(state, Arc::clone(&orchestrator), checker);

    Ok(Runtime {
        controller,
        handle,
        store,
        orchestrator,
    })
}
