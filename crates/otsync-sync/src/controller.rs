//! The control task. It owns the configuration document, the scheduler and
//! the status line; sync cycles and release checks run on spawned workers
//! that report back over a channel drained here one message at a time.

use std::sync::Arc;

use otsync_adapters::{Credentials, FetchContext};
use otsync_core::{SyncOutcome, SyncTrigger, VersionInfo};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppState;
use crate::orchestrator::{CompletedSync, SyncOrchestrator};
use crate::scheduler::{Scheduler, SchedulerPhase, Tick, TickDecision};
use crate::status::{failure_status, format_ok_status, startup_status};
use crate::version::{format_version_tag, is_newer, VersionChecker};

pub const LOCAL_VERSION: &str = env!("CARGO_PKG_VERSION");

const COMMAND_BUFFER: usize = 64;
const NOTIFY_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control task is no longer running")]
    Gone,
    #[error("saving configuration failed: {0}")]
    Config(String),
}

/// Events for whoever renders state: the web layer, the CLI, tests.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    SyncStarted {
        trigger: SyncTrigger,
    },
    SyncFinished {
        trigger: SyncTrigger,
        outcome: SyncOutcome,
        status: String,
    },
    ClientsUpdated {
        clients: Vec<String>,
    },
    VersionRefreshed {
        info: VersionInfo,
    },
    UpdateAvailable {
        tag: String,
        display_tag: String,
        url: String,
    },
    ScheduleChanged {
        enabled: bool,
        interval_min: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status_line: String,
    pub phase: SchedulerPhase,
    pub auto_update_enabled: bool,
    pub auto_update_interval_min: u64,
    pub timer_pending: bool,
    /// Seconds until the pending timer fires, rounded up.
    pub next_run_in_secs: Option<u64>,
    pub credentials_configured: bool,
    pub last_success: Option<SyncOutcome>,
    pub last_outcome: Option<SyncOutcome>,
    pub latest_release: Option<VersionInfo>,
    pub local_version: String,
    pub update_available: bool,
}

enum ControlCommand {
    SyncNow {
        reply: Option<oneshot::Sender<SyncOutcome>>,
    },
    Configure {
        enabled: bool,
        interval_min: u64,
        reply: oneshot::Sender<Result<StatusSnapshot, ControlError>>,
    },
    SetCredentials {
        credentials: Option<Credentials>,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    CheckVersion {
        urgent: bool,
        reply: Option<oneshot::Sender<Option<VersionInfo>>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Shutdown,
}

enum WorkerEvent {
    SyncDone {
        completed: CompletedSync,
        reply: Option<oneshot::Sender<SyncOutcome>>,
    },
    VersionDone {
        urgent: bool,
        result: Option<VersionInfo>,
        reply: Option<oneshot::Sender<Option<VersionInfo>>>,
    },
}

/// Cheap to clone; every method is a message to the control task.
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    notify: broadcast::Sender<Notification>,
}

impl ControlHandle {
    async fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControlError::Gone)
    }

    /// Run a manual cycle and wait for its outcome. A cycle already in
    /// progress yields an `already_running` failure.
    pub async fn sync_now(&self) -> Result<SyncOutcome, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::SyncNow { reply: Some(tx) }).await?;
        rx.await.map_err(|_| ControlError::Gone)
    }

    pub async fn trigger_sync(&self) -> Result<(), ControlError> {
        self.send(ControlCommand::SyncNow { reply: None }).await
    }

    pub async fn configure(
        &self,
        enabled: bool,
        interval_min: u64,
    ) -> Result<StatusSnapshot, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::Configure {
            enabled,
            interval_min,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ControlError::Gone)?
    }

    pub async fn set_credentials(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::SetCredentials {
            credentials,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ControlError::Gone)?
    }

    pub async fn check_version(&self, urgent: bool) -> Result<Option<VersionInfo>, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::CheckVersion {
            urgent,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| ControlError::Gone)
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::Status { reply: tx }).await?;
        rx.await.map_err(|_| ControlError::Gone)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.send(ControlCommand::Shutdown).await
    }
}

pub struct Controller {
    state: AppState,
    orchestrator: Arc<SyncOrchestrator>,
    checker: Arc<VersionChecker>,
    commands: mpsc::Receiver<ControlCommand>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ticks_tx: mpsc::UnboundedSender<Tick>,
    ticks_rx: mpsc::UnboundedReceiver<Tick>,
    notify: broadcast::Sender<Notification>,
    status_line: String,
    last_outcome: Option<SyncOutcome>,
}

impl Controller {
    pub fn new(
        state: AppState,
        orchestrator: Arc<SyncOrchestrator>,
        checker: Arc<VersionChecker>,
    ) -> (Self, ControlHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(NOTIFY_BUFFER);
        let status_line = startup_status(state.config().last_status.as_ref());

        let handle = ControlHandle {
            commands: commands_tx,
            notify: notify.clone(),
        };
        let controller = Self {
            state,
            orchestrator,
            checker,
            commands,
            events_tx,
            events_rx,
            ticks_tx,
            ticks_rx,
            notify,
            status_line,
            last_outcome: None,
        };
        (controller, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the control loop until shutdown or until every handle is gone.
    pub async fn run(mut self) {
        let mut scheduler = Scheduler::new(self.ticks_tx.clone());
        let config = self.state.config();
        scheduler.configure(config.auto_update_enabled, config.auto_update_interval());
        if config.check_version_on_startup {
            self.start_version_check(true, None);
        }
        info!(
            auto_update = scheduler.enabled(),
            interval_secs = scheduler.interval().as_secs(),
            "controller started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(ControlCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command, &mut scheduler).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(tick) = self.ticks_rx.recv() => {
                    match scheduler.on_tick(tick) {
                        TickDecision::Run => self.start_sync(SyncTrigger::Scheduled, None),
                        decision => debug!(?decision, "tick ignored"),
                    }
                }
            }
        }

        scheduler.shutdown();
        info!("controller stopped");
    }

    async fn handle_command(&mut self, command: ControlCommand, scheduler: &mut Scheduler) {
        match command {
            ControlCommand::SyncNow { reply } => self.start_sync(SyncTrigger::Manual, reply),
            ControlCommand::Configure {
                enabled,
                interval_min,
                reply,
            } => {
                let result = self
                    .state
                    .set_auto_update(enabled, interval_min)
                    .await
                    .map_err(|e| ControlError::Config(e.to_string()));
                // The timer follows the new settings even if the save failed.
                let config = self.state.config();
                scheduler.configure(config.auto_update_enabled, config.auto_update_interval());
                let _ = self.notify.send(Notification::ScheduleChanged {
                    enabled: config.auto_update_enabled,
                    interval_min: config.auto_update_interval_min,
                });
                let _ = reply.send(result.map(|()| self.snapshot(scheduler)));
            }
            ControlCommand::SetCredentials { credentials, reply } => {
                let result = self
                    .state
                    .set_credentials(credentials)
                    .await
                    .map_err(|e| ControlError::Config(e.to_string()));
                let _ = reply.send(result);
            }
            ControlCommand::CheckVersion { urgent, reply } => {
                self.start_version_check(urgent, reply)
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.snapshot(scheduler));
            }
            ControlCommand::Shutdown => {}
        }
    }

    fn start_sync(&mut self, trigger: SyncTrigger, reply: Option<oneshot::Sender<SyncOutcome>>) {
        let permit = match self.orchestrator.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                if trigger == SyncTrigger::Scheduled {
                    debug!("tick coalesced into the running cycle");
                } else {
                    info!("manual sync rejected: {err}");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(SyncOutcome::failed(chrono::Utc::now(), err.to_info()));
                }
                return;
            }
        };

        let _ = self.notify.send(Notification::SyncStarted { trigger });
        let ctx = FetchContext::now(self.state.config().credentials.clone());
        let orchestrator = Arc::clone(&self.orchestrator);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let completed = orchestrator.run_with_permit(permit, trigger, ctx).await;
            let _ = events.send(WorkerEvent::SyncDone { completed, reply });
        });
    }

    fn start_version_check(
        &self,
        urgent: bool,
        reply: Option<oneshot::Sender<Option<VersionInfo>>>,
    ) {
        let checker = Arc::clone(&self.checker);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = checker.check(urgent).await;
            let _ = events.send(WorkerEvent::VersionDone {
                urgent,
                result,
                reply,
            });
        });
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::SyncDone { completed, reply } => self.finish_sync(completed, reply).await,
            WorkerEvent::VersionDone {
                urgent,
                result,
                reply,
            } => {
                if let Some(info) = &result {
                    if let Err(err) = self.state.record_version(info.clone()).await {
                        warn!(error = %err, "could not persist release info");
                    }
                    let _ = self.notify.send(Notification::VersionRefreshed { info: info.clone() });
                    if self.checker.should_notify(urgent, Some(info)) {
                        let _ = self.notify.send(Notification::UpdateAvailable {
                            tag: info.tag.clone(),
                            display_tag: format_version_tag(&info.tag),
                            url: info.url.clone(),
                        });
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }

    async fn finish_sync(
        &mut self,
        completed: CompletedSync,
        reply: Option<oneshot::Sender<SyncOutcome>>,
    ) {
        let outcome = completed.outcome.clone();
        let trigger = completed.trigger;

        match &outcome.error {
            None => {
                if let Err(err) = self.state.record_outcome(&outcome).await {
                    warn!(error = %err, "could not persist sync outcome");
                }
                self.status_line = format_ok_status(&outcome);
                let _ = self.notify.send(Notification::ClientsUpdated {
                    clients: completed.clients.clone(),
                });
            }
            Some(error) => {
                self.status_line =
                    failure_status(&error.detail, self.state.config().last_status.as_ref());
            }
        }
        // The gate opens only once the outcome is stored.
        completed.release();

        self.last_outcome = Some(outcome.clone());
        let _ = self.notify.send(Notification::SyncFinished {
            trigger,
            outcome: outcome.clone(),
            status: self.status_line.clone(),
        });
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn snapshot(&self, scheduler: &Scheduler) -> StatusSnapshot {
        let config = self.state.config();
        let local_version = self.checker.local_version().to_string();
        StatusSnapshot {
            status_line: self.status_line.clone(),
            phase: scheduler.phase(self.orchestrator.is_running()),
            auto_update_enabled: config.auto_update_enabled,
            auto_update_interval_min: config.auto_update_interval_min,
            timer_pending: scheduler.has_pending(),
            next_run_in_secs: scheduler.pending_due().map(|due| {
                let left = due.saturating_duration_since(tokio::time::Instant::now());
                left.as_millis().div_ceil(1000) as u64
            }),
            credentials_configured: config.credentials_configured(),
            last_success: config.last_status.clone(),
            last_outcome: self.last_outcome.clone(),
            latest_release: config.latest_release.clone(),
            update_available: config
                .latest_release
                .as_ref()
                .is_some_and(|r| is_newer(&r.tag, &local_version)),
            local_version,
        }
    }
}
