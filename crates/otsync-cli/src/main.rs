mod logging;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use otsync_adapters::Credentials;
use otsync_core::FieldName;
use otsync_storage::{JsonDocumentStore, RecordFilter, SearchField};
use otsync_sync::{bootstrap, open_store, AppState, ControlHandle, Notification, SyncEnv};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "otsync")]
#[command(about = "Work-order synchronization engine")]
struct Cli {
    /// Keep records in memory instead of the configured database.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and exit.
    Sync,
    /// Keep running with the auto-update scheduler until Ctrl-C.
    Run,
    /// Run the scheduler and the JSON API until Ctrl-C.
    Serve,
    CheckVersion {
        /// Retry with backoff instead of a single short attempt.
        #[arg(long)]
        urgent: bool,
    },
    /// Print stored records, newest key first.
    List {
        #[arg(short, long, default_value = "")]
        query: String,
        #[arg(long, default_value = "key")]
        by: String,
        #[arg(long)]
        client: Option<String>,
    },
    Status,
    /// Turn auto-update on or off and set its interval.
    Configure {
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long)]
        interval_min: Option<u64>,
    },
    Credentials {
        #[arg(long, required_unless_present = "clear")]
        username: Option<String>,
        #[arg(long, required_unless_present = "clear")]
        password: Option<String>,
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let env = SyncEnv::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::List { query, by, client } => list(&env, cli.memory, query, &by, client).await,
        command => {
            let runtime = bootstrap(&env, cli.memory).await?;
            let handle = runtime.handle.clone();
            let control = runtime.controller.spawn();
            let result = dispatch(command, &handle, runtime.store).await;
            handle.shutdown().await.ok();
            control.await.context("control task panicked")?;
            result
        }
    }
}

async fn dispatch(
    command: Commands,
    handle: &ControlHandle,
    store: std::sync::Arc<dyn otsync_storage::RecordStore>,
) -> Result<()> {
    match command {
        Commands::Sync => {
            let outcome = handle.sync_now().await?;
            let status = handle.status().await?;
            println!("{}", status.status_line);
            if outcome.rejected_count > 0 {
                println!("{} rows rejected", outcome.rejected_count);
            }
            if !outcome.is_success() {
                bail!("sync failed");
            }
        }
        Commands::Run => {
            let watcher = tokio::spawn(watch(handle.subscribe()));
            info!("running until Ctrl-C");
            tokio::signal::ctrl_c().await?;
            watcher.abort();
        }
        Commands::Serve => {
            let watcher = tokio::spawn(watch(handle.subscribe()));
            let state = otsync_web::AppState::new(handle.clone(), store);
            tokio::select! {
                served = otsync_web::serve_from_env(state) => served?,
                signal = tokio::signal::ctrl_c() => signal?,
            }
            watcher.abort();
        }
        Commands::CheckVersion { urgent } => match handle.check_version(urgent).await? {
            Some(info) => println!(
                "latest release {} ({})",
                otsync_sync::format_version_tag(&info.tag),
                info.url
            ),
            None => println!("release feed unavailable"),
        },
        Commands::Status => {
            let snapshot = handle.status().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Configure {
            enable,
            disable,
            interval_min,
        } => {
            let current = handle.status().await?;
            let enabled = if enable {
                true
            } else if disable {
                false
            } else {
                current.auto_update_enabled
            };
            let interval = interval_min.unwrap_or(current.auto_update_interval_min);
            let snapshot = handle.configure(enabled, interval).await?;
            println!(
                "auto-update {} every {} min",
                if snapshot.auto_update_enabled { "on" } else { "off" },
                snapshot.auto_update_interval_min
            );
        }
        Commands::Credentials {
            username,
            password,
            clear,
        } => {
            let credentials = if clear {
                None
            } else {
                Some(Credentials {
                    username: username.unwrap_or_default(),
                    password: password.unwrap_or_default(),
                })
            };
            handle.set_credentials(credentials).await?;
            println!("credentials {}", if clear { "cleared" } else { "saved" });
        }
        Commands::List { .. } => bail!("list reads the store directly"),
    }
    Ok(())
}

async fn list(
    env: &SyncEnv,
    memory: bool,
    query: String,
    by: &str,
    client: Option<String>,
) -> Result<()> {
    let mut state = AppState::load(JsonDocumentStore::new(&env.config_path)).await?;
    state.apply_env(env).await?;
    let store = open_store(&state.config().database_url, memory).await?;

    let search_by = SearchField::parse(by).with_context(|| format!("unknown column {by:?}"))?;
    let records = store
        .list(&RecordFilter {
            text: query,
            search_by,
            client,
        })
        .await?;

    let header = std::iter::once("key")
        .chain(FieldName::ALL.iter().map(|f| f.as_str()))
        .collect::<Vec<_>>();
    println!("{}", header.join("\t"));
    for record in &records {
        let row = std::iter::once(record.key.as_str())
            .chain(record.fields.iter().map(|(_, value)| value))
            .collect::<Vec<_>>();
        println!("{}", row.join("\t"));
    }
    info!(count = records.len(), "listed records");
    Ok(())
}

async fn watch(mut rx: tokio::sync::broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(Notification::SyncFinished { status, .. }) => println!("{status}"),
            Ok(Notification::UpdateAvailable {
                display_tag, url, ..
            }) => println!("new version {display_tag} available: {url}"),
            Ok(other) => info!(?other, "notification"),
            Err(RecvError::Lagged(missed)) => warn!(missed, "notifications dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}
