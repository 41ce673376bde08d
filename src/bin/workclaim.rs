//! workclaim CLI: run a worker, submit messages, inspect ownership.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::info;
use workclaim::config::secrets::redact_url;
use workclaim::config::{Config, ExecutorFile};
use workclaim::context::{ContextBackend, GitContextBackend, PassthroughContextBackend};
use workclaim::db::Db;
use workclaim::engine::{Intake, Services, SubmitResult, Worker};
use workclaim::event::TracingEventSink;
use workclaim::executor::HookExecutor;
use workclaim::model::{NewWorkMessage, WorkstreamKey};
use workclaim::store::{OwnershipStore, ThreadStore};
use workclaim::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workclaim", about = "Claim-based workstream coordination")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker: claim broker plus work consumers
    Serve {
        /// Executor TOML file ([executor] hook, optional [context])
        #[arg(long)]
        executor: PathBuf,
    },
    /// Queue one message for a workstream
    Submit {
        project: String,
        user: String,
        /// Conversation thread the message belongs to
        #[arg(long)]
        thread: String,
        /// Dedup key; resubmitting the same id is a no-op
        #[arg(long)]
        message_id: String,
        /// JSON payload handed to the executor
        #[arg(long)]
        payload: Option<String>,
        /// Pending callback the result must resolve
        #[arg(long)]
        continuation: Option<String>,
    },
    /// Show who owns a workstream
    Owner { project: String, user: String },
    /// Show the active thread context of a workstream
    Threads { project: String, user: String },
    /// Check database connectivity
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { executor } => cmd_serve(config, executor).await,
        Command::Submit {
            project,
            user,
            thread,
            message_id,
            payload,
            continuation,
        } => {
            let key = WorkstreamKey::new(project, user)?;
            let mut message = NewWorkMessage::new(key, message_id, thread);
            if let Some(json) = payload {
                message = message.payload(serde_json::from_str(&json)?);
            }
            if let Some(token) = continuation {
                message = message.continuation(token);
            }
            cmd_submit(connect(&config).await?, message).await
        }
        Command::Owner { project, user } => {
            let key = WorkstreamKey::new(project, user)?;
            cmd_owner(&connect(&config).await?, &key).await
        }
        Command::Threads { project, user } => {
            let key = WorkstreamKey::new(project, user)?;
            cmd_threads(&connect(&config).await?, &key).await
        }
        Command::Health => {
            connect(&config).await?.health_check().await?;
            println!("ok");
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret())
        .await?
        .with_visibility_timeout(config.worker.visibility_timeout);
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(config: Config, executor: PathBuf) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workclaim".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let executor_file = ExecutorFile::load(&executor)?;
    info!(database = %redact_url(&config.database_url), "connecting");
    let db = Arc::new(connect(&config).await?);

    let context: Arc<dyn ContextBackend> = match executor_file.context {
        Some(git) => Arc::new(GitContextBackend::new(git)),
        None => Arc::new(PassthroughContextBackend),
    };
    let services = Services::postgres(
        db,
        Arc::new(HookExecutor::new(executor_file.executor)),
        context,
        Arc::new(TracingEventSink),
    );

    let worker = Worker::new(config.worker_id, config.worker, services);
    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        shutdown.cancel();
    });

    worker.run().await;
    Ok(())
}

async fn cmd_submit(db: Db, message: NewWorkMessage) -> anyhow::Result<()> {
    let db = Arc::new(db);
    let intake = Intake::new(db.clone(), db.clone(), db, Arc::new(TracingEventSink));
    match intake.submit(message).await? {
        SubmitResult::Accepted { message, offered } => {
            println!(
                "Accepted: {} (arrival order {}{})",
                message.message_id,
                message.arrival_order,
                if offered { ", claim offer sent" } else { "" }
            );
        }
        SubmitResult::Duplicate { message_id } => {
            println!("Duplicate: {message_id} was already accepted");
        }
    }
    Ok(())
}

async fn cmd_owner(db: &Db, key: &WorkstreamKey) -> anyhow::Result<()> {
    let Some(record) = db.get(key).await? else {
        println!("{key}: unowned");
        return Ok(());
    };
    let status = if record.is_expired() { "expired" } else { "live" };
    println!("Workstream:    {key}");
    println!("Worker:        {}", record.worker_id);
    println!("Claimed:       {}", record.claimed_at);
    println!("Last Activity: {}", record.last_activity_at);
    println!("Lease Expires: {} ({status})", record.lease_expires_at);
    Ok(())
}

async fn cmd_threads(db: &Db, key: &WorkstreamKey) -> anyhow::Result<()> {
    match db.active_thread(key).await? {
        Some(ctx) => {
            println!("Workstream:    {key}");
            println!("Thread:        {}", ctx.thread_id);
            println!("Context:       {}", ctx.context_id);
            println!(
                "Last Message:  {}",
                ctx.last_message_id.as_deref().unwrap_or("-")
            );
            println!("Switched:      {}", ctx.last_switched_at);
        }
        None => println!("{key}: no active thread"),
    }
    let results = db.recent_results(key, 5).await?;
    if !results.is_empty() {
        println!("---");
        for r in &results {
            println!(
                "{}  {:<8}  {:<7}  {:>6}ms  {}",
                r.recorded_at.format("%Y-%m-%d %H:%M"),
                if r.success { "success" } else { "failure" },
                if r.committed { "commit" } else { "-" },
                r.duration_ms,
                r.message_id
            );
        }
    }
    Ok(())
}
