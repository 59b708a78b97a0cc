use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stagehand_cli::remote::{ScriptedCloud, Tags, ops};
use stagehand_cli::workflows::{self, ApplySnapshotPolicy, SyncSecurityGroupCache, SyncTags};
use stagehand_core::domain::RemoteError;
use stagehand_core::impls::{InMemoryResources, InMemoryTaskStore, SqliteTaskStore};
use stagehand_core::ports::{Resource, TaskQuery, TaskStore};
use stagehand_core::{
    Actor, Engine, EngineBuilder, EngineConfig, NewTask, Payload, TargetRef, TaskId, TaskStatus, Workflow,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// stagehand - durable stage-based task orchestration
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Engine configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite task store; in-memory when omitted
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the worker count from the config file
    #[arg(short, long)]
    workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every example workflow against the scripted cloud (default)
    Demo {
        /// Seconds to wait for each task
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
    /// List stored tasks
    List {
        /// pending, running, complete or failed
        #[arg(long)]
        status: Option<String>,

        /// Task type name
        #[arg(long = "type")]
        type_name: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Show the stage history of one task
    History { task_id: String },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    Ok(config)
}

fn open_store(args: &Args) -> anyhow::Result<Arc<dyn TaskStore>> {
    Ok(match &args.db {
        Some(path) => Arc::new(
            SqliteTaskStore::open(path).with_context(|| format!("opening task store {}", path.display()))?,
        ),
        None => Arc::new(InMemoryTaskStore::new()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = load_config(&args)?;
    let store = open_store(&args)?;
    let cloud = Arc::new(ScriptedCloud::new());
    let resources = Arc::new(InMemoryResources::new());

    let engine = workflows::register_all(EngineBuilder::new(), cloud.clone())?
        .store(store)
        .resources(resources.clone())
        .config(config)
        .build()?;

    match args.command.unwrap_or(Command::Demo { timeout: 30 }) {
        Command::Demo { timeout } => {
            run_demo(&engine, &cloud, &resources, Duration::from_secs(timeout)).await?;
        }
        Command::List {
            status,
            type_name,
            limit,
        } => {
            let mut query = TaskQuery::new().with_limit(limit);
            if let Some(status) = status {
                query = query.with_status(status.parse::<TaskStatus>()?);
            }
            if let Some(type_name) = type_name {
                query = query.with_type(type_name);
            }
            print_json(&engine.query(&query).await?)?;
        }
        Command::History { task_id } => {
            let id: TaskId = task_id.parse()?;
            print_json(&engine.stage_history(id).await?)?;
        }
    }
    Ok(())
}

/// Seed a few resources, run one task of each type and print the final records.
async fn run_demo(
    engine: &Engine,
    cloud: &ScriptedCloud,
    resources: &InMemoryResources,
    timeout: Duration,
) -> anyhow::Result<()> {
    let recovered = engine.resume().await?;
    if recovered > 0 {
        info!(recovered, "picked up tasks from a previous run");
    }

    let mongodb = TargetRef::new("mongodb", "42");
    let secgroup = TargetRef::new("secgroupcache", "7");
    let disk = TargetRef::new("disk", "9");

    let mut desired = Payload::new();
    desired.insert_serialized("tags", &Tags::from([("env".to_string(), "prod".to_string())]))?;
    resources
        .insert(Resource::new(mongodb.clone(), "running").with_metadata(desired))
        .await;
    resources.add(secgroup.clone(), "ready").await;
    resources.add(disk.clone(), "ready").await;

    cloud
        .script(ops::GET_TAGS, [Err(RemoteError::timeout("tag service warming up")), Ok(())])
        .await;
    cloud.put_status(mongodb.clone(), "db-42", "running").await;
    cloud.put_status(secgroup.clone(), "default", "ready").await;

    let actor = Actor::new("admin", "admin").with_role("admin");
    let tasks = [
        NewTask::new(SyncTags::TYPE, mongodb, actor.clone()).with_payload(Payload::new().with("replace_tags", true)),
        NewTask::new(SyncSecurityGroupCache::TYPE, secgroup, actor.clone()),
        NewTask::new(ApplySnapshotPolicy::TYPE, disk, actor).with_payload(Payload::new().with("policy_id", "sp-daily")),
    ];

    let scheduler = engine.start();
    let mut ids = Vec::with_capacity(tasks.len());
    for task in tasks {
        ids.push(engine.create_task(task).await?);
    }

    let mut finished = Vec::with_capacity(ids.len());
    for id in ids {
        match engine.wait_for_terminal(id, timeout).await? {
            Some(record) => finished.push(record),
            None => anyhow::bail!("task {id} did not finish within {timeout:?}"),
        }
    }
    scheduler.shutdown_and_join().await;

    print_json(&finished)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
