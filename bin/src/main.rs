#![allow(clippy::cognitive_complexity)]
use std::{
    fs::{self, File, OpenOptions},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use ipam_core::{
    address_manager::{
        AddressManager,
        store::{MemoryStore, SqliteStore, Storage},
    },
    config::{
        cli::{self, Command, Parser},
        trace,
    },
    platform::{HostPlatform, Platform},
    source_config::SourceOptions,
    tokio::runtime::Builder,
    tracing::*,
};

/// version tag written with the persisted state
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.ipam_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    // one operation per process, a single thread is plenty
    let rt = Builder::new_current_thread().enable_all().build()?;
    let output = rt.block_on(run(config, Arc::new(HostPlatform)))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(config: cli::Config, platform: Arc<dyn Platform>) -> Result<Value> {
    let opts = config.source_options()?;
    match config.store_path() {
        Some(path) => {
            // held until the operation has been persisted
            let _lock = lock_store(&path)?;
            info!(path = %path.display(), "using sqlite store");
            let store = SqliteStore::new(&path)
                .await
                .with_context(|| format!("failed to open store at {}", path.display()))?;
            let am = AddressManager::with_platform(VERSION, Some(store), platform);
            execute(am, &opts, &config.command).await
        }
        None => {
            info!("persistence disabled");
            let am = AddressManager::<MemoryStore>::with_platform(VERSION, None, platform);
            execute(am, &opts, &config.command).await
        }
    }
}

/// Takes an exclusive lock next to the store so concurrent invocations on
/// the same host don't interleave their read-modify-write of the tree.
fn lock_store(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    debug!(path = %lock_path.display(), "waiting for store lock");
    file.lock()
        .with_context(|| format!("failed to lock {}", lock_path.display()))?;
    Ok(file)
}

async fn execute<T: Storage>(am: AddressManager<T>, opts: &SourceOptions, command: &Command) -> Result<Value> {
    am.initialize(opts)
        .await
        .context("failed to initialize address manager")?;
    let output = dispatch(&am, command).await;
    am.uninitialize().await;
    output
}

async fn dispatch<T: Storage>(am: &AddressManager<T>, command: &Command) -> Result<Value> {
    Ok(match command {
        Command::Spaces => {
            let (local, global) = am.get_default_address_spaces().await;
            json!({ "local": local, "global": global })
        }
        Command::RequestPool {
            pool,
            sub_pool_id,
            v6,
            options,
        } => {
            let (pool_id, subnet) = am
                .request_pool(&pool.address_space, &pool.pool_id, sub_pool_id, &options.to_options(), *v6)
                .await?;
            json!({ "pool_id": pool_id, "subnet": subnet })
        }
        Command::ReleasePool { pool } => {
            am.release_pool(&pool.address_space, &pool.pool_id).await?;
            json!({ "pool_id": pool.pool_id })
        }
        Command::PoolInfo { pool } => {
            serde_json::to_value(am.get_pool_info(&pool.address_space, &pool.pool_id).await?)?
        }
        Command::RequestAddress { pool, address, options } => {
            let address = am
                .request_address(&pool.address_space, &pool.pool_id, address, &options.to_options())
                .await?;
            json!({ "address": address })
        }
        Command::ReleaseAddress { pool, address, options } => {
            am.release_address(&pool.address_space, &pool.pool_id, address, &options.to_options())
                .await?;
            json!({ "released": true })
        }
    })
}
