use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use nkc_crypto::kdf::KdfParams;
use nkc_proto::LogScope;
use nkc_store::repo::UnlockOutcome;
use nkc_store::rotation::rotate_vault_keys;
use nkc_store::{EncryptedStore, RecoverySecret};
use nkc_sync::{verify_log_chain, MemoryRoleBook, SyncEngine};
use nkc_transport::tcp::serve;
use nkc_transport::{
    CancellationToken, DeliveryScheduler, DirectTcpTransport, ExternalProxyBridge, MemoryRouteHealth, OnionBridge,
    Router, Socks5Transport,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod node;
mod settings;

use crate::node::{create_device, load_device, open_store, FrameSink};
use crate::settings::{data_dir, NodeSettings, SETTINGS_FILE};

const SECRET_ENV: &str = "NKC_RECOVERY_SECRET";
const MIN_SECRET_LEN: usize = 12;

#[derive(Parser, Debug)]
#[command(author, version, about = "NKC messaging node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the vault and this device's keys
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, default_value = "me")]
        name: String,
    },
    /// Re-encrypt the vault under a new recovery secret
    Rotate {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Show queued outgoing messages
    Outbox {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Verify the hash chains of a conversation's logs
    Audit {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        conv: String,
    },
    /// Run inbound listener and delivery scheduler
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir, name } => init_command(data_dir, &name).await,
        Commands::Rotate { data_dir } => rotate_command(data_dir).await,
        Commands::Outbox { data_dir } => outbox_command(data_dir).await,
        Commands::Audit { data_dir, conv } => audit_command(data_dir, &conv).await,
        Commands::Run { data_dir } => run_command(data_dir).await,
    }
}

fn resolve_dir(override_dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match override_dir {
        Some(d) => d,
        None => data_dir()?,
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

async fn unlock_existing(store: &EncryptedStore) -> Result<()> {
    if store.header().await?.is_none() {
        bail!("vault missing; run init first");
    }
    let secret = prompt_secret_once("Recovery secret: ")?;
    store.unlock(&secret, KdfParams::moderate()).await?;
    Ok(())
}

async fn init_command(dir: Option<PathBuf>, name: &str) -> Result<()> {
    let dir = resolve_dir(dir)?;
    let settings = NodeSettings::load(&dir)?;
    let store = open_store(&dir, &settings).await?;
    if store.header().await?.is_some() {
        bail!("vault already exists in {}", dir.display());
    }
    let secret = prompt_secret_twice("Choose a recovery secret: ")?;
    if store.unlock(&secret, KdfParams::moderate()).await? != UnlockOutcome::Created {
        bail!("vault was created concurrently");
    }
    let profile = create_device(&store, name).await?;
    if !dir.join(SETTINGS_FILE).exists() {
        settings.save(&dir)?;
    }
    println!("Vault created in {}", dir.display());
    println!("Device ID: {}", profile.device_id);
    println!("Identity fingerprint: {}", profile.identity_pub.fingerprint());
    Ok(())
}

async fn rotate_command(dir: Option<PathBuf>) -> Result<()> {
    let dir = resolve_dir(dir)?;
    let settings = NodeSettings::load(&dir)?;
    let store = open_store(&dir, &settings).await?;
    unlock_existing(&store).await?;
    let new_secret = prompt_secret_twice("New recovery secret: ")?;

    let mut shown = 0u32;
    let report = rotate_vault_keys(&store, &new_secret, KdfParams::moderate(), |p| {
        let pct = (p * 100.0) as u32;
        if pct >= shown + 10 || pct == 100 {
            shown = pct;
            eprintln!("rotating: {pct}%");
        }
    })
    .await?;
    println!(
        "Re-encrypted {} records (key {} -> {})",
        report.records, report.old_key_id, report.new_key_id
    );
    Ok(())
}

async fn outbox_command(dir: Option<PathBuf>) -> Result<()> {
    let dir = resolve_dir(dir)?;
    let settings = NodeSettings::load(&dir)?;
    let store = open_store(&dir, &settings).await?;
    unlock_existing(&store).await?;
    let records = store.list_outbox().await?;
    if records.is_empty() {
        println!("Outbox is empty");
    }
    for r in records {
        println!(
            "{}  conv={}  to={}  status={:?}  attempts={}  via={}  next={}  expires={}{}",
            r.id,
            r.conv_id,
            r.to_device_id,
            r.status,
            r.attempts,
            r.last_transport.as_deref().unwrap_or("-"),
            r.next_attempt_at.to_rfc3339(),
            r.expires_at.to_rfc3339(),
            r.last_error.map(|e| format!("  error={e}")).unwrap_or_default(),
        );
    }
    Ok(())
}

async fn audit_command(dir: Option<PathBuf>, conv_id: &str) -> Result<()> {
    let dir = resolve_dir(dir)?;
    let settings = NodeSettings::load(&dir)?;
    let store = open_store(&dir, &settings).await?;
    unlock_existing(&store).await?;
    let mut broken = false;
    for scope in LogScope::ALL {
        let log_id = scope.log_id(Some(conv_id));
        let events = store.list_events(&log_id, None).await?;
        match verify_log_chain(&events) {
            Ok(r) => println!("{log_id}: ok ({} events, {} conflicts)", r.events, r.conflicts),
            Err(e) => {
                broken = true;
                println!("{log_id}: BROKEN: {e}");
            }
        }
    }
    if broken {
        bail!("hash chain verification failed");
    }
    Ok(())
}

async fn run_command(dir: Option<PathBuf>) -> Result<()> {
    let dir = resolve_dir(dir)?;
    let settings = NodeSettings::load(&dir)?;
    let store = open_store(&dir, &settings).await?;
    unlock_existing(&store).await?;
    let device = load_device(&store).await?;

    let bridge: Arc<dyn OnionBridge> = Arc::new(ExternalProxyBridge::new(
        settings.network.onion_provider,
        settings.socks_url.clone(),
    ));
    bridge.start().await?;
    let router = Arc::new(
        Router::new(
            store.clone(),
            settings.network.clone(),
            Arc::new(MemoryRouteHealth::default()),
        )
        .with_transport(Arc::new(DirectTcpTransport::new(&device.device_id)))
        .with_transport(Arc::new(Socks5Transport::new(bridge.clone(), &device.device_id))),
    );
    let engine = Arc::new(
        SyncEngine::new(store.clone(), device.clone(), Arc::new(MemoryRoleBook::new())).with_padding(settings.padding),
    );

    let cancel = CancellationToken::new();
    let scheduler = Arc::new(DeliveryScheduler::new(router.clone())).spawn(
        Duration::from_secs(settings.scheduler_interval_secs.max(1)),
        cancel.clone(),
    );
    let listener = TcpListener::bind(&settings.listen_addr).await?;
    let server = tokio::spawn(serve(
        listener,
        Arc::new(FrameSink::new(engine, router)),
        cancel.clone(),
    ));

    info!(device_id = %device.device_id, listen = %settings.listen_addr, mode = ?settings.network.mode, "node started");
    signal::ctrl_c().await?;
    info!("node stopping");
    cancel.cancel();
    scheduler.await?;
    server.await??;
    bridge.stop().await?;
    store.lock().await;
    Ok(())
}

fn prompt_secret_once(prompt: &str) -> Result<RecoverySecret> {
    if let Ok(s) = std::env::var(SECRET_ENV) {
        if !s.is_empty() {
            return Ok(RecoverySecret::parse(&s)?);
        }
    }
    let raw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("secret prompt: {e}"))?;
    Ok(RecoverySecret::parse(&raw)?)
}

fn prompt_secret_twice(prompt: &str) -> Result<RecoverySecret> {
    let first = if let Ok(s) = std::env::var(SECRET_ENV) {
        s
    } else {
        let first = rpassword::prompt_password(prompt).map_err(|e| anyhow!("secret prompt: {e}"))?;
        let second = rpassword::prompt_password("Confirm: ").map_err(|e| anyhow!("secret prompt: {e}"))?;
        if first != second {
            bail!("secrets do not match");
        }
        first
    };
    if first.trim().len() < MIN_SECRET_LEN {
        bail!("recovery secret too short; minimum {MIN_SECRET_LEN} characters");
    }
    Ok(RecoverySecret::parse(&first)?)
}
