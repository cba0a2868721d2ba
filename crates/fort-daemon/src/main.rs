#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fort_config::{BrokerConfig, DEFAULT_CONFIG_DIR, DEFAULT_GC_INTERVAL_SECS, DEFAULT_SIGNING_CLIENT, DEFAULT_STATE_DIR};
use fort_daemon::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fort-daemon", version, about = "Per-host capability broker daemon")]
struct Args {
    /// Directory containing hosts.json, rbac.json, capabilities.json,
    /// needs.json, and handlers/.
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Directory containing provider-state.json, fulfillment-state.json,
    /// and handles/.
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Path to the local signing-client executable.
    #[arg(long, default_value = DEFAULT_SIGNING_CLIENT)]
    signing_client: PathBuf,

    /// GC sweep interval in seconds; only used to size the rotation
    /// window (`2 * interval`).
    #[arg(long, default_value_t = DEFAULT_GC_INTERVAL_SECS)]
    gc_interval_secs: u64,

    /// Re-evaluate one async capability's worker with no triggering
    /// request, then exit. Mutually exclusive with `--gc`.
    #[arg(long, value_name = "CAPABILITY", conflicts_with = "gc")]
    trigger: Option<String>,

    /// Run a single positive-absence reclaim + TTL rotation sweep,
    /// then exit. Mutually exclusive with `--trigger`.
    #[arg(long, conflicts_with = "trigger")]
    gc: bool,

    /// Widen the tracing filter to `fort=debug`.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("fort=debug")
    } else {
        EnvFilter::new("fort=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let broker = BrokerConfig {
        config_dir: args.config_dir,
        state_dir: args.state_dir,
        signing_client_path: args.signing_client,
        gc_interval_secs: args.gc_interval_secs,
        debug: args.debug,
    };

    let state = AppState::load(broker)
        .await
        .context("failed to load broker configuration and state")?;

    if let Some(capability) = args.trigger {
        fort_daemon::sweep::trigger(&state, &capability, now_unix())
            .await
            .with_context(|| format!("trigger sweep for '{capability}' failed"))?;
        info!(capability, "trigger sweep complete");
        return Ok(());
    }

    if args.gc {
        fort_daemon::sweep::gc(&state, now_unix())
            .await
            .context("gc sweep failed")?;
        info!("gc sweep complete");
        return Ok(());
    }

    fort_daemon::sweep::initialize(&state, now_unix())
        .await
        .context("initialize sweep failed")?;

    let state = Arc::new(state);
    let runtime = tokio::runtime::Handle::current();
    info!("fort-daemon serving fastcgi on stdin socket");
    tokio::task::spawn_blocking(move || fort_daemon::fcgi::serve(state, runtime))
        .await
        .context("fastcgi server task panicked")?;

    Ok(())
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
