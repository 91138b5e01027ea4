//! gridrmd — the gridrm daemon.
//!
//! Starts the resource manager core, registers the node sources listed in
//! the configuration file, and asks each of them for its nodes. The fleet
//! state is logged periodically until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! gridrmd run --config /etc/gridrm/gridrm.toml --log-format json
//! gridrmd check-config --config /etc/gridrm/gridrm.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridrm_core::{
    LockStore, LoggingMonitor, ResourceManager, RmConfig, RmHandle, RmState, StaticNodeSource,
};
use gridrm_state::StateStore;

#[derive(Parser)]
#[command(name = "gridrmd", about = "gridrm resource manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the resource manager.
    Run {
        /// Path to gridrm.toml.
        #[arg(long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,

        /// Seconds between fleet state log lines.
        #[arg(long, default_value = "60")]
        status_interval: u64,
    },
    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            log_format,
            status_interval,
        } => {
            init_tracing(log_format);
            run(&config, Duration::from_secs(status_interval.max(1))).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gridrmd=debug,gridrm_core=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<RmConfig> {
    RmConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// The redb file from `[state]`, or an in-memory store when none is set.
fn open_lock_store(config: &RmConfig) -> anyhow::Result<Arc<dyn LockStore>> {
    let store = match &config.state.path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            let store = StateStore::open(path)
                .with_context(|| format!("opening state store {}", path.display()))?;
            info!(path = %path.display(), "state store opened");
            store
        }
        None => {
            if config.core.nodes_lock_restoration {
                warn!("no [state] path configured, node locks will not survive a restart");
            }
            StateStore::open_in_memory()?
        }
    };
    Ok(Arc::new(store))
}

async fn run(config_path: &Path, status_interval: Duration) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(config = %config_path.display(), "gridrm daemon starting");

    let manager = ResourceManager::builder(config.core.clone())
        .lock_store(open_lock_store(&config)?)
        .monitor(Arc::new(LoggingMonitor))
        .start()?;
    let rm = manager.handle();

    register_node_sources(&rm, &config).await?;

    let mut ticker = tokio::time::interval(status_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = rm.get_state().await?;
                log_state(&state);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    let state = manager.shutdown().await?;
    info!(state = %serde_json::to_string(&state)?, "gridrm daemon stopped");
    Ok(())
}

/// Add every configured node source and request its nodes.
///
/// A node that cannot be requested is logged and skipped.
async fn register_node_sources(rm: &RmHandle, config: &RmConfig) -> anyhow::Result<()> {
    for source in &config.node_sources {
        rm.add_node_source(StaticNodeSource::new(source.name.clone()))
            .await
            .with_context(|| format!("adding node source {}", source.name))?;

        let mut requested = 0;
        for node_url in &source.nodes {
            match rm.add_node(node_url, &source.name).await {
                Ok(_) => requested += 1,
                Err(e) => warn!(%node_url, node_source = %source.name, error = %e, "node not added"),
            }
        }
        info!(node_source = %source.name, requested, "node source registered");
    }
    Ok(())
}

fn log_state(state: &RmState) {
    info!(
        total = state.total_nodes,
        free = state.free_nodes,
        alive = state.alive_nodes,
        busy = state.busy_nodes,
        down = state.down_nodes,
        deploying = state.deploying_nodes,
        locked = state.locked_nodes,
        node_sources = state.node_sources,
        "fleet state"
    );
}

#[cfg(test)]
mod tests {
    use gridrm_core::CoreConfig;

    use super::*;

    #[test]
    fn cli_parses_run_and_check_config() {
        let cli = Cli::try_parse_from([
            "gridrmd",
            "run",
            "--config",
            "gridrm.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                config,
                log_format,
                status_interval,
            } => {
                assert_eq!(config, PathBuf::from("gridrm.toml"));
                assert_eq!(log_format, LogFormat::Json);
                assert_eq!(status_interval, 60);
            }
            Command::CheckConfig { .. } => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["gridrmd", "check-config", "--config", "x.toml"]).unwrap();
        assert!(matches!(cli.command, Command::CheckConfig { .. }));

        assert!(Cli::try_parse_from(["gridrmd", "run"]).is_err());
    }

    #[test]
    fn load_config_reports_the_path() {
        let err = load_config(Path::new("/nonexistent/gridrm.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/gridrm.toml"));
    }

    #[test]
    fn lock_store_is_created_under_the_state_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RmConfig::default();
        config.state.path = Some(dir.path().join("data").join("gridrm.redb"));

        let store = open_lock_store(&config).unwrap();
        assert!(store.find_locked_nodes().unwrap().is_empty());
        assert!(dir.path().join("data").join("gridrm.redb").exists());
    }

    #[tokio::test]
    async fn configured_nodes_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridrm.toml");
        std::fs::write(
            &path,
            r#"
[core]
maximum_number_of_nodes = 2

[[node_sources]]
name = "static"
nodes = ["pnp://a:1099/n1", "pnp://b:1099/n2", "pnp://c:1099/n3"]
"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();

        let manager = ResourceManager::builder(CoreConfig {
            node_acquisition_timeout: "1s".to_string(),
            ..config.core.clone()
        })
        .start()
        .unwrap();
        let rm = manager.handle();
        register_node_sources(&rm, &config).await.unwrap();

        let mut state = rm.get_state().await.unwrap();
        for _ in 0..200 {
            if state.total_nodes == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = rm.get_state().await.unwrap();
        }
        // All three are requested against an empty pool; the third is
        // refused when it registers.
        assert_eq!(state.total_nodes, 2);
        assert_eq!(state.node_sources, 1);
        manager.shutdown().await.unwrap();
    }
}
