//! Webcall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use webcall_core::prelude::*;
use webcall_core::IceServer;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, env = "WEBCALL_CONFIG")]
    config: Option<PathBuf>,

    /// STUN/TURN server URL; replaces the configured list (repeatable)
    #[arg(long = "ice-server", value_name = "URL")]
    ice_servers: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call between two local participants over an in-process channel
    Loopback {
        /// Call identifier (generated when omitted)
        #[arg(long)]
        call_id: Option<String>,

        /// Negotiate audio only
        #[arg(long)]
        audio_only: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        hold: u64,

        /// Seconds to wait for the connection
        #[arg(long, default_value = "15")]
        timeout: u64,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the configuration file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webcall=info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.clone().or_else(default_config_path);
    let config = resolve_config(path.as_deref(), &cli.ice_servers)?;
    tracing::debug!(path = ?path, servers = config.ice_servers.len(), "Configuration resolved");

    match cli.command {
        Commands::Loopback {
            call_id,
            audio_only,
            hold,
            timeout,
        } => {
            handle_loopback(config, call_id, audio_only, hold, timeout).await?;
        }
        Commands::Config { init } => {
            handle_config(&config, path.as_deref(), init)?;
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("rs", "webcall", "webcall")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

fn resolve_config(path: Option<&Path>, ice_servers: &[String]) -> Result<WebCallConfig> {
    let mut config = match path {
        Some(path) if path.exists() => WebCallConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        _ => WebCallConfig::default(),
    };
    if !ice_servers.is_empty() {
        config.ice_servers = ice_servers.iter().map(IceServer::stun).collect();
    }
    Ok(config)
}

async fn handle_loopback(
    mut config: WebCallConfig,
    call_id: Option<String>,
    audio_only: bool,
    hold: u64,
    timeout: u64,
) -> Result<()> {
    if audio_only {
        config.default_constraints = MediaConstraints::audio_only();
    }
    let call_id = call_id.map_or_else(CallId::generate, CallId::new);

    let channel = Arc::new(InMemorySignalingChannel::new());
    let caller_service = CallService::builder(channel.clone(), WebRtcAdapterFactory)
        .with_config(config.clone())
        .build();
    let callee_service = CallService::builder(channel, WebRtcAdapterFactory)
        .with_config(config)
        .auto_accept(true)
        .build();

    println!("📞 Starting loopback call {call_id}");
    let caller = caller_service
        .dial(
            call_id.clone(),
            Participant::new("alice").with_email("alice@localhost"),
            Some(Participant::new("bob").with_email("bob@localhost")),
        )
        .await?;
    let callee = callee_service
        .join_call(call_id, Participant::new("bob").with_email("bob@localhost"))
        .await?;

    let caller_events = caller.take_events().context("caller events already taken")?;
    let callee_events = callee.take_events().context("callee events already taken")?;
    tokio::spawn(print_events("alice", caller_events));
    let mut callee_events = callee_events;

    let connected = tokio::time::timeout(Duration::from_secs(timeout), async {
        while let Some(event) = callee_events.recv().await {
            print_event("bob", &event);
            match event {
                CallEvent::Connected => return true,
                CallEvent::Ended(_) => return false,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if connected {
        println!("✅ Connected, holding for {hold}s");
        tokio::time::sleep(Duration::from_secs(hold)).await;
    } else {
        println!("⚠️  No connection within {timeout}s");
    }

    let summary = caller.hang_up().await;
    let remote = callee.wait_for_end().await;
    println!(
        "👋 Call {} {} after {}s (remote saw {})",
        summary.call_id, summary.status, summary.duration_secs, remote.status
    );
    if let Some(error) = summary.error.or(remote.error) {
        println!("❌ {error}");
    }

    Ok(())
}

async fn print_events(who: &'static str, mut events: tokio::sync::mpsc::UnboundedReceiver<CallEvent>) {
    while let Some(event) = events.recv().await {
        print_event(who, &event);
    }
}

fn print_event(who: &str, event: &CallEvent) {
    let at = chrono::Local::now().format("%H:%M:%S%.3f");
    match event {
        CallEvent::Ringing { caller, .. } => println!("   [{at}] {who}: 🔔 ringing, {caller} is calling"),
        CallEvent::StatusChanged(status) => println!("   [{at}] {who}: status {status}"),
        CallEvent::LocalStream(stream) => {
            println!("   [{at}] {who}: 🎙️  local media {:?}", stream.kinds);
        }
        CallEvent::RemoteStream(stream) => {
            println!("   [{at}] {who}: 📺 remote {:?} track", stream.kind);
        }
        CallEvent::Connected => println!("   [{at}] {who}: 🔗 media connected"),
        CallEvent::Ended(summary) => println!("   [{at}] {who}: ended ({})", summary.status),
    }
}

fn handle_config(config: &WebCallConfig, path: Option<&Path>, init: bool) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config)?;
    if init {
        let path = path.context("no configuration directory available; pass --config")?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        std::fs::write(path, &rendered)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("✅ Wrote {}", path.display());
    }

    match path {
        Some(path) => println!("📁 Config file: {}", path.display()),
        None => println!("📁 Config file: (none)"),
    }
    println!("{rendered}");
    Ok(())
}
