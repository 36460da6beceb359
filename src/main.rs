//! Livesync CLI
//!
//! Command-line entry point for the realtime resilience layer:
//! - Print the default configuration
//! - Drive the loopback provider through a scripted flaky session

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use livesync::config::{generate_default_config, Config};
use livesync::provider::memory::MemoryProvider;
use livesync::{
    BootstrapRpc, BusEvent, ChangeKind, ChangePayload, ChannelStatus, Collaborators, EventKind,
    HttpBootstrapClient, NetworkStatus, NoopKeepAlive, RealtimeService, SubscriptionDescriptor,
    WatchSession,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "livesync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Realtime subscription and connection-resilience layer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a scripted flaky session against the loopback provider
    Simulate {
        /// Channel failures injected per resource
        #[arg(long, default_value = "2")]
        failures: u32,
        /// Resources to subscribe to
        #[arg(long, default_values_t = vec!["jobs".to_string(), "messages".to_string()])]
        resources: Vec<String>,
        /// Print the final channel snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };

    init_logging(&config);

    match cli.command {
        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote default config to {}", path.display());
                }
                None => print!("{}", content),
            }
        }
        Commands::Simulate {
            failures,
            resources,
            json,
        } => simulate(&config, failures, &resources, json).await?,
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("livesync={}", config.logging.level)),
    );

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn simulate(
    config: &Config,
    failures: u32,
    resources: &[String],
    json: bool,
) -> anyhow::Result<()> {
    tracing::info!("Livesync simulation v{}", env!("CARGO_PKG_VERSION"));

    let bootstrap: Option<Arc<dyn BootstrapRpc>> = match config.bootstrap_client() {
        Some(http) => Some(Arc::new(
            HttpBootstrapClient::new(http).context("building bootstrap client")?,
        )),
        None => None,
    };

    let provider = MemoryProvider::new();
    let session = Arc::new(WatchSession::signed_in());
    let service = RealtimeService::new(
        config.realtime(),
        Collaborators {
            provider: Arc::new(provider.clone()),
            bootstrap,
            session: session.clone(),
            keep_alive: Arc::new(NoopKeepAlive),
        },
    );

    log_bus_events(&service);
    service.start().await?;

    let delivered = Arc::new(AtomicUsize::new(0));
    let descriptors: Vec<SubscriptionDescriptor> = resources
        .iter()
        .map(|r| SubscriptionDescriptor::new(r.as_str(), ChangeKind::Any))
        .collect();

    // Two features per resource share one channel
    let mut subscriptions = Vec::new();
    for descriptor in &descriptors {
        for feature in ["list", "badge"] {
            let count = Arc::clone(&delivered);
            let name = format!("{}:{}", descriptor.resource(), feature);
            let handler_key = name.clone();
            subscriptions.push(service.registry().subscribe_with_key(
                descriptor.clone(),
                &handler_key,
                move |change: &ChangePayload| {
                    count.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(feature = %name, kind = %change.change_kind, "Feature saw change");
                },
            ));
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Every resource flaps concurrently
    let backoff = config.realtime().monitor.backoff;
    join_all(descriptors.iter().map(|descriptor| {
        let provider = provider.clone();
        let name = descriptor.channel_name();
        let settle = backoff.delay_with(failures, 1.0) + Duration::from_millis(200);
        async move {
            for attempt in 0..failures {
                tracing::info!(channel = %name, attempt, "Injecting channel error");
                provider.emit_status(&name, ChannelStatus::ChannelError);
                tokio::time::sleep(settle).await;
            }
        }
    }))
    .await;

    // One change plus its redelivery per resource
    for descriptor in &descriptors {
        let change = ChangePayload::new(ChangeKind::Update, chrono::Utc::now().to_rfc3339())
            .with_new(serde_json::json!({ "id": 42, "status": "done" }));
        for _ in 0..2 {
            provider.emit_change(
                &descriptor.channel_name(),
                descriptor.resource(),
                change.clone(),
            );
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    service.on_network(NetworkStatus::Offline);
    service.on_network(NetworkStatus::Online);

    session.sign_out();
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.sign_in();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = service.monitor().snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        for channel in &snapshot.channels {
            println!(
                "{:<32} {:<10} subscribers={} retries={}",
                channel.name,
                channel.state.to_string(),
                channel.subscriber_count,
                channel.retry_count
            );
        }
    }
    tracing::info!(
        deliveries = delivered.load(Ordering::SeqCst),
        breaker = ?service.adapter().breaker_status(),
        "Simulation finished"
    );

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    service.shutdown().await;

    Ok(())
}

fn log_bus_events(service: &RealtimeService) {
    let bus = service.bus();
    bus.on(
        EventKind::Connectivity,
        Arc::new(|event: &BusEvent| {
            if let BusEvent::Connectivity { connected } = event {
                tracing::info!(connected, "Connectivity");
            }
        }),
        Some("cli"),
    );
    bus.on(
        EventKind::ChannelStatus,
        Arc::new(|event: &BusEvent| {
            if let BusEvent::ChannelStatus { channel, state } = event {
                tracing::info!(channel = %channel, state = %state, "Channel status");
            }
        }),
        Some("cli"),
    );
    bus.on(
        EventKind::ConnectivityFatal,
        Arc::new(|event: &BusEvent| {
            if let BusEvent::ConnectivityFatal { channel, attempts } = event {
                tracing::error!(channel = %channel, attempts, "Connection lost, refresh required");
            }
        }),
        Some("cli"),
    );
}
