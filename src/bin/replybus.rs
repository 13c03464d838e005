//! Replybus CLI - request/reply demo over the in-process broker

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replybus::{MemoryBroker, PublishOptions, ReplyBus, ReplyBusConfig, ReplyBusError};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "replybus")]
#[command(about = "Replybus CLI - request/reply over publish/subscribe")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cluster id
    #[arg(long, env = "REPLYBUS_CLUSTER", global = true)]
    cluster: Option<String>,

    /// Base client id of the requester
    #[arg(long, env = "REPLYBUS_CLIENT_ID", global = true)]
    client_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send ping requests to an in-process responder and print round-trip times
    ///
    /// Examples:
    ///   replybus ping --count 5
    ///   replybus ping --silent --timeout-ms 200
    Ping {
        /// Number of requests to send
        #[arg(short, long, default_value_t = 3)]
        count: u32,

        /// Reply timeout per request, in milliseconds
        #[arg(long, env = "REPLYBUS_REPLY_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Topic the responder listens on
        #[arg(long, default_value = "ping")]
        topic: String,

        /// Responder ignores requests (demonstrates the timeout path)
        #[arg(long)]
        silent: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let cli = Cli::parse();

    let mut config = ReplyBusConfig::from_env();
    if let Some(cluster) = cli.cluster {
        config.cluster = cluster;
    }
    if let Some(client_id) = cli.client_id {
        config.client_id = client_id;
    }

    match cli.command {
        Commands::Ping {
            count,
            timeout_ms,
            topic,
            silent,
        } => {
            if let Some(ms) = timeout_ms {
                config = config.reply_timeout(Duration::from_millis(ms));
            }
            ping(config, count, topic, silent).await
        }
    }
}

async fn ping(config: ReplyBusConfig, count: u32, topic: String, silent: bool) -> Result<()> {
    let broker = Arc::new(MemoryBroker::new());

    let responder_config = ReplyBusConfig::new(
        config.cluster.clone(),
        format!("{}-responder", config.client_id),
        config.server_url.clone(),
    );
    let responder = ReplyBus::new(responder_config, broker.clone());
    responder
        .connect()
        .await
        .context("Failed to connect responder")?;

    responder
        .subscribe(topic.as_str(), None, move |msg| {
            let Some(reply) = msg.reply else {
                return;
            };
            if silent {
                info!(guid = %msg.guid, "Ignoring request");
                return;
            }
            let seq = msg.data.get("seq").cloned().unwrap_or_default();
            tokio::spawn(async move {
                if let Err(e) = reply.reply(&json!({"cmd": "pong", "seq": seq})).await {
                    warn!(error = %e, "Failed to reply");
                }
            });
        })
        .await
        .context("Failed to subscribe responder")?;

    let requester = ReplyBus::new(config, broker);
    requester
        .connect()
        .await
        .context("Failed to connect requester")?;

    let timeout = requester.config().reply_timeout;
    println!(
        "Pinging '{}' as {} (timeout {}ms)",
        topic,
        requester.client_id(),
        timeout.as_millis()
    );

    let mut received = 0;
    for seq in 0..count {
        let started = Instant::now();
        let pending = requester
            .request(
                &topic,
                &json!({"cmd": "ping", "seq": seq}),
                PublishOptions::new().reply_timeout(timeout),
            )
            .await
            .context("Failed to publish request")?;

        match pending.await {
            Ok(reply) => {
                received += 1;
                println!(
                    "  seq={} reply={} time={:.2}ms",
                    seq,
                    reply,
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
            Err(ReplyBusError::ReplyTimeout(d)) => {
                println!("  seq={} timed out after {}ms", seq, d.as_millis());
            }
            Err(e) => println!("  seq={} failed: {}", seq, e),
        }
    }

    println!();
    println!("{} sent, {} replied", count, received);

    requester.end().await.context("Failed to shut down requester")?;
    responder.end().await.context("Failed to shut down responder")?;
    Ok(())
}
