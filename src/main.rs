//! Chatbus CLI entry point

mod cli;

use crate::cli::{BrokerKind, Cli, Commands, LogFormat};
use anyhow::{Context, Result};
use chatbus::auth::StaticMemberships;
use chatbus::broker::{AmqpConfig, BrokerSession, MemoryBroker};
use chatbus::channels::{ChannelId, MessageKind, SessionId, TenantId};
use chatbus::config::{GatewayConfig, NamingConfig};
use chatbus::server::ChatbusServer;
use chatbus::TopicRouter;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let naming = NamingConfig {
        topic: cli.topic_template.clone(),
        routing_key: cli.routing_key_template.clone(),
        queue: cli.queue_template.clone(),
    };
    let router = naming.router().context("Invalid naming template")?;

    match cli.command {
        Commands::Serve {
            bind,
            max_frame_bytes,
            identity_header,
            broker,
            amqp_url,
            connect_attempts,
            connect_backoff_ms,
            memberships,
        } => {
            let gateway = GatewayConfig {
                bind_addr: bind.parse().context("Invalid bind address")?,
                max_frame_bytes,
                identity_header,
            };
            let memberships =
                StaticMemberships::parse(&memberships).context("Invalid CHATBUS_MEMBERSHIPS")?;

            let session = match broker {
                BrokerKind::Memory => {
                    warn!("Using the in-process broker, messages stay inside this process");
                    BrokerSession::new(Arc::new(MemoryBroker::new()), router)
                }
                BrokerKind::Amqp => {
                    let mut amqp = match amqp_url {
                        Some(url) => AmqpConfig::from_url(&url).context("Invalid CHATBUS_AMQP_URL")?,
                        None => AmqpConfig::from_env().context("Invalid CHATBUS_AMQP_* settings")?,
                    };
                    amqp.connect_attempts = connect_attempts;
                    amqp.connect_backoff = Duration::from_millis(connect_backoff_ms);

                    let addr = amqp.addr();
                    BrokerSession::connect(amqp, router)
                        .await
                        .inspect_err(|e| error!(addr = %addr, error = %e, "Broker unreachable"))
                        .context("Failed to connect to broker")?
                }
            };

            serve(gateway, session, memberships).await
        }
        Commands::Names { tenant, channel, kind, session } => {
            names(&router, &tenant, &channel, kind, session.as_ref());
            Ok(())
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn serve(
    gateway: GatewayConfig,
    session: BrokerSession,
    memberships: StaticMemberships,
) -> Result<()> {
    if memberships.is_empty() {
        warn!("No static memberships configured, connections will not receive messages");
    }

    let server = ChatbusServer::new(gateway.clone(), Arc::new(session), Arc::new(memberships))
        .context("Invalid gateway configuration")?;

    info!(addr = %gateway.bind_addr, "Chatbus server starting");
    let result = server.run(shutdown_signal()).await;
    server.shutdown().await;
    result
}

fn names(
    router: &TopicRouter,
    tenant: &TenantId,
    channel: &ChannelId,
    kind: MessageKind,
    session: Option<&SessionId>,
) {
    println!("Topic:       {}", router.topic_name(tenant));
    println!("Routing key: {}", router.routing_key(kind, channel));
    if let Some(session) = session {
        println!("Queue:       {}", router.queue_name(session));
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping server");
}
