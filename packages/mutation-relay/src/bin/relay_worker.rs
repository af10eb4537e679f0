//! Relay dispatch worker
//!
//! Drains the `relay_jobs` table and dispatches envelopes to listeners.
//! This standalone binary registers a logging listener on the topics named
//! in `RELAY_LOG_TOPICS` (comma separated), which is useful for inspecting
//! what an application enqueues. Applications build a `RelayRuntime` with
//! their own registry instead.

use std::sync::Arc;

use anyhow::{Context, Result};
use mutation_relay::stores::PgJobStore;
use mutation_relay::{
    listener_fn, DispatchMode, ListenerDefinition, QueueClass, Registry, RelayConfig,
    RelayRuntime, TopicPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mutation_relay=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = RelayConfig::from_env().context("Failed to load configuration")?;
    if config.dispatch_mode == DispatchMode::InMemory {
        anyhow::bail!("relay_worker drains PostgreSQL; in_memory mode runs inside the application");
    }

    tracing::info!(queue = %config.queue_name, "Starting relay worker");

    let runtime = RelayRuntime::<PgJobStore>::connect(&config, Arc::new(Registry::new()))
        .await
        .context("Failed to start relay runtime")?;

    let topics = std::env::var("RELAY_LOG_TOPICS").unwrap_or_default();
    for topic in topics.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        runtime.subscribe(
            TopicPolicy::durable(QueueClass::General),
            ListenerDefinition::new(
                "log",
                topic,
                listener_fn(|ctx, payload| async move {
                    tracing::info!(
                        event_id = %ctx.event_id,
                        topic = %ctx.topic,
                        operation = %ctx.operation,
                        entity_id = ?payload.entity_id,
                        changed_fields = ?payload.changed_fields,
                        "envelope received"
                    );
                    Ok(())
                }),
            ),
        )?;
    }
    tracing::info!(topics = runtime.registry().topic_count(), "Listeners registered");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal.cancel();
        }
    });

    runtime.worker().clone().run(shutdown).await
}
