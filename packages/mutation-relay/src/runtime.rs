//! Relay runtime assembled from [`RelayConfig`].
//!
//! A runtime owns the emitting [`Relay`], the job store behind its outbox
//! and the [`DispatchWorker`] draining that store. The store depends on the
//! dispatch mode:
//!
//! - [`DispatchMode::InMemory`]: [`MemoryStore`], drained in-process
//! - [`DispatchMode::Durable`]: [`PgJobStore`](crate::stores::PgJobStore)
//!   (feature `postgres`)
//!
//! Both modes run the same worker and the same `dispatch_envelope`, so
//! listeners cannot tell them apart.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{DispatchMode, RelayConfig};
use crate::core::TopicPolicy;
use crate::emitter::Relay;
use crate::error::RelayError;
use crate::extract::ChangeExtractor;
use crate::job::JobStore;
use crate::listener::ClientHandle;
use crate::registry::{ListenerDefinition, Registry};
use crate::stores::MemoryStore;
use crate::worker::DispatchWorker;

/// Relay, store and worker wired from one configuration.
pub struct RelayRuntime<S: JobStore> {
    registry: Arc<Registry>,
    relay: Relay,
    store: Arc<S>,
    worker: Arc<DispatchWorker<S>>,
}

impl<S: JobStore + 'static> RelayRuntime<S> {
    /// Wire `store` with the outbox and worker settings of `config`.
    ///
    /// `client` is handed to every durable listener as its read handle.
    pub fn with_store(
        config: &RelayConfig,
        registry: Arc<Registry>,
        store: Arc<S>,
        client: ClientHandle,
    ) -> Self {
        let relay = Relay::new(registry.clone()).with_outbox_config(config.outbox_config());
        let worker = Arc::new(
            DispatchWorker::new(store.clone(), registry.clone())
                .with_client(client)
                .with_config(config.worker_config()),
        );

        Self {
            registry,
            relay,
            store,
            worker,
        }
    }

    pub fn with_extractor(mut self, extractor: ChangeExtractor) -> Self {
        self.relay = self.relay.with_extractor(extractor);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn worker(&self) -> &Arc<DispatchWorker<S>> {
        &self.worker
    }

    /// Register `definition`, declaring its topic under `policy` first when
    /// nobody has.
    pub fn subscribe(
        &self,
        policy: TopicPolicy,
        definition: ListenerDefinition,
    ) -> Result<(), RelayError> {
        self.registry.register_topic(definition.topic.clone(), policy)?;
        self.registry.add_listener(definition)?;
        Ok(())
    }

    /// Drain every configured queue once.
    pub async fn drain(&self) -> Result<usize, RelayError> {
        self.worker.drain_all().await
    }

    /// Start polling every configured queue until `shutdown` is cancelled.
    pub fn spawn_worker(&self, shutdown: CancellationToken) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.worker.clone().run(shutdown))
    }
}

impl RelayRuntime<MemoryStore> {
    /// In-process runtime for `DispatchMode::InMemory`.
    ///
    /// Durable listeners receive the store itself as their client.
    pub fn in_memory(config: &RelayConfig, registry: Arc<Registry>) -> Result<Self, RelayError> {
        if config.dispatch_mode != DispatchMode::InMemory {
            return Err(RelayError::Config(format!(
                "in-memory runtime requires in_memory dispatch mode, got {:?}",
                config.dispatch_mode
            )));
        }

        let store = Arc::new(MemoryStore::new());
        let client = ClientHandle::from_arc(store.clone());
        info!(queue = %config.queue_name, "in-memory relay runtime ready");
        Ok(Self::with_store(config, registry, store, client))
    }
}

#[cfg(feature = "postgres")]
impl RelayRuntime<crate::stores::PgJobStore> {
    /// PostgreSQL runtime for `DispatchMode::Durable`: connects to
    /// `DATABASE_URL` and creates the queue table if needed.
    ///
    /// Durable listeners receive the connection pool as their client.
    pub async fn connect(config: &RelayConfig, registry: Arc<Registry>) -> Result<Self, RelayError> {
        use anyhow::Context;
        use sqlx::postgres::PgPoolOptions;

        if config.dispatch_mode != DispatchMode::Durable {
            return Err(RelayError::Config(format!(
                "postgres runtime requires durable dispatch mode, got {:?}",
                config.dispatch_mode
            )));
        }
        let database_url = config
            .database_url
            .as_deref()
            .ok_or_else(|| RelayError::Config("DATABASE_URL must be set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to database")
            .map_err(RelayError::Store)?;
        crate::stores::postgres::migrate(&pool)
            .await
            .map_err(RelayError::Store)?;

        let store = Arc::new(crate::stores::PgJobStore::new(pool.clone()));
        info!(queue = %config.queue_name, "postgres relay runtime ready");
        Ok(Self::with_store(config, registry, store, ClientHandle::new(pool)))
    }
}

impl<S: JobStore> std::fmt::Debug for RelayRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRuntime")
            .field("registry", &self.registry)
            .field("worker", &self.worker)
            .finish()
    }
}
