//! Test harness wiring a relay, an in-memory store and a dispatch worker.
//!
//! Each harness owns its own registry and store, so tests run in parallel
//! without sharing state.

use std::sync::Arc;
use std::time::Duration;

use mutation_relay::stores::MemoryStore;
use mutation_relay::testing::RecordedMutation;
use mutation_relay::{
    ChangeExtractor, ClientHandle, DispatchWorker, EmitReceipt, OutboxConfig, Registry, Relay,
    RelayError, RequestContext, WorkerConfig,
};
use tokio_util::sync::CancellationToken;

/// Upper bound for any asynchronous delivery in tests.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing once; honours RUST_LOG.
///
/// Run tests with: RUST_LOG=debug cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestRelay {
    pub registry: Arc<Registry>,
    pub relay: Relay,
    pub store: Arc<MemoryStore>,
    pub worker: Arc<DispatchWorker<MemoryStore>>,
}

impl TestRelay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_outbox_config(registry, OutboxConfig::default())
    }

    pub fn with_outbox_config(registry: Arc<Registry>, outbox: OutboxConfig) -> Self {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let relay = Relay::new(registry.clone())
            .with_outbox_config(outbox)
            .with_extractor(ChangeExtractor::new().with_header_field("trust_center_id"));
        let worker = Arc::new(
            DispatchWorker::new(store.clone(), registry.clone())
                .with_client(ClientHandle::from_arc(store.clone()))
                .with_config(WorkerConfig {
                    poll_interval: Duration::from_millis(10),
                    fetch_cooldown: Duration::ZERO,
                    ..WorkerConfig::default()
                }),
        );

        Self {
            registry,
            relay,
            store,
            worker,
        }
    }

    /// Run `mutation` in its own transaction: commit on success, roll back
    /// on error.
    pub async fn mutate(
        &self,
        mutation: &RecordedMutation,
        request: &RequestContext,
    ) -> Result<Vec<EmitReceipt>, RelayError> {
        self.mutate_with(mutation, request, false).await
    }

    /// Like [`TestRelay::mutate`], with every outbox write failing.
    pub async fn mutate_with_broken_outbox(
        &self,
        mutation: &RecordedMutation,
        request: &RequestContext,
    ) -> Result<Vec<EmitReceipt>, RelayError> {
        self.mutate_with(mutation, request, true).await
    }

    async fn mutate_with(
        &self,
        mutation: &RecordedMutation,
        request: &RequestContext,
        broken_outbox: bool,
    ) -> Result<Vec<EmitReceipt>, RelayError> {
        let mut tx = self.store.begin();
        if broken_outbox {
            tx.fail_enqueue();
        }
        match self.relay.on_mutation(mutation, &mut tx, request).await {
            Ok(receipts) => {
                tx.commit();
                Ok(receipts)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Drain every queue once, bounded by [`DELIVERY_TIMEOUT`].
    pub async fn drain(&self) -> usize {
        tokio::time::timeout(DELIVERY_TIMEOUT, self.worker.drain_all())
            .await
            .expect("drain timed out")
            .expect("drain failed")
    }

    /// Start the polling worker in the background.
    pub fn spawn_worker(&self) -> CancellationToken {
        let shutdown = CancellationToken::new();
        tokio::spawn(self.worker.clone().run(shutdown.clone()));
        shutdown
    }
}
