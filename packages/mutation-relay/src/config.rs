use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::core::OutboxFailureMode;
use crate::job::DEFAULT_MAX_ATTEMPTS;
use crate::outbox::OutboxConfig;
use crate::worker::{QueueConfig, WorkerConfig};

/// Where durable-policy topics are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// PostgreSQL outbox drained by the dispatch worker.
    #[default]
    Durable,
    /// In-process [`MemoryStore`](crate::stores::MemoryStore) drained by the same worker code.
    InMemory,
}

impl FromStr for DispatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "durable" => Ok(DispatchMode::Durable),
            "in_memory" | "inmemory" | "memory" => Ok(DispatchMode::InMemory),
            other => Err(anyhow::anyhow!("unknown dispatch mode: {}", other)),
        }
    }
}

/// Relay configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub dispatch_mode: DispatchMode,
    /// Required in durable mode.
    pub database_url: Option<String>,
    /// Queue of `QueueClass::General` topics.
    pub queue_name: String,
    /// Workers on the default queue.
    pub worker_count: usize,
    /// Extra queues and their worker counts.
    pub queue_workers: BTreeMap<String, usize>,
    pub max_attempts: i32,
    /// Minimum pause between fetches on a busy queue.
    pub fetch_cooldown: Duration,
    /// Pause between fetches on an idle queue.
    pub poll_interval: Duration,
    pub failure_mode: OutboxFailureMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Durable,
            database_url: None,
            queue_name: "events".to_string(),
            worker_count: 1,
            queue_workers: BTreeMap::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fetch_cooldown: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            failure_mode: OutboxFailureMode::FailClosed,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, normalizing defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            dispatch_mode: var("RELAY_DISPATCH_MODE")
                .map(|v| v.parse::<DispatchMode>())
                .transpose()
                .context("RELAY_DISPATCH_MODE must be durable or in_memory")?
                .unwrap_or(defaults.dispatch_mode),
            database_url: var("DATABASE_URL"),
            queue_name: var("RELAY_QUEUE_NAME").unwrap_or(defaults.queue_name),
            worker_count: var("RELAY_WORKER_COUNT")
                .map(|v| v.trim().parse::<usize>())
                .transpose()
                .context("RELAY_WORKER_COUNT must be a valid number")?
                .unwrap_or(defaults.worker_count),
            queue_workers: var("RELAY_QUEUE_WORKERS")
                .map(|v| parse_queue_workers(&v))
                .transpose()?
                .unwrap_or_default(),
            max_attempts: var("RELAY_MAX_ATTEMPTS")
                .map(|v| v.trim().parse::<i32>())
                .transpose()
                .context("RELAY_MAX_ATTEMPTS must be a valid number")?
                .unwrap_or(defaults.max_attempts),
            fetch_cooldown: var("RELAY_FETCH_COOLDOWN_MS")
                .map(|v| v.trim().parse::<u64>().map(Duration::from_millis))
                .transpose()
                .context("RELAY_FETCH_COOLDOWN_MS must be a valid number")?
                .unwrap_or(defaults.fetch_cooldown),
            poll_interval: var("RELAY_POLL_INTERVAL_MS")
                .map(|v| v.trim().parse::<u64>().map(Duration::from_millis))
                .transpose()
                .context("RELAY_POLL_INTERVAL_MS must be a valid number")?
                .unwrap_or(defaults.poll_interval),
            failure_mode: var("RELAY_OUTBOX_FAILURE_MODE")
                .map(|v| v.parse::<OutboxFailureMode>())
                .transpose()
                .context("RELAY_OUTBOX_FAILURE_MODE must be fail_closed or fail_open")?
                .unwrap_or(defaults.failure_mode),
        };

        config.validate()
    }

    /// Apply floors and reject inconsistent settings.
    pub fn validate(mut self) -> Result<Self> {
        if self.queue_name.trim().is_empty() {
            self.queue_name = Self::default().queue_name;
        }
        self.worker_count = self.worker_count.max(1);
        if self.max_attempts < 1 {
            self.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        self.queue_workers
            .retain(|name, count| !name.trim().is_empty() && *count >= 1);

        if self.dispatch_mode == DispatchMode::Durable && self.database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set in durable dispatch mode");
        }
        Ok(self)
    }

    /// Queues to drain with their worker counts: the default queue first,
    /// then extra queues in name order. An extra entry naming the default
    /// queue overrides its worker count.
    pub fn queue_configs(&self) -> Vec<QueueConfig> {
        let mut queues = vec![QueueConfig::new(
            self.queue_name.clone(),
            self.queue_workers
                .get(&self.queue_name)
                .copied()
                .unwrap_or(self.worker_count),
        )];
        queues.extend(
            self.queue_workers
                .iter()
                .filter(|(name, _)| **name != self.queue_name)
                .map(|(name, count)| QueueConfig::new(name.clone(), *count)),
        );
        queues
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            default_queue: self.queue_name.clone(),
            max_attempts: self.max_attempts,
            failure_mode: self.failure_mode,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queues: self.queue_configs(),
            poll_interval: self.poll_interval,
            fetch_cooldown: self.fetch_cooldown,
            ..WorkerConfig::default()
        }
    }
}

/// Parse `name=count,name=count`. Blank names and counts below one are skipped.
fn parse_queue_workers(raw: &str) -> Result<BTreeMap<String, usize>> {
    let mut queues = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, count) = pair
            .split_once('=')
            .with_context(|| format!("RELAY_QUEUE_WORKERS entry {:?} must be name=count", pair))?;
        let count: usize = count
            .trim()
            .parse()
            .with_context(|| format!("RELAY_QUEUE_WORKERS count for {:?} must be a number", name))?;
        let name = name.trim();
        if name.is_empty() || count < 1 {
            continue;
        }
        queues.insert(name.to_string(), count);
    }
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RelayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_in_memory() {
        let config = load(&[("RELAY_DISPATCH_MODE", "in_memory")]).unwrap();
        assert_eq!(config.dispatch_mode, DispatchMode::InMemory);
        assert_eq!(config.queue_name, "events");
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.failure_mode, OutboxFailureMode::FailClosed);
    }

    #[test]
    fn test_durable_requires_database_url() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let config = load(&[("DATABASE_URL", "postgres://localhost/relay")]).unwrap();
        assert_eq!(config.dispatch_mode, DispatchMode::Durable);
    }

    #[test]
    fn test_floors_applied() {
        let config = load(&[
            ("RELAY_DISPATCH_MODE", "in_memory"),
            ("RELAY_WORKER_COUNT", "0"),
            ("RELAY_MAX_ATTEMPTS", "-3"),
        ])
        .unwrap();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_queue_workers_parsing_and_merge() {
        let config = load(&[
            ("RELAY_DISPATCH_MODE", "in_memory"),
            ("RELAY_WORKER_COUNT", "3"),
            ("RELAY_QUEUE_WORKERS", "workflow=2, notification=0, =4, events=5"),
        ])
        .unwrap();

        let queues: Vec<(String, usize)> = config
            .queue_configs()
            .into_iter()
            .map(|q| (q.name, q.workers))
            .collect();
        assert_eq!(
            queues,
            vec![("events".to_string(), 5), ("workflow".to_string(), 2)]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("RELAY_DISPATCH_MODE", "carrier-pigeon")]).is_err());
        assert!(load(&[
            ("RELAY_DISPATCH_MODE", "in_memory"),
            ("RELAY_WORKER_COUNT", "many")
        ])
        .is_err());
        assert!(load(&[
            ("RELAY_DISPATCH_MODE", "in_memory"),
            ("RELAY_QUEUE_WORKERS", "workflow")
        ])
        .is_err());
    }

    #[test]
    fn test_outbox_and_worker_configs() {
        let config = load(&[
            ("RELAY_DISPATCH_MODE", "in_memory"),
            ("RELAY_QUEUE_NAME", "mutations"),
            ("RELAY_OUTBOX_FAILURE_MODE", "fail_open"),
            ("RELAY_POLL_INTERVAL_MS", "250"),
        ])
        .unwrap();

        let outbox = config.outbox_config();
        assert_eq!(outbox.default_queue, "mutations");
        assert_eq!(outbox.failure_mode, OutboxFailureMode::FailOpen);

        let worker = config.worker_config();
        assert_eq!(worker.poll_interval, Duration::from_millis(250));
        assert_eq!(worker.queues[0].name, "mutations");
    }
}
