//! Structured error types for the relay.
//!
//! # The Error Boundary Rule
//!
//! Listener and hook bodies return `anyhow::Result<()>`; `anyhow` is internal
//! transport. Nothing leaves [`dispatch_envelope`](crate::dispatch_envelope)
//! as a bare `anyhow::Error`: listener failures are wrapped in
//! [`ListenerError`] and surface as [`RelayError::Listener`].
//!
//! | Error | Raised | Effect |
//! |-------|--------|--------|
//! | [`RegistryError`] | start-up registration | process should not start |
//! | [`RelayError::Listener`] (inline) | inside the request | request fails, transaction rolls back |
//! | [`RelayError::Listener`] (durable) | inside the worker | job retried by the queue |
//! | [`RelayError::Enqueue`] | outbox write, fail-closed | request fails, transaction rolls back |
//! | [`DeserializationError`] | worker decode | job dead-lettered |
//! | [`RelayError::Store`] | claiming or connecting to the queue | drain fails, poller backs off |
//! | [`RelayError::Config`] | runtime construction | process should not start |

use thiserror::Error;

use crate::core::{Operation, TopicName, TopicPolicy};
use crate::job::DeserializationError;

/// Registration errors. Raised only at start-up.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A topic was registered with an empty name.
    #[error("topic name is required")]
    TopicNameRequired,

    /// A listener was registered without a name.
    #[error("listener name is required")]
    ListenerNameRequired,

    /// A listener was registered against a topic nobody declared.
    #[error("listener {listener} targets unregistered topic {topic}")]
    TopicNotRegistered {
        /// The listener being registered.
        listener: String,
        /// The undeclared topic.
        topic: TopicName,
    },

    /// The topic already exists with a different policy.
    #[error("topic {topic} already registered with policy {existing:?}, refusing {requested:?}")]
    TopicAlreadyRegistered {
        topic: TopicName,
        existing: TopicPolicy,
        requested: TopicPolicy,
    },

    /// A listener with the same name is already bound to the topic.
    #[error("listener {listener} already registered on topic {topic}")]
    DuplicateListener { topic: TopicName, listener: String },
}

/// A listener (or pre/post hook) failed while handling an envelope.
#[derive(Debug, Error)]
#[error("listener {listener} failed on {topic} {operation}: {cause}")]
pub struct ListenerError {
    /// Name of the failing registration.
    pub listener: String,
    pub topic: TopicName,
    pub operation: Operation,
    /// Whether the failure was a caught panic rather than a returned error.
    pub panicked: bool,
    #[source]
    pub cause: anyhow::Error,
}

/// Errors surfaced by emission, dispatch and the worker.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A listener failed. Fatal to the request when inline; retried when durable.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// The outbox could not persist an envelope (fail-closed topics only).
    #[error("failed to enqueue envelope for {topic}: {source}")]
    Enqueue {
        topic: TopicName,
        #[source]
        source: anyhow::Error,
    },

    /// An envelope could not be serialized for the outbox.
    #[error("failed to encode envelope for {topic}: {source}")]
    Encode {
        topic: TopicName,
        #[source]
        source: serde_json::Error,
    },

    /// A queued job could not be turned back into an envelope.
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    /// A topic or listener could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Job store bookkeeping failed (claiming, connecting, migrating).
    #[error("job store error: {0}")]
    Store(#[source] anyhow::Error),

    /// The runtime was built from a configuration it cannot serve.
    #[error("invalid relay configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether retrying the same job could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RelayError::Deserialization(_)
                | RelayError::Encode { .. }
                | RelayError::Registry(_)
                | RelayError::Config(_)
        )
    }

    /// The listener failure, if this error is one.
    pub fn listener_error(&self) -> Option<&ListenerError> {
        match self {
            RelayError::Listener(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_error_display() {
        let err = ListenerError {
            listener: "trust-center-cache".into(),
            topic: TopicName::for_entity("TrustCenter"),
            operation: Operation::UpdateOne,
            panicked: false,
            cause: anyhow::anyhow!("cache unavailable"),
        };
        let msg = err.to_string();
        assert!(msg.contains("trust-center-cache"));
        assert!(msg.contains("TrustCenter"));
        assert!(msg.contains("UpdateOne"));
        assert!(msg.contains("cache unavailable"));
    }

    #[test]
    fn test_retryable_classification() {
        let listener = RelayError::Listener(ListenerError {
            listener: "l".into(),
            topic: TopicName::for_entity("T"),
            operation: Operation::Create,
            panicked: true,
            cause: anyhow::anyhow!("boom"),
        });
        assert!(listener.is_retryable());
        assert!(listener.listener_error().is_some_and(|e| e.panicked));

        let decode = RelayError::Deserialization(DeserializationError::UnknownJobKind(
            "other".into(),
        ));
        assert!(!decode.is_retryable());
        assert!(decode.listener_error().is_none());

        let store = RelayError::Store(anyhow::anyhow!("connection reset"));
        assert!(store.is_retryable());
        assert_eq!(store.to_string(), "job store error: connection reset");

        let registry: RelayError = RegistryError::TopicNameRequired.into();
        assert!(!registry.is_retryable());
    }

    #[test]
    fn test_registry_error_messages() {
        let err = RegistryError::TopicNotRegistered {
            listener: "slack".into(),
            topic: TopicName::for_entity("Control"),
        };
        assert_eq!(
            err.to_string(),
            "listener slack targets unregistered topic Control"
        );
    }
}
