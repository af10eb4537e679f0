//! Emission is gated on registered interest.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use mutation_relay::testing::RecordedMutation;
use mutation_relay::{
    listener_fn, ListenerDefinition, Operation, QueueClass, Registry, RequestContext, TopicName,
    TopicPolicy,
};
use serde_json::json;

type Invocations = Arc<Mutex<Vec<(String, Operation)>>>;

fn recording(name: &'static str, seen: Invocations) -> impl mutation_relay::Listener {
    listener_fn(move |ctx, _| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push((name.to_string(), ctx.operation));
            Ok(())
        }
    })
}

fn split_registry(policy: TopicPolicy) -> (Arc<Registry>, Invocations) {
    let seen: Invocations = Arc::default();
    let registry = Arc::new(Registry::new());
    registry.register_topic("Risk", policy).unwrap();
    registry
        .add_listener(
            ListenerDefinition::new("on-create", "Risk", recording("on-create", seen.clone()))
                .on(Operation::Create),
        )
        .unwrap();
    registry
        .add_listener(
            ListenerDefinition::new("on-update", "Risk", recording("on-update", seen.clone()))
                .on(Operation::UpdateOne),
        )
        .unwrap();
    (registry, seen)
}

#[tokio::test]
async fn test_delete_invokes_neither_create_nor_update_listener() {
    for policy in [
        TopicPolicy::inline(),
        TopicPolicy::durable(QueueClass::General),
    ] {
        let (registry, seen) = split_registry(policy);
        let harness = TestRelay::new(registry);

        let receipts = harness
            .mutate(
                &RecordedMutation::delete_one("Risk", "r-1"),
                &RequestContext::new(),
            )
            .await
            .unwrap();

        assert!(receipts.is_empty());
        assert_eq!(harness.store.job_count(), 0, "no job for an uninteresting delete");
        harness.drain().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_each_listener_only_sees_its_operation() {
    let (registry, seen) = split_registry(TopicPolicy::durable(QueueClass::General));
    let harness = TestRelay::new(registry);
    let request = RequestContext::new();

    harness
        .mutate(&RecordedMutation::create("Risk", "r-1"), &request)
        .await
        .unwrap();
    harness
        .mutate(
            &RecordedMutation::update_one("Risk", "r-1").set("score", json!(7)),
            &request,
        )
        .await
        .unwrap();
    assert_eq!(harness.drain().await, 2);

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        vec![
            ("on-create".to_string(), Operation::Create),
            ("on-update".to_string(), Operation::UpdateOne),
        ]
    );
}

#[tokio::test]
async fn test_entity_without_topics_does_no_work() {
    let (registry, _) = split_registry(TopicPolicy::durable(QueueClass::General));
    let harness = TestRelay::new(registry);

    let receipts = harness
        .mutate(
            &RecordedMutation::update_one("Program", "p-1").set("name", json!("SOC 2")),
            &RequestContext::new(),
        )
        .await
        .unwrap();

    assert!(receipts.is_empty());
    assert_eq!(harness.store.job_count(), 0);
}

#[tokio::test]
async fn test_bulk_writes_without_id_reach_their_listeners() {
    let seen: Invocations = Arc::default();
    let entity_ids = Arc::new(Mutex::new(Vec::new()));
    let recorder = entity_ids.clone();
    let registry = Arc::new(Registry::new());
    registry
        .register_topic("Task", TopicPolicy::durable(QueueClass::General))
        .unwrap();
    registry
        .add_listener(
            ListenerDefinition::new("bulk-update", "Task", recording("bulk-update", seen.clone()))
                .on(Operation::Update),
        )
        .unwrap();
    registry
        .add_listener(
            ListenerDefinition::new(
                "bulk-delete",
                "Task",
                listener_fn(move |_, payload| {
                    let recorder = recorder.clone();
                    async move {
                        recorder.lock().unwrap().push(payload.entity_id.clone());
                        Ok(())
                    }
                }),
            )
            .on(Operation::Delete),
        )
        .unwrap();
    assert!(registry.interested_in(&TopicName::from("Task"), Operation::Update));
    let harness = TestRelay::new(registry);
    let request = RequestContext::new();

    let update = harness
        .mutate(
            &RecordedMutation::update("Task").set("status", json!("DONE")),
            &request,
        )
        .await
        .unwrap();
    assert_eq!(update.len(), 1);

    let delete = harness
        .mutate(&RecordedMutation::delete("Task"), &request)
        .await
        .unwrap();
    assert_eq!(delete.len(), 1);

    assert_eq!(harness.store.job_count(), 2);
    assert_eq!(harness.drain().await, 2);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("bulk-update".to_string(), Operation::Update)]
    );
    assert_eq!(*entity_ids.lock().unwrap(), vec![None]);
}

#[tokio::test]
async fn test_soft_delete_reaches_soft_delete_listeners_only() {
    let seen: Invocations = Arc::default();
    let registry = Arc::new(Registry::new());
    registry.register_topic("Control", TopicPolicy::inline()).unwrap();
    registry
        .add_listener(
            ListenerDefinition::new("archive", "Control", recording("archive", seen.clone()))
                .on(Operation::SoftDelete),
        )
        .unwrap();
    let harness = TestRelay::new(registry);
    let request = RequestContext::new();

    harness
        .mutate(
            &RecordedMutation::update_one("Control", "c-1").set("title", json!("renamed")),
            &request,
        )
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());

    harness
        .mutate(
            &RecordedMutation::update_one("Control", "c-1")
                .set("deleted_at", json!("2026-01-01T00:00:00Z"))
                .soft_delete(),
            &request,
        )
        .await
        .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("archive".to_string(), Operation::SoftDelete)]
    );
}

#[tokio::test]
async fn test_concern_topics_fan_out_from_one_mutation() {
    let seen: Invocations = Arc::default();
    let registry = Arc::new(Registry::new());
    registry
        .register_topic(TopicName::for_entity("Evidence"), TopicPolicy::inline())
        .unwrap();
    registry
        .register_topic(
            TopicName::for_concern("Evidence", "search"),
            TopicPolicy::durable(QueueClass::General),
        )
        .unwrap();
    registry
        .add_listener(
            ListenerDefinition::new("cache", "Evidence", recording("cache", seen.clone()))
                .on(Operation::UpdateOne),
        )
        .unwrap();
    registry
        .add_listener(
            ListenerDefinition::new(
                "search-index",
                "Evidence.search",
                recording("search-index", seen.clone()),
            )
            .on(Operation::UpdateOne),
        )
        .unwrap();
    let harness = TestRelay::new(registry);

    let receipts = harness
        .mutate(
            &RecordedMutation::update_one("Evidence", "e-1").set("name", json!("pentest")),
            &RequestContext::new(),
        )
        .await
        .unwrap();
    assert_eq!(receipts.len(), 2);
    assert_eq!(seen.lock().unwrap().len(), 1, "only the inline listener ran so far");

    harness.drain().await;
    let names: Vec<String> = seen.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["cache".to_string(), "search-index".to_string()]);
}
