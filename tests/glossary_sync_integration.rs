use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metasync::config::SyncConfig;
use metasync::seed::glossary_types;
use metasync::{
    AssetManagerConnector, CallContext, ChangeKind, ChangeOrigin, ConnectorRegistry, CorrelationProperties, Engine,
    ErrorKind, FindRequest, IncomingChange, Instance, InstanceStatus, KeyPattern, MemoryStore, NewInstance,
    PropagationStatus, PropertyBag, PropertyChanges, RecordingEventSink, SequencingOrder, SyncDisposition,
    SynchronizationDirection, TypedValue,
};

/// Connector that records deliveries and can be told to fail first
#[derive(Default)]
struct RecordingConnector {
    failures_before_success: AtomicU32,
    delivered: parking_lot::Mutex<Vec<(String, PropertyBag)>>,
}

#[async_trait::async_trait]
impl AssetManagerConnector for RecordingConnector {
    async fn apply_change(&self, external_identifier: &str, properties: &PropertyBag) -> anyhow::Result<()> {
        if self.failures_before_success.load(Ordering::SeqCst) > 0 {
            self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("asset manager unavailable");
        }
        self.delivered
            .lock()
            .push((external_identifier.to_string(), properties.clone()));
        Ok(())
    }
}

// Test harness wrapping an engine over the in-memory store
struct TestHarness {
    engine: Engine<MemoryStore>,
    events: Arc<RecordingEventSink>,
    s2: Arc<RecordingConnector>,
    ctx: CallContext,
}

impl TestHarness {
    fn new() -> Self {
        let events = Arc::new(RecordingEventSink::new());
        let s2 = Arc::new(RecordingConnector::default());
        let mut connectors = ConnectorRegistry::new();
        connectors.register("S2", s2.clone());
        connectors.register("S1", Arc::new(RecordingConnector::default()));

        let config = SyncConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            max_propagation_attempts: 3,
            ..SyncConfig::default()
        };
        let engine = Engine::new(Arc::new(MemoryStore::new()), glossary_types(), events.clone(), connectors, &config);

        Self {
            engine,
            events,
            s2,
            ctx: CallContext::new("steward").with_timeout(Duration::from_secs(2)),
        }
    }

    async fn glossary(&self, qualified_name: &str) -> Instance {
        let mut props = PropertyBag::new();
        props.insert("qualifiedName".to_string(), TypedValue::string(qualified_name));
        self.engine
            .instances
            .create(&self.ctx, NewInstance::new("Glossary", props))
            .await
            .unwrap()
    }

    async fn correlate(&self, guid: &String, system: &str, identifier: &str, direction: SynchronizationDirection) {
        self.engine
            .correlations
            .establish(
                &self.ctx,
                guid,
                system,
                identifier,
                CorrelationProperties::new(KeyPattern::LocalKey, direction),
            )
            .await
            .unwrap();
    }
}

fn set(name: &str, value: &str) -> PropertyChanges {
    PropertyChanges::default().set(name, TypedValue::string(value))
}

#[tokio::test]
async fn test_external_change_flows_into_find() {
    let harness = TestHarness::new();
    let glossary = harness.glossary("Glossary::A").await;
    assert_eq!(glossary.version, 1);
    harness
        .correlate(&glossary.guid, "S1", "ext-42", SynchronizationDirection::BothDirections)
        .await;

    let outcome = harness
        .engine
        .coordinator
        .submit(
            &CallContext::synchronizer("S1"),
            IncomingChange::new(ChangeOrigin::external("S1", "ext-42"), set("displayName", "Sales")),
        )
        .await
        .unwrap();
    assert_eq!(outcome.disposition, SyncDisposition::Applied);
    assert_eq!(outcome.version, 2);
    // Never echoed back to the system it came from
    assert_eq!(outcome.propagations_queued, 0);

    let page = harness.engine.queries.find(&FindRequest::for_type("Glossary")).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].guid, glossary.guid);
    assert_eq!(page.items[0].version, 2);
    assert_eq!(page.items[0].updated_by, "sync:S1");
    assert_eq!(page.items[0].property("displayName"), Some(&TypedValue::string("Sales")));

    assert_eq!(
        harness.events.kinds_for(&glossary.guid),
        vec![ChangeKind::Created, ChangeKind::CorrelationEstablished, ChangeKind::Updated]
    );
}

#[tokio::test]
async fn test_inbound_change_on_outbound_only_correlation_is_ignored() {
    let harness = TestHarness::new();
    let glossary = harness.glossary("Glossary::A").await;
    harness
        .correlate(&glossary.guid, "S2", "ext-7", SynchronizationDirection::ToThirdParty)
        .await;

    let outcome = harness
        .engine
        .coordinator
        .submit(
            &CallContext::synchronizer("S2"),
            IncomingChange::new(ChangeOrigin::external("S2", "ext-7"), set("displayName", "Hijacked")),
        )
        .await
        .unwrap();

    assert!(matches!(outcome.disposition, SyncDisposition::Ignored(_)));
    assert_eq!(outcome.version, 1);
    let current = harness.engine.instances.get(&glossary.guid).await.unwrap();
    assert_eq!(current, glossary);
}

#[tokio::test]
async fn test_internal_change_propagates_with_retry() {
    let harness = TestHarness::new();
    harness.s2.failures_before_success.store(2, Ordering::SeqCst);
    let glossary = harness.glossary("Glossary::A").await;
    harness
        .correlate(&glossary.guid, "S1", "ext-42", SynchronizationDirection::FromThirdParty)
        .await;
    harness
        .correlate(&glossary.guid, "S2", "ext-7", SynchronizationDirection::BothDirections)
        .await;

    let outcome = harness
        .engine
        .coordinator
        .submit(
            &harness.ctx,
            IncomingChange::new(ChangeOrigin::internal(glossary.guid.clone()), set("usage", "Finance only")),
        )
        .await
        .unwrap();
    assert_eq!(outcome.propagations_queued, 1);

    harness.engine.propagation().wait_idle().await;
    let reports = harness.engine.propagation().reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].external_system_id, "S2");
    assert_eq!(reports[0].status, PropagationStatus::Delivered { attempts: 3 });

    let delivered = harness.s2.delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "ext-7");
    assert_eq!(delivered[0].1["usage"], TypedValue::string("Finance only"));

    let correlations = harness.engine.correlations.list_for_instance(&glossary.guid).await.unwrap();
    let s2 = correlations.iter().find(|c| c.external_system_id == "S2").unwrap();
    assert_eq!(s2.last_synchronized_version, Some(2));
}

#[tokio::test]
async fn test_failed_propagation_keeps_local_commit() {
    let harness = TestHarness::new();
    harness.s2.failures_before_success.store(10, Ordering::SeqCst);
    let glossary = harness.glossary("Glossary::A").await;
    harness
        .correlate(&glossary.guid, "S2", "ext-7", SynchronizationDirection::ToThirdParty)
        .await;

    harness
        .engine
        .coordinator
        .submit(
            &harness.ctx,
            IncomingChange::new(ChangeOrigin::internal(glossary.guid.clone()), set("usage", "x")),
        )
        .await
        .unwrap();
    harness.engine.propagation().wait_idle().await;

    assert!(matches!(
        harness.engine.propagation().reports()[0].status,
        PropagationStatus::Failed { attempts: 3, .. }
    ));
    assert_eq!(harness.engine.instances.get(&glossary.guid).await.unwrap().version, 2);
}

#[tokio::test]
async fn test_recycled_key_requires_supersede_then_resolves_new_guid() {
    let harness = TestHarness::new();
    let first = harness.glossary("Glossary::Old").await;
    let second = harness.glossary("Glossary::New").await;
    let recycled = CorrelationProperties::new(KeyPattern::RecycledKey, SynchronizationDirection::BothDirections);

    harness
        .engine
        .correlations
        .establish(&harness.ctx, &first.guid, "S1", "row-1", recycled.clone())
        .await
        .unwrap();
    harness
        .engine
        .correlations
        .supersede(&harness.ctx, "S1", "row-1", &second.guid, KeyPattern::RecycledKey)
        .await
        .unwrap();

    assert_eq!(harness.engine.correlations.resolve("S1", "row-1").await.unwrap(), second.guid);
    let history = harness.engine.correlations.history("S1", "row-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].valid_to.is_some());

    let local = harness.glossary("Glossary::Local").await;
    harness
        .correlate(&local.guid, "S1", "ext-1", SynchronizationDirection::BothDirections)
        .await;
    let dup = harness
        .engine
        .correlations
        .establish(&harness.ctx, &first.guid, "S1", "ext-1", recycled)
        .await
        .unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::DuplicateKey);
}

#[tokio::test]
async fn test_purge_cancels_and_everything_after_is_not_found() {
    let harness = TestHarness::new();
    harness.s2.failures_before_success.store(1000, Ordering::SeqCst);
    let glossary = harness.glossary("Glossary::A").await;
    harness
        .correlate(&glossary.guid, "S2", "ext-7", SynchronizationDirection::BothDirections)
        .await;

    let outcome = harness
        .engine
        .coordinator
        .submit(
            &harness.ctx,
            IncomingChange::new(ChangeOrigin::internal(glossary.guid.clone()), set("usage", "x")),
        )
        .await
        .unwrap();
    assert_eq!(outcome.propagations_queued, 1);

    harness.engine.instances.purge(&harness.ctx, &glossary.guid, 2).await.unwrap();
    harness.engine.propagation().wait_idle().await;
    let reports = harness.engine.propagation().reports();
    assert!(matches!(
        reports[0].status,
        PropagationStatus::Cancelled | PropagationStatus::Failed { .. }
    ));

    let guid = &glossary.guid;
    let instances = &harness.engine.instances;
    assert_eq!(instances.get(guid).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        instances.update(&harness.ctx, guid, 2, &set("usage", "y")).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(instances.restore(&harness.ctx, guid, 2).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        harness.engine.correlations.list_for_instance(guid).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        harness.engine.correlations.resolve("S2", "ext-7").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        harness
            .engine
            .coordinator
            .submit(&harness.ctx, IncomingChange::new(ChangeOrigin::internal(guid.clone()), set("usage", "z")))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_soft_delete_restore_preserves_status_and_properties() {
    let harness = TestHarness::new();
    let mut props = PropertyBag::new();
    props.insert("qualifiedName".to_string(), TypedValue::string("Glossary::Draft"));
    props.insert("description".to_string(), TypedValue::string("work in progress"));
    let draft = harness
        .engine
        .instances
        .create(&harness.ctx, NewInstance::new("Glossary", props).with_status(InstanceStatus::Proposed))
        .await
        .unwrap();

    harness.engine.instances.soft_delete(&harness.ctx, &draft.guid, 1).await.unwrap();
    let hidden = harness.engine.queries.find(&FindRequest::for_type("Glossary")).await.unwrap();
    assert_eq!(hidden.total, 0);

    let restored = harness.engine.instances.restore(&harness.ctx, &draft.guid, 2).await.unwrap();
    assert_eq!(restored.status, InstanceStatus::Proposed);
    assert_eq!(restored.version, 3);
    assert_eq!(restored.properties, draft.properties);
}

#[tokio::test]
async fn test_unbounded_page_returns_everything_ordered() {
    let harness = TestHarness::new();
    for i in 0..500 {
        harness.glossary(&format!("Glossary::{:03}", i % 50)).await;
    }

    let request = FindRequest::for_type("Glossary")
        .ordered_by(SequencingOrder::PropertyAscending, Some("qualifiedName"))
        .page(0, 0);
    let page = harness.engine.queries.find(&request).await.unwrap();
    assert_eq!(page.total, 500);
    assert_eq!(page.items.len(), 500);

    for pair in page.items.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let (ka, kb) = (a.property("qualifiedName").unwrap().as_str(), b.property("qualifiedName").unwrap().as_str());
        assert!(ka < kb || (ka == kb && a.guid < b.guid));
    }

    let tail = harness.engine.queries.find(&request.clone().page(490, 20)).await.unwrap();
    assert_eq!(tail.items.len(), 10);
    assert_eq!(tail.items[..], page.items[490..]);
}

#[tokio::test]
async fn test_as_of_query_sees_earlier_version() {
    let harness = TestHarness::new();
    let glossary = harness.glossary("Glossary::A").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let before_update = chrono::Utc::now();
    tokio::time::sleep(Duration::from_millis(5)).await;

    harness
        .engine
        .instances
        .update(&harness.ctx, &glossary.guid, 1, &set("displayName", "Renamed"))
        .await
        .unwrap();

    let then = harness
        .engine
        .queries
        .find(&FindRequest::for_type("Glossary").as_of(before_update))
        .await
        .unwrap();
    assert_eq!(then.items[0].version, 1);
    assert!(then.items[0].property("displayName").is_none());

    let old = harness.engine.instances.get_as_of(&glossary.guid, before_update).await.unwrap();
    assert_eq!(old, glossary);

    let before_creation = glossary.create_time - chrono::Duration::seconds(1);
    let empty = harness
        .engine
        .queries
        .find(&FindRequest::for_type("Glossary").as_of(before_creation))
        .await
        .unwrap();
    assert_eq!(empty.total, 0);
}

/// Mirror whose writes of payloads ending in "slow" take a while
#[derive(Default)]
struct SlowMirror {
    holds: parking_lot::Mutex<Option<String>>,
}

#[async_trait::async_trait]
impl AssetManagerConnector for SlowMirror {
    async fn apply_change(&self, _: &str, properties: &PropertyBag) -> anyhow::Result<()> {
        let name = properties
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if name.ends_with("slow") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        *self.holds.lock() = Some(name);
        Ok(())
    }
}

#[tokio::test]
async fn test_mirror_ends_with_latest_version() {
    let mirror = Arc::new(SlowMirror::default());
    let mut connectors = ConnectorRegistry::new();
    connectors.register("S2", mirror.clone());
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        glossary_types(),
        Arc::new(RecordingEventSink::new()),
        connectors,
        &SyncConfig::default(),
    );
    let ctx = CallContext::new("steward");

    let mut props = PropertyBag::new();
    props.insert("qualifiedName".to_string(), TypedValue::string("Glossary::A"));
    let glossary = engine.instances.create(&ctx, NewInstance::new("Glossary", props)).await.unwrap();
    engine
        .correlations
        .establish(
            &ctx,
            &glossary.guid,
            "S2",
            "ext-7",
            CorrelationProperties::new(KeyPattern::LocalKey, SynchronizationDirection::BothDirections),
        )
        .await
        .unwrap();

    for name in ["v2-slow", "v3"] {
        engine
            .coordinator
            .submit(
                &ctx,
                IncomingChange::new(ChangeOrigin::internal(glossary.guid.clone()), set("displayName", name)),
            )
            .await
            .unwrap();
    }
    engine.propagation().wait_idle().await;

    let local = engine.instances.get(&glossary.guid).await.unwrap();
    assert_eq!(local.version, 3);
    let correlation = engine.correlations.find("S2", "ext-7").await.unwrap().unwrap();
    assert_eq!(correlation.last_synchronized_version, Some(3));
    assert_eq!(mirror.holds.lock().as_deref(), Some("v3"));
}
