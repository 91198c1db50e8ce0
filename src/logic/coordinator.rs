use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Result, SyncError};
use crate::logic::correlation::CorrelationService;
use crate::logic::lifecycle::InstanceService;
use crate::logic::propagation::{CancellationRegistry, PropagationJob, PropagationQueue};
use crate::model::{
    fingerprint, CallContext, ChangeOrigin, CorrelationProperties, Id, IncomingChange, Instance, KeyPattern,
    MetadataCorrelation, NewInstance, PropertyChanges, SyncDisposition, SyncOutcome, SynchronizationDirection,
};
use crate::store::traits::Store;

/// Applies at most this many update attempts per change
const MAX_APPLY_ATTEMPTS: u32 = 2;

/// Defaults used when an external change arrives without a correlation template
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub default_direction: SynchronizationDirection,
    pub default_key_pattern: KeyPattern,
    /// Upper bound on any single connector call
    pub connector_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_direction: SynchronizationDirection::BothDirections,
            default_key_pattern: KeyPattern::LocalKey,
            connector_timeout: Duration::from_secs(30),
        }
    }
}

/// Last version seen for a guid; the entry lapses once the guid is purged
struct Observed {
    version: u64,
    purged: watch::Receiver<bool>,
}

/// Decides, for each incoming change, whether and how it is applied to the
/// local instance and where it is propagated afterwards
pub struct SynchronizationCoordinator<S: Store + 'static> {
    instances: InstanceService<S>,
    correlations: CorrelationService<S>,
    propagation: Arc<PropagationQueue<S>>,
    settings: CoordinatorSettings,
    cancellations: CancellationRegistry,
    /// Last version this coordinator committed or read, per guid
    observed: Mutex<HashMap<Id, Observed>>,
}

impl<S: Store + 'static> SynchronizationCoordinator<S> {
    pub fn new(
        instances: InstanceService<S>,
        correlations: CorrelationService<S>,
        propagation: Arc<PropagationQueue<S>>,
        settings: CoordinatorSettings,
        cancellations: CancellationRegistry,
    ) -> Self {
        Self {
            instances,
            correlations,
            propagation,
            settings,
            cancellations,
            observed: Mutex::new(HashMap::new()),
        }
    }

    pub fn propagation(&self) -> &PropagationQueue<S> {
        &self.propagation
    }

    pub fn observed_version(&self, guid: &Id) -> Option<u64> {
        self.observed
            .lock()
            .get(guid)
            .filter(|seen| !*seen.purged.borrow())
            .map(|seen| seen.version)
    }

    /// Drop the remembered version so the next apply starts from the store
    pub fn forget(&self, guid: &Id) {
        if self.observed.lock().remove(guid).is_some() {
            self.cancellations.release(guid);
        }
    }

    pub async fn submit(&self, ctx: &CallContext, change: IncomingChange) -> Result<SyncOutcome> {
        match change.origin.clone() {
            ChangeOrigin::Internal { guid } => self.apply(ctx, &guid, &change.changes, None).await,
            ChangeOrigin::External {
                external_system_id: system,
                external_identifier: identifier,
            } => match self.correlations.find(&system, &identifier).await? {
                None => self.create_from_external(ctx, &system, &identifier, change).await,
                Some(correlation) => self.apply_correlated(ctx, correlation, &change.changes).await,
            },
        }
    }

    /// External change for an element that is already correlated
    async fn apply_correlated(
        &self,
        ctx: &CallContext,
        correlation: MetadataCorrelation,
        changes: &PropertyChanges,
    ) -> Result<SyncOutcome> {
        let direction = correlation.direction();
        if !direction.accepts_inbound() {
            let reason = format!(
                "{}/{} is correlated {:?}, inbound changes are not accepted",
                correlation.external_system_id, correlation.external_identifier, direction
            );
            log::info!("Ignoring change for {}: {}", correlation.guid, reason);
            let current = self.instances.get(&correlation.guid).await?;
            self.remember(&current);
            return Ok(SyncOutcome {
                guid: current.guid,
                version: current.version,
                disposition: SyncDisposition::Ignored(reason),
                propagations_queued: 0,
            });
        }
        self.apply(ctx, &correlation.guid, changes, Some(&correlation.external_system_id))
            .await
    }

    /// First sighting of an external element: create and correlate it
    async fn create_from_external(
        &self,
        ctx: &CallContext,
        system: &str,
        identifier: &str,
        change: IncomingChange,
    ) -> Result<SyncOutcome> {
        let template = change.correlation.unwrap_or_else(|| {
            CorrelationProperties::new(self.settings.default_key_pattern, self.settings.default_direction)
        });
        if !template.synchronization_direction.accepts_inbound() {
            let reason = format!(
                "new element {}/{} would be correlated {:?}, inbound changes are not accepted",
                system, identifier, template.synchronization_direction
            );
            log::info!("Ignoring change: {}", reason);
            return Ok(SyncOutcome {
                guid: String::new(),
                version: 0,
                disposition: SyncDisposition::Ignored(reason),
                propagations_queued: 0,
            });
        }

        let type_name = change.type_name.ok_or_else(|| SyncError::InvalidType {
            type_name: String::new(),
            reason: format!("{}/{} is not correlated and the change names no type", system, identifier),
        })?;
        let properties = change.changes.apply_to(&Default::default());
        let created = self
            .instances
            .create(ctx, NewInstance::new(type_name, properties))
            .await?;

        if let Err(e) = self
            .correlations
            .establish(ctx, &created.guid, system, identifier, template)
            .await
        {
            log::warn!("Correlating {} with {}/{} failed: {}", created.guid, system, identifier, e);
            if let Err(cleanup) = self.instances.purge(ctx, &created.guid, created.version).await {
                log::warn!("Could not remove orphan {}: {}", created.guid, cleanup);
            }
            // A concurrent delivery of the same element won the key
            if matches!(e, SyncError::DuplicateKey { .. }) {
                if let Some(winner) = self.correlations.find(system, identifier).await? {
                    log::info!("{}/{} was created concurrently as {}", system, identifier, winner.guid);
                    return self.apply_correlated(ctx, winner, &change.changes).await;
                }
            }
            return Err(e);
        }

        log::info!("Created {} {} from {}/{}", created.type_name, created.guid, system, identifier);
        self.remember(&created);
        Ok(SyncOutcome {
            guid: created.guid,
            version: created.version,
            disposition: SyncDisposition::Created,
            propagations_queued: 0,
        })
    }

    async fn apply(
        &self,
        ctx: &CallContext,
        guid: &Id,
        changes: &PropertyChanges,
        origin_system: Option<&str>,
    ) -> Result<SyncOutcome> {
        // Re-deliveries of an already applied change must not bump the version
        let current = self.instances.get(guid).await?;
        if changes.is_reflected_in(&current.properties) {
            self.remember(&current);
            return Ok(self.unchanged(current));
        }

        let mut expected = self.observed_version(guid).unwrap_or(current.version);
        let mut attempt = 0;
        let committed = loop {
            attempt += 1;
            match self.instances.update(ctx, guid, expected, changes).await {
                Ok(instance) => break instance,
                Err(SyncError::VersionConflict { actual, .. }) if attempt < MAX_APPLY_ATTEMPTS => {
                    log::debug!("Version conflict on {} (had v{}, store v{}), re-applying", guid, expected, actual);
                    let refreshed = self.instances.get(guid).await?;
                    self.remember(&refreshed);
                    if changes.is_reflected_in(&refreshed.properties) {
                        return Ok(self.unchanged(refreshed));
                    }
                    expected = refreshed.version;
                }
                Err(SyncError::VersionConflict { .. }) => {
                    log::warn!("Giving up on {} after {} conflicting attempts", guid, attempt);
                    self.forget(guid);
                    return Err(SyncError::SynchronizationConflict {
                        guid: guid.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        };

        self.remember(&committed);
        let queued = self.propagate(ctx, &committed, origin_system).await?;
        Ok(SyncOutcome {
            guid: committed.guid,
            version: committed.version,
            disposition: SyncDisposition::Applied,
            propagations_queued: queued,
        })
    }

    /// Queue delivery to every outbound correlation except the originating system
    async fn propagate(&self, ctx: &CallContext, instance: &Instance, origin_system: Option<&str>) -> Result<usize> {
        let print = fingerprint(&instance.properties);
        let timeout = ctx.timeout.min(self.settings.connector_timeout);
        let mut queued = 0;
        for correlation in self.correlations.list_for_instance(&instance.guid).await? {
            if !correlation.direction().propagates_outbound()
                || Some(correlation.external_system_id.as_str()) == origin_system
                || !correlation.is_stale(instance.version)
                || correlation.last_synchronized_fingerprint.as_deref() == Some(print.as_str())
            {
                continue;
            }
            let job = PropagationJob {
                guid: instance.guid.clone(),
                version: instance.version,
                external_system_id: correlation.external_system_id,
                external_identifier: correlation.external_identifier,
                properties: instance.properties.clone(),
                fingerprint: print.clone(),
                timeout,
            };
            if self.propagation.enqueue(job) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn unchanged(&self, current: Instance) -> SyncOutcome {
        log::debug!("Change already reflected in {} v{}", current.guid, current.version);
        SyncOutcome {
            guid: current.guid,
            version: current.version,
            disposition: SyncDisposition::Unchanged,
            propagations_queued: 0,
        }
    }

    fn remember(&self, instance: &Instance) {
        let mut observed = self.observed.lock();
        observed.retain(|_, seen| !*seen.purged.borrow());
        match observed.get_mut(&instance.guid) {
            Some(seen) => seen.version = instance.version,
            None => {
                let purged = self.cancellations.subscribe(&instance.guid);
                observed.insert(
                    instance.guid.clone(),
                    Observed {
                        version: instance.version,
                        purged,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::Engine;
    use crate::error::ErrorKind;
    use crate::events::RecordingEventSink;
    use crate::logic::ConnectorRegistry;
    use crate::model::{DataType, FindRequest, TypeDef, TypeRegistry, TypedValue};
    use crate::store::{CorrelationStore, InstanceStore, MemoryStore};
    use chrono::{DateTime, Utc};

    /// Memory store that can be told to lose every commit race, or to hold
    /// correlation lookups long enough for concurrent callers to interleave
    #[derive(Default)]
    struct ScriptedStore {
        inner: MemoryStore,
        contended: bool,
        lookup_delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl InstanceStore for ScriptedStore {
        async fn insert_instance(&self, instance: Instance) -> Result<()> {
            self.inner.insert_instance(instance).await
        }
        async fn get_instance(&self, guid: &Id) -> Result<Option<Instance>> {
            self.inner.get_instance(guid).await
        }
        async fn get_instance_as_of(&self, guid: &Id, as_of: DateTime<Utc>) -> Result<Option<Instance>> {
            self.inner.get_instance_as_of(guid, as_of).await
        }
        async fn commit_instance(&self, instance: Instance, expected_version: u64) -> Result<()> {
            if !self.contended {
                return self.inner.commit_instance(instance, expected_version).await;
            }
            Err(SyncError::VersionConflict {
                guid: instance.guid,
                expected: expected_version,
                actual: expected_version + 1,
            })
        }
        async fn purge_instance(&self, guid: &Id, expected_version: u64) -> Result<Instance> {
            self.inner.purge_instance(guid, expected_version).await
        }
        async fn list_instances(
            &self,
            type_names: Option<&[String]>,
            as_of: Option<DateTime<Utc>>,
        ) -> Result<Vec<Instance>> {
            self.inner.list_instances(type_names, as_of).await
        }
        async fn list_relationships(&self, guid: &Id, as_of: Option<DateTime<Utc>>) -> Result<Vec<Instance>> {
            self.inner.list_relationships(guid, as_of).await
        }
    }

    #[async_trait::async_trait]
    impl CorrelationStore for ScriptedStore {
        async fn insert_correlation(&self, correlation: MetadataCorrelation) -> Result<MetadataCorrelation> {
            self.inner.insert_correlation(correlation).await
        }
        async fn find_open_correlation(&self, system: &str, identifier: &str) -> Result<Option<MetadataCorrelation>> {
            let found = self.inner.find_open_correlation(system, identifier).await?;
            if let Some(delay) = self.lookup_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(found)
        }
        async fn list_correlations_for_guid(&self, guid: &Id) -> Result<Vec<MetadataCorrelation>> {
            self.inner.list_correlations_for_guid(guid).await
        }
        async fn correlation_history(&self, system: &str, identifier: &str) -> Result<Vec<MetadataCorrelation>> {
            self.inner.correlation_history(system, identifier).await
        }
        async fn update_correlation_properties(
            &self,
            correlation_id: &Id,
            properties: CorrelationProperties,
        ) -> Result<MetadataCorrelation> {
            self.inner.update_correlation_properties(correlation_id, properties).await
        }
        async fn mark_correlation_synchronized(
            &self,
            correlation_id: &Id,
            version: u64,
            synchronized_at: DateTime<Utc>,
            fingerprint: &str,
        ) -> Result<bool> {
            self.inner
                .mark_correlation_synchronized(correlation_id, version, synchronized_at, fingerprint)
                .await
        }
        async fn supersede_correlation(
            &self,
            old_correlation_id: &Id,
            closed_at: DateTime<Utc>,
            replacement: MetadataCorrelation,
        ) -> Result<MetadataCorrelation> {
            self.inner
                .supersede_correlation(old_correlation_id, closed_at, replacement)
                .await
        }
        async fn delete_correlation(&self, correlation_id: &Id) -> Result<bool> {
            self.inner.delete_correlation(correlation_id).await
        }
    }

    fn registry() -> TypeRegistry {
        TypeRegistry::new().with(
            TypeDef::entity("Glossary")
                .with_property("displayName", DataType::String, true)
                .with_property("description", DataType::String, false),
        )
    }

    fn engine<S: Store + 'static>(store: S) -> Engine<S> {
        Engine::new(
            Arc::new(store),
            registry(),
            Arc::new(RecordingEventSink::new()),
            ConnectorRegistry::new(),
            &SyncConfig::default(),
        )
    }

    fn rename(name: &str) -> PropertyChanges {
        PropertyChanges::default().set("displayName", TypedValue::string(name))
    }

    #[tokio::test]
    async fn test_stale_observed_version_is_retried_once() {
        let engine = engine(MemoryStore::new());
        let ctx = CallContext::new("alice");

        let created = engine
            .coordinator
            .submit(&ctx, IncomingChange::new(ChangeOrigin::external("S1", "ext-1"), rename("Sales")).creating("Glossary"))
            .await
            .unwrap();
        assert_eq!(created.disposition, SyncDisposition::Created);
        assert_eq!(engine.coordinator.observed_version(&created.guid), Some(1));

        // Someone else moves the instance on behind the coordinator's back
        let description = PropertyChanges::default().set("description", TypedValue::string("EMEA"));
        engine.instances.update(&ctx, &created.guid, 1, &description).await.unwrap();

        let outcome = engine
            .coordinator
            .submit(&ctx, IncomingChange::new(ChangeOrigin::internal(created.guid.clone()), rename("Sales EMEA")))
            .await
            .unwrap();
        assert_eq!(outcome.disposition, SyncDisposition::Applied);
        assert_eq!(outcome.version, 3);

        let current = engine.instances.get(&created.guid).await.unwrap();
        assert_eq!(current.property("description"), Some(&TypedValue::string("EMEA")));
        assert_eq!(current.property("displayName"), Some(&TypedValue::string("Sales EMEA")));
    }

    #[tokio::test]
    async fn test_second_conflict_surfaces_synchronization_conflict() {
        let engine = engine(ScriptedStore {
            contended: true,
            ..ScriptedStore::default()
        });
        let ctx = CallContext::new("alice");
        let created = engine
            .instances
            .create(&ctx, NewInstance::new("Glossary", rename("Sales").apply_to(&Default::default())))
            .await
            .unwrap();

        let err = engine
            .coordinator
            .submit(&ctx, IncomingChange::new(ChangeOrigin::internal(created.guid.clone()), rename("Other")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SynchronizationConflict);
        assert_eq!(engine.instances.get(&created.guid).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_unchanged() {
        let engine = engine(MemoryStore::new());
        let ctx = CallContext::new("alice");
        let change = IncomingChange::new(ChangeOrigin::external("S1", "ext-1"), rename("Sales")).creating("Glossary");

        let first = engine.coordinator.submit(&ctx, change.clone()).await.unwrap();
        let again = engine.coordinator.submit(&ctx, change).await.unwrap();
        assert_eq!(again.disposition, SyncDisposition::Unchanged);
        assert_eq!(again.guid, first.guid);
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_uncorrelated_change_without_type_is_rejected() {
        let engine = engine(MemoryStore::new());
        let err = engine
            .coordinator
            .submit(
                &CallContext::new("alice"),
                IncomingChange::new(ChangeOrigin::external("S1", "ext-1"), rename("Sales")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidType);
    }

    #[tokio::test]
    async fn test_concurrent_first_deliveries_share_one_instance() {
        let engine = engine(ScriptedStore {
            lookup_delay: Some(Duration::from_millis(20)),
            ..ScriptedStore::default()
        });
        let ctx = CallContext::new("alice");
        let change = IncomingChange::new(ChangeOrigin::external("S1", "ext-1"), rename("Sales")).creating("Glossary");

        let (first, second) = tokio::join!(
            engine.coordinator.submit(&ctx, change.clone()),
            engine.coordinator.submit(&ctx, change)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.guid, second.guid);
        let dispositions = [first.disposition, second.disposition];
        assert!(dispositions.contains(&SyncDisposition::Created));
        assert!(dispositions.contains(&SyncDisposition::Unchanged));
        assert_eq!(engine.correlations.resolve("S1", "ext-1").await.unwrap(), first.guid);

        let glossaries = engine.queries.find(&FindRequest::for_type("Glossary")).await.unwrap();
        assert_eq!(glossaries.total, 1);
    }

    #[tokio::test]
    async fn test_purged_guids_are_not_remembered() {
        let engine = engine(MemoryStore::new());
        let ctx = CallContext::new("alice");
        let created = engine
            .coordinator
            .submit(&ctx, IncomingChange::new(ChangeOrigin::external("S1", "ext-1"), rename("Sales")).creating("Glossary"))
            .await
            .unwrap();
        assert_eq!(engine.coordinator.observed_version(&created.guid), Some(1));

        engine.instances.purge(&ctx, &created.guid, 1).await.unwrap();
        assert_eq!(engine.coordinator.observed_version(&created.guid), None);

        engine
            .coordinator
            .submit(&ctx, IncomingChange::new(ChangeOrigin::external("S1", "ext-2"), rename("Other")).creating("Glossary"))
            .await
            .unwrap();
        let observed = engine.coordinator.observed.lock();
        assert_eq!(observed.len(), 1);
        assert!(!observed.contains_key(&created.guid));
    }
}
