use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{Result, SyncError};
use crate::model::{CorrelationProperties, Id, Instance, MetadataCorrelation};
use crate::store::traits::{CorrelationStore, InstanceStore};

/// Every committed version of one instance, oldest first; the last entry is current
#[derive(Debug, Clone)]
struct InstanceRecord {
    history: Vec<Instance>,
}

impl InstanceRecord {
    fn current(&self) -> &Instance {
        // A record is never created without its first version
        &self.history[self.history.len() - 1]
    }

    fn as_of(&self, as_of: DateTime<Utc>) -> Option<&Instance> {
        self.history.iter().rev().find(|i| i.update_time <= as_of)
    }
}

#[derive(Debug, Default)]
struct Inner {
    instances: HashMap<Id, InstanceRecord>,
    correlations: HashMap<Id, MetadataCorrelation>,
    /// (external system, external identifier) -> open correlation id
    open_by_key: HashMap<(String, String), Id>,
    next_sequence: u64,
}

impl Inner {
    fn snapshot(&self, guid: &Id, as_of: Option<DateTime<Utc>>) -> Option<&Instance> {
        let record = self.instances.get(guid)?;
        match as_of {
            Some(time) => record.as_of(time),
            None => Some(record.current()),
        }
    }

    fn check_version(&self, guid: &Id, expected_version: u64) -> Result<&InstanceRecord> {
        let record = self
            .instances
            .get(guid)
            .ok_or_else(|| SyncError::not_found("instance", guid.clone()))?;
        let actual = record.current().version;
        if actual != expected_version {
            return Err(SyncError::VersionConflict {
                guid: guid.clone(),
                expected: expected_version,
                actual,
            });
        }
        Ok(record)
    }

    /// First clash for a new open correlation: the key held by another open
    /// correlation, or the guid already correlated in the same system.
    /// `closing` is left out of both checks.
    fn open_clash(&self, candidate: &MetadataCorrelation, closing: Option<&Id>) -> Option<SyncError> {
        let key = (
            candidate.external_system_id.clone(),
            candidate.external_identifier.clone(),
        );
        if let Some(existing) = self
            .open_by_key
            .get(&key)
            .filter(|id| Some(*id) != closing)
            .and_then(|id| self.correlations.get(id))
        {
            return Some(SyncError::DuplicateKey {
                external_system_id: key.0,
                external_identifier: key.1,
                existing_guid: existing.guid.clone(),
            });
        }
        self.correlations
            .values()
            .find(|c| {
                c.is_open()
                    && Some(&c.correlation_id) != closing
                    && c.guid == candidate.guid
                    && c.external_system_id == candidate.external_system_id
            })
            .map(|c| SyncError::DuplicateKey {
                external_system_id: c.external_system_id.clone(),
                external_identifier: c.external_identifier.clone(),
                existing_guid: c.guid.clone(),
            })
    }

    fn open_correlation_mut(&mut self, correlation_id: &Id) -> Result<&mut MetadataCorrelation> {
        self.correlations
            .get_mut(correlation_id)
            .filter(|c| c.is_open())
            .ok_or_else(|| SyncError::not_found("open correlation", correlation_id.clone()))
    }

    fn sorted(mut correlations: Vec<MetadataCorrelation>) -> Vec<MetadataCorrelation> {
        correlations.sort_by_key(|c| c.sequence);
        correlations
    }
}

/// In-process store retaining the full version history of every instance.
/// A single lock makes each write (including purge with its correlations)
/// atomic; it is only held for the duration of the compare-and-swap.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.read().instances.len()
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: Instance) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.instances.contains_key(&instance.guid) {
            return Err(anyhow!("instance {} already exists", instance.guid).into());
        }
        inner.instances.insert(
            instance.guid.clone(),
            InstanceRecord {
                history: vec![instance],
            },
        );
        Ok(())
    }

    async fn get_instance(&self, guid: &Id) -> Result<Option<Instance>> {
        Ok(self.inner.read().snapshot(guid, None).cloned())
    }

    async fn get_instance_as_of(&self, guid: &Id, as_of: DateTime<Utc>) -> Result<Option<Instance>> {
        Ok(self.inner.read().snapshot(guid, Some(as_of)).cloned())
    }

    async fn commit_instance(&self, instance: Instance, expected_version: u64) -> Result<()> {
        if instance.version != expected_version + 1 {
            return Err(anyhow!(
                "commit of {} must carry version {}, got {}",
                instance.guid,
                expected_version + 1,
                instance.version
            )
            .into());
        }
        let mut inner = self.inner.write();
        inner.check_version(&instance.guid, expected_version)?;
        if let Some(record) = inner.instances.get_mut(&instance.guid) {
            record.history.push(instance);
        }
        Ok(())
    }

    async fn purge_instance(&self, guid: &Id, expected_version: u64) -> Result<Instance> {
        let mut inner = self.inner.write();
        inner.check_version(guid, expected_version)?;
        let record = inner
            .instances
            .remove(guid)
            .ok_or_else(|| SyncError::not_found("instance", guid.clone()))?;

        let doomed: Vec<Id> = inner
            .correlations
            .values()
            .filter(|c| &c.guid == guid)
            .map(|c| c.correlation_id.clone())
            .collect();
        for id in doomed {
            if let Some(c) = inner.correlations.remove(&id) {
                let key = (c.external_system_id, c.external_identifier);
                if inner.open_by_key.get(&key) == Some(&id) {
                    inner.open_by_key.remove(&key);
                }
            }
        }
        Ok(record.current().clone())
    }

    async fn list_instances(
        &self,
        type_names: Option<&[String]>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Instance>> {
        let inner = self.inner.read();
        Ok(inner
            .instances
            .keys()
            .filter_map(|guid| inner.snapshot(guid, as_of))
            .filter(|i| type_names.map_or(true, |names| names.contains(&i.type_name)))
            .cloned()
            .collect())
    }

    async fn list_relationships(&self, guid: &Id, as_of: Option<DateTime<Utc>>) -> Result<Vec<Instance>> {
        let inner = self.inner.read();
        Ok(inner
            .instances
            .keys()
            .filter_map(|id| inner.snapshot(id, as_of))
            .filter(|i| i.kind.touches(guid))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl CorrelationStore for MemoryStore {
    async fn insert_correlation(&self, mut correlation: MetadataCorrelation) -> Result<MetadataCorrelation> {
        let mut inner = self.inner.write();
        if let Some(clash) = inner.open_clash(&correlation, None) {
            return Err(clash);
        }
        let key = (
            correlation.external_system_id.clone(),
            correlation.external_identifier.clone(),
        );
        inner.next_sequence += 1;
        correlation.sequence = inner.next_sequence;
        correlation.valid_to = None;
        inner
            .open_by_key
            .insert(key, correlation.correlation_id.clone());
        inner
            .correlations
            .insert(correlation.correlation_id.clone(), correlation.clone());
        Ok(correlation)
    }

    async fn find_open_correlation(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Option<MetadataCorrelation>> {
        let inner = self.inner.read();
        let key = (external_system_id.to_string(), external_identifier.to_string());
        Ok(inner
            .open_by_key
            .get(&key)
            .and_then(|id| inner.correlations.get(id))
            .cloned())
    }

    async fn list_correlations_for_guid(&self, guid: &Id) -> Result<Vec<MetadataCorrelation>> {
        let inner = self.inner.read();
        Ok(Inner::sorted(
            inner
                .correlations
                .values()
                .filter(|c| &c.guid == guid && c.is_open())
                .cloned()
                .collect(),
        ))
    }

    async fn correlation_history(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Vec<MetadataCorrelation>> {
        let inner = self.inner.read();
        Ok(Inner::sorted(
            inner
                .correlations
                .values()
                .filter(|c| {
                    c.external_system_id == external_system_id
                        && c.external_identifier == external_identifier
                })
                .cloned()
                .collect(),
        ))
    }

    async fn update_correlation_properties(
        &self,
        correlation_id: &Id,
        properties: CorrelationProperties,
    ) -> Result<MetadataCorrelation> {
        let mut inner = self.inner.write();
        let correlation = inner.open_correlation_mut(correlation_id)?;
        correlation.properties = properties;
        Ok(correlation.clone())
    }

    async fn mark_correlation_synchronized(
        &self,
        correlation_id: &Id,
        version: u64,
        synchronized_at: DateTime<Utc>,
        fingerprint: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Ok(correlation) = inner.open_correlation_mut(correlation_id) else {
            return Ok(false);
        };
        if !correlation.is_stale(version) {
            return Ok(false);
        }
        correlation.last_synchronized_version = Some(version);
        correlation.last_synchronized_time = Some(synchronized_at);
        correlation.last_synchronized_fingerprint = Some(fingerprint.to_string());
        Ok(true)
    }

    async fn supersede_correlation(
        &self,
        old_correlation_id: &Id,
        closed_at: DateTime<Utc>,
        mut replacement: MetadataCorrelation,
    ) -> Result<MetadataCorrelation> {
        let mut inner = self.inner.write();
        let old = inner.open_correlation_mut(old_correlation_id)?;
        replacement.external_system_id = old.external_system_id.clone();
        replacement.external_identifier = old.external_identifier.clone();
        if let Some(clash) = inner.open_clash(&replacement, Some(old_correlation_id)) {
            return Err(clash);
        }

        let old = inner.open_correlation_mut(old_correlation_id)?;
        old.valid_to = Some(closed_at);
        old.superseded_by = Some(replacement.correlation_id.clone());
        let key = (old.external_system_id.clone(), old.external_identifier.clone());

        inner.next_sequence += 1;
        replacement.sequence = inner.next_sequence;
        replacement.valid_from = closed_at;
        replacement.valid_to = None;
        inner
            .open_by_key
            .insert(key, replacement.correlation_id.clone());
        inner
            .correlations
            .insert(replacement.correlation_id.clone(), replacement.clone());
        Ok(replacement)
    }

    async fn delete_correlation(&self, correlation_id: &Id) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.correlations.remove(correlation_id) {
            Some(c) => {
                let key = (c.external_system_id, c.external_identifier);
                if inner.open_by_key.get(&key) == Some(correlation_id) {
                    inner.open_by_key.remove(&key);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CorrelationProperties, InstanceKind, InstanceStatus, KeyPattern, PropertyBag,
        SynchronizationDirection, TypedValue,
    };

    fn instance(guid: &str) -> Instance {
        let now = Utc::now();
        Instance {
            guid: guid.to_string(),
            kind: InstanceKind::Entity,
            type_name: "Glossary".to_string(),
            properties: PropertyBag::new(),
            status: InstanceStatus::Active,
            status_on_delete: None,
            version: 1,
            created_by: "test".to_string(),
            create_time: now,
            updated_by: "test".to_string(),
            update_time: now,
        }
    }

    fn correlation(guid: &str, ext: &str) -> MetadataCorrelation {
        MetadataCorrelation::new(
            guid.to_string(),
            "S1",
            ext,
            CorrelationProperties::new(KeyPattern::LocalKey, SynchronizationDirection::BothDirections),
            "test",
        )
    }

    #[tokio::test]
    async fn test_compare_and_swap_commit() {
        let store = MemoryStore::new();
        store.insert_instance(instance("g-1")).await.unwrap();

        let mut next = instance("g-1").next_version("alice");
        next.properties
            .insert("displayName".to_string(), TypedValue::string("v2"));
        store.commit_instance(next.clone(), 1).await.unwrap();

        // Stale writer loses
        let stale = instance("g-1").next_version("bob");
        match store.commit_instance(stale, 1).await {
            Err(SyncError::VersionConflict { expected, actual, .. }) => {
                assert_eq!((expected, actual), (1, 2));
            }
            other => panic!("expected version conflict, got {:?}", other),
        }

        let current = store.get_instance(&"g-1".to_string()).await.unwrap().unwrap();
        assert_eq!(current, next);
    }

    #[tokio::test]
    async fn test_history_as_of() {
        let store = MemoryStore::new();
        let first = instance("g-1");
        let t1 = first.update_time;
        store.insert_instance(first).await.unwrap();

        let mut second = instance("g-1").next_version("alice");
        second.update_time = t1 + chrono::Duration::seconds(10);
        store.commit_instance(second, 1).await.unwrap();

        let guid = "g-1".to_string();
        let at_t1 = store.get_instance_as_of(&guid, t1).await.unwrap().unwrap();
        assert_eq!(at_t1.version, 1);
        let later = store
            .get_instance_as_of(&guid, t1 + chrono::Duration::seconds(11))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.version, 2);
        let before = store
            .get_instance_as_of(&guid, t1 - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(before.is_none());
    }

    #[tokio::test]
    async fn test_open_key_uniqueness_and_purge_cascade() {
        let store = MemoryStore::new();
        store.insert_instance(instance("g-1")).await.unwrap();
        store.insert_correlation(correlation("g-1", "ext-1")).await.unwrap();

        let dup = store.insert_correlation(correlation("g-2", "ext-1")).await;
        assert!(matches!(dup, Err(SyncError::DuplicateKey { .. })));

        store.purge_instance(&"g-1".to_string(), 1).await.unwrap();
        assert!(store.find_open_correlation("S1", "ext-1").await.unwrap().is_none());
        assert!(store.correlation_history("S1", "ext-1").await.unwrap().is_empty());
        assert_eq!(store.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_supersede_closes_old_window() {
        let store = MemoryStore::new();
        let old = store.insert_correlation(correlation("g-1", "ext-9")).await.unwrap();
        let replacement = correlation("g-2", "ext-9");
        let now = Utc::now();
        let new = store
            .supersede_correlation(&old.correlation_id, now, replacement)
            .await
            .unwrap();

        let open = store.find_open_correlation("S1", "ext-9").await.unwrap().unwrap();
        assert_eq!(open.guid, "g-2");
        assert!(new.sequence > old.sequence);

        let history = store.correlation_history("S1", "ext-9").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(now));
        assert_eq!(history[0].superseded_by.as_ref(), Some(&new.correlation_id));
        assert!(store
            .list_correlations_for_guid(&"g-1".to_string())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_one_open_correlation_per_guid_and_system() {
        let store = MemoryStore::new();
        store.insert_correlation(correlation("g-1", "ext-1")).await.unwrap();

        let clash = store.insert_correlation(correlation("g-1", "ext-2")).await;
        match clash {
            Err(SyncError::DuplicateKey {
                external_identifier,
                existing_guid,
                ..
            }) => assert_eq!((external_identifier.as_str(), existing_guid.as_str()), ("ext-1", "g-1")),
            other => panic!("expected duplicate key, got {:?}", other),
        }

        // Moving a recycled key onto a guid already mapped in the system is refused too
        let other = store.insert_correlation(correlation("g-2", "ext-7")).await.unwrap();
        let refused = store
            .supersede_correlation(&other.correlation_id, Utc::now(), correlation("g-1", "ext-7"))
            .await;
        assert!(matches!(refused, Err(SyncError::DuplicateKey { .. })));
        let still_open = store.find_open_correlation("S1", "ext-7").await.unwrap().unwrap();
        assert_eq!(still_open.guid, "g-2");
        assert_eq!(store.list_correlations_for_guid(&"g-1".to_string()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_supersede_leaves_no_sequence_gap() {
        let store = MemoryStore::new();
        let first = store.insert_correlation(correlation("g-1", "ext-1")).await.unwrap();

        let missing = store
            .supersede_correlation(&"nope".to_string(), Utc::now(), correlation("g-2", "ext-1"))
            .await;
        assert!(matches!(missing, Err(SyncError::NotFound { .. })));

        let second = store.insert_correlation(correlation("g-2", "ext-2")).await.unwrap();
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[tokio::test]
    async fn test_sync_marks_and_properties_update_independently() {
        let store = MemoryStore::new();
        let stored = store.insert_correlation(correlation("g-1", "ext-1")).await.unwrap();
        let id = stored.correlation_id.clone();

        assert!(store.mark_correlation_synchronized(&id, 3, Utc::now(), "fp-3").await.unwrap());
        assert!(!store.mark_correlation_synchronized(&id, 2, Utc::now(), "fp-2").await.unwrap());

        let mut properties = stored.properties.clone();
        properties.external_identifier_name = Some("glossaryId".to_string());
        let updated = store.update_correlation_properties(&id, properties).await.unwrap();
        assert_eq!(updated.last_synchronized_version, Some(3));
        assert_eq!(updated.last_synchronized_fingerprint.as_deref(), Some("fp-3"));
        assert_eq!(updated.properties.external_identifier_name.as_deref(), Some("glossaryId"));
    }
}
