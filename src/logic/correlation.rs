use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::events::EventSink;
use crate::model::{
    CallContext, ChangeKind, ChangeNotification, CorrelationProperties, Id, KeyPattern, MetadataCorrelation,
};
use crate::store::traits::Store;

/// What `establish` does when the key is held by a RECYCLED_KEY correlation
/// for a different guid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecycledKeyPolicy {
    /// Supersede the old correlation implicitly
    SupersedeOnEstablish,
    /// Fail with `DuplicateKey`; the caller must call `supersede`
    RequireExplicitSupersede,
}

impl Default for RecycledKeyPolicy {
    fn default() -> Self {
        RecycledKeyPolicy::SupersedeOnEstablish
    }
}

/// Maintains the mapping between local guids and external identifiers
pub struct CorrelationService<S: Store> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    policy: RecycledKeyPolicy,
}

impl<S: Store> Clone for CorrelationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            events: self.events.clone(),
            policy: self.policy,
        }
    }
}

impl<S: Store> CorrelationService<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn EventSink>, policy: RecycledKeyPolicy) -> Self {
        Self { store, events, policy }
    }

    pub fn policy(&self) -> RecycledKeyPolicy {
        self.policy
    }

    pub async fn establish(
        &self,
        ctx: &CallContext,
        guid: &Id,
        external_system_id: &str,
        external_identifier: &str,
        properties: CorrelationProperties,
    ) -> Result<MetadataCorrelation> {
        let version = self.instance_version(guid).await?;

        if let Some(existing) = self
            .store
            .find_open_correlation(external_system_id, external_identifier)
            .await?
        {
            if &existing.guid == guid {
                let refreshed = self
                    .store
                    .update_correlation_properties(&existing.correlation_id, properties.normalized())
                    .await?;
                self.emit(&refreshed, version, ChangeKind::CorrelationUpdated);
                return Ok(refreshed);
            }

            let recyclable = existing.key_pattern().is_recycled()
                && self.policy == RecycledKeyPolicy::SupersedeOnEstablish;
            if !recyclable {
                return Err(SyncError::DuplicateKey {
                    external_system_id: external_system_id.to_string(),
                    external_identifier: external_identifier.to_string(),
                    existing_guid: existing.guid,
                });
            }

            self.ensure_unmapped_in_system(guid, external_system_id).await?;
            log::info!(
                "Recycled key {}/{} moves from {} to {}",
                external_system_id,
                external_identifier,
                existing.guid,
                guid
            );
            let replacement =
                MetadataCorrelation::new(guid.clone(), external_system_id, external_identifier, properties, &ctx.user_id);
            return self.swap(existing, replacement, version).await;
        }

        self.ensure_unmapped_in_system(guid, external_system_id).await?;
        let correlation =
            MetadataCorrelation::new(guid.clone(), external_system_id, external_identifier, properties, &ctx.user_id);
        let inserted = self.store.insert_correlation(correlation).await?;
        log::debug!(
            "Correlated {} with {}/{} ({:?}, {:?})",
            guid,
            external_system_id,
            external_identifier,
            inserted.key_pattern(),
            inserted.direction()
        );
        self.emit(&inserted, version, ChangeKind::CorrelationEstablished);
        Ok(inserted)
    }

    pub async fn resolve(&self, external_system_id: &str, external_identifier: &str) -> Result<Id> {
        self.find(external_system_id, external_identifier)
            .await?
            .map(|c| c.guid)
            .ok_or_else(|| Self::missing_key(external_system_id, external_identifier))
    }

    /// Open correlation for a key, if any
    pub async fn find(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Option<MetadataCorrelation>> {
        self.store
            .find_open_correlation(external_system_id, external_identifier)
            .await
    }

    /// Close the open RECYCLED_KEY correlation for the key and open a new
    /// one pointing at `new_guid`, keeping the old record for audit
    pub async fn supersede(
        &self,
        ctx: &CallContext,
        external_system_id: &str,
        old_external_identifier: &str,
        new_guid: &Id,
        new_key_pattern: KeyPattern,
    ) -> Result<MetadataCorrelation> {
        let open = self
            .store
            .find_open_correlation(external_system_id, old_external_identifier)
            .await?
            .ok_or_else(|| Self::missing_key(external_system_id, old_external_identifier))?;
        if !open.key_pattern().is_recycled() {
            return Err(SyncError::invalid_state(
                &open.guid,
                format!(
                    "correlation {}/{} is {:?}, only recycled keys can be superseded",
                    external_system_id,
                    old_external_identifier,
                    open.key_pattern()
                ),
            ));
        }
        let version = self.instance_version(new_guid).await?;
        if new_guid != &open.guid {
            self.ensure_unmapped_in_system(new_guid, external_system_id).await?;
        }

        let mut properties = open.properties.clone();
        properties.key_pattern = new_key_pattern;
        let replacement = MetadataCorrelation::new(
            new_guid.clone(),
            external_system_id,
            old_external_identifier,
            properties,
            &ctx.user_id,
        );
        self.swap(open, replacement, version).await
    }

    /// Open correlations for an existing instance, in insertion order
    pub async fn list_for_instance(&self, guid: &Id) -> Result<Vec<MetadataCorrelation>> {
        self.instance_version(guid).await?;
        self.store.list_correlations_for_guid(guid).await
    }

    /// Remove the guid's correlation with one external system
    pub async fn sever(&self, ctx: &CallContext, guid: &Id, external_system_id: &str) -> Result<()> {
        let version = self.instance_version(guid).await?;
        let correlation = self.open_for(guid, external_system_id).await?;
        self.store.delete_correlation(&correlation.correlation_id).await?;
        log::info!(
            "Severed {} from {}/{} by {}",
            guid,
            external_system_id,
            correlation.external_identifier,
            ctx.user_id
        );
        self.emit(&correlation, version, ChangeKind::CorrelationSevered);
        Ok(())
    }

    /// Refresh the metadata of an open correlation; the key is immutable
    pub async fn update_metadata(
        &self,
        guid: &Id,
        external_system_id: &str,
        properties: CorrelationProperties,
    ) -> Result<MetadataCorrelation> {
        let version = self.instance_version(guid).await?;
        let open = self.open_for(guid, external_system_id).await?;
        let correlation = self
            .store
            .update_correlation_properties(&open.correlation_id, properties.normalized())
            .await?;
        self.emit(&correlation, version, ChangeKind::CorrelationUpdated);
        Ok(correlation)
    }

    /// Every correlation recorded for a key, closed ones included
    pub async fn history(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Vec<MetadataCorrelation>> {
        self.store
            .correlation_history(external_system_id, external_identifier)
            .await
    }

    /// Record a successful delivery of `version` to the external system.
    /// Returns false if the correlation moved on meanwhile.
    pub async fn mark_synchronized(
        &self,
        guid: &Id,
        external_system_id: &str,
        external_identifier: &str,
        version: u64,
        fingerprint: String,
    ) -> Result<bool> {
        let Some(correlation) = self
            .store
            .find_open_correlation(external_system_id, external_identifier)
            .await?
        else {
            return Ok(false);
        };
        if &correlation.guid != guid {
            return Ok(false);
        }
        self.store
            .mark_correlation_synchronized(&correlation.correlation_id, version, Utc::now(), &fingerprint)
            .await
    }

    async fn swap(
        &self,
        old: MetadataCorrelation,
        replacement: MetadataCorrelation,
        version: u64,
    ) -> Result<MetadataCorrelation> {
        let opened = self
            .store
            .supersede_correlation(&old.correlation_id, Utc::now(), replacement)
            .await?;
        self.emit(&old, version, ChangeKind::CorrelationSuperseded);
        self.emit(&opened, version, ChangeKind::CorrelationSuperseded);
        Ok(opened)
    }

    async fn instance_version(&self, guid: &Id) -> Result<u64> {
        self.store
            .get_instance(guid)
            .await?
            .map(|i| i.version)
            .ok_or_else(|| SyncError::not_found("instance", guid.clone()))
    }

    async fn open_for(&self, guid: &Id, external_system_id: &str) -> Result<MetadataCorrelation> {
        self.store
            .list_correlations_for_guid(guid)
            .await?
            .into_iter()
            .find(|c| c.external_system_id == external_system_id)
            .ok_or_else(|| SyncError::not_found("correlation", format!("{}@{}", guid, external_system_id)))
    }

    /// One open correlation per (guid, external system)
    async fn ensure_unmapped_in_system(&self, guid: &Id, external_system_id: &str) -> Result<()> {
        let clash = self
            .store
            .list_correlations_for_guid(guid)
            .await?
            .into_iter()
            .find(|c| c.external_system_id == external_system_id);
        match clash {
            Some(c) => Err(SyncError::DuplicateKey {
                external_system_id: c.external_system_id,
                external_identifier: c.external_identifier,
                existing_guid: c.guid,
            }),
            None => Ok(()),
        }
    }

    fn missing_key(external_system_id: &str, external_identifier: &str) -> SyncError {
        SyncError::not_found("correlation", format!("{}/{}", external_system_id, external_identifier))
    }

    fn emit(&self, correlation: &MetadataCorrelation, version: u64, change_kind: ChangeKind) {
        self.events.notify(ChangeNotification {
            guid: correlation.guid.clone(),
            version,
            change_kind,
            external_system_id: Some(correlation.external_system_id.clone()),
        });
    }
}
