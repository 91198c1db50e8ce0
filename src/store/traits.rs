use crate::error::Result;
use crate::model::{CorrelationProperties, Id, Instance, MetadataCorrelation};
use chrono::{DateTime, Utc};

/// Versioned instance storage. Every write is a compare-and-swap on the
/// stored version of a single guid.
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a brand-new instance (version 1); fails if the guid exists
    async fn insert_instance(&self, instance: Instance) -> Result<()>;
    /// Current state of an instance
    async fn get_instance(&self, guid: &Id) -> Result<Option<Instance>>;
    /// State last committed at or before `as_of`
    async fn get_instance_as_of(&self, guid: &Id, as_of: DateTime<Utc>) -> Result<Option<Instance>>;
    /// Commit `instance` if the stored version equals `expected_version`.
    /// `instance.version` must be `expected_version + 1`.
    async fn commit_instance(&self, instance: Instance, expected_version: u64) -> Result<()>;
    /// Remove the instance, its history and every correlation referencing it
    async fn purge_instance(&self, guid: &Id, expected_version: u64) -> Result<Instance>;
    /// Instances, optionally restricted to type names, current or as of a time
    async fn list_instances(
        &self,
        type_names: Option<&[String]>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Instance>>;
    /// Relationships with `guid` at either end
    async fn list_relationships(&self, guid: &Id, as_of: Option<DateTime<Utc>>) -> Result<Vec<Instance>>;
}

/// Correlation storage keyed by (external system, external identifier)
/// with a secondary index by guid
#[async_trait::async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Insert an open correlation, assigning its sequence number.
    /// Fails with `DuplicateKey` if the key already has an open correlation,
    /// or the guid already has one in the same external system.
    async fn insert_correlation(&self, correlation: MetadataCorrelation) -> Result<MetadataCorrelation>;
    async fn find_open_correlation(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Option<MetadataCorrelation>>;
    /// Open correlations for a guid in insertion order
    async fn list_correlations_for_guid(&self, guid: &Id) -> Result<Vec<MetadataCorrelation>>;
    /// Every correlation ever recorded for a key, in insertion order
    async fn correlation_history(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Vec<MetadataCorrelation>>;
    /// Replace the properties of an open correlation; synchronization marks
    /// are left as stored
    async fn update_correlation_properties(
        &self,
        correlation_id: &Id,
        properties: CorrelationProperties,
    ) -> Result<MetadataCorrelation>;
    /// Record delivery of `version`. Applies only while the correlation is
    /// open and has seen neither `version` nor a later one.
    async fn mark_correlation_synchronized(
        &self,
        correlation_id: &Id,
        version: u64,
        synchronized_at: DateTime<Utc>,
        fingerprint: &str,
    ) -> Result<bool>;
    /// Atomically close `old_correlation_id` at `closed_at` and open
    /// `replacement`, under the same uniqueness rules as an insert
    async fn supersede_correlation(
        &self,
        old_correlation_id: &Id,
        closed_at: DateTime<Utc>,
        replacement: MetadataCorrelation,
    ) -> Result<MetadataCorrelation>;
    async fn delete_correlation(&self, correlation_id: &Id) -> Result<bool>;
}

pub trait Store: InstanceStore + CorrelationStore + Send + Sync {}
impl<T: InstanceStore + CorrelationStore + Send + Sync> Store for T {}
