use crate::model::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SynchronizationDirection {
    /// Neither side propagates changes
    None,
    /// The external system is authoritative; its changes flow in
    FromThirdParty,
    /// The internal repository is authoritative; changes flow out
    ToThirdParty,
    BothDirections,
}

impl SynchronizationDirection {
    pub fn accepts_inbound(&self) -> bool {
        matches!(
            self,
            SynchronizationDirection::FromThirdParty | SynchronizationDirection::BothDirections
        )
    }

    pub fn propagates_outbound(&self) -> bool {
        matches!(
            self,
            SynchronizationDirection::ToThirdParty | SynchronizationDirection::BothDirections
        )
    }
}

impl Default for SynchronizationDirection {
    fn default() -> Self {
        SynchronizationDirection::BothDirections
    }
}

/// How durable an external identifier is expected to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyPattern {
    LocalKey,
    /// May be reused by the external system for a different element later
    RecycledKey,
    NaturalKey,
    MirrorKey,
    AggregateKey,
    CallersKey,
    StableKey,
    Other,
}

impl KeyPattern {
    pub fn is_recycled(&self) -> bool {
        matches!(self, KeyPattern::RecycledKey)
    }
}

impl Default for KeyPattern {
    fn default() -> Self {
        KeyPattern::LocalKey
    }
}

/// Caller-supplied description of an external identifier and how it is synchronized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_system_name: Option<String>,
    #[serde(default)]
    pub synchronization_direction: SynchronizationDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_identifier_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_identifier_usage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_identifier_source: Option<String>,
    #[serde(default)]
    pub key_pattern: KeyPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_properties: Option<BTreeMap<String, String>>,
}

impl CorrelationProperties {
    pub fn new(key_pattern: KeyPattern, direction: SynchronizationDirection) -> Self {
        Self {
            key_pattern,
            synchronization_direction: direction,
            ..Self::default()
        }
    }

    /// An empty mapping is treated the same as no mapping
    pub fn normalized(mut self) -> Self {
        if self
            .mapping_properties
            .as_ref()
            .map_or(false, |m| m.is_empty())
        {
            self.mapping_properties = None;
        }
        self
    }
}

/// Link between one internal guid and one identifier in one external system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCorrelation {
    pub correlation_id: Id,
    /// Insertion order across the whole store
    pub sequence: u64,
    pub guid: Id,
    pub external_system_id: String,
    pub external_identifier: String,
    #[serde(flatten)]
    pub properties: CorrelationProperties,

    pub valid_from: DateTime<Utc>,
    /// Absent while the correlation is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Id>,
    pub created_by: String,

    /// Last internal version delivered to the external system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronized_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronized_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synchronized_fingerprint: Option<String>,
}

impl MetadataCorrelation {
    pub fn new(
        guid: Id,
        external_system_id: impl Into<String>,
        external_identifier: impl Into<String>,
        properties: CorrelationProperties,
        actor: &str,
    ) -> Self {
        Self {
            correlation_id: crate::model::generate_id(),
            sequence: 0,
            guid,
            external_system_id: external_system_id.into(),
            external_identifier: external_identifier.into(),
            properties: properties.normalized(),
            valid_from: Utc::now(),
            valid_to: None,
            superseded_by: None,
            created_by: actor.to_string(),
            last_synchronized_version: None,
            last_synchronized_time: None,
            last_synchronized_fingerprint: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn direction(&self) -> SynchronizationDirection {
        self.properties.synchronization_direction
    }

    pub fn key_pattern(&self) -> KeyPattern {
        self.properties.key_pattern
    }

    /// True when the mirror has not yet seen `version`
    pub fn is_stale(&self, version: u64) -> bool {
        self.last_synchronized_version
            .map_or(true, |synced| synced < version)
    }
}
