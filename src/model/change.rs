use crate::model::{CorrelationProperties, Id, PropertyChanges};
use serde::{Deserialize, Serialize};

/// Where a candidate change came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ChangeOrigin {
    Internal {
        guid: Id,
    },
    External {
        external_system_id: String,
        external_identifier: String,
    },
}

impl ChangeOrigin {
    pub fn external(system_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        ChangeOrigin::External {
            external_system_id: system_id.into(),
            external_identifier: identifier.into(),
        }
    }

    pub fn internal(guid: impl Into<Id>) -> Self {
        ChangeOrigin::Internal { guid: guid.into() }
    }

    pub fn external_system(&self) -> Option<&str> {
        match self {
            ChangeOrigin::Internal { .. } => None,
            ChangeOrigin::External {
                external_system_id, ..
            } => Some(external_system_id),
        }
    }
}

/// A change presented to the synchronization coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingChange {
    #[serde(flatten)]
    pub origin: ChangeOrigin,
    /// Type to create when an external element is seen for the first time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub changes: PropertyChanges,
    /// Correlation to establish for a net-new external element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationProperties>,
}

impl IncomingChange {
    pub fn new(origin: ChangeOrigin, changes: PropertyChanges) -> Self {
        Self {
            origin,
            type_name: None,
            changes,
            correlation: None,
        }
    }

    pub fn creating(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_correlation(mut self, properties: CorrelationProperties) -> Self {
        self.correlation = Some(properties);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    StatusChanged,
    SoftDeleted,
    Restored,
    Purged,
    CorrelationEstablished,
    CorrelationUpdated,
    CorrelationSuperseded,
    CorrelationSevered,
}

/// Emitted after every committed mutation; delivery is at-least-once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub guid: Id,
    pub version: u64,
    pub change_kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_system_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "snake_case")]
pub enum SyncDisposition {
    /// Net-new element created and correlated
    Created,
    Applied,
    /// The change was already reflected; nothing committed
    Unchanged,
    /// Rejected by direction policy; nothing committed
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub guid: Id,
    pub version: u64,
    #[serde(flatten)]
    pub disposition: SyncDisposition,
    pub propagations_queued: usize,
}
