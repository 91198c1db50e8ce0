use crate::model::{Id, PropertyBag, TypedValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Deleted,
    Proposed,
    Draft,
    Unknown,
}

impl InstanceStatus {
    pub fn is_deleted(&self) -> bool {
        matches!(self, InstanceStatus::Deleted)
    }
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Active
    }
}

/// Entity or relationship; relationships carry the guids of both ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceKind {
    Entity,
    Relationship { end1: Id, end2: Id },
}

impl InstanceKind {
    pub fn is_relationship(&self) -> bool {
        matches!(self, InstanceKind::Relationship { .. })
    }

    pub fn touches(&self, guid: &Id) -> bool {
        match self {
            InstanceKind::Entity => false,
            InstanceKind::Relationship { end1, end2 } => end1 == guid || end2 == guid,
        }
    }
}

/// A versioned entity or relationship record. Treated as a value: every
/// accepted mutation produces a new `Instance` with `version + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub guid: Id,
    #[serde(flatten)]
    pub kind: InstanceKind,
    pub type_name: String,
    pub properties: PropertyBag,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_on_delete: Option<InstanceStatus>,
    pub version: u64,

    /// Audit fields for tracking who created/modified this instance
    pub created_by: String,
    pub create_time: DateTime<Utc>,
    pub updated_by: String,
    pub update_time: DateTime<Utc>,
}

impl Instance {
    pub fn is_relationship(&self) -> bool {
        self.kind.is_relationship()
    }

    pub fn property(&self, name: &str) -> Option<&TypedValue> {
        self.properties.get(name)
    }

    /// Copy of this instance as the next version, stamped with the actor
    pub fn next_version(&self, actor: &str) -> Instance {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_by = actor.to_string();
        next.update_time = Utc::now();
        next
    }
}

/// Instance input model for creation
/// The guid and version are set server-side upon creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstance {
    pub type_name: String,
    #[serde(default)]
    pub properties: PropertyBag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_status: Option<InstanceStatus>,
}

impl NewInstance {
    pub fn new(type_name: impl Into<String>, properties: PropertyBag) -> Self {
        Self {
            type_name: type_name.into(),
            properties,
            initial_status: None,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.initial_status = Some(status);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRelationship {
    pub type_name: String,
    pub end1: Id,
    pub end2: Id,
    #[serde(default)]
    pub properties: PropertyBag,
}

/// Property-level diff: values to set and property names to remove.
/// Applying the same diff twice yields the same bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyChanges {
    #[serde(default)]
    pub set: PropertyBag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl PropertyChanges {
    pub fn set(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.set.insert(name.into(), value);
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.remove.push(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn apply_to(&self, properties: &PropertyBag) -> PropertyBag {
        let mut merged = properties.clone();
        for name in &self.remove {
            merged.remove(name);
        }
        for (name, value) in &self.set {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// True when applying this diff would leave `properties` unchanged
    pub fn is_reflected_in(&self, properties: &PropertyBag) -> bool {
        self.remove.iter().all(|name| !properties.contains_key(name))
            && self
                .set
                .iter()
                .all(|(name, value)| properties.get(name) == Some(value))
    }
}
