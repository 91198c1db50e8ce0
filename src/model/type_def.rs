use crate::model::{DataType, InstanceStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Entity,
    Relationship,
}

fn default_valid_statuses() -> Vec<InstanceStatus> {
    vec![InstanceStatus::Active]
}

/// Represents a type definition that instances are validated against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Name of the type (e.g., "Glossary", "GlossaryTerm", "TermAnchor")
    pub name: String,

    pub kind: TypeKind,

    /// Parent type; properties are inherited and finds on the parent include this type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_type: Option<String>,

    #[serde(default)]
    pub properties: Vec<PropertyDef>,

    /// Statuses an instance of this type may hold outside of soft deletion
    #[serde(default = "default_valid_statuses")]
    pub valid_statuses: Vec<InstanceStatus>,

    /// Relationship types only: required type of each end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end1_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end2_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Default value used when a new instance omits this property
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl TypeDef {
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Entity,
            super_type: None,
            properties: Vec::new(),
            valid_statuses: default_valid_statuses(),
            end1_type: None,
            end2_type: None,
            description: None,
        }
    }

    pub fn relationship(
        name: impl Into<String>,
        end1_type: Option<&str>,
        end2_type: Option<&str>,
    ) -> Self {
        Self {
            kind: TypeKind::Relationship,
            end1_type: end1_type.map(str::to_string),
            end2_type: end2_type.map(str::to_string),
            ..Self::entity(name)
        }
    }

    pub fn with_super_type(mut self, super_type: &str) -> Self {
        self.super_type = Some(super_type.to_string());
        self
    }

    pub fn with_property(mut self, name: &str, data_type: DataType, required: bool) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            data_type,
            required: Some(required),
            value: None,
        });
        self
    }

    pub fn with_default(mut self, name: &str, data_type: DataType, value: serde_json::Value) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            data_type,
            required: Some(false),
            value: Some(value),
        });
        self
    }

    pub fn with_statuses(mut self, statuses: &[InstanceStatus]) -> Self {
        self.valid_statuses = statuses.to_vec();
        self
    }
}

/// Lookup table of type definitions, loaded separately from instances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeRegistry {
    types: HashMap<String, TypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_def: TypeDef) {
        self.types.insert(type_def.name.clone(), type_def);
    }

    pub fn with(mut self, type_def: TypeDef) -> Self {
        self.register(type_def);
        self
    }

    /// Load a registry from a JSON array of type definitions
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let defs: Vec<TypeDef> = serde_json::from_str(json)?;
        let mut registry = Self::new();
        for def in defs {
            registry.register(def);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The type followed by its ancestors, nearest first
    pub fn lineage(&self, name: &str) -> Vec<&TypeDef> {
        let mut chain = Vec::new();
        let mut current = self.types.get(name);
        while let Some(def) = current {
            // Guard against accidental cycles in loaded definitions
            if chain.iter().any(|d: &&TypeDef| d.name == def.name) {
                break;
            }
            chain.push(def);
            current = def.super_type.as_deref().and_then(|s| self.types.get(s));
        }
        chain
    }

    pub fn is_subtype_of(&self, name: &str, ancestor: &str) -> bool {
        self.lineage(name).iter().any(|d| d.name == ancestor)
    }

    /// `name` and every type descending from it, sorted by name
    pub fn subtypes_of(&self, name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .keys()
            .filter(|candidate| self.is_subtype_of(candidate, name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Own and inherited property definitions; a subtype definition shadows
    /// an inherited one with the same name
    pub fn effective_properties(&self, name: &str) -> Vec<&PropertyDef> {
        let mut props: Vec<&PropertyDef> = Vec::new();
        for def in self.lineage(name) {
            for prop in &def.properties {
                if !props.iter().any(|p| p.name == prop.name) {
                    props.push(prop);
                }
            }
        }
        props
    }
}
