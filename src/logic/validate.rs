use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::{DataType, InstanceStatus, PropertyBag, TypeDef, TypeKind, TypeRegistry, TypedValue};

/// Checks property bags and statuses against the type registry
pub struct TypeValidator<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> TypeValidator<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Resolve `type_name` and check it is of the expected kind
    pub fn resolve_type(&self, type_name: &str, kind: TypeKind) -> Result<&'a TypeDef> {
        let def = self.registry.get(type_name).ok_or_else(|| SyncError::InvalidType {
            type_name: type_name.to_string(),
            reason: "type is not defined".to_string(),
        })?;
        if def.kind != kind {
            return Err(SyncError::InvalidType {
                type_name: type_name.to_string(),
                reason: format!("expected a {:?} type, found {:?}", kind, def.kind),
            });
        }
        Ok(def)
    }

    /// Fill absent properties that carry a declared default
    pub fn apply_defaults(&self, type_name: &str, properties: &mut PropertyBag) {
        for prop in self.registry.effective_properties(type_name) {
            if properties.contains_key(&prop.name) {
                continue;
            }
            if let Some(default) = &prop.value {
                properties.insert(
                    prop.name.clone(),
                    TypedValue {
                        value: default.clone(),
                        data_type: prop.data_type.clone(),
                    },
                );
            }
        }
    }

    /// Validate a complete property bag: no undefined properties, every
    /// required property present, declared and carried types agree
    pub fn validate_properties(&self, type_name: &str, properties: &PropertyBag) -> Result<()> {
        let defs = self.registry.effective_properties(type_name);
        let mut problems = Vec::new();

        for name in properties.keys() {
            if !defs.iter().any(|d| &d.name == name) {
                problems.push(format!("property '{}' is not defined", name));
            }
        }

        for def in &defs {
            match properties.get(&def.name) {
                None if def.required.unwrap_or(false) => {
                    problems.push(format!("required property '{}' is missing", def.name));
                }
                None => {}
                Some(typed) => {
                    if typed.data_type != def.data_type {
                        problems.push(format!(
                            "property '{}' expected {:?}, found {:?}",
                            def.name, def.data_type, typed.data_type
                        ));
                    }
                    if let Err(msg) = check_value_consistency(&typed.value, &typed.data_type) {
                        problems.push(format!("property '{}': {}", def.name, msg));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::InvalidProperty {
                type_name: type_name.to_string(),
                problems,
            })
        }
    }

    /// Statuses other than DELETED must be listed by the type or an ancestor
    pub fn check_status(&self, type_name: &str, status: InstanceStatus) -> Result<()> {
        let supported = !status.is_deleted()
            && self
                .registry
                .lineage(type_name)
                .iter()
                .any(|def| def.valid_statuses.contains(&status));
        if supported {
            Ok(())
        } else {
            Err(SyncError::StatusNotSupported {
                type_name: type_name.to_string(),
                status,
            })
        }
    }
}

fn check_value_consistency(value: &Value, data_type: &DataType) -> std::result::Result<(), String> {
    let consistent = match data_type {
        DataType::String => value.is_string(),
        DataType::Number => value.is_number(),
        DataType::Boolean => value.is_boolean(),
        DataType::Object => value.is_object(),
        DataType::Array => value.is_array(),
        DataType::StringList => value
            .as_array()
            .map_or(false, |items| items.iter().all(Value::is_string)),
        DataType::Date => {
            return match value.as_str() {
                Some(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|_| ())
                    .map_err(|e| format!("'{}' is not an RFC 3339 timestamp: {}", s, e)),
                None => Err(format!("expected a timestamp string, found {}", value)),
            };
        }
    };
    if consistent {
        Ok(())
    } else {
        Err(format!("value {} is not a {:?}", value, data_type))
    }
}
