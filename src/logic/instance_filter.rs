use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::Instance;

/// Structured filter expression that can be deserialized from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterExpr {
    /// Logical AND - all conditions must be true
    All { all: Vec<FilterExpr> },
    /// Logical OR - any condition must be true
    Any { any: Vec<FilterExpr> },
    Not { not: Box<FilterExpr> },
    Eq { eq: (JsonPath, Value) },
    Ne { ne: (JsonPath, Value) },
    Gt { gt: (JsonPath, Value) },
    Gte { gte: (JsonPath, Value) },
    Lt { lt: (JsonPath, Value) },
    Lte { lte: (JsonPath, Value) },
    In { r#in: (JsonPath, Vec<Value>) },
    NotIn { not_in: (JsonPath, Vec<Value>) },
    /// Substring match on string values
    Contains { contains: (JsonPath, String) },
    Exists { exists: JsonPath },
    NotExists { not_exists: JsonPath },
}

/// Path into an instance: `$.guid`, `$.type_name`, `$.status`, `$.version`
/// address header fields, anything else `$.<property>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPath(pub String);

impl JsonPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Extract value from instance using the path
    pub fn extract(&self, instance: &Instance) -> Result<Option<Value>> {
        let Some(name) = self.0.strip_prefix("$.") else {
            return Err(SyncError::InvalidProperty {
                type_name: instance.type_name.clone(),
                problems: vec![format!("invalid filter path '{}'", self.0)],
            });
        };

        let value = match name {
            "guid" => Some(Value::String(instance.guid.clone())),
            "type_name" => Some(Value::String(instance.type_name.clone())),
            "status" => serde_json::to_value(instance.status).ok(),
            "version" => Some(Value::from(instance.version)),
            _ => instance.properties.get(name).map(|v| v.value.clone()),
        };
        Ok(value)
    }
}

/// Instance filter evaluator
pub struct InstanceFilterEvaluator;

impl InstanceFilterEvaluator {
    pub fn evaluate_filter(instance: &Instance, filter: &FilterExpr) -> Result<bool> {
        match filter {
            FilterExpr::All { all } => {
                for expr in all {
                    if !Self::evaluate_filter(instance, expr)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            FilterExpr::Any { any } => {
                for expr in any {
                    if Self::evaluate_filter(instance, expr)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            FilterExpr::Not { not } => Ok(!Self::evaluate_filter(instance, not)?),

            FilterExpr::Eq { eq: (path, value) } => Ok(path.extract(instance)?.as_ref() == Some(value)),

            FilterExpr::Ne { ne: (path, value) } => Ok(path.extract(instance)?.as_ref() != Some(value)),

            FilterExpr::Gt { gt: (path, value) } => {
                Ok(Self::compare_values(path.extract(instance)?.as_ref(), value, |a, b| a > b))
            }

            FilterExpr::Gte { gte: (path, value) } => {
                Ok(Self::compare_values(path.extract(instance)?.as_ref(), value, |a, b| a >= b))
            }

            FilterExpr::Lt { lt: (path, value) } => {
                Ok(Self::compare_values(path.extract(instance)?.as_ref(), value, |a, b| a < b))
            }

            FilterExpr::Lte { lte: (path, value) } => {
                Ok(Self::compare_values(path.extract(instance)?.as_ref(), value, |a, b| a <= b))
            }

            FilterExpr::In { r#in: (path, values) } => match path.extract(instance)? {
                Some(val) => Ok(values.contains(&val)),
                None => Ok(false),
            },

            FilterExpr::NotIn { not_in: (path, values) } => match path.extract(instance)? {
                Some(val) => Ok(!values.contains(&val)),
                // A missing property is not in the list
                None => Ok(true),
            },

            FilterExpr::Contains { contains: (path, substring) } => match path.extract(instance)? {
                Some(Value::String(s)) => Ok(s.contains(substring.as_str())),
                Some(Value::Array(items)) => Ok(items
                    .iter()
                    .any(|item| item.as_str().map_or(false, |s| s.contains(substring.as_str())))),
                _ => Ok(false),
            },

            FilterExpr::Exists { exists: path } => Ok(path.extract(instance)?.is_some()),

            FilterExpr::NotExists { not_exists: path } => Ok(path.extract(instance)?.is_none()),
        }
    }

    /// Numbers compare numerically, strings numerically when both parse
    /// and lexicographically otherwise
    fn compare_values<F>(left: Option<&Value>, right: &Value, cmp: F) -> bool
    where
        F: Fn(std::cmp::Ordering, std::cmp::Ordering) -> bool,
    {
        use std::cmp::Ordering;

        let ordering = match (left, right) {
            (Some(Value::Number(l)), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
                (Some(lf), Some(rf)) => lf.partial_cmp(&rf),
                _ => None,
            },
            (Some(Value::String(l)), Value::String(r)) => match (l.parse::<f64>(), r.parse::<f64>()) {
                (Ok(lf), Ok(rf)) => lf.partial_cmp(&rf),
                _ => Some(l.as_str().cmp(r.as_str())),
            },
            (Some(Value::Number(l)), Value::String(r)) => match (l.as_f64(), r.parse::<f64>()) {
                (Some(lf), Ok(rf)) => lf.partial_cmp(&rf),
                _ => None,
            },
            (Some(Value::String(l)), Value::Number(r)) => match (l.parse::<f64>(), r.as_f64()) {
                (Ok(lf), Some(rf)) => lf.partial_cmp(&rf),
                _ => None,
            },
            _ => None,
        };

        ordering.map_or(false, |o| cmp(o, Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceKind, InstanceStatus, PropertyBag, TypedValue};

    fn filter_instances(instances: Vec<Instance>, filter: &FilterExpr) -> Vec<Instance> {
        instances
            .into_iter()
            .filter(|instance| InstanceFilterEvaluator::evaluate_filter(instance, filter).unwrap_or(false))
            .collect()
    }

    fn create_test_instance(guid: &str, type_name: &str, props: Vec<(&str, Value)>) -> Instance {
        let properties: PropertyBag = props
            .into_iter()
            .map(|(k, v)| (k.to_string(), TypedValue::infer(v)))
            .collect();
        let now = chrono::Utc::now();
        Instance {
            guid: guid.to_string(),
            kind: InstanceKind::Entity,
            type_name: type_name.to_string(),
            properties,
            status: InstanceStatus::Active,
            status_on_delete: None,
            version: 3,
            created_by: "test".to_string(),
            create_time: now,
            updated_by: "test".to_string(),
            update_time: now,
        }
    }

    #[test]
    fn test_eq_filter() {
        let instance = create_test_instance("g1", "GlossaryTerm", vec![("rank", serde_json::json!(150))]);
        let filter = FilterExpr::Eq {
            eq: (JsonPath::new("$.rank"), serde_json::json!(150)),
        };

        assert!(InstanceFilterEvaluator::evaluate_filter(&instance, &filter).unwrap());
        assert_eq!(filter_instances(vec![instance], &filter).len(), 1);
    }

    #[test]
    fn test_header_paths_and_complex_filter() {
        let instance = create_test_instance(
            "g1",
            "GlossaryTerm",
            vec![("rank", serde_json::json!(150)), ("displayName", serde_json::json!("Revenue"))],
        );

        let json = serde_json::json!({
            "all": [
                {"eq": ["$.type_name", "GlossaryTerm"]},
                {"eq": ["$.status", "ACTIVE"]},
                {"gte": ["$.version", 3]},
                {"gt": ["$.rank", 100]},
                {"in": ["$.displayName", ["Revenue", "Cost"]]},
                {"not": {"exists": "$.summary"}}
            ]
        });
        let filter: FilterExpr = serde_json::from_value(json).unwrap();

        assert!(InstanceFilterEvaluator::evaluate_filter(&instance, &filter).unwrap());
    }

    #[test]
    fn test_string_ordering_is_lexicographic() {
        let instance = create_test_instance("g1", "Glossary", vec![("displayName", serde_json::json!("beta"))]);
        let gt = FilterExpr::Gt {
            gt: (JsonPath::new("$.displayName"), serde_json::json!("alpha")),
        };
        let lt = FilterExpr::Lt {
            lt: (JsonPath::new("$.displayName"), serde_json::json!("alpha")),
        };
        assert!(InstanceFilterEvaluator::evaluate_filter(&instance, &gt).unwrap());
        assert!(!InstanceFilterEvaluator::evaluate_filter(&instance, &lt).unwrap());
    }

    #[test]
    fn test_invalid_path_is_an_error() {
        let instance = create_test_instance("g1", "Glossary", vec![]);
        let filter = FilterExpr::Exists {
            exists: JsonPath::new("displayName"),
        };
        let err = InstanceFilterEvaluator::evaluate_filter(&instance, &filter).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidProperty);
        assert!(filter_instances(vec![instance], &filter).is_empty());
    }
}
