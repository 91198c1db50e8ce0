use std::cmp::Ordering;
use std::sync::Arc;

use itertools::Itertools;
use regex::Regex;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::logic::instance_filter::InstanceFilterEvaluator;
use crate::model::{FindRequest, Id, Instance, Page, SequencingOrder, TypeKind, TypeRegistry};
use crate::store::traits::Store;

/// Paged, ordered, optionally time-travelling searches over instances
pub struct QueryService<S: Store> {
    store: Arc<S>,
    registry: Arc<TypeRegistry>,
}

impl<S: Store> Clone for QueryService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S: Store> QueryService<S> {
    pub fn new(store: Arc<S>, registry: Arc<TypeRegistry>) -> Self {
        Self { store, registry }
    }

    /// Entities of `type_name` (and its subtypes) or of any type when absent
    pub async fn find(&self, request: &FindRequest) -> Result<Page<Instance>> {
        let type_names = match &request.type_name {
            Some(name) => Some(self.type_and_subtypes(name, TypeKind::Entity)?),
            None => None,
        };
        let search = compile_search(request)?;

        let candidates = self
            .store
            .list_instances(type_names.as_deref(), request.as_of_time)
            .await?
            .into_iter()
            .filter(|i| !i.is_relationship());

        let matches = self.select(candidates, request, search.as_ref())?;
        paginate(matches, request)
    }

    /// Relationships with `guid` at either end
    pub async fn get_relationships(&self, guid: &Id, request: &FindRequest) -> Result<Page<Instance>> {
        let anchor = match request.as_of_time {
            Some(time) => self.store.get_instance_as_of(guid, time).await?,
            None => self.store.get_instance(guid).await?,
        };
        if anchor.is_none() {
            return Err(SyncError::not_found("instance", guid.clone()));
        }

        let type_names = match &request.type_name {
            Some(name) => Some(self.type_and_subtypes(name, TypeKind::Relationship)?),
            None => None,
        };
        let search = compile_search(request)?;

        let candidates = self
            .store
            .list_relationships(guid, request.as_of_time)
            .await?
            .into_iter()
            .filter(|r| type_names.as_ref().map_or(true, |names| names.contains(&r.type_name)));

        let matches = self.select(candidates, request, search.as_ref())?;
        paginate(matches, request)
    }

    fn type_and_subtypes(&self, type_name: &str, kind: TypeKind) -> Result<Vec<String>> {
        match self.registry.get(type_name) {
            Some(def) if def.kind == kind => Ok(self.registry.subtypes_of(type_name)),
            Some(def) => Err(SyncError::InvalidType {
                type_name: type_name.to_string(),
                reason: format!("expected a {:?} type, found {:?}", kind, def.kind),
            }),
            None => Err(SyncError::InvalidType {
                type_name: type_name.to_string(),
                reason: "type is not defined".to_string(),
            }),
        }
    }

    /// Status, search and structured filters followed by the requested ordering
    fn select(
        &self,
        candidates: impl Iterator<Item = Instance>,
        request: &FindRequest,
        search: Option<&Regex>,
    ) -> Result<Vec<Instance>> {
        let mut selected = Vec::new();
        for instance in candidates {
            if !request.includes_status(instance.status) {
                continue;
            }
            if let Some(regex) = search {
                if !matches_search(&instance, regex) {
                    continue;
                }
            }
            if let Some(filter) = &request.filter {
                if !InstanceFilterEvaluator::evaluate_filter(&instance, filter)? {
                    continue;
                }
            }
            selected.push(instance);
        }
        sort_instances(selected, request)
    }
}

fn compile_search(request: &FindRequest) -> Result<Option<Regex>> {
    match request.search_criteria.as_deref() {
        None | Some("") => Ok(None),
        Some(criteria) => Regex::new(criteria).map(Some).map_err(|e| SyncError::InvalidProperty {
            type_name: request.type_name.clone().unwrap_or_default(),
            problems: vec![format!("invalid search criteria '{}': {}", criteria, e)],
        }),
    }
}

/// True when any string-valued property matches
fn matches_search(instance: &Instance, regex: &Regex) -> bool {
    instance.properties.values().any(|typed| match &typed.value {
        Value::String(s) => regex.is_match(s),
        Value::Array(items) => items.iter().filter_map(Value::as_str).any(|s| regex.is_match(s)),
        _ => false,
    })
}

fn sort_instances(instances: Vec<Instance>, request: &FindRequest) -> Result<Vec<Instance>> {
    let property = match request.sequencing_order {
        SequencingOrder::PropertyAscending | SequencingOrder::PropertyDescending => {
            let name = request.sequencing_property.as_deref().filter(|p| !p.is_empty());
            Some(name.ok_or_else(|| SyncError::InvalidProperty {
                type_name: request.type_name.clone().unwrap_or_default(),
                problems: vec!["property ordering requires a sequencing property".to_string()],
            })?)
        }
        _ => None,
    };

    let primary = |a: &Instance, b: &Instance| -> Ordering {
        match request.sequencing_order {
            SequencingOrder::Any | SequencingOrder::Guid => Ordering::Equal,
            SequencingOrder::CreationDateRecent => b.create_time.cmp(&a.create_time),
            SequencingOrder::CreationDateOldest => a.create_time.cmp(&b.create_time),
            SequencingOrder::LastUpdateRecent => b.update_time.cmp(&a.update_time),
            SequencingOrder::LastUpdateOldest => a.update_time.cmp(&b.update_time),
            SequencingOrder::PropertyAscending => compare_property(a, b, property.unwrap_or_default()),
            SequencingOrder::PropertyDescending => compare_property(b, a, property.unwrap_or_default()),
        }
    };

    Ok(instances
        .into_iter()
        .sorted_by(|a, b| primary(a, b).then_with(|| a.guid.cmp(&b.guid)))
        .collect())
}

/// Instances lacking the property sort after those that have it
fn compare_property(a: &Instance, b: &Instance, name: &str) -> Ordering {
    match (a.property(name), b.property(name)) {
        (Some(x), Some(y)) => compare_values(&x.value, &y.value),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn paginate(matches: Vec<Instance>, request: &FindRequest) -> Result<Page<Instance>> {
    let total = matches.len();
    let take = if request.page_size == 0 { usize::MAX } else { request.page_size };
    let items = matches.into_iter().skip(request.offset).take(take).collect();
    Ok(Page { items, total })
}
