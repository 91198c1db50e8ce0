use crate::logic::FilterExpr;
use crate::model::InstanceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequencingOrder {
    Any,
    Guid,
    CreationDateRecent,
    CreationDateOldest,
    LastUpdateRecent,
    LastUpdateOldest,
    PropertyAscending,
    PropertyDescending,
}

impl Default for SequencingOrder {
    fn default() -> Self {
        SequencingOrder::Any
    }
}

/// Search request shared by `find` and `get_relationships`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Regular expression matched against string property values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_criteria: Option<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    /// Zero means unbounded
    #[serde(default)]
    pub page_size: usize,
    #[serde(default)]
    pub sequencing_order: SequencingOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencing_property: Option<String>,
    /// Statuses to include; when absent every status except DELETED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_results_by_status: Option<Vec<InstanceStatus>>,
}

impl FindRequest {
    pub fn for_type(type_name: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            ..Self::default()
        }
    }

    pub fn page(mut self, offset: usize, page_size: usize) -> Self {
        self.offset = offset;
        self.page_size = page_size;
        self
    }

    pub fn ordered_by(mut self, order: SequencingOrder, property: Option<&str>) -> Self {
        self.sequencing_order = order;
        self.sequencing_property = property.map(str::to_string);
        self
    }

    pub fn as_of(mut self, time: DateTime<Utc>) -> Self {
        self.as_of_time = Some(time);
        self
    }

    pub fn matching(mut self, criteria: impl Into<String>) -> Self {
        self.search_criteria = Some(criteria.into());
        self
    }

    pub fn includes_status(&self, status: InstanceStatus) -> bool {
        match &self.limit_results_by_status {
            Some(statuses) => statuses.contains(&status),
            None => !status.is_deleted(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches before pagination
    pub total: usize,
}
