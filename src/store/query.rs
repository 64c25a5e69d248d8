//! Fetch requests and their evaluation against stored records.
//!
//! The predicate language is intentionally small: equality, inequality and
//! conjunction over top-level attributes.

use crate::store::Record;
use crate::types::{Attributes, PermanentId, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Filter over record attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Equals(String, Value),
    NotEquals(String, Value),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Equals(key.into(), value.into())
    }

    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            // Missing attributes compare as null
            Predicate::Equals(key, value) => {
                attributes.get(key).unwrap_or(&Value::Null) == value
            }
            Predicate::NotEquals(key, value) => {
                attributes.get(key).unwrap_or(&Value::Null) != value
            }
            Predicate::And(parts) => parts.iter().all(|p| p.matches(attributes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }

    /// Parse `key` or `key:asc` / `key:desc`
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.split_once(':') {
            None if !spec.is_empty() => Some(Self::ascending(spec)),
            Some((key, "asc")) if !key.is_empty() => Some(Self::ascending(key)),
            Some((key, "desc")) if !key.is_empty() => Some(Self::descending(key)),
            _ => None,
        }
    }
}

/// Immutable query descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sorted_by(mut self, descriptor: SortDescriptor) -> Self {
        self.sort.push(descriptor);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.entity == self.entity
            && self
                .predicate
                .as_ref()
                .map(|p| p.matches(&record.attributes))
                .unwrap_or(true)
    }

    /// Compare two records by the sort descriptors, falling back to identifier order
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for descriptor in &self.sort {
            let left = a.attributes.get(&descriptor.key).unwrap_or(&Value::Null);
            let right = b.attributes.get(&descriptor.key).unwrap_or(&Value::Null);
            let ordering = left.sort_cmp(right);
            let ordering = if descriptor.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.id.cmp(&b.id)
    }

    /// Filter, order, and truncate candidate records into result identifiers.
    ///
    /// Records that do not carry permanent identifiers are skipped.
    pub fn evaluate<I>(&self, records: I) -> Vec<PermanentId>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut matched: Vec<Record> = records
            .into_iter()
            .filter(|r| r.id.permanent().is_some() && self.matches(r))
            .collect();
        matched.sort_by(|a, b| self.compare(a, b));

        let limit = self.limit.unwrap_or(usize::MAX);
        matched
            .into_iter()
            .filter_map(|r| r.id.permanent())
            .take(limit)
            .collect()
    }
}
