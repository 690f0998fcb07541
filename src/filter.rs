//! Subscription filters and event matching.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{Event, Timestamp};

/// Rejected filter field.
#[derive(Debug, Error, PartialEq)]
#[error("invalid filter field `{field}`: {reason}")]
pub struct FilterError {
    pub field: String,
    pub reason: &'static str,
}

impl FilterError {
    fn new(field: &str, reason: &'static str) -> Self {
        Self {
            field: field.to_string(),
            reason,
        }
    }
}

/// Declarative predicate supplied by a subscriber.
///
/// Absent fields match everything. Values within a field are alternatives,
/// fields are combined with AND. `since` is inclusive and `until` is
/// exclusive. `limit` only bounds historical backfill and is ignored by live
/// matching.
///
/// Tag filters are keyed by tag name without the `#` prefix, so the wire field
/// `"#t": ["news"]` becomes `tags["t"] == ["news"]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Decode a filter object. Unknown fields are ignored; known fields with
    /// the wrong shape are rejected.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val
            .as_object()
            .ok_or_else(|| FilterError::new("<filter>", "expected an object"))?;
        let mut filter = Filter {
            ids: string_list(obj, "ids")?,
            authors: string_list(obj, "authors")?,
            kinds: kind_list(obj)?,
            since: timestamp(obj, "since")?,
            until: timestamp(obj, "until")?,
            limit: None,
            tags: BTreeMap::new(),
        };
        if let Some(v) = obj.get("limit") {
            let limit = v
                .as_u64()
                .ok_or_else(|| FilterError::new("limit", "expected a non-negative integer"))?;
            filter.limit = Some(limit as usize);
        }
        for key in obj.keys() {
            if let Some(name) = key.strip_prefix('#').filter(|n| !n.is_empty()) {
                if let Some(values) = string_list(obj, key)? {
                    filter.tags.insert(name.to_string(), values);
                }
            }
        }
        Ok(filter)
    }

    /// Encode to the wire object, omitting absent fields.
    #[cfg(test)]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), serde_json::json!(ids));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), serde_json::json!(authors));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), serde_json::json!(kinds));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), serde_json::json!(values));
        }
        Value::Object(obj)
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at >= until {
                return false;
            }
        }
        self.tags.iter().all(|(name, values)| {
            event.tags.iter().any(|tag| {
                tag.name() == Some(name.as_str())
                    && tag.value().is_some_and(|v| values.iter().any(|want| want == v))
            })
        })
    }
}

fn string_list(obj: &Map<String, Value>, field: &str) -> Result<Option<Vec<String>>, FilterError> {
    let Some(v) = obj.get(field) else {
        return Ok(None);
    };
    let arr = v
        .as_array()
        .ok_or_else(|| FilterError::new(field, "expected an array of strings"))?;
    arr.iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| FilterError::new(field, "expected an array of strings"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn kind_list(obj: &Map<String, Value>) -> Result<Option<Vec<u32>>, FilterError> {
    let Some(v) = obj.get("kinds") else {
        return Ok(None);
    };
    let arr = v
        .as_array()
        .ok_or_else(|| FilterError::new("kinds", "expected an array of integers"))?;
    arr.iter()
        .map(|item| {
            item.as_u64()
                .and_then(|k| u32::try_from(k).ok())
                .ok_or_else(|| FilterError::new("kinds", "expected an array of integers"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn timestamp(obj: &Map<String, Value>, field: &str) -> Result<Option<Timestamp>, FilterError> {
    match obj.get(field) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| FilterError::new(field, "expected integer seconds")),
    }
}
