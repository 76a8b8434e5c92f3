// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Query-parameter filters for list requests.
//!
//! Built-in parameters:
//!
//! | Parameter | Effect |
//! |-----------|--------|
//! | `keys=a,b` | only these keys |
//! | `hrefs=/t/a,/t/b` | only these permalinks |
//! | `modifiedSince=<rfc3339>` | written at or after |
//! | `<prop>` | equal |
//! | `<prop>Not` | not equal (missing counts as different) |
//! | `<prop>Greater`, `<prop>GreaterOrEqual`, `<prop>Less`, `<prop>LessOrEqual` | ordering |
//! | `<prop>In=a,b` | one of |
//! | `<prop>Contains` | case-insensitive substring |
//!
//! `<prop>` is any top-level property of the resource schema; values are typed
//! after the schema. Custom filters registered on the resource take precedence
//! over all of the above.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::SriError;
use crate::persistence::{Condition, DbHandle, Operator, SelectQuery};
use crate::schema::PropertyType;

use super::Resource;

/// Application-defined query parameter.
#[async_trait]
pub trait QueryFilter: Send + Sync {
    /// Add conditions for `value` of parameter `key` to `query`.
    async fn apply(
        &self,
        value: &str,
        query: &mut SelectQuery,
        key: &str,
        db: &DbHandle,
    ) -> Result<(), SriError>;
}

/// Custom filters of one resource, by parameter name.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    custom: BTreeMap<String, Arc<dyn QueryFilter>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.custom.keys()).finish()
    }
}

// Longer suffixes first so `GreaterOrEqual` is not read as `Greater`.
const SUFFIXES: [(&str, Operator); 7] = [
    ("GreaterOrEqual", Operator::GreaterOrEqual),
    ("LessOrEqual", Operator::LessOrEqual),
    ("Contains", Operator::Contains),
    ("Greater", Operator::Greater),
    ("Less", Operator::Less),
    ("Not", Operator::NotEq),
    ("In", Operator::In),
];

fn invalid_value(key: &str, value: &str, expected: &str) -> SriError {
    SriError::new(
        400,
        vec![json!({
            "code": "invalid.query.parameter.value",
            "msg": format!("'{}' is not a valid value for '{}', expected {}", value, key, expected),
            "parameter": key,
        })],
    )
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn typed(key: &str, raw: &str, ty: PropertyType) -> Result<Value, SriError> {
    ty.parse(raw)
        .ok_or_else(|| invalid_value(key, raw, &format!("{:?}", ty).to_lowercase()))
}

impl FilterRegistry {
    /// Register (or replace) a custom parameter.
    pub fn register(&mut self, name: impl Into<String>, filter: Arc<dyn QueryFilter>) {
        self.custom.insert(name.into(), filter);
    }

    /// Whether `name` is a custom parameter.
    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Apply parameter `key`. `Ok(false)` when nothing knows the parameter.
    pub async fn apply(
        &self,
        resource: &Resource,
        key: &str,
        value: &str,
        query: &mut SelectQuery,
        db: &DbHandle,
    ) -> Result<bool, SriError> {
        if let Some(filter) = self.custom.get(key) {
            filter.apply(value, query, key, db).await?;
            return Ok(true);
        }

        match key {
            "keys" => {
                query.push(Condition::KeyIn(split_list(value)));
                return Ok(true);
            }
            "hrefs" => {
                let keys = split_list(value)
                    .iter()
                    .map(|href| {
                        resource
                            .key_from_href(href)
                            .map(str::to_string)
                            .ok_or_else(|| invalid_value(key, href, "a permalink of this resource"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                query.push(Condition::KeyIn(keys));
                return Ok(true);
            }
            "modifiedSince" => {
                let since = DateTime::parse_from_rfc3339(value)
                    .map_err(|_| invalid_value(key, value, "an RFC 3339 timestamp"))?;
                query.push(Condition::ModifiedSince(since.with_timezone(&Utc)));
                return Ok(true);
            }
            _ => {}
        }

        let Some(schema) = resource.schema() else {
            return Ok(false);
        };

        if let Some(ty) = schema.property(key) {
            query.where_field(key, Operator::Eq, typed(key, value, ty)?);
            return Ok(true);
        }

        for (suffix, op) in SUFFIXES {
            let Some(property) = key.strip_suffix(suffix) else {
                continue;
            };
            let Some(ty) = schema.property(property) else {
                continue;
            };
            let value = match op {
                Operator::In => Value::Array(
                    split_list(value)
                        .iter()
                        .map(|v| typed(key, v, ty))
                        .collect::<Result<_, _>>()?,
                ),
                Operator::Contains => Value::String(value.to_string()),
                _ => typed(key, value, ty)?,
            };
            query.where_field(property, op, value);
            return Ok(true);
        }

        Ok(false)
    }
}
