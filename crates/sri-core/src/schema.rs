// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON Schema validation of resource documents.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::{Error, Result, SriError};

/// Scalar type of a top-level schema property, used to type query filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// `"string"` and anything unrecognized.
    String,
    /// `"integer"`.
    Integer,
    /// `"number"`.
    Number,
    /// `"boolean"`.
    Boolean,
}

impl PropertyType {
    fn from_schema(property: &Value) -> Self {
        let declared = match property.get("type") {
            Some(Value::String(t)) => Some(t.as_str()),
            Some(Value::Array(types)) => types
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null"),
            _ => None,
        };
        match declared {
            Some("integer") => Self::Integer,
            Some("number") => Self::Number,
            Some("boolean") => Self::Boolean,
            _ => Self::String,
        }
    }

    /// Convert a raw query value to a typed JSON value.
    pub fn parse(self, raw: &str) -> Option<Value> {
        match self {
            Self::String => Some(Value::String(raw.to_string())),
            Self::Integer => raw.parse::<i64>().ok().map(Value::from),
            Self::Number => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            Self::Boolean => match raw {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
        }
    }
}

/// One schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSON pointer into the document.
    pub path: String,
    /// Human readable message.
    pub message: String,
}

/// A compiled resource schema.
pub struct ResourceSchema {
    raw: Value,
    validator: jsonschema::Validator,
    properties: BTreeMap<String, PropertyType>,
}

impl std::fmt::Debug for ResourceSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSchema")
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl ResourceSchema {
    /// Compile a schema; invalid schemas are a configuration error.
    pub fn compile(raw: Value) -> Result<Self> {
        let validator = jsonschema::validator_for(&raw)
            .map_err(|e| Error::Configuration(format!("invalid resource schema: {}", e)))?;
        let properties = raw
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), PropertyType::from_schema(prop)))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            raw,
            validator,
            properties,
        })
    }

    /// The schema as registered.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Top-level properties and their scalar types.
    pub fn properties(&self) -> &BTreeMap<String, PropertyType> {
        &self.properties
    }

    /// Type of a top-level property.
    pub fn property(&self, name: &str) -> Option<PropertyType> {
        self.properties.get(name).copied()
    }

    /// Every violation of `document`; empty when valid.
    pub fn validate(&self, document: &Value) -> Vec<ValidationIssue> {
        self.validator
            .iter_errors(document)
            .map(|e| ValidationIssue {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect()
    }

    /// Validate and turn violations into a `409 validation.errors` response.
    pub fn check(&self, document: &Value) -> std::result::Result<(), SriError> {
        let issues = self.validate(document);
        if issues.is_empty() {
            return Ok(());
        }
        let issues: Vec<Value> = issues
            .into_iter()
            .map(|i| json!({"path": i.path, "message": i.message}))
            .collect();
        Err(SriError::new(
            409,
            vec![json!({
                "code": "validation.errors",
                "msg": "document does not match the resource schema",
                "errors": issues,
            })],
        ))
    }
}
