// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resources: JSON documents of one type, one table each.
//!
//! A resource registers these routes (subject to its `methods` list):
//!
//! | Route | Handler | Read-only |
//! |-------|---------|-----------|
//! | `GET /type/:key` | [`handlers::get`] | yes |
//! | `PUT /type/:key` | [`handlers::put`] | no |
//! | `PATCH /type/:key` | [`handlers::patch`] | no |
//! | `DELETE /type/:key` | [`handlers::delete`] | no |
//! | `GET /type` | [`list::list`] | yes |
//! | `PUT/POST /type/batch` | batch | per item |
//! | `PUT/POST /type/batch_streaming` | streaming batch | per item |

pub mod filters;
pub mod handlers;
pub mod list;

use std::sync::Arc;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::hooks::{Hook, HookPipeline, Stage};
use crate::persistence::{DocumentRow, validate_identifier};
use crate::routing::{BatchHandlerRecord, HandlerKind, RoutePattern};
use crate::schema::ResourceSchema;

pub use filters::{FilterRegistry, QueryFilter};

/// Key of the metadata object attached to every served document.
pub const META: &str = "$$meta";

const ALL_METHODS: [&str; 4] = ["GET", "PUT", "PATCH", "DELETE"];

/// Declarative resource description, as loaded from the resources file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Collection path, e.g. `/persons`.
    #[serde(rename = "type")]
    pub type_path: String,
    /// Backing table.
    pub table: String,
    /// JSON schema of the documents.
    #[serde(default)]
    pub schema: Option<Value>,
    /// Allowed verbs among `GET`, `PUT`, `PATCH`, `DELETE`; all when absent.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Stream list responses.
    #[serde(default, alias = "streamingList")]
    pub streaming_list: bool,
}

impl ResourceDefinition {
    /// Definition with no schema, all methods, no streaming.
    pub fn new(type_path: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            type_path: type_path.into(),
            table: table.into(),
            schema: None,
            methods: None,
            streaming_list: false,
        }
    }
}

/// A compiled, immutable resource.
pub struct Resource {
    definition: ResourceDefinition,
    schema: Option<ResourceSchema>,
    hooks: HookPipeline,
    filters: FilterRegistry,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("type", &self.definition.type_path)
            .field("table", &self.definition.table)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Start building a resource.
    pub fn builder(definition: ResourceDefinition) -> ResourceBuilder {
        ResourceBuilder {
            definition,
            hooks: HookPipeline::default(),
            filters: FilterRegistry::default(),
        }
    }

    /// Collection path, e.g. `/persons`.
    pub fn type_path(&self) -> &str {
        &self.definition.type_path
    }

    /// Backing table.
    pub fn table(&self) -> &str {
        &self.definition.table
    }

    /// Compiled schema, if any.
    pub fn schema(&self) -> Option<&ResourceSchema> {
        self.schema.as_ref()
    }

    /// Hook pipeline.
    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    /// Custom query filters.
    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Whether list responses are streamed.
    pub fn streaming_list(&self) -> bool {
        self.definition.streaming_list
    }

    /// `/type/key`.
    pub fn permalink(&self, key: &str) -> String {
        format!("{}/{}", self.definition.type_path, key)
    }

    /// Key of a permalink of this resource.
    pub fn key_from_href<'a>(&self, href: &'a str) -> Option<&'a str> {
        href.strip_prefix(self.definition.type_path.as_str())?
            .strip_prefix('/')
            .filter(|key| !key.is_empty() && !key.contains('/'))
    }

    fn allows(&self, verb: &str) -> bool {
        match &self.definition.methods {
            Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(verb)),
            None => true,
        }
    }

    /// Document as served: stored body plus `$$meta`.
    pub fn document_with_meta(&self, row: &DocumentRow) -> Result<Value> {
        let mut document = row.document()?;
        let mut meta = Map::new();
        meta.insert("permalink".into(), json!(self.permalink(&row.key)));
        meta.insert("created".into(), json!(row.created.to_rfc3339()));
        meta.insert("modified".into(), json!(row.modified.to_rfc3339()));
        meta.insert("version".into(), json!(row.version));
        if row.deleted {
            meta.insert("deleted".into(), json!(true));
        }
        if let Value::Object(map) = &mut document {
            map.insert(META.to_string(), Value::Object(meta));
        }
        Ok(document)
    }

    /// Routes served by this resource.
    pub(crate) fn routes(self: &Arc<Self>) -> Result<Vec<BatchHandlerRecord>> {
        let collection = self.type_path();
        let item = format!("{}/:key", collection);
        let mut routes = Vec::new();

        let mut add = |pattern: &str, verb: Method, kind: HandlerKind, read_only: bool| -> Result<()> {
            routes.push(
                BatchHandlerRecord::new(RoutePattern::parse(pattern)?, verb, kind)
                    .for_resource(self.clone())
                    .read_only(read_only),
            );
            Ok(())
        };

        if self.allows("GET") {
            add(&item, Method::GET, HandlerKind::Get, true)?;
            add(collection, Method::GET, HandlerKind::List, true)?;
        }
        if self.allows("PUT") {
            add(&item, Method::PUT, HandlerKind::Put, false)?;
        }
        if self.allows("PATCH") {
            add(&item, Method::PATCH, HandlerKind::Patch, false)?;
        }
        if self.allows("DELETE") {
            add(&item, Method::DELETE, HandlerKind::Delete, false)?;
        }
        for verb in [Method::PUT, Method::POST] {
            for (suffix, streaming) in [("batch", false), ("batch_streaming", true)] {
                add(
                    &format!("{}/{}", collection, suffix),
                    verb.clone(),
                    HandlerKind::Batch { streaming },
                    false,
                )?;
            }
        }

        if self.streaming_list()
            && let Some(list) = routes
                .iter_mut()
                .find(|r| matches!(r.kind, HandlerKind::List))
        {
            list.streaming = true;
        }
        Ok(routes)
    }
}

/// Builder for [`Resource`].
pub struct ResourceBuilder {
    definition: ResourceDefinition,
    hooks: HookPipeline,
    filters: FilterRegistry,
}

impl ResourceBuilder {
    /// Append a hook to `stage`.
    pub fn hook(mut self, stage: Stage, hook: impl Hook + 'static) -> Self {
        self.hooks.add(stage, Arc::new(hook));
        self
    }

    /// Register a custom query parameter.
    pub fn filter(mut self, name: impl Into<String>, filter: impl QueryFilter + 'static) -> Self {
        self.filters.register(name, Arc::new(filter));
        self
    }

    /// Validate the definition and compile the schema.
    pub fn build(self) -> Result<Resource> {
        let definition = self.definition;
        let name = definition.type_path.strip_prefix('/').ok_or_else(|| {
            Error::Configuration(format!(
                "resource type '{}' must start with '/'",
                definition.type_path
            ))
        })?;
        if name.is_empty() || name.contains('/') || name.starts_with(':') {
            return Err(Error::Configuration(format!(
                "resource type '{}' must be a single static segment",
                definition.type_path
            )));
        }
        validate_identifier(&definition.table)?;

        if let Some(methods) = &definition.methods
            && let Some(unknown) = methods
                .iter()
                .find(|m| !ALL_METHODS.iter().any(|a| a.eq_ignore_ascii_case(m)))
        {
            return Err(Error::Configuration(format!(
                "resource '{}' lists unsupported method '{}'",
                definition.type_path, unknown
            )));
        }

        let schema = definition
            .schema
            .clone()
            .map(ResourceSchema::compile)
            .transpose()?;

        Ok(Resource {
            definition,
            schema,
            hooks: self.hooks,
            filters: self.filters,
        })
    }
}

/// Remove `$$meta` from a client document.
pub(crate) fn strip_meta(document: &mut Value) {
    if let Value::Object(map) = document {
        map.remove(META);
    }
}

/// Apply a JSON merge patch (RFC 7396) to `target`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn persons() -> Arc<Resource> {
        Arc::new(
            Resource::builder(ResourceDefinition::new("/persons", "persons"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_definition_deserializes_both_spellings() {
        let def: ResourceDefinition = serde_json::from_value(json!({
            "type": "/persons",
            "table": "persons",
            "methods": ["GET"],
            "streamingList": true
        }))
        .unwrap();
        assert_eq!(def.type_path, "/persons");
        assert!(def.streaming_list);
        assert_eq!(def.methods, Some(vec!["GET".to_string()]));
    }

    #[test]
    fn test_builder_rejects_bad_definitions() {
        for def in [
            ResourceDefinition::new("persons", "persons"),
            ResourceDefinition::new("/a/b", "persons"),
            ResourceDefinition::new("/persons", "bad table"),
        ] {
            assert!(Resource::builder(def).build().is_err());
        }

        let mut def = ResourceDefinition::new("/persons", "persons");
        def.methods = Some(vec!["OPTIONS".to_string()]);
        assert!(Resource::builder(def).build().is_err());
    }

    #[test]
    fn test_routes_follow_methods() {
        let all = persons().routes().unwrap();
        assert_eq!(all.len(), 5 + 4);

        let mut def = ResourceDefinition::new("/cities", "cities");
        def.methods = Some(vec!["get".to_string()]);
        def.streaming_list = true;
        let read_only = Arc::new(Resource::builder(def).build().unwrap()).routes().unwrap();
        let crud: Vec<_> = read_only.iter().filter(|r| !r.is_batch()).collect();
        assert_eq!(crud.len(), 2);
        assert!(crud.iter().all(|r| r.read_only && r.verb == Method::GET));
        assert!(crud.iter().any(|r| r.streaming));
    }

    #[test]
    fn test_permalink_and_key() {
        let resource = persons();
        assert_eq!(resource.permalink("1"), "/persons/1");
        assert_eq!(resource.key_from_href("/persons/1"), Some("1"));
        assert_eq!(resource.key_from_href("/persons/"), None);
        assert_eq!(resource.key_from_href("/cities/1"), None);
        assert_eq!(resource.key_from_href("/personsx/1"), None);
    }

    #[test]
    fn test_document_with_meta() {
        let row = DocumentRow {
            key: "1".to_string(),
            body: r#"{"key":"1","name":"Ann"}"#.to_string(),
            version: 3,
            created: Utc::now(),
            modified: Utc::now(),
            deleted: true,
        };
        let doc = persons().document_with_meta(&row).unwrap();
        assert_eq!(doc["name"], "Ann");
        assert_eq!(doc[META]["permalink"], "/persons/1");
        assert_eq!(doc[META]["version"], 3);
        assert_eq!(doc[META]["deleted"], true);
    }

    #[test]
    fn test_merge_patch() {
        let mut doc = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        merge_patch(&mut doc, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(doc, json!({"a": "z", "c": {"d": "e"}}));

        let mut doc = json!({"a": [1, 2]});
        merge_patch(&mut doc, &json!({"a": [3], "n": null}));
        assert_eq!(doc, json!({"a": [3]}));

        let mut doc = json!({"a": 1});
        merge_patch(&mut doc, &json!(["x"]));
        assert_eq!(doc, json!(["x"]));
    }

    #[test]
    fn test_strip_meta() {
        let mut doc = json!({"key": "1", "$$meta": {"permalink": "/x/1"}});
        strip_meta(&mut doc);
        assert_eq!(doc, json!({"key": "1"}));
    }
}
