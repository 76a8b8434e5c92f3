// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `GET /type`: filtered, ordered, paged collection reads.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::api::RouteContext;
use crate::config::Config;
use crate::error::{Result, SriError};
use crate::hooks::{Element, Stage};
use crate::persistence::{DeletedFilter, OrderField, SelectQuery};
use crate::request::{SriRequest, SriResponse};

use super::{Resource, META};

/// How much of each document the list returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expand {
    /// Only `href`.
    None,
    /// `href` plus `$$expanded`.
    Full,
}

/// Parsed paging and presentation options.
#[derive(Debug, Clone, PartialEq)]
pub struct ListOptions {
    /// Page size.
    pub limit: u32,
    /// Rows skipped.
    pub offset: u32,
    /// Document detail.
    pub expand: Expand,
    /// Add `$$meta.count`.
    pub include_count: bool,
}

fn bad_param(code: &str, msg: impl Into<String>) -> SriError {
    SriError::with_code(409, code, msg)
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, SriError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(bad_param(
            "invalid.query.parameter.value",
            format!("{} must be true or false", key),
        )),
    }
}

/// Turn the request's query string into a select and list options.
///
/// Every parameter that is neither reserved nor known to a filter is
/// reported in one `404 invalid.query.parameter` error.
pub async fn parse_query(
    resource: &Resource,
    request: &SriRequest,
    ctx: &RouteContext,
    config: &Config,
) -> std::result::Result<(SelectQuery, ListOptions), SriError> {
    let mut query = SelectQuery::new();
    let mut options = ListOptions {
        limit: config.default_page_size,
        offset: 0,
        expand: Expand::Full,
        include_count: false,
    };
    let mut unknown = Vec::new();

    for (key, value) in &request.query {
        match key.as_str() {
            "limit" => {
                options.limit = value
                    .parse::<u32>()
                    .ok()
                    .filter(|l| *l > 0 && *l <= config.max_page_size)
                    .ok_or_else(|| {
                        bad_param(
                            "invalid.limit",
                            format!("limit must be between 1 and {}", config.max_page_size),
                        )
                    })?;
            }
            "offset" => {
                options.offset = value.parse::<u32>().map_err(|_| {
                    bad_param("invalid.offset", "offset must be a non-negative integer")
                })?;
            }
            "orderBy" => {
                query.order_by = value
                    .split(',')
                    .map(|f| {
                        let field = OrderField::parse(f.trim());
                        match &field {
                            OrderField::Property(name)
                                if resource.schema().and_then(|s| s.property(name)).is_none() =>
                            {
                                Err(bad_param(
                                    "invalid.orderby",
                                    format!("cannot order by '{}'", name),
                                ))
                            }
                            _ => Ok(field),
                        }
                    })
                    .collect::<std::result::Result<_, _>>()?;
            }
            "descending" => query.descending = parse_bool(key, value)?,
            "expand" => {
                options.expand = match value.to_ascii_uppercase().as_str() {
                    "NONE" => Expand::None,
                    "FULL" => Expand::Full,
                    _ => return Err(bad_param("invalid.expand", "expand must be NONE or FULL")),
                };
            }
            "$$includeCount" => options.include_count = parse_bool(key, value)?,
            "$$meta.deleted" => {
                query.deleted = match value.as_str() {
                    "false" => DeletedFilter::Exclude,
                    "true" => DeletedFilter::Only,
                    "any" => DeletedFilter::Include,
                    _ => {
                        return Err(bad_param(
                            "invalid.query.parameter.value",
                            "$$meta.deleted must be true, false or any",
                        ));
                    }
                };
            }
            "dryRun" => {}
            _ => {
                let known = resource
                    .filters()
                    .apply(resource, key, value, &mut query, &ctx.db)
                    .await?;
                if !known {
                    unknown.push(key.clone());
                }
            }
        }
    }

    if !unknown.is_empty() {
        return Err(SriError::new(
            404,
            unknown
                .into_iter()
                .map(|p| {
                    json!({
                        "code": "invalid.query.parameter",
                        "msg": format!("unknown query parameter '{}'", p),
                        "parameter": p,
                    })
                })
                .collect(),
        ));
    }

    query.limit = Some(options.limit);
    query.offset = options.offset;
    Ok((query, options))
}

/// Link to the following page, keeping every other parameter.
fn next_href(request: &SriRequest, options: &ListOptions) -> String {
    let mut parts: Vec<String> = request
        .query
        .iter()
        .filter(|(k, _)| k != "offset")
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    parts.push(format!("offset={}", options.offset + options.limit));
    format!("{}?{}", request.path, parts.join("&"))
}

/// `GET /type`
pub async fn list(resource: Arc<Resource>, mut ctx: RouteContext) -> Result<SriResponse> {
    let request = ctx.request.clone();

    ctx.phase().await?;
    let before = ctx.hook_context(vec![Element {
        permalink: resource.type_path().to_string(),
        incoming: None,
        stored: None,
    }]);
    resource.hooks().run(Stage::BeforeRead, &before).await?;

    ctx.phase().await?;
    let config = ctx.config.clone();
    let (query, options) = parse_query(&resource, &request, &ctx, &config).await?;
    let rows = ctx.db.select(resource.table(), &query).await?;
    let count = if options.include_count {
        Some(ctx.db.count(resource.table(), &query).await?)
    } else {
        None
    };
    debug!(resource = resource.type_path(), rows = rows.len(), "List fetched");

    let mut documents = Vec::with_capacity(rows.len());
    for row in &rows {
        documents.push((resource.permalink(&row.key), resource.document_with_meta(row)?));
    }

    let after = ctx.hook_context(
        documents
            .iter()
            .map(|(href, doc)| Element {
                permalink: href.clone(),
                incoming: None,
                stored: Some(doc.clone()),
            })
            .collect(),
    );
    resource.hooks().run(Stage::AfterRead, &after).await?;

    let mut meta = Map::new();
    if let Some(count) = count {
        meta.insert("count".to_string(), json!(count));
    }
    if rows.len() == options.limit as usize {
        meta.insert("next".to_string(), json!(next_href(&request, &options)));
    }

    let results = documents.into_iter().map(|(href, doc)| match options.expand {
        Expand::Full => json!({"href": href, "$$expanded": doc}),
        Expand::None => json!({"href": href}),
    });

    if resource.streaming_list()
        && let Some(stream) = ctx.stream()
    {
        stream.begin_results(Some(&Value::Object(meta))).await?;
        for result in results {
            stream.push(&result).await?;
        }
        stream.finish(&Map::new()).await?;
        return Ok(SriResponse::streamed(stream.status()));
    }

    Ok(SriResponse::ok(json!({
        META: Value::Object(meta),
        "results": results.collect::<Vec<_>>(),
    })))
}
