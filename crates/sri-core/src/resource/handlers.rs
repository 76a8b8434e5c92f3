// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase-driven single-document handlers.
//!
//! Each handler kind calls `phase()` a fixed number of times so that batch
//! items of the same kind pass their barriers together: every validation runs
//! before any before-hook, every before-hook before any write. Returning
//! early simply settles the job.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::api::RouteContext;
use crate::error::{Error, Result, SriError};
use crate::hooks::{Element, Stage};
use crate::persistence::{DbHandle, DocumentRow};
use crate::request::SriResponse;

use super::{Resource, merge_patch, strip_meta};

fn path_key(ctx: &RouteContext) -> Result<String> {
    ctx.request
        .param("key")
        .map(str::to_string)
        .ok_or_else(|| Error::Internal("route has no :key parameter".to_string()))
}

pub(crate) fn not_found(permalink: &str) -> SriError {
    SriError::with_code(404, "not.found", format!("{} does not exist", permalink))
}

fn gone(permalink: &str) -> SriError {
    SriError::with_code(410, "resource.gone", format!("{} was deleted", permalink))
}

/// Fetch a document that must exist and must not be deleted.
async fn fetch_live(resource: &Resource, db: &DbHandle, key: &str) -> Result<DocumentRow> {
    let permalink = resource.permalink(key);
    match db.fetch(resource.table(), key).await? {
        None => Err(not_found(&permalink).into()),
        Some(row) if row.deleted => Err(gone(&permalink).into()),
        Some(row) => Ok(row),
    }
}

/// Check the shape of a client document and make its `key` match the URL.
fn normalize(resource: &Resource, mut document: Value, key: &str) -> Result<Value> {
    let Value::Object(map) = &mut document else {
        return Err(SriError::with_code(400, "body.invalid", "body must be a JSON object").into());
    };
    match map.get("key") {
        None => {
            map.insert("key".to_string(), Value::String(key.to_string()));
        }
        Some(Value::String(k)) if k == key => {}
        Some(other) => {
            return Err(SriError::new(
                400,
                vec![json!({
                    "code": "key.mismatch",
                    "msg": "key in body does not match the URL",
                    "url": resource.permalink(key),
                    "body": other,
                })],
            )
            .into());
        }
    }
    strip_meta(&mut document);
    if let Some(schema) = resource.schema() {
        schema.check(&document)?;
    }
    Ok(document)
}

fn element(permalink: &str, incoming: Option<Value>, stored: Option<Value>) -> Element {
    Element {
        permalink: permalink.to_string(),
        incoming,
        stored,
    }
}

/// `GET /type/:key`
pub async fn get(resource: Arc<Resource>, mut ctx: RouteContext) -> Result<SriResponse> {
    let key = path_key(&ctx)?;
    let permalink = resource.permalink(&key);

    ctx.phase().await?;
    let before = ctx.hook_context(vec![element(&permalink, None, None)]);
    resource.hooks().run(Stage::BeforeRead, &before).await?;

    ctx.phase().await?;
    let row = fetch_live(&resource, &ctx.db, &key).await?;
    let document = resource.document_with_meta(&row)?;

    ctx.phase().await?;
    let after = ctx.hook_context(vec![element(&permalink, None, Some(document.clone()))]);
    resource.hooks().run(Stage::AfterRead, &after).await?;

    Ok(SriResponse::ok(document))
}

/// Write `incoming` over `existing` (or insert it), running the hook stages
/// around the write. Shared tail of PUT and PATCH; uses three phases.
async fn write(
    resource: &Resource,
    ctx: &mut RouteContext,
    key: &str,
    incoming: Value,
    existing: Option<DocumentRow>,
) -> Result<SriResponse> {
    let permalink = resource.permalink(key);
    let stored = existing.as_ref().map(DocumentRow::document).transpose()?;
    let (before, after) = match existing {
        Some(_) => (Stage::BeforeUpdate, Stage::AfterUpdate),
        None => (Stage::BeforeInsert, Stage::AfterInsert),
    };

    ctx.phase().await?;
    let hook_ctx = ctx.hook_context(vec![element(&permalink, Some(incoming.clone()), stored)]);
    resource.hooks().run(before, &hook_ctx).await?;

    ctx.phase().await?;
    let (row, status) = match existing {
        Some(_) => {
            let row = ctx
                .db
                .update(resource.table(), key, &incoming)
                .await?
                .ok_or_else(|| not_found(&permalink))?;
            (row, 200)
        }
        None => (ctx.db.insert(resource.table(), key, &incoming).await?, 201),
    };
    let document = resource.document_with_meta(&row)?;

    ctx.phase().await?;
    let hook_ctx = ctx.hook_context(vec![element(
        &permalink,
        Some(incoming),
        Some(document.clone()),
    )]);
    resource.hooks().run(after, &hook_ctx).await?;

    Ok(SriResponse::with_status(status, Some(document)))
}

/// `PUT /type/:key`: create (201) or replace (200).
pub async fn put(resource: Arc<Resource>, mut ctx: RouteContext) -> Result<SriResponse> {
    let key = path_key(&ctx)?;

    ctx.phase().await?;
    let body = ctx.request.body.clone().unwrap_or(Value::Null);
    let incoming = normalize(&resource, body, &key)?;

    ctx.phase().await?;
    let existing = ctx.db.fetch(resource.table(), &key).await?;
    if let Some(row) = &existing {
        if row.deleted {
            return Err(gone(&resource.permalink(&key)).into());
        }
        if row.document()? == incoming {
            return Ok(SriResponse::ok(resource.document_with_meta(row)?));
        }
    }

    write(&resource, &mut ctx, &key, incoming, existing).await
}

/// `PATCH /type/:key`: JSON merge patch over the stored document.
pub async fn patch(resource: Arc<Resource>, mut ctx: RouteContext) -> Result<SriResponse> {
    let key = path_key(&ctx)?;

    ctx.phase().await?;
    let patch = match &ctx.request.body {
        Some(body @ Value::Object(_)) => body.clone(),
        _ => {
            return Err(
                SriError::with_code(400, "body.invalid", "patch must be a JSON object").into(),
            );
        }
    };

    ctx.phase().await?;
    let row = fetch_live(&resource, &ctx.db, &key).await?;
    let mut merged = row.document()?;
    merge_patch(&mut merged, &patch);
    let incoming = normalize(&resource, merged, &key)?;
    if row.document()? == incoming {
        return Ok(SriResponse::ok(resource.document_with_meta(&row)?));
    }

    write(&resource, &mut ctx, &key, incoming, Some(row)).await
}

/// `DELETE /type/:key`: soft delete; deleting twice is a no-op.
pub async fn delete(resource: Arc<Resource>, mut ctx: RouteContext) -> Result<SriResponse> {
    let key = path_key(&ctx)?;
    let permalink = resource.permalink(&key);

    ctx.phase().await?;
    let row = match ctx.db.fetch(resource.table(), &key).await? {
        None => return Err(not_found(&permalink).into()),
        Some(row) if row.deleted => return Ok(SriResponse::with_status(200, None)),
        Some(row) => row,
    };
    let stored = resource.document_with_meta(&row)?;

    ctx.phase().await?;
    let hook_ctx = ctx.hook_context(vec![element(&permalink, None, Some(stored.clone()))]);
    resource.hooks().run(Stage::BeforeDelete, &hook_ctx).await?;

    ctx.phase().await?;
    ctx.db.soft_delete(resource.table(), &key).await?;

    ctx.phase().await?;
    resource.hooks().run(Stage::AfterDelete, &hook_ctx).await?;

    Ok(SriResponse::with_status(200, None))
}
