// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-document GET, PUT, PATCH and DELETE over HTTP.

mod common;

use axum::body::Body;
use axum::http::{Method, StatusCode};
use futures::FutureExt;
use serde_json::json;

use common::*;
use sri_core::{HookContext, ResourceDefinition, SriError, Stage};

#[tokio::test]
async fn test_put_creates_then_get_reads() {
    let ctx = TestContext::new().await;

    let created = ctx
        .put("/persons/p1", json!({"firstname": "Ada", "age": 36}))
        .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.text);
    let body = created.json();
    assert_eq!(body["key"], "p1");
    assert_eq!(body["$$meta"]["permalink"], "/persons/p1");
    assert_eq!(body["$$meta"]["version"], 1);
    assert_eq!(ctx.commits(), 1);

    let read = ctx.get("/persons/p1").await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(read.json()["firstname"], "Ada");
    // Reads run on a plain connection, never a transaction.
    assert_eq!(ctx.transactions(), 1);
    assert_eq!(ctx.tasks(), 1);
}

#[tokio::test]
async fn test_put_replaces_and_bumps_version() {
    let ctx = TestContext::new().await;
    ctx.create_person("p1", "Ada", 36).await;

    let replaced = ctx
        .put("/persons/p1", json!({"firstname": "Grace", "age": 45}))
        .await;
    assert_eq!(replaced.status, StatusCode::OK, "{}", replaced.text);
    let body = replaced.json();
    assert_eq!(body["firstname"], "Grace");
    assert_eq!(body["$$meta"]["version"], 2);
    // Replaced, not merged.
    assert!(body.get("lastname").is_none());
}

#[tokio::test]
async fn test_unchanged_put_does_not_write() {
    let ctx = TestContext::new().await;
    ctx.create_person("p1", "Ada", 36).await;
    let writes = ctx.writes();

    let again = ctx
        .put(
            "/persons/p1",
            json!({"firstname": "Ada", "lastname": "Test", "age": 36}),
        )
        .await;
    assert_eq!(again.status, StatusCode::OK, "{}", again.text);
    assert_eq!(again.json()["$$meta"]["version"], 1);
    assert_eq!(ctx.writes(), writes);
}

#[tokio::test]
async fn test_put_ignores_meta_sent_back_by_client() {
    let ctx = TestContext::new().await;
    ctx.create_person("p1", "Ada", 36).await;

    let mut document = ctx.get("/persons/p1").await.json();
    document["age"] = json!(37);
    let updated = ctx.put("/persons/p1", document).await;
    assert_eq!(updated.status, StatusCode::OK, "{}", updated.text);
    assert_eq!(updated.json()["age"], 37);
}

#[tokio::test]
async fn test_put_key_mismatch() {
    let ctx = TestContext::new().await;

    let response = ctx
        .put("/persons/p1", json!({"key": "p2", "firstname": "Ada"}))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["errors"][0]["code"], "key.mismatch");
    assert_eq!(ctx.commits(), 0);
}

#[tokio::test]
async fn test_schema_violation_rolls_back() {
    let ctx = TestContext::new().await;

    let response = ctx
        .put("/persons/p1", json!({"lastname": "NoFirstname", "age": -1}))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);
    let body = response.json();
    assert_eq!(body["errors"][0]["code"], "validation.errors");
    assert!(body["errors"][0]["errors"].as_array().unwrap().len() >= 2);
    assert_eq!(ctx.commits(), 0);
    assert_eq!(ctx.rollbacks(), 1);

    assert_eq!(ctx.get("/persons/p1").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_patch_merges_into_stored_document() {
    let ctx = TestContext::new().await;
    ctx.create_person("p1", "Ada", 36).await;

    let patched = ctx
        .send(
            Method::PATCH,
            "/persons/p1",
            Some(json!({"age": 37, "lastname": null})),
        )
        .await;
    assert_eq!(patched.status, StatusCode::OK, "{}", patched.text);
    let body = patched.json();
    assert_eq!(body["firstname"], "Ada");
    assert_eq!(body["age"], 37);
    assert!(body.get("lastname").is_none());
    assert_eq!(body["$$meta"]["version"], 2);
}

#[tokio::test]
async fn test_patch_missing_document() {
    let ctx = TestContext::new().await;

    let response = ctx
        .send(Method::PATCH, "/persons/nobody", Some(json!({"age": 1})))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["errors"][0]["code"], "not.found");
}

#[tokio::test]
async fn test_delete_is_soft_and_idempotent() {
    let ctx = TestContext::new().await;
    ctx.create_person("p1", "Ada", 36).await;

    let deleted = ctx.send(Method::DELETE, "/persons/p1", None).await;
    assert_eq!(deleted.status, StatusCode::OK);

    let gone = ctx.get("/persons/p1").await;
    assert_eq!(gone.status, StatusCode::GONE);
    assert_eq!(gone.json()["errors"][0]["code"], "resource.gone");

    let writes = ctx.writes();
    let again = ctx.send(Method::DELETE, "/persons/p1", None).await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(ctx.writes(), writes);

    let missing = ctx.send(Method::DELETE, "/persons/nobody", None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    // A deleted key cannot be recreated.
    let recreate = ctx.put("/persons/p1", json!({"firstname": "Ada"})).await;
    assert_eq!(recreate.status, StatusCode::GONE);
}

#[tokio::test]
async fn test_unknown_route_never_touches_the_database() {
    let ctx = TestContext::new().await;

    let response = ctx.get("/nowhere/1").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["errors"][0]["code"], "no.matching.route");
    assert_eq!(ctx.acquisitions(), 0);
}

#[tokio::test]
async fn test_invalid_json_body() {
    let ctx = TestContext::new().await;

    let response = ctx
        .send_raw(Method::PUT, "/persons/p1", Body::from("{not json"))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["errors"][0]["code"], "body.invalid");
    assert_eq!(ctx.acquisitions(), 0);
}

#[tokio::test]
async fn test_restricted_methods() {
    let ctx = TestContext::with(test_config(), |builder| {
        let mut definition = ResourceDefinition::new("/countries", "countries");
        definition.methods = Some(vec!["GET".to_string()]);
        builder.resource(sri_core::Resource::builder(definition))
    })
    .await;

    let response = ctx.put("/countries/be", json!({"name": "Belgium"})).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(ctx.get("/countries").await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_before_insert_hook_can_reject() {
    let ctx = TestContext::with(test_config(), |builder| {
        builder.resource(persons().hook(Stage::BeforeInsert, |hook: HookContext| {
            async move {
                let young = hook.elements.iter().any(|e| {
                    e.incoming
                        .as_ref()
                        .and_then(|d| d["age"].as_i64())
                        .is_some_and(|age| age < 18)
                });
                if young {
                    Err(SriError::with_code(403, "too.young", "adults only"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }))
    })
    .await;

    let rejected = ctx
        .put("/persons/kid", json!({"firstname": "Kid", "age": 9}))
        .await;
    assert_eq!(rejected.status, StatusCode::FORBIDDEN);
    assert_eq!(rejected.json()["errors"][0]["code"], "too.young");
    assert_eq!(ctx.writes(), 0);

    ctx.create_person("adult", "Ada", 36).await;
}

#[tokio::test]
async fn test_after_read_hook_sees_stored_document() {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let ctx = TestContext::with(test_config(), move |builder| {
        builder.resource(persons().hook(Stage::AfterRead, move |hook: HookContext| {
            let recorder = recorder.clone();
            async move {
                for element in &hook.elements {
                    recorder.lock().unwrap().push(element.permalink.clone());
                    assert!(element.stored.is_some());
                }
                Ok::<_, SriError>(())
            }
            .boxed()
        }))
    })
    .await;
    ctx.create_person("p1", "Ada", 36).await;

    assert_eq!(ctx.get("/persons/p1").await.status, StatusCode::OK);
    assert_eq!(*seen.lock().unwrap(), vec!["/persons/p1".to_string()]);
}
