// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streaming batches and streaming lists.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use futures::FutureExt;
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use common::*;
use sri_core::{CustomRoute, RouteContext, SriError, SriResponse};

#[tokio::test]
async fn test_streaming_batch_envelope_and_trailers() {
    let ctx = TestContext::new().await;

    let response = ctx
        .batch(
            "/batch_streaming",
            json!([
                {"href": "/persons/a", "verb": "PUT", "body": {"firstname": "Ada"}},
                {"href": "/cities/ghent", "verb": "PUT", "body": {"name": "Ghent"}},
            ]),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("trailer"), Some("server-timing"));
    assert_eq!(response.header("content-type"), Some("application/json"));

    let body = response.json();
    assert_eq!(body["status"], 200);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["status"], 201);
    assert_eq!(results[1]["href"], "/cities/ghent");

    let trailers = response.trailers.as_ref().expect("server-timing trailer");
    let timing = trailers["server-timing"].to_str().unwrap();
    assert!(timing.contains("db-commit"), "{}", timing);

    assert_eq!(ctx.commits(), 1);
    assert_eq!(ctx.get("/cities/ghent").await.status, StatusCode::OK);
}

#[tokio::test]
async fn test_streaming_batch_reports_failure_in_body() {
    let ctx = TestContext::new().await;

    let response = ctx
        .batch(
            "/persons/batch_streaming",
            json!([
                {"href": "/persons/a", "verb": "PUT", "body": {"firstname": "Ada"}},
                {"href": "/persons/b", "verb": "PUT", "body": {"age": 4}},
            ]),
        )
        .await;
    // The status line went out before the items ran.
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["status"], 409);
    assert_eq!(body["results"][1]["status"], 409);
    assert_eq!(ctx.commits(), 0);
    assert_eq!(ctx.rollbacks(), 1);
}

#[tokio::test]
async fn test_streaming_batch_validation_errors_are_not_streamed() {
    let ctx = TestContext::new().await;

    let response = ctx
        .batch("/batch_streaming", json!([{"href": "/nowhere", "verb": "GET"}]))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(response.header("trailer").is_none());
    assert_eq!(ctx.acquisitions(), 0);
}

#[tokio::test]
async fn test_streaming_list() {
    let ctx = TestContext::new().await;
    for city in ["antwerp", "brussels", "ghent"] {
        let created = ctx
            .put(&format!("/cities/{}", city), json!({"name": city}))
            .await;
        assert_eq!(created.status, StatusCode::CREATED, "{}", created.text);
    }

    let response = ctx.get("/cities?limit=2&$$includeCount=true").await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    let body = response.json();
    assert_eq!(body["$$meta"]["count"], 3);
    assert!(body["$$meta"]["next"].as_str().unwrap().contains("offset=2"));
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["href"], "/cities/antwerp");
    assert_eq!(results[1]["$$expanded"]["name"], "brussels");
    assert!(response.trailers.is_some());
}

#[tokio::test]
async fn test_streaming_list_inside_batch_is_buffered() {
    let ctx = TestContext::new().await;
    let created = ctx.put("/cities/ghent", json!({"name": "Ghent"})).await;
    assert_eq!(created.status, StatusCode::CREATED);

    let response = ctx
        .batch("/batch", json!([{"href": "/cities", "verb": "GET"}]))
        .await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text);
    assert_eq!(
        response.json()[0]["body"]["results"][0]["href"],
        "/cities/ghent"
    );
}

async fn import_then_fail(ctx: RouteContext) -> sri_core::Result<SriResponse> {
    ctx.db
        .insert("persons", "imported", &json!({"firstname": "Ida"}))
        .await?;
    if let Some(stream) = ctx.stream() {
        stream.begin_results(None).await?;
        stream.push(&json!({"href": "/persons/imported"})).await?;
    }
    Err(SriError::with_code(409, "import.failed", "second row rejected").into())
}

#[tokio::test]
async fn test_failure_after_stream_started_rolls_back_and_aborts() {
    let ctx = TestContext::with(test_config(), |builder| {
        builder.resource(persons()).route(
            CustomRoute::new(Method::POST, "/persons/import", |ctx: RouteContext| {
                import_then_fail(ctx).boxed()
            })
            .streaming(),
        )
    })
    .await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/persons/import")
        .body(Body::empty())
        .unwrap();
    let response = sri_core::server::router(ctx.api.clone())
        .oneshot(request)
        .await
        .unwrap();
    // The head went out with the first element.
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut text = String::new();
    let mut aborted = false;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    text.push_str(std::str::from_utf8(&data).unwrap());
                }
            }
            Err(_) => {
                aborted = true;
                break;
            }
        }
    }

    assert!(aborted, "body ended cleanly: {}", text);
    assert!(text.starts_with("{\"results\":["), "{}", text);
    assert!(text.contains("import.failed"), "{}", text);
    assert!(serde_json::from_str::<serde_json::Value>(&text).is_err());
    assert_eq!(ctx.commits(), 0);
    assert_eq!(ctx.rollbacks(), 1);
    assert_eq!(ctx.get("/persons/imported").await.status, StatusCode::NOT_FOUND);
}
