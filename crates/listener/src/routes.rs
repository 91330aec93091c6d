//! HTTP surface of the listener
//!
//! Just enough of the federation protocol to act as a peer:
//! - `GET /.well-known/webfinger?resource=...`
//! - `GET /actors/:name`
//! - `POST /actors/:name/inbox`
//! - `GET /health`

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use feditest_common::uri;

use crate::identity::{ACTIVITY_JSON, JRD_JSON};
use crate::inbox::{Inbox, InboundMessage};

/// Build the listener router
pub fn router(inbox: Arc<Inbox>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/.well-known/webfinger", get(webfinger_handler))
        .route("/actors/:name", get(actor_handler))
        .route("/actors/:name/inbox", post(inbox_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(inbox)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

async fn health_handler(State(inbox): State<Arc<Inbox>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "feditest-listener",
        "version": feditest_common::VERSION,
        "partitions": inbox.partition_count(),
    }))
}

async fn webfinger_handler(
    State(inbox): State<Arc<Inbox>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let resource = match params.get("resource") {
        Some(r) if !r.is_empty() => r,
        _ => return error_response(StatusCode::BAD_REQUEST, "missing resource parameter"),
    };
    if uri::AcctUri::parse(resource).is_none() && uri::http_https_uri(resource).is_none() {
        return error_response(StatusCode::BAD_REQUEST, format!("malformed resource: {}", resource));
    }

    match inbox.find_identity(resource) {
        Some(identity) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, JRD_JSON)],
            identity.jrd().to_string(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown resource: {}", resource)),
    }
}

async fn actor_handler(State(inbox): State<Arc<Inbox>>, Path(name): Path<String>) -> Response {
    match inbox.identity(&name) {
        Some(identity) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, ACTIVITY_JSON)],
            identity.actor_document().to_string(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown actor: {}", name)),
    }
}

async fn inbox_handler(
    State(inbox): State<Arc<Inbox>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    if inbox.identity(&name).is_none() {
        inbox.reject(Some(&name), "unknown recipient");
        return error_response(StatusCode::NOT_FOUND, format!("unknown actor: {}", name));
    }

    let message = match InboundMessage::parse(&name, &body) {
        Ok(m) => m,
        Err(e) => {
            inbox.reject(Some(&name), e.to_string());
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match inbox.deliver(message) {
        Ok(delivery) => {
            debug!(recipient = %name, ?delivery, "Accepted inbound message");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            inbox.reject(Some(&name), e.to_string());
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
    }
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use feditest_common::ListenerConfig;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use url::Url;

    fn inbox() -> Arc<Inbox> {
        Inbox::new(
            &ListenerConfig::default(),
            Url::parse("http://listener.test:8080").unwrap(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_webfinger_known_identity() {
        let inbox = inbox();
        let run = inbox.partition("run-1", CancellationToken::new());
        let alice = run.create_identity("alice");

        let uri = format!("/.well-known/webfinger?resource={}", alice.acct);
        let response = router(inbox.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], JRD_JSON);
        let jrd = body_json(response).await;
        assert_eq!(jrd["links"][0]["href"], alice.actor_uri.as_str());
    }

    #[tokio::test]
    async fn test_webfinger_bad_requests() {
        let inbox = inbox();
        let app = router(inbox);

        let missing = app
            .clone()
            .oneshot(Request::get("/.well-known/webfinger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let malformed = app
            .clone()
            .oneshot(
                Request::get("/.well-known/webfinger?resource=nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let unknown = app
            .oneshot(
                Request::get("/.well-known/webfinger?resource=acct:ghost@listener.test:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_inbox_post_outcomes() {
        let inbox = inbox();
        let run = inbox.partition("run-1", CancellationToken::new());
        let alice = run.create_identity("alice");
        let app = router(inbox.clone());
        let path = format!("/actors/{}/inbox", alice.name);

        let accepted = app
            .clone()
            .oneshot(
                Request::post(&path)
                    .header(header::CONTENT_TYPE, ACTIVITY_JSON)
                    .body(Body::from(r#"{"type":"Follow","actor":"https://x.example/u/1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        assert_eq!(run.received().len(), 1);

        let malformed = app
            .clone()
            .oneshot(Request::post(&path).body(Body::from("{oops")).unwrap())
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let unknown = app
            .oneshot(
                Request::post("/actors/ghost/inbox")
                    .body(Body::from(r#"{"type":"Follow"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        assert_eq!(inbox.rejected().len(), 2);
        assert_eq!(run.received().len(), 1);
    }
}
