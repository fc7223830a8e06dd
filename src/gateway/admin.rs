//! # Allow-list Management Surface
//!
//! REST endpoints for a principal to manage their own IP allow-list
//! entries. The router is mounted by the application inside its
//! authenticated subtree; handlers read the principal marker from request
//! extensions and never accept a principal id from the request itself.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::allowlist::{AllowedIpPatch, AllowedIpStore};
use crate::core::error::{SecurityError, SecurityResult};
use crate::core::types::PrincipalContext;

/// Body for creating an allow-list entry
#[derive(Debug, Deserialize)]
pub struct AddEntryRequest {
    pub ip_address: String,
    pub description: Option<String>,
}

/// Build the management router
///
/// Routes:
/// - `GET    /`       list the caller's entries
/// - `POST   /`       add an entry
/// - `GET    /stats`  usage statistics
/// - `PATCH  /:id`    update an entry
/// - `DELETE /:id`    remove an entry
pub fn allowlist_admin_router(store: Arc<AllowedIpStore>) -> Router {
    Router::new()
        .route("/", get(list_entries).post(add_entry))
        .route("/stats", get(entry_stats))
        .route("/:id", axum::routing::patch(update_entry).delete(remove_entry))
        .with_state(store)
}

fn require_principal(principal: Option<Extension<PrincipalContext>>) -> SecurityResult<String> {
    principal
        .map(|Extension(p)| p.principal_id)
        .ok_or_else(|| SecurityError::access_denied("authentication required"))
}

async fn list_entries(
    State(store): State<Arc<AllowedIpStore>>,
    principal: Option<Extension<PrincipalContext>>,
) -> Result<Response, SecurityError> {
    let principal_id = require_principal(principal)?;
    let entries = store.list(&principal_id).await;
    Ok(Json(entries).into_response())
}

async fn add_entry(
    State(store): State<Arc<AllowedIpStore>>,
    principal: Option<Extension<PrincipalContext>>,
    Json(body): Json<AddEntryRequest>,
) -> Result<Response, SecurityError> {
    let principal_id = require_principal(principal)?;
    let entry = store
        .add(&principal_id, &body.ip_address, body.description)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn entry_stats(
    State(store): State<Arc<AllowedIpStore>>,
    principal: Option<Extension<PrincipalContext>>,
) -> Result<Response, SecurityError> {
    let principal_id = require_principal(principal)?;
    let stats = store.stats(&principal_id).await;
    Ok(Json(stats).into_response())
}

async fn update_entry(
    State(store): State<Arc<AllowedIpStore>>,
    principal: Option<Extension<PrincipalContext>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<AllowedIpPatch>,
) -> Result<Response, SecurityError> {
    let principal_id = require_principal(principal)?;
    let entry = store.update(id, &principal_id, patch).await?;
    Ok(Json(entry).into_response())
}

async fn remove_entry(
    State(store): State<Arc<AllowedIpStore>>,
    principal: Option<Extension<PrincipalContext>>,
    Path(id): Path<Uuid>,
) -> Result<Response, SecurityError> {
    let principal_id = require_principal(principal)?;
    store.remove(id, &principal_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn router() -> Router {
        allowlist_admin_router(Arc::new(AllowedIpStore::new(None)))
    }

    /// Stand-in for the application's auth middleware
    async fn with_principal(
        mut request: Request<Body>,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request
            .extensions_mut()
            .insert(PrincipalContext::new("user-1"));
        next.run(request).await
    }

    fn authed_router() -> Router {
        router().layer(axum::middleware::from_fn(with_principal))
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let app = authed_router();

        let response = app
            .clone()
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"ip_address":"203.0.113.1","description":"office"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let entries: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["ip_address"], "203.0.113.1");
    }

    #[tokio::test]
    async fn test_invalid_address_returns_400() {
        let app = authed_router();
        let response = app
            .oneshot(
                Request::post("/")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"ip_address":"127.0.0.1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_returns_409() {
        let app = authed_router();
        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/")
                        .header("content-type", "application/json")
                        .body(Body::from(r#"{"ip_address":"203.0.113.1"}"#))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_missing_principal_rejected() {
        let app = router();
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_entry_returns_404() {
        let app = authed_router();
        let response = app
            .oneshot(
                Request::delete(format!("/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
