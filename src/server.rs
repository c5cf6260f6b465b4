use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::ScriptService;
use crate::error::{AppError, AppResult};
use crate::model::ScriptRecord;
use crate::security::UserContext;

/// Header carrying the authenticated user, set by the fronting gateway.
pub const USER_HEADER: &str = "x-user-id";
/// Comma-separated roles of that user.
pub const ROLES_HEADER: &str = "x-user-roles";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = self.to_error_response();
        let status =
            StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            debug!(error = %self, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}

/// Caller identity as asserted by the gateway; guest when absent.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserContext);

impl CurrentUser {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user = match header(USER_HEADER) {
            Some(user_id) => {
                let roles = header(ROLES_HEADER)
                    .map(|roles| {
                        roles
                            .split(',')
                            .map(str::trim)
                            .filter(|r| !r.is_empty())
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                UserContext::with_roles(user_id, roles)
            }
            None => UserContext::guest(),
        };
        CurrentUser(user)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

type SharedService = Arc<ScriptService>;

async fn blocking<T, F>(work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::internal(format!("task error: {}", e)))?
}

fn form_dict(query: HashMap<String, String>) -> Map<String, Value> {
    query.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn call_method_get(
    State(service): State<SharedService>,
    CurrentUser(user): CurrentUser,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Json<Value>> {
    let flags = blocking(move || {
        service
            .dispatcher
            .run_api_method(&method, &user, form_dict(query))
    })
    .await?;
    Ok(Json(Value::Object(flags)))
}

/// Query parameters, overlaid by a JSON object body when one is sent.
async fn call_method_post(
    State(service): State<SharedService>,
    CurrentUser(user): CurrentUser,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let mut params = form_dict(query);
    if !body.is_empty() {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(fields)) => params.extend(fields),
            Ok(_) => return Err(AppError::validation("request body must be a JSON object")),
            Err(e) => return Err(AppError::validation(format!("invalid JSON body: {}", e))),
        }
    }

    let flags =
        blocking(move || service.dispatcher.run_api_method(&method, &user, params)).await?;
    Ok(Json(Value::Object(flags)))
}

async fn list_scripts(
    State(service): State<SharedService>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<ScriptRecord>>> {
    let scripts = blocking(move || service.lifecycle.list(&user)).await?;
    Ok(Json(scripts))
}

async fn get_script(
    State(service): State<SharedService>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> AppResult<Json<ScriptRecord>> {
    let record = blocking(move || service.lifecycle.get(&user, &name)).await?;
    Ok(Json(record))
}

async fn put_script(
    State(service): State<SharedService>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
    Json(mut record): Json<ScriptRecord>,
) -> AppResult<Response> {
    record.name = name;
    let report = blocking(move || service.lifecycle.save(&user, record)).await?;
    let status = if report.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)).into_response())
}

async fn delete_script(
    State(service): State<SharedService>,
    CurrentUser(user): CurrentUser,
    Path(name): Path<String>,
) -> AppResult<StatusCode> {
    blocking(move || service.lifecycle.delete(&user, &name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(service: SharedService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/method/{method}",
            get(call_method_get).post(call_method_post),
        )
        .route("/api/scripts", get(list_scripts))
        .route(
            "/api/scripts/{name}",
            get(get_script).put(put_script).delete(delete_script),
        )
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_missing_headers_mean_guest() {
        let CurrentUser(user) = CurrentUser::from_headers(&HeaderMap::new());
        assert!(user.is_guest());
    }

    #[test]
    fn test_roles_header_is_split() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("bob"));
        headers.insert(ROLES_HEADER, HeaderValue::from_static(" Sales , Script Manager,"));

        let CurrentUser(user) = CurrentUser::from_headers(&headers);
        assert_eq!(user.current_user(), "bob");
        assert_eq!(user.roles, vec!["Sales".to_string(), "Script Manager".to_string()]);
        assert!(user.has_capability(crate::security::Capability::ManageScripts));
    }

    #[test]
    fn test_error_status_mapping() {
        let response = AppError::permission("guest").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = AppError::Timeout {
            script: "s".into(),
            timeout_ms: 5,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
