//! HTTP surface: admin endpoints and the enforcement middleware.

use crate::admin::{AdminError, AdminService, ExportFormat, SettingsUpdate};
use crate::enforcement::{Decision, Denial, Enforcer, Principal, RequestContext};
use crate::model::ThreatType;
use crate::store::{ListQuery, SortField, SortOrder, DEFAULT_PAGE_SIZE};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::error;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
    pub enforcer: Arc<Enforcer>,
}

/// Admin and health routes, protected by the enforcement middleware.
pub fn app(state: AppState) -> Router {
    let enforcer = Arc::clone(&state.enforcer);
    with_enforcement(admin_router(state), enforcer)
}

/// Admin and health routes without enforcement.
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/threat-blocker/status", get(status))
        .route("/api/threat-blocker/stats", get(stats))
        .route("/api/threat-blocker/blocklist", get(list_blocklist))
        .route("/api/threat-blocker/blocklist/:ip", delete(remove_entry))
        .route("/api/threat-blocker/update", post(trigger_update))
        .route(
            "/api/threat-blocker/settings",
            get(get_settings).put(update_settings),
        )
        .route("/api/threat-blocker/export", get(export))
        .with_state(state)
}

/// Run the enforcement check in front of every route of `router`.
pub fn with_enforcement<S>(router: Router<S>, enforcer: Arc<Enforcer>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(enforcer, enforce))
}

/// Flatten headers to one lowercase-keyed value each; the first value wins.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            flat.entry(name.as_str().to_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }
    flat
}

/// Build the enforcement context for a request.
///
/// The peer address comes from `ConnectInfo<SocketAddr>` and the principal
/// from a `Principal` extension set by an upstream authentication layer.
pub fn request_context(request: &Request) -> RequestContext {
    RequestContext {
        path: request.uri().path().to_string(),
        headers: flatten_headers(request.headers()),
        peer_addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
        principal: request.extensions().get::<Principal>().cloned(),
    }
}

/// Fixed response for a denied request.
pub fn denied_response(denial: &Denial) -> Response {
    (
        StatusCode::FORBIDDEN,
        [("x-threat-blocker-blocked", "true")],
        Json(json!({
            "success": false,
            "message": "Access denied: Your IP address has been flagged as a threat",
            "error": "IP_BLOCKED",
            "blockedIP": denial.ip.to_string(),
            "reason": denial.threat_type.as_str(),
        })),
    )
        .into_response()
}

async fn enforce(State(enforcer): State<Arc<Enforcer>>, request: Request, next: Next) -> Response {
    let ctx = request_context(&request);
    match enforcer.check(&ctx).await {
        Decision::Allow(_) => next.run(request).await,
        Decision::Deny(denial) => denied_response(&denial),
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminError::InvalidCadence(_)
            | AdminError::InvalidFormat(_)
            | AdminError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            AdminError::Store(ref e) => {
                error!(error = %e, "Blocklist store error in admin request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(json!({ "success": false, "message": self.to_string() })),
        )
            .into_response()
    }
}

fn ok<T: serde::Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AdminError> {
    Ok(ok(state.admin.status().await?))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AdminError> {
    Ok(ok(state.admin.stats().await?))
}

/// Query string of the listing endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    page: Option<usize>,
    limit: Option<usize>,
    search: Option<String>,
    threat_type: Option<String>,
    source: Option<String>,
    sort_by: Option<SortField>,
    sort_order: Option<SortOrder>,
}

/// `None` for absent, empty or `all`.
fn filter_value(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
}

impl TryFrom<ListParams> for ListQuery {
    type Error = AdminError;

    fn try_from(params: ListParams) -> Result<Self, Self::Error> {
        let threat_type = filter_value(params.threat_type)
            .map(|t| {
                t.parse::<ThreatType>()
                    .map_err(|e| AdminError::InvalidQuery(e.to_string()))
            })
            .transpose()?;

        Ok(ListQuery {
            search: params.search.filter(|s| !s.is_empty()),
            threat_type,
            source: filter_value(params.source),
            sort_by: params.sort_by.unwrap_or_default(),
            order: params.sort_order.unwrap_or_default(),
            page: params.page.unwrap_or(1),
            limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        })
    }
}

async fn list_blocklist(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let query = ListQuery::try_from(params)?;
    let (page, limit) = query.bounds();
    let query = ListQuery {
        page,
        limit,
        ..query
    };
    Ok(ok(state.admin.list(&query).await?))
}

async fn remove_entry(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let ip: IpAddr = crate::classify::parse_ip(&ip)
        .ok_or_else(|| AdminError::InvalidQuery(format!("invalid IP address '{}'", ip)))?;
    let removed = state.admin.remove(&[ip]).await?;
    Ok(ok(json!({ "removed": removed })))
}

async fn trigger_update(State(state): State<AppState>) -> Response {
    match state.admin.trigger_refresh().await {
        Some(outcome) => ok(outcome).into_response(),
        None => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "message": "Blocklist update already in progress",
            })),
        )
            .into_response(),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<serde_json::Value> {
    ok(state.admin.settings())
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<serde_json::Value>, AdminError> {
    Ok(ok(state.admin.update_settings(update)?))
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    format: Option<String>,
}

async fn export(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, AdminError> {
    let format = match params.format {
        Some(format) => format.parse()?,
        None => ExportFormat::default(),
    };
    let export = state.admin.export(format).await?;
    let disposition = format!("attachment; filename={}", export.file_name());

    Ok((
        [
            (header::CONTENT_TYPE, export.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export.body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_flatten_headers_keeps_first() {
        let mut headers = HeaderMap::new();
        headers.append("X-Forwarded-For", "203.0.113.9".parse().unwrap());
        headers.append("X-Forwarded-For", "198.51.100.1".parse().unwrap());

        let flat = flatten_headers(&headers);
        assert_eq!(flat.get("x-forwarded-for").map(String::as_str), Some("203.0.113.9"));
    }

    #[test]
    fn test_request_context() {
        let mut request = axum::http::Request::builder()
            .uri("/api/orders?id=1")
            .header("X-Real-IP", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 1], 4000))));
        request.extensions_mut().insert(Principal {
            user_id: "user-1".to_string(),
        });

        let ctx = request_context(&request);
        assert_eq!(ctx.path, "/api/orders");
        assert_eq!(ctx.headers.get("x-real-ip").map(String::as_str), Some("203.0.113.9"));
        assert_eq!(ctx.peer_addr, Some("198.51.100.1".parse().unwrap()));
        assert_eq!(ctx.principal.map(|p| p.user_id), Some("user-1".to_string()));
    }

    #[test]
    fn test_list_params_all_means_no_filter() {
        let params = ListParams {
            threat_type: Some("all".to_string()),
            source: Some("all".to_string()),
            ..ListParams::default()
        };
        let query = ListQuery::try_from(params).unwrap();
        assert_eq!(query, ListQuery::default());

        let params = ListParams {
            threat_type: Some("Brute Force".to_string()),
            ..ListParams::default()
        };
        let query = ListQuery::try_from(params).unwrap();
        assert_eq!(query.threat_type, Some(ThreatType::BruteForce));

        let params = ListParams {
            threat_type: Some("worm".to_string()),
            ..ListParams::default()
        };
        assert!(ListQuery::try_from(params).is_err());
    }
}
