//! Axum JSON API: sync trigger, lead listing, health.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadpipe_core::{BusinessDirectory, Lead, LeadStatus, LeadStore};
use leadpipe_sync::{RecordFailure, SyncError, SyncPipeline, SyncSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadpipe-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    /// Static bearer token guarding every endpoint except health. Leaving
    /// it unset disables caller auth, for local development only.
    pub api_token: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("LEADPIPE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            api_token: std::env::var("LEADPIPE_API_TOKEN").ok(),
        }
    }
}

pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub leads: Arc<dyn LeadStore>,
    pub businesses: Arc<dyn BusinessDirectory>,
    pub api_token: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/businesses/{id}/sync/hubspot", post(sync_handler))
        .route("/businesses/{id}/leads", get(leads_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> std::io::Result<()> {
    if state.api_token.is_none() {
        warn!("LEADPIPE_API_TOKEN unset; api auth is disabled");
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await
}

enum ApiError {
    Unauthenticated(&'static str),
    Sync(SyncError),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::Unauthenticated(reason) => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                reason.to_string(),
            ),
            ApiError::Sync(err) => {
                let status = match &err {
                    SyncError::BusinessNotFound(_) => StatusCode::NOT_FOUND,
                    SyncError::NotConnected { .. } => StatusCode::UNAUTHORIZED,
                    SyncError::Remote(_) => StatusCode::BAD_GATEWAY,
                    SyncError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "sync request failed");
                }
                (status, "sync_failed", err.to_string())
            }
        };
        let body = Json(serde_json::json!({ "error": error, "details": details }));
        (status, body).into_response()
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ApiError::Unauthenticated("invalid api token")),
        None => Err(ApiError::Unauthenticated("missing bearer token")),
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    success: bool,
    run_id: Uuid,
    synced_contacts: usize,
    synced_deals: usize,
    total_synced: usize,
    skipped: usize,
    failures: Vec<RecordFailure>,
}

impl From<SyncSummary> for SyncResponse {
    fn from(summary: SyncSummary) -> Self {
        Self {
            success: true,
            run_id: summary.run_id,
            synced_contacts: summary.synced_contacts,
            synced_deals: summary.synced_deals,
            total_synced: summary.total_synced(),
            skipped: summary.skipped_contacts + summary.skipped_deals,
            failures: summary.failures,
        }
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SyncResponse>, ApiError> {
    authenticate(&state, &headers)?;
    let summary = state.pipeline.run(business_id).await?;
    Ok(Json(summary.into()))
}

#[derive(Debug, Deserialize, Default)]
struct LeadsQuery {
    status: Option<LeadStatus>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LeadsResponse {
    leads: Vec<Lead>,
    page: i64,
    per_page: i64,
}

async fn leads_handler(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<Uuid>,
    Query(query): Query<LeadsQuery>,
    headers: HeaderMap,
) -> Result<Json<LeadsResponse>, ApiError> {
    authenticate(&state, &headers)?;

    state
        .businesses
        .find(business_id)
        .await
        .map_err(SyncError::from)?
        .ok_or(SyncError::BusinessNotFound(business_id))?;

    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * per_page;

    let leads = state
        .leads
        .list(business_id, query.status, per_page, offset)
        .await
        .map_err(SyncError::from)?;

    Ok(Json(LeadsResponse {
        leads,
        page,
        per_page,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use leadpipe_core::{
        Business, CredentialSource, CrmApi, CrmConnection, ExternalContact, ExternalDeal,
        LeadSource, NewLead, RemoteApiError, RotatedTokens, StoreError,
    };
    use leadpipe_sync::SyncConfig;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct MemoryLeadStore {
        leads: Mutex<Vec<Lead>>,
    }

    #[async_trait]
    impl LeadStore for MemoryLeadStore {
        async fn email_exists(&self, business_id: Uuid, email: &str) -> Result<bool, StoreError> {
            Ok(self
                .leads
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.business_id == business_id && l.email.as_deref() == Some(email)))
        }

        async fn external_ref_exists(
            &self,
            business_id: Uuid,
            source: LeadSource,
            external_ref: &str,
        ) -> Result<bool, StoreError> {
            Ok(self.leads.lock().unwrap().iter().any(|l| {
                l.business_id == business_id
                    && l.source == source
                    && l.external_ref.as_deref() == Some(external_ref)
            }))
        }

        async fn insert(&self, lead: &NewLead) -> Result<Lead, StoreError> {
            let now = Utc::now();
            let row = Lead {
                id: Uuid::new_v4(),
                business_id: lead.business_id,
                kind: lead.kind,
                display_name: lead.display_name.clone(),
                company: lead.company.clone(),
                email: lead.email.clone(),
                phone: lead.phone.clone(),
                status: lead.status,
                notes: lead.notes.clone(),
                deal_size: lead.deal_size,
                external_ref: lead.external_ref.clone(),
                source: lead.source,
                created_at: now,
                updated_at: now,
            };
            self.leads.lock().unwrap().push(row.clone());
            Ok(row)
        }

        async fn list(
            &self,
            business_id: Uuid,
            status: Option<LeadStatus>,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<Lead>, StoreError> {
            Ok(self
                .leads
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.business_id == business_id)
                .filter(|l| status.map_or(true, |s| l.status == s))
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    struct OneBusiness(Business);

    #[async_trait]
    impl BusinessDirectory for OneBusiness {
        async fn find(&self, business_id: Uuid) -> Result<Option<Business>, StoreError> {
            Ok((self.0.id == business_id).then(|| self.0.clone()))
        }
    }

    struct StaticCredentials(Uuid);

    #[async_trait]
    impl CredentialSource for StaticCredentials {
        async fn connection(
            &self,
            business_id: Uuid,
            provider: &str,
        ) -> Result<Option<CrmConnection>, StoreError> {
            Ok((self.0 == business_id).then(|| CrmConnection {
                business_id,
                provider: provider.to_string(),
                access_token: "token".into(),
                refresh_token: None,
                expires_at: None,
            }))
        }

        async fn update_tokens(
            &self,
            _business_id: Uuid,
            _provider: &str,
            _rotated: &RotatedTokens,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct FakeCrm;

    #[async_trait]
    impl CrmApi for FakeCrm {
        async fn fetch_contacts(
            &self,
            _access_token: &str,
        ) -> Result<Vec<ExternalContact>, RemoteApiError> {
            Ok(vec![ExternalContact {
                id: "c1".into(),
                first_name: Some("Ada".into()),
                last_name: None,
                email: Some("ada@example.com".into()),
                phone: None,
                company: None,
                lifecycle_stage: Some("customer".into()),
            }])
        }

        async fn fetch_deals(
            &self,
            _access_token: &str,
        ) -> Result<Vec<ExternalDeal>, RemoteApiError> {
            Ok(vec![ExternalDeal {
                id: "d1".into(),
                name: Some("Pilot".into()),
                amount: Some(500.0),
                deal_stage: Some("meeting booked".into()),
                close_date: None,
                pipeline: None,
            }])
        }

        async fn refresh_tokens(
            &self,
            _refresh_token: &str,
        ) -> Result<RotatedTokens, RemoteApiError> {
            Err(RemoteApiError::transport("refresh not expected in tests"))
        }
    }

    fn test_state(business_id: Uuid, api_token: Option<&str>) -> AppState {
        let leads: Arc<dyn LeadStore> = Arc::new(MemoryLeadStore {
            leads: Mutex::new(Vec::new()),
        });
        let businesses: Arc<dyn BusinessDirectory> = Arc::new(OneBusiness(Business {
            id: business_id,
            name: "Testco".into(),
            created_at: Utc::now(),
        }));
        let pipeline = Arc::new(SyncPipeline::new(
            leads.clone(),
            businesses.clone(),
            Arc::new(StaticCredentials(business_id)),
            Arc::new(FakeCrm),
            "hubspot",
            SyncConfig::default(),
        ));
        AppState {
            pipeline,
            leads,
            businesses,
            api_token: api_token.map(Into::into),
        }
    }

    fn sync_request(business_id: Uuid, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(format!("/businesses/{business_id}/sync/hubspot"));
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let app = app(test_state(Uuid::new_v4(), Some("secret")));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_without_token_is_unauthorized() {
        let business_id = Uuid::new_v4();
        let app = app(test_state(business_id, Some("secret")));
        let resp = app.oneshot(sync_request(business_id, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = json_body(resp).await;
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn sync_with_wrong_token_is_unauthorized() {
        let business_id = Uuid::new_v4();
        let app = app(test_state(business_id, Some("secret")));
        let resp = app
            .oneshot(sync_request(business_id, Some("nope")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sync_unknown_business_is_not_found() {
        let app = app(test_state(Uuid::new_v4(), Some("secret")));
        let resp = app
            .oneshot(sync_request(Uuid::new_v4(), Some("secret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_happy_path_reports_counts() {
        let business_id = Uuid::new_v4();
        let app = app(test_state(business_id, Some("secret")));
        let resp = app
            .oneshot(sync_request(business_id, Some("secret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["synced_contacts"], 1);
        assert_eq!(body["synced_deals"], 1);
        assert_eq!(body["total_synced"], 2);
        assert_eq!(body["failures"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn leads_listing_reflects_synced_rows() {
        let business_id = Uuid::new_v4();
        let state = test_state(business_id, Some("secret"));
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(sync_request(business_id, Some("secret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/businesses/{business_id}/leads?status=closed_won"))
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        let leads = body["leads"].as_array().unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0]["email"], "ada@example.com");
        assert_eq!(leads[0]["status"], "closed_won");
    }
}
