//! HubSpot CRM v3 client: paginated object fetch + OAuth token refresh.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use leadpipe_core::{CrmApi, ExternalContact, ExternalDeal, RemoteApiError, RotatedTokens};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

pub const CRATE_NAME: &str = "leadpipe-hubspot";

pub const PROVIDER: &str = "hubspot";

const CONTACT_PROPERTIES: &[&str] = &[
    "firstname",
    "lastname",
    "email",
    "phone",
    "company",
    "lifecyclestage",
];

const DEAL_PROPERTIES: &[&str] = &["dealname", "amount", "dealstage", "closedate", "pipeline"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HubSpotConfig {
    pub base_url: String,
    pub page_size: u32,
    /// Hard cap on pages fetched per collection; hitting it is logged and
    /// the partial collection is returned.
    pub max_pages: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// OAuth app credentials, required only for token refresh.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hubapi.com".to_string(),
            page_size: 100,
            max_pages: 50,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            client_id: None,
            client_secret: None,
        }
    }
}

impl HubSpotConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("HUBSPOT_BASE_URL").unwrap_or(defaults.base_url),
            page_size: std::env::var("HUBSPOT_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            max_pages: std::env::var("HUBSPOT_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_pages),
            timeout: std::env::var("HUBSPOT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff: defaults.backoff,
            client_id: std::env::var("HUBSPOT_CLIENT_ID").ok(),
            client_secret: std::env::var("HUBSPOT_CLIENT_SECRET").ok(),
        }
    }
}

/// Raw CRM object as the v3 objects API returns it: an id plus a flat
/// string-valued property map.
#[derive(Debug, Clone, Deserialize)]
pub struct CrmObject {
    pub id: String,
    #[serde(default)]
    pub properties: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ObjectPage {
    #[serde(default)]
    results: Vec<CrmObject>,
    paging: Option<Paging>,
}

#[derive(Debug, Clone, Deserialize)]
struct Paging {
    next: Option<PagingNext>,
}

#[derive(Debug, Clone, Deserialize)]
struct PagingNext {
    after: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

pub fn contact_from_object(object: &CrmObject) -> ExternalContact {
    ExternalContact {
        id: object.id.clone(),
        first_name: property(object, "firstname"),
        last_name: property(object, "lastname"),
        email: property(object, "email"),
        phone: property(object, "phone"),
        company: property(object, "company"),
        lifecycle_stage: property(object, "lifecyclestage"),
    }
}

pub fn deal_from_object(object: &CrmObject) -> ExternalDeal {
    ExternalDeal {
        id: object.id.clone(),
        name: property(object, "dealname"),
        amount: property(object, "amount").and_then(|raw| raw.parse().ok()),
        close_date: property(object, "closedate")
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        deal_stage: property(object, "dealstage"),
        pipeline: property(object, "pipeline"),
    }
}

fn property(object: &CrmObject, name: &str) -> Option<String> {
    object
        .properties
        .get(name)
        .and_then(|value| value.clone())
        .filter(|value| !value.is_empty())
}

#[derive(Debug)]
pub struct HubSpotClient {
    http: reqwest::Client,
    config: HubSpotConfig,
}

impl HubSpotClient {
    pub fn new(config: HubSpotConfig) -> Result<Self, RemoteApiError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .map_err(|err| RemoteApiError::transport(format!("building http client: {err}")))?;
        Ok(Self { http, config })
    }

    /// One GET against the objects endpoint with retry on retryable
    /// failures; non-2xx after retries surfaces the provider's message.
    async fn get_page(
        &self,
        access_token: &str,
        object_kind: &str,
        properties: &[&str],
        after: Option<&str>,
    ) -> Result<ObjectPage, RemoteApiError> {
        let url = format!("{}/crm/v3/objects/{object_kind}", self.config.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("limit", self.config.page_size.to_string()),
            ("properties", properties.join(",")),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }

        let mut last_err: Option<RemoteApiError> = None;
        for attempt in 0..=self.config.backoff.max_retries {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(access_token)
                .query(&query)
                .send()
                .await;

            match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<ObjectPage>().await.map_err(|err| {
                            RemoteApiError::transport(format!("decoding {object_kind} page: {err}"))
                        });
                    }

                    let message = resp.text().await.unwrap_or_default();
                    let err = RemoteApiError::status(status.as_u16(), message);
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_err = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    let wrapped = RemoteApiError::transport(err.to_string());
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_err = Some(wrapped);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(wrapped);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| RemoteApiError::transport("retry loop exhausted without error")))
    }

    async fn fetch_all(
        &self,
        access_token: &str,
        object_kind: &str,
        properties: &[&str],
    ) -> Result<Vec<CrmObject>, RemoteApiError> {
        collect_pages(object_kind, self.config.max_pages, |after| async move {
            self.get_page(access_token, object_kind, properties, after.as_deref())
                .await
        })
        .await
    }
}

/// Follow pagination cursors until exhausted or the page cap. Any page
/// failure discards prior pages (all-or-nothing per collection).
async fn collect_pages<F, Fut>(
    object_kind: &str,
    max_pages: u32,
    mut fetch: F,
) -> Result<Vec<CrmObject>, RemoteApiError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<ObjectPage, RemoteApiError>>,
{
    let mut objects = Vec::new();
    let mut after: Option<String> = None;

    for page_no in 0..max_pages {
        let page = fetch(after.take()).await?;
        objects.extend(page.results);

        match page.paging.and_then(|p| p.next) {
            Some(next) => after = Some(next.after),
            None => return Ok(objects),
        }

        if page_no + 1 == max_pages {
            warn!(
                object_kind,
                max_pages,
                fetched = objects.len(),
                "stopping pagination at configured page cap"
            );
        }
    }

    Ok(objects)
}

#[async_trait]
impl CrmApi for HubSpotClient {
    async fn fetch_contacts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ExternalContact>, RemoteApiError> {
        let objects = self
            .fetch_all(access_token, "contacts", CONTACT_PROPERTIES)
            .await?;
        Ok(objects.iter().map(contact_from_object).collect())
    }

    async fn fetch_deals(&self, access_token: &str) -> Result<Vec<ExternalDeal>, RemoteApiError> {
        let objects = self
            .fetch_all(access_token, "deals", DEAL_PROPERTIES)
            .await?;
        Ok(objects.iter().map(deal_from_object).collect())
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<RotatedTokens, RemoteApiError> {
        let (client_id, client_secret) = match (
            self.config.client_id.as_deref(),
            self.config.client_secret.as_deref(),
        ) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(RemoteApiError::transport(
                    "token refresh requires client_id and client_secret",
                ))
            }
        };

        let url = format!("{}/oauth/v1/token", self.config.base_url);
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ];

        let resp = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| RemoteApiError::transport(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RemoteApiError::status(status.as_u16(), message));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|err| RemoteApiError::transport(format!("decoding token response: {err}")))?;

        Ok(RotatedTokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        })
    }
}
