//! Postgres persistence for businesses, leads, and CRM connections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadpipe_core::{
    Business, BusinessDirectory, CredentialSource, CrmConnection, Lead, LeadKind, LeadSource,
    LeadStatus, LeadStore, NewLead, RotatedTokens, StoreError,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
pub use sqlx::PgPool;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadpipe-storage";

/// Connect a bounded pool; callers run migrations separately so read-only
/// consumers never race a schema change.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .map_err(store_error)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Backend(err.to_string()))
}

/// Dedup comparisons treat emails case-insensitively and ignore stray
/// whitespace the CRM occasionally leaves in.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn store_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Duplicate;
        }
    }
    StoreError::Backend(err.to_string())
}

fn parse_enum<T: FromStr>(raw: &str, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err| {
        warn!(column, raw, "rejecting row with unparseable enum column");
        StoreError::Backend(format!("bad {column} value {raw:?}: {err}"))
    })
}

fn lead_from_row(row: &sqlx::postgres::PgRow) -> Result<Lead, StoreError> {
    let kind: String = row.try_get("kind").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;
    let source: String = row.try_get("source").map_err(store_error)?;
    Ok(Lead {
        id: row.try_get("id").map_err(store_error)?,
        business_id: row.try_get("business_id").map_err(store_error)?,
        kind: parse_kind(&kind)?,
        display_name: row.try_get("display_name").map_err(store_error)?,
        company: row.try_get("company").map_err(store_error)?,
        email: row.try_get("email").map_err(store_error)?,
        phone: row.try_get("phone").map_err(store_error)?,
        status: parse_enum::<LeadStatus>(&status, "status")?,
        notes: row.try_get("notes").map_err(store_error)?,
        deal_size: row.try_get("deal_size").map_err(store_error)?,
        external_ref: row.try_get("external_ref").map_err(store_error)?,
        source: parse_source(&source)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
        updated_at: row.try_get("updated_at").map_err(store_error)?,
    })
}

fn parse_kind(raw: &str) -> Result<LeadKind, StoreError> {
    match raw {
        "customer" => Ok(LeadKind::Customer),
        "acquirer" => Ok(LeadKind::Acquirer),
        "investor" => Ok(LeadKind::Investor),
        other => Err(StoreError::Backend(format!("bad kind value {other:?}"))),
    }
}

fn parse_source(raw: &str) -> Result<LeadSource, StoreError> {
    match raw {
        "manual" => Ok(LeadSource::Manual),
        "hubspot_contact" => Ok(LeadSource::HubspotContact),
        "hubspot_deal" => Ok(LeadSource::HubspotDeal),
        other => Err(StoreError::Backend(format!("bad source value {other:?}"))),
    }
}

#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn email_exists(&self, business_id: Uuid, email: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM leads
                 WHERE business_id = $1
                   AND lower(email) = $2
            ) AS found
            "#,
        )
        .bind(business_id)
        .bind(normalize_email(email))
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        row.try_get("found").map_err(store_error)
    }

    async fn external_ref_exists(
        &self,
        business_id: Uuid,
        source: LeadSource,
        external_ref: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM leads
                 WHERE business_id = $1
                   AND source = $2
                   AND external_ref = $3
            ) AS found
            "#,
        )
        .bind(business_id)
        .bind(source.as_str())
        .bind(external_ref)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        row.try_get("found").map_err(store_error)
    }

    async fn insert(&self, lead: &NewLead) -> Result<Lead, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO leads (
                business_id, kind, display_name, company, email, phone,
                status, notes, deal_size, external_ref, source
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, business_id, kind, display_name, company, email,
                      phone, status, notes, deal_size, external_ref, source,
                      created_at, updated_at
            "#,
        )
        .bind(lead.business_id)
        .bind(lead.kind.as_str())
        .bind(&lead.display_name)
        .bind(&lead.company)
        .bind(lead.email.as_deref().map(normalize_email))
        .bind(&lead.phone)
        .bind(lead.status.as_str())
        .bind(&lead.notes)
        .bind(lead.deal_size)
        .bind(&lead.external_ref)
        .bind(lead.source.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        lead_from_row(&row)
    }

    async fn list(
        &self,
        business_id: Uuid,
        status: Option<LeadStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Lead>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, business_id, kind, display_name, company, email,
                   phone, status, notes, deal_size, external_ref, source,
                   created_at, updated_at
              FROM leads
             WHERE business_id = $1
               AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(business_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(lead_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgBusinessDirectory {
    pool: PgPool,
}

impl PgBusinessDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BusinessDirectory for PgBusinessDirectory {
    async fn find(&self, business_id: Uuid) -> Result<Option<Business>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, created_at
              FROM businesses
             WHERE id = $1
            "#,
        )
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(|row| {
            Ok(Business {
                id: row.try_get("id").map_err(store_error)?,
                name: row.try_get("name").map_err(store_error)?,
                created_at: row.try_get("created_at").map_err(store_error)?,
            })
        })
        .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialSource for PgCredentialStore {
    async fn connection(
        &self,
        business_id: Uuid,
        provider: &str,
    ) -> Result<Option<CrmConnection>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT business_id, provider, access_token, refresh_token, expires_at
              FROM crm_connections
             WHERE business_id = $1
               AND provider = $2
            "#,
        )
        .bind(business_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(|row| {
            let expires_at: Option<DateTime<Utc>> =
                row.try_get("expires_at").map_err(store_error)?;
            Ok(CrmConnection {
                business_id: row.try_get("business_id").map_err(store_error)?,
                provider: row.try_get("provider").map_err(store_error)?,
                access_token: row.try_get("access_token").map_err(store_error)?,
                refresh_token: row.try_get("refresh_token").map_err(store_error)?,
                expires_at,
            })
        })
        .transpose()
    }

    async fn update_tokens(
        &self,
        business_id: Uuid,
        provider: &str,
        rotated: &RotatedTokens,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE crm_connections
               SET access_token = $3,
                   refresh_token = COALESCE($4, refresh_token),
                   expires_at = $5,
                   updated_at = NOW()
             WHERE business_id = $1
               AND provider = $2
            "#,
        )
        .bind(business_id)
        .bind(provider)
        .bind(&rotated.access_token)
        .bind(&rotated.refresh_token)
        .bind(rotated.expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }
}
