//! Core domain model and collaborator contracts for Leadpipe.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadpipe-core";

/// Fixed local status vocabulary every external stage maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Meeting,
    Negotiating,
    ClosedWon,
    ClosedLost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Meeting => "meeting",
            LeadStatus::Negotiating => "negotiating",
            LeadStatus::ClosedWon => "closed_won",
            LeadStatus::ClosedLost => "closed_lost",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lead status: {0}")]
pub struct ParseLeadStatusError(String);

impl FromStr for LeadStatus {
    type Err = ParseLeadStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "meeting" => Ok(LeadStatus::Meeting),
            "negotiating" => Ok(LeadStatus::Negotiating),
            "closed_won" => Ok(LeadStatus::ClosedWon),
            "closed_lost" => Ok(LeadStatus::ClosedLost),
            other => Err(ParseLeadStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadKind {
    Customer,
    Acquirer,
    Investor,
}

impl LeadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadKind::Customer => "customer",
            LeadKind::Acquirer => "acquirer",
            LeadKind::Investor => "investor",
        }
    }
}

/// Where a lead row came from. Synced rows carry the originating record
/// kind so the dedup identity for each shape stays distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    Manual,
    HubspotContact,
    HubspotDeal,
}

impl LeadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadSource::Manual => "manual",
            LeadSource::HubspotContact => "hubspot_contact",
            LeadSource::HubspotDeal => "hubspot_deal",
        }
    }
}

/// Tenant boundary. Every lead belongs to exactly one business and sync
/// invocations name their business explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted lead. The pipeline only ever creates these; it never updates
/// or deletes an existing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub business_id: Uuid,
    pub kind: LeadKind,
    pub display_name: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub notes: Option<String>,
    pub deal_size: Option<f64>,
    /// Structural provenance key for synced rows: the external record id,
    /// unique per business. Manual leads leave it empty.
    pub external_ref: Option<String>,
    pub source: LeadSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape handed to the store by the pipeline or the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub business_id: Uuid,
    pub kind: LeadKind,
    pub display_name: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub notes: Option<String>,
    pub deal_size: Option<f64>,
    pub external_ref: Option<String>,
    pub source: LeadSource,
}

/// Stored CRM connection for one (business, provider) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmConnection {
    pub business_id: Uuid,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CrmConnection {
    /// Expired, with a small skew so a token about to lapse mid-run counts
    /// as expired already.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + Duration::seconds(30),
            None => false,
        }
    }
}

/// Rotated credentials returned by a provider token refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotatedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Remote contact as the CRM reports it. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalContact {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub lifecycle_stage: Option<String>,
}

impl ExternalContact {
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.email
                .clone()
                .unwrap_or_else(|| "Unknown Contact".to_string())
        } else {
            name
        }
    }
}

/// Remote deal as the CRM reports it. Deal-derived leads are deliberately
/// contact-less summary records; they never acquire an email identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDeal {
    pub id: String,
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub deal_stage: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub pipeline: Option<String>,
}

/// Persistence failure surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Callers racing on
    /// check-then-create treat this as an existing record, not a failure.
    #[error("duplicate record")]
    Duplicate,
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Remote CRM failure, carrying the provider status when one was received.
#[derive(Debug, Clone)]
pub struct RemoteApiError {
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for RemoteApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "remote api error (status {status}): {}", self.message),
            None => write!(f, "remote api error: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteApiError {}

impl RemoteApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

/// Lead persistence surface the pipeline needs: existence checks for both
/// dedup identities, a single-row insert, and listing for the API layer.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn email_exists(&self, business_id: Uuid, email: &str) -> Result<bool, StoreError>;

    /// External ids are only unique within one source; contact and deal id
    /// sequences overlap, so the ref is always qualified by source.
    async fn external_ref_exists(
        &self,
        business_id: Uuid,
        source: LeadSource,
        external_ref: &str,
    ) -> Result<bool, StoreError>;

    async fn insert(&self, lead: &NewLead) -> Result<Lead, StoreError>;

    async fn list(
        &self,
        business_id: Uuid,
        status: Option<LeadStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Lead>, StoreError>;
}

#[async_trait]
pub trait BusinessDirectory: Send + Sync {
    async fn find(&self, business_id: Uuid) -> Result<Option<Business>, StoreError>;
}

/// Stored-credential access for one integration provider.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn connection(
        &self,
        business_id: Uuid,
        provider: &str,
    ) -> Result<Option<CrmConnection>, StoreError>;

    async fn update_tokens(
        &self,
        business_id: Uuid,
        provider: &str,
        rotated: &RotatedTokens,
    ) -> Result<(), StoreError>;
}

/// Read-only CRM surface: the two record collections plus token refresh.
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn fetch_contacts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ExternalContact>, RemoteApiError>;

    async fn fetch_deals(&self, access_token: &str) -> Result<Vec<ExternalDeal>, RemoteApiError>;

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<RotatedTokens, RemoteApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            LeadStatus::New,
            LeadStatus::Contacted,
            LeadStatus::Meeting,
            LeadStatus::Negotiating,
            LeadStatus::ClosedWon,
            LeadStatus::ClosedLost,
        ] {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
        assert!("open".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn contact_display_name_falls_back_to_email() {
        let mut contact = ExternalContact {
            id: "101".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            email: Some("ada@example.com".into()),
            phone: None,
            company: None,
            lifecycle_stage: None,
        };
        assert_eq!(contact.display_name(), "Ada Lovelace");

        contact.first_name = None;
        contact.last_name = None;
        assert_eq!(contact.display_name(), "ada@example.com");

        contact.email = None;
        assert_eq!(contact.display_name(), "Unknown Contact");
    }

    #[test]
    fn connection_expiry_includes_skew() {
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).single().unwrap();
        let conn = CrmConnection {
            business_id: Uuid::new_v4(),
            provider: "hubspot".into(),
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Some(now + Duration::seconds(10)),
        };
        assert!(conn.is_expired(now));

        let fresh = CrmConnection {
            expires_at: Some(now + Duration::seconds(120)),
            ..conn.clone()
        };
        assert!(!fresh.is_expired(now));

        let no_expiry = CrmConnection {
            expires_at: None,
            ..conn
        };
        assert!(!no_expiry.is_expired(now));
    }
}
