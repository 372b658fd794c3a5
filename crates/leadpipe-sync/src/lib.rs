//! Idempotent CRM reconciliation pipeline: fetch, map, dedup, create.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadpipe_core::{
    BusinessDirectory, CredentialSource, CrmApi, ExternalContact, ExternalDeal, LeadKind,
    LeadSource, LeadStore, NewLead, RemoteApiError, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadpipe-sync";

pub mod mapping;

pub use mapping::{map_deal_stage, map_lifecycle_stage};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Wall-clock budget for one whole run, fetch included.
    pub run_budget: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Business synced by scheduled runs; scheduler stays off without it.
    pub scheduled_business_id: Option<Uuid>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            run_budget: Duration::from_secs(120),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            scheduled_business_id: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            run_budget: std::env::var("LEADPIPE_SYNC_BUDGET_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_budget),
            scheduler_enabled: std::env::var("LEADPIPE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LEADPIPE_SYNC_CRON").unwrap_or(defaults.sync_cron),
            scheduled_business_id: std::env::var("LEADPIPE_SCHED_BUSINESS_ID")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no business with id {0}")]
    BusinessNotFound(Uuid),
    #[error("no {provider} connection for business {business_id}")]
    NotConnected { business_id: Uuid, provider: String },
    #[error(transparent)]
    Remote(#[from] RemoteApiError),
    #[error("sync run exceeded its {}s budget", budget.as_secs())]
    Timeout { budget: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Contact,
    Deal,
}

/// Per-record create failure, retained so the job can finish its batch and
/// still report what needs manual attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFailure {
    pub kind: RecordKind,
    pub external_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub business_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub synced_contacts: usize,
    pub synced_deals: usize,
    pub skipped_contacts: usize,
    pub skipped_deals: usize,
    pub failures: Vec<RecordFailure>,
}

impl SyncSummary {
    pub fn total_synced(&self) -> usize {
        self.synced_contacts + self.synced_deals
    }
}

/// Outcome of one dedup-check-then-create step.
enum RecordOutcome {
    Created,
    Skipped,
    Failed(String),
}

pub struct SyncPipeline {
    leads: Arc<dyn LeadStore>,
    businesses: Arc<dyn BusinessDirectory>,
    credentials: Arc<dyn CredentialSource>,
    crm: Arc<dyn CrmApi>,
    provider: String,
    config: SyncConfig,
    // One lock per tenant so concurrent invocations for the same business
    // serialize instead of racing the check-then-create steps.
    tenant_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SyncPipeline {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        businesses: Arc<dyn BusinessDirectory>,
        credentials: Arc<dyn CredentialSource>,
        crm: Arc<dyn CrmApi>,
        provider: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            leads,
            businesses,
            credentials,
            crm,
            provider: provider.into(),
            config,
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn tenant_lock(&self, business_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.tenant_locks.lock().await;
        map.entry(business_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one full reconciliation for a business, bounded by the
    /// configured budget. Fetch or credential failures abort the run;
    /// per-record create failures land in the summary instead.
    pub async fn run(&self, business_id: Uuid) -> Result<SyncSummary, SyncError> {
        let lock = self.tenant_lock(business_id).await;
        let result = {
            let _guard = lock.lock().await;

            let budget = self.config.run_budget;
            match tokio::time::timeout(budget, self.run_locked(business_id)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout { budget }),
            }
        };

        // Evict the lock entry once no other invocation holds a handle;
        // new clones require the map mutex, so the count is stable here.
        let mut map = self.tenant_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            map.remove(&business_id);
        }
        drop(map);

        result
    }

    async fn run_locked(&self, business_id: Uuid) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.businesses
            .find(business_id)
            .await?
            .ok_or(SyncError::BusinessNotFound(business_id))?;

        let access_token = self.resolve_access_token(business_id).await?;

        info!(%run_id, %business_id, provider = %self.provider, "starting crm sync run");

        // Independent collections; fetched concurrently, each one
        // all-or-nothing.
        let (contacts, deals) = tokio::try_join!(
            self.crm.fetch_contacts(&access_token),
            self.crm.fetch_deals(&access_token)
        )?;

        let mut summary = SyncSummary {
            run_id,
            business_id,
            started_at,
            finished_at: started_at,
            synced_contacts: 0,
            synced_deals: 0,
            skipped_contacts: 0,
            skipped_deals: 0,
            failures: Vec::new(),
        };

        for contact in &contacts {
            match self.sync_contact(business_id, contact).await {
                RecordOutcome::Created => summary.synced_contacts += 1,
                RecordOutcome::Skipped => summary.skipped_contacts += 1,
                RecordOutcome::Failed(message) => {
                    warn!(%run_id, external_id = %contact.id, %message, "contact create failed");
                    summary.failures.push(RecordFailure {
                        kind: RecordKind::Contact,
                        external_id: contact.id.clone(),
                        message,
                    });
                }
            }
        }

        for deal in &deals {
            match self.sync_deal(business_id, deal).await {
                RecordOutcome::Created => summary.synced_deals += 1,
                RecordOutcome::Skipped => summary.skipped_deals += 1,
                RecordOutcome::Failed(message) => {
                    warn!(%run_id, external_id = %deal.id, %message, "deal create failed");
                    summary.failures.push(RecordFailure {
                        kind: RecordKind::Deal,
                        external_id: deal.id.clone(),
                        message,
                    });
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            synced_contacts = summary.synced_contacts,
            synced_deals = summary.synced_deals,
            skipped = summary.skipped_contacts + summary.skipped_deals,
            failures = summary.failures.len(),
            "crm sync run finished"
        );
        Ok(summary)
    }

    /// Load the stored connection; refresh a lapsed token when the
    /// provider handed us a refresh token, persisting the rotation.
    /// Tokens are never cached across invocations.
    async fn resolve_access_token(&self, business_id: Uuid) -> Result<String, SyncError> {
        let connection = self
            .credentials
            .connection(business_id, &self.provider)
            .await?
            .ok_or_else(|| SyncError::NotConnected {
                business_id,
                provider: self.provider.clone(),
            })?;

        if !connection.is_expired(Utc::now()) {
            return Ok(connection.access_token);
        }

        let Some(refresh_token) = connection.refresh_token.as_deref() else {
            // Expired with nothing to rotate; let the remote call fail
            // with the provider's own 401 rather than guessing here.
            return Ok(connection.access_token);
        };

        let rotated = self.crm.refresh_tokens(refresh_token).await?;
        self.credentials
            .update_tokens(business_id, &self.provider, &rotated)
            .await?;
        info!(%business_id, provider = %self.provider, "rotated expired access token");
        Ok(rotated.access_token)
    }

    async fn sync_contact(&self, business_id: Uuid, contact: &ExternalContact) -> RecordOutcome {
        // No email: cannot be deduplicated or usefully contacted.
        let Some(email) = contact.email.as_deref() else {
            return RecordOutcome::Skipped;
        };

        match self.leads.email_exists(business_id, email).await {
            Ok(true) => return RecordOutcome::Skipped,
            Ok(false) => {}
            Err(err) => return RecordOutcome::Failed(err.to_string()),
        }

        let lead = NewLead {
            business_id,
            kind: LeadKind::Customer,
            display_name: contact.display_name(),
            company: contact.company.clone(),
            email: Some(email.to_string()),
            phone: contact.phone.clone(),
            status: map_lifecycle_stage(contact.lifecycle_stage.as_deref()),
            notes: Some(format!("Imported from HubSpot contact {}", contact.id)),
            deal_size: None,
            external_ref: Some(contact.id.clone()),
            source: LeadSource::HubspotContact,
        };
        self.create_outcome(&lead).await
    }

    async fn sync_deal(&self, business_id: Uuid, deal: &ExternalDeal) -> RecordOutcome {
        match self
            .leads
            .external_ref_exists(business_id, LeadSource::HubspotDeal, &deal.id)
            .await
        {
            Ok(true) => return RecordOutcome::Skipped,
            Ok(false) => {}
            Err(err) => return RecordOutcome::Failed(err.to_string()),
        }

        let lead = NewLead {
            business_id,
            kind: LeadKind::Customer,
            display_name: deal
                .name
                .clone()
                .unwrap_or_else(|| "Unnamed deal".to_string()),
            company: None,
            email: None,
            phone: None,
            status: map_deal_stage(deal.deal_stage.as_deref()),
            notes: Some(format!("Imported from HubSpot deal {}", deal.id)),
            deal_size: deal.amount,
            external_ref: Some(deal.id.clone()),
            source: LeadSource::HubspotDeal,
        };
        self.create_outcome(&lead).await
    }

    async fn create_outcome(&self, lead: &NewLead) -> RecordOutcome {
        match self.leads.insert(lead).await {
            Ok(_) => RecordOutcome::Created,
            // A concurrent run won the insert race; the record exists, so
            // this is a skip, not a failure.
            Err(StoreError::Duplicate) => RecordOutcome::Skipped,
            Err(err) => RecordOutcome::Failed(err.to_string()),
        }
    }
}

/// Wire the cron scheduler when enabled and a target business is set.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>, JobSchedulerError> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let Some(business_id) = config.scheduled_business_id else {
        warn!("scheduler enabled but LEADPIPE_SCHED_BUSINESS_ID is unset; not scheduling");
        return Ok(None);
    };

    let sched = JobScheduler::new().await?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run(business_id).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    total_synced = summary.total_synced(),
                    "scheduled sync run finished"
                ),
                Err(err) => warn!(%business_id, error = %err, "scheduled sync run failed"),
            }
        })
    })?;
    sched.add(job).await?;
    Ok(Some(sched))
}
