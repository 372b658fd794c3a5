use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadpipe_hubspot::{HubSpotClient, HubSpotConfig, PROVIDER};
use leadpipe_storage::{PgBusinessDirectory, PgCredentialStore, PgLeadStore, PgPool};
use leadpipe_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use leadpipe_web::{AppState, WebConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "leadpipe")]
#[command(about = "Leadpipe CRM sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync for a business and print the summary.
    Sync {
        /// Business to reconcile.
        business_id: Uuid,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the HTTP API, with the cron scheduler when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let pool = connect_pool().await?;
            leadpipe_storage::run_migrations(&pool)
                .await
                .context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Sync { business_id } => {
            let pipeline = build_pipeline().await?;
            let summary = pipeline.run(business_id).await?;
            println!(
                "sync complete: run_id={} contacts={} deals={} skipped={} failures={}",
                summary.run_id,
                summary.synced_contacts,
                summary.synced_deals,
                summary.skipped_contacts + summary.skipped_deals,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("  failed {:?} {}: {}", failure.kind, failure.external_id, failure.message);
            }
        }
        Commands::Serve => {
            let pool = connect_pool().await?;
            leadpipe_storage::run_migrations(&pool)
                .await
                .context("running migrations")?;

            let leads: Arc<PgLeadStore> = Arc::new(PgLeadStore::new(pool.clone()));
            let businesses = Arc::new(PgBusinessDirectory::new(pool.clone()));
            let credentials = Arc::new(PgCredentialStore::new(pool));
            let crm = Arc::new(
                HubSpotClient::new(HubSpotConfig::from_env()).context("building hubspot client")?,
            );
            let sync_config = SyncConfig::from_env();
            let pipeline = Arc::new(SyncPipeline::new(
                leads.clone(),
                businesses.clone(),
                credentials,
                crm,
                PROVIDER,
                sync_config.clone(),
            ));

            let _scheduler = match maybe_build_scheduler(pipeline.clone(), &sync_config).await? {
                Some(sched) => {
                    sched.start().await?;
                    info!(cron = %sync_config.sync_cron, "scheduled sync enabled");
                    Some(sched)
                }
                None => None,
            };

            let web_config = WebConfig::from_env();
            let state = AppState {
                pipeline,
                leads,
                businesses,
                api_token: web_config.api_token.clone(),
            };
            info!(port = web_config.port, "starting http api");
            leadpipe_web::serve(state, web_config.port).await?;
        }
    }

    Ok(())
}

async fn connect_pool() -> Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    leadpipe_storage::connect(&database_url)
        .await
        .context("connecting to postgres")
}

async fn build_pipeline() -> Result<Arc<SyncPipeline>> {
    let pool = connect_pool().await?;
    let leads = Arc::new(PgLeadStore::new(pool.clone()));
    let businesses = Arc::new(PgBusinessDirectory::new(pool.clone()));
    let credentials = Arc::new(PgCredentialStore::new(pool));
    let crm = Arc::new(
        HubSpotClient::new(HubSpotConfig::from_env()).context("building hubspot client")?,
    );
    Ok(Arc::new(SyncPipeline::new(
        leads,
        businesses,
        credentials,
        crm,
        PROVIDER,
        SyncConfig::from_env(),
    )))
}
