//! Request lifecycle, collector assignment, route planning and schedule lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tracing::info;
use wcm_ports::{
    AttendanceSource, LogNotifier, Notifier, PaymentLedger, StaticAttendance, WebhookConfig,
    WebhookNotifier,
};
use wcm_storage::{MemoryStore, PgStore, Store};

pub mod assignment;
pub mod config;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod requests;
pub mod routing;
pub mod schedules;

pub use assignment::{AssignmentEngine, AssignmentOutcome, Candidate};
pub use config::{load_roster, EngineConfig, Roster, RosterEntry};
pub use directory::{CollectorDirectory, CollectorStatus, NewCollector};
pub use error::EngineError;
pub use requests::{PaymentInput, RatingInput, RequestService, StoreLedger};
pub use schedules::ScheduleService;

pub const CRATE_NAME: &str = "wcm-engine";

/// Every service wired to the same store and collaborators.
#[derive(Clone)]
pub struct Engine {
    pub requests: RequestService,
    pub directory: CollectorDirectory,
    pub assignment: AssignmentEngine,
    pub schedules: ScheduleService,
}

impl Engine {
    /// Payments are kept in `store` through [`StoreLedger`].
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        attendance: Arc<dyn AttendanceSource>,
        utc_offset: FixedOffset,
    ) -> Self {
        let ledger = Arc::new(StoreLedger::new(store.clone()));
        Self::with_payment_ledger(store, notifier, attendance, ledger, utc_offset)
    }

    pub fn with_payment_ledger(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        attendance: Arc<dyn AttendanceSource>,
        ledger: Arc<dyn PaymentLedger>,
        utc_offset: FixedOffset,
    ) -> Self {
        let requests = RequestService::new(store.clone(), notifier, ledger, utc_offset);
        let directory = CollectorDirectory::new(store.clone(), attendance, utc_offset);
        let assignment = AssignmentEngine::new(requests.clone(), directory.clone());
        let schedules = ScheduleService::new(store, directory.clone());
        Self {
            requests,
            directory,
            assignment,
            schedules,
        }
    }
}

/// Builds the engine the binaries run: Postgres when `DATABASE_URL` is set,
/// otherwise in-memory, seeded from the YAML roster either way.
pub async fn engine_from_config(config: &EngineConfig) -> Result<Engine> {
    let utc_offset = config.utc_offset()?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            pg.migrate().await.context("applying migrations")?;
            info!("using postgres store");
            Arc::new(pg)
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let roster = load_roster(&config.roster_path)?;
    for entry in &roster.collectors {
        store
            .upsert_collector(&entry.profile())
            .await
            .with_context(|| format!("seeding collector {}", entry.id))?;
    }
    info!(collectors = roster.collectors.len(), path = %config.roster_path.display(), "roster loaded");

    let attendance = Arc::new(StaticAttendance::new(
        roster.collectors.iter().filter(|c| c.on_duty).map(|c| c.id),
    ));

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            let mut webhook = WebhookConfig::new(url.clone());
            webhook.timeout = config.notify_timeout();
            Arc::new(WebhookNotifier::new(webhook).context("building webhook notifier")?)
        }
        None => Arc::new(LogNotifier),
    };

    Ok(Engine::new(store, notifier, attendance, utc_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_without_database_seeds_memory_store_from_roster() {
        let dir = tempfile::tempdir().unwrap();
        let roster = dir.path().join("collectors.yaml");
        std::fs::write(
            &roster,
            "collectors:\n  - id: 6f1c1f34-8d3e-4b8a-9a53-0c9d5c3f2a10\n    name: Ramon\n    on_duty: true\n",
        )
        .unwrap();

        let config = EngineConfig {
            roster_path: roster,
            ..EngineConfig::default()
        };
        let engine = engine_from_config(&config).await.unwrap();
        let snapshot = engine.directory.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].on_duty);
    }
}
