//! Read projection of collector duty, workload and ratings.
//!
//! Nothing here is stored: every snapshot joins the roster with the live
//! assignment/rating aggregates and the attendance collaborator's on-duty set.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use wcm_core::{Actor, CollectorId, CollectorProfile, CollectorWorkload};
use wcm_ports::AttendanceSource;
use wcm_storage::{CompletionWindow, Store};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStatus {
    #[serde(flatten)]
    pub profile: CollectorProfile,
    pub on_duty: bool,
    #[serde(flatten)]
    pub workload: CollectorWorkload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCollector {
    #[serde(default)]
    pub id: Option<CollectorId>,
    pub name: String,
    #[serde(default)]
    pub contact_number: Option<String>,
}

/// The local calendar day containing `now`, expressed in UTC.
pub fn completion_window(now: DateTime<Utc>, offset: FixedOffset) -> CompletionWindow {
    let local_midnight = now.with_timezone(&offset).date_naive().and_time(NaiveTime::MIN);
    let start = Utc.from_utc_datetime(&(local_midnight - Duration::seconds(i64::from(offset.local_minus_utc()))));
    CompletionWindow {
        start,
        end: start + Duration::days(1),
    }
}

#[derive(Clone)]
pub struct CollectorDirectory {
    store: Arc<dyn Store>,
    attendance: Arc<dyn AttendanceSource>,
    utc_offset: FixedOffset,
}

impl CollectorDirectory {
    pub fn new(store: Arc<dyn Store>, attendance: Arc<dyn AttendanceSource>, utc_offset: FixedOffset) -> Self {
        Self {
            store,
            attendance,
            utc_offset,
        }
    }

    pub async fn register(&self, actor: &Actor, collector: NewCollector) -> Result<CollectorProfile, EngineError> {
        if !actor.is_staff() {
            return Err(EngineError::Unauthorized {
                role: actor.role(),
                operation: "register_collector",
            });
        }
        let name = collector.name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("collector name is required"));
        }
        let profile = CollectorProfile {
            id: collector.id.unwrap_or_else(Uuid::new_v4),
            name: name.to_string(),
            contact_number: collector
                .contact_number
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        };
        self.store.upsert_collector(&profile).await?;
        info!(collector_id = %profile.id, name = %profile.name, "collector registered");
        Ok(profile)
    }

    pub async fn snapshot(&self) -> Result<Vec<CollectorStatus>, EngineError> {
        self.snapshot_at(Utc::now()).await
    }

    /// Point-in-time view; concurrent assignments are not locked out.
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> Result<Vec<CollectorStatus>, EngineError> {
        let profiles = self.store.list_collectors().await?;
        let workloads = self
            .store
            .collector_workloads(completion_window(now, self.utc_offset))
            .await?;
        let on_duty = match self.attendance.on_duty().await {
            Ok(set) => set,
            Err(err) => {
                warn!(error = %err, "attendance unavailable; treating every collector as off duty");
                HashSet::new()
            }
        };

        let mut statuses = profiles
            .into_iter()
            .map(|profile| CollectorStatus {
                on_duty: on_duty.contains(&profile.id),
                workload: workloads.get(&profile.id).copied().unwrap_or_default(),
                profile,
            })
            .collect::<Vec<_>>();
        statuses.sort_by_key(|s| s.profile.id);
        Ok(statuses)
    }

    pub async fn get(&self, id: CollectorId) -> Result<CollectorStatus, EngineError> {
        self.snapshot()
            .await?
            .into_iter()
            .find(|s| s.profile.id == id)
            .ok_or(EngineError::CollectorNotFound(id))
    }

    /// Fails with `CollectorNotFound` unless `id` is on the roster.
    pub async fn ensure_exists(&self, id: CollectorId) -> Result<(), EngineError> {
        let known = self.store.list_collectors().await?;
        if known.iter().any(|p| p.id == id) {
            Ok(())
        } else {
            Err(EngineError::CollectorNotFound(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wcm_ports::{PortError, StaticAttendance};
    use wcm_storage::MemoryStore;

    struct BrokenAttendance;

    #[async_trait]
    impl AttendanceSource for BrokenAttendance {
        async fn on_duty(&self) -> Result<HashSet<CollectorId>, PortError> {
            Err(PortError::Rejected("clock-in service down".into()))
        }
    }

    fn manila() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn completion_window_follows_the_local_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).single().unwrap();
        let window = completion_window(now, manila());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2026, 3, 2, 16, 0, 0).single().unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2026, 3, 3, 16, 0, 0).single().unwrap());
        assert!(window.contains(now));
    }

    #[tokio::test]
    async fn snapshot_flags_duty_from_attendance() {
        let store = Arc::new(MemoryStore::new());
        let attendance = Arc::new(StaticAttendance::default());
        let directory = CollectorDirectory::new(store, attendance.clone(), manila());
        let staff = Actor::Staff(Uuid::new_v4());

        let a = directory
            .register(&staff, NewCollector { id: None, name: "Ramon".into(), contact_number: None })
            .await
            .unwrap();
        let b = directory
            .register(&staff, NewCollector { id: None, name: "Lito".into(), contact_number: Some(" ".into()) })
            .await
            .unwrap();
        assert_eq!(b.contact_number, None);
        attendance.clock_in(a.id).await;

        let snapshot = directory.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        let on_duty = snapshot.iter().filter(|s| s.on_duty).map(|s| s.profile.id).collect::<Vec<_>>();
        assert_eq!(on_duty, vec![a.id]);
        assert!(snapshot.iter().all(|s| s.workload == CollectorWorkload::default()));
    }

    #[tokio::test]
    async fn attendance_failure_degrades_to_off_duty() {
        let store = Arc::new(MemoryStore::new());
        let directory = CollectorDirectory::new(store, Arc::new(BrokenAttendance), manila());
        let staff = Actor::Staff(Uuid::new_v4());
        let c = directory
            .register(&staff, NewCollector { id: None, name: "Nestor".into(), contact_number: None })
            .await
            .unwrap();
        assert!(!directory.get(c.id).await.unwrap().on_duty);
    }

    #[tokio::test]
    async fn only_staff_register_and_unknown_ids_are_reported() {
        let store = Arc::new(MemoryStore::new());
        let directory = CollectorDirectory::new(store, Arc::new(StaticAttendance::default()), manila());
        let err = directory
            .register(
                &Actor::Client(Uuid::new_v4()),
                NewCollector { id: None, name: "Eve".into(), contact_number: None },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let missing = Uuid::new_v4();
        assert!(matches!(
            directory.get(missing).await,
            Err(EngineError::CollectorNotFound(id)) if id == missing
        ));
        assert!(directory.ensure_exists(missing).await.is_err());
    }
}
