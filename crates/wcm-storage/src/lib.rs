//! Durable state for requests, schedules, payments, ratings and the audit log.
//!
//! Every mutating write of a request or schedule is a compare-and-swap on its
//! `revision`; the status change and its audit row land together or not at all.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use wcm_core::{
    AuditEntry, CollectorId, CollectorProfile, CollectorRating, CollectorWorkload, PaymentRecord,
    Request, RequestId, RequestStatus, Schedule, ScheduleId, ScheduleStatus,
};

mod postgres;

pub use postgres::PgStore;

pub const CRATE_NAME: &str = "wcm-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: Uuid },
    #[error("{entity} {id} changed concurrently: expected revision {expected}, found {actual}")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value: {0}")]
    Decode(String),
}

/// Half-open window `[start, end)` used to count completions "today".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CompletionWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn next_request_sequence(&self) -> Result<u64, StoreError>;
    async fn insert_request(&self, request: &Request, audit: &AuditEntry) -> Result<(), StoreError>;
    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, StoreError>;
    async fn list_requests(&self, status: Option<RequestStatus>) -> Result<Vec<Request>, StoreError>;
    /// Persists `request` only if the stored revision still equals `expected_revision`.
    /// Returns the stored row with its revision bumped.
    async fn update_request(
        &self,
        request: &Request,
        expected_revision: u64,
        audit: &AuditEntry,
    ) -> Result<Request, StoreError>;

    async fn insert_schedule(&self, schedule: &Schedule, audit: &AuditEntry) -> Result<(), StoreError>;
    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError>;
    async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>, StoreError>;
    async fn update_schedule(
        &self,
        schedule: &Schedule,
        expected_revision: u64,
        audit: Option<&AuditEntry>,
    ) -> Result<Schedule, StoreError>;
    async fn delete_schedule(&self, id: ScheduleId, expected_revision: u64) -> Result<(), StoreError>;

    /// Audit rows for one entity, in append order.
    async fn audit_trail(&self, entity_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<(), StoreError>;
    async fn payments_for_request(&self, request_id: RequestId) -> Result<Vec<PaymentRecord>, StoreError>;

    async fn upsert_collector(&self, profile: &CollectorProfile) -> Result<(), StoreError>;
    async fn list_collectors(&self) -> Result<Vec<CollectorProfile>, StoreError>;
    /// Fails with `Duplicate` when the request already carries a rating.
    async fn insert_rating(&self, rating: &CollectorRating) -> Result<(), StoreError>;
    async fn rating_for_request(&self, request_id: RequestId) -> Result<Option<CollectorRating>, StoreError>;
    /// Aggregates live assignment, completion and rating rows per collector.
    async fn collector_workloads(
        &self,
        window: CompletionWindow,
    ) -> Result<HashMap<CollectorId, CollectorWorkload>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    request_sequence: u64,
    requests: HashMap<RequestId, Request>,
    schedules: HashMap<ScheduleId, Schedule>,
    audit: Vec<AuditEntry>,
    payments: Vec<PaymentRecord>,
    collectors: BTreeMap<CollectorId, CollectorProfile>,
    ratings: HashMap<RequestId, CollectorRating>,
}

/// Process-local store. A single lock guards all tables so each write is atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn next_request_sequence(&self) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        state.request_sequence += 1;
        Ok(state.request_sequence)
    }

    async fn insert_request(&self, request: &Request, audit: &AuditEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.id) {
            return Err(StoreError::Duplicate {
                entity: "request",
                id: request.id,
            });
        }
        state.requests.insert(request.id, request.clone());
        state.audit.push(audit.clone());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        Ok(self.state.read().await.requests.get(&id).cloned())
    }

    async fn list_requests(&self, status: Option<RequestStatus>) -> Result<Vec<Request>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .requests
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_number.cmp(&b.request_number))
        });
        Ok(out)
    }

    async fn update_request(
        &self,
        request: &Request,
        expected_revision: u64,
        audit: &AuditEntry,
    ) -> Result<Request, StoreError> {
        let mut state = self.state.write().await;
        let current = state.requests.get(&request.id).ok_or(StoreError::NotFound {
            entity: "request",
            id: request.id,
        })?;
        if current.revision != expected_revision {
            return Err(StoreError::Conflict {
                entity: "request",
                id: request.id,
                expected: expected_revision,
                actual: current.revision,
            });
        }
        let mut stored = request.clone();
        stored.revision = expected_revision + 1;
        state.requests.insert(stored.id, stored.clone());
        state.audit.push(audit.clone());
        Ok(stored)
    }

    async fn insert_schedule(&self, schedule: &Schedule, audit: &AuditEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.schedules.contains_key(&schedule.id) {
            return Err(StoreError::Duplicate {
                entity: "schedule",
                id: schedule.id,
            });
        }
        state.schedules.insert(schedule.id, schedule.clone());
        state.audit.push(audit.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        Ok(self.state.read().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .schedules
            .values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn update_schedule(
        &self,
        schedule: &Schedule,
        expected_revision: u64,
        audit: Option<&AuditEntry>,
    ) -> Result<Schedule, StoreError> {
        let mut state = self.state.write().await;
        let current = state.schedules.get(&schedule.id).ok_or(StoreError::NotFound {
            entity: "schedule",
            id: schedule.id,
        })?;
        if current.revision != expected_revision {
            return Err(StoreError::Conflict {
                entity: "schedule",
                id: schedule.id,
                expected: expected_revision,
                actual: current.revision,
            });
        }
        let mut stored = schedule.clone();
        stored.revision = expected_revision + 1;
        state.schedules.insert(stored.id, stored.clone());
        if let Some(entry) = audit {
            state.audit.push(entry.clone());
        }
        Ok(stored)
    }

    async fn delete_schedule(&self, id: ScheduleId, expected_revision: u64) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let current = state
            .schedules
            .get(&id)
            .ok_or(StoreError::NotFound { entity: "schedule", id })?;
        if current.revision != expected_revision {
            return Err(StoreError::Conflict {
                entity: "schedule",
                id,
                expected: expected_revision,
                actual: current.revision,
            });
        }
        state.schedules.remove(&id);
        Ok(())
    }

    async fn audit_trail(&self, entity_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.payments.iter().any(|p| p.id == payment.id) {
            return Err(StoreError::Duplicate {
                entity: "payment",
                id: payment.id,
            });
        }
        state.payments.push(payment.clone());
        Ok(())
    }

    async fn payments_for_request(&self, request_id: RequestId) -> Result<Vec<PaymentRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn upsert_collector(&self, profile: &CollectorProfile) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .collectors
            .insert(profile.id, profile.clone());
        Ok(())
    }

    async fn list_collectors(&self) -> Result<Vec<CollectorProfile>, StoreError> {
        Ok(self.state.read().await.collectors.values().cloned().collect())
    }

    async fn insert_rating(&self, rating: &CollectorRating) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.ratings.contains_key(&rating.request_id) {
            return Err(StoreError::Duplicate {
                entity: "rating",
                id: rating.request_id,
            });
        }
        state.ratings.insert(rating.request_id, rating.clone());
        Ok(())
    }

    async fn rating_for_request(&self, request_id: RequestId) -> Result<Option<CollectorRating>, StoreError> {
        Ok(self.state.read().await.ratings.get(&request_id).cloned())
    }

    async fn collector_workloads(
        &self,
        window: CompletionWindow,
    ) -> Result<HashMap<CollectorId, CollectorWorkload>, StoreError> {
        let state = self.state.read().await;
        let mut out: HashMap<CollectorId, CollectorWorkload> = HashMap::new();

        for request in state.requests.values() {
            if let Some(collector) = request.assigned_collector {
                if request.status.holds_collector() {
                    out.entry(collector).or_default().active_assignments += 1;
                }
            }
            if let (RequestStatus::Completed, Some(collector), Some(at)) =
                (request.status, request.completed_by, request.completed_at)
            {
                if window.contains(at) {
                    out.entry(collector).or_default().completed_today += 1;
                }
            }
        }

        let mut star_sums: HashMap<CollectorId, u32> = HashMap::new();
        for rating in state.ratings.values() {
            *star_sums.entry(rating.collector_id).or_default() += u32::from(rating.stars);
            out.entry(rating.collector_id).or_default().rating_count += 1;
        }
        for (collector, sum) in star_sums {
            if let Some(workload) = out.get_mut(&collector) {
                workload.average_rating = Some(f64::from(sum) / f64::from(workload.rating_count));
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use wcm_core::{Actor, ContactInfo, EntityKind, NewRequest, Priority};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn mk_request(seq: u64) -> Request {
        Request::new(
            Uuid::new_v4(),
            wcm_core::format_request_number(2026, seq),
            Uuid::new_v4(),
            NewRequest {
                contact: ContactInfo {
                    name: "Ana Santos".into(),
                    phone: "09171234567".into(),
                    email: None,
                },
                barangay: "San Roque".into(),
                address: "12 Mabini St".into(),
                priority: Priority::Medium,
                preferred_date: NaiveDate::from_ymd_opt(2026, 3, 3).unwrap(),
                preferred_time_slot: Some("morning".into()),
                special_instructions: None,
                photo_refs: vec![],
            },
            at(8),
        )
    }

    fn audit_for(request: &Request, from: Option<RequestStatus>, to: RequestStatus) -> AuditEntry {
        AuditEntry::new(
            EntityKind::Request,
            request.id,
            from.map(|s| s.as_str()),
            to.as_str(),
            Actor::Staff(Uuid::nil()),
            at(9),
            None,
        )
    }

    #[tokio::test]
    async fn stale_revision_is_rejected_without_writing() {
        let store = MemoryStore::new();
        let request = mk_request(1);
        store
            .insert_request(&request, &audit_for(&request, None, RequestStatus::Pending))
            .await
            .unwrap();

        let mut accepted = request.clone();
        accepted.status = RequestStatus::Accepted;
        let stored = store
            .update_request(
                &accepted,
                0,
                &audit_for(&request, Some(RequestStatus::Pending), RequestStatus::Accepted),
            )
            .await
            .unwrap();
        assert_eq!(stored.revision, 1);

        let mut rejected = request.clone();
        rejected.status = RequestStatus::Rejected;
        let err = store
            .update_request(
                &rejected,
                0,
                &audit_for(&request, Some(RequestStatus::Pending), RequestStatus::Rejected),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1, .. }));

        let current = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(current.status, RequestStatus::Accepted);
        assert_eq!(store.audit_trail(request.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn workloads_are_aggregated_from_live_rows() {
        let store = MemoryStore::new();
        let collector = Uuid::new_v4();

        let mut active = mk_request(1);
        active.status = RequestStatus::EnRoute;
        active.assigned_collector = Some(collector);

        let mut done_today = mk_request(2);
        done_today.status = RequestStatus::Completed;
        done_today.completed_by = Some(collector);
        done_today.completed_at = Some(at(10));

        let mut done_yesterday = mk_request(3);
        done_yesterday.status = RequestStatus::Completed;
        done_yesterday.completed_by = Some(collector);
        done_yesterday.completed_at = Some(at(10) - Duration::days(1));

        for r in [&active, &done_today, &done_yesterday] {
            store
                .insert_request(r, &audit_for(r, None, r.status))
                .await
                .unwrap();
        }
        for (request, stars) in [(&done_today, 5u8), (&done_yesterday, 2u8)] {
            store
                .insert_rating(&CollectorRating {
                    id: Uuid::new_v4(),
                    request_id: request.id,
                    collector_id: collector,
                    client_id: request.client_id,
                    stars,
                    comment: None,
                    created_at: at(11),
                })
                .await
                .unwrap();
        }

        let window = CompletionWindow {
            start: at(0),
            end: at(0) + Duration::days(1),
        };
        let workloads = store.collector_workloads(window).await.unwrap();
        let w = workloads[&collector];
        assert_eq!(w.active_assignments, 1);
        assert_eq!(w.completed_today, 1);
        assert_eq!(w.rating_count, 2);
        assert_eq!(w.average_rating, Some(3.5));
    }

    #[tokio::test]
    async fn second_rating_for_same_request_is_a_duplicate() {
        let store = MemoryStore::new();
        let rating = CollectorRating {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            collector_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            stars: 4,
            comment: Some("on time".into()),
            created_at: at(12),
        };
        store.insert_rating(&rating).await.unwrap();
        let err = store.insert_rating(&rating).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { entity: "rating", .. }));
    }

    #[tokio::test]
    async fn request_sequence_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.next_request_sequence().await.unwrap(), 1);
        assert_eq!(store.next_request_sequence().await.unwrap(), 2);
    }
}
