use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, warn};
use wcm_core::{Actor, CollectorId, Request, RequestId};

use crate::directory::{CollectorDirectory, CollectorStatus};
use crate::error::EngineError;
use crate::lifecycle::{self, Command, Operation};
use crate::requests::RequestService;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    #[serde(flatten)]
    pub collector: CollectorStatus,
    /// 1-based position in the selection order.
    pub rank: usize,
    /// Selecting this collector is a manual override of the duty roster.
    pub off_duty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentOutcome {
    pub request: Request,
    pub collector: CollectorStatus,
    pub off_duty_override: bool,
}

fn candidate_order(a: &CollectorStatus, b: &CollectorStatus) -> Ordering {
    let rating = |s: &CollectorStatus| s.workload.average_rating.unwrap_or(0.0);
    b.on_duty
        .cmp(&a.on_duty)
        .then_with(|| a.workload.active_assignments.cmp(&b.workload.active_assignments))
        .then_with(|| rating(b).total_cmp(&rating(a)))
        .then_with(|| a.profile.id.cmp(&b.profile.id))
}

/// On-duty collectors first, then fewest active assignments, then best
/// average rating (unrated counts as 0), then id.
pub fn rank_candidates(mut statuses: Vec<CollectorStatus>) -> Vec<Candidate> {
    statuses.sort_by(candidate_order);
    statuses
        .into_iter()
        .enumerate()
        .map(|(idx, collector)| Candidate {
            rank: idx + 1,
            off_duty: !collector.on_duty,
            collector,
        })
        .collect()
}

/// Binds collectors to requests. Double-booking is allowed; workload counts
/// are advisory.
#[derive(Clone)]
pub struct AssignmentEngine {
    requests: RequestService,
    directory: CollectorDirectory,
}

impl AssignmentEngine {
    pub fn new(requests: RequestService, directory: CollectorDirectory) -> Self {
        Self { requests, directory }
    }

    pub async fn candidates(&self, request_id: RequestId) -> Result<Vec<Candidate>, EngineError> {
        let request = self.requests.get(request_id).await?;
        debug!(
            request_id = %request.id,
            barangay = %request.barangay,
            preferred_date = %request.preferred_date,
            "ranking collectors"
        );
        Ok(rank_candidates(self.directory.snapshot().await?))
    }

    pub async fn suggest(&self, request_id: RequestId) -> Result<Option<Candidate>, EngineError> {
        Ok(self.candidates(request_id).await?.into_iter().next())
    }

    pub async fn assign(
        &self,
        actor: &Actor,
        request_id: RequestId,
        collector_id: CollectorId,
        notes: Option<String>,
    ) -> Result<AssignmentOutcome, EngineError> {
        let current = self.requests.get(request_id).await?;
        lifecycle::ensure_allowed(&current, Operation::AssignCollector)?;
        lifecycle::authorize(&current, actor, Operation::AssignCollector)?;
        let collector = self.directory.get(collector_id).await?;

        let request = self
            .requests
            .transition(
                actor,
                request_id,
                Command::AssignCollector {
                    collector: collector_id,
                    notes,
                },
            )
            .await?;

        let off_duty_override = !collector.on_duty;
        if off_duty_override {
            warn!(
                request_id = %request_id,
                collector_id = %collector_id,
                "assigned an off-duty collector"
            );
        }
        Ok(AssignmentOutcome {
            request,
            collector,
            off_duty_override,
        })
    }
}
