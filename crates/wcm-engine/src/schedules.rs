//! Schedule lifecycle and route edits.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use wcm_core::{
    Actor, AuditEntry, EntityKind, GeoPoint, NewSchedule, NewStop, Schedule, ScheduleId,
    SchedulePatch, ScheduleStatus, Stop, StopId,
};
use wcm_storage::Store;

use crate::directory::CollectorDirectory;
use crate::error::EngineError;
use crate::routing::{self, RouteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOperation {
    Update,
    EditStops,
    Activate,
    Complete,
    Cancel,
    Delete,
    CompleteStop,
}

impl ScheduleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleOperation::Update => "update",
            ScheduleOperation::EditStops => "edit_stops",
            ScheduleOperation::Activate => "activate",
            ScheduleOperation::Complete => "complete",
            ScheduleOperation::Cancel => "cancel",
            ScheduleOperation::Delete => "delete",
            ScheduleOperation::CompleteStop => "complete_stop",
        }
    }
}

pub fn allowed_schedule_operations(status: ScheduleStatus) -> &'static [ScheduleOperation] {
    use ScheduleOperation::*;
    match status {
        ScheduleStatus::Draft => &[Update, EditStops, Activate, Cancel, Delete],
        ScheduleStatus::Active => &[Update, EditStops, Complete, Cancel, CompleteStop],
        ScheduleStatus::Completed => &[],
        ScheduleStatus::Cancelled => &[Delete],
    }
}

fn ensure_allowed(schedule: &Schedule, operation: ScheduleOperation) -> Result<(), EngineError> {
    if allowed_schedule_operations(schedule.status).contains(&operation) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            entity: EntityKind::Schedule,
            current: schedule.status.as_str().to_string(),
            operation: operation.as_str(),
        })
    }
}

fn ensure_staff(actor: &Actor, operation: &'static str) -> Result<(), EngineError> {
    if actor.is_staff() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized {
            role: actor.role(),
            operation,
        })
    }
}

fn route_error(schedule: ScheduleId, err: RouteError) -> EngineError {
    match err {
        RouteError::UnknownStop(stop) => EngineError::StopNotFound { schedule, stop },
        RouteError::Unlocated(stop) => {
            EngineError::validation(format!("stop {stop} has no coordinates to start a route from"))
        }
    }
}

fn build_stops(stops: Vec<NewStop>) -> Result<Vec<Stop>, EngineError> {
    stops
        .into_iter()
        .map(|stop| {
            if stop.location_name.trim().is_empty() {
                return Err(EngineError::validation("stop location name is required"));
            }
            Ok(Stop::from_new(stop)?)
        })
        .collect()
}

fn validate_fields(schedule: &Schedule) -> Result<(), EngineError> {
    if schedule.name.trim().is_empty() {
        return Err(EngineError::validation("schedule name is required"));
    }
    if let (Some(start), Some(end)) = (schedule.start_date, schedule.end_date) {
        if end < start {
            return Err(EngineError::validation(format!(
                "end date {end} is before start date {start}"
            )));
        }
    }
    if let (Some(primary), Some(backup)) = (schedule.primary_collector, schedule.backup_collector) {
        if primary == backup {
            return Err(EngineError::validation(
                "primary and backup collector must be different people",
            ));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct ScheduleService {
    store: Arc<dyn Store>,
    directory: CollectorDirectory,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn Store>, directory: CollectorDirectory) -> Self {
        Self { store, directory }
    }

    async fn check_collectors(&self, schedule: &Schedule) -> Result<(), EngineError> {
        for id in [schedule.primary_collector, schedule.backup_collector]
            .into_iter()
            .flatten()
        {
            self.directory.ensure_exists(id).await?;
        }
        Ok(())
    }

    async fn check_linked_requests(&self, stops: &[Stop]) -> Result<(), EngineError> {
        for request_id in stops.iter().filter_map(|s| s.request_id) {
            if self.store.get_request(request_id).await?.is_none() {
                return Err(EngineError::RequestNotFound(request_id));
            }
        }
        Ok(())
    }

    pub async fn create(&self, actor: &Actor, draft: NewSchedule) -> Result<Schedule, EngineError> {
        ensure_staff(actor, "create_schedule")?;
        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            schedule_type: draft.schedule_type,
            start_date: Some(draft.start_date),
            end_date: draft.end_date,
            start_time: draft.start_time,
            end_time: draft.end_time,
            status: ScheduleStatus::Draft,
            special_instructions: draft.special_instructions,
            primary_collector: draft.primary_collector,
            backup_collector: draft.backup_collector,
            stops: build_stops(draft.stops)?,
            created_by: actor.id(),
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        validate_fields(&schedule)?;
        self.check_collectors(&schedule).await?;
        self.check_linked_requests(&schedule.stops).await?;

        let audit = AuditEntry::new(
            EntityKind::Schedule,
            schedule.id,
            None,
            ScheduleStatus::Draft.as_str(),
            *actor,
            now,
            None,
        );
        self.store.insert_schedule(&schedule, &audit).await?;
        info!(schedule_id = %schedule.id, name = %schedule.name, stops = schedule.stops.len(), "schedule created");
        Ok(schedule)
    }

    pub async fn get(&self, id: ScheduleId) -> Result<Schedule, EngineError> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or(EngineError::ScheduleNotFound(id))
    }

    pub async fn list(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>, EngineError> {
        Ok(self.store.list_schedules(status).await?)
    }

    pub async fn history(&self, id: ScheduleId) -> Result<Vec<AuditEntry>, EngineError> {
        self.get(id).await?;
        Ok(self.store.audit_trail(id).await?)
    }

    pub async fn update(&self, actor: &Actor, id: ScheduleId, patch: SchedulePatch) -> Result<Schedule, EngineError> {
        ensure_staff(actor, "update_schedule")?;
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::Update)?;

        let mut next = current.clone();
        if let Some(name) = patch.name {
            next.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            next.description = description;
        }
        if let Some(schedule_type) = patch.schedule_type {
            next.schedule_type = schedule_type;
        }
        if let Some(start_date) = patch.start_date {
            next.start_date = Some(start_date);
        }
        if let Some(end_date) = patch.end_date {
            next.end_date = end_date;
        }
        if let Some(start_time) = patch.start_time {
            next.start_time = start_time;
        }
        if let Some(end_time) = patch.end_time {
            next.end_time = end_time;
        }
        if let Some(instructions) = patch.special_instructions {
            next.special_instructions = instructions;
        }
        if let Some(primary) = patch.primary_collector {
            next.primary_collector = primary;
        }
        if let Some(backup) = patch.backup_collector {
            next.backup_collector = backup;
        }
        let replaced_stops = patch.stops.is_some();
        if let Some(stops) = patch.stops {
            next.stops = build_stops(stops)?;
        }
        validate_fields(&next)?;
        self.check_collectors(&next).await?;
        if replaced_stops {
            self.check_linked_requests(&next.stops).await?;
        }
        self.save_stops_or_fields(&current, next).await
    }

    /// Copies fields and stops into a fresh draft with cleared dates.
    pub async fn duplicate(&self, actor: &Actor, id: ScheduleId) -> Result<Schedule, EngineError> {
        ensure_staff(actor, "duplicate_schedule")?;
        let source = self.get(id).await?;
        let now = Utc::now();
        let copy = Schedule {
            id: Uuid::new_v4(),
            name: format!("{} (copy)", source.name),
            start_date: None,
            end_date: None,
            status: ScheduleStatus::Draft,
            stops: source
                .stops
                .iter()
                .map(|s| Stop {
                    id: Uuid::new_v4(),
                    completed_at: None,
                    completed_by: None,
                    ..s.clone()
                })
                .collect(),
            created_by: actor.id(),
            revision: 0,
            created_at: now,
            updated_at: now,
            ..source.clone()
        };
        let audit = AuditEntry::new(
            EntityKind::Schedule,
            copy.id,
            None,
            ScheduleStatus::Draft.as_str(),
            *actor,
            now,
            Some(format!("duplicated from {}", source.id)),
        );
        self.store.insert_schedule(&copy, &audit).await?;
        info!(schedule_id = %copy.id, source_id = %source.id, "schedule duplicated");
        Ok(copy)
    }

    /// Only drafts and cancelled schedules may be deleted.
    pub async fn delete(&self, actor: &Actor, id: ScheduleId) -> Result<(), EngineError> {
        ensure_staff(actor, "delete_schedule")?;
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::Delete)?;
        self.store.delete_schedule(id, current.revision).await?;
        info!(schedule_id = %id, status = %current.status, "schedule deleted");
        Ok(())
    }

    pub async fn activate(&self, actor: &Actor, id: ScheduleId) -> Result<Schedule, EngineError> {
        ensure_staff(actor, "activate_schedule")?;
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::Activate)?;
        if current.stops.is_empty() {
            return Err(EngineError::EmptyRoute(id));
        }
        if current.start_date.is_none() {
            return Err(EngineError::validation("schedule needs a start date before activation"));
        }
        self.change_status(actor, &current, ScheduleStatus::Active, None).await
    }

    pub async fn complete(&self, actor: &Actor, id: ScheduleId) -> Result<Schedule, EngineError> {
        ensure_staff(actor, "complete_schedule")?;
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::Complete)?;
        self.change_status(actor, &current, ScheduleStatus::Completed, None).await
    }

    pub async fn cancel(&self, actor: &Actor, id: ScheduleId, reason: Option<String>) -> Result<Schedule, EngineError> {
        ensure_staff(actor, "cancel_schedule")?;
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::Cancel)?;
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        self.change_status(actor, &current, ScheduleStatus::Cancelled, reason).await
    }

    pub async fn add_stop(&self, actor: &Actor, id: ScheduleId, stop: NewStop) -> Result<Schedule, EngineError> {
        let (current, mut next) = self.begin_stop_edit(actor, id).await?;
        let mut built = build_stops(vec![stop])?;
        self.check_linked_requests(&built).await?;
        if let Some(stop) = built.pop() {
            routing::append_stop(&mut next.stops, stop);
        }
        self.save_stops_or_fields(&current, next).await
    }

    pub async fn remove_stop(&self, actor: &Actor, id: ScheduleId, stop: StopId) -> Result<Schedule, EngineError> {
        let (current, mut next) = self.begin_stop_edit(actor, id).await?;
        routing::remove_stop(&mut next.stops, stop).map_err(|e| route_error(id, e))?;
        self.save_stops_or_fields(&current, next).await
    }

    pub async fn swap_stops(&self, actor: &Actor, id: ScheduleId, a: StopId, b: StopId) -> Result<Schedule, EngineError> {
        let (current, mut next) = self.begin_stop_edit(actor, id).await?;
        routing::swap_stops(&mut next.stops, a, b).map_err(|e| route_error(id, e))?;
        self.save_stops_or_fields(&current, next).await
    }

    pub async fn optimize(&self, actor: &Actor, id: ScheduleId, start: Option<StopId>) -> Result<Schedule, EngineError> {
        let (current, mut next) = self.begin_stop_edit(actor, id).await?;
        next.stops = routing::optimize_stops(&current.stops, start).map_err(|e| route_error(id, e))?;
        self.save_stops_or_fields(&current, next).await
    }

    /// Marks one stop of an active schedule as visited. Stop order and the
    /// linked request are left as they are.
    pub async fn complete_stop(&self, actor: &Actor, id: ScheduleId, stop: StopId) -> Result<Schedule, EngineError> {
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::CompleteStop)?;
        let on_crew = match actor {
            Actor::Collector(c) => {
                current.primary_collector == Some(*c) || current.backup_collector == Some(*c)
            }
            _ => false,
        };
        if !actor.is_staff() && !on_crew {
            return Err(EngineError::Unauthorized {
                role: actor.role(),
                operation: "complete_stop",
            });
        }
        let position = current
            .stop_position(stop)
            .ok_or(EngineError::StopNotFound { schedule: id, stop })?;
        if current.stops[position].is_completed() {
            return Err(EngineError::validation(format!("stop {stop} is already completed")));
        }

        let mut next = current.clone();
        next.stops[position].completed_at = Some(Utc::now());
        next.stops[position].completed_by = Some(*actor);
        let request_id = next.stops[position].request_id;
        let stored = self.save_stops_or_fields(&current, next).await?;
        let remaining = stored.stops.iter().filter(|s| !s.is_completed()).count();
        info!(schedule_id = %id, stop_id = %stop, request_id = ?request_id, remaining, actor = %actor, "stop completed");
        Ok(stored)
    }

    pub async fn route_line(&self, id: ScheduleId) -> Result<Vec<GeoPoint>, EngineError> {
        Ok(routing::route_line(&self.get(id).await?.stops))
    }

    async fn begin_stop_edit(&self, actor: &Actor, id: ScheduleId) -> Result<(Schedule, Schedule), EngineError> {
        ensure_staff(actor, "edit_schedule_stops")?;
        let current = self.get(id).await?;
        ensure_allowed(&current, ScheduleOperation::EditStops)?;
        let next = current.clone();
        Ok((current, next))
    }

    /// Persists a non-status change. An active schedule must keep at least one stop.
    async fn save_stops_or_fields(&self, current: &Schedule, mut next: Schedule) -> Result<Schedule, EngineError> {
        if next.status == ScheduleStatus::Active && next.stops.is_empty() {
            return Err(EngineError::EmptyRoute(next.id));
        }
        next.updated_at = Utc::now();
        let stored = self
            .store
            .update_schedule(&next, current.revision, None)
            .await?;
        info!(schedule_id = %stored.id, revision = stored.revision, stops = stored.stops.len(), "schedule updated");
        Ok(stored)
    }

    async fn change_status(
        &self,
        actor: &Actor,
        current: &Schedule,
        to: ScheduleStatus,
        reason: Option<String>,
    ) -> Result<Schedule, EngineError> {
        let now = Utc::now();
        let mut next = current.clone();
        next.status = to;
        next.updated_at = now;
        let audit = AuditEntry::new(
            EntityKind::Schedule,
            current.id,
            Some(current.status.as_str()),
            to.as_str(),
            *actor,
            now,
            reason,
        );
        let stored = self
            .store
            .update_schedule(&next, current.revision, Some(&audit))
            .await?;
        info!(schedule_id = %stored.id, from = %current.status, to = %stored.status, actor = %actor, "schedule transition");
        Ok(stored)
    }
}
