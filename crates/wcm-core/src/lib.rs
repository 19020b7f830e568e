//! Core domain model for waste-collection requests, collectors and schedules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "wcm-core";

pub type RequestId = Uuid;
pub type ClientId = Uuid;
pub type CollectorId = Uuid;
pub type StaffId = Uuid;
pub type ScheduleId = Uuid;
pub type StopId = Uuid;
pub type PaymentId = Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("latitude {0} is outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    Longitude(f64),
}

/// Declares a closed, snake_case-labelled enum with `ALL`, `as_str`, `Display` and `FromStr`.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(ModelError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

labelled_enum!(
    /// Lifecycle state of a collection request.
    RequestStatus, "request status" {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
        PaymentConfirmed => "payment_confirmed",
        Assigned => "assigned",
        DeclinedByCollector => "declined_by_collector",
        AcceptedByCollector => "accepted_by_collector",
        EnRoute => "en_route",
        AtLocation => "at_location",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }

    /// States in which a collector is bound to the request.
    pub fn holds_collector(&self) -> bool {
        matches!(
            self,
            RequestStatus::Assigned
                | RequestStatus::AcceptedByCollector
                | RequestStatus::EnRoute
                | RequestStatus::AtLocation
                | RequestStatus::InProgress
        )
    }
}

labelled_enum!(Priority, "priority" {
    Low => "low",
    Medium => "medium",
    Urgent => "urgent",
});

labelled_enum!(ScheduleType, "schedule type" {
    OneTime => "one_time",
    Weekly => "weekly",
    BiWeekly => "bi_weekly",
    Monthly => "monthly",
});

labelled_enum!(
    /// Lifecycle state of a collection schedule.
    ScheduleStatus, "schedule status" {
        Draft => "draft",
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScheduleStatus::Completed | ScheduleStatus::Cancelled)
    }
}

labelled_enum!(Role, "role" {
    Client => "client",
    Staff => "staff",
    Collector => "collector",
});

labelled_enum!(EntityKind, "entity kind" {
    Request => "request",
    Schedule => "schedule",
});

/// Who is performing an operation, as asserted by the authentication collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Client(ClientId),
    Staff(StaffId),
    Collector(CollectorId),
}

impl Actor {
    pub fn new(role: Role, id: Uuid) -> Self {
        match role {
            Role::Client => Actor::Client(id),
            Role::Staff => Actor::Staff(id),
            Role::Collector => Actor::Collector(id),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Actor::Client(_) => Role::Client,
            Actor::Staff(_) => Role::Staff,
            Actor::Collector(_) => Role::Collector,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Actor::Client(id) | Actor::Staff(id) | Actor::Collector(id) => *id,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Actor::Staff(_))
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Client-supplied fields of a new pickup request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub contact: ContactInfo,
    pub barangay: String,
    pub address: String,
    pub priority: Priority,
    pub preferred_date: NaiveDate,
    #[serde(default)]
    pub preferred_time_slot: Option<String>,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub photo_refs: Vec<String>,
}

/// A pickup request and its current lifecycle state.
///
/// `revision` increases by one on every persisted write and is the
/// optimistic-concurrency token checked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub request_number: String,
    pub client_id: ClientId,
    pub contact: ContactInfo,
    pub barangay: String,
    pub address: String,
    pub priority: Priority,
    pub preferred_date: NaiveDate,
    pub preferred_time_slot: Option<String>,
    pub special_instructions: Option<String>,
    pub photo_refs: Vec<String>,
    pub status: RequestStatus,
    pub rejection_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub assigned_collector: Option<CollectorId>,
    pub assignment_notes: Option<String>,
    pub completed_by: Option<CollectorId>,
    pub payment_id: Option<PaymentId>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(
        id: RequestId,
        request_number: String,
        client_id: ClientId,
        draft: NewRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            request_number,
            client_id,
            contact: draft.contact,
            barangay: draft.barangay,
            address: draft.address,
            priority: draft.priority,
            preferred_date: draft.preferred_date,
            preferred_time_slot: draft.preferred_time_slot,
            special_instructions: draft.special_instructions,
            photo_refs: draft.photo_refs,
            status: RequestStatus::Pending,
            rejection_reason: None,
            cancellation_reason: None,
            assigned_collector: None,
            assignment_notes: None,
            completed_by: None,
            payment_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Formats the human-readable request number, e.g. `REQ-2026-00042`.
pub fn format_request_number(year: i32, sequence: u64) -> String {
    format!("REQ-{year}-{sequence:05}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub request_id: RequestId,
    pub amount: Decimal,
    pub reference: String,
    pub paid_on: NaiveDate,
    pub recorded_by: Actor,
    pub recorded_at: DateTime<Utc>,
}

/// One status change of a request or schedule. Creation entries have no `from_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(
        entity_kind: EntityKind,
        entity_id: Uuid,
        from_status: Option<&str>,
        to_status: &str,
        actor: Actor,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            from_status: from_status.map(ToString::to_string),
            to_status: to_status.to_string(),
            actor,
            at,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorProfile {
    pub id: CollectorId,
    pub name: String,
    #[serde(default)]
    pub contact_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorRating {
    pub id: Uuid,
    pub request_id: RequestId,
    pub collector_id: CollectorId,
    pub client_id: ClientId,
    pub stars: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read-time aggregate of a collector's assignments and ratings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectorWorkload {
    pub active_assignments: u32,
    pub completed_today: u32,
    pub rating_count: u32,
    pub average_rating: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Result<Self, ModelError> {
        let point = Self { lat, lng };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(ModelError::Latitude(self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(ModelError::Longitude(self.lng));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStop {
    pub location_name: String,
    #[serde(default)]
    pub location_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub barangay: Option<String>,
    #[serde(default)]
    pub coordinates: Option<GeoPoint>,
    /// Pickup request this stop serves, if it was planned for one.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// A location on a schedule's route. Its position is its index in `Schedule::stops`.
///
/// Completion is tracked per stop; it never changes the linked request's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub location_name: String,
    pub location_type: Option<String>,
    pub address: Option<String>,
    pub barangay: Option<String>,
    pub coordinates: Option<GeoPoint>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_by: Option<Actor>,
}

impl Stop {
    pub fn from_new(stop: NewStop) -> Result<Self, ModelError> {
        if let Some(point) = &stop.coordinates {
            point.validate()?;
        }
        Ok(Self {
            id: Uuid::new_v4(),
            location_name: stop.location_name,
            location_type: stop.location_type,
            address: stop.address,
            barangay: stop.barangay,
            coordinates: stop.coordinates,
            request_id: stop.request_id,
            completed_at: None,
            completed_by: None,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub primary_collector: Option<CollectorId>,
    #[serde(default)]
    pub backup_collector: Option<CollectorId>,
    #[serde(default)]
    pub stops: Vec<NewStop>,
}

/// `null` in a patch body arrives as `Some(None)`; an absent key stays `None`.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Field-level patch. `stops`, when present, replaces the whole ordered list.
///
/// Clearable fields are doubly optional: `Some(None)` removes the value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<Option<NaiveDate>>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub primary_collector: Option<Option<CollectorId>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub backup_collector: Option<Option<CollectorId>>,
    #[serde(default)]
    pub stops: Option<Vec<NewStop>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub description: Option<String>,
    pub schedule_type: ScheduleType,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: ScheduleStatus,
    pub special_instructions: Option<String>,
    pub primary_collector: Option<CollectorId>,
    pub backup_collector: Option<CollectorId>,
    pub stops: Vec<Stop>,
    pub created_by: StaffId,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn stop_position(&self, stop_id: StopId) -> Option<usize> {
        self.stops.iter().position(|s| s.id == stop_id)
    }
}
