//! Request state machine.
//!
//! `allowed_operations` is the single source of truth for which operation is
//! legal in which status. It matches every status without a wildcard, so a new
//! status cannot compile without a rule. `apply` is pure: it validates a command
//! against a request snapshot and returns the next snapshot, the audit row and
//! the notifications to emit. Persisting the result is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use wcm_core::{
    Actor, AuditEntry, CollectorId, EntityKind, PaymentRecord, Request, RequestStatus,
};
use wcm_ports::{Notification, NotificationEvent, Recipient};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Accept,
    Reject,
    RecordPayment,
    AssignCollector,
    CollectorAccept,
    CollectorDecline,
    MarkEnRoute,
    MarkAtLocation,
    MarkInProgress,
    Complete,
    Cancel,
}

impl Operation {
    pub const ALL: [Operation; 11] = [
        Operation::Accept,
        Operation::Reject,
        Operation::RecordPayment,
        Operation::AssignCollector,
        Operation::CollectorAccept,
        Operation::CollectorDecline,
        Operation::MarkEnRoute,
        Operation::MarkAtLocation,
        Operation::MarkInProgress,
        Operation::Complete,
        Operation::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Accept => "accept",
            Operation::Reject => "reject",
            Operation::RecordPayment => "record_payment",
            Operation::AssignCollector => "assign_collector",
            Operation::CollectorAccept => "collector_accept",
            Operation::CollectorDecline => "collector_decline",
            Operation::MarkEnRoute => "mark_en_route",
            Operation::MarkAtLocation => "mark_at_location",
            Operation::MarkInProgress => "mark_in_progress",
            Operation::Complete => "complete",
            Operation::Cancel => "cancel",
        }
    }

    /// Every operation lands in exactly one status.
    pub fn target(&self) -> RequestStatus {
        match self {
            Operation::Accept => RequestStatus::Accepted,
            Operation::Reject => RequestStatus::Rejected,
            Operation::RecordPayment => RequestStatus::PaymentConfirmed,
            Operation::AssignCollector => RequestStatus::Assigned,
            Operation::CollectorAccept => RequestStatus::AcceptedByCollector,
            Operation::CollectorDecline => RequestStatus::DeclinedByCollector,
            Operation::MarkEnRoute => RequestStatus::EnRoute,
            Operation::MarkAtLocation => RequestStatus::AtLocation,
            Operation::MarkInProgress => RequestStatus::InProgress,
            Operation::Complete => RequestStatus::Completed,
            Operation::Cancel => RequestStatus::Cancelled,
        }
    }
}

pub fn allowed_operations(status: RequestStatus) -> &'static [Operation] {
    use Operation::*;
    match status {
        RequestStatus::Pending => &[Accept, Reject, Cancel],
        RequestStatus::Accepted => &[RecordPayment, Cancel],
        RequestStatus::PaymentConfirmed => &[AssignCollector, Cancel],
        RequestStatus::Assigned => &[CollectorAccept, CollectorDecline, Cancel],
        RequestStatus::DeclinedByCollector => &[AssignCollector],
        RequestStatus::AcceptedByCollector => &[MarkEnRoute, Cancel],
        RequestStatus::EnRoute => &[MarkAtLocation],
        RequestStatus::AtLocation => &[MarkInProgress],
        RequestStatus::InProgress => &[Complete],
        RequestStatus::Completed | RequestStatus::Rejected | RequestStatus::Cancelled => &[],
    }
}

pub fn next_status(from: RequestStatus, operation: Operation) -> Option<RequestStatus> {
    allowed_operations(from)
        .contains(&operation)
        .then(|| operation.target())
}

/// The collector-side progress step that follows `status`, if any.
pub fn next_progress_step(status: RequestStatus) -> Option<Operation> {
    match status {
        RequestStatus::AcceptedByCollector => Some(Operation::MarkEnRoute),
        RequestStatus::EnRoute => Some(Operation::MarkAtLocation),
        RequestStatus::AtLocation => Some(Operation::MarkInProgress),
        _ => None,
    }
}

pub fn invalid_transition(request: &Request, operation: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        entity: EntityKind::Request,
        current: request.status.as_str().to_string(),
        operation,
    }
}

/// Fails with `InvalidTransition` unless `operation` is legal from the request's status.
pub fn ensure_allowed(request: &Request, operation: Operation) -> Result<RequestStatus, EngineError> {
    next_status(request.status, operation).ok_or_else(|| invalid_transition(request, operation.as_str()))
}

fn is_bound_collector(request: &Request, actor: &Actor) -> bool {
    matches!((actor, request.assigned_collector), (Actor::Collector(id), Some(bound)) if *id == bound)
}

fn is_owner(request: &Request, actor: &Actor) -> bool {
    *actor == Actor::Client(request.client_id)
}

pub fn authorize(request: &Request, actor: &Actor, operation: Operation) -> Result<(), EngineError> {
    let permitted = match operation {
        Operation::Accept | Operation::Reject | Operation::AssignCollector => actor.is_staff(),
        Operation::RecordPayment | Operation::Cancel => actor.is_staff() || is_owner(request, actor),
        Operation::CollectorAccept
        | Operation::CollectorDecline
        | Operation::MarkEnRoute
        | Operation::MarkAtLocation
        | Operation::MarkInProgress => is_bound_collector(request, actor),
        Operation::Complete => actor.is_staff() || is_bound_collector(request, actor),
    };
    if permitted {
        Ok(())
    } else {
        Err(EngineError::Unauthorized {
            role: actor.role(),
            operation: operation.as_str(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Accept,
    Reject { reason: String },
    RecordPayment { payment: PaymentRecord },
    AssignCollector { collector: CollectorId, notes: Option<String> },
    CollectorAccept,
    CollectorDecline { reason: Option<String> },
    MarkEnRoute,
    MarkAtLocation,
    MarkInProgress,
    Complete,
    Cancel { reason: String },
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Command::Accept => Operation::Accept,
            Command::Reject { .. } => Operation::Reject,
            Command::RecordPayment { .. } => Operation::RecordPayment,
            Command::AssignCollector { .. } => Operation::AssignCollector,
            Command::CollectorAccept => Operation::CollectorAccept,
            Command::CollectorDecline { .. } => Operation::CollectorDecline,
            Command::MarkEnRoute => Operation::MarkEnRoute,
            Command::MarkAtLocation => Operation::MarkAtLocation,
            Command::MarkInProgress => Operation::MarkInProgress,
            Command::Complete => Operation::Complete,
            Command::Cancel { .. } => Operation::Cancel,
        }
    }

    /// Builds the payload-free command for operations that need none.
    pub fn progress(operation: Operation) -> Option<Command> {
        match operation {
            Operation::MarkEnRoute => Some(Command::MarkEnRoute),
            Operation::MarkAtLocation => Some(Command::MarkAtLocation),
            Operation::MarkInProgress => Some(Command::MarkInProgress),
            _ => None,
        }
    }
}

/// Outcome of a legal command: the next snapshot plus what to record and announce.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub request: Request,
    pub audit: AuditEntry,
    pub notifications: Vec<Notification>,
}

fn required_reason(reason: &str, what: &str) -> Result<String, EngineError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_payment(request: &Request, payment: &PaymentRecord) -> Result<(), EngineError> {
    if payment.request_id != request.id {
        return Err(EngineError::validation("payment belongs to a different request"));
    }
    if payment.amount <= rust_decimal::Decimal::ZERO {
        return Err(EngineError::validation("payment amount must be greater than zero"));
    }
    if payment.reference.trim().is_empty() {
        return Err(EngineError::validation("payment reference must not be empty"));
    }
    Ok(())
}

fn notice(
    recipient: Recipient,
    event: NotificationEvent,
    request: &Request,
    payload: serde_json::Value,
) -> Notification {
    Notification {
        recipient,
        event,
        request_id: request.id,
        payload,
    }
}

/// Checks legality, then the actor's role, then the command's own inputs,
/// and produces the transition. Never mutates `request`.
pub fn apply(
    request: &Request,
    actor: &Actor,
    command: Command,
    now: DateTime<Utc>,
) -> Result<Transition, EngineError> {
    let operation = command.operation();
    let to = ensure_allowed(request, operation)?;
    authorize(request, actor, operation)?;

    let mut next = request.clone();
    next.status = to;
    next.updated_at = now;
    let mut reason = None;
    let mut notifications = Vec::new();

    match command {
        Command::Accept => {
            notifications.push(notice(
                Recipient::Client(request.client_id),
                NotificationEvent::RequestAccepted,
                request,
                json!({ "request_number": request.request_number, "next_step": "payment" }),
            ));
        }
        Command::Reject { reason: text } => {
            let text = required_reason(&text, "rejection reason")?;
            next.rejection_reason = Some(text.clone());
            notifications.push(notice(
                Recipient::Client(request.client_id),
                NotificationEvent::RequestRejected,
                request,
                json!({ "request_number": request.request_number, "reason": text }),
            ));
            reason = Some(text);
        }
        Command::RecordPayment { payment } => {
            validate_payment(request, &payment)?;
            next.payment_id = Some(payment.id);
        }
        Command::AssignCollector { collector, notes } => {
            next.assigned_collector = Some(collector);
            next.assignment_notes = optional_text(notes);
            notifications.push(notice(
                Recipient::Collector(collector),
                NotificationEvent::CollectorAssigned,
                request,
                json!({
                    "request_number": request.request_number,
                    "barangay": request.barangay,
                    "address": request.address,
                    "preferred_date": request.preferred_date,
                    "instructions": next.assignment_notes,
                }),
            ));
        }
        Command::CollectorAccept => {}
        Command::CollectorDecline { reason: text } => {
            next.assigned_collector = None;
            next.assignment_notes = None;
            reason = optional_text(text);
        }
        Command::MarkEnRoute | Command::MarkAtLocation | Command::MarkInProgress => {}
        Command::Complete => {
            next.completed_by = request.assigned_collector;
            next.assigned_collector = None;
            next.completed_at = Some(now);
        }
        Command::Cancel { reason: text } => {
            let text = required_reason(&text, "cancellation reason")?;
            next.cancellation_reason = Some(text.clone());
            next.assigned_collector = None;
            next.assignment_notes = None;

            let payload = json!({ "request_number": request.request_number, "reason": text });
            let counterpart = if is_owner(request, actor) {
                Recipient::Staff
            } else {
                Recipient::Client(request.client_id)
            };
            notifications.push(notice(
                counterpart,
                NotificationEvent::RequestCancelled,
                request,
                payload.clone(),
            ));
            if let Some(collector) = request.assigned_collector {
                notifications.push(notice(
                    Recipient::Collector(collector),
                    NotificationEvent::RequestCancelled,
                    request,
                    payload,
                ));
            }
            reason = Some(text);
        }
    }

    let audit = AuditEntry::new(
        EntityKind::Request,
        request.id,
        Some(request.status.as_str()),
        to.as_str(),
        *actor,
        now,
        reason,
    );

    Ok(Transition {
        request: next,
        audit,
        notifications,
    })
}
