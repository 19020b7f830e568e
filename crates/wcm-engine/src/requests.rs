//! Request service: loads a snapshot, runs it through the state machine and
//! commits the result with a revision check.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use wcm_core::{
    format_request_number, Actor, AuditEntry, CollectorRating, EntityKind, NewRequest,
    PaymentRecord, Request, RequestId, RequestStatus, Role,
};
use wcm_ports::{Notification, Notifier, PaymentLedger, PortError};
use wcm_storage::{Store, StoreError};

use crate::error::EngineError;
use crate::lifecycle::{self, Command, Transition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInput {
    pub amount: Decimal,
    pub reference: String,
    pub paid_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingInput {
    pub stars: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Payment collaborator that simply keeps the record in the engine's own store.
pub struct StoreLedger {
    store: Arc<dyn Store>,
}

impl StoreLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PaymentLedger for StoreLedger {
    async fn record(&self, payment: &PaymentRecord) -> Result<(), PortError> {
        self.store
            .insert_payment(payment)
            .await
            .map_err(|err| PortError::Rejected(err.to_string()))
    }
}

#[derive(Clone)]
pub struct RequestService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    ledger: Arc<dyn PaymentLedger>,
    utc_offset: FixedOffset,
}

impl RequestService {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        ledger: Arc<dyn PaymentLedger>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            notifier,
            ledger,
            utc_offset,
        }
    }

    pub async fn create(&self, actor: &Actor, draft: NewRequest) -> Result<Request, EngineError> {
        let Actor::Client(client_id) = *actor else {
            return Err(EngineError::Unauthorized {
                role: actor.role(),
                operation: "create_request",
            });
        };
        let draft = normalize_draft(draft)?;

        let now = Utc::now();
        let sequence = self.store.next_request_sequence().await?;
        let year = now.with_timezone(&self.utc_offset).year();
        let request = Request::new(
            Uuid::new_v4(),
            format_request_number(year, sequence),
            client_id,
            draft,
            now,
        );
        let audit = AuditEntry::new(
            EntityKind::Request,
            request.id,
            None,
            RequestStatus::Pending.as_str(),
            *actor,
            now,
            None,
        );
        self.store.insert_request(&request, &audit).await?;
        info!(
            request_id = %request.id,
            request_number = %request.request_number,
            barangay = %request.barangay,
            "request created"
        );
        Ok(request)
    }

    pub async fn get(&self, id: RequestId) -> Result<Request, EngineError> {
        self.store
            .get_request(id)
            .await?
            .ok_or(EngineError::RequestNotFound(id))
    }

    pub async fn list(&self, status: Option<RequestStatus>) -> Result<Vec<Request>, EngineError> {
        Ok(self.store.list_requests(status).await?)
    }

    pub async fn history(&self, id: RequestId) -> Result<Vec<AuditEntry>, EngineError> {
        self.get(id).await?;
        Ok(self.store.audit_trail(id).await?)
    }

    pub async fn payments(&self, id: RequestId) -> Result<Vec<PaymentRecord>, EngineError> {
        self.get(id).await?;
        Ok(self.store.payments_for_request(id).await?)
    }

    pub async fn accept(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::Accept).await
    }

    pub async fn reject(&self, actor: &Actor, id: RequestId, reason: &str) -> Result<Request, EngineError> {
        self.transition(
            actor,
            id,
            Command::Reject {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Validates the transition first, then captures the payment with the ledger,
    /// then commits. A ledger failure leaves the request at `accepted`.
    pub async fn record_payment(
        &self,
        actor: &Actor,
        id: RequestId,
        input: PaymentInput,
    ) -> Result<Request, EngineError> {
        let current = self.get(id).await?;
        let now = Utc::now();
        let payment = PaymentRecord {
            id: Uuid::new_v4(),
            request_id: id,
            amount: input.amount,
            reference: input.reference.trim().to_string(),
            paid_on: input.paid_on,
            recorded_by: *actor,
            recorded_at: now,
        };
        let transition = lifecycle::apply(
            &current,
            actor,
            Command::RecordPayment {
                payment: payment.clone(),
            },
            now,
        )?;
        self.ledger.record(&payment).await.map_err(EngineError::Payment)?;
        self.commit(&current, transition).await
    }

    pub async fn collector_accept(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::CollectorAccept).await
    }

    pub async fn collector_decline(
        &self,
        actor: &Actor,
        id: RequestId,
        reason: Option<String>,
    ) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::CollectorDecline { reason }).await
    }

    pub async fn mark_en_route(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::MarkEnRoute).await
    }

    pub async fn mark_at_location(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::MarkAtLocation).await
    }

    pub async fn mark_in_progress(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::MarkInProgress).await
    }

    /// Moves to whichever progress state follows the current one.
    pub async fn advance(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        let current = self.get(id).await?;
        let command = lifecycle::next_progress_step(current.status)
            .and_then(Command::progress)
            .ok_or_else(|| lifecycle::invalid_transition(&current, "advance"))?;
        let transition = lifecycle::apply(&current, actor, command, Utc::now())?;
        self.commit(&current, transition).await
    }

    pub async fn complete(&self, actor: &Actor, id: RequestId) -> Result<Request, EngineError> {
        self.transition(actor, id, Command::Complete).await
    }

    pub async fn cancel(&self, actor: &Actor, id: RequestId, reason: &str) -> Result<Request, EngineError> {
        self.transition(
            actor,
            id,
            Command::Cancel {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// One rating per completed request, by the client who owns it.
    pub async fn rate_collector(
        &self,
        actor: &Actor,
        id: RequestId,
        input: RatingInput,
    ) -> Result<CollectorRating, EngineError> {
        let request = self.get(id).await?;
        if request.status != RequestStatus::Completed {
            return Err(lifecycle::invalid_transition(&request, "rate_collector"));
        }
        if *actor != Actor::Client(request.client_id) {
            return Err(EngineError::Unauthorized {
                role: actor.role(),
                operation: "rate_collector",
            });
        }
        if !(1..=5).contains(&input.stars) {
            return Err(EngineError::validation("stars must be between 1 and 5"));
        }
        if self.store.rating_for_request(id).await?.is_some() {
            return Err(EngineError::validation("request has already been rated"));
        }
        let collector_id = request
            .completed_by
            .ok_or_else(|| EngineError::validation("request has no completing collector to rate"))?;

        let rating = CollectorRating {
            id: Uuid::new_v4(),
            request_id: id,
            collector_id,
            client_id: request.client_id,
            stars: input.stars,
            comment: input
                .comment
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            created_at: Utc::now(),
        };
        match self.store.insert_rating(&rating).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                return Err(EngineError::validation("request has already been rated"));
            }
            Err(err) => return Err(err.into()),
        }
        info!(request_id = %id, collector_id = %collector_id, stars = rating.stars, "collector rated");
        Ok(rating)
    }

    /// The client's rating of the collector who completed `id`, if one was left.
    pub async fn rating(&self, id: RequestId) -> Result<Option<CollectorRating>, EngineError> {
        self.get(id).await?;
        Ok(self.store.rating_for_request(id).await?)
    }

    pub(crate) async fn transition(
        &self,
        actor: &Actor,
        id: RequestId,
        command: Command,
    ) -> Result<Request, EngineError> {
        let current = self.get(id).await?;
        let transition = lifecycle::apply(&current, actor, command, Utc::now())?;
        self.commit(&current, transition).await
    }

    async fn commit(&self, current: &Request, transition: Transition) -> Result<Request, EngineError> {
        let Transition {
            request,
            audit,
            notifications,
        } = transition;

        let stored = match self
            .store
            .update_request(&request, current.revision, &audit)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                let err = EngineError::from(err);
                if let EngineError::StaleState { expected, actual, .. } = &err {
                    warn!(
                        request_id = %current.id,
                        expected,
                        actual,
                        attempted = %audit.to_status,
                        "stale request write rejected"
                    );
                }
                return Err(err);
            }
        };

        info!(
            request_id = %stored.id,
            from = %current.status,
            to = %stored.status,
            actor = %audit.actor,
            "request transition"
        );
        self.dispatch(notifications).await;
        Ok(stored)
    }

    async fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            if let Err(err) = self.notifier.notify(&notification).await {
                warn!(
                    request_id = %notification.request_id,
                    event = ?notification.event,
                    error = %err,
                    "notification delivery failed"
                );
            }
        }
    }
}

fn required(value: String, field: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn normalize_draft(mut draft: NewRequest) -> Result<NewRequest, EngineError> {
    draft.contact.name = required(draft.contact.name, "requester name")?;
    draft.contact.phone = required(draft.contact.phone, "contact number")?;
    draft.barangay = required(draft.barangay, "barangay")?;
    draft.address = required(draft.address, "address")?;
    draft.photo_refs.retain(|r| !r.trim().is_empty());
    Ok(draft)
}

/// True when the actor may see every request rather than only their own.
pub fn sees_all_requests(actor: &Actor) -> bool {
    actor.role() != Role::Client
}
