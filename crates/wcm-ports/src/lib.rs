//! Collaborator contracts consumed by the lifecycle engine, plus built-in adapters.
//!
//! Notification delivery, attendance and payment capture live outside the core;
//! the engine only sees these traits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use wcm_core::{ClientId, CollectorId, PaymentRecord, RequestId};

pub const CRATE_NAME: &str = "wcm-ports";

#[derive(Debug, Error)]
pub enum PortError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    RequestAccepted,
    RequestRejected,
    CollectorAssigned,
    RequestCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Client(ClientId),
    Collector(CollectorId),
    Staff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub event: NotificationEvent,
    pub request_id: RequestId,
    pub payload: serde_json::Value,
}

/// Delivery is fire-and-forget from the engine's side: an error here is logged
/// and never rolls back the transition that produced the notification.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), PortError>;
}

/// Supplies the on-duty set. The engine treats it as read-only.
#[async_trait]
pub trait AttendanceSource: Send + Sync {
    async fn on_duty(&self) -> Result<HashSet<CollectorId>, PortError>;
}

/// Captures a payment before a request may move to `payment_confirmed`.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn record(&self, payment: &PaymentRecord) -> Result<(), PortError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PortError> {
        info!(
            request_id = %notification.request_id,
            event = ?notification.event,
            recipient = ?notification.recipient,
            "notification"
        );
        Ok(())
    }
}

/// Keeps every notification in memory; used by tests and local demos.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PortError> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn error_is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Pauses between webhook redeliveries. The first retry waits `first_delay`,
/// each later one doubles it, never above `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            retries: 4,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetrySchedule {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(20);
        self.first_delay.saturating_mul(1u32 << doublings).min(self.ceiling)
    }

    /// Longest a single notification can spend waiting between attempts.
    pub fn total_wait(&self) -> Duration {
        (1..=self.retries).map(|r| self.delay_before_retry(r)).sum()
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
    pub max_in_flight: usize,
    pub retry: RetrySchedule,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
            max_in_flight: 8,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug)]
struct WebhookInner {
    client: reqwest::Client,
    url: String,
    in_flight: Semaphore,
    retry: RetrySchedule,
}

/// POSTs each notification as JSON to a single endpoint.
///
/// `notify` hands delivery to a background task and returns immediately;
/// `deliver` performs the POST (with retries) inline.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    inner: Arc<WebhookInner>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, PortError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        info!(
            url = %config.url,
            retries = config.retry.retries,
            max_wait_ms = config.retry.total_wait().as_millis() as u64,
            "webhook notifier ready"
        );
        Ok(Self {
            inner: Arc::new(WebhookInner {
                client,
                url: config.url,
                in_flight: Semaphore::new(config.max_in_flight.max(1)),
                retry: config.retry,
            }),
        })
    }

    pub async fn deliver(&self, notification: &Notification) -> Result<(), PortError> {
        let inner = &self.inner;
        let _permit = inner
            .in_flight
            .acquire()
            .await
            .map_err(|_| PortError::Rejected("webhook notifier is shut down".into()))?;

        let mut retry = 0;
        loop {
            let outcome = inner.client.post(&inner.url).json(notification).send().await;
            let transient = match &outcome {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => status_is_transient(resp.status()),
                Err(err) => error_is_transient(err),
            };
            if !transient || retry >= inner.retry.retries {
                return Err(match outcome {
                    Ok(resp) => PortError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                    Err(err) => PortError::Request(err),
                });
            }
            retry += 1;
            warn!(retry, event = ?notification.event, "webhook delivery failed; retrying");
            tokio::time::sleep(inner.retry.delay_before_retry(retry)).await;
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PortError> {
        let notifier = self.clone();
        let notification = notification.clone();
        let span = info_span!("webhook_notify", request_id = %notification.request_id);
        tokio::spawn(
            async move {
                if let Err(err) = notifier.deliver(&notification).await {
                    warn!(error = %err, event = ?notification.event, "notification delivery failed");
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}

/// Fixed on-duty roster, toggled by whoever owns attendance.
#[derive(Debug, Default)]
pub struct StaticAttendance {
    on_duty: RwLock<HashSet<CollectorId>>,
}

impl StaticAttendance {
    pub fn new(on_duty: impl IntoIterator<Item = CollectorId>) -> Self {
        Self {
            on_duty: RwLock::new(on_duty.into_iter().collect()),
        }
    }

    pub async fn clock_in(&self, collector: CollectorId) {
        self.on_duty.write().await.insert(collector);
    }

    pub async fn clock_out(&self, collector: CollectorId) {
        self.on_duty.write().await.remove(&collector);
    }
}

#[async_trait]
impl AttendanceSource for StaticAttendance {
    async fn on_duty(&self) -> Result<HashSet<CollectorId>, PortError> {
        Ok(self.on_duty.read().await.clone())
    }
}
