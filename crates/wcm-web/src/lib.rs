//! Axum JSON API over the waste-collection engine.
//!
//! Identity comes from the `x-actor-role` / `x-actor-id` headers set by the
//! upstream authentication layer; this crate trusts them as given.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;
use wcm_core::{
    Actor, AuditEntry, CollectorProfile, CollectorRating, GeoPoint, NewRequest, NewSchedule,
    NewStop, PaymentRecord, Request, RequestStatus, Role, Schedule, SchedulePatch, ScheduleStatus,
};
use wcm_engine::requests::sees_all_requests;
use wcm_engine::routing::{self, RoutePlan, RoutePoint};
use wcm_engine::{
    engine_from_config, AssignmentOutcome, Candidate, CollectorStatus, Engine, EngineConfig,
    EngineError, NewCollector, PaymentInput, RatingInput,
};

pub const CRATE_NAME: &str = "wcm-web";

pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    MissingActor,
    BadActor(String),
    /// Body, path or query string could not be decoded.
    Input { status: StatusCode, message: String },
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Input {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Input {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Input {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
struct ApiPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
struct ApiQuery<T>(T);

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'static str>,
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidTransition { .. } | EngineError::StaleState { .. } => StatusCode::CONFLICT,
        EngineError::RequestNotFound(_)
        | EngineError::ScheduleNotFound(_)
        | EngineError::StopNotFound { .. }
        | EngineError::CollectorNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Validation(_) | EngineError::EmptyRoute(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        EngineError::Payment(_) => StatusCode::BAD_GATEWAY,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Engine(err) => {
                let (current_state, operation) = match err {
                    EngineError::InvalidTransition {
                        current, operation, ..
                    } => (Some(current.clone()), Some(*operation)),
                    EngineError::Unauthorized { operation, .. } => (None, Some(*operation)),
                    _ => (None, None),
                };
                (
                    status_for(err),
                    ErrorBody {
                        code: err.code(),
                        message: err.to_string(),
                        current_state,
                        operation,
                    },
                )
            }
            ApiError::MissingActor => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "missing_actor",
                    message: format!("{ACTOR_ROLE_HEADER} and {ACTOR_ID_HEADER} headers are required"),
                    current_state: None,
                    operation: None,
                },
            ),
            ApiError::BadActor(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "bad_actor",
                    message: message.clone(),
                    current_state: None,
                    operation: None,
                },
            ),
            ApiError::Input { status, message } => (
                *status,
                ErrorBody {
                    code: "invalid_input",
                    message: message.clone(),
                    current_state: None,
                    operation: None,
                },
            ),
        };
        if status.is_server_error() {
            error!(code = body.code, error = %body.message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// The caller, as asserted by the identity headers.
#[derive(Debug, Clone, Copy)]
pub struct CurrentActor(pub Actor);

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let (Some(role), Some(id)) = (
            header_value(parts, ACTOR_ROLE_HEADER),
            header_value(parts, ACTOR_ID_HEADER),
        ) else {
            return Err(ApiError::MissingActor);
        };
        let role: Role = role
            .parse()
            .map_err(|_| ApiError::BadActor(format!("unknown actor role '{role}'")))?;
        let id = Uuid::parse_str(id).map_err(|_| ApiError::BadActor(format!("actor id '{id}' is not a uuid")))?;
        Ok(CurrentActor(Actor::new(role, id)))
    }
}

#[derive(Debug, Deserialize, Default)]
struct RequestListQuery {
    status: Option<RequestStatus>,
}

#[derive(Debug, Deserialize, Default)]
struct ScheduleListQuery {
    status: Option<ScheduleStatus>,
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    reason: String,
}

#[derive(Debug, Deserialize, Default)]
struct OptionalReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssignBody {
    collector_id: Uuid,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwapBody {
    a: Uuid,
    b: Uuid,
}

#[derive(Debug, Deserialize, Default)]
struct OptimizeBody {
    #[serde(default)]
    start: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct RoutePlanBody {
    points: Vec<RoutePoint>,
    #[serde(default)]
    start: Option<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/requests", get(list_requests_handler).post(create_request_handler))
        .route("/requests/{id}", get(get_request_handler))
        .route("/requests/{id}/history", get(request_history_handler))
        .route("/requests/{id}/payments", get(request_payments_handler))
        .route("/requests/{id}/candidates", get(candidates_handler))
        .route("/requests/{id}/accept", post(accept_handler))
        .route("/requests/{id}/reject", post(reject_handler))
        .route("/requests/{id}/payment", post(record_payment_handler))
        .route("/requests/{id}/assign", post(assign_handler))
        .route("/requests/{id}/collector-accept", post(collector_accept_handler))
        .route("/requests/{id}/collector-decline", post(collector_decline_handler))
        .route("/requests/{id}/en-route", post(en_route_handler))
        .route("/requests/{id}/at-location", post(at_location_handler))
        .route("/requests/{id}/in-progress", post(in_progress_handler))
        .route("/requests/{id}/advance", post(advance_handler))
        .route("/requests/{id}/complete", post(complete_handler))
        .route("/requests/{id}/cancel", post(cancel_request_handler))
        .route("/requests/{id}/rating", get(get_rating_handler).post(rating_handler))
        .route("/collectors", get(list_collectors_handler).post(register_collector_handler))
        .route("/collectors/{id}", get(get_collector_handler))
        .route("/schedules", get(list_schedules_handler).post(create_schedule_handler))
        .route(
            "/schedules/{id}",
            get(get_schedule_handler)
                .patch(update_schedule_handler)
                .delete(delete_schedule_handler),
        )
        .route("/schedules/{id}/history", get(schedule_history_handler))
        .route("/schedules/{id}/duplicate", post(duplicate_schedule_handler))
        .route("/schedules/{id}/activate", post(activate_schedule_handler))
        .route("/schedules/{id}/complete", post(complete_schedule_handler))
        .route("/schedules/{id}/cancel", post(cancel_schedule_handler))
        .route("/schedules/{id}/stops", post(add_stop_handler))
        .route("/schedules/{id}/stops/swap", post(swap_stops_handler))
        .route("/schedules/{id}/stops/{stop_id}", delete(remove_stop_handler))
        .route("/schedules/{id}/stops/{stop_id}/complete", post(complete_stop_handler))
        .route("/schedules/{id}/optimize", post(optimize_schedule_handler))
        .route("/schedules/{id}/route-line", get(route_line_handler))
        .route("/routes/optimize", post(plan_route_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: EngineConfig) -> anyhow::Result<()> {
    let engine = engine_from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(EngineConfig::from_env()).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn list_requests_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiQuery(query): ApiQuery<RequestListQuery>,
) -> ApiResult<Vec<Request>> {
    let mut requests = state.engine.requests.list(query.status).await?;
    if !sees_all_requests(&actor) {
        requests.retain(|r| r.client_id == actor.id());
    }
    Ok(Json(requests))
}

async fn create_request_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiJson(draft): ApiJson<NewRequest>,
) -> Result<(StatusCode, Json<Request>), ApiError> {
    let request = state.engine.requests.create(&actor, draft).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn visible_request(state: &AppState, actor: &Actor, id: Uuid) -> Result<Request, ApiError> {
    let request = state.engine.requests.get(id).await?;
    if !sees_all_requests(actor) && request.client_id != actor.id() {
        return Err(EngineError::Unauthorized {
            role: actor.role(),
            operation: "view_request",
        }
        .into());
    }
    Ok(request)
}

async fn get_request_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(visible_request(&state, &actor, id).await?))
}

async fn request_history_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Vec<AuditEntry>> {
    visible_request(&state, &actor, id).await?;
    Ok(Json(state.engine.requests.history(id).await?))
}

async fn request_payments_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Vec<PaymentRecord>> {
    visible_request(&state, &actor, id).await?;
    Ok(Json(state.engine.requests.payments(id).await?))
}

async fn candidates_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Vec<Candidate>> {
    if !actor.is_staff() {
        return Err(EngineError::Unauthorized {
            role: actor.role(),
            operation: "list_candidates",
        }
        .into());
    }
    Ok(Json(state.engine.assignment.candidates(id).await?))
}

async fn accept_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.accept(&actor, id).await?))
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<ReasonBody>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.reject(&actor, id, &body.reason).await?))
}

async fn record_payment_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<PaymentInput>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.record_payment(&actor, id, body).await?))
}

async fn assign_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<AssignBody>,
) -> ApiResult<AssignmentOutcome> {
    Ok(Json(
        state
            .engine
            .assignment
            .assign(&actor, id, body.collector_id, body.notes)
            .await?,
    ))
}

async fn collector_accept_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.collector_accept(&actor, id).await?))
}

async fn collector_decline_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<OptionalReasonBody>,
) -> ApiResult<Request> {
    Ok(Json(
        state
            .engine
            .requests
            .collector_decline(&actor, id, body.reason)
            .await?,
    ))
}

async fn en_route_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.mark_en_route(&actor, id).await?))
}

async fn at_location_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.mark_at_location(&actor, id).await?))
}

async fn in_progress_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.mark_in_progress(&actor, id).await?))
}

async fn advance_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.advance(&actor, id).await?))
}

async fn complete_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.complete(&actor, id).await?))
}

async fn cancel_request_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<ReasonBody>,
) -> ApiResult<Request> {
    Ok(Json(state.engine.requests.cancel(&actor, id, &body.reason).await?))
}

async fn rating_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<RatingInput>,
) -> Result<(StatusCode, Json<CollectorRating>), ApiError> {
    let rating = state.engine.requests.rate_collector(&actor, id, body).await?;
    Ok((StatusCode::CREATED, Json(rating)))
}

async fn get_rating_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Option<CollectorRating>> {
    visible_request(&state, &actor, id).await?;
    Ok(Json(state.engine.requests.rating(id).await?))
}

async fn list_collectors_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<CollectorStatus>> {
    Ok(Json(state.engine.directory.snapshot().await?))
}

async fn register_collector_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiJson(body): ApiJson<NewCollector>,
) -> Result<(StatusCode, Json<CollectorProfile>), ApiError> {
    let profile = state.engine.directory.register(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn get_collector_handler(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<CollectorStatus> {
    Ok(Json(state.engine.directory.get(id).await?))
}

async fn list_schedules_handler(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ScheduleListQuery>,
) -> ApiResult<Vec<Schedule>> {
    Ok(Json(state.engine.schedules.list(query.status).await?))
}

async fn create_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiJson(body): ApiJson<NewSchedule>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let schedule = state.engine.schedules.create(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn get_schedule_handler(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<Uuid>) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.get(id).await?))
}

async fn update_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(patch): ApiJson<SchedulePatch>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.update(&actor, id, patch).await?))
}

async fn delete_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.schedules.delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn schedule_history_handler(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Vec<AuditEntry>> {
    Ok(Json(state.engine.schedules.history(id).await?))
}

async fn duplicate_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let copy = state.engine.schedules.duplicate(&actor, id).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

async fn activate_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.activate(&actor, id).await?))
}

async fn complete_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.complete(&actor, id).await?))
}

async fn cancel_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<OptionalReasonBody>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.cancel(&actor, id, body.reason).await?))
}

async fn add_stop_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(stop): ApiJson<NewStop>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.add_stop(&actor, id, stop).await?))
}

async fn remove_stop_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath((id, stop_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.remove_stop(&actor, id, stop_id).await?))
}

async fn complete_stop_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath((id, stop_id)): ApiPath<(Uuid, Uuid)>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.complete_stop(&actor, id, stop_id).await?))
}

async fn swap_stops_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<SwapBody>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.swap_stops(&actor, id, body.a, body.b).await?))
}

async fn optimize_schedule_handler(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<OptimizeBody>,
) -> ApiResult<Schedule> {
    Ok(Json(state.engine.schedules.optimize(&actor, id, body.start).await?))
}

async fn route_line_handler(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Vec<GeoPoint>> {
    Ok(Json(state.engine.schedules.route_line(id).await?))
}

async fn plan_route_handler(ApiJson(body): ApiJson<RoutePlanBody>) -> ApiResult<RoutePlan> {
    for point in &body.points {
        GeoPoint::new(point.lat, point.lng).map_err(EngineError::from)?;
    }
    let plan = routing::plan_route(&body.points, body.start)
        .map_err(|err| EngineError::validation(err.to_string()))?;
    Ok(Json(plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Method;
    use chrono::FixedOffset;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wcm_ports::{RecordingNotifier, StaticAttendance};
    use wcm_storage::MemoryStore;

    fn test_app() -> Router {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::new()),
            Arc::new(StaticAttendance::default()),
            offset,
        );
        app(AppState::new(engine))
    }

    async fn call(app: &Router, method: Method, uri: &str, actor: Option<Actor>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            builder = builder
                .header(ACTOR_ROLE_HEADER, actor.role().as_str())
                .header(ACTOR_ID_HEADER, actor.id().to_string());
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn new_request_body() -> Value {
        json!({
            "contact": { "name": "Ana Reyes", "phone": "09171234567" },
            "barangay": "Concepcion",
            "address": "21 Bonifacio St",
            "priority": "medium",
            "preferred_date": "2026-08-03"
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let (status, body) = call(&test_app(), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn identity_headers_are_required_and_checked() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, "/requests", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "missing_actor");

        let request = axum::http::Request::builder()
            .uri("/requests")
            .header(ACTOR_ROLE_HEADER, "mayor")
            .header(ACTOR_ID_HEADER, Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn request_lifecycle_over_http() {
        let app = test_app();
        let client = Actor::Client(Uuid::new_v4());
        let staff = Actor::Staff(Uuid::new_v4());

        let (status, created) = call(&app, Method::POST, "/requests", Some(client), Some(new_request_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::POST, &format!("/requests/{id}/accept"), Some(client), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["operation"], "accept");

        let (status, body) = call(&app, Method::POST, &format!("/requests/{id}/accept"), Some(staff), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/requests/{id}/reject"),
            Some(staff),
            Some(json!({ "reason": "duplicate" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_transition");
        assert_eq!(body["current_state"], "accepted");
        assert_eq!(body["operation"], "reject");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/requests/{id}/payment"),
            Some(client),
            Some(json!({ "amount": "500.00", "reference": "REF-001", "paid_on": "2026-08-01" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "payment_confirmed");

        let (status, collector) = call(
            &app,
            Method::POST,
            "/collectors",
            Some(staff),
            Some(json!({ "name": "Carlo" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let collector_id = collector["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/requests/{id}/assign"),
            Some(staff),
            Some(json!({ "collector_id": collector_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["request"]["status"], "assigned");
        assert_eq!(body["off_duty_override"], true);

        let (status, history) = call(&app, Method::GET, &format!("/requests/{id}/history"), Some(client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn empty_rejection_reason_is_unprocessable() {
        let app = test_app();
        let client = Actor::Client(Uuid::new_v4());
        let (_, created) = call(&app, Method::POST, "/requests", Some(client), Some(new_request_body())).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/requests/{id}/reject"),
            Some(Actor::Staff(Uuid::new_v4())),
            Some(json!({ "reason": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "validation_error");
    }

    #[tokio::test]
    async fn clients_only_see_their_own_requests() {
        let app = test_app();
        let alice = Actor::Client(Uuid::new_v4());
        let bob = Actor::Client(Uuid::new_v4());
        let (_, created) = call(&app, Method::POST, "/requests", Some(alice), Some(new_request_body())).await;
        call(&app, Method::POST, "/requests", Some(bob), Some(new_request_body())).await;

        let (_, mine) = call(&app, Method::GET, "/requests", Some(alice), None).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
        let (_, all) = call(&app, Method::GET, "/requests?status=pending", Some(Actor::Staff(Uuid::new_v4())), None).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let id = created["id"].as_str().unwrap();
        let (status, _) = call(&app, Method::GET, &format!("/requests/{id}"), Some(bob), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let (status, body) = call(
            &test_app(),
            Method::POST,
            &format!("/requests/{}/accept", Uuid::new_v4()),
            Some(Actor::Staff(Uuid::new_v4())),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "request_not_found");
    }

    #[tokio::test]
    async fn empty_schedule_cannot_be_activated() {
        let app = test_app();
        let staff = Actor::Staff(Uuid::new_v4());
        let (status, schedule) = call(
            &app,
            Method::POST,
            "/schedules",
            Some(staff),
            Some(json!({
                "name": "Saturday market run",
                "schedule_type": "weekly",
                "start_date": "2026-08-08",
                "start_time": "05:00:00",
                "end_time": "09:00:00"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = schedule["id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::POST, &format!("/schedules/{id}/activate"), Some(staff), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "empty_route");

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/schedules/{id}/stops"),
            Some(staff),
            Some(json!({ "location_name": "Public market", "coordinates": { "lat": 14.65, "lng": 121.03 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, &format!("/schedules/{id}/activate"), Some(staff), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, _) = call(&app, Method::DELETE, &format!("/schedules/{id}"), Some(staff), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn route_planning_endpoint_orders_by_nearest_neighbour() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        let (status, body) = call(
            &test_app(),
            Method::POST,
            "/routes/optimize",
            None,
            Some(json!({
                "points": [
                    { "id": a, "lat": 0.0, "lng": 0.0 },
                    { "id": b, "lat": 0.0, "lng": 3.0 },
                    { "id": c, "lat": 0.0, "lng": 1.0 }
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order"], json!([a, c, b]));

        let (status, _) = call(
            &test_app(),
            Method::POST,
            "/routes/optimize",
            None,
            Some(json!({ "points": [ { "id": a, "lat": 120.0, "lng": 0.0 } ] })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    async fn schedule_with_stops(app: &Router, staff: Actor, crew: Option<&str>) -> Value {
        let mut body = json!({
            "name": "Thursday east loop",
            "schedule_type": "weekly",
            "start_date": "2026-08-06",
            "start_time": "06:00:00",
            "end_time": "10:00:00",
            "stops": [
                { "location_name": "A", "coordinates": { "lat": 0.0, "lng": 0.0 } },
                { "location_name": "B", "coordinates": { "lat": 0.0, "lng": 1.0 } },
                { "location_name": "C", "coordinates": { "lat": 0.0, "lng": 2.0 } }
            ]
        });
        if let Some(crew) = crew {
            body["primary_collector"] = json!(crew);
        }
        let (status, schedule) = call(app, Method::POST, "/schedules", Some(staff), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        schedule
    }

    fn stop_names(schedule: &Value) -> Vec<String> {
        schedule["stops"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["location_name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn stops_can_be_swapped_over_http() {
        let app = test_app();
        let staff = Actor::Staff(Uuid::new_v4());
        let schedule = schedule_with_stops(&app, staff, None).await;
        let id = schedule["id"].as_str().unwrap();
        let a = schedule["stops"][0]["id"].clone();
        let c = schedule["stops"][2]["id"].clone();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/schedules/{id}/stops/swap"),
            Some(staff),
            Some(json!({ "a": a, "b": c })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stop_names(&body), vec!["C", "B", "A"]);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/schedules/{id}/stops/swap"),
            Some(staff),
            Some(json!({ "a": a, "b": Uuid::new_v4() })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "stop_not_found");
    }

    #[tokio::test]
    async fn crew_completes_stops_on_an_active_schedule() {
        let app = test_app();
        let staff = Actor::Staff(Uuid::new_v4());
        let (_, collector) = call(&app, Method::POST, "/collectors", Some(staff), Some(json!({ "name": "Dodong" }))).await;
        let crew_id = collector["id"].as_str().unwrap().to_string();
        let schedule = schedule_with_stops(&app, staff, Some(&crew_id)).await;
        let id = schedule["id"].as_str().unwrap();
        let stop = schedule["stops"][1]["id"].as_str().unwrap();
        let uri = format!("/schedules/{id}/stops/{stop}/complete");
        let crew = Actor::Collector(crew_id.parse().unwrap());

        let (status, body) = call(&app, Method::POST, &uri, Some(crew), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["current_state"], "draft");

        call(&app, Method::POST, &format!("/schedules/{id}/activate"), Some(staff), None).await;
        let (status, body) = call(&app, Method::POST, &uri, Some(Actor::Collector(Uuid::new_v4())), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["operation"], "complete_stop");

        let (status, body) = call(&app, Method::POST, &uri, Some(crew), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stop_names(&body), vec!["A", "B", "C"]);
        assert!(body["stops"][1]["completed_at"].is_string());
        assert!(body["stops"][0]["completed_at"].is_null());
    }

    #[tokio::test]
    async fn rating_lookup_follows_request_visibility() {
        let app = test_app();
        let owner = Actor::Client(Uuid::new_v4());
        let (_, created) = call(&app, Method::POST, "/requests", Some(owner), Some(new_request_body())).await;
        let uri = format!("/requests/{}/rating", created["id"].as_str().unwrap());

        let (status, body) = call(&app, Method::GET, &uri, Some(owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);

        let (status, _) = call(&app, Method::GET, &uri, Some(Actor::Client(Uuid::new_v4())), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, Method::POST, &uri, Some(owner), Some(json!({ "stars": 5 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["operation"], "rate_collector");
    }

    #[tokio::test]
    async fn undecodable_input_gets_a_structured_error() {
        let app = test_app();
        let client = Actor::Client(Uuid::new_v4());

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/requests")
            .header(ACTOR_ROLE_HEADER, "client")
            .header(ACTOR_ID_HEADER, client.id().to_string())
            .header("content-type", "application/json")
            .body(Body::from("{ not json"))
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "invalid_input");
        assert!(body["message"].is_string());

        let (status, body) = call(&app, Method::POST, "/requests", Some(client), Some(json!({ "barangay": "Concepcion" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "invalid_input");

        let (status, body) = call(&app, Method::GET, "/requests/not-a-uuid", Some(client), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, body) = call(&app, Method::GET, "/schedules?status=archived", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");
    }
}
