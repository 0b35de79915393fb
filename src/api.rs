// REST API - axum router over the ledger
//
// Every route lives under /api and answers with the same JSON envelope:
// {success, data?, error?}. Errors map onto HTTP codes through
// LedgerError::status_code().

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::db::{get_events_for_entity, Database, Event};
use crate::distributor::{self, SplitOutcome};
use crate::entities::{agent, cow_group, donation, donor};
use crate::entities::{
    Agent, AgentName, AgentSummary, AgentWorkload, CowGroup, CowGroupDetail, DashboardCounts,
    Donation, DonationDetail, DonationStatus, Donor, DonorSummary, NewDonation, NewDonor,
};
use crate::error::LedgerError;
use crate::store::AssignmentPair;

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn created(data: T) -> (StatusCode, Json<Self>) {
        (StatusCode::CREATED, Self::ok(data))
    }
}

/// Ledger error on its way out as an HTTP response
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(LedgerError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self.0, "request rejected");
        }

        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;
type Created<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: DonationStatus,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub donation_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SplitRequest {
    pub agent_names: Vec<String>,
}

// ============================================================================
// Donors
// ============================================================================

/// GET /api/health
async fn health_check() -> Json<ApiResponse<&'static str>> {
    ApiResponse::ok("OK")
}

/// GET /api/donors
async fn list_donors(State(state): State<ApiState>) -> ApiResult<Vec<DonorSummary>> {
    Ok(ApiResponse::ok(state.db.read(donor::list_donors)?))
}

/// POST /api/donors
async fn create_donor(
    State(state): State<ApiState>,
    body: Result<Json<NewDonor>, JsonRejection>,
) -> Created<Donor> {
    let Json(new) = body?;
    Ok(ApiResponse::created(donor::create_donor(&state.db, &new)?))
}

/// GET /api/donors/:id
async fn get_donor(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<DonorSummary> {
    Ok(ApiResponse::ok(state.db.read(|conn| donor::get_donor(conn, id))?))
}

/// PUT /api/donors/:id
async fn update_donor(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    body: Result<Json<NewDonor>, JsonRejection>,
) -> ApiResult<Donor> {
    let Json(update) = body?;
    Ok(ApiResponse::ok(donor::update_donor(&state.db, id, &update)?))
}

/// DELETE /api/donors/:id
async fn delete_donor(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<&'static str> {
    donor::delete_donor(&state.db, id)?;
    Ok(ApiResponse::ok("deleted"))
}

/// GET /api/donors/:id/donations
async fn donor_donations(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Donation>> {
    Ok(ApiResponse::ok(
        state.db.read(|conn| donor::donations_for_donor(conn, id))?,
    ))
}

// ============================================================================
// Donations
// ============================================================================

/// GET /api/donations
async fn list_donations(State(state): State<ApiState>) -> ApiResult<Vec<DonationDetail>> {
    Ok(ApiResponse::ok(state.db.read(donation::list_donations)?))
}

/// POST /api/donations - cow donations join a cow group in the same write
async fn create_donation(
    State(state): State<ApiState>,
    body: Result<Json<NewDonation>, JsonRejection>,
) -> Created<Donation> {
    let Json(new) = body?;
    Ok(ApiResponse::created(donation::create_donation(&state.db, &new)?))
}

/// GET /api/donations/dashboard-counts
async fn dashboard_counts(State(state): State<ApiState>) -> ApiResult<DashboardCounts> {
    Ok(ApiResponse::ok(state.db.read(donation::dashboard_counts)?))
}

/// GET /api/donations/status/:status
async fn donations_by_status(
    State(state): State<ApiState>,
    Path(status): Path<String>,
) -> ApiResult<Vec<DonationDetail>> {
    let status: DonationStatus = status.parse()?;
    Ok(ApiResponse::ok(
        state.db.read(|conn| donation::donations_by_status(conn, status))?,
    ))
}

/// GET /api/donations/:id
async fn get_donation(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<DonationDetail> {
    Ok(ApiResponse::ok(state.db.read(|conn| donation::get_donation(conn, id))?))
}

/// PUT /api/donations/:id/status
async fn update_donation_status(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> ApiResult<Donation> {
    let Json(update) = body?;
    Ok(ApiResponse::ok(donation::update_status(&state.db, id, update.status)?))
}

/// DELETE /api/donations/:id
async fn delete_donation(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<&'static str> {
    donation::delete_donation(&state.db, id)?;
    Ok(ApiResponse::ok("deleted"))
}

// ============================================================================
// Agents
// ============================================================================

/// GET /api/agents
async fn list_agents(State(state): State<ApiState>) -> ApiResult<Vec<AgentSummary>> {
    Ok(ApiResponse::ok(state.db.read(agent::list_agents)?))
}

/// POST /api/agents
async fn create_agent(
    State(state): State<ApiState>,
    body: Result<Json<AgentName>, JsonRejection>,
) -> Created<Agent> {
    let Json(body) = body?;
    Ok(ApiResponse::created(agent::create_agent(&state.db, &body.agent_name)?))
}

/// GET /api/agents/:id
async fn get_agent(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<AgentSummary> {
    Ok(ApiResponse::ok(state.db.read(|conn| agent::get_agent(conn, id))?))
}

/// PUT /api/agents/:id
async fn rename_agent(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    body: Result<Json<AgentName>, JsonRejection>,
) -> ApiResult<Agent> {
    let Json(body) = body?;
    Ok(ApiResponse::ok(agent::rename_agent(&state.db, id, &body.agent_name)?))
}

/// DELETE /api/agents/:id
async fn delete_agent(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<&'static str> {
    agent::delete_agent(&state.db, id)?;
    Ok(ApiResponse::ok("deleted"))
}

/// GET /api/agents/:id/donations
async fn agent_donations(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<AgentWorkload> {
    Ok(ApiResponse::ok(state.db.read(|conn| agent::agent_workload(conn, id))?))
}

/// POST /api/agents/:id/assign
async fn assign_donations(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    body: Result<Json<AssignRequest>, JsonRejection>,
) -> ApiResult<Vec<AssignmentPair>> {
    let Json(request) = body?;
    Ok(ApiResponse::ok(distributor::assign_donations_to_agent(
        &state.db,
        id,
        &request.donation_ids,
    )?))
}

/// POST /api/agents/split
async fn split_donations(
    State(state): State<ApiState>,
    body: Result<Json<SplitRequest>, JsonRejection>,
) -> ApiResult<SplitOutcome> {
    let Json(request) = body?;
    Ok(ApiResponse::ok(distributor::split_pending(
        &state.db,
        &request.agent_names,
    )?))
}

// ============================================================================
// Cow groups and audit trail
// ============================================================================

/// GET /api/cow-groups
async fn list_cow_groups(State(state): State<ApiState>) -> ApiResult<Vec<CowGroup>> {
    Ok(ApiResponse::ok(state.db.read(cow_group::list_cow_groups)?))
}

/// GET /api/cow-groups/:id
async fn get_cow_group(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<CowGroupDetail> {
    Ok(ApiResponse::ok(state.db.read(|conn| cow_group::get_cow_group(conn, id))?))
}

/// GET /api/events/:entity_type/:entity_id
async fn entity_events(
    State(state): State<ApiState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> ApiResult<Vec<Event>> {
    Ok(ApiResponse::ok(state.db.read(|conn| {
        get_events_for_entity(conn, &entity_type, &entity_id)
    })?))
}

// ============================================================================
// Router
// ============================================================================

/// Full application router, `/api` routes plus tracing and CORS layers
pub fn router(db: Database) -> Router {
    let state = ApiState { db };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/donors", get(list_donors).post(create_donor))
        .route(
            "/donors/:id",
            get(get_donor).put(update_donor).delete(delete_donor),
        )
        .route("/donors/:id/donations", get(donor_donations))
        .route("/donations", get(list_donations).post(create_donation))
        .route("/donations/dashboard-counts", get(dashboard_counts))
        .route("/donations/status/:status", get(donations_by_status))
        .route("/donations/:id", get(get_donation).delete(delete_donation))
        .route("/donations/:id/status", put(update_donation_status))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/agents/split", post(split_donations))
        .route(
            "/agents/:id",
            get(get_agent).put(rename_agent).delete(delete_agent),
        )
        .route("/agents/:id/donations", get(agent_donations))
        .route("/agents/:id/assign", post(assign_donations))
        .route("/cow-groups", get(list_cow_groups))
        .route("/cow-groups/:id", get(get_cow_group))
        .route("/events/:entity_type/:entity_id", get(entity_events))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
