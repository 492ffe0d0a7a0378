//! Axum REST API handlers.
//!
//! Handlers are thin: deserialize, call the engine, serialize. Domain
//! errors map to status codes by their taxonomy kind, so a handler
//! never decides a status itself.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::credential;
use crate::errors::{EngineError, ErrorKind};
use crate::event;
use crate::gas;
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror;
use crate::prize;
use crate::registration;
use crate::stage::{self, Stage};
use crate::state::AppState;
use crate::team;
use crate::verify;
use crate::voting;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::InsufficientResource => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::ExternalUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::DataIntegrity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, EngineError>;

pub fn router<G: LedgerGateway + 'static>(state: Arc<AppState<G>>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Events and stage windows
        .route("/events", get(list_events).post(create_event))
        .route(
            "/events/:id",
            get(get_event).patch(update_event).delete(delete_event),
        )
        .route("/events/:id/stats", get(event_stats))
        .route(
            "/events/:id/windows",
            get(get_windows).put(replace_windows),
        )
        // Stage machine
        .route("/events/:id/publish", post(publish_event))
        .route("/events/:id/stage", post(switch_stage))
        .route("/events/:id/transitions", get(list_transitions))
        // Participants, registration, check-in
        .route("/participants", post(upsert_participant))
        .route(
            "/events/:id/register",
            post(register).delete(cancel_registration),
        )
        .route("/events/:id/registrations", get(list_registrations))
        .route("/events/:id/checkin", post(check_in))
        // Credentials
        .route("/events/:id/credentials", get(event_credentials))
        .route("/events/:id/credentials/batch", post(batch_mint))
        .route(
            "/participants/:id/credentials",
            get(participant_credentials),
        )
        // Teams and submissions
        .route("/events/:id/teams", get(list_teams).post(create_team))
        .route("/teams/:id/join", post(join_team))
        .route("/teams/:id/leave", post(leave_team))
        .route("/teams/:id/submission", post(create_submission))
        .route("/submissions/:id", axum::routing::patch(update_submission))
        .route("/events/:id/submissions", get(list_submissions))
        // Voting and results
        .route("/submissions/:id/votes", post(cast_vote))
        .route("/votes/:id/revoke", post(revoke_vote))
        .route("/events/:id/votes", get(vote_history))
        .route("/events/:id/ranking", get(get_ranking))
        // Prize pool
        .route(
            "/events/:id/sponsorships",
            get(list_sponsorships).post(request_sponsorship),
        )
        .route(
            "/events/:id/sponsorships/:sid/approve",
            post(approve_sponsorship),
        )
        .route(
            "/events/:id/sponsorships/:sid/reject",
            post(reject_sponsorship),
        )
        .route("/events/:id/prize-pool", get(get_prize_pool))
        .route("/events/:id/distribution-rules", put(set_distribution_rules))
        .route("/events/:id/teams/:team_id/shares", put(set_team_shares))
        .route("/events/:id/distribute", post(distribute_prizes))
        .route("/events/:id/payouts", get(list_payouts))
        // Ledger plumbing
        .route("/events/:id/verify", get(verify_event))
        .route("/events/:id/transactions", get(list_transactions))
        .route("/gas/estimate", post(estimate_gas))
        .with_state(state)
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────

async fn create_event<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Json(body): Json<event::NewEvent>,
) -> ApiResult<crate::types::Event> {
    Ok(Json(event::create(&state, body).await?))
}

async fn list_events<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
) -> ApiResult<Vec<crate::types::Event>> {
    Ok(Json(event::list(&state.pool).await?))
}

async fn get_event<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<crate::types::Event> {
    Ok(Json(event::load(&state.pool, id).await?))
}

#[derive(Deserialize)]
struct OrganizerAction {
    organizer_id: i64,
}

#[derive(Deserialize)]
struct UpdateEventBody {
    organizer_id: i64,
    #[serde(flatten)]
    patch: event::EventUpdate,
}

async fn update_event<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateEventBody>,
) -> ApiResult<crate::types::Event> {
    Ok(Json(
        event::update(&state, id, body.organizer_id, body.patch).await?,
    ))
}

async fn delete_event<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<OrganizerAction>,
) -> ApiResult<serde_json::Value> {
    event::tombstone(&state, id, body.organizer_id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn event_stats<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<event::EventStats> {
    event::load(&state.pool, id).await?;
    Ok(Json(event::stats(&state.pool, id).await?))
}

async fn get_windows<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::StageWindow>> {
    event::load(&state.pool, id).await?;
    Ok(Json(event::windows(&state.pool, id).await?))
}

#[derive(Deserialize)]
struct ReplaceWindowsBody {
    organizer_id: i64,
    windows: Vec<event::WindowSpec>,
}

async fn replace_windows<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ReplaceWindowsBody>,
) -> ApiResult<Vec<crate::types::StageWindow>> {
    Ok(Json(
        event::set_windows(&state, id, body.organizer_id, body.windows).await?,
    ))
}

// ─────────────────────────────────────────────────────────
// Stage machine
// ─────────────────────────────────────────────────────────

async fn publish_event<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<OrganizerAction>,
) -> ApiResult<stage::StageTransitionEvent> {
    Ok(Json(stage::publish(&state, id, body.organizer_id).await?))
}

#[derive(Deserialize)]
struct SwitchStageBody {
    target: Stage,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct SwitchStageResponse {
    applied: bool,
    transition: Option<stage::StageTransitionEvent>,
}

async fn switch_stage<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<SwitchStageBody>,
) -> ApiResult<SwitchStageResponse> {
    let transition = stage::switch_stage(&state, id, body.target, body.force).await?;
    Ok(Json(SwitchStageResponse {
        applied: transition.is_some(),
        transition,
    }))
}

async fn list_transitions<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<stage::StageTransitionEvent>> {
    event::load(&state.pool, id).await?;
    Ok(Json(stage::transitions(&state.pool, id).await?))
}

// ─────────────────────────────────────────────────────────
// Participants, registration, check-in
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UpsertParticipantBody {
    wallet_address: String,
    #[serde(default)]
    nickname: String,
}

async fn upsert_participant<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Json(body): Json<UpsertParticipantBody>,
) -> ApiResult<crate::types::Participant> {
    Ok(Json(
        registration::upsert_participant(&state.pool, &body.wallet_address, &body.nickname)
            .await?,
    ))
}

#[derive(Deserialize)]
struct ParticipantAction {
    participant_id: i64,
}

async fn register<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ParticipantAction>,
) -> ApiResult<crate::types::Registration> {
    Ok(Json(
        registration::register(&state, id, body.participant_id).await?,
    ))
}

async fn cancel_registration<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ParticipantAction>,
) -> ApiResult<serde_json::Value> {
    registration::cancel_registration(&state, id, body.participant_id).await?;
    Ok(Json(serde_json::json!({ "withdrawn": body.participant_id })))
}

async fn list_registrations<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Registration>> {
    event::load(&state.pool, id).await?;
    Ok(Json(
        registration::registrations_for_event(&state.pool, id).await?,
    ))
}

async fn check_in<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ParticipantAction>,
) -> ApiResult<crate::types::Checkin> {
    Ok(Json(
        registration::check_in(&state, id, body.participant_id).await?,
    ))
}

// ─────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────

async fn event_credentials<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Credential>> {
    event::load(&state.pool, id).await?;
    Ok(Json(credential::for_event(&state.pool, id).await?))
}

async fn participant_credentials<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Credential>> {
    registration::load_participant(&state.pool, id).await?;
    Ok(Json(credential::for_participant(&state.pool, id).await?))
}

#[derive(Deserialize)]
struct BatchMintBody {
    participant_ids: Vec<i64>,
}

async fn batch_mint<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<BatchMintBody>,
) -> ApiResult<Vec<credential::BatchMintEntry>> {
    Ok(Json(
        credential::batch_mint(&state, id, &body.participant_ids).await?,
    ))
}

// ─────────────────────────────────────────────────────────
// Teams and submissions
// ─────────────────────────────────────────────────────────

async fn create_team<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<team::NewTeam>,
) -> ApiResult<crate::types::Team> {
    Ok(Json(team::create(&state, id, body).await?))
}

async fn list_teams<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Team>> {
    event::load(&state.pool, id).await?;
    Ok(Json(team::teams_for_event(&state.pool, id).await?))
}

async fn join_team<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ParticipantAction>,
) -> ApiResult<serde_json::Value> {
    team::join(&state, id, body.participant_id).await?;
    Ok(Json(serde_json::json!({ "joined": id })))
}

async fn leave_team<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ParticipantAction>,
) -> ApiResult<serde_json::Value> {
    team::leave(&state, id, body.participant_id).await?;
    Ok(Json(serde_json::json!({ "left": id })))
}

#[derive(Deserialize)]
struct CreateSubmissionBody {
    participant_id: i64,
    #[serde(flatten)]
    submission: team::NewSubmission,
}

async fn create_submission<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<CreateSubmissionBody>,
) -> ApiResult<crate::types::Submission> {
    Ok(Json(
        team::submit(&state, id, body.participant_id, body.submission).await?,
    ))
}

#[derive(Deserialize)]
struct UpdateSubmissionBody {
    participant_id: i64,
    #[serde(flatten)]
    patch: team::SubmissionUpdate,
}

async fn update_submission<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateSubmissionBody>,
) -> ApiResult<crate::types::Submission> {
    Ok(Json(
        team::update_submission(&state, id, body.participant_id, body.patch).await?,
    ))
}

async fn list_submissions<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Submission>> {
    event::load(&state.pool, id).await?;
    Ok(Json(team::submissions_for_event(&state.pool, id).await?))
}

// ─────────────────────────────────────────────────────────
// Voting and results
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CastVoteBody {
    participant_id: i64,
    score: i64,
}

async fn cast_vote<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<CastVoteBody>,
) -> ApiResult<crate::types::Vote> {
    Ok(Json(
        voting::cast_vote(&state, id, body.participant_id, body.score).await?,
    ))
}

async fn revoke_vote<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<ParticipantAction>,
) -> ApiResult<crate::types::Vote> {
    Ok(Json(
        voting::revoke_vote(&state, id, body.participant_id).await?,
    ))
}

#[derive(Deserialize)]
struct VoteHistoryQuery {
    participant_id: i64,
}

async fn vote_history<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Query(query): Query<VoteHistoryQuery>,
) -> ApiResult<Vec<crate::types::Vote>> {
    event::load(&state.pool, id).await?;
    Ok(Json(
        voting::history(&state.pool, id, query.participant_id).await?,
    ))
}

async fn get_ranking<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<voting::RankedSubmission>> {
    event::load(&state.pool, id).await?;
    Ok(Json(voting::ranking(&state.pool, id).await?))
}

// ─────────────────────────────────────────────────────────
// Prize pool
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SponsorshipBody {
    sponsor_address: String,
    amount_minor: i64,
}

async fn request_sponsorship<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<SponsorshipBody>,
) -> ApiResult<crate::types::Sponsorship> {
    Ok(Json(
        prize::request_sponsorship(&state, id, &body.sponsor_address, body.amount_minor).await?,
    ))
}

async fn list_sponsorships<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Sponsorship>> {
    event::load(&state.pool, id).await?;
    Ok(Json(prize::sponsorships_for_event(&state.pool, id).await?))
}

async fn approve_sponsorship<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path((id, sid)): Path<(i64, i64)>,
    Json(body): Json<OrganizerAction>,
) -> ApiResult<crate::types::Sponsorship> {
    Ok(Json(
        prize::approve_sponsorship(&state, id, sid, body.organizer_id).await?,
    ))
}

async fn reject_sponsorship<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path((id, sid)): Path<(i64, i64)>,
    Json(body): Json<OrganizerAction>,
) -> ApiResult<crate::types::Sponsorship> {
    Ok(Json(
        prize::reject_sponsorship(&state, id, sid, body.organizer_id).await?,
    ))
}

async fn get_prize_pool<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<crate::types::PrizePool> {
    event::load(&state.pool, id).await?;
    Ok(Json(prize::pool_for_event(&state.pool, id).await?))
}

#[derive(Deserialize)]
struct DistributionRulesBody {
    organizer_id: i64,
    rules: Vec<prize::RankRule>,
}

async fn set_distribution_rules<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<DistributionRulesBody>,
) -> ApiResult<serde_json::Value> {
    prize::set_distribution_rules(&state, id, body.organizer_id, body.rules).await?;
    Ok(Json(serde_json::json!({ "event_id": id })))
}

#[derive(Deserialize)]
struct TeamSharesBody {
    shares: Vec<prize::MemberShare>,
}

async fn set_team_shares<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path((id, team_id)): Path<(i64, i64)>,
    Json(body): Json<TeamSharesBody>,
) -> ApiResult<serde_json::Value> {
    prize::set_team_shares(&state, id, team_id, body.shares).await?;
    Ok(Json(serde_json::json!({ "event_id": id, "team_id": team_id })))
}

async fn distribute_prizes<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
    Json(body): Json<OrganizerAction>,
) -> ApiResult<Vec<crate::types::Payout>> {
    Ok(Json(
        prize::distribute_prizes(&state, id, body.organizer_id).await?,
    ))
}

async fn list_payouts<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::Payout>> {
    event::load(&state.pool, id).await?;
    Ok(Json(prize::payouts_for_event(&state.pool, id).await?))
}

// ─────────────────────────────────────────────────────────
// Ledger plumbing
// ─────────────────────────────────────────────────────────

async fn verify_event<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<verify::VerificationReport> {
    Ok(Json(verify::verify_event(&state, id).await?))
}

async fn list_transactions<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<crate::types::LedgerTransaction>> {
    event::load(&state.pool, id).await?;
    Ok(Json(mirror::transactions_for_event(&state.pool, id).await?))
}

#[derive(Deserialize)]
struct EstimateGasBody {
    caller_address: String,
    #[serde(flatten)]
    op: LedgerOp,
}

async fn estimate_gas<G: LedgerGateway>(
    State(state): State<Arc<AppState<G>>>,
    Json(body): Json<EstimateGasBody>,
) -> ApiResult<gas::GasEstimate> {
    Ok(Json(
        gas::estimate(&state.gateway, &body.op, &body.caller_address).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases: Vec<(EngineError, StatusCode)> = vec![
            (
                EngineError::Validation("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::AlreadyDistributed(1),
                StatusCode::CONFLICT,
            ),
            (
                EngineError::InsufficientBalance {
                    needed_minor: 2,
                    available_minor: 1,
                    shortfall_minor: 1,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                EngineError::ExternalUnavailable("down".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                EngineError::DataIntegrity("split".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (EngineError::NotFound("event"), StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
