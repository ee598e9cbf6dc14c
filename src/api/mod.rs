// HTTP API routes: round progression, scoring, and the thin CRUD surface
// for teams, divisions and round templates.

pub mod ws;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::Error;
use crate::matchgen::MatchSchedule;
use crate::metrics;
use crate::notify::BroadcastSink;
use crate::progression::{NextRoundConfig, RoundProgression};
use crate::scoring::{ScoringChannel, ScoringEvent};
use crate::seeding::{GapPolicy, SeedPlacement, SortMethod};
use crate::selection::TeamSelectionStrategy;
use crate::store::Database;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
    pub school: Option<String>,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateDivisionRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateRoundTemplateRequest {
    pub name: String,
    pub sequence: i64,
    pub recommended_team_count: Option<i64>,
    pub selection_strategy: Option<String>,
    pub generation_strategy: Option<String>,
    pub grouping_strategy: Option<String>,
    pub is_playoff: Option<bool>,
}

#[derive(Deserialize)]
pub struct CreateOpeningRoundRequest {
    pub template_id: i64,
    pub team_ids: Vec<i64>,
    pub teams_per_group: Option<i64>,
    pub groups_in_round: Option<i64>,
}

#[derive(Deserialize)]
pub struct AssignTeamsRequest {
    pub team_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct SeedRoundRequest {
    pub sort_method: SortMethod,
    pub seed_placement: SeedPlacement,
    pub gap_policy: GapPolicy,
    /// Explicit seed for the random sort, for reproducible draws.
    pub rng_seed: Option<u64>,
}

#[derive(Deserialize)]
pub struct GenerateMatchesRequest {
    pub schedule: Option<MatchSchedule>,
}

#[derive(Deserialize)]
pub struct AdvancingPreviewRequest {
    pub strategy: TeamSelectionStrategy,
    pub count: usize,
    pub manual_team_ids: Option<Vec<i64>>,
}

#[derive(Deserialize)]
pub struct AdvanceRoundRequest {
    #[serde(flatten)]
    pub config: NextRoundConfig,
    pub rng_seed: Option<u64>,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub progression: Arc<RoundProgression>,
    pub scoring: ScoringChannel,
    pub sink: Arc<BroadcastSink>,
}

// ── Error mapping ─────────────────────────────────────────────────────

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_)
            | Error::InvalidStrategyConfig(_)
            | Error::InvalidGroupConfig(_)
            | Error::RoundNotReady { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidRoundState { .. }
            | Error::StateConflict(_)
            | Error::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            Error::InsufficientTeams { .. }
            | Error::InsufficientQualifiers { .. }
            | Error::UnresolvablePairing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Store(e) => {
                tracing::error!("Database error: {e}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({ "error": "Internal server error" })),
                )
                    .into_response();
            }
        };
        (status, axum::Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        // Teams
        .route("/api/teams", get(list_teams).post(create_team))
        .route("/api/teams/{id}", get(get_team).delete(delete_team))
        // Divisions
        .route("/api/divisions", get(list_divisions).post(create_division))
        .route("/api/divisions/{id}", get(get_division))
        .route(
            "/api/divisions/{id}/rounds",
            get(list_division_rounds).post(create_opening_round),
        )
        // Round templates
        .route(
            "/api/round-templates",
            get(list_round_templates).post(create_round_template),
        )
        // Rounds
        .route("/api/rounds/{id}", get(get_round))
        .route("/api/rounds/{id}/teams", get(list_round_teams).post(assign_teams))
        .route("/api/rounds/{id}/seed", post(seed_round))
        .route(
            "/api/rounds/{id}/matches",
            get(list_round_matches).post(generate_matches),
        )
        .route("/api/rounds/{id}/standings", get(get_standings))
        .route("/api/rounds/{id}/finalize", post(finalize_round))
        .route("/api/rounds/{id}/advancing-preview", post(advancing_preview))
        .route("/api/rounds/{id}/advance", post(advance_round))
        .route("/api/rounds/{id}/lock", post(lock_round))
        // Matches
        .route("/api/matches/{id}", get(get_match))
        .route("/api/matches/{id}/sets", get(list_match_sets))
        .route("/api/matches/{id}/updates", get(list_match_updates))
        // Scoring
        .route("/api/scoring/events", post(enqueue_scoring_event))
        .route("/api/scoring/pending", get(scoring_pending))
        // Live event stream
        .route("/api/ws/events", get(ws::ws_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "volley-backend" }))
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::gather_metrics()
}

// ── Teams ─────────────────────────────────────────────────────────────

async fn create_team(
    State(state): State<AppState>,
    Json(req): Json<CreateTeamRequest>,
) -> ApiResult<Json<Value>> {
    if req.name.trim().is_empty() {
        return Err(Error::Validation("team name must not be empty".into()).into());
    }
    let team = state
        .db
        .create_team(
            &req.name,
            req.school.as_deref().unwrap_or(""),
            req.color.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(json!(team)))
}

async fn list_teams(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_teams().await?)))
}

async fn get_team(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let team = state.db.get_team(id).await?.ok_or(Error::NotFound {
        entity: "team",
        id,
    })?;
    Ok(Json(json!(team)))
}

async fn delete_team(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if state.db.delete_team(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound { entity: "team", id }.into())
    }
}

// ── Divisions ─────────────────────────────────────────────────────────

async fn create_division(
    State(state): State<AppState>,
    Json(req): Json<CreateDivisionRequest>,
) -> ApiResult<Json<Value>> {
    if req.name.trim().is_empty() {
        return Err(Error::Validation("division name must not be empty".into()).into());
    }
    Ok(Json(json!(state.db.create_division(&req.name).await?)))
}

async fn list_divisions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_divisions().await?)))
}

async fn get_division(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let division = state.db.get_division(id).await?.ok_or(Error::NotFound {
        entity: "division",
        id,
    })?;
    Ok(Json(json!(division)))
}

async fn list_division_rounds(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_rounds_for_division(id).await?)))
}

// ── Round templates ───────────────────────────────────────────────────

async fn create_round_template(
    State(state): State<AppState>,
    Json(req): Json<CreateRoundTemplateRequest>,
) -> ApiResult<Json<Value>> {
    let template = state
        .db
        .create_round_template(
            &req.name,
            req.sequence,
            req.recommended_team_count.unwrap_or(0),
            req.selection_strategy.as_deref().unwrap_or("top_by_points"),
            req.generation_strategy.as_deref().unwrap_or("round_robin"),
            req.grouping_strategy.as_deref().unwrap_or("no_group"),
            req.is_playoff.unwrap_or(false),
        )
        .await?;
    Ok(Json(json!(template)))
}

async fn list_round_templates(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_round_templates().await?)))
}

// ── Rounds ────────────────────────────────────────────────────────────

async fn create_opening_round(
    State(state): State<AppState>,
    Path(division_id): Path<i64>,
    Json(req): Json<CreateOpeningRoundRequest>,
) -> ApiResult<Json<Value>> {
    let round = state
        .progression
        .create_opening_round(
            division_id,
            req.template_id,
            &req.team_ids,
            req.teams_per_group,
            req.groups_in_round,
        )
        .await?;
    Ok(Json(json!(round)))
}

async fn get_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let round = state.db.get_round(id).await?.ok_or(Error::NotFound {
        entity: "round",
        id,
    })?;
    Ok(Json(json!(round)))
}

async fn list_round_teams(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_round_teams(id).await?)))
}

async fn assign_teams(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AssignTeamsRequest>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(
        state.progression.assign_teams(id, &req.team_ids).await?
    )))
}

async fn seed_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SeedRoundRequest>,
) -> ApiResult<Json<Value>> {
    let mut rng = rng_from(req.rng_seed);
    let teams = state
        .progression
        .seed_round(id, req.sort_method, req.seed_placement, req.gap_policy, &mut rng)
        .await?;
    Ok(Json(json!(teams)))
}

async fn generate_matches(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<GenerateMatchesRequest>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(
        state.progression.generate_round_matches(id, req.schedule).await?
    )))
}

async fn list_round_matches(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_matches(id).await?)))
}

async fn get_standings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.db.get_round(id).await?.ok_or(Error::NotFound {
        entity: "round",
        id,
    })?;
    let ranked = crate::standings::compute_standings(state.db.list_round_teams(id).await?);
    Ok(Json(json!(ranked)))
}

async fn finalize_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.progression.finalize_round(id).await?)))
}

async fn advancing_preview(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AdvancingPreviewRequest>,
) -> ApiResult<Json<Value>> {
    let teams = state
        .progression
        .select_advancing_teams(id, req.strategy, req.count, req.manual_team_ids.as_deref())
        .await?;
    Ok(Json(json!(teams)))
}

async fn advance_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AdvanceRoundRequest>,
) -> ApiResult<Json<Value>> {
    let mut rng = rng_from(req.rng_seed);
    let round = state
        .progression
        .create_next_round(id, &req.config, &mut rng)
        .await?;
    Ok(Json(json!(round)))
}

async fn lock_round(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.progression.lock_round(id).await?;
    Ok(Json(json!({ "round_id": id, "locked": true })))
}

// ── Matches ───────────────────────────────────────────────────────────

async fn get_match(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let m = state.db.get_match(id).await?.ok_or(Error::NotFound {
        entity: "match",
        id,
    })?;
    Ok(Json(json!(m)))
}

async fn list_match_sets(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_sets(id).await?)))
}

async fn list_match_updates(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.db.list_match_updates(id).await?)))
}

// ── Scoring ───────────────────────────────────────────────────────────

async fn enqueue_scoring_event(
    State(state): State<AppState>,
    Json(event): Json<ScoringEvent>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let event_id = state.scoring.enqueue(event).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": event_id }))))
}

async fn scoring_pending(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pending": state.scoring.pending_count() }))
}
