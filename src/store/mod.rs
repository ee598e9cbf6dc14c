// Entity store (SQLite via sqlx): teams, divisions, round templates,
// tournament rounds, round teams, matches, sets, and the append-only
// match update log.
//
// Reads go through the pool; multi-step mutations run on a transaction
// connection (`*_on` functions) so every orchestrator operation and every
// scoring event commits all-or-nothing.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;

use crate::error::{Error, Result};

/// Shared identity/audit fields embedded in every entity row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntityMeta {
    pub id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    pub school: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Division {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
}

/// Reusable stage definition ("Quarter Finals") with recommended defaults.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoundTemplate {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
    pub sequence: i64,
    pub recommended_team_count: i64,
    pub selection_strategy: String,
    pub generation_strategy: String,
    pub grouping_strategy: String,
    pub is_playoff: bool,
}

/// Round lifecycle states. Transitions are enforced by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Created,
    TeamsAssigned,
    MatchesGenerated,
    Finished,
    Locked,
}

impl RoundState {
    /// Parse a state string (from DB) into a RoundState.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "teams_assigned" => Some(Self::TeamsAssigned),
            "matches_generated" => Some(Self::MatchesGenerated),
            "finished" => Some(Self::Finished),
            "locked" => Some(Self::Locked),
            _ => None,
        }
    }

    /// Serialize to a DB-storable string.
    pub fn to_str_name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::TeamsAssigned => "teams_assigned",
            Self::MatchesGenerated => "matches_generated",
            Self::Finished => "finished",
            Self::Locked => "locked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentRound {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub division_id: i64,
    pub round_number: i64,
    pub selection_strategy: String,
    pub generation_strategy: String,
    pub grouping_strategy: String,
    pub teams_per_group: Option<i64>,
    pub groups_in_round: Option<i64>,
    pub previous_round_id: Option<i64>,
    pub next_round_id: Option<i64>,
    pub advancing_team_count: i64,
    pub state: String,
    pub version: i64,
}

impl TournamentRound {
    pub fn round_state(&self) -> RoundState {
        RoundState::from_str_name(&self.state).unwrap_or(RoundState::Created)
    }
}

/// A team's participation record within one round. Stats accumulate as
/// match results are applied; rank and ranking points are written only at
/// finalization. Differentials are derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentRoundTeam {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub round_id: i64,
    pub team_id: i64,
    pub seed_number: Option<i64>,
    pub group_name: Option<String>,
    pub final_rank: Option<i64>,
    pub ranking_points: Option<i64>,
    pub points: i64,
    pub matches_played: i64,
    pub wins: i64,
    pub draws: i64,
    pub losses: i64,
    pub sets_won: i64,
    pub sets_lost: i64,
    pub score_for: i64,
    pub score_against: i64,
}

impl TournamentRoundTeam {
    pub fn sets_difference(&self) -> i64 {
        self.sets_won - self.sets_lost
    }

    pub fn score_difference(&self) -> i64 {
        self.score_for - self.score_against
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Match {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub round_id: i64,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub match_number: i64,
    pub court_number: i64,
    pub scheduled_time: Option<String>,
    pub actual_start_time: Option<String>,
    pub home_sets: i64,
    pub away_sets: i64,
    pub is_finished: bool,
    pub is_disputed: bool,
    pub is_locked: bool,
    pub referee_name: Option<String>,
    pub scorer_name: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchSet {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub match_id: i64,
    pub set_number: i64,
    pub home_points: i64,
    pub away_points: i64,
    pub is_finished: bool,
    pub is_locked: bool,
}

/// Append-only audit entry for a match mutation. Write-once, never edited.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchUpdate {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub match_id: i64,
    pub event_id: String,
    pub update_type: String,
    pub previous_value: String,
    pub new_value: String,
    pub processed: bool,
}

/// Parameters for inserting a new tournament round.
#[derive(Debug, Clone)]
pub struct NewRound {
    pub division_id: i64,
    pub round_number: i64,
    pub selection_strategy: String,
    pub generation_strategy: String,
    pub grouping_strategy: String,
    pub teams_per_group: Option<i64>,
    pub groups_in_round: Option<i64>,
    pub previous_round_id: Option<i64>,
    pub advancing_team_count: i64,
}

/// Stat deltas applied to a round team when a match result lands.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamResultDelta {
    pub points: i64,
    pub wins: i64,
    pub draws: i64,
    pub losses: i64,
    pub sets_won: i64,
    pub sets_lost: i64,
    pub score_for: i64,
    pub score_against: i64,
}

pub struct Database {
    pool: SqlitePool,
}

const META_COLS: &str = "id, created_at";

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction. Every orchestrator operation and every scoring
    /// event runs inside exactly one.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS teams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                name TEXT NOT NULL,
                school TEXT NOT NULL DEFAULT '',
                color TEXT NOT NULL DEFAULT ''
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS divisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                name TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS round_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                name TEXT NOT NULL,
                sequence INTEGER NOT NULL DEFAULT 1,
                recommended_team_count INTEGER NOT NULL DEFAULT 0,
                selection_strategy TEXT NOT NULL DEFAULT 'top_by_points',
                generation_strategy TEXT NOT NULL DEFAULT 'round_robin',
                grouping_strategy TEXT NOT NULL DEFAULT 'no_group',
                is_playoff INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                division_id INTEGER NOT NULL REFERENCES divisions(id),
                round_number INTEGER NOT NULL,
                selection_strategy TEXT NOT NULL DEFAULT 'top_by_points',
                generation_strategy TEXT NOT NULL DEFAULT 'round_robin',
                grouping_strategy TEXT NOT NULL DEFAULT 'no_group',
                teams_per_group INTEGER,
                groups_in_round INTEGER,
                previous_round_id INTEGER REFERENCES tournament_rounds(id),
                next_round_id INTEGER REFERENCES tournament_rounds(id),
                advancing_team_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'created',
                version INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_round_teams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                round_id INTEGER NOT NULL REFERENCES tournament_rounds(id),
                team_id INTEGER NOT NULL REFERENCES teams(id),
                seed_number INTEGER,
                group_name TEXT,
                final_rank INTEGER,
                ranking_points INTEGER,
                points INTEGER NOT NULL DEFAULT 0,
                matches_played INTEGER NOT NULL DEFAULT 0,
                wins INTEGER NOT NULL DEFAULT 0,
                draws INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0,
                sets_won INTEGER NOT NULL DEFAULT 0,
                sets_lost INTEGER NOT NULL DEFAULT 0,
                score_for INTEGER NOT NULL DEFAULT 0,
                score_against INTEGER NOT NULL DEFAULT 0,
                UNIQUE(round_id, team_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                round_id INTEGER NOT NULL REFERENCES tournament_rounds(id),
                home_team_id INTEGER NOT NULL REFERENCES teams(id),
                away_team_id INTEGER NOT NULL REFERENCES teams(id),
                match_number INTEGER NOT NULL,
                court_number INTEGER NOT NULL DEFAULT 1,
                scheduled_time TEXT,
                actual_start_time TEXT,
                home_sets INTEGER NOT NULL DEFAULT 0,
                away_sets INTEGER NOT NULL DEFAULT 0,
                is_finished INTEGER NOT NULL DEFAULT 0,
                is_disputed INTEGER NOT NULL DEFAULT 0,
                is_locked INTEGER NOT NULL DEFAULT 0,
                referee_name TEXT,
                scorer_name TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                UNIQUE(round_id, match_number),
                CHECK(home_team_id <> away_team_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS match_sets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                match_id INTEGER NOT NULL REFERENCES matches(id),
                set_number INTEGER NOT NULL,
                home_points INTEGER NOT NULL DEFAULT 0,
                away_points INTEGER NOT NULL DEFAULT 0,
                is_finished INTEGER NOT NULL DEFAULT 0,
                is_locked INTEGER NOT NULL DEFAULT 0,
                UNIQUE(match_id, set_number)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS match_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                match_id INTEGER NOT NULL REFERENCES matches(id),
                event_id TEXT NOT NULL,
                update_type TEXT NOT NULL,
                previous_value TEXT NOT NULL DEFAULT '',
                new_value TEXT NOT NULL DEFAULT '',
                processed INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Teams ─────────────────────────────────────────────────────────

    pub async fn create_team(&self, name: &str, school: &str, color: &str) -> Result<Team> {
        let row = sqlx::query_as::<_, Team>(
            "INSERT INTO teams (name, school, color) VALUES (?, ?, ?) \
             RETURNING id, created_at, name, school, color",
        )
        .bind(name)
        .bind(school)
        .bind(color)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_team(&self, id: i64) -> Result<Option<Team>> {
        let row = sqlx::query_as::<_, Team>(
            "SELECT id, created_at, name, school, color FROM teams WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_teams(&self) -> Result<Vec<Team>> {
        let rows = sqlx::query_as::<_, Team>(
            "SELECT id, created_at, name, school, color FROM teams ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_team(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM teams WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Divisions ─────────────────────────────────────────────────────

    pub async fn create_division(&self, name: &str) -> Result<Division> {
        let row = sqlx::query_as::<_, Division>(
            "INSERT INTO divisions (name) VALUES (?) RETURNING id, created_at, name",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_division(&self, id: i64) -> Result<Option<Division>> {
        let row = sqlx::query_as::<_, Division>(
            "SELECT id, created_at, name FROM divisions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_divisions(&self) -> Result<Vec<Division>> {
        let rows = sqlx::query_as::<_, Division>(
            "SELECT id, created_at, name FROM divisions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Round templates ───────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_round_template(
        &self,
        name: &str,
        sequence: i64,
        recommended_team_count: i64,
        selection_strategy: &str,
        generation_strategy: &str,
        grouping_strategy: &str,
        is_playoff: bool,
    ) -> Result<RoundTemplate> {
        let row = sqlx::query_as::<_, RoundTemplate>(
            "INSERT INTO round_templates \
             (name, sequence, recommended_team_count, selection_strategy, generation_strategy, grouping_strategy, is_playoff) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id, created_at, name, sequence, recommended_team_count, \
                       selection_strategy, generation_strategy, grouping_strategy, is_playoff",
        )
        .bind(name)
        .bind(sequence)
        .bind(recommended_team_count)
        .bind(selection_strategy)
        .bind(generation_strategy)
        .bind(grouping_strategy)
        .bind(is_playoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_round_template(&self, id: i64) -> Result<Option<RoundTemplate>> {
        let row = sqlx::query_as::<_, RoundTemplate>(
            "SELECT id, created_at, name, sequence, recommended_team_count, \
                    selection_strategy, generation_strategy, grouping_strategy, is_playoff \
             FROM round_templates WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_round_templates(&self) -> Result<Vec<RoundTemplate>> {
        let rows = sqlx::query_as::<_, RoundTemplate>(
            "SELECT id, created_at, name, sequence, recommended_team_count, \
                    selection_strategy, generation_strategy, grouping_strategy, is_playoff \
             FROM round_templates ORDER BY sequence, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ── Tournament rounds ─────────────────────────────────────────────

    pub async fn get_round(&self, id: i64) -> Result<Option<TournamentRound>> {
        Self::get_round_on(&mut *self.pool.acquire().await?, id).await
    }

    pub async fn list_rounds_for_division(&self, division_id: i64) -> Result<Vec<TournamentRound>> {
        let rows = sqlx::query_as::<_, TournamentRound>(&format!(
            "SELECT {META_COLS}, division_id, round_number, selection_strategy, \
                    generation_strategy, grouping_strategy, teams_per_group, groups_in_round, \
                    previous_round_id, next_round_id, advancing_team_count, state, version \
             FROM tournament_rounds WHERE division_id = ? ORDER BY round_number"
        ))
        .bind(division_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Whether the division has a round that is not yet finished or locked.
    pub async fn division_has_open_round(&self, division_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tournament_rounds \
             WHERE division_id = ? AND state NOT IN ('finished', 'locked')",
        )
        .bind(division_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn get_round_on(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<TournamentRound>> {
        let row = sqlx::query_as::<_, TournamentRound>(&format!(
            "SELECT {META_COLS}, division_id, round_number, selection_strategy, \
                    generation_strategy, grouping_strategy, teams_per_group, groups_in_round, \
                    previous_round_id, next_round_id, advancing_team_count, state, version \
             FROM tournament_rounds WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn insert_round_on(
        conn: &mut SqliteConnection,
        new: &NewRound,
    ) -> Result<TournamentRound> {
        let row = sqlx::query_as::<_, TournamentRound>(&format!(
            "INSERT INTO tournament_rounds \
             (division_id, round_number, selection_strategy, generation_strategy, grouping_strategy, \
              teams_per_group, groups_in_round, previous_round_id, advancing_team_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {META_COLS}, division_id, round_number, selection_strategy, \
                       generation_strategy, grouping_strategy, teams_per_group, groups_in_round, \
                       previous_round_id, next_round_id, advancing_team_count, state, version"
        ))
        .bind(new.division_id)
        .bind(new.round_number)
        .bind(&new.selection_strategy)
        .bind(&new.generation_strategy)
        .bind(&new.grouping_strategy)
        .bind(new.teams_per_group)
        .bind(new.groups_in_round)
        .bind(new.previous_round_id)
        .bind(new.advancing_team_count)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    /// Transition a round's state, guarded by the version the caller read.
    /// A lost race surfaces as `ConcurrencyConflict`.
    pub async fn set_round_state_on(
        conn: &mut SqliteConnection,
        round_id: i64,
        expected_version: i64,
        state: RoundState,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tournament_rounds SET state = ?, version = version + 1 \
             WHERE id = ? AND version = ?",
        )
        .bind(state.to_str_name())
        .bind(round_id)
        .bind(expected_version)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ConcurrencyConflict {
                entity: "round",
                id: round_id,
            });
        }
        Ok(())
    }

    pub async fn set_next_round_on(
        conn: &mut SqliteConnection,
        round_id: i64,
        next_round_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE tournament_rounds SET next_round_id = ? WHERE id = ?")
            .bind(next_round_id)
            .bind(round_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── Round teams ───────────────────────────────────────────────────

    const ROUND_TEAM_COLS: &'static str =
        "id, created_at, round_id, team_id, seed_number, group_name, final_rank, ranking_points, \
         points, matches_played, wins, draws, losses, sets_won, sets_lost, score_for, score_against";

    pub async fn list_round_teams(&self, round_id: i64) -> Result<Vec<TournamentRoundTeam>> {
        Self::list_round_teams_on(&mut *self.pool.acquire().await?, round_id).await
    }

    pub async fn get_round_team_on(
        conn: &mut SqliteConnection,
        round_id: i64,
        team_id: i64,
    ) -> Result<Option<TournamentRoundTeam>> {
        let row = sqlx::query_as::<_, TournamentRoundTeam>(&format!(
            "SELECT {} FROM tournament_round_teams WHERE round_id = ? AND team_id = ?",
            Self::ROUND_TEAM_COLS
        ))
        .bind(round_id)
        .bind(team_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn list_round_teams_on(
        conn: &mut SqliteConnection,
        round_id: i64,
    ) -> Result<Vec<TournamentRoundTeam>> {
        let rows = sqlx::query_as::<_, TournamentRoundTeam>(&format!(
            "SELECT {} FROM tournament_round_teams WHERE round_id = ? ORDER BY seed_number, id",
            Self::ROUND_TEAM_COLS
        ))
        .bind(round_id)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    pub async fn insert_round_team_on(
        conn: &mut SqliteConnection,
        round_id: i64,
        team_id: i64,
        seed_number: Option<i64>,
        group_name: Option<&str>,
    ) -> Result<TournamentRoundTeam> {
        let row = sqlx::query_as::<_, TournamentRoundTeam>(&format!(
            "INSERT INTO tournament_round_teams (round_id, team_id, seed_number, group_name) \
             VALUES (?, ?, ?, ?) RETURNING {}",
            Self::ROUND_TEAM_COLS
        ))
        .bind(round_id)
        .bind(team_id)
        .bind(seed_number)
        .bind(group_name)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    pub async fn update_seed_group_on(
        conn: &mut SqliteConnection,
        round_team_id: i64,
        seed_number: Option<i64>,
        group_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tournament_round_teams SET seed_number = ?, group_name = ? WHERE id = ?",
        )
        .bind(seed_number)
        .bind(group_name)
        .bind(round_team_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Write rank and ranking points at finalization.
    pub async fn write_ranking_on(
        conn: &mut SqliteConnection,
        round_team_id: i64,
        final_rank: i64,
        ranking_points: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tournament_round_teams SET final_rank = ?, ranking_points = ? WHERE id = ?",
        )
        .bind(final_rank)
        .bind(ranking_points)
        .bind(round_team_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Accumulate a match result onto a round team. The only mutation path
    /// for round-team statistics.
    pub async fn apply_team_result_on(
        conn: &mut SqliteConnection,
        round_team_id: i64,
        delta: TeamResultDelta,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tournament_round_teams SET \
               points = points + ?, matches_played = matches_played + 1, \
               wins = wins + ?, draws = draws + ?, losses = losses + ?, \
               sets_won = sets_won + ?, sets_lost = sets_lost + ?, \
               score_for = score_for + ?, score_against = score_against + ? \
             WHERE id = ?",
        )
        .bind(delta.points)
        .bind(delta.wins)
        .bind(delta.draws)
        .bind(delta.losses)
        .bind(delta.sets_won)
        .bind(delta.sets_lost)
        .bind(delta.score_for)
        .bind(delta.score_against)
        .bind(round_team_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    // ── Matches ───────────────────────────────────────────────────────

    const MATCH_COLS: &'static str =
        "id, created_at, round_id, home_team_id, away_team_id, match_number, court_number, \
         scheduled_time, actual_start_time, home_sets, away_sets, is_finished, is_disputed, \
         is_locked, referee_name, scorer_name, version";

    pub async fn get_match(&self, id: i64) -> Result<Option<Match>> {
        Self::get_match_on(&mut *self.pool.acquire().await?, id).await
    }

    pub async fn get_match_on(conn: &mut SqliteConnection, id: i64) -> Result<Option<Match>> {
        let row = sqlx::query_as::<_, Match>(&format!(
            "SELECT {} FROM matches WHERE id = ?",
            Self::MATCH_COLS
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn list_matches(&self, round_id: i64) -> Result<Vec<Match>> {
        let rows = sqlx::query_as::<_, Match>(&format!(
            "SELECT {} FROM matches WHERE round_id = ? ORDER BY match_number",
            Self::MATCH_COLS
        ))
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn round_has_matches(&self, round_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM matches WHERE round_id = ?")
            .bind(round_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn unfinished_match_count_on(
        conn: &mut SqliteConnection,
        round_id: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM matches WHERE round_id = ? AND is_finished = 0",
        )
        .bind(round_id)
        .fetch_one(conn)
        .await?;
        Ok(count)
    }

    pub async fn disputed_match_count_on(
        conn: &mut SqliteConnection,
        round_id: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM matches WHERE round_id = ? AND is_disputed = 1",
        )
        .bind(round_id)
        .fetch_one(conn)
        .await?;
        Ok(count)
    }

    /// All (home, away) team-id pairs ever scheduled in a division. Used by
    /// Swiss generation to refuse repeat pairings.
    pub async fn division_pairing_history(&self, division_id: i64) -> Result<Vec<(i64, i64)>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT m.home_team_id, m.away_team_id FROM matches m \
             JOIN tournament_rounds r ON m.round_id = r.id \
             WHERE r.division_id = ?",
        )
        .bind(division_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_match_on(
        conn: &mut SqliteConnection,
        round_id: i64,
        home_team_id: i64,
        away_team_id: i64,
        match_number: i64,
        court_number: i64,
        scheduled_time: Option<&str>,
    ) -> Result<Match> {
        let row = sqlx::query_as::<_, Match>(&format!(
            "INSERT INTO matches \
             (round_id, home_team_id, away_team_id, match_number, court_number, scheduled_time) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
            Self::MATCH_COLS
        ))
        .bind(round_id)
        .bind(home_team_id)
        .bind(away_team_id)
        .bind(match_number)
        .bind(court_number)
        .bind(scheduled_time)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    pub async fn set_match_sets_on(
        conn: &mut SqliteConnection,
        match_id: i64,
        expected_version: i64,
        home_sets: i64,
        away_sets: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE matches SET home_sets = ?, away_sets = ?, version = version + 1 \
             WHERE id = ? AND version = ?",
        )
        .bind(home_sets)
        .bind(away_sets)
        .bind(match_id)
        .bind(expected_version)
        .execute(conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::ConcurrencyConflict {
                entity: "match",
                id: match_id,
            });
        }
        Ok(())
    }

    pub async fn set_match_flags_on(
        conn: &mut SqliteConnection,
        match_id: i64,
        expected_version: i64,
        is_finished: bool,
        is_disputed: bool,
        is_locked: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE matches SET is_finished = ?, is_disputed = ?, is_locked = ?, \
             version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(is_finished)
        .bind(is_disputed)
        .bind(is_locked)
        .bind(match_id)
        .bind(expected_version)
        .execute(conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::ConcurrencyConflict {
                entity: "match",
                id: match_id,
            });
        }
        Ok(())
    }

    pub async fn set_match_started_on(
        conn: &mut SqliteConnection,
        match_id: i64,
        expected_version: i64,
        started_at: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE matches SET actual_start_time = ?, version = version + 1 \
             WHERE id = ? AND version = ?",
        )
        .bind(started_at)
        .bind(match_id)
        .bind(expected_version)
        .execute(conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::ConcurrencyConflict {
                entity: "match",
                id: match_id,
            });
        }
        Ok(())
    }

    /// Lock a round and everything under it. Irreversible.
    pub async fn lock_round_on(conn: &mut SqliteConnection, round_id: i64) -> Result<()> {
        sqlx::query("UPDATE matches SET is_locked = 1, version = version + 1 WHERE round_id = ?")
            .bind(round_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "UPDATE match_sets SET is_locked = 1 \
             WHERE match_id IN (SELECT id FROM matches WHERE round_id = ?)",
        )
        .bind(round_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    // ── Match sets ────────────────────────────────────────────────────

    const SET_COLS: &'static str =
        "id, created_at, match_id, set_number, home_points, away_points, is_finished, is_locked";

    pub async fn list_sets(&self, match_id: i64) -> Result<Vec<MatchSet>> {
        Self::list_sets_on(&mut *self.pool.acquire().await?, match_id).await
    }

    pub async fn list_sets_on(
        conn: &mut SqliteConnection,
        match_id: i64,
    ) -> Result<Vec<MatchSet>> {
        let rows = sqlx::query_as::<_, MatchSet>(&format!(
            "SELECT {} FROM match_sets WHERE match_id = ? ORDER BY set_number",
            Self::SET_COLS
        ))
        .bind(match_id)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// The highest-numbered set of a match, if any.
    pub async fn current_set_on(
        conn: &mut SqliteConnection,
        match_id: i64,
    ) -> Result<Option<MatchSet>> {
        let row = sqlx::query_as::<_, MatchSet>(&format!(
            "SELECT {} FROM match_sets WHERE match_id = ? ORDER BY set_number DESC LIMIT 1",
            Self::SET_COLS
        ))
        .bind(match_id)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    pub async fn insert_set_on(
        conn: &mut SqliteConnection,
        match_id: i64,
        set_number: i64,
    ) -> Result<MatchSet> {
        let row = sqlx::query_as::<_, MatchSet>(&format!(
            "INSERT INTO match_sets (match_id, set_number) VALUES (?, ?) RETURNING {}",
            Self::SET_COLS
        ))
        .bind(match_id)
        .bind(set_number)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    pub async fn add_set_points_on(
        conn: &mut SqliteConnection,
        set_id: i64,
        home_delta: i64,
        away_delta: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE match_sets SET home_points = home_points + ?, away_points = away_points + ? \
             WHERE id = ? AND is_locked = 0",
        )
        .bind(home_delta)
        .bind(away_delta)
        .bind(set_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn set_set_finished_on(
        conn: &mut SqliteConnection,
        set_id: i64,
        finished: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE match_sets SET is_finished = ? WHERE id = ? AND is_locked = 0")
            .bind(finished)
            .bind(set_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn delete_set_on(conn: &mut SqliteConnection, set_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM match_sets WHERE id = ? AND is_locked = 0")
            .bind(set_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ── Match updates (append-only audit log) ─────────────────────────

    pub async fn insert_match_update_on(
        conn: &mut SqliteConnection,
        match_id: i64,
        event_id: &str,
        update_type: &str,
        previous_value: &str,
        new_value: &str,
    ) -> Result<MatchUpdate> {
        let row = sqlx::query_as::<_, MatchUpdate>(
            "INSERT INTO match_updates (match_id, event_id, update_type, previous_value, new_value, processed) \
             VALUES (?, ?, ?, ?, ?, 1) \
             RETURNING id, created_at, match_id, event_id, update_type, previous_value, new_value, processed",
        )
        .bind(match_id)
        .bind(event_id)
        .bind(update_type)
        .bind(previous_value)
        .bind(new_value)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    pub async fn list_match_updates(&self, match_id: i64) -> Result<Vec<MatchUpdate>> {
        let rows = sqlx::query_as::<_, MatchUpdate>(
            "SELECT id, created_at, match_id, event_id, update_type, previous_value, new_value, processed \
             FROM match_updates WHERE match_id = ? ORDER BY id",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        sqlx::any::install_default_drivers();
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_team_crud() {
        let db = test_db().await;

        let team = db.create_team("Spikers", "North High", "#ff0000").await.unwrap();
        assert_eq!(team.name, "Spikers");
        assert_eq!(team.school, "North High");

        let teams = db.list_teams().await.unwrap();
        assert_eq!(teams.len(), 1);

        let fetched = db.get_team(team.meta.id).await.unwrap();
        assert!(fetched.is_some());

        assert!(db.delete_team(team.meta.id).await.unwrap());
        assert!(!db.delete_team(team.meta.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_round_chain_and_state() {
        let db = test_db().await;
        let division = db.create_division("Gold").await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let round = Database::insert_round_on(
            &mut conn,
            &NewRound {
                division_id: division.meta.id,
                round_number: 1,
                selection_strategy: "top_by_points".into(),
                generation_strategy: "round_robin".into(),
                grouping_strategy: "no_group".into(),
                teams_per_group: None,
                groups_in_round: None,
                previous_round_id: None,
                advancing_team_count: 4,
            },
        )
        .await
        .unwrap();
        assert_eq!(round.round_state(), RoundState::Created);
        assert_eq!(round.version, 0);

        Database::set_round_state_on(&mut conn, round.meta.id, 0, RoundState::TeamsAssigned)
            .await
            .unwrap();

        // Stale version must be rejected
        let err = Database::set_round_state_on(&mut conn, round.meta.id, 0, RoundState::Finished)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrencyConflict { .. }));

        let reloaded = db.get_round(round.meta.id).await.unwrap().unwrap();
        assert_eq!(reloaded.round_state(), RoundState::TeamsAssigned);
        assert_eq!(reloaded.version, 1);
    }

    #[tokio::test]
    async fn test_round_team_unique_and_stats() {
        let db = test_db().await;
        let division = db.create_division("Gold").await.unwrap();
        let team = db.create_team("A", "", "").await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let round = Database::insert_round_on(
            &mut conn,
            &NewRound {
                division_id: division.meta.id,
                round_number: 1,
                selection_strategy: "top_by_points".into(),
                generation_strategy: "round_robin".into(),
                grouping_strategy: "no_group".into(),
                teams_per_group: None,
                groups_in_round: None,
                previous_round_id: None,
                advancing_team_count: 2,
            },
        )
        .await
        .unwrap();

        let rt = Database::insert_round_team_on(&mut conn, round.meta.id, team.meta.id, Some(1), None)
            .await
            .unwrap();

        // (round, team) is unique
        let dup =
            Database::insert_round_team_on(&mut conn, round.meta.id, team.meta.id, Some(2), None)
                .await;
        assert!(dup.is_err());

        Database::apply_team_result_on(
            &mut conn,
            rt.meta.id,
            TeamResultDelta {
                points: 3,
                wins: 1,
                sets_won: 2,
                sets_lost: 1,
                score_for: 63,
                score_against: 51,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let teams = db.list_round_teams(round.meta.id).await.unwrap();
        assert_eq!(teams[0].points, 3);
        assert_eq!(teams[0].matches_played, 1);
        assert_eq!(teams[0].sets_difference(), 1);
        assert_eq!(teams[0].score_difference(), 12);
    }

    #[tokio::test]
    async fn test_match_and_sets() {
        let db = test_db().await;
        let division = db.create_division("Gold").await.unwrap();
        let a = db.create_team("A", "", "").await.unwrap();
        let b = db.create_team("B", "", "").await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let round = Database::insert_round_on(
            &mut conn,
            &NewRound {
                division_id: division.meta.id,
                round_number: 1,
                selection_strategy: "manual".into(),
                generation_strategy: "manual".into(),
                grouping_strategy: "no_group".into(),
                teams_per_group: None,
                groups_in_round: None,
                previous_round_id: None,
                advancing_team_count: 0,
            },
        )
        .await
        .unwrap();

        let m = Database::insert_match_on(
            &mut conn,
            round.meta.id,
            a.meta.id,
            b.meta.id,
            1,
            1,
            Some("2026-06-01T09:00:00Z"),
        )
        .await
        .unwrap();
        assert_eq!(m.match_number, 1);
        assert!(!m.is_finished);

        let set = Database::insert_set_on(&mut conn, m.meta.id, 1).await.unwrap();
        Database::add_set_points_on(&mut conn, set.meta.id, 25, 21).await.unwrap();
        Database::set_set_finished_on(&mut conn, set.meta.id, true).await.unwrap();

        let current = Database::current_set_on(&mut conn, m.meta.id).await.unwrap().unwrap();
        assert_eq!(current.home_points, 25);
        assert!(current.is_finished);

        Database::set_match_sets_on(&mut conn, m.meta.id, 0, 1, 0).await.unwrap();
        Database::set_match_flags_on(&mut conn, m.meta.id, 1, true, false, false)
            .await
            .unwrap();

        let reloaded = db.get_match(m.meta.id).await.unwrap().unwrap();
        assert!(reloaded.is_finished);
        assert_eq!(reloaded.home_sets, 1);

        let history = db.division_pairing_history(division.meta.id).await.unwrap();
        assert_eq!(history, vec![(a.meta.id, b.meta.id)]);
    }

    #[tokio::test]
    async fn test_match_update_log_append_only() {
        let db = test_db().await;
        let division = db.create_division("Gold").await.unwrap();
        let a = db.create_team("A", "", "").await.unwrap();
        let b = db.create_team("B", "", "").await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let round = Database::insert_round_on(
            &mut conn,
            &NewRound {
                division_id: division.meta.id,
                round_number: 1,
                selection_strategy: "manual".into(),
                generation_strategy: "manual".into(),
                grouping_strategy: "no_group".into(),
                teams_per_group: None,
                groups_in_round: None,
                previous_round_id: None,
                advancing_team_count: 0,
            },
        )
        .await
        .unwrap();
        let m = Database::insert_match_on(&mut conn, round.meta.id, a.meta.id, b.meta.id, 1, 1, None)
            .await
            .unwrap();

        Database::insert_match_update_on(&mut conn, m.meta.id, "ev-1", "score_change", "0", "1")
            .await
            .unwrap();
        Database::insert_match_update_on(&mut conn, m.meta.id, "ev-2", "score_change", "1", "2")
            .await
            .unwrap();

        let updates = db.list_match_updates(m.meta.id).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].event_id, "ev-1");
        assert_eq!(updates[1].new_value, "2");
    }
}
