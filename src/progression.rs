// Round progression orchestrator: composes standings, selection, seeding
// and match generation into the round lifecycle
// Created -> TeamsAssigned -> MatchesGenerated -> Finished -> Locked.
//
// Every operation loads a fresh snapshot inside one transaction and
// commits all-or-nothing, so a failure mid-workflow leaves the previous
// state intact and the operation retryable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::matchgen::{self, MatchGenerationStrategy, MatchSchedule};
use crate::metrics;
use crate::notify::NotificationSink;
use crate::seeding::{self, GapPolicy, GroupConfig, SeedCandidate, SeedPlacement, SortMethod};
use crate::selection::{self, TeamSelectionStrategy};
use crate::standings::{self, RankedTeam};
use crate::store::{Database, Match, NewRound, RoundState, TournamentRound, TournamentRoundTeam};

/// Finalization output: the finished round and its full standings.
#[derive(Debug, Serialize)]
pub struct StandingsResult {
    pub round_id: i64,
    pub standings: Vec<RankedTeam>,
}

/// Configuration for building the next round out of a finished one.
#[derive(Debug, Clone, Deserialize)]
pub struct NextRoundConfig {
    pub selection_strategy: TeamSelectionStrategy,
    /// How many teams advance into the new round.
    pub advancing_team_count: usize,
    #[serde(default)]
    pub manual_team_ids: Option<Vec<i64>>,
    pub sort_method: SortMethod,
    pub seed_placement: SeedPlacement,
    pub gap_policy: GapPolicy,
    pub generation_strategy: MatchGenerationStrategy,
    #[serde(default = "default_grouping")]
    pub grouping_strategy: String,
    #[serde(default)]
    pub teams_per_group: Option<i64>,
    #[serde(default)]
    pub groups_in_round: Option<i64>,
    /// How many teams will advance out of the new round (0 = undecided).
    #[serde(default)]
    pub next_advancing_count: i64,
    #[serde(default)]
    pub generate_matches_now: bool,
    #[serde(default)]
    pub schedule: Option<MatchSchedule>,
}

fn default_grouping() -> String {
    "no_group".to_string()
}

pub struct RoundProgression {
    db: Arc<Database>,
    sink: Arc<dyn NotificationSink>,
}

impl RoundProgression {
    pub fn new(db: Arc<Database>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { db, sink }
    }

    async fn load_round(&self, round_id: i64) -> Result<TournamentRound> {
        self.db.get_round(round_id).await?.ok_or(Error::NotFound {
            entity: "round",
            id: round_id,
        })
    }

    fn expect_state(
        round: &TournamentRound,
        expected: RoundState,
        requested: &'static str,
    ) -> Result<()> {
        if round.round_state() != expected {
            return Err(Error::InvalidRoundState {
                round_id: round.meta.id,
                current: round.round_state(),
                requested,
            });
        }
        Ok(())
    }

    /// Create the first round of a division from a template, with its
    /// teams seeded in the order given. Group counts are per-round
    /// configuration, not part of the template.
    pub async fn create_opening_round(
        &self,
        division_id: i64,
        template_id: i64,
        team_ids: &[i64],
        teams_per_group: Option<i64>,
        groups_in_round: Option<i64>,
    ) -> Result<TournamentRound> {
        let template = self
            .db
            .get_round_template(template_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "round_template",
                id: template_id,
            })?;
        self.db
            .get_division(division_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "division",
                id: division_id,
            })?;

        if team_ids.is_empty() {
            return Err(Error::Validation("team list must not be empty".into()));
        }
        if template.recommended_team_count > 0
            && team_ids.len() as i64 != template.recommended_team_count
        {
            return Err(Error::Validation(format!(
                "template '{}' expects {} teams, got {}",
                template.name,
                template.recommended_team_count,
                team_ids.len()
            )));
        }
        if self.db.division_has_open_round(division_id).await? {
            return Err(Error::StateConflict(format!(
                "division {division_id} already has an open round"
            )));
        }

        let group_config = GroupConfig::from_round(
            &template.grouping_strategy,
            teams_per_group,
            groups_in_round,
        )?;

        let round_number = self
            .db
            .list_rounds_for_division(division_id)
            .await?
            .iter()
            .map(|r| r.round_number)
            .max()
            .unwrap_or(0)
            + 1;

        let mut tx = self.db.begin().await?;
        let round = Database::insert_round_on(
            &mut tx,
            &NewRound {
                division_id,
                round_number,
                selection_strategy: template.selection_strategy.clone(),
                generation_strategy: template.generation_strategy.clone(),
                grouping_strategy: template.grouping_strategy.clone(),
                teams_per_group,
                groups_in_round,
                previous_round_id: None,
                advancing_team_count: template.recommended_team_count,
            },
        )
        .await?;

        let mut seeded: Vec<seeding::SeededTeam> = team_ids
            .iter()
            .enumerate()
            .map(|(i, id)| seeding::SeededTeam {
                team_id: *id,
                seed_number: i as i64 + 1,
                group_name: None,
            })
            .collect();
        seeding::assign_groups(&mut seeded, group_config);

        for s in &seeded {
            Database::insert_round_team_on(
                &mut tx,
                round.meta.id,
                s.team_id,
                Some(s.seed_number),
                s.group_name.as_deref(),
            )
            .await?;
        }
        Database::set_round_state_on(&mut tx, round.meta.id, round.version, RoundState::TeamsAssigned)
            .await?;
        tx.commit().await?;

        metrics::ROUNDS_CREATED_TOTAL.inc();
        tracing::info!(
            round_id = round.meta.id,
            division_id,
            teams = team_ids.len(),
            "opening round created"
        );
        self.sink.publish(
            "round_created",
            json!({ "round_id": round.meta.id, "division_id": division_id }),
        );

        self.load_round(round.meta.id).await
    }

    /// Assign teams to a round still in `Created`. Seeds follow the listed
    /// order; groups follow the round's grouping configuration.
    pub async fn assign_teams(
        &self,
        round_id: i64,
        team_ids: &[i64],
    ) -> Result<Vec<TournamentRoundTeam>> {
        let round = self.load_round(round_id).await?;
        Self::expect_state(&round, RoundState::Created, "assign teams")?;
        if team_ids.is_empty() {
            return Err(Error::Validation("team list must not be empty".into()));
        }
        if self.db.round_has_matches(round_id).await? {
            return Err(Error::StateConflict(format!(
                "round {round_id} already has matches"
            )));
        }

        let group_config = GroupConfig::from_round(
            &round.grouping_strategy,
            round.teams_per_group,
            round.groups_in_round,
        )?;

        let mut seeded: Vec<seeding::SeededTeam> = team_ids
            .iter()
            .enumerate()
            .map(|(i, id)| seeding::SeededTeam {
                team_id: *id,
                seed_number: i as i64 + 1,
                group_name: None,
            })
            .collect();
        seeding::assign_groups(&mut seeded, group_config);

        let mut tx = self.db.begin().await?;
        for s in &seeded {
            Database::insert_round_team_on(
                &mut tx,
                round_id,
                s.team_id,
                Some(s.seed_number),
                s.group_name.as_deref(),
            )
            .await?;
        }
        Database::set_round_state_on(&mut tx, round_id, round.version, RoundState::TeamsAssigned)
            .await?;
        tx.commit().await?;

        self.sink.publish(
            "teams_assigned",
            json!({ "round_id": round_id, "teams": team_ids.len() }),
        );
        self.db.list_round_teams(round_id).await
    }

    /// Re-seed (and re-group) a round's teams before matches exist.
    pub async fn seed_round<R: Rng>(
        &self,
        round_id: i64,
        sort: SortMethod,
        placement: SeedPlacement,
        gaps: GapPolicy,
        rng: &mut R,
    ) -> Result<Vec<TournamentRoundTeam>> {
        let round = self.load_round(round_id).await?;
        Self::expect_state(&round, RoundState::TeamsAssigned, "seed teams")?;

        let group_config = GroupConfig::from_round(
            &round.grouping_strategy,
            round.teams_per_group,
            round.groups_in_round,
        )?;

        let round_teams = self.db.list_round_teams(round_id).await?;
        let candidates = self.seed_candidates(&round_teams, round.previous_round_id, true).await?;

        let mut seeded = seeding::assign_seeds(candidates, sort, placement, gaps, rng);
        seeding::assign_groups(&mut seeded, group_config);

        let by_team: HashMap<i64, i64> =
            round_teams.iter().map(|rt| (rt.team_id, rt.meta.id)).collect();

        let mut tx = self.db.begin().await?;
        for s in &seeded {
            let round_team_id = by_team.get(&s.team_id).ok_or(Error::NotFound {
                entity: "round_team",
                id: s.team_id,
            })?;
            Database::update_seed_group_on(
                &mut tx,
                *round_team_id,
                Some(s.seed_number),
                s.group_name.as_deref(),
            )
            .await?;
        }
        tx.commit().await?;

        self.db.list_round_teams(round_id).await
    }

    /// Build seed candidates: team identity plus the rating carried from
    /// the previous round's ranking points. `fresh` clears existing seeds
    /// so the whole round is renumbered from scratch.
    async fn seed_candidates(
        &self,
        round_teams: &[TournamentRoundTeam],
        previous_round_id: Option<i64>,
        fresh: bool,
    ) -> Result<Vec<SeedCandidate>> {
        let teams = self.db.list_teams().await?;
        let info: HashMap<i64, (&str, &str)> = teams
            .iter()
            .map(|t| (t.meta.id, (t.name.as_str(), t.meta.created_at.as_str())))
            .collect();

        let ratings: HashMap<i64, i64> = match previous_round_id {
            Some(prev) => self
                .db
                .list_round_teams(prev)
                .await?
                .into_iter()
                .map(|rt| (rt.team_id, rt.ranking_points.unwrap_or(0)))
                .collect(),
            None => HashMap::new(),
        };

        Ok(round_teams
            .iter()
            .map(|rt| {
                let (name, created_at) = info
                    .get(&rt.team_id)
                    .copied()
                    .unwrap_or(("", ""));
                SeedCandidate {
                    team_id: rt.team_id,
                    name: name.to_string(),
                    created_at: created_at.to_string(),
                    rating: ratings.get(&rt.team_id).copied().unwrap_or(0),
                    seed_number: if fresh { None } else { rt.seed_number },
                }
            })
            .collect())
    }

    /// Generate the round's match schedule from its stored strategy.
    pub async fn generate_round_matches(
        &self,
        round_id: i64,
        schedule: Option<MatchSchedule>,
    ) -> Result<Vec<Match>> {
        let round = self.load_round(round_id).await?;
        Self::expect_state(&round, RoundState::TeamsAssigned, "generate matches")?;

        let strategy = MatchGenerationStrategy::from_str_name(&round.generation_strategy)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown generation strategy '{}'",
                    round.generation_strategy
                ))
            })?;

        let round_teams = self.db.list_round_teams(round_id).await?;
        if strategy.requires_seeds() && round_teams.iter().any(|t| t.seed_number.is_none()) {
            return Err(Error::RoundNotReady {
                round_id,
                reason: format!("{} requires seeded teams", strategy.to_str_name()),
            });
        }

        let history: HashSet<(i64, i64)> = self
            .db
            .division_pairing_history(round.division_id)
            .await?
            .into_iter()
            .collect();

        let generated = matchgen::generate_matches(&round_teams, strategy, schedule.as_ref(), &history)?;

        let mut tx = self.db.begin().await?;
        for plan in &generated.matches {
            Database::insert_match_on(
                &mut tx,
                round_id,
                plan.home_team_id,
                plan.away_team_id,
                plan.match_number,
                plan.court_number,
                plan.scheduled_time.as_deref(),
            )
            .await?;
        }
        Database::set_round_state_on(&mut tx, round_id, round.version, RoundState::MatchesGenerated)
            .await?;
        tx.commit().await?;

        metrics::MATCHES_GENERATED_TOTAL
            .with_label_values(&[strategy.to_str_name()])
            .inc();
        tracing::info!(
            round_id,
            matches = generated.matches.len(),
            byes = generated.byes.len(),
            strategy = strategy.to_str_name(),
            "matches generated"
        );
        self.sink.publish(
            "matches_generated",
            json!({
                "round_id": round_id,
                "matches": generated.matches.len(),
                "byes": generated.byes,
            }),
        );

        self.db.list_matches(round_id).await
    }

    /// Finalize a round: all matches finished, none disputed. Recomputes
    /// standings and writes rank and ranking points onto the round teams.
    pub async fn finalize_round(&self, round_id: i64) -> Result<StandingsResult> {
        let mut tx = self.db.begin().await?;
        let round = Database::get_round_on(&mut tx, round_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "round",
                id: round_id,
            })?;
        Self::expect_state(&round, RoundState::MatchesGenerated, "finalize")?;

        let unfinished = Database::unfinished_match_count_on(&mut tx, round_id).await?;
        if unfinished > 0 {
            return Err(Error::StateConflict(format!(
                "round {round_id} has {unfinished} unfinished matches"
            )));
        }
        let disputed = Database::disputed_match_count_on(&mut tx, round_id).await?;
        if disputed > 0 {
            return Err(Error::StateConflict(format!(
                "round {round_id} has {disputed} disputed matches"
            )));
        }

        let round_teams = Database::list_round_teams_on(&mut tx, round_id).await?;
        let team_count = round_teams.len();
        let ranked = standings::compute_standings(round_teams);
        for entry in &ranked {
            Database::write_ranking_on(
                &mut tx,
                entry.team.meta.id,
                entry.rank,
                standings::ranking_points(entry.rank, team_count),
            )
            .await?;
        }
        Database::set_round_state_on(&mut tx, round_id, round.version, RoundState::Finished).await?;
        tx.commit().await?;

        metrics::ROUNDS_FINALIZED_TOTAL.inc();
        tracing::info!(round_id, teams = team_count, "round finalized");
        self.sink.publish(
            "round_finalized",
            json!({
                "round_id": round_id,
                "standings": ranked
                    .iter()
                    .map(|r| json!({ "team_id": r.team.team_id, "rank": r.rank }))
                    .collect::<Vec<_>>(),
            }),
        );

        Ok(StandingsResult {
            round_id,
            standings: ranked,
        })
    }

    /// Preview which teams would advance from a finished round. Pure read.
    pub async fn select_advancing_teams(
        &self,
        round_id: i64,
        strategy: TeamSelectionStrategy,
        count: usize,
        manual_team_ids: Option<&[i64]>,
    ) -> Result<Vec<TournamentRoundTeam>> {
        let round = self.load_round(round_id).await?;
        if !matches!(round.round_state(), RoundState::Finished | RoundState::Locked) {
            return Err(Error::InvalidRoundState {
                round_id,
                current: round.round_state(),
                requested: "select advancing teams",
            });
        }
        let ranked = standings::compute_standings(self.db.list_round_teams(round_id).await?);
        selection::select_advancing(&ranked, strategy, count, manual_team_ids)
    }

    /// Build the next round from a finished one: select advancing teams,
    /// seed and group them, link the rounds, and optionally generate the
    /// new round's matches right away. One transaction end to end.
    pub async fn create_next_round<R: Rng>(
        &self,
        previous_round_id: i64,
        config: &NextRoundConfig,
        rng: &mut R,
    ) -> Result<TournamentRound> {
        let previous = self.load_round(previous_round_id).await?;
        Self::expect_state(&previous, RoundState::Finished, "create next round")?;
        if previous.next_round_id.is_some() {
            return Err(Error::StateConflict(format!(
                "round {previous_round_id} already has a successor"
            )));
        }

        let group_config = GroupConfig::from_round(
            &config.grouping_strategy,
            config.teams_per_group,
            config.groups_in_round,
        )?;

        let ranked = standings::compute_standings(self.db.list_round_teams(previous_round_id).await?);
        let advancing = selection::select_advancing(
            &ranked,
            config.selection_strategy,
            config.advancing_team_count,
            config.manual_team_ids.as_deref(),
        )?;

        let candidates = self
            .seed_candidates(&advancing, Some(previous_round_id), true)
            .await?;
        let mut seeded = seeding::assign_seeds(
            candidates,
            config.sort_method,
            config.seed_placement,
            config.gap_policy,
            rng,
        );
        seeding::assign_groups(&mut seeded, group_config);

        let history: HashSet<(i64, i64)> = self
            .db
            .division_pairing_history(previous.division_id)
            .await?
            .into_iter()
            .collect();

        let mut tx = self.db.begin().await?;
        let round = Database::insert_round_on(
            &mut tx,
            &NewRound {
                division_id: previous.division_id,
                round_number: previous.round_number + 1,
                selection_strategy: config.selection_strategy.to_str_name().to_string(),
                generation_strategy: config.generation_strategy.to_str_name().to_string(),
                grouping_strategy: config.grouping_strategy.clone(),
                teams_per_group: config.teams_per_group,
                groups_in_round: config.groups_in_round,
                previous_round_id: Some(previous_round_id),
                advancing_team_count: config.next_advancing_count,
            },
        )
        .await?;

        let mut inserted = Vec::with_capacity(seeded.len());
        for s in &seeded {
            inserted.push(
                Database::insert_round_team_on(
                    &mut tx,
                    round.meta.id,
                    s.team_id,
                    Some(s.seed_number),
                    s.group_name.as_deref(),
                )
                .await?,
            );
        }
        Database::set_next_round_on(&mut tx, previous_round_id, round.meta.id).await?;
        Database::set_round_state_on(&mut tx, round.meta.id, round.version, RoundState::TeamsAssigned)
            .await?;

        if config.generate_matches_now {
            let generated = matchgen::generate_matches(
                &inserted,
                config.generation_strategy,
                config.schedule.as_ref(),
                &history,
            )?;
            for plan in &generated.matches {
                Database::insert_match_on(
                    &mut tx,
                    round.meta.id,
                    plan.home_team_id,
                    plan.away_team_id,
                    plan.match_number,
                    plan.court_number,
                    plan.scheduled_time.as_deref(),
                )
                .await?;
            }
            Database::set_round_state_on(
                &mut tx,
                round.meta.id,
                round.version + 1,
                RoundState::MatchesGenerated,
            )
            .await?;
            metrics::MATCHES_GENERATED_TOTAL
                .with_label_values(&[config.generation_strategy.to_str_name()])
                .inc();
        }
        tx.commit().await?;

        metrics::ROUNDS_CREATED_TOTAL.inc();
        tracing::info!(
            previous_round_id,
            round_id = round.meta.id,
            teams = seeded.len(),
            "next round created"
        );
        self.sink.publish(
            "next_round_created",
            json!({
                "previous_round_id": previous_round_id,
                "round_id": round.meta.id,
                "teams": seeded.len(),
            }),
        );

        self.load_round(round.meta.id).await
    }

    /// Lock a finished round. Irreversible; blocks all further mutation of
    /// its matches and teams.
    pub async fn lock_round(&self, round_id: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let round = Database::get_round_on(&mut tx, round_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "round",
                id: round_id,
            })?;
        Self::expect_state(&round, RoundState::Finished, "lock")?;

        let unfinished = Database::unfinished_match_count_on(&mut tx, round_id).await?;
        if unfinished > 0 {
            return Err(Error::StateConflict(format!(
                "round {round_id} still has {unfinished} unfinished matches"
            )));
        }

        Database::lock_round_on(&mut tx, round_id).await?;
        Database::set_round_state_on(&mut tx, round_id, round.version, RoundState::Locked).await?;
        tx.commit().await?;

        tracing::info!(round_id, "round locked");
        self.sink
            .publish("round_locked", json!({ "round_id": round_id }));
        Ok(())
    }
}
