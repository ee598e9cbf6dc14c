// Match schedule generation: round robin (circle method), seeded
// single-elimination brackets with byes, Swiss pairings with repeat
// avoidance, and court/time slot assignment.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::TournamentRoundTeam;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchGenerationStrategy {
    RoundRobin,
    SeededBracket,
    Swiss,
    GroupStageKnockout,
    Manual,
}

impl MatchGenerationStrategy {
    /// Parse a strategy string (from DB) into a MatchGenerationStrategy.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Self::RoundRobin),
            "seeded_bracket" => Some(Self::SeededBracket),
            "swiss" => Some(Self::Swiss),
            "group_stage_knockout" => Some(Self::GroupStageKnockout),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Serialize to a DB-storable string.
    pub fn to_str_name(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::SeededBracket => "seeded_bracket",
            Self::Swiss => "swiss",
            Self::GroupStageKnockout => "group_stage_knockout",
            Self::Manual => "manual",
        }
    }

    /// Whether this strategy pairs by seed and therefore needs every team
    /// to hold a seed number before generation.
    pub fn requires_seeds(self) -> bool {
        matches!(self, Self::SeededBracket | Self::Swiss)
    }
}

/// Court and time-slot parameters for a round's schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSchedule {
    pub start_time: DateTime<Utc>,
    pub match_interval_minutes: i64,
    pub number_of_courts: i64,
    pub starting_court_number: i64,
}

impl MatchSchedule {
    /// Court and time for the n-th match (0-based slot index). Slots cycle
    /// courts first, then advance the clock by the interval.
    fn slot(&self, index: usize) -> (i64, DateTime<Utc>) {
        let courts = self.number_of_courts.max(1);
        let court = self.starting_court_number + (index as i64 % courts);
        let wave = index as i64 / courts;
        let time = self.start_time + Duration::minutes(wave * self.match_interval_minutes);
        (court, time)
    }
}

/// One planned match, ready to be persisted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPlan {
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub match_number: i64,
    pub court_number: i64,
    pub scheduled_time: Option<String>,
}

/// Generation output: planned matches plus teams advancing on a bye.
#[derive(Debug, Clone, Default)]
pub struct GeneratedMatches {
    pub matches: Vec<MatchPlan>,
    pub byes: Vec<i64>,
}

/// Generate the match schedule for a round.
///
/// `previous_pairings` holds every (home, away) pair already scheduled in
/// the division, in any order; only Swiss consults it.
pub fn generate_matches(
    teams: &[TournamentRoundTeam],
    strategy: MatchGenerationStrategy,
    schedule: Option<&MatchSchedule>,
    previous_pairings: &HashSet<(i64, i64)>,
) -> Result<GeneratedMatches> {
    if strategy.requires_seeds() && teams.iter().any(|t| t.seed_number.is_none()) {
        return Err(Error::Validation(format!(
            "{} generation requires every team to be seeded",
            strategy.to_str_name()
        )));
    }

    match strategy {
        MatchGenerationStrategy::Manual => Ok(GeneratedMatches::default()),
        MatchGenerationStrategy::RoundRobin | MatchGenerationStrategy::GroupStageKnockout => {
            Ok(schedule_plans(round_robin(teams), Vec::new(), schedule))
        }
        MatchGenerationStrategy::SeededBracket => {
            let (pairs, byes) = seeded_bracket(teams);
            Ok(schedule_plans(pairs, byes, schedule))
        }
        MatchGenerationStrategy::Swiss => Ok(schedule_plans(
            swiss(teams, previous_pairings)?,
            Vec::new(),
            schedule,
        )),
    }
}

/// Number the pairings sequentially and attach court/time slots.
fn schedule_plans(
    pairs: Vec<(i64, i64)>,
    byes: Vec<i64>,
    schedule: Option<&MatchSchedule>,
) -> GeneratedMatches {
    let matches = pairs
        .into_iter()
        .enumerate()
        .map(|(i, (home, away))| {
            let (court, time) = match schedule {
                Some(s) => {
                    let (court, time) = s.slot(i);
                    (court, Some(time.to_rfc3339()))
                }
                None => (1, None),
            };
            MatchPlan {
                home_team_id: home,
                away_team_id: away,
                match_number: i as i64 + 1,
                court_number: court,
                scheduled_time: time,
            }
        })
        .collect();
    GeneratedMatches { matches, byes }
}

/// Teams of a group in pairing order: by seed when present, row order
/// otherwise.
fn ordered_ids(teams: &[&TournamentRoundTeam]) -> Vec<i64> {
    let mut sorted: Vec<&TournamentRoundTeam> = teams.to_vec();
    sorted.sort_by_key(|t| (t.seed_number.unwrap_or(i64::MAX), t.meta.id));
    sorted.iter().map(|t| t.team_id).collect()
}

/// Round robin via the circle method, per group if the teams carry group
/// names. Play-rounds are interleaved across groups so courts stay busy
/// and no team idles beyond the unavoidable bye for odd counts.
fn round_robin(teams: &[TournamentRoundTeam]) -> Vec<(i64, i64)> {
    let mut groups: BTreeMap<String, Vec<&TournamentRoundTeam>> = BTreeMap::new();
    for t in teams {
        groups
            .entry(t.group_name.clone().unwrap_or_default())
            .or_default()
            .push(t);
    }

    let per_group: Vec<Vec<Vec<(i64, i64)>>> = groups
        .values()
        .map(|members| circle_rounds(&ordered_ids(members)))
        .collect();

    let max_rounds = per_group.iter().map(Vec::len).max().unwrap_or(0);
    let mut pairs = Vec::new();
    for round in 0..max_rounds {
        for rounds in &per_group {
            if let Some(round_pairs) = rounds.get(round) {
                pairs.extend_from_slice(round_pairs);
            }
        }
    }
    pairs
}

/// Circle method: fix the first entrant, rotate the rest. Odd counts get a
/// phantom entrant; pairing against it is a bye (no match that slot).
fn circle_rounds(ids: &[i64]) -> Vec<Vec<(i64, i64)>> {
    if ids.len() < 2 {
        return Vec::new();
    }
    let mut ring: Vec<Option<i64>> = ids.iter().copied().map(Some).collect();
    if ring.len() % 2 == 1 {
        ring.push(None);
    }
    let n = ring.len();

    let mut rounds = Vec::with_capacity(n - 1);
    for round in 0..n - 1 {
        let mut pairs = Vec::with_capacity(n / 2);
        for i in 0..n / 2 {
            if let (Some(a), Some(b)) = (ring[i], ring[n - 1 - i]) {
                // alternate the fixed seat's side so home/away balance out
                if i == 0 && round % 2 == 1 {
                    pairs.push((b, a));
                } else {
                    pairs.push((a, b));
                }
            }
        }
        rounds.push(pairs);
        let last = ring.pop().unwrap_or(None);
        ring.insert(1, last);
    }
    rounds
}

/// Seeded single-elimination pairing: 1 vs K, 2 vs K-1, ... For a field
/// that is not a power of two, the bracket is padded with byes handed to
/// the top seeds instead of placeholder matches.
fn seeded_bracket(teams: &[TournamentRoundTeam]) -> (Vec<(i64, i64)>, Vec<i64>) {
    let refs: Vec<&TournamentRoundTeam> = teams.iter().collect();
    let ids = ordered_ids(&refs);
    let k = ids.len();
    if k < 2 {
        return (Vec::new(), ids);
    }

    let bracket = k.next_power_of_two();
    let bye_count = bracket - k;
    let byes: Vec<i64> = ids[..bye_count].to_vec();
    let players = &ids[bye_count..];

    let mut pairs = Vec::with_capacity(players.len() / 2);
    let mut lo = 0;
    let mut hi = players.len();
    while lo < hi - 1 {
        hi -= 1;
        pairs.push((players[lo], players[hi]));
        lo += 1;
    }
    (pairs, byes)
}

/// Swiss pairing: nearest current ranking, never repeating an earlier
/// pairing from the same division. Backtracking keeps the nearest-rank
/// preference while still finding any legal perfect pairing; if none
/// exists, generation fails rather than silently repeating.
fn swiss(
    teams: &[TournamentRoundTeam],
    previous_pairings: &HashSet<(i64, i64)>,
) -> Result<Vec<(i64, i64)>> {
    let refs: Vec<&TournamentRoundTeam> = teams.iter().collect();
    let ids = ordered_ids(&refs);
    let played: HashSet<(i64, i64)> = previous_pairings
        .iter()
        .map(|&(a, b)| norm_pair(a, b))
        .collect();

    if ids.len() % 2 == 1 {
        // Give the bye to the lowest-ranked team for which the remainder
        // still pairs cleanly.
        for bye_index in (0..ids.len()).rev() {
            let mut rest = ids.clone();
            rest.remove(bye_index);
            if let Some(pairs) = pair_swiss(&rest, &played) {
                return Ok(pairs);
            }
        }
    } else if let Some(pairs) = pair_swiss(&ids, &played) {
        return Ok(pairs);
    }

    Err(Error::UnresolvablePairing(
        "every remaining pairing would repeat an earlier match".into(),
    ))
}

/// Pair off `ids` (ranked best-first) avoiding `played`. Tries the nearest
/// ranked opponent for the current leader first, backtracking on failure.
fn pair_swiss(ids: &[i64], played: &HashSet<(i64, i64)>) -> Option<Vec<(i64, i64)>> {
    if ids.is_empty() {
        return Some(Vec::new());
    }
    let first = ids[0];
    for i in 1..ids.len() {
        let opponent = ids[i];
        if played.contains(&norm_pair(first, opponent)) {
            continue;
        }
        let rest: Vec<i64> = ids[1..]
            .iter()
            .copied()
            .filter(|id| *id != opponent)
            .collect();
        if let Some(mut pairs) = pair_swiss(&rest, played) {
            pairs.insert(0, (first, opponent));
            return Some(pairs);
        }
    }
    None
}

fn norm_pair(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
