// Advancing-team selection: which teams of a finished round qualify for
// the next one.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::standings::RankedTeam;
use crate::store::TournamentRoundTeam;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamSelectionStrategy {
    Manual,
    TopByPoints,
    WinnersOnly,
    TopFromGroupAndNextBest,
}

impl TeamSelectionStrategy {
    /// Parse a strategy string (from DB) into a TeamSelectionStrategy.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "top_by_points" => Some(Self::TopByPoints),
            "winners_only" => Some(Self::WinnersOnly),
            "top_from_group_and_next_best" => Some(Self::TopFromGroupAndNextBest),
            _ => None,
        }
    }

    /// Serialize to a DB-storable string.
    pub fn to_str_name(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::TopByPoints => "top_by_points",
            Self::WinnersOnly => "winners_only",
            Self::TopFromGroupAndNextBest => "top_from_group_and_next_best",
        }
    }
}

/// Select the teams advancing out of a ranked, finished round.
///
/// `ranked` must come from the standings calculator (best first). The
/// returned list is in selection order, which later becomes seed order.
pub fn select_advancing(
    ranked: &[RankedTeam],
    strategy: TeamSelectionStrategy,
    count: usize,
    manual_team_ids: Option<&[i64]>,
) -> Result<Vec<TournamentRoundTeam>> {
    match strategy {
        TeamSelectionStrategy::TopByPoints => top_by_points(ranked, count),
        TeamSelectionStrategy::WinnersOnly => winners_only(ranked, count),
        TeamSelectionStrategy::TopFromGroupAndNextBest => top_from_group_and_next_best(ranked, count),
        TeamSelectionStrategy::Manual => {
            let ids = manual_team_ids.ok_or_else(|| {
                Error::Validation("manual selection requires an explicit team list".into())
            })?;
            manual(ranked, count, ids)
        }
    }
}

fn top_by_points(ranked: &[RankedTeam], count: usize) -> Result<Vec<TournamentRoundTeam>> {
    if ranked.len() < count {
        return Err(Error::InsufficientTeams {
            needed: count,
            available: ranked.len(),
        });
    }
    Ok(ranked.iter().take(count).map(|r| r.team.clone()).collect())
}

/// Group winners, ordered by overall rank. Grouping is keyed on the teams'
/// group names; a round without groups cannot use this strategy.
fn winners_only(ranked: &[RankedTeam], count: usize) -> Result<Vec<TournamentRoundTeam>> {
    let mut winners: Vec<TournamentRoundTeam> = Vec::new();
    let mut seen_groups: HashSet<String> = HashSet::new();
    let mut any_group = false;

    // ranked is best-first, so the first team seen per group is its winner
    for entry in ranked {
        let Some(group) = entry.team.group_name.clone() else {
            continue;
        };
        any_group = true;
        if seen_groups.insert(group) {
            winners.push(entry.team.clone());
        }
    }

    if !any_group {
        return Err(Error::InvalidStrategyConfig(
            "winners_only requires a round with groups".into(),
        ));
    }
    if winners.len() < count {
        return Err(Error::InsufficientQualifiers {
            needed: count,
            found: winners.len(),
        });
    }
    Ok(winners)
}

/// Top team of each group first, then next-best teams by overall rank until
/// `count` is reached or candidates run out.
fn top_from_group_and_next_best(
    ranked: &[RankedTeam],
    count: usize,
) -> Result<Vec<TournamentRoundTeam>> {
    // BTreeMap keeps group iteration deterministic
    let mut group_winner_ids: BTreeMap<String, i64> = BTreeMap::new();
    let mut any_group = false;
    for entry in ranked {
        let Some(group) = entry.team.group_name.clone() else {
            continue;
        };
        any_group = true;
        group_winner_ids.entry(group).or_insert(entry.team.team_id);
    }
    if !any_group {
        return Err(Error::InvalidStrategyConfig(
            "top_from_group_and_next_best requires a round with groups".into(),
        ));
    }

    let winner_ids: HashSet<i64> = group_winner_ids.values().copied().collect();
    let mut selected: Vec<TournamentRoundTeam> = ranked
        .iter()
        .filter(|r| winner_ids.contains(&r.team.team_id))
        .map(|r| r.team.clone())
        .collect();

    for entry in ranked {
        if selected.len() >= count {
            break;
        }
        if winner_ids.contains(&entry.team.team_id) {
            continue;
        }
        selected.push(entry.team.clone());
    }

    selected.truncate(count.max(winner_ids.len()));
    Ok(selected)
}

/// Pass through a caller-supplied list after validating membership and the
/// configured minimum count.
fn manual(
    ranked: &[RankedTeam],
    min_count: usize,
    team_ids: &[i64],
) -> Result<Vec<TournamentRoundTeam>> {
    if team_ids.len() < min_count {
        return Err(Error::Validation(format!(
            "manual selection needs at least {} teams, got {}",
            min_count,
            team_ids.len()
        )));
    }

    let mut seen: HashSet<i64> = HashSet::new();
    for id in team_ids {
        if !seen.insert(*id) {
            return Err(Error::Validation(format!("duplicate team id {id}")));
        }
    }

    let by_id: BTreeMap<i64, &TournamentRoundTeam> =
        ranked.iter().map(|r| (r.team.team_id, &r.team)).collect();

    let mut selected = Vec::with_capacity(team_ids.len());
    for id in team_ids {
        let team = by_id.get(id).ok_or_else(|| {
            Error::Validation(format!("team {id} is not part of this round"))
        })?;
        selected.push((*team).clone());
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standings::compute_standings;
    use crate::store::EntityMeta;

    fn team(id: i64, points: i64, group: Option<&str>) -> TournamentRoundTeam {
        TournamentRoundTeam {
            meta: EntityMeta {
                id,
                created_at: String::new(),
            },
            round_id: 1,
            team_id: id,
            seed_number: Some(id),
            group_name: group.map(str::to_string),
            final_rank: None,
            ranking_points: None,
            points,
            matches_played: 0,
            wins: 0,
            draws: 0,
            losses: 0,
            sets_won: 0,
            sets_lost: 0,
            score_for: 0,
            score_against: 0,
        }
    }

    #[test]
    fn test_top_by_points() {
        let ranked = compute_standings(vec![
            team(1, 3, None),
            team(2, 9, None),
            team(3, 6, None),
            team(4, 0, None),
        ]);
        let selected = select_advancing(&ranked, TeamSelectionStrategy::TopByPoints, 2, None).unwrap();
        let ids: Vec<i64> = selected.iter().map(|t| t.team_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_top_by_points_insufficient() {
        let ranked = compute_standings(vec![team(1, 3, None)]);
        let err = select_advancing(&ranked, TeamSelectionStrategy::TopByPoints, 4, None).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientTeams {
                needed: 4,
                available: 1
            }
        ));
    }

    #[test]
    fn test_winners_only_picks_group_leaders() {
        let ranked = compute_standings(vec![
            team(1, 9, Some("A")),
            team(2, 6, Some("A")),
            team(3, 7, Some("B")),
            team(4, 8, Some("B")),
        ]);
        let selected = select_advancing(&ranked, TeamSelectionStrategy::WinnersOnly, 2, None).unwrap();
        let ids: Vec<i64> = selected.iter().map(|t| t.team_id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_winners_only_requires_groups() {
        let ranked = compute_standings(vec![team(1, 9, None), team(2, 6, None)]);
        let err = select_advancing(&ranked, TeamSelectionStrategy::WinnersOnly, 2, None).unwrap_err();
        assert!(matches!(err, Error::InvalidStrategyConfig(_)));
    }

    #[test]
    fn test_winners_only_insufficient_qualifiers() {
        let ranked = compute_standings(vec![team(1, 9, Some("A")), team(2, 6, Some("A"))]);
        let err = select_advancing(&ranked, TeamSelectionStrategy::WinnersOnly, 2, None).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientQualifiers {
                needed: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_top_from_group_and_next_best() {
        // 2 groups of 4, N=5: both winners plus next 3 best overall
        let ranked = compute_standings(vec![
            team(1, 9, Some("A")),
            team(2, 7, Some("A")),
            team(3, 4, Some("A")),
            team(4, 1, Some("A")),
            team(5, 8, Some("B")),
            team(6, 6, Some("B")),
            team(7, 5, Some("B")),
            team(8, 2, Some("B")),
        ]);
        let selected =
            select_advancing(&ranked, TeamSelectionStrategy::TopFromGroupAndNextBest, 5, None)
                .unwrap();
        let ids: Vec<i64> = selected.iter().map(|t| t.team_id).collect();
        // Winners 1 and 5, then 2 (7 pts), 6 (6 pts), 7 (5 pts)
        assert_eq!(ids, vec![1, 5, 2, 6, 7]);

        // No duplicates
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_manual_validates_membership() {
        let ranked = compute_standings(vec![team(1, 3, None), team(2, 6, None)]);
        let selected =
            select_advancing(&ranked, TeamSelectionStrategy::Manual, 2, Some(&[2, 1])).unwrap();
        let ids: Vec<i64> = selected.iter().map(|t| t.team_id).collect();
        assert_eq!(ids, vec![2, 1]);

        let err = select_advancing(&ranked, TeamSelectionStrategy::Manual, 2, Some(&[2, 99]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err =
            select_advancing(&ranked, TeamSelectionStrategy::Manual, 2, Some(&[2])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = select_advancing(&ranked, TeamSelectionStrategy::Manual, 2, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_strategy_round_trip() {
        for s in [
            TeamSelectionStrategy::Manual,
            TeamSelectionStrategy::TopByPoints,
            TeamSelectionStrategy::WinnersOnly,
            TeamSelectionStrategy::TopFromGroupAndNextBest,
        ] {
            assert_eq!(TeamSelectionStrategy::from_str_name(s.to_str_name()), Some(s));
        }
        assert_eq!(TeamSelectionStrategy::from_str_name("unknown"), None);
    }
}
