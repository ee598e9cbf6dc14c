// Standings calculation for a round.
//
// Deterministic comparator: points desc, sets difference desc, score
// difference desc, seed number asc. Ranks are 1-based and never shared.

use std::cmp::Ordering;

use serde::Serialize;

use crate::store::TournamentRoundTeam;

/// A ranked entry: the round team plus its computed 1-based rank.
#[derive(Debug, Clone, Serialize)]
pub struct RankedTeam {
    pub team: TournamentRoundTeam,
    pub rank: i64,
}

/// Compare two round teams for standings order (best first).
///
/// The seed tie-break makes the order a strict total order as long as seeds
/// are distinct; with equal seeds (or none) the row id decides, so the
/// result is deterministic for any input.
pub fn standings_cmp(a: &TournamentRoundTeam, b: &TournamentRoundTeam) -> Ordering {
    b.points
        .cmp(&a.points)
        .then(b.sets_difference().cmp(&a.sets_difference()))
        .then(b.score_difference().cmp(&a.score_difference()))
        .then(a.seed_number.unwrap_or(i64::MAX).cmp(&b.seed_number.unwrap_or(i64::MAX)))
        .then(a.meta.id.cmp(&b.meta.id))
}

/// Rank all round teams. Pure: does not persist anything.
pub fn compute_standings(mut teams: Vec<TournamentRoundTeam>) -> Vec<RankedTeam> {
    teams.sort_by(standings_cmp);
    teams
        .into_iter()
        .enumerate()
        .map(|(i, team)| RankedTeam {
            team,
            rank: i as i64 + 1,
        })
        .collect()
}

/// Placement-based ranking points written at finalization:
/// first place earns `team_count`, last place earns 1.
pub fn ranking_points(rank: i64, team_count: usize) -> i64 {
    team_count as i64 - rank + 1
}
