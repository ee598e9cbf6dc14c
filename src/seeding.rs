// Seed assignment and group distribution for advancing teams.
//
// Seed numbering is the sole writer of seed numbers within one invocation,
// so duplicate seeds cannot come out of it.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordering applied to unseeded teams before slots are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMethod {
    ByCreationDate,
    ByName,
    ByRating,
    Random,
}

impl SortMethod {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "by_creation_date" => Some(Self::ByCreationDate),
            "by_name" => Some(Self::ByName),
            "by_rating" => Some(Self::ByRating),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    pub fn to_str_name(self) -> &'static str {
        match self {
            Self::ByCreationDate => "by_creation_date",
            Self::ByName => "by_name",
            Self::ByRating => "by_rating",
            Self::Random => "random",
        }
    }
}

/// Where newly seeded teams land relative to already-occupied slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPlacement {
    FillGaps,
    AtTheEnd,
}

/// Whether the final seed sequence is compacted to 1..K.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    LetGapsRemain,
    CloseAllGaps,
}

/// Group layout for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupConfig {
    NoGroup,
    TeamsPerGroup(usize),
    GroupsInRound(usize),
}

impl GroupConfig {
    /// Build from the round's stored grouping strategy and counts,
    /// validating that exactly the right count is present.
    pub fn from_round(
        grouping_strategy: &str,
        teams_per_group: Option<i64>,
        groups_in_round: Option<i64>,
    ) -> Result<Self> {
        if teams_per_group.is_some() && groups_in_round.is_some() {
            return Err(Error::InvalidGroupConfig(
                "teams_per_group and groups_in_round are mutually exclusive".into(),
            ));
        }
        match grouping_strategy {
            "no_group" => Ok(Self::NoGroup),
            "teams_per_group" => match teams_per_group {
                Some(n) if n > 0 => Ok(Self::TeamsPerGroup(n as usize)),
                _ => Err(Error::InvalidGroupConfig(
                    "teams_per_group strategy needs a positive teams_per_group count".into(),
                )),
            },
            "groups_in_round" => match groups_in_round {
                Some(g) if g > 0 => Ok(Self::GroupsInRound(g as usize)),
                _ => Err(Error::InvalidGroupConfig(
                    "groups_in_round strategy needs a positive group count".into(),
                )),
            },
            other => Err(Error::InvalidGroupConfig(format!(
                "unknown grouping strategy '{other}'"
            ))),
        }
    }
}

/// A team entering the seeding engine. `seed_number` is set for teams that
/// already hold a slot (reseed-partial), `None` for new arrivals.
#[derive(Debug, Clone)]
pub struct SeedCandidate {
    pub team_id: i64,
    pub name: String,
    pub created_at: String,
    /// Ranking points carried over from the previous round, 0 if none.
    pub rating: i64,
    pub seed_number: Option<i64>,
}

/// Seeding result: every input team with its final seed and group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededTeam {
    pub team_id: i64,
    pub seed_number: i64,
    pub group_name: Option<String>,
}

/// Assign seed numbers to all candidates.
///
/// Existing seeds are kept where they are; unseeded candidates are ordered
/// by `sort` (`Random` draws from the caller's `rng`, never a global one)
/// and placed per `placement`. `CloseAllGaps` renumbers the whole sequence
/// to 1..K afterwards. Output is sorted by seed.
pub fn assign_seeds<R: Rng>(
    candidates: Vec<SeedCandidate>,
    sort: SortMethod,
    placement: SeedPlacement,
    gaps: GapPolicy,
    rng: &mut R,
) -> Vec<SeededTeam> {
    let (seeded, mut unseeded): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.seed_number.is_some());

    match sort {
        SortMethod::ByCreationDate => {
            unseeded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.team_id.cmp(&b.team_id)))
        }
        SortMethod::ByName => {
            unseeded.sort_by(|a, b| a.name.cmp(&b.name).then(a.team_id.cmp(&b.team_id)))
        }
        SortMethod::ByRating => {
            unseeded.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.team_id.cmp(&b.team_id)))
        }
        SortMethod::Random => unseeded.shuffle(rng),
    }

    let mut assigned: Vec<(i64, i64)> = seeded
        .iter()
        .map(|c| (c.team_id, c.seed_number.unwrap_or(0)))
        .collect();
    let mut occupied: Vec<i64> = assigned.iter().map(|(_, s)| *s).collect();

    match placement {
        SeedPlacement::FillGaps => {
            let mut slot = 1;
            for c in &unseeded {
                while occupied.contains(&slot) {
                    slot += 1;
                }
                assigned.push((c.team_id, slot));
                occupied.push(slot);
            }
        }
        SeedPlacement::AtTheEnd => {
            let mut next = occupied.iter().copied().max().unwrap_or(0) + 1;
            for c in &unseeded {
                assigned.push((c.team_id, next));
                next += 1;
            }
        }
    }

    assigned.sort_by_key(|(_, seed)| *seed);

    if gaps == GapPolicy::CloseAllGaps {
        for (i, entry) in assigned.iter_mut().enumerate() {
            entry.1 = i as i64 + 1;
        }
    }

    assigned
        .into_iter()
        .map(|(team_id, seed_number)| SeededTeam {
            team_id,
            seed_number,
            group_name: None,
        })
        .collect()
}

/// Distribute seeded teams into groups serpentine-style: group assignment
/// cycles 1..G then G..1 in seed order, balancing strength across groups.
pub fn assign_groups(teams: &mut [SeededTeam], config: GroupConfig) {
    let group_count = match config {
        GroupConfig::NoGroup => {
            for t in teams.iter_mut() {
                t.group_name = None;
            }
            return;
        }
        GroupConfig::TeamsPerGroup(n) => teams.len().div_ceil(n),
        GroupConfig::GroupsInRound(g) => g,
    };
    let group_count = group_count.max(1);

    for (i, team) in teams.iter_mut().enumerate() {
        let cycle = i / group_count;
        let pos = i % group_count;
        let group_index = if cycle % 2 == 0 {
            pos
        } else {
            group_count - 1 - pos
        };
        team.group_name = Some(group_label(group_index));
    }
}

/// Group labels: A, B, ... Z, then G27, G28, ...
fn group_label(index: usize) -> String {
    if index < 26 {
        ((b'A' + index as u8) as char).to_string()
    } else {
        format!("G{}", index + 1)
    }
}
