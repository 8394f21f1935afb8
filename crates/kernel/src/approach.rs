//! Approach selection: the cheapest way to move an entity between versions.
//!
//! Cost is the number of record applications. A direct walk from `C` to `T`
//! costs `|T - C|`; jumping through a snapshot at `S` costs `1 + |T - S|`.
//! A snapshot carries full state, so it can be used regardless of which side
//! of the current version it lies on.

use crate::apply::Direction;
use crate::record::VersionRecord;
use retrace_common::Version;

/// A plan for moving between two versions. Purely declarative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Approach<'a> {
    /// Current and target versions are equal.
    None,
    /// Walk the diffs between current and target.
    Direct,
    /// Apply the snapshot, then walk from its version to the target.
    FromSnapshot(&'a VersionRecord),
}

impl Approach<'_> {
    /// Number of record applications this plan performs.
    pub fn cost(&self, current: Version, target: Version) -> u64 {
        match self {
            Self::None => 0,
            Self::Direct => direct_cost(current, target),
            Self::FromSnapshot(snapshot) => snapshot_cost(snapshot.version, target),
        }
    }

    /// Version the diff walk starts from.
    pub fn walk_origin(&self, current: Version) -> Version {
        match self {
            Self::FromSnapshot(snapshot) => snapshot.version,
            Self::None | Self::Direct => current,
        }
    }
}

pub fn direct_cost(current: Version, target: Version) -> u64 {
    current.abs_diff(target)
}

pub fn snapshot_cost(snapshot: Version, target: Version) -> u64 {
    1 + snapshot.abs_diff(target)
}

/// Choose the cheapest approach from `current` to `target`.
///
/// Only records flagged as snapshots are candidates. Among equally cheap
/// snapshots, one inside `[min(C, T), max(C, T)]` wins, then the one closest
/// to the target, then the lowest version. A snapshot must be strictly
/// cheaper than the direct walk to be chosen.
pub fn choose(current: Version, target: Version, records: &[VersionRecord]) -> Approach<'_> {
    if current == target {
        return Approach::None;
    }

    let low = current.min(target);
    let high = current.max(target);
    let best_snapshot = records
        .iter()
        .filter(|record| record.is_snapshot)
        .min_by_key(|record| {
            let outside = !(low..=high).contains(&record.version);
            (
                snapshot_cost(record.version, target),
                outside,
                record.version.abs_diff(target),
                record.version,
            )
        });

    match best_snapshot {
        Some(snapshot) if snapshot_cost(snapshot.version, target) < direct_cost(current, target) => {
            Approach::FromSnapshot(snapshot)
        }
        _ => Approach::Direct,
    }
}

/// One record application within a diff walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub version: Version,
    pub direction: Direction,
}

/// The ordered record applications that move state from `from` to `to`.
///
/// Backwards: reverse versions `from, from - 1, ..., to + 1`.
/// Forwards: forward versions `from + 1, ..., to`.
pub fn walk(from: Version, to: Version) -> Vec<Step> {
    if from > to {
        ((to + 1)..=from)
            .rev()
            .map(|version| Step {
                version,
                direction: Direction::Reverse,
            })
            .collect()
    } else {
        ((from + 1)..=to)
            .map(|version| Step {
                version,
                direction: Direction::Forward,
            })
            .collect()
    }
}
