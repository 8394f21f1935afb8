use retrace_common::{EntityKey, Version};
use retrace_kernel::{ChangeKind, VersionRecord};
use std::collections::BTreeSet;

/// History inspector for developer tooling.
///
/// Read-only queries over an entity's audit log, for the CLI and debugging.
pub struct HistoryInspector;

impl HistoryInspector {
    /// Produce a summary of an entity's history. `records` must be ascending.
    pub fn summary(entity: &EntityKey, records: &[VersionRecord], current: Version) -> HistorySummary {
        HistorySummary {
            entity: entity.clone(),
            version_count: records.len(),
            snapshot_count: records.iter().filter(|r| r.is_snapshot).count(),
            latest: records.last().map_or(0, |r| r.version),
            current,
            destroyed: records
                .last()
                .is_some_and(|r| r.event == ChangeKind::Destroy),
            gaps: Self::find_gaps(records),
        }
    }

    /// Versions in `1..=latest` with no record.
    pub fn find_gaps(records: &[VersionRecord]) -> Vec<Version> {
        let present: BTreeSet<Version> = records.iter().map(|r| r.version).collect();
        let latest = present.last().copied().unwrap_or(0);
        (1..=latest).filter(|v| !present.contains(v)).collect()
    }

    /// One display line per record.
    pub fn describe(record: &VersionRecord) -> VersionLine {
        let changes = record
            .changed_attributes()
            .into_iter()
            .map(|name| {
                let old = record.old_values.get(name).map(compact);
                let new = record.new_values.get(name).map(compact);
                match (old, new) {
                    (Some(old), Some(new)) => format!("{name}: {old} -> {new}"),
                    (None, Some(new)) => format!("{name}: {new}"),
                    (Some(old), None) => format!("{name}: {old} -> (removed)"),
                    (None, None) => name.to_string(),
                }
            })
            .collect();

        VersionLine {
            version: record.version,
            event: record.event,
            is_snapshot: record.is_snapshot,
            author: record.author_id.as_ref().map(ToString::to_string),
            changes,
        }
    }
}

fn compact(value: &serde_json::Value) -> String {
    value.to_string()
}

/// Summary of an entity's history for the inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySummary {
    pub entity: EntityKey,
    pub version_count: usize,
    pub snapshot_count: usize,
    pub latest: Version,
    pub current: Version,
    pub destroyed: bool,
    pub gaps: Vec<Version>,
}

impl std::fmt::Display for HistorySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: versions={} snapshots={} current={} latest={}",
            self.entity, self.version_count, self.snapshot_count, self.current, self.latest
        )?;
        if self.destroyed {
            write!(f, " destroyed")?;
        }
        if !self.gaps.is_empty() {
            let gaps: Vec<String> = self.gaps.iter().map(ToString::to_string).collect();
            write!(f, " gaps=[{}]", gaps.join(","))?;
        }
        Ok(())
    }
}

/// A single audit log entry, formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLine {
    pub version: Version,
    pub event: ChangeKind,
    pub is_snapshot: bool,
    pub author: Option<String>,
    pub changes: Vec<String>,
}

impl std::fmt::Display for VersionLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{:<4} {:<7}", self.version, self.event.as_str())?;
        if self.is_snapshot {
            write!(f, " [snapshot]")?;
        }
        if let Some(author) = &self.author {
            write!(f, " by {author}")?;
        }
        if !self.changes.is_empty() {
            write!(f, " {}", self.changes.join("; "))?;
        }
        Ok(())
    }
}
