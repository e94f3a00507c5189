//! History index: folds ledger entries into human-meaningful [`Change`]s.
//!
//! # Grouping
//!
//! 1. `error` entries and revert records are not changes. Revert records
//!    contribute the ids they undo (`meta.revertOf`) to a reverted set.
//! 2. Every other entry is classified as a file upload (raw artifact
//!    `add`/`update`/`delete`) or a knowledge-base generation
//!    (`update`/`regen` touching KB pages).
//! 3. Entries sharing a `requestId` and a classification fold into one
//!    change; entries without a `requestId` stand alone.
//! 4. Changes sort most recent first. Equal timestamps keep append order,
//!    later-appended first.
//!
//! Everything here is pure: the caller supplies the entries and "now".

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::models::{
    meta, Change, ChangeDetails, ChangeOperation, ChangeScope, ChangeType, Operation,
    TimelineEntry,
};

/// Filters for [`list_changes`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub change_type: ChangeScope,
    pub include_reverted: bool,
}

/// Classify a single entry, or `None` if it is not part of any change.
pub fn classify(entry: &TimelineEntry) -> Option<ChangeType> {
    if entry.operation == Operation::Error || entry.is_revert_record() {
        return None;
    }
    match entry.operation {
        Operation::Regen => Some(ChangeType::KnowledgeBaseGeneration),
        Operation::Update if !entry.affected_kb_paths.is_empty() => {
            Some(ChangeType::KnowledgeBaseGeneration)
        }
        Operation::Add | Operation::Update | Operation::Delete if entry.source_path.is_some() => {
            Some(ChangeType::FileUpload)
        }
        _ => None,
    }
}

/// Ids of every entry undone by a recorded revert.
pub fn reverted_entry_ids(entries: &[TimelineEntry]) -> HashSet<String> {
    entries
        .iter()
        .flat_map(|e| e.revert_targets())
        .map(str::to_string)
        .collect()
}

/// All changes in the ledger, most recent first, reverted ones flagged.
pub fn build_changes(entries: &[TimelineEntry], now: DateTime<Utc>) -> Vec<Change> {
    let reverted = reverted_entry_ids(entries);

    let mut groups: Vec<(ChangeType, Vec<(usize, &TimelineEntry)>)> = Vec::new();
    let mut index: HashMap<(String, ChangeType), usize> = HashMap::new();

    for (position, entry) in entries.iter().enumerate() {
        let Some(change_type) = classify(entry) else {
            continue;
        };
        let key = (
            entry.request_id.clone().unwrap_or_else(|| entry.id.clone()),
            change_type,
        );
        match index.get(&key) {
            Some(&g) => groups[g].1.push((position, entry)),
            None => {
                index.insert(key, groups.len());
                groups.push((change_type, vec![(position, entry)]));
            }
        }
    }

    let mut changes: Vec<Change> = groups
        .into_iter()
        .map(|(change_type, members)| to_change(change_type, &members, &reverted, now))
        .collect();

    changes.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(b.position.cmp(&a.position))
    });
    changes
}

/// Filtered, truncated view used by `listHistory`.
pub fn list_changes(
    entries: &[TimelineEntry],
    query: &HistoryQuery,
    now: DateTime<Utc>,
) -> Vec<Change> {
    let mut changes: Vec<Change> = build_changes(entries, now)
        .into_iter()
        .filter(|c| query.include_reverted || !c.reverted)
        .filter(|c| query.change_type.includes(c.change_type))
        .collect();
    if let Some(limit) = query.limit {
        changes.truncate(limit);
    }
    changes
}

fn to_change(
    change_type: ChangeType,
    members: &[(usize, &TimelineEntry)],
    reverted: &HashSet<String>,
    now: DateTime<Utc>,
) -> Change {
    let first = members[0].1;
    let (position, last) = members[members.len() - 1];

    let source_path = members.iter().find_map(|(_, e)| e.source_path.clone());

    let mut files_affected: Vec<String> = Vec::new();
    let mut commits: Vec<String> = Vec::new();
    for (_, e) in members {
        let files: Vec<&String> = match change_type {
            ChangeType::FileUpload => e.source_path.iter().collect(),
            ChangeType::KnowledgeBaseGeneration => e.affected_kb_paths.iter().collect(),
        };
        for f in files {
            if !files_affected.contains(f) {
                files_affected.push(f.clone());
            }
        }
        if !e.commit.is_empty() && !commits.contains(&e.commit) {
            commits.push(e.commit.clone());
        }
    }

    let operation = change_operation(change_type, members, &files_affected);
    let description = describe(
        change_type,
        operation,
        last.operation == Operation::Regen,
        source_path.as_deref(),
        files_affected.len(),
    );

    let timestamp = members
        .iter()
        .map(|(_, e)| e.timestamp)
        .max()
        .unwrap_or(last.timestamp);

    Change {
        id: first.id.clone(),
        change_type,
        operation,
        description,
        timestamp,
        relative_time: relative_time(timestamp, now),
        source_path,
        files_affected,
        entry_ids: members.iter().map(|(_, e)| e.id.clone()).collect(),
        commits,
        request_id: first.request_id.clone(),
        reverted: members.iter().all(|(_, e)| reverted.contains(&e.id)),
        details: ChangeDetails {
            user: first.actor,
            bulk: members.iter().any(|(_, e)| e.bulk),
            latest_commit: last.commit.clone(),
            entry_count: members.len(),
        },
        position,
    }
}

fn change_operation(
    change_type: ChangeType,
    members: &[(usize, &TimelineEntry)],
    files_affected: &[String],
) -> ChangeOperation {
    let first = members[0].1;
    let last = members[members.len() - 1].1;
    match change_type {
        ChangeType::FileUpload => match (first.operation, last.operation) {
            (_, Operation::Delete) => ChangeOperation::Removed,
            (Operation::Add, _) => ChangeOperation::Added,
            _ => ChangeOperation::Updated,
        },
        ChangeType::KnowledgeBaseGeneration => {
            let created: HashSet<&str> = members
                .iter()
                .filter_map(|(_, e)| e.meta.get(meta::CREATED_PAGES))
                .filter_map(|v| v.as_array())
                .flatten()
                .filter_map(|v| v.as_str())
                .collect();
            if !files_affected.is_empty()
                && files_affected.iter().all(|f| created.contains(f.as_str()))
            {
                ChangeOperation::Added
            } else {
                ChangeOperation::Updated
            }
        }
    }
}

fn describe(
    change_type: ChangeType,
    operation: ChangeOperation,
    regenerated: bool,
    source: Option<&str>,
    count: usize,
) -> String {
    match change_type {
        ChangeType::FileUpload => {
            let verb = match operation {
                ChangeOperation::Added => "Uploaded",
                ChangeOperation::Updated => "Updated",
                ChangeOperation::Removed => "Removed",
            };
            format!("{} file '{}'", verb, source.unwrap_or("unknown"))
        }
        ChangeType::KnowledgeBaseGeneration => {
            let verb = if regenerated {
                "Regenerated"
            } else if operation == ChangeOperation::Added {
                "Generated"
            } else {
                "Updated"
            };
            let pages = if count == 1 { "page" } else { "pages" };
            match source {
                Some(s) => format!("{} {} knowledge base {} from '{}'", verb, count, pages, s),
                None => format!("{} {} knowledge base {}", verb, count, pages),
            }
        }
    }
}

/// Relative-time label, e.g. `"5 minutes ago"`.
///
/// Labels are English only. Past 30 days the label is an ISO `YYYY-MM-DD`
/// date, which reads the same in every locale.
pub fn relative_time(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - timestamp).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {} ago", unit)
        } else {
            format!("{} {}s ago", n, unit)
        }
    };
    let minutes = secs / 60;
    if minutes < 60 {
        return plural(minutes, "minute");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return plural(hours, "hour");
    }
    let days = hours / 24;
    if days < 30 {
        return plural(days, "day");
    }
    timestamp.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Actor;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn raw(id: &str, req: &str, path: &str, secs: i64) -> TimelineEntry {
        let mut e = TimelineEntry::new(Actor::User, Operation::Add)
            .with_source(path)
            .with_commit(format!("c-{}", id))
            .with_request(req)
            .with_timestamp(t0() + Duration::seconds(secs));
        e.id = id.to_string();
        e
    }

    fn generated(id: &str, req: &str, path: &str, pages: &[&str], secs: i64) -> TimelineEntry {
        let pages: Vec<String> = pages.iter().map(|p| p.to_string()).collect();
        let mut e = TimelineEntry::new(Actor::System, Operation::Update)
            .with_source(path)
            .with_commit(format!("c-{}", id))
            .with_kb_paths(pages.clone())
            .with_request(req)
            .with_meta(meta::CREATED_PAGES, serde_json::json!(pages))
            .with_timestamp(t0() + Duration::seconds(secs));
        e.id = id.to_string();
        e
    }

    #[test]
    fn test_ingest_yields_two_changes() {
        let entries = vec![
            raw("e1", "r1", "raw/note.md", 0),
            generated("e2", "r1", "raw/note.md", &["wiki/note.md"], 1),
        ];
        let changes = build_changes(&entries, t0() + Duration::seconds(5));
        assert_eq!(changes.len(), 2);

        assert_eq!(changes[0].change_type, ChangeType::KnowledgeBaseGeneration);
        assert_eq!(changes[0].operation, ChangeOperation::Added);
        assert_eq!(changes[0].files_affected, vec!["wiki/note.md"]);
        assert_eq!(
            changes[0].description,
            "Generated 1 knowledge base page from 'raw/note.md'"
        );

        assert_eq!(changes[1].change_type, ChangeType::FileUpload);
        assert_eq!(changes[1].description, "Uploaded file 'raw/note.md'");
        assert_eq!(changes[1].details.user, Actor::User);
        assert_eq!(changes[1].relative_time, "just now");
    }

    #[test]
    fn test_equal_timestamps_keep_append_order() {
        let entries = vec![raw("e1", "r1", "raw/a.md", 0), raw("e2", "r2", "raw/b.md", 0)];
        let changes = build_changes(&entries, t0());
        assert_eq!(changes[0].id, "e2");
        assert_eq!(changes[1].id, "e1");
    }

    #[test]
    fn test_same_request_entries_fold() {
        let entries = vec![
            generated("e1", "r1", "raw/a.md", &["wiki/a.md"], 0),
            generated("e2", "r1", "raw/a.md", &["wiki/a-2.md"], 1),
        ];
        let changes = build_changes(&entries, t0());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].id, "e1");
        assert_eq!(changes[0].entry_ids, vec!["e1", "e2"]);
        assert_eq!(changes[0].commits, vec!["c-e1", "c-e2"]);
        assert_eq!(
            changes[0].description,
            "Generated 2 knowledge base pages from 'raw/a.md'"
        );
    }

    #[test]
    fn test_revert_records_hide_changes() {
        let revert = TimelineEntry::new(Actor::User, Operation::Delete)
            .with_commit("c-rev")
            .with_meta(meta::REVERT_OF, serde_json::json!(["e1"]));
        let entries = vec![raw("e1", "r1", "raw/a.md", 0), revert];

        let active = list_changes(&entries, &HistoryQuery::default(), t0());
        assert!(active.is_empty());

        let all = list_changes(
            &entries,
            &HistoryQuery {
                include_reverted: true,
                ..Default::default()
            },
            t0(),
        );
        assert_eq!(all.len(), 1);
        assert!(all[0].reverted);
    }

    #[test]
    fn test_filter_and_limit() {
        let entries = vec![
            raw("e1", "r1", "raw/a.md", 0),
            generated("e2", "r1", "raw/a.md", &["wiki/a.md"], 1),
            raw("e3", "r2", "raw/b.md", 2),
            generated("e4", "r2", "raw/b.md", &["wiki/b.md"], 3),
        ];
        let uploads = list_changes(
            &entries,
            &HistoryQuery {
                change_type: ChangeScope::FileUpload,
                ..Default::default()
            },
            t0(),
        );
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|c| c.change_type == ChangeType::FileUpload));

        let latest = list_changes(
            &entries,
            &HistoryQuery {
                limit: Some(1),
                ..Default::default()
            },
            t0(),
        );
        assert_eq!(latest.len(), 1);
        assert!(latest[0].description.contains("raw/b.md"));
    }

    #[test]
    fn test_error_entries_are_not_changes() {
        let err = TimelineEntry::new(Actor::System, Operation::Error)
            .with_source("raw/a.md")
            .with_meta(meta::ERROR, "summarizer timed out");
        assert!(classify(&err).is_none());
        assert!(build_changes(&[err], t0()).is_empty());
    }

    #[test]
    fn test_regen_and_update_descriptions() {
        let mut regen = generated("e1", "r1", "raw/a.md", &["wiki/a.md"], 0);
        regen.operation = Operation::Regen;
        regen.meta.remove(meta::CREATED_PAGES);
        let changes = build_changes(&[regen], t0());
        assert_eq!(changes[0].operation, ChangeOperation::Updated);
        assert_eq!(
            changes[0].description,
            "Regenerated 1 knowledge base page from 'raw/a.md'"
        );

        let mut updated = raw("e2", "r2", "raw/a.md", 0);
        updated.operation = Operation::Update;
        assert_eq!(
            build_changes(&[updated], t0())[0].description,
            "Updated file 'raw/a.md'"
        );
    }

    #[test]
    fn test_relative_time_labels() {
        let now = t0();
        assert_eq!(relative_time(now, now), "just now");
        assert_eq!(relative_time(now - Duration::minutes(1), now), "1 minute ago");
        assert_eq!(relative_time(now - Duration::minutes(5), now), "5 minutes ago");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(relative_time(now - Duration::days(2), now), "2 days ago");
        assert_eq!(relative_time(now - Duration::days(45), now), "2025-01-15");
        assert_eq!(relative_time(now + Duration::minutes(2), now), "just now");
    }
}
