//! Revert planning: the pure Resolve and Plan stages of an undo request.
//!
//! Nothing here touches a repository. Given the ledger entries and the
//! changes derived from them, [`plan`] computes exactly which entries and
//! commits an undo would invert, so callers can inspect (or test) the plan
//! before executing it.

use globset::Glob;
use std::collections::{HashMap, HashSet};

use crate::error::{KbError, Result};
use crate::models::{
    Change, ChangeScope, ChangeType, RevertKind, RevertPlan, RevertStep, TimelineEntry,
};
use crate::path;

/// Exactly one way of choosing what to undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertTarget {
    ChangeId(String),
    Filename(String),
    LastN(usize),
}

impl RevertTarget {
    /// Build a target from optional selectors. Blank strings count as absent.
    pub fn from_selectors(
        filename: Option<&str>,
        change_id: Option<&str>,
        last_n: Option<usize>,
    ) -> Result<Self> {
        let filename = filename.map(str::trim).filter(|s| !s.is_empty());
        let change_id = change_id.map(str::trim).filter(|s| !s.is_empty());
        let supplied =
            filename.is_some() as usize + change_id.is_some() as usize + last_n.is_some() as usize;

        match (filename, change_id, last_n) {
            (Some(f), None, None) => Ok(RevertTarget::Filename(f.to_string())),
            (None, Some(id), None) => Ok(RevertTarget::ChangeId(id.to_string())),
            (None, None, Some(n)) => Ok(RevertTarget::LastN(n)),
            _ => Err(KbError::AmbiguousRevertTarget { supplied }),
        }
    }
}

/// Resolve stage. `changes` must be ordered most recent first, as
/// [`crate::history::build_changes`] returns them.
pub fn resolve<'a>(changes: &'a [Change], target: &RevertTarget) -> Result<Vec<&'a Change>> {
    match target {
        RevertTarget::ChangeId(id) => changes
            .iter()
            .find(|c| &c.id == id || c.entry_ids.iter().any(|e| e == id))
            .map(|c| vec![c])
            .ok_or_else(|| KbError::not_found("change", id.clone())),
        RevertTarget::Filename(pattern) => {
            let matcher = FileMatcher::new(pattern)?;
            let matched: Vec<&Change> = changes
                .iter()
                .filter(|c| {
                    c.source_path.iter().any(|p| matcher.matches(p))
                        || c.files_affected.iter().any(|p| matcher.matches(p))
                })
                .collect();
            if matched.is_empty() {
                return Err(KbError::not_found("change for file", pattern.clone()));
            }
            Ok(matched)
        }
        RevertTarget::LastN(n) => Ok(changes.iter().filter(|c| !c.reverted).take(*n).collect()),
    }
}

/// Resolve + Plan.
///
/// A selected `file_upload` change pulls in the generation changes of the
/// same request when `scope` covers generation; a generation change never
/// pulls in its source. Already-reverted and out-of-scope changes are
/// reported in [`RevertPlan::skipped`] rather than planned.
pub fn plan(
    entries: &[TimelineEntry],
    changes: &[Change],
    target: &RevertTarget,
    scope: ChangeScope,
) -> Result<RevertPlan> {
    let resolved = resolve(changes, target)?;

    let mut chosen: Vec<&Change> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut skipped: Vec<String> = Vec::new();

    for change in resolved {
        if change.change_type == ChangeType::FileUpload
            && scope.includes(ChangeType::KnowledgeBaseGeneration)
        {
            for sibling in generation_siblings(changes, change) {
                if seen.insert(sibling.id.as_str()) {
                    chosen.push(sibling);
                }
            }
        }

        if change.reverted || !scope.includes(change.change_type) {
            if !skipped.contains(&change.id) {
                skipped.push(change.id.clone());
            }
            continue;
        }
        if seen.insert(change.id.as_str()) {
            chosen.push(change);
        }
    }

    chosen.sort_by(|a, b| b.position.cmp(&a.position));

    let positions: HashMap<&str, (usize, &TimelineEntry)> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), (i, e)))
        .collect();

    let mut steps: Vec<(usize, RevertStep)> = Vec::new();
    for change in &chosen {
        let revert_kind = match (change.change_type, scope) {
            (ChangeType::KnowledgeBaseGeneration, _) => RevertKind::RemoveKbOnly,
            (ChangeType::FileUpload, ChangeScope::Both) => RevertKind::RemoveBoth,
            (ChangeType::FileUpload, _) => RevertKind::RemoveSource,
        };
        for entry_id in &change.entry_ids {
            let Some(&(position, entry)) = positions.get(entry_id.as_str()) else {
                return Err(KbError::not_found("timeline entry", entry_id.clone()));
            };
            if entry.commit.is_empty() {
                continue;
            }
            steps.push((
                position,
                RevertStep {
                    target_entry_id: entry.id.clone(),
                    change_id: change.id.clone(),
                    revert_kind,
                    commit: entry.commit.clone(),
                },
            ));
        }
    }
    steps.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(RevertPlan {
        scope,
        steps: steps.into_iter().map(|(_, s)| s).collect(),
        changes: chosen.into_iter().cloned().collect(),
        skipped,
    })
}

fn generation_siblings<'a>(changes: &'a [Change], upload: &Change) -> Vec<&'a Change> {
    let Some(request) = upload.request_id.as_deref() else {
        return Vec::new();
    };
    changes
        .iter()
        .filter(|c| {
            c.change_type == ChangeType::KnowledgeBaseGeneration
                && !c.reverted
                && c.request_id.as_deref() == Some(request)
        })
        .collect()
}

/// Matches a user-supplied filename against repository paths: exact path,
/// path suffix, bare file name, or a glob when the pattern has wildcards.
struct FileMatcher {
    pattern: String,
    glob: Option<globset::GlobMatcher>,
}

impl FileMatcher {
    fn new(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim().trim_start_matches("./").to_string();
        let glob = if pattern.contains(['*', '?', '[', '{']) {
            let compiled = Glob::new(&pattern).map_err(|e| KbError::InvalidPath {
                path: pattern.clone(),
                reason: e.to_string(),
            })?;
            Some(compiled.compile_matcher())
        } else {
            None
        };
        Ok(Self { pattern, glob })
    }

    fn matches(&self, candidate: &str) -> bool {
        if let Some(glob) = &self.glob {
            return glob.is_match(candidate) || glob.is_match(path::file_name(candidate));
        }
        candidate == self.pattern
            || candidate.ends_with(&format!("/{}", self.pattern))
            || path::file_name(candidate) == self.pattern
    }
}
