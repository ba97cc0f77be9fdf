use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::confluence::ConfluenceApi;
use crate::sanitize::confluence_title;
use crate::tree::{Page, PageTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateReason {
    /// Two source pages resolve to the same Confluence title.
    DuplicateInSource,
    /// The target space already holds a page with this title.
    ExistsInTarget,
}

impl DuplicateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateInSource => "duplicate-in-source",
            Self::ExistsInTarget => "exists-in-target",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub title: String,
    pub reason: DuplicateReason,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateReport {
    pub pages_checked: usize,
    pub conflicts: Vec<DuplicateRecord>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixReport {
    pub fixed: Vec<(String, String)>,
    pub already_fixed: usize,
}

/// Walk the tree and recompute the conflict set from scratch. A page's fixed
/// title (from the loaded fix map) takes over only when the raw title is taken,
/// either earlier in this walk or by an existing remote page; this is what lets
/// the first of two colliding pages keep its original name. The returned set
/// *replaces* any persisted queue, so stale records whose source page or target
/// conflict disappeared are pruned.
pub fn validate_tree<A: ConfluenceApi>(
    tree: &PageTree,
    fixes: &BTreeMap<String, String>,
    space_key: &str,
    api: &mut A,
) -> Result<ValidateReport> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut conflicts = Vec::new();
    let mut pages_checked = 0usize;

    fn check_title<A: ConfluenceApi>(
        title: &str,
        space_key: &str,
        api: &mut A,
        seen: &BTreeSet<String>,
    ) -> Result<Collision> {
        if seen.contains(title) {
            return Ok(Collision::InSource);
        }
        match api.get_page_by_title(space_key, title)? {
            Some(remote) => Ok(Collision::InTarget(remote.id)),
            None => Ok(Collision::None),
        }
    }

    fn walk<A: ConfluenceApi>(
        pages: &[Page],
        fixes: &BTreeMap<String, String>,
        space_key: &str,
        api: &mut A,
        seen: &mut BTreeSet<String>,
        conflicts: &mut Vec<DuplicateRecord>,
        pages_checked: &mut usize,
    ) -> Result<()> {
        for page in pages {
            *pages_checked += 1;
            let mut title = confluence_title(&page.title);
            let mut collision = check_title(&title, space_key, api, seen)?;
            if collision != Collision::None
                && let Some(fixed) = fixes.get(&title)
            {
                title = confluence_title(fixed);
                collision = check_title(&title, space_key, api, seen)?;
            }
            seen.insert(title.clone());

            let path = page.source_path.display().to_string();
            match collision {
                Collision::None => {}
                Collision::InSource => {
                    warn!("duplicate source title '{title}' at {path}");
                    conflicts.push(DuplicateRecord {
                        title,
                        reason: DuplicateReason::DuplicateInSource,
                        path,
                        remote_id: None,
                    });
                }
                Collision::InTarget(remote_id) => {
                    warn!("title '{title}' already exists in space {space_key} (id {remote_id})");
                    conflicts.push(DuplicateRecord {
                        title,
                        reason: DuplicateReason::ExistsInTarget,
                        path,
                        remote_id: Some(remote_id),
                    });
                }
            }
            walk(&page.children, fixes, space_key, api, seen, conflicts, pages_checked)?;
        }
        Ok(())
    }

    walk(
        &tree.pages,
        fixes,
        space_key,
        api,
        &mut seen,
        &mut conflicts,
        &mut pages_checked,
    )?;

    info!("validated {pages_checked} pages, {} conflicts", conflicts.len());
    Ok(ValidateReport {
        pages_checked,
        conflicts,
        request_count: api.request_count(),
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Collision {
    None,
    InSource,
    InTarget(String),
}

/// Derive non-colliding titles for every queued conflict by prefixing with
/// `{project_name} - `, merge them into the fix map, and clear the queue.
/// Idempotent: an already-prefixed title is recorded unchanged.
pub fn fix_names(
    queue: &[DuplicateRecord],
    fixes: &mut BTreeMap<String, String>,
    project_name: &str,
) -> FixReport {
    let prefix = format!("{project_name} - ");
    let mut fixed = Vec::new();
    let mut already_fixed = 0usize;

    for record in queue {
        if record.title.starts_with(&prefix) {
            already_fixed += 1;
            continue;
        }
        let new_title = format!("{prefix}{}", record.title);
        info!("renaming '{}' to '{new_title}'", record.title);
        fixes.insert(record.title.clone(), new_title.clone());
        fixed.push((record.title.clone(), new_title));
    }

    FixReport { fixed, already_fixed }
}

pub fn load_validation_state(path: &Path) -> Result<Vec<DuplicateRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save_validation_state(path: &Path, records: &[DuplicateRecord]) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(records).context("failed to serialize validation state")?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

pub fn load_fixes(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save_fixes(path: &Path, fixes: &BTreeMap<String, String>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(fixes).context("failed to serialize fix map")?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}
