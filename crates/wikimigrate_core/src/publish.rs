use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{info, warn};
use serde::Serialize;

use crate::attachments::AttachmentIndex;
use crate::confluence::{ConfluenceApi, is_rate_limited};
use crate::sanitize::confluence_title;
use crate::storage::placeholder_body;
use crate::transform::Transformer;
use crate::tree::{Page, PageTree};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub space_key: String,
    /// Parent for root-level pages; the space homepage when absent.
    pub root_parent_id: Option<String>,
    /// Publish only the named page's subtree.
    pub single: Option<String>,
    pub dry_run: bool,
    /// Backoff applied when a full pass roots in a rate-limit error.
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            space_key: String::new(),
            root_parent_id: None,
            single: None,
            dry_run: false,
            max_retries: 3,
            retry_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PagePublishResult {
    pub title: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
    pub success: bool,
    pub dry_run: bool,
    pub placeholders_created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub attachments_uploaded: usize,
    pub attachments_skipped: usize,
    pub broken_links: Vec<String>,
    pub errors: Vec<String>,
    pub pages: Vec<PagePublishResult>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub deleted: usize,
    pub errors: Vec<String>,
    pub request_count: usize,
}

/// Run the two-phase publication protocol over the tree. Phase 1 creates
/// placeholders in pre-order so every page's remote id is known before Phase 2
/// resolves any content. Each full pass retries with doubling backoff when its
/// error roots in a rate limit; a single page's failure never aborts a pass.
pub fn publish_tree<A: ConfluenceApi>(
    tree: &PageTree,
    index: &AttachmentIndex,
    transformer: &Transformer,
    fixes: &BTreeMap<String, String>,
    options: &PublishOptions,
    api: &mut A,
) -> Result<PublishReport> {
    let mut report = PublishReport {
        dry_run: options.dry_run,
        ..PublishReport::default()
    };

    // Pre-flight: resolving the space both validates credentials and supplies
    // the fallback root parent. Failure here is fatal before any mutation.
    let space = api.get_space_by_key(&options.space_key)?;
    let root_parent = options
        .root_parent_id
        .clone()
        .or_else(|| space.homepage_id.clone());

    let pages: Vec<&Page> = match &options.single {
        Some(title) => {
            let Some(page) = tree.find_page(title) else {
                bail!("page '{title}' was not found in the wiki tree");
            };
            vec![page]
        }
        None => tree.pages.iter().collect(),
    };

    let mut page_ids: BTreeMap<String, String> = BTreeMap::new();
    let mut resolved_titles: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut published: BTreeSet<PathBuf> = BTreeSet::new();

    info!("phase 1: creating placeholders for {} root pages", pages.len());
    run_with_backoff(options, "placeholder pass", || {
        let mut pass = PassState {
            api: &mut *api,
            index,
            transformer,
            fixes,
            options,
            report: &mut report,
            page_ids: &mut page_ids,
            resolved_titles: &mut resolved_titles,
            published: &mut published,
        };
        for page in pages.iter().copied() {
            pass.placeholder_pass(page, root_parent.as_deref())?;
        }
        Ok(())
    })?;

    info!("phase 2: resolving content for {} pages", page_ids.len());
    run_with_backoff(options, "content pass", || {
        let mut pass = PassState {
            api: &mut *api,
            index,
            transformer,
            fixes,
            options,
            report: &mut report,
            page_ids: &mut page_ids,
            resolved_titles: &mut resolved_titles,
            published: &mut published,
        };
        for page in pages.iter().copied() {
            pass.content_pass(page)?;
        }
        Ok(())
    })?;

    report.request_count = api.request_count();
    report.success = report.errors.is_empty();
    Ok(report)
}

struct PassState<'a, A: ConfluenceApi> {
    api: &'a mut A,
    index: &'a AttachmentIndex,
    transformer: &'a Transformer,
    fixes: &'a BTreeMap<String, String>,
    options: &'a PublishOptions,
    report: &'a mut PublishReport,
    page_ids: &'a mut BTreeMap<String, String>,
    resolved_titles: &'a mut BTreeMap<PathBuf, String>,
    published: &'a mut BTreeSet<PathBuf>,
}

impl<A: ConfluenceApi> PassState<'_, A> {
    /// Phase 1 for one subtree. The parent's id is always assigned before any
    /// child create is attempted; a failed page skips its whole subtree.
    fn placeholder_pass(&mut self, page: &Page, parent_id: Option<&str>) -> Result<()> {
        // Re-entry after a rate-limit backoff finds the title already resolved.
        if !self.resolved_titles.contains_key(&page.source_path) {
            match self.resolve_page(page, parent_id) {
                Ok((title, id)) => {
                    self.page_ids.insert(title.clone(), id);
                    self.resolved_titles.insert(page.source_path.clone(), title);
                }
                Err(error) => {
                    if is_rate_limited(&error) {
                        return Err(error);
                    }
                    let title = confluence_title(&page.title);
                    warn!("skipping subtree of '{title}': {error:#}");
                    self.record_error(&title, "placeholder failed", &error);
                    return Ok(());
                }
            }
        }
        let own_id = self
            .resolved_titles
            .get(&page.source_path)
            .and_then(|title| self.page_ids.get(title))
            .cloned();
        for child in &page.children {
            self.placeholder_pass(child, own_id.as_deref())?;
        }
        Ok(())
    }

    fn resolve_page(&mut self, page: &Page, parent_id: Option<&str>) -> Result<(String, String)> {
        let title = self.effective_title(page)?;
        let id = self.resolve_or_create(&title, parent_id)?;
        Ok((title, id))
    }

    /// Same rule as validation: the fixed title takes over only when the raw
    /// one is already taken, by an earlier page in this run or by an existing
    /// remote page.
    fn effective_title(&mut self, page: &Page) -> Result<String> {
        let raw = confluence_title(&page.title);
        let Some(fixed) = self.fixes.get(&raw) else {
            return Ok(raw);
        };
        let taken = self.page_ids.contains_key(&raw)
            || self
                .api
                .get_page_by_title(&self.options.space_key, &raw)?
                .is_some();
        if taken {
            Ok(confluence_title(fixed))
        } else {
            Ok(raw)
        }
    }

    fn resolve_or_create(&mut self, title: &str, parent_id: Option<&str>) -> Result<String> {
        if let Some(existing) = self.api.get_page_by_title(&self.options.space_key, title)? {
            return Ok(existing.id);
        }
        if self.options.dry_run {
            self.report.placeholders_created += 1;
            return Ok(format!("dry-run-{}", self.report.placeholders_created));
        }
        let id = self
            .api
            .create_page(title, &self.options.space_key, parent_id, placeholder_body())?;
        self.report.placeholders_created += 1;
        Ok(id)
    }

    /// Phase 2 for one subtree: upload attachments, transform, update.
    fn content_pass(&mut self, page: &Page) -> Result<()> {
        // Phase 1 never resolved this page; the subtree was already reported.
        let Some(title) = self.resolved_titles.get(&page.source_path).cloned() else {
            self.report.skipped += page.count();
            return Ok(());
        };
        let Some(id) = self.page_ids.get(&title).cloned() else {
            self.report.skipped += page.count();
            return Ok(());
        };

        // Re-entry after a rate-limit backoff finds the page already updated;
        // only its children still need the pass.
        if !self.published.contains(&page.source_path) {
            let content = page.content();
            self.upload_attachments(&title, &id, &content)?;

            let outcome = self
                .transformer
                .transform(&content, self.index, self.page_ids);
            for target in &outcome.broken_links {
                self.report
                    .broken_links
                    .push(format!("{title} -> {target}"));
            }

            if let Err(error) = self.update_with_fresh_version(&id, &title, &outcome.body) {
                if is_rate_limited(&error) {
                    return Err(error);
                }
                warn!("skipping subtree of '{title}': {error:#}");
                self.record_error(&title, "update failed", &error);
                self.report.skipped += page.count() - 1;
                return Ok(());
            }
            self.report.updated += 1;
            self.report.pages.push(PagePublishResult {
                title: title.clone(),
                action: "updated".to_string(),
                detail: None,
            });
            self.published.insert(page.source_path.clone());
        }

        for child in &page.children {
            self.content_pass(child)?;
        }
        Ok(())
    }

    /// Upload every indexed attachment the page references. Idempotent: a file
    /// already attached to the page is skipped, not re-uploaded. Individual
    /// upload failures degrade to the transformer's by-name fallback.
    fn upload_attachments(&mut self, title: &str, page_id: &str, content: &str) -> Result<()> {
        let references = self.transformer.referenced_attachments(content, self.index);
        if references.is_empty() || self.options.dry_run {
            self.report.attachments_skipped += references.len();
            return Ok(());
        }
        let existing: BTreeSet<String> = match self.api.get_attachments(page_id) {
            Ok(attachments) => attachments
                .into_iter()
                .map(|attachment| attachment.file_name)
                .collect(),
            Err(error) => {
                if is_rate_limited(&error) {
                    return Err(error);
                }
                warn!("failed to list attachments of '{title}': {error:#}");
                BTreeSet::new()
            }
        };
        for name in references {
            if existing.contains(&name) {
                self.report.attachments_skipped += 1;
                continue;
            }
            let Some(record) = self.index.get(&name) else {
                continue;
            };
            match self.api.upload_attachment(
                page_id,
                &record.path,
                &record.clean_file_name,
                record.mime_type,
            ) {
                Ok(_) => self.report.attachments_uploaded += 1,
                Err(error) => {
                    if is_rate_limited(&error) {
                        return Err(error);
                    }
                    warn!("failed to upload '{name}' to '{title}': {error:#}");
                    self.report
                        .errors
                        .push(format!("{title}: attachment {name}: {error:#}"));
                }
            }
        }
        Ok(())
    }

    /// The optimistic-concurrency version is fetched just before the update.
    fn update_with_fresh_version(&mut self, id: &str, title: &str, body: &str) -> Result<()> {
        if self.options.dry_run {
            return Ok(());
        }
        let version = self.api.get_page_version(id)?;
        self.api.update_page(id, title, version + 1, body)
    }

    fn record_error(&mut self, title: &str, action: &str, error: &anyhow::Error) {
        self.report.errors.push(format!("{title}: {error:#}"));
        self.report.pages.push(PagePublishResult {
            title: title.to_string(),
            action: "error".to_string(),
            detail: Some(action.to_string()),
        });
    }
}

/// Bounded doubling backoff around a full pass. Only rate-limit errors retry;
/// anything else propagates immediately.
fn run_with_backoff(
    options: &PublishOptions,
    pass_name: &str,
    mut pass: impl FnMut() -> Result<()>,
) -> Result<()> {
    for attempt in 0..=options.max_retries {
        match pass() {
            Ok(()) => return Ok(()),
            Err(error) if is_rate_limited(&error) && attempt < options.max_retries => {
                let exponent = u32::try_from(attempt).unwrap_or(16);
                let delay = options
                    .retry_delay_ms
                    .saturating_mul(2u64.saturating_pow(exponent));
                warn!("{pass_name} rate limited; retrying in {delay}ms");
                sleep(Duration::from_millis(delay));
            }
            Err(error) => return Err(error),
        }
    }
    unreachable!("backoff loop always returns")
}

/// Delete a remote page, depth-first over its children when `recursive`.
pub fn delete_remote_page<A: ConfluenceApi>(
    id: &str,
    recursive: bool,
    api: &mut A,
) -> Result<DeleteReport> {
    let mut report = DeleteReport {
        deleted: 0,
        errors: Vec::new(),
        request_count: 0,
    };
    delete_inner(id, recursive, api, &mut report)?;
    report.request_count = api.request_count();
    Ok(report)
}

fn delete_inner<A: ConfluenceApi>(
    id: &str,
    recursive: bool,
    api: &mut A,
    report: &mut DeleteReport,
) -> Result<()> {
    if recursive {
        for child in api.get_child_pages(id)? {
            delete_inner(&child.id, true, api, report)?;
        }
    }
    match api.delete_page(id) {
        Ok(()) => report.deleted += 1,
        Err(error) => {
            warn!("failed to delete page {id}: {error:#}");
            report.errors.push(format!("{id}: {error:#}"));
        }
    }
    Ok(())
}
