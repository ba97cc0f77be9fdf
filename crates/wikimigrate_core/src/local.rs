use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use crate::attachments::AttachmentIndex;
use crate::sanitize::order_key;
use crate::storage::escape_html;
use crate::transform::Transformer;
use crate::tree::{Page, PageTree};

#[derive(Debug, Clone, Serialize)]
pub struct LocalReport {
    pub pages_rendered: usize,
    pub output_dir: PathBuf,
    pub broken_links: Vec<String>,
    pub missing_attachments: Vec<String>,
}

/// Render every page through the transformer with an empty title->id map, so
/// cross-page links degrade to same-document anchors. One HTML file per page
/// plus an index; no assets.
pub fn render_tree(
    tree: &PageTree,
    index: &AttachmentIndex,
    transformer: &Transformer,
    output_dir: &Path,
) -> Result<LocalReport> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let empty_ids = BTreeMap::new();
    let mut report = LocalReport {
        pages_rendered: 0,
        output_dir: output_dir.to_path_buf(),
        broken_links: Vec::new(),
        missing_attachments: Vec::new(),
    };
    let mut taken = BTreeSet::new();
    let mut toc = String::from("<ul>\n");

    fn render(
        pages: &[Page],
        index: &AttachmentIndex,
        transformer: &Transformer,
        empty_ids: &BTreeMap<String, String>,
        output_dir: &Path,
        taken: &mut BTreeSet<String>,
        toc: &mut String,
        report: &mut LocalReport,
    ) -> Result<()> {
        for page in pages {
            let file_name = unique_file_name(&page.title, taken);
            let outcome = transformer.transform(&page.content(), index, empty_ids);
            for target in outcome.broken_links {
                report.broken_links.push(format!("{} -> {target}", page.title));
            }
            report.missing_attachments.extend(outcome.missing_attachments);

            let html = page_shell(&page.title, &outcome.body);
            let path = output_dir.join(&file_name);
            fs::write(&path, html)
                .with_context(|| format!("failed to write {}", path.display()))?;
            report.pages_rendered += 1;

            toc.push_str(&format!(
                "<li><a href=\"{file_name}\">{}</a>",
                escape_html(&page.title)
            ));
            if !page.children.is_empty() {
                toc.push_str("\n<ul>\n");
                render(
                    &page.children,
                    index,
                    transformer,
                    empty_ids,
                    output_dir,
                    taken,
                    toc,
                    report,
                )?;
                toc.push_str("</ul>\n");
            }
            toc.push_str("</li>\n");
        }
        Ok(())
    }

    render(
        &tree.pages,
        index,
        transformer,
        &empty_ids,
        output_dir,
        &mut taken,
        &mut toc,
        &mut report,
    )?;
    toc.push_str("</ul>\n");

    let index_path = output_dir.join("index.html");
    fs::write(&index_path, page_shell("Wiki preview", &toc))
        .with_context(|| format!("failed to write {}", index_path.display()))?;

    info!(
        "rendered {} pages into {}",
        report.pages_rendered,
        output_dir.display()
    );
    Ok(report)
}

fn unique_file_name(title: &str, taken: &mut BTreeSet<String>) -> String {
    let stem = order_key(title).to_ascii_lowercase();
    let mut candidate = format!("{stem}.html");
    let mut counter = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{stem}-{counter}.html");
        counter += 1;
    }
    candidate
}

fn page_shell(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title),
        body
    )
}
