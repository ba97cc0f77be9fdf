use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::warn;

use crate::sanitize::{confluence_title, decode_title, order_key, percent_decode};

pub const ATTACHMENTS_DIR_NAME: &str = ".attachments";
pub const ORDER_FILE_NAME: &str = ".order";

/// Rank assigned to pages the `.order` file doesn't mention; larger than any
/// explicit rank so unordered pages sort after ordered ones.
pub const UNORDERED_RANK: usize = usize::MAX / 2;

/// Directories that are never wiki content even though they may sit inside a
/// repo-hosted export. Dot-directories are excluded by the dotfile rule.
const EXCLUDED_DIR_NAMES: &[&str] = &["node_modules", "target", "bin", "obj"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A Markdown file with no same-named sibling directory.
    Leaf,
    /// A directory with no same-named sibling Markdown file; contributes
    /// hierarchy but has no content of its own.
    Directory,
    /// A directory `Foo/` merged with a sibling `Foo.md`: the directory's
    /// children, the file's content.
    Merged,
}

#[derive(Debug, Clone)]
pub struct Page {
    /// Decoded, human-readable title. NameFixer may rewrite this in place.
    pub title: String,
    /// Raw filesystem-derived title, kept to regenerate stable paths.
    pub original_title: String,
    /// Backing Markdown file for Leaf/Merged, the directory itself for Directory.
    pub source_path: PathBuf,
    pub kind: PageKind,
    pub order: usize,
    pub children: Vec<Page>,
}

impl Page {
    /// Read this page's Markdown content. Directory pages have none; unreadable
    /// files degrade to empty content with a warning (the page still publishes).
    pub fn content(&self) -> String {
        if self.kind == PageKind::Directory {
            return String::new();
        }
        match fs::read_to_string(&self.source_path) {
            Ok(content) => content,
            Err(error) => {
                warn!(
                    "failed to read {} for page '{}': {error}; publishing with empty content",
                    self.source_path.display(),
                    self.title
                );
                String::new()
            }
        }
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Page::count).sum::<usize>()
    }
}

#[derive(Debug, Clone)]
pub struct PageTree {
    pub root_dir: PathBuf,
    /// Root-level pages in publish order.
    pub pages: Vec<Page>,
    /// Every `.attachments` directory discovered during the walk; excluded from
    /// the publishable tree but retained for attachment discovery.
    pub attachment_dirs: Vec<PathBuf>,
}

impl PageTree {
    pub fn page_count(&self) -> usize {
        self.pages.iter().map(Page::count).sum()
    }

    /// Locate a page anywhere in the tree by decoded title (used by `--single`).
    pub fn find_page(&self, title: &str) -> Option<&Page> {
        fn find<'a>(pages: &'a [Page], title: &str) -> Option<&'a Page> {
            for page in pages {
                if page.title == title {
                    return Some(page);
                }
                if let Some(found) = find(&page.children, title) {
                    return Some(found);
                }
            }
            None
        }
        find(&self.pages, title)
    }

    /// Rewrite titles according to a fix map keyed by resolved Confluence
    /// title. Offline approximation for the local preview: every matching page
    /// is renamed, with no remote to decide which occurrence keeps its name.
    pub fn apply_fixes(&mut self, fixes: &BTreeMap<String, String>) {
        fn apply(pages: &mut [Page], fixes: &BTreeMap<String, String>) {
            for page in pages {
                if let Some(fixed) = fixes.get(&confluence_title(&page.title)) {
                    page.title = fixed.clone();
                }
                apply(&mut page.children, fixes);
            }
        }
        apply(&mut self.pages, fixes);
    }
}

/// Parse a wiki export directory into a page tree. A missing root directory is a
/// configuration error; individual unreadable entries are logged and skipped.
pub fn parse_tree(root_dir: &Path) -> Result<PageTree> {
    if !root_dir.is_dir() {
        bail!(
            "wiki root directory does not exist: {}\n\
             Check --wiki-dir / WIKI_ROOT_DIR / [wiki].root_dir.",
            root_dir.display()
        );
    }
    let mut attachment_dirs = Vec::new();
    let pages = parse_directory(root_dir, &mut attachment_dirs)?;
    Ok(PageTree {
        root_dir: root_dir.to_path_buf(),
        pages,
        attachment_dirs,
    })
}

fn parse_directory(dir: &Path, attachment_dirs: &mut Vec<PathBuf>) -> Result<Vec<Page>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list wiki directory {}", dir.display()))?;

    let mut subdirs: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut markdown_files: BTreeMap<String, PathBuf> = BTreeMap::new();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!("skipping unreadable entry under {}: {error}", dir.display());
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        let is_dir = entry.file_type().is_ok_and(|file_type| file_type.is_dir());

        if name == ATTACHMENTS_DIR_NAME && is_dir {
            attachment_dirs.push(path);
            continue;
        }
        if name.starts_with('.') {
            continue;
        }
        if is_dir {
            if EXCLUDED_DIR_NAMES.contains(&name.as_str()) {
                continue;
            }
            subdirs.insert(name, path);
        } else if let Some(stem) = name.strip_suffix(".md") {
            markdown_files.insert(stem.to_string(), path);
        }
    }

    let ranks = read_order_ranks(dir);
    let mut pages = Vec::new();

    for (name, dir_path) in subdirs {
        let children = parse_directory(&dir_path, attachment_dirs)?;
        let (kind, source_path) = match markdown_files.remove(&name) {
            Some(file_path) => (PageKind::Merged, file_path),
            None => (PageKind::Directory, dir_path),
        };
        pages.push(Page {
            title: decode_title(&name),
            original_title: name.clone(),
            source_path,
            kind,
            order: rank_for(&ranks, &name),
            children,
        });
    }

    for (stem, file_path) in markdown_files {
        pages.push(Page {
            title: decode_title(&stem),
            original_title: stem.clone(),
            source_path: file_path,
            kind: PageKind::Leaf,
            order: rank_for(&ranks, &stem),
            children: Vec::new(),
        });
    }

    pages.sort_by(|left, right| {
        left.order
            .cmp(&right.order)
            .then_with(|| left.title.to_lowercase().cmp(&right.title.to_lowercase()))
    });
    Ok(pages)
}

/// Ranks from the directory's `.order` file, keyed by normalized title. The file
/// is a partial order: entries it lists come first, in file order.
fn read_order_ranks(dir: &Path) -> BTreeMap<String, usize> {
    let order_path = dir.join(ORDER_FILE_NAME);
    let mut ranks = BTreeMap::new();
    if !order_path.is_file() {
        return ranks;
    }
    let content = match fs::read_to_string(&order_path) {
        Ok(content) => content,
        Err(error) => {
            warn!("failed to read {}: {error}; ignoring ordering", order_path.display());
            return ranks;
        }
    };
    for (rank, line) in content.lines().enumerate() {
        let entry = percent_decode(line.trim());
        if entry.is_empty() {
            continue;
        }
        ranks.entry(order_key(&entry)).or_insert(rank);
    }
    ranks
}

fn rank_for(ranks: &BTreeMap<String, usize>, name: &str) -> usize {
    ranks
        .get(&order_key(&decode_title(name)))
        .copied()
        .unwrap_or(UNORDERED_RANK)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{Page, PageKind, parse_tree};

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, content).expect("write file");
    }

    fn titles(pages: &[Page]) -> Vec<&str> {
        pages.iter().map(|page| page.title.as_str()).collect()
    }

    #[test]
    fn missing_root_is_fatal() {
        let error = parse_tree(Path::new("/nonexistent/wiki-export")).expect_err("must fail");
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn order_file_ranks_listed_pages_first_then_alphabetical() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Alpha.md"), "a");
        write_file(&root.join("Beta.md"), "b");
        write_file(&root.join("Gamma.md"), "c");
        write_file(&root.join("Delta.md"), "d");
        // Partial order: only two of four pages listed.
        write_file(&root.join(".order"), "Gamma\nBeta\n");

        let tree = parse_tree(root).expect("parse");
        assert_eq!(titles(&tree.pages), vec!["Gamma", "Beta", "Alpha", "Delta"]);
    }

    #[test]
    fn order_entries_match_across_encodings() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Setup%20Guide.md"), "s");
        write_file(&root.join("Appendix.md"), "a");
        // The order file spells the title with a space, the filename percent-encodes it.
        write_file(&root.join(".order"), "Setup Guide\n");

        let tree = parse_tree(root).expect("parse");
        assert_eq!(titles(&tree.pages), vec!["Setup Guide", "Appendix"]);
    }

    #[test]
    fn directory_and_file_merge_into_one_page() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Foo.md"), "foo body");
        write_file(&root.join("Foo").join("Bar.md"), "bar body");

        let tree = parse_tree(root).expect("parse");
        assert_eq!(tree.pages.len(), 1);
        let foo = &tree.pages[0];
        assert_eq!(foo.title, "Foo");
        assert_eq!(foo.kind, PageKind::Merged);
        assert_eq!(foo.content(), "foo body");
        assert_eq!(titles(&foo.children), vec!["Bar"]);
        assert_eq!(foo.children[0].kind, PageKind::Leaf);
    }

    #[test]
    fn directory_without_file_has_empty_content() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Ops").join("Runbook.md"), "r");

        let tree = parse_tree(root).expect("parse");
        let ops = &tree.pages[0];
        assert_eq!(ops.kind, PageKind::Directory);
        assert_eq!(ops.content(), "");
    }

    #[test]
    fn attachments_dirs_are_captured_not_published() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Home.md"), "h");
        write_file(&root.join(".attachments").join("logo.png"), "png");
        write_file(
            &root.join("Guide").join(".attachments").join("pic.png"),
            "png",
        );
        write_file(&root.join("Guide").join("Install.md"), "i");

        let tree = parse_tree(root).expect("parse");
        assert_eq!(titles(&tree.pages), vec!["Guide", "Home"]);
        assert_eq!(tree.attachment_dirs.len(), 2);
    }

    #[test]
    fn dotfiles_and_build_dirs_are_excluded() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Home.md"), "h");
        write_file(&root.join(".git").join("config"), "");
        write_file(&root.join(".hidden.md"), "");
        write_file(&root.join("node_modules").join("Pkg.md"), "");
        write_file(&root.join("target").join("Out.md"), "");

        let tree = parse_tree(root).expect("parse");
        assert_eq!(titles(&tree.pages), vec!["Home"]);
    }

    #[test]
    fn titles_are_decoded_original_titles_kept_raw() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Release%20Notes.md"), "n");

        let tree = parse_tree(root).expect("parse");
        assert_eq!(tree.pages[0].title, "Release Notes");
        assert_eq!(tree.pages[0].original_title, "Release%20Notes");
    }

    #[test]
    fn find_page_searches_nested_children() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Guide").join("Install.md"), "i");

        let tree = parse_tree(root).expect("parse");
        assert!(tree.find_page("Install").is_some());
        assert!(tree.find_page("Missing").is_none());
        assert_eq!(tree.page_count(), 2);
    }

    #[test]
    fn apply_fixes_rewrites_titles_in_place() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Setup.md"), "s");

        let mut tree = parse_tree(root).expect("parse");
        let fixes = std::collections::BTreeMap::from([(
            "Setup".to_string(),
            "Atlas - Setup".to_string(),
        )]);
        tree.apply_fixes(&fixes);
        assert_eq!(tree.pages[0].title, "Atlas - Setup");
        assert_eq!(tree.pages[0].original_title, "Setup");
    }
}
