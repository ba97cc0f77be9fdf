use std::collections::BTreeMap;

use anyhow::{Result, bail};
use log::warn;
use pulldown_cmark::{Event, Options, Parser, html};
use regex::{Captures, Regex};

use crate::attachments::{AttachmentIndex, mime_type_for, reference_clean_name};
use crate::sanitize::{confluence_title, percent_decode, title_anchor};
use crate::storage::{
    ImageAttrs, attachment_image, attachment_link, code_macro, error_panel, external_image,
    file_preview, toc_macro,
};

const TOC_TOKEN: &str = "[[_TOC_]]";

#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    /// Confluence storage-format markup.
    pub body: String,
    /// Link targets that had no remote id and fell back to same-document anchors.
    pub broken_links: Vec<String>,
    /// Referenced attachments absent from the index (emitted best-effort by name).
    pub missing_attachments: Vec<String>,
}

/// Markdown → Confluence storage format. Pure with respect to its inputs; one
/// instance compiles the dialect patterns once and is reused across every page.
pub struct Transformer {
    base_url: String,
    fenced_code: Regex,
    table_row_padding: Regex,
    wiki_link: Regex,
    markdown_link: Regex,
    azure_wiki_url: Regex,
    wiki_embed: Regex,
    markdown_image: Regex,
    img_tag: Regex,
    img_src: Regex,
    img_alt: Regex,
    img_width: Regex,
    img_height: Regex,
    size_hint: Regex,
    excess_blank_lines: Regex,
    list_reopen: Regex,
}

impl Transformer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            fenced_code: Regex::new(r"(?ms)^```([^\n`]*)\r?\n(.*?)^```[ \t]*$")
                .expect("valid regex"),
            table_row_padding: Regex::new(r"[ \t]*\|[ \t]*").expect("valid regex"),
            // The leading `!?` capture lets link passes step over image syntax,
            // which the image passes own.
            wiki_link: Regex::new(r"(!?)\[\[([^\[\]|]+?)(?:\|([^\[\]]+?))?\]\]")
                .expect("valid regex"),
            markdown_link: Regex::new(r"(!?)\[([^\]]*)\]\(([^()\s]+)\)").expect("valid regex"),
            azure_wiki_url: Regex::new(r"https?://[^\s()<>\[\]]+/_wiki/[^\s()<>\[\]]+")
                .expect("valid regex"),
            wiki_embed: Regex::new(r"!\[\[([^\[\]|]+?)(?:\|([^\[\]]*?))?\]\]")
                .expect("valid regex"),
            markdown_image: Regex::new(r"!\[([^\]]*)\]\(([^()]+?)\)").expect("valid regex"),
            img_tag: Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"),
            img_src: Regex::new(r#"(?i)src\s*=\s*["']([^"']*)["']"#).expect("valid regex"),
            img_alt: Regex::new(r#"(?i)alt\s*=\s*["']([^"']*)["']"#).expect("valid regex"),
            img_width: Regex::new(r#"(?i)width\s*=\s*["']([0-9]+)["']"#).expect("valid regex"),
            img_height: Regex::new(r#"(?i)height\s*=\s*["']([0-9]+)["']"#).expect("valid regex"),
            // Both `path =750x` and `path=750x` occur in exports.
            size_hint: Regex::new(r"^(.*?)(?:%20|\s)*(?:%3D|=)([0-9]+)x$").expect("valid regex"),
            excess_blank_lines: Regex::new(r"\n{3,}").expect("valid regex"),
            // No backreferences in the regex crate, so each list kind gets its
            // own alternative.
            list_reopen: Regex::new(r"</ul>\s*<ul>\n?|</ol>\s*<ol>\n?").expect("valid regex"),
        }
    }

    /// Run the full pipeline. A failure inside the pipeline degrades to a visible
    /// in-page error panel; it never aborts the caller's traversal.
    pub fn transform(
        &self,
        markdown: &str,
        index: &AttachmentIndex,
        page_ids: &BTreeMap<String, String>,
    ) -> TransformOutcome {
        match self.transform_inner(markdown, index, page_ids) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!("content transform failed: {error:#}");
                TransformOutcome {
                    body: error_panel(&format!("{error:#}"), markdown),
                    ..TransformOutcome::default()
                }
            }
        }
    }

    fn transform_inner(
        &self,
        markdown: &str,
        index: &AttachmentIndex,
        page_ids: &BTreeMap<String, String>,
    ) -> Result<TransformOutcome> {
        let mut fragments = FragmentTable::default();
        let mut outcome = TransformOutcome::default();

        // Code blocks first: their contents must survive every later rewrite.
        let text = self.lift_code_blocks(markdown, &mut fragments);
        let text = self.replace_toc(&text, &mut fragments);
        let text = self.normalize_tables(&text);
        let text = self.resolve_wiki_links(&text, page_ids, &mut fragments, &mut outcome);
        let text =
            self.resolve_markdown_links(&text, index, page_ids, &mut fragments, &mut outcome);
        let text = self.resolve_azure_urls(&text, page_ids, &mut fragments, &mut outcome);
        let text = self.resolve_wiki_embeds(&text, index, &mut fragments, &mut outcome);
        let text = self.resolve_markdown_images(&text, index, &mut fragments, &mut outcome);
        let text = self.resolve_img_tags(&text, index, &mut fragments, &mut outcome);

        let rendered = render_markdown(&text);
        let restored = fragments.restore(&rendered)?;
        outcome.body = self.cleanup(&restored);
        Ok(outcome)
    }

    /// Clean names of indexed attachments the page references; the publisher
    /// uploads these before the content pass transforms the page.
    pub fn referenced_attachments(&self, markdown: &str, index: &AttachmentIndex) -> Vec<String> {
        if index.is_empty() {
            return Vec::new();
        }
        let mut fragments = FragmentTable::default();
        let text = self.lift_code_blocks(markdown, &mut fragments);

        let mut names = Vec::new();
        let mut push = |reference: &str| {
            let clean = reference_clean_name(reference);
            if index.get(&clean).is_some() && !names.contains(&clean) {
                names.push(clean);
            }
        };

        for caps in self.wiki_embed.captures_iter(&text) {
            push(self.split_size_hint(caps[1].trim()).0.as_str());
        }
        for caps in self.markdown_image.captures_iter(&text) {
            push(self.split_size_hint(caps[2].trim()).0.as_str());
        }
        for caps in self.img_tag.captures_iter(&text) {
            if let Some(src) = self.img_src.captures(&caps[0]) {
                push(src[1].trim());
            }
        }
        for caps in self.markdown_link.captures_iter(&text) {
            if caps[1].is_empty() && caps[3].contains(".attachments") {
                push(caps[3].trim());
            }
        }
        names
    }

    fn lift_code_blocks(&self, text: &str, fragments: &mut FragmentTable) -> String {
        self.fenced_code
            .replace_all(text, |caps: &Captures| {
                fragments.lift(code_macro(caps[1].trim(), &caps[2]))
            })
            .into_owned()
    }

    fn replace_toc(&self, text: &str, fragments: &mut FragmentTable) -> String {
        if !text.contains(TOC_TOKEN) {
            return text.to_string();
        }
        text.replace(TOC_TOKEN, &fragments.lift(toc_macro().to_string()))
    }

    /// Collapse ` | ` padding inside table rows; some renderers trip on it.
    fn normalize_tables(&self, text: &str) -> String {
        text.lines()
            .map(|line| {
                let trimmed = line.trim_start();
                if trimmed.starts_with('|') && trimmed.matches('|').count() >= 2 {
                    self.table_row_padding.replace_all(trimmed, "|").into_owned()
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn resolve_wiki_links(
        &self,
        text: &str,
        page_ids: &BTreeMap<String, String>,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        self.wiki_link
            .replace_all(text, |caps: &Captures| {
                if &caps[1] == "!" {
                    // Wiki embed; the image pass owns it.
                    return caps[0].to_string();
                }
                let target = caps[2].trim();
                let display = caps
                    .get(3)
                    .map(|text| text.as_str().trim().to_string())
                    .unwrap_or_else(|| percent_decode(target));
                self.page_link(target, &display, page_ids, fragments, outcome)
            })
            .into_owned()
    }

    fn resolve_markdown_links(
        &self,
        text: &str,
        index: &AttachmentIndex,
        page_ids: &BTreeMap<String, String>,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        self.markdown_link
            .replace_all(text, |caps: &Captures| {
                if &caps[1] == "!" {
                    return caps[0].to_string();
                }
                let display = caps[2].trim().to_string();
                let target = caps[3].trim();
                if target.contains(".attachments") {
                    let clean = reference_clean_name(target);
                    if index.get(&clean).is_none() {
                        warn!("attachment link target not in index: {target}");
                        outcome.missing_attachments.push(clean.clone());
                    }
                    return fragments.lift(attachment_link(&clean, Some(display.as_str())));
                }
                if target.starts_with("http://") || target.starts_with("https://") {
                    if target.contains("/_wiki/") {
                        return self.page_link(
                            azure_url_title(target),
                            &display,
                            page_ids,
                            fragments,
                            outcome,
                        );
                    }
                    // Ordinary external link; the renderer handles it.
                    return caps[0].to_string();
                }
                if target.starts_with('/') {
                    return self.page_link(target, &display, page_ids, fragments, outcome);
                }
                // Relative or same-document link; leave it to the renderer.
                caps[0].to_string()
            })
            .into_owned()
    }

    fn resolve_azure_urls(
        &self,
        text: &str,
        page_ids: &BTreeMap<String, String>,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        self.azure_wiki_url
            .replace_all(text, |caps: &Captures| {
                let url = caps[0].trim_end_matches(['.', ',']);
                let target = azure_url_title(url);
                let display = percent_decode(target);
                self.page_link(target, &display, page_ids, fragments, outcome)
            })
            .into_owned()
    }

    /// The one place cross-page references turn into markup. Resolution goes
    /// through `confluence_title`, the same mapping the validator checks titles
    /// with. An unknown title is a soft failure: forward references to pages a
    /// failed Phase 1 never created are expected.
    fn page_link(
        &self,
        target: &str,
        display: &str,
        page_ids: &BTreeMap<String, String>,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        let segment = target
            .trim_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(target);
        let title = confluence_title(segment);
        match page_ids.get(&title) {
            Some(id) => fragments.lift(format!(
                r#"<a href="{base}/pages/{id}">{display}</a>"#,
                base = self.base_url,
                display = crate::storage::escape_html(display),
            )),
            None => {
                warn!("no remote id for linked page '{title}'; emitting anchor fallback");
                outcome.broken_links.push(title.clone());
                format!("[{display}](#{})", title_anchor(&title))
            }
        }
    }

    fn resolve_wiki_embeds(
        &self,
        text: &str,
        index: &AttachmentIndex,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        self.wiki_embed
            .replace_all(text, |caps: &Captures| {
                let (path, width) = self.split_size_hint(caps[1].trim());
                let alt = caps.get(2).map(|params| params.as_str().trim().to_string());
                let attrs = ImageAttrs {
                    alt: alt.filter(|value| !value.is_empty()),
                    width,
                    height: None,
                };
                fragments.lift(self.image_markup(&path, &attrs, index, outcome))
            })
            .into_owned()
    }

    fn resolve_markdown_images(
        &self,
        text: &str,
        index: &AttachmentIndex,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        self.markdown_image
            .replace_all(text, |caps: &Captures| {
                let alt = caps[1].trim().to_string();
                let (path, width) = self.split_size_hint(caps[2].trim());
                let attrs = ImageAttrs {
                    alt: Some(alt).filter(|value| !value.is_empty()),
                    width,
                    height: None,
                };
                fragments.lift(self.image_markup(&path, &attrs, index, outcome))
            })
            .into_owned()
    }

    fn resolve_img_tags(
        &self,
        text: &str,
        index: &AttachmentIndex,
        fragments: &mut FragmentTable,
        outcome: &mut TransformOutcome,
    ) -> String {
        self.img_tag
            .replace_all(text, |caps: &Captures| {
                let tag = &caps[0];
                let Some(src) = self.img_src.captures(tag) else {
                    return tag.to_string();
                };
                let attrs = ImageAttrs {
                    alt: self.img_alt.captures(tag).map(|a| a[1].to_string()),
                    width: self.img_width.captures(tag).map(|w| w[1].to_string()),
                    height: self.img_height.captures(tag).map(|h| h[1].to_string()),
                };
                fragments.lift(self.image_markup(src[1].trim(), &attrs, index, outcome))
            })
            .into_owned()
    }

    /// All three image dialects funnel through here.
    fn image_markup(
        &self,
        path: &str,
        attrs: &ImageAttrs,
        index: &AttachmentIndex,
        outcome: &mut TransformOutcome,
    ) -> String {
        if path.starts_with("http://") || path.starts_with("https://") || path.starts_with("data:")
        {
            return external_image(path, attrs);
        }
        let clean = reference_clean_name(path);
        match index.get(&clean) {
            Some(record) if record.is_previewable_document() => file_preview(&clean),
            Some(record) if record.is_image() => attachment_image(&clean, attrs),
            Some(_) => attachment_link(&clean, None),
            None => {
                // Best effort by name: the target may resolve the reference once
                // the attachment is uploaded. Never drop it silently.
                warn!("attachment '{clean}' not found in index; emitting by-name reference");
                outcome.missing_attachments.push(clean.clone());
                if mime_type_for(&clean).starts_with("image/") {
                    attachment_image(&clean, attrs)
                } else {
                    attachment_link(&clean, None)
                }
            }
        }
    }

    /// Split a trailing `=750x` / `%3D750x` width hint off an image path.
    fn split_size_hint(&self, path: &str) -> (String, Option<String>) {
        match self.size_hint.captures(path) {
            Some(caps) => (caps[1].trim().to_string(), Some(caps[2].to_string())),
            None => (path.to_string(), None),
        }
    }

    fn cleanup(&self, html: &str) -> String {
        let merged = self.list_reopen.replace_all(html, "").into_owned();
        self.excess_blank_lines
            .replace_all(&merged, "\n\n")
            .trim()
            .to_string()
    }
}

/// Side table of storage-format fragments lifted out of the Markdown so the
/// renderer cannot mangle namespaced macro markup. Tokens are plain alphanumeric
/// text that passes through CommonMark untouched.
#[derive(Debug, Default)]
struct FragmentTable {
    entries: Vec<String>,
}

impl FragmentTable {
    fn lift(&mut self, markup: String) -> String {
        let token = Self::token(self.entries.len());
        self.entries.push(markup);
        token
    }

    fn token(index: usize) -> String {
        format!("WMFRAGMENT{index}X")
    }

    fn restore(&self, html: &str) -> Result<String> {
        let mut output = html.to_string();
        // Highest index first so FRAGMENT1 never matches inside FRAGMENT10.
        for (index, markup) in self.entries.iter().enumerate().rev() {
            let token = Self::token(index);
            let wrapped = format!("<p>{token}</p>");
            if output.contains(&wrapped) {
                output = output.replace(&wrapped, markup);
            }
            output = output.replace(&token, markup);
        }
        if output.contains("WMFRAGMENT") {
            bail!("unrestored content fragment placeholder after rendering");
        }
        Ok(output)
    }
}

fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    // The source wiki treats every newline as a line break.
    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });
    let mut output = String::new();
    html::push_html(&mut output, parser);
    output
}

fn azure_url_title(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use tempfile::tempdir;

    use super::Transformer;
    use crate::attachments::AttachmentIndex;
    use crate::sanitize::confluence_title;

    const BASE: &str = "https://example.atlassian.net/wiki";

    fn transformer() -> Transformer {
        Transformer::new(BASE)
    }

    fn empty_index() -> AttachmentIndex {
        AttachmentIndex::default()
    }

    fn index_with(files: &[&str]) -> AttachmentIndex {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join(".attachments");
        fs::create_dir_all(&dir).expect("create dir");
        for name in files {
            fs::write(dir.join(name), b"data").expect("write attachment");
        }
        // Index holds absolute paths; the tempdir may vanish afterwards, which is
        // fine for transform tests that never read the files.
        AttachmentIndex::build(&[dir]).expect("build index")
    }

    fn ids(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(title, id)| (confluence_title(title), id.to_string()))
            .collect()
    }

    #[test]
    fn renders_plain_markdown_to_html() {
        let outcome = transformer().transform("# Title\n\nBody text.", &empty_index(), &ids(&[]));
        assert!(outcome.body.contains("<h1>Title</h1>"));
        assert!(outcome.body.contains("<p>Body text.</p>"));
        assert!(outcome.broken_links.is_empty());
    }

    #[test]
    fn code_blocks_survive_link_and_table_rewriting() {
        let markdown = "```rust\nlet row = \"a | b\";\nlet link = [[NotALink]];\n```\n";
        let outcome = transformer().transform(markdown, &empty_index(), &ids(&[]));
        assert!(outcome.body.contains(r#"<ac:parameter ac:name="language">rust</ac:parameter>"#));
        assert!(outcome.body.contains("let row = &quot;a | b&quot;;"));
        assert!(outcome.body.contains("let link = [[NotALink]];"));
        assert!(outcome.broken_links.is_empty());
    }

    #[test]
    fn toc_token_becomes_toc_macro() {
        let outcome = transformer().transform("[[_TOC_]]\n\n# One\n", &empty_index(), &ids(&[]));
        assert!(outcome.body.contains(r#"<ac:structured-macro ac:name="toc"/>"#));
    }

    #[test]
    fn table_padding_is_collapsed_and_rendered() {
        let markdown = "| Col A | Col B |\n| --- | --- |\n| 1 | 2 |\n";
        let outcome = transformer().transform(markdown, &empty_index(), &ids(&[]));
        assert!(outcome.body.contains("<table>"));
        assert!(outcome.body.contains("<td>1</td>"));
    }

    #[test]
    fn wiki_link_with_known_id_becomes_direct_link() {
        let outcome = transformer().transform(
            "See [[Setup Guide]] for details.",
            &empty_index(),
            &ids(&[("Setup Guide", "101")]),
        );
        assert!(outcome.body.contains(&format!(r#"<a href="{BASE}/pages/101">Setup Guide</a>"#)));
        assert!(outcome.broken_links.is_empty());
    }

    #[test]
    fn wiki_link_display_text_is_kept() {
        let outcome = transformer().transform(
            "[[Setup Guide|the guide]]",
            &empty_index(),
            &ids(&[("Setup Guide", "101")]),
        );
        assert!(outcome.body.contains(">the guide</a>"));
    }

    #[test]
    fn unknown_wiki_link_falls_back_to_anchor() {
        let outcome = transformer().transform("[[Setup Guide]]", &empty_index(), &ids(&[]));
        assert!(outcome.body.contains(r##"<a href="#Setup-Guide">Setup Guide</a>"##));
        assert_eq!(outcome.broken_links, vec!["Setup Guide".to_string()]);
    }

    #[test]
    fn absolute_markdown_link_resolves_by_final_segment() {
        let outcome = transformer().transform(
            "[runbooks](/Ops/Runbooks)",
            &empty_index(),
            &ids(&[("Runbooks", "77")]),
        );
        assert!(outcome.body.contains(&format!(r#"<a href="{BASE}/pages/77">runbooks</a>"#)));
    }

    #[test]
    fn external_markdown_link_passes_through() {
        let outcome = transformer().transform(
            "[site](https://example.com/page)",
            &empty_index(),
            &ids(&[]),
        );
        assert!(outcome.body.contains(r#"<a href="https://example.com/page">site</a>"#));
        assert!(outcome.broken_links.is_empty());
    }

    #[test]
    fn azure_wiki_url_resolves_to_page_link() {
        let markdown =
            "https://dev.azure.com/org/proj/_wiki/wikis/proj.wiki/12/Setup%20Guide";
        let outcome = transformer().transform(
            markdown,
            &empty_index(),
            &ids(&[("Setup%20Guide", "55")]),
        );
        assert!(outcome.body.contains(&format!(r#"<a href="{BASE}/pages/55">Setup Guide</a>"#)));
    }

    #[test]
    fn wiki_embed_with_size_hint_becomes_image_macro() {
        let index = index_with(&["logo.png=300x"]);
        let outcome = transformer().transform("![[logo.png=300x]]", &index, &ids(&[]));
        assert!(outcome.body.contains(
            r#"<ac:image ac:width="300"><ri:attachment ri:filename="logo.png"/></ac:image>"#
        ));
        assert!(outcome.missing_attachments.is_empty());
    }

    #[test]
    fn markdown_image_with_spaced_size_hint_keeps_width() {
        let index = index_with(&["diagram.png"]);
        let outcome = transformer().transform(
            "![architecture](/.attachments/diagram.png =750x)",
            &index,
            &ids(&[]),
        );
        assert!(outcome.body.contains(r#"ac:alt="architecture" ac:width="750""#));
        assert!(outcome.body.contains(r#"ri:filename="diagram.png""#));
    }

    #[test]
    fn pdf_attachment_becomes_file_preview() {
        let index = index_with(&["spec.pdf"]);
        let outcome = transformer().transform("![spec](/.attachments/spec.pdf)", &index, &ids(&[]));
        assert!(outcome.body.contains(r#"<ac:structured-macro ac:name="view-file">"#));
    }

    #[test]
    fn html_img_tag_preserves_attributes() {
        let index = index_with(&["pic.png"]);
        let outcome = transformer().transform(
            r#"<img src="/.attachments/pic.png" alt="a pic" width="640" height="480">"#,
            &index,
            &ids(&[]),
        );
        assert!(outcome.body.contains(r#"ac:alt="a pic""#));
        assert!(outcome.body.contains(r#"ac:width="640""#));
        assert!(outcome.body.contains(r#"ac:height="480""#));
    }

    #[test]
    fn external_image_url_passes_through_as_external_reference() {
        let outcome = transformer().transform(
            "![badge](https://img.example.com/badge.svg)",
            &empty_index(),
            &ids(&[]),
        );
        assert!(outcome.body.contains(r#"<ri:url ri:value="https://img.example.com/badge.svg"/>"#));
        assert!(outcome.missing_attachments.is_empty());
    }

    #[test]
    fn missing_attachment_still_emits_by_name_reference() {
        let outcome = transformer().transform("![[ghost.png]]", &empty_index(), &ids(&[]));
        assert!(outcome.body.contains(r#"ri:filename="ghost.png""#));
        assert_eq!(outcome.missing_attachments, vec!["ghost.png".to_string()]);
    }

    #[test]
    fn attachment_markdown_link_becomes_attachment_link() {
        let index = index_with(&["manual.zip"]);
        let outcome = transformer().transform(
            "[download](/.attachments/manual.zip)",
            &index,
            &ids(&[]),
        );
        // The display text survives as the link body.
        assert!(outcome.body.contains(
            "<ac:link><ri:attachment ri:filename=\"manual.zip\"/>\
             <ac:plain-text-link-body>download</ac:plain-text-link-body></ac:link>"
        ));
    }

    #[test]
    fn guid_suffixed_reference_resolves_to_indexed_file() {
        let index = index_with(&["photo-3fa85f64-5717-4562-b3fc-2c963f66afa6.jpg"]);
        let outcome = transformer().transform(
            "![p](/.attachments/photo-3fa85f64-5717-4562-b3fc-2c963f66afa6.jpg)",
            &index,
            &ids(&[]),
        );
        assert!(outcome.body.contains(r#"ri:filename="photo.jpg""#));
        assert!(outcome.missing_attachments.is_empty());
    }

    #[test]
    fn adjacent_lists_are_merged() {
        // A bullet-marker change makes the renderer close and reopen the list.
        let markdown = "- one\n* two\n";
        let outcome = transformer().transform(markdown, &empty_index(), &ids(&[]));
        assert_eq!(outcome.body.matches("<ul>").count(), 1);
        assert_eq!(outcome.body.matches("</ul>").count(), 1);
    }

    #[test]
    fn lists_of_different_kinds_keep_their_seam() {
        // An adjacent ordered/bullet pair must stay two lists.
        let markdown = "1. one\n\n- two\n";
        let outcome = transformer().transform(markdown, &empty_index(), &ids(&[]));
        assert!(outcome.body.contains("</ol>"));
        assert!(outcome.body.contains("<ul>"));
    }

    #[test]
    fn soft_breaks_render_as_hard_breaks() {
        let outcome = transformer().transform("line one\nline two", &empty_index(), &ids(&[]));
        assert!(outcome.body.contains("<br />"));
    }

    #[test]
    fn referenced_attachments_lists_indexed_files_once() {
        let index = index_with(&["logo.png", "spec.pdf"]);
        let markdown = "![[logo.png=300x]]\n![x](/.attachments/logo.png)\n\
                        [doc](/.attachments/spec.pdf)\n![[ghost.png]]\n";
        let names = transformer().referenced_attachments(markdown, &index);
        assert_eq!(names, vec!["logo.png".to_string(), "spec.pdf".to_string()]);
    }

    #[test]
    fn referenced_attachments_ignores_code_blocks() {
        let index = index_with(&["logo.png"]);
        let markdown = "```\n![[logo.png]]\n```\n";
        let names = transformer().referenced_attachments(markdown, &index);
        assert!(names.is_empty());
    }

    #[test]
    fn link_resolution_and_validation_share_the_title_mapping() {
        // The id map is keyed by the validator's title mapping; a transform hit
        // proves link resolution goes through the identical function.
        let map = ids(&[("Tips & Tricks", "9")]);
        assert!(map.contains_key(&confluence_title("Tips & Tricks")));
        let outcome = transformer().transform("[[Tips & Tricks]]", &empty_index(), &map);
        assert!(outcome.body.contains("/pages/9"));
    }
}
