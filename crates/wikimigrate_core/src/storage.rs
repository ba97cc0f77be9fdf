const ERROR_SOURCE_PREVIEW_CHARS: usize = 600;

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn toc_macro() -> &'static str {
    r#"<ac:structured-macro ac:name="toc"/>"#
}

pub fn placeholder_body() -> &'static str {
    "<p>Migration in progress.</p>"
}

/// Code macro with language and line numbers; the body is escaped text, which the
/// storage format treats as literal code.
pub fn code_macro(language: &str, code: &str) -> String {
    let language = if language.trim().is_empty() {
        "none"
    } else {
        language.trim()
    };
    format!(
        concat!(
            r#"<ac:structured-macro ac:name="code">"#,
            r#"<ac:parameter ac:name="language">{language}</ac:parameter>"#,
            r#"<ac:parameter ac:name="linenumbers">true</ac:parameter>"#,
            r#"<ac:plain-text-body>{code}</ac:plain-text-body>"#,
            r#"</ac:structured-macro>"#
        ),
        language = escape_html(language),
        code = escape_html(code),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageAttrs {
    pub alt: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
}

pub fn attachment_image(file_name: &str, attrs: &ImageAttrs) -> String {
    format!(
        r#"<ac:image{}><ri:attachment ri:filename="{}"/></ac:image>"#,
        image_attributes(attrs),
        escape_html(file_name),
    )
}

pub fn external_image(url: &str, attrs: &ImageAttrs) -> String {
    format!(
        r#"<ac:image{}><ri:url ri:value="{}"/></ac:image>"#,
        image_attributes(attrs),
        escape_html(url),
    )
}

fn image_attributes(attrs: &ImageAttrs) -> String {
    let mut out = String::new();
    if let Some(alt) = &attrs.alt
        && !alt.trim().is_empty()
    {
        out.push_str(&format!(r#" ac:alt="{}""#, escape_html(alt.trim())));
    }
    if let Some(width) = &attrs.width {
        out.push_str(&format!(r#" ac:width="{}""#, escape_html(width)));
    }
    if let Some(height) = &attrs.height {
        out.push_str(&format!(r#" ac:height="{}""#, escape_html(height)));
    }
    out
}

/// Preview macro for document attachments (PDF, Word) rendered inline by the target.
pub fn file_preview(file_name: &str) -> String {
    format!(
        concat!(
            r#"<ac:structured-macro ac:name="view-file">"#,
            r#"<ac:parameter ac:name="name"><ri:attachment ri:filename="{name}"/></ac:parameter>"#,
            r#"</ac:structured-macro>"#
        ),
        name = escape_html(file_name),
    )
}

/// Link to an attachment. The label is emitted as a plain-text link body when
/// it differs from the filename; otherwise the target renders the filename.
pub fn attachment_link(file_name: &str, label: Option<&str>) -> String {
    let body = match label {
        Some(text) if !text.is_empty() && text != file_name => format!(
            "<ac:plain-text-link-body>{}</ac:plain-text-link-body>",
            escape_html(text),
        ),
        _ => String::new(),
    };
    format!(
        r#"<ac:link><ri:attachment ri:filename="{}"/>{body}</ac:link>"#,
        escape_html(file_name),
    )
}

/// Visible in-page error block substituted when a single page's transform fails.
pub fn error_panel(message: &str, source: &str) -> String {
    let mut preview: String = source.chars().take(ERROR_SOURCE_PREVIEW_CHARS).collect();
    if source.chars().count() > ERROR_SOURCE_PREVIEW_CHARS {
        preview.push_str("...");
    }
    format!(
        concat!(
            r#"<ac:structured-macro ac:name="warning">"#,
            r#"<ac:parameter ac:name="title">Migration error</ac:parameter>"#,
            r#"<ac:rich-text-body><p>{message}</p><pre>{source}</pre></ac:rich-text-body>"#,
            r#"</ac:structured-macro>"#
        ),
        message = escape_html(message),
        source = escape_html(&preview),
    )
}
