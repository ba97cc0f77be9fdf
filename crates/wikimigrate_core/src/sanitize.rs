use std::sync::OnceLock;

use regex::Regex;

/// Decode percent-escapes (`%20` etc.); malformed escapes pass through literally.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let (Some(high), Some(low)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
        {
            out.push(high * 16 + low);
            index += 3;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Human-readable page title from a filesystem name.
pub fn decode_title(raw: &str) -> String {
    percent_decode(raw).trim().to_string()
}

/// The one canonical source-title → Confluence-title mapping. The validator and the
/// transformer's link resolution both go through this function; they must never
/// diverge, or links resolve to titles the validator never checked.
pub fn confluence_title(raw: &str) -> String {
    let decoded = percent_decode(raw);
    let mut out = String::with_capacity(decoded.len());
    for ch in decoded.chars() {
        match ch {
            '/' | '\\' => out.push('-'),
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            '%' => out.push('-'),
            '&' => out.push_str("and"),
            '+' => out.push(' '),
            _ => out.push(ch),
        }
    }
    out.trim().to_string()
}

/// Same-document anchor for a title, used when a link target has no remote id yet.
pub fn title_anchor(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Normalization applied to both `.order` entries and candidate titles before
/// comparison; the order file and filenames may encode the same logical title
/// differently (spaces vs dashes vs escapes).
pub fn order_key(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect()
}

fn extension_junk_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\.[A-Za-z0-9]{1,8})[\s%?].*$").expect("valid regex"))
}

fn size_annotation_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:%20)*(?:%3D|=)[0-9]+x$").expect("valid regex"))
}

fn guid_suffix_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)[-_ ]?[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}(\.[A-Za-z0-9]{1,8})?$",
        )
        .expect("valid regex")
    })
}

/// Canonical attachment filename from a raw export-artifact name.
///
/// The export tool and the Markdown it produces disagree about the same file:
/// `diagram.png%20%3D750x`, `diagram.png =750x`, and `diagram.png` must all key the
/// same index entry. The steps run in a fixed order and the result is a fixed point
/// (cleaning twice changes nothing).
pub fn clean_file_name(raw: &str) -> String {
    // 1. Drop export junk glued on after the real extension.
    let cleaned = extension_junk_pattern().replace(raw.trim(), "$1");
    // 2. Drop a trailing `=750x` / `%3D750x` width hint.
    let cleaned = size_annotation_pattern().replace(&cleaned, "");
    // 3. Drop a trailing 8-4-4-4-12 GUID, keeping the extension behind it.
    let cleaned = guid_suffix_pattern().replace(&cleaned, "$1");
    // 4. Decode whatever escapes remain.
    percent_decode(&cleaned)
}
