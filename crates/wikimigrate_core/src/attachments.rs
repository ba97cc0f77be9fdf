use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use walkdir::WalkDir;

use crate::sanitize::clean_file_name;

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    /// Raw filename on disk, possibly carrying GUID/size export artifacts.
    pub file_name: String,
    /// Canonical name content references resolve against.
    pub clean_file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mime_type: &'static str,
}

impl AttachmentRecord {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// PDF and Word documents get an inline preview macro instead of an image.
    pub fn is_previewable_document(&self) -> bool {
        matches!(
            self.mime_type,
            "application/pdf"
                | "application/msword"
                | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        )
    }
}

/// Index of every file under the wiki's `.attachments` directories, keyed by
/// clean filename. References in page content are inconsistent in raw form
/// (URL-encoded, size-annotated, GUID-suffixed) but resolve to one entry here.
#[derive(Debug, Clone, Default)]
pub struct AttachmentIndex {
    records: BTreeMap<String, AttachmentRecord>,
}

impl AttachmentIndex {
    /// Build the index from the attachment directories a tree walk discovered.
    /// The walk is sorted by path so clean-name collisions resolve
    /// deterministically (last write wins).
    pub fn build(attachment_dirs: &[PathBuf]) -> Result<Self> {
        let mut records = BTreeMap::new();
        for dir in attachment_dirs {
            for entry in WalkDir::new(dir).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        warn!(
                            "skipping unreadable attachment entry under {}: {error}",
                            dir.display()
                        );
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().to_string();
                let metadata = entry.metadata().with_context(|| {
                    format!("failed to stat attachment {}", entry.path().display())
                })?;
                let clean = clean_file_name(&file_name);
                records.insert(
                    clean.clone(),
                    AttachmentRecord {
                        file_name,
                        mime_type: mime_type_for(&clean),
                        clean_file_name: clean,
                        path: entry.path().to_path_buf(),
                        size_bytes: metadata.len(),
                    },
                );
            }
        }
        Ok(Self { records })
    }

    pub fn get(&self, clean_name: &str) -> Option<&AttachmentRecord> {
        self.records.get(clean_name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Clean name for an in-content reference, which may be a path.
pub fn reference_clean_name(reference: &str) -> String {
    let segment = reference
        .rsplit('/')
        .next()
        .unwrap_or(reference);
    clean_file_name(segment)
}

pub fn mime_type_for(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{AttachmentIndex, mime_type_for, reference_clean_name};

    fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, content).expect("write file");
    }

    #[test]
    fn builds_index_keyed_by_clean_name() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join(".attachments");
        write_file(&dir.join("logo.png=300x"), b"12345");
        write_file(
            &dir.join("photo-3fa85f64-5717-4562-b3fc-2c963f66afa6.jpg"),
            b"photo",
        );

        let index = AttachmentIndex::build(&[dir]).expect("build");
        assert_eq!(index.len(), 2);

        let logo = index.get("logo.png").expect("logo record");
        assert_eq!(logo.file_name, "logo.png=300x");
        assert_eq!(logo.size_bytes, 5);
        assert_eq!(logo.mime_type, "image/png");
        assert!(logo.is_image());

        let photo = index.get("photo.jpg").expect("photo record");
        assert_eq!(photo.mime_type, "image/jpeg");
    }

    #[test]
    fn recursive_scan_covers_nested_folders() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join(".attachments");
        write_file(&dir.join("nested").join("deep.pdf"), b"pdf");

        let index = AttachmentIndex::build(&[dir]).expect("build");
        let record = index.get("deep.pdf").expect("nested record");
        assert!(record.is_previewable_document());
    }

    #[test]
    fn clean_name_collisions_resolve_deterministically() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join(".attachments");
        // Both normalize to diagram.png; the later path in sorted walk order wins.
        write_file(&dir.join("diagram.png"), b"first");
        write_file(&dir.join("diagram.png%20%3D750x"), b"second!");

        let index = AttachmentIndex::build(&[dir.clone()]).expect("build");
        assert_eq!(index.len(), 1);
        let record = index.get("diagram.png").expect("record");
        assert_eq!(record.file_name, "diagram.png%20%3D750x");
        assert_eq!(record.size_bytes, 7);
    }

    #[test]
    fn raw_content_references_resolve_through_the_index() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join(".attachments");
        write_file(&dir.join("my%20file.png"), b"png");

        let index = AttachmentIndex::build(&[dir]).expect("build");
        assert!(index.get(&reference_clean_name("/.attachments/my%20file.png")).is_some());
        assert!(index.get(&reference_clean_name("my%20file.png")).is_some());
        assert!(index.get(&reference_clean_name("other.png")).is_none());
    }

    #[test]
    fn reference_clean_name_takes_final_segment() {
        assert_eq!(
            reference_clean_name("/.attachments/logo.png=300x"),
            "logo.png"
        );
        assert_eq!(reference_clean_name("plain.pdf"), "plain.pdf");
    }

    #[test]
    fn mime_type_defaults_to_octet_stream() {
        assert_eq!(mime_type_for("archive.tar.gz"), "application/octet-stream");
        assert_eq!(mime_type_for("noextension"), "application/octet-stream");
        assert_eq!(mime_type_for("report.DOCX"), "application/vnd.openxmlformats-officedocument.wordprocessingml.document");
    }
}
