//! Multipart intake: role classification, validation and staging.
//!
//! A request is accepted or rejected as a whole. The first invalid part ends
//! the read and every part staged so far is removed again when the partially
//! built [`StagedUploads`] is dropped.

use crate::config::{MAX_GALLERY_FILES, MAX_PRIMARY_FILES, MAX_UPLOAD_BYTES};
use crate::error::{PipelineError, Result, ValidationError};
use crate::formats::{extension_of, AcceptedFormat, CANONICAL_EXTENSION};
use axum_extra::extract::Multipart;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRole {
    Primary,
    Gallery,
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: String,
    pub role: UploadRole,
    pub max_count: usize,
}

/// Which form fields carry files, and how many each may carry.
#[derive(Debug, Clone)]
pub struct UploadSchema {
    rules: Vec<FieldRule>,
}

impl UploadSchema {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    /// `theme` (one primary image) and `images` (the gallery).
    pub fn project() -> Self {
        Self::new(vec![
            FieldRule {
                field: "theme".into(),
                role: UploadRole::Primary,
                max_count: MAX_PRIMARY_FILES,
            },
            FieldRule {
                field: "images".into(),
                role: UploadRole::Gallery,
                max_count: MAX_GALLERY_FILES,
            },
        ])
    }

    pub fn rule(&self, field: &str) -> Option<&FieldRule> {
        self.rules.iter().find(|r| r.field == field)
    }
}

impl Default for UploadSchema {
    fn default() -> Self {
        Self::project()
    }
}

/// An accepted part sitting in staging. The staged file is removed when this
/// value is dropped.
#[derive(Debug)]
pub struct UploadedFile {
    pub staging_path: PathBuf,
    pub field: String,
    pub role: UploadRole,
    pub original_filename: String,
    pub content_type: String,
    pub size: u64,
}

impl UploadedFile {
    /// Name of the compressed artifact: the staging name with the canonical
    /// extension.
    pub fn output_name(&self) -> String {
        let stem = self
            .staging_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("upload");
        format!("{}.{}", stem, CANONICAL_EXTENSION)
    }
}

impl Drop for UploadedFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.staging_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "could not remove staged {}: {}",
                self.staging_path.display(),
                e
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct StagedUploads {
    pub primary: Option<UploadedFile>,
    pub gallery: Vec<UploadedFile>,
}

impl StagedUploads {
    pub fn len(&self) -> usize {
        self.primary.iter().count() + self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, upload: UploadedFile) {
        match upload.role {
            UploadRole::Primary => self.primary = Some(upload),
            UploadRole::Gallery => self.gallery.push(upload),
        }
    }

    /// Primary first, then gallery in arrival order.
    pub fn into_files(self) -> Vec<UploadedFile> {
        let mut files: Vec<UploadedFile> = self.primary.into_iter().collect();
        files.extend(self.gallery);
        files
    }
}

/// Keep the last path component and replace anything outside `[A-Za-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug)]
pub struct UploadReceiver {
    schema: UploadSchema,
    staging_dir: PathBuf,
    max_file_bytes: u64,
    sequence: AtomicU64,
}

impl UploadReceiver {
    pub fn new(schema: UploadSchema, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            schema,
            staging_dir: staging_dir.into(),
            max_file_bytes: MAX_UPLOAD_BYTES,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Checks everything that is known before the part's bytes are read.
    pub fn check_part(
        &self,
        counts: &HashMap<String, usize>,
        field: &str,
        file_name: &str,
        content_type: &str,
    ) -> Result<UploadRole, ValidationError> {
        let rule = self
            .schema
            .rule(field)
            .ok_or_else(|| ValidationError::UnexpectedField {
                field: field.to_string(),
            })?;

        if counts.get(field).copied().unwrap_or(0) >= rule.max_count {
            return Err(ValidationError::TooManyFiles {
                field: field.to_string(),
                max: rule.max_count,
            });
        }

        let extension = extension_of(Path::new(file_name)).unwrap_or_default();
        if AcceptedFormat::from_extension(&extension).is_none() {
            return Err(ValidationError::InvalidExtension {
                field: field.to_string(),
                extension,
            });
        }

        if AcceptedFormat::from_mime(content_type).is_none() {
            return Err(ValidationError::InvalidContentType {
                field: field.to_string(),
                content_type: content_type.to_string(),
            });
        }

        Ok(rule.role)
    }

    fn check_size(&self, field: &str, size: u64) -> Result<(), ValidationError> {
        if size > self.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                field: field.to_string(),
                max: self.max_file_bytes,
            });
        }
        Ok(())
    }

    /// `<unix millis>-<sequence>-<sanitized name>`; unique per receiver.
    pub fn staging_name(&self, original: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", millis, seq, sanitize_filename(original))
    }

    pub async fn stage(
        &self,
        field: &str,
        role: UploadRole,
        original_filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<UploadedFile> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| PipelineError::io(format!("create {}", self.staging_dir.display()), e))?;

        let upload = UploadedFile {
            staging_path: self.staging_dir.join(self.staging_name(original_filename)),
            field: field.to_string(),
            role,
            original_filename: original_filename.to_string(),
            content_type: content_type.to_string(),
            size: data.len() as u64,
        };
        // on failure `upload` drops and takes any partial file with it
        tokio::fs::write(&upload.staging_path, data)
            .await
            .map_err(|e| {
                PipelineError::io(format!("stage {}", upload.staging_path.display()), e)
            })?;

        log::debug!(
            "staged {} ({}) as {}",
            upload.original_filename,
            upload.field,
            upload.staging_path.display()
        );
        Ok(upload)
    }

    pub async fn receive(&self, mut multipart: Multipart) -> Result<StagedUploads> {
        let mut staged = StagedUploads::default();
        let mut counts: HashMap<String, usize> = HashMap::new();

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| PipelineError::Multipart(e.to_string()))?
        {
            let name = field.name().unwrap_or("").to_string();
            // text fields and untouched file inputs belong to the form, not to us
            let file_name = match field.file_name() {
                Some(f) if !f.is_empty() => f.to_string(),
                _ => continue,
            };
            let content_type = field.content_type().unwrap_or("").to_string();
            let role = self.check_part(&counts, &name, &file_name, &content_type)?;

            let mut data = Vec::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| PipelineError::Multipart(e.to_string()))?
            {
                self.check_size(&name, (data.len() + chunk.len()) as u64)?;
                data.extend_from_slice(&chunk);
            }
            if data.is_empty() {
                return Err(ValidationError::EmptyFile { field: name }.into());
            }

            *counts.entry(name.clone()).or_default() += 1;
            let upload = self
                .stage(&name, role, &file_name, &content_type, &data)
                .await?;
            staged.push(upload);
        }

        log::info!(
            "received {} file(s): primary={} gallery={}",
            staged.len(),
            staged.primary.is_some(),
            staged.gallery.len()
        );
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn receiver(dir: &Path) -> UploadReceiver {
        UploadReceiver::new(UploadSchema::project(), dir.join("staging"))
    }

    #[test]
    fn test_gif_rejected_naming_field() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        let err = rx
            .check_part(&HashMap::new(), "theme", "party.gif", "image/gif")
            .unwrap_err();
        assert_eq!(err.field(), "theme");
        assert!(matches!(err, ValidationError::InvalidExtension { .. }));
    }

    #[test]
    fn test_extension_and_mime_both_checked() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        let counts = HashMap::new();

        assert_eq!(
            rx.check_part(&counts, "images", "a.JPG", "image/jpeg").unwrap(),
            UploadRole::Gallery
        );
        assert_eq!(
            rx.check_part(&counts, "theme", "cover.avif", "image/avif").unwrap(),
            UploadRole::Primary
        );
        let err = rx
            .check_part(&counts, "images", "a.png", "application/pdf")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidContentType { .. }));
        let err = rx.check_part(&counts, "images", "noext", "image/png").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidExtension { .. }));
    }

    #[test]
    fn test_role_caps_and_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        let mut counts = HashMap::new();
        counts.insert("theme".to_string(), 1);
        counts.insert("images".to_string(), MAX_GALLERY_FILES);

        let err = rx.check_part(&counts, "theme", "b.png", "image/png").unwrap_err();
        assert!(matches!(err, ValidationError::TooManyFiles { max: 1, .. }));
        let err = rx.check_part(&counts, "images", "b.png", "image/png").unwrap_err();
        assert!(matches!(err, ValidationError::TooManyFiles { max: 20, .. }));
        let err = rx.check_part(&counts, "avatar", "b.png", "image/png").unwrap_err();
        assert_eq!(err.field(), "avatar");
    }

    #[test]
    fn test_size_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        assert!(rx.check_size("images", MAX_UPLOAD_BYTES).is_ok());
        assert!(matches!(
            rx.check_size("images", MAX_UPLOAD_BYTES + 1),
            Err(ValidationError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_staging_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        let names: HashSet<String> = (0..100).map(|_| rx.staging_name("same.jpg")).collect();
        assert_eq!(names.len(), 100);
        assert!(names.iter().all(|n| n.ends_with("-same.jpg")));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\Mon été.jpg"), "Mon__t_.jpg");
        assert_eq!(sanitize_filename(".hidden.png"), "hidden.png");
        assert_eq!(sanitize_filename(""), "upload");
    }

    #[tokio::test]
    async fn test_staged_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        let upload = tokio_test::assert_ok!(
            rx.stage("images", UploadRole::Gallery, "cat.png", "image/png", b"bytes")
                .await
        );

        let path = upload.staging_path.clone();
        assert!(path.exists());
        assert_eq!(upload.size, 5);
        assert!(upload.output_name().ends_with("-cat.webp"));
        drop(upload);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_staged_uploads_order() {
        let dir = tempfile::tempdir().unwrap();
        let rx = receiver(dir.path());
        let mut staged = StagedUploads::default();
        for name in ["g1.png", "g2.png"] {
            let upload = rx
                .stage("images", UploadRole::Gallery, name, "image/png", b"x")
                .await
                .unwrap();
            staged.push(upload);
        }
        let primary = rx
            .stage("theme", UploadRole::Primary, "p.png", "image/png", b"x")
            .await
            .unwrap();
        staged.push(primary);

        assert_eq!(staged.len(), 3);
        let names: Vec<String> = staged
            .into_files()
            .iter()
            .map(|f| f.original_filename.clone())
            .collect();
        assert_eq!(names, vec!["p.png", "g1.png", "g2.png"]);
    }
}
