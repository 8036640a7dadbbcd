//! Upload admission rules: size limit and accepted content types.
//!
//! Validation happens before a job exists; a rejected upload never creates a
//! record or touches the queue.

use crate::error::CoreError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_PPSX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.slideshow";
pub const MIME_PPT: &str = "application/vnd.ms-powerpoint";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Content types accepted when no explicit list is configured.
pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] =
    &[MIME_PDF, MIME_DOCX, MIME_PPTX, MIME_PPSX, MIME_PPT, MIME_XLSX];

/// Fallback name for uploads without a usable filename.
const DEFAULT_FILENAME: &str = "upload";

/// Longest extension kept on the stored input file.
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    max_bytes: u64,
    allowed_content_types: Vec<String>,
}

impl UploadPolicy {
    pub fn new(max_bytes: u64, allowed_content_types: Vec<String>) -> Self {
        let allowed_content_types = allowed_content_types
            .iter()
            .map(|ct| normalize(ct))
            .filter(|ct| !ct.is_empty())
            .collect();
        Self {
            max_bytes,
            allowed_content_types,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn allowed_content_types(&self) -> &[String] {
        &self.allowed_content_types
    }

    /// Reject uploads whose running size exceeds the limit.
    pub fn check_size(&self, size_bytes: u64) -> Result<(), CoreError> {
        if size_bytes > self.max_bytes {
            return Err(CoreError::PayloadTooLarge {
                size_bytes,
                limit_bytes: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Decide the content type a job is created with.
    ///
    /// The declared type wins when it is allowed. Otherwise the type implied
    /// by the filename extension is used if that one is allowed, which covers
    /// clients that send `application/octet-stream` or legacy labels.
    pub fn resolve_content_type(
        &self,
        declared: Option<&str>,
        filename: &str,
    ) -> Result<String, CoreError> {
        let declared = declared.map(normalize).unwrap_or_default();
        if self.is_allowed(&declared) {
            return Ok(declared);
        }

        if let Some(guessed) = mime_guess::from_path(filename)
            .iter()
            .map(|m| m.essence_str().to_string())
            .find(|m| self.is_allowed(m))
        {
            return Ok(guessed);
        }

        let shown = if declared.is_empty() {
            MIME_OCTET_STREAM.to_string()
        } else {
            declared
        };
        Err(CoreError::UnsupportedMediaType(format!(
            "content-type {shown} not allowed"
        )))
    }

    fn is_allowed(&self, content_type: &str) -> bool {
        !content_type.is_empty() && self.allowed_content_types.iter().any(|a| a == content_type)
    }
}

impl Default for UploadPolicy {
    /// 300 MB limit, default document types.
    fn default() -> Self {
        Self::new(
            300 * 1024 * 1024,
            DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

/// Lowercase a content type and drop parameters (`; charset=...`).
fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Strip any client-supplied directory components from a filename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        base.to_string()
    }
}

/// Extension (with leading dot) used for the stored input file, or an empty
/// string when the filename has none worth keeping.
pub fn stored_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}
