//! Built-in document-to-Markdown converter.
//!
//! | Input | Handling |
//! |-------|----------|
//! | PDF | text per page via `lopdf`, one `## Page N` section each |
//! | DOCX | paragraphs and headings from `word/document.xml` |
//! | PPTX / PPSX | text per slide, one `## Slide N` section each |
//! | XLSX | one Markdown table per worksheet |
//! | plain text / Markdown | passed through |
//! | legacy PPT | rejected as unsupported |

mod ooxml;
mod pdf;

use docconv_core::converter::{
    ConversionContext, ConversionError, ConversionInput, ConversionOutput, Converter,
};
use docconv_core::upload::{
    stored_extension, MIME_DOCX, MIME_PDF, MIME_PPSX, MIME_PPT, MIME_PPTX, MIME_XLSX,
};

/// Format the converter dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    Pdf,
    Docx,
    Slides,
    Sheets,
    Text,
    LegacyPpt,
}

impl DocumentKind {
    /// Content type first; the filename extension decides for generic types.
    fn detect(content_type: &str, filename: &str) -> Option<Self> {
        let kind = match content_type {
            MIME_PDF => Some(Self::Pdf),
            MIME_DOCX => Some(Self::Docx),
            MIME_PPTX | MIME_PPSX => Some(Self::Slides),
            MIME_XLSX => Some(Self::Sheets),
            MIME_PPT => Some(Self::LegacyPpt),
            "text/plain" | "text/markdown" => Some(Self::Text),
            _ => None,
        };
        kind.or_else(|| match stored_extension(filename).as_str() {
            ".pdf" => Some(Self::Pdf),
            ".docx" => Some(Self::Docx),
            ".pptx" | ".ppsx" => Some(Self::Slides),
            ".xlsx" => Some(Self::Sheets),
            ".ppt" => Some(Self::LegacyPpt),
            ".txt" | ".md" | ".markdown" => Some(Self::Text),
            _ => None,
        })
    }
}

/// [`Converter`] for the document formats the service accepts by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentConverter;

impl DocumentConverter {
    pub fn new() -> Self {
        Self
    }
}

impl Converter for DocumentConverter {
    fn convert(
        &self,
        input: &ConversionInput,
        ctx: &ConversionContext<'_>,
    ) -> Result<ConversionOutput, ConversionError> {
        let kind = DocumentKind::detect(&input.content_type, &input.filename).ok_or_else(|| {
            ConversionError::UnsupportedFormat(format!(
                "No converter for content type {}",
                input.content_type
            ))
        })?;

        let _span = tracing::info_span!("converter", job_id = %input.job_id, kind = ?kind).entered();
        tracing::debug!(size_bytes = input.bytes.len(), "Converting document");

        let markdown = match kind {
            DocumentKind::Pdf => pdf::to_markdown(&input.bytes, ctx)?,
            DocumentKind::Docx => ooxml::docx_to_markdown(&input.bytes, ctx)?,
            DocumentKind::Slides => ooxml::slides_to_markdown(&input.bytes, ctx)?,
            DocumentKind::Sheets => ooxml::sheets_to_markdown(&input.bytes, ctx)?,
            DocumentKind::Text => String::from_utf8_lossy(&input.bytes).into_owned(),
            DocumentKind::LegacyPpt => {
                return Err(ConversionError::UnsupportedFormat(
                    "Legacy PowerPoint (.ppt) files are not supported; save as .pptx".into(),
                ));
            }
        };

        Ok(ConversionOutput::markdown(markdown))
    }
}
