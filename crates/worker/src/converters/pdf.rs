use std::fmt::Write;

use docconv_core::converter::{ConversionContext, ConversionError};

/// One `## Page N` section per page, progress reported after each page.
///
/// A page whose text cannot be extracted (unsupported font encoding, broken
/// content stream) yields an empty section rather than failing the document.
pub(crate) fn to_markdown(
    bytes: &[u8],
    ctx: &ConversionContext<'_>,
) -> Result<String, ConversionError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| ConversionError::Failed(format!("Failed to load PDF: {e}")))?;

    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Err(ConversionError::Failed("PDF has no pages".into()));
    }

    let total = pages.len();
    let mut markdown = String::new();
    for (index, page) in pages.iter().enumerate() {
        ctx.checkpoint()?;

        let text = doc.extract_text(&[*page]).unwrap_or_else(|e| {
            tracing::warn!(page, error = %e, "Failed to extract page text");
            String::new()
        });

        if !markdown.is_empty() {
            markdown.push('\n');
        }
        let _ = writeln!(markdown, "## Page {page}\n");
        let text = text.trim();
        if !text.is_empty() {
            markdown.push_str(text);
            markdown.push('\n');
        }

        ctx.report_fraction(index + 1, total);
    }

    Ok(markdown)
}
