use pdfium_render::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("invalid PDF: {0}")]
    Invalid(String),
}

/// Converts a PDF byte stream into plain text and exposes page
/// introspection for upload validation. Implemented with pdfium in
/// production and substituted in tests.
pub trait PdfExtractor: Send + Sync + 'static {
    fn page_count(&self, bytes: &[u8]) -> Result<usize, PdfError>;

    /// Extracts the full text. An `Ok` result may still be empty (for
    /// example a scanned PDF without a text layer); callers decide how to
    /// treat that.
    fn extract_text(&self, bytes: &[u8]) -> Result<String, PdfError>;
}

pub struct PdfiumExtractor;

impl PdfiumExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfiumExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfExtractor for PdfiumExtractor {
    fn page_count(&self, bytes: &[u8]) -> Result<usize, PdfError> {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|err| PdfError::Invalid(format!("load pdf: {err}")))?;

        Ok(document.pages().len() as usize)
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<String, PdfError> {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|err| PdfError::Invalid(format!("load pdf: {err}")))?;

        let mut combined = String::new();
        let pages = document.pages();
        for page_index in 0..pages.len() {
            let page = pages
                .get(page_index)
                .map_err(|err| PdfError::Invalid(format!("load page {page_index}: {err}")))?;
            let text = page.text();
            if let Ok(page_text) = text {
                for segment in page_text.segments().iter() {
                    combined.push_str(&segment.text());
                    combined.push('\n');
                }
            }
        }

        Ok(combined)
    }
}
