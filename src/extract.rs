//! Plain-text extraction for uploaded files.
//!
//! The upload surface accepts a small, closed set of formats: plain
//! text, Markdown, and PDF. Anything else is rejected by extension
//! before any processing starts. Extraction returns UTF-8 text; the
//! ingestion pipeline consumes nothing but that.

/// File extensions the upload endpoint accepts.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "pdf"];

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedExtension(String),
    Pdf(String),
    Utf8(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedExtension(ext) => write!(
                f,
                "unsupported file type: .{} (supported: {})",
                ext,
                SUPPORTED_EXTENSIONS.join(", ")
            ),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Utf8(e) => write!(f, "file is not valid UTF-8: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Lowercased extension of `filename`, if any.
pub fn file_extension(filename: &str) -> Option<String> {
    filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

/// Extracts plain text from an uploaded file's bytes, dispatching on the
/// filename's extension.
pub fn extract_text(bytes: &[u8], filename: &str) -> Result<String, ExtractError> {
    let ext = file_extension(filename)
        .ok_or_else(|| ExtractError::UnsupportedExtension(String::new()))?;

    match ext.as_str() {
        "txt" | "md" => String::from_utf8(bytes.to_vec())
            .map_err(|e| ExtractError::Utf8(e.to_string())),
        "pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        other => Err(ExtractError::UnsupportedExtension(other.to_string())),
    }
}
