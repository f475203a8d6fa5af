//! Source document reading and paragraph splitting.
//!
//! A source document is plain text where passages are separated by one or more
//! blank lines. Each paragraph becomes one candidate [`TextChunk`](crate::vector_store::TextChunk)
//! after it passes the [`SimilarityFilter`](crate::similarity::SimilarityFilter).

use std::{fs, path::Path};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::error::{RagError, Result};

static BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));

/// Read a source document as text.
///
/// UTF-8 is tried first; documents that are not valid UTF-8 are decoded as
/// GBK, which is what legacy Chinese medical corpora are usually saved in.
///
/// # Errors
/// - [`RagError::Io`] if the file cannot be read.
/// - [`RagError::Deserialization`] if the bytes are neither UTF-8 nor GBK.
pub fn read_source(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| RagError::io(path, e))?;

    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) => {
            warn!(path = %path.display(), "Source is not UTF-8, retrying as GBK");
            let bytes = err.into_bytes();
            let (text, _, had_errors) = encoding_rs::GBK.decode(&bytes);
            if had_errors {
                return Err(RagError::deserialization(
                    path.display().to_string(),
                    "source is neither UTF-8 nor GBK",
                ));
            }
            Ok(text.into_owned())
        }
    }
}

/// Split `text` into trimmed, non-empty paragraphs on blank-line boundaries.
///
/// `\r\n` line endings are normalized first, so Windows-authored documents
/// split the same way. A "blank" line may contain whitespace.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    BLANK_LINE
        .split(&normalized)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// [`read_source`] followed by [`split_paragraphs`].
pub fn load_paragraphs(path: &Path) -> Result<Vec<String>> {
    let text = read_source(path)?;
    let paragraphs = split_paragraphs(&text);
    info!(
        path = %path.display(),
        paragraphs = paragraphs.len(),
        "Split source document"
    );
    Ok(paragraphs)
}
