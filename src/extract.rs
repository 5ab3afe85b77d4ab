//! Document text extraction and chunking.
//!
//! Converts uploaded bytes plus a MIME type into an ordered sequence of text
//! chunks. Plain-text uploads become a single chunk; PDF and DOCX uploads are
//! extracted preserving paragraph order and split into chunks of 1,200 ± 200
//! characters on paragraph boundaries. A paragraph longer than 2,400
//! characters is split at whitespace.
//!
//! Extraction is pluggable via the [`Extractor`] trait; [`DefaultExtractor`]
//! handles `text/*`, PDF (`pdf-extract`), and DOCX (`zip` + `quick-xml`,
//! reading the `w:t` runs of `word/document.xml`).

use std::io::Read;

use crate::error::{Result, ServiceError};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Target chunk length in characters.
const CHUNK_TARGET: usize = 1_200;
/// Tolerance around the target; a buffer may grow to target + tolerance.
const CHUNK_TOLERANCE: usize = 200;
/// Paragraphs beyond this length are split at whitespace.
const PARAGRAPH_HARD_LIMIT: usize = 2_400;
/// Decompressed bytes cap for a single DOCX ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// One extracted chunk, ordered by `chunk_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedChunk {
    pub chunk_index: u32,
    pub text: String,
}

/// Extraction metadata returned alongside the chunks.
#[derive(Debug, Clone, Default)]
pub struct ExtractionMeta {
    pub page_count: Option<usize>,
    pub word_count: usize,
}

/// Converts uploaded bytes into normalized text chunks.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        bytes: &[u8],
        mime: &str,
        title: &str,
    ) -> Result<(Vec<ExtractedChunk>, ExtractionMeta)>;
}

/// Built-in extractor for text, PDF, and DOCX uploads.
pub struct DefaultExtractor;

impl Extractor for DefaultExtractor {
    fn extract(
        &self,
        bytes: &[u8],
        mime: &str,
        _title: &str,
    ) -> Result<(Vec<ExtractedChunk>, ExtractionMeta)> {
        let (text, page_count) = match mime {
            m if m.starts_with("text/") => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err(ServiceError::EmptyContent);
                }
                // Text MIME: a single chunk equal to the decoded content.
                let meta = ExtractionMeta {
                    page_count: None,
                    word_count: count_words(trimmed),
                };
                return Ok((vec![ExtractedChunk { chunk_index: 0, text }], meta));
            }
            MIME_PDF => extract_pdf(bytes)?,
            MIME_DOCX => (extract_docx(bytes)?, None),
            other => return Err(ServiceError::UnsupportedMime(other.to_string())),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ServiceError::EmptyContent);
        }

        let chunks = chunk_paragraphs(&text);
        let meta = ExtractionMeta {
            page_count,
            word_count: count_words(&text),
        };
        Ok((chunks, meta))
    }
}

fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

fn extract_pdf(bytes: &[u8]) -> Result<(String, Option<usize>)> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ServiceError::BadRequest(format!("PDF extraction failed: {}", e)))?;
    // pdf-extract renders page breaks as form feeds.
    let page_count = text.matches('\u{c}').count() + 1;
    Ok((text.replace('\u{c}', "\n\n"), Some(page_count)))
}

/// Pulls the `w:t` text runs out of `word/document.xml`, inserting paragraph
/// breaks at `w:p` boundaries.
fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ServiceError::BadRequest(format!("DOCX extraction failed: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ServiceError::BadRequest("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ServiceError::BadRequest(format!("DOCX extraction failed: {}", e)))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ServiceError::BadRequest(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with("\n\n") && !out.is_empty() {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(ServiceError::BadRequest(format!(
                    "DOCX extraction failed: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Split extracted text into chunks of `CHUNK_TARGET ± CHUNK_TOLERANCE`
/// characters on paragraph boundaries. Indices are contiguous from 0.
pub fn chunk_paragraphs(text: &str) -> Vec<ExtractedChunk> {
    let max_chars = CHUNK_TARGET + CHUNK_TOLERANCE;
    let mut chunks: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.len() > PARAGRAPH_HARD_LIMIT {
            if !buf.is_empty() {
                chunks.push(std::mem::take(&mut buf));
            }
            for piece in split_at_whitespace(trimmed, max_chars) {
                chunks.push(piece);
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            chunks.push(std::mem::take(&mut buf));
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(trimmed);
    }
    if !buf.is_empty() {
        chunks.push(buf);
    }
    if chunks.is_empty() {
        chunks.push(text.trim().to_string());
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, text)| ExtractedChunk {
            chunk_index: i as u32,
            text,
        })
        .collect()
}

/// Hard-split an oversized paragraph at whitespace, keeping each piece at or
/// under `max_chars`.
fn split_at_whitespace(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_whitespace() {
        let would_be = if current.is_empty() {
            word.len()
        } else {
            current.len() + 1 + word.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
