use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;

use super::error::IndexError;
use super::kind::ContentKind;

/// Words per embedding chunk.
pub const WORDS_PER_CHUNK: usize = 500;

/// Upper bound on chunks embedded per file.
pub const MAX_CHUNKS: usize = 16;

const SNIPPET_CHARS: usize = 300;
const HTML_WIDTH: usize = 120;

/// Extract normalized text from the raw bytes of a file.
///
/// `path` is only used for error messages.
pub fn extract_text(path: &Path, kind: ContentKind, bytes: &[u8]) -> Result<String, IndexError> {
    let raw = match kind {
        ContentKind::PlainText => std::str::from_utf8(bytes)
            .map_err(|e| IndexError::extraction(path, e))?
            .to_string(),
        ContentKind::Html => html2text::from_read(bytes, HTML_WIDTH)
            .map_err(|e| IndexError::extraction(path, format!("html2text error: {e}")))?,
        ContentKind::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| IndexError::extraction(path, e))?
        }
        ContentKind::Docx => docx_text(path, bytes)?,
        ContentKind::Image => return Err(IndexError::Unsupported("image".to_string())),
    };
    Ok(normalize(&raw))
}

/// Split text into chunks of at most [`WORDS_PER_CHUNK`] words.
pub fn chunk_words(text: &str, words_per_chunk: usize, max_chunks: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(words_per_chunk.max(1))
        .take(max_chunks)
        .map(|chunk| chunk.join(" "))
        .collect()
}

/// Leading characters of the text, cut on a char boundary.
pub fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

/// Trim every line and drop blank ones.
fn normalize(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn docx_text(path: &Path, bytes: &[u8]) -> Result<String, IndexError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| IndexError::extraction(path, e))?;
    let mut entry = archive
        .by_name("word/document.xml")
        .map_err(|e| IndexError::extraction(path, e))?;
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| IndexError::extraction(path, e))?;
    document_xml_text(&xml).map_err(|e| IndexError::extraction(path, e))
}

/// Collect `w:t` runs, breaking lines at paragraph ends.
fn document_xml_text(xml: &str) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Event::Text(e) if in_text => out.push_str(&e.unescape()?),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
