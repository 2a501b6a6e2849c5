//! Content extraction for the indexer.
//!
//! Turns a supported file into something an embedder can consume:
//! - plain text, HTML, PDF and DOCX become normalized text split into word chunks
//! - images become a fixed-size RGB bitmap

mod error;
mod image;
mod kind;
mod text;

pub use error::IndexError;
pub use image::{IMAGE_SIDE, decode_image, encode_png};
pub use kind::ContentKind;
pub use text::{MAX_CHUNKS, WORDS_PER_CHUNK, chunk_words, extract_text, snippet};
