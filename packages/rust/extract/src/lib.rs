//! OCR extraction for exam-item media assets.
//!
//! Three pieces:
//! - [`OcrClient`] — HTTP adapter for the OCR provider, with share-link URL
//!   normalization and degrade-to-empty failure handling
//! - [`ContentCache`] — per-URL extraction dedup backed by the storage layer
//! - answer parsing — inline choice-marker extraction from OCR text

pub mod answers;
pub mod cache;
pub mod ocr;

pub use answers::{escape_choice_markers, parse_answer_choices};
pub use cache::ContentCache;
pub use ocr::{OcrClient, normalize_source_url};
