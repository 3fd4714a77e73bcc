//! Extraction cache: at most one OCR call per source URL.
//!
//! Entries are immutable once written, including empty-text results, so a
//! broken asset is never retried on subsequent passes. Staleness is the
//! accepted trade for idempotency and call-cost control.

use tracing::debug;

use examflow_shared::Result;
use examflow_storage::Storage;

use crate::ocr::{OcrClient, normalize_source_url};

/// Per-URL dedup layer in front of the OCR adapter.
pub struct ContentCache<'a> {
    storage: &'a Storage,
    ocr: &'a OcrClient,
}

impl<'a> ContentCache<'a> {
    pub fn new(storage: &'a Storage, ocr: &'a OcrClient) -> Self {
        Self { storage, ocr }
    }

    /// Return the extracted text for `source_url`, calling the OCR provider
    /// at most once per normalized URL across all passes.
    pub async fn get_or_extract(&self, source_url: &str) -> Result<String> {
        let key = normalize_source_url(source_url);

        if let Some(cached) = self.storage.get_extraction(&key).await? {
            debug!(url = %key, "extraction cache hit");
            return Ok(cached);
        }

        let text = self.ocr.extract_text(source_url).await;

        // Persist before returning, empty results included.
        self.storage.put_extraction(&key, &text).await?;
        Ok(text)
    }
}
