//! Batch ingestion from tabular input, and the OCR extraction pass.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use examflow_extract::{ContentCache, OcrClient, escape_choice_markers, parse_answer_choices};
use examflow_shared::{
    AnswerOption, ContentSegment, ExamflowError, Item, ItemId, Result, content_hash,
};
use examflow_storage::Storage;

use crate::progress::PassProgress;

/// Summary of one CSV ingest.
#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub rows_read: usize,
    pub items_created: usize,
    /// Rows with neither text nor image, or rows that failed to parse.
    pub rows_skipped: usize,
}

/// Summary of one extraction pass.
#[derive(Debug, Clone)]
pub struct ExtractionSummary {
    pub processed: usize,
    /// Items that gained a text segment from OCR.
    pub extracted: usize,
    /// Items whose every media asset yielded empty text; left image-only.
    pub unavailable: usize,
    /// Items that already had text.
    pub skipped: usize,
    pub elapsed: Duration,
}

/// One spreadsheet row, column-by-column. Every column is optional: missing
/// or malformed cells degrade to empty segment/answer lists, never abort the
/// batch.
#[derive(Debug, Default, Deserialize)]
struct RawRow {
    #[serde(default)]
    question_text: Option<String>,
    #[serde(default)]
    question_image: Option<String>,
    #[serde(default)]
    choice_a: Option<String>,
    #[serde(default)]
    choice_b: Option<String>,
    #[serde(default)]
    choice_c: Option<String>,
    #[serde(default)]
    choice_d: Option<String>,
    #[serde(default)]
    choice_e: Option<String>,
    #[serde(default)]
    answer_key: Option<String>,
}

impl RawRow {
    fn segments(&self) -> Vec<ContentSegment> {
        let mut segments = Vec::new();
        if let Some(text) = nonblank(&self.question_text) {
            segments.push(ContentSegment::text(text));
        }
        if let Some(url) = nonblank(&self.question_image) {
            segments.push(ContentSegment::media(url));
        }
        segments
    }

    fn answers(&self) -> Vec<AnswerOption> {
        let correct = self
            .answer_key
            .as_deref()
            .and_then(|k| k.trim().chars().next())
            .map(|c| c.to_ascii_uppercase());

        let choices = [
            ('A', &self.choice_a),
            ('B', &self.choice_b),
            ('C', &self.choice_c),
            ('D', &self.choice_d),
            ('E', &self.choice_e),
        ];

        choices
            .into_iter()
            .filter_map(|(key, value)| {
                nonblank(value)
                    .map(|content| AnswerOption::new(key, content, correct == Some(key)))
            })
            .collect()
    }
}

fn nonblank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Ingest a CSV batch into raw items under one (source, year) scope.
#[instrument(skip_all, fields(path = %path.display(), source = source_label, year))]
pub async fn ingest_csv(
    storage: &Storage,
    path: &Path,
    source_label: &str,
    year: i64,
) -> Result<IngestSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| {
            ExamflowError::validation(format!("cannot read {}: {e}", path.display()))
        })?;

    let mut summary = IngestSummary {
        rows_read: 0,
        items_created: 0,
        rows_skipped: 0,
    };

    for record in reader.deserialize::<RawRow>() {
        summary.rows_read += 1;

        let row = match record {
            Ok(row) => row,
            Err(e) => {
                warn!(row = summary.rows_read, error = %e, "unparseable row, skipping");
                summary.rows_skipped += 1;
                continue;
            }
        };

        let segments = row.segments();
        if segments.is_empty() {
            summary.rows_skipped += 1;
            continue;
        }

        let hash = content_hash(&segments);
        let item = Item {
            id: ItemId::new(),
            content: segments,
            answers: row.answers(),
            subject_id: None,
            topic_id: None,
            source_label: source_label.to_string(),
            year,
            attempt_count: 0,
            content_hash: hash,
            created_at: Utc::now(),
        };
        storage.insert_item(&item).await?;
        summary.items_created += 1;
    }

    info!(
        rows_read = summary.rows_read,
        items_created = summary.items_created,
        rows_skipped = summary.rows_skipped,
        "ingest complete"
    );
    Ok(summary)
}

/// Run OCR over every image-only item's media assets.
///
/// Extracted text is marker-escaped and appended as a text segment; parsed
/// answer choices fill an empty answer list. An item whose every asset yields
/// empty text stays image-only and will route to Undecided later.
#[instrument(skip_all)]
pub async fn run_extraction_pass(
    storage: &Storage,
    ocr: &OcrClient,
    progress: &dyn PassProgress,
) -> Result<ExtractionSummary> {
    let start = Instant::now();
    progress.phase("Scanning items");
    let items = storage.list_items().await?;
    let total = items.len();

    let cache = ContentCache::new(storage, ocr);
    let mut summary = ExtractionSummary {
        processed: total,
        extracted: 0,
        unavailable: 0,
        skipped: 0,
        elapsed: Duration::ZERO,
    };

    progress.phase("Extracting text");
    for (i, item) in items.iter().enumerate() {
        progress.item(i + 1, total, &item.id.to_string());

        if !item.is_image_only() {
            summary.skipped += 1;
            continue;
        }

        let mut extracted_parts: Vec<String> = Vec::new();
        for url in item.media_refs() {
            let text = cache.get_or_extract(url).await?;
            if !text.trim().is_empty() {
                extracted_parts.push(text);
            }
        }

        if extracted_parts.is_empty() {
            summary.unavailable += 1;
            continue;
        }

        // Escape before parsing: a literal (C)/(c) in the scan must never
        // read as a choice marker. Choice C still parses via `C.` / `C)`.
        let escaped = escape_choice_markers(&extracted_parts.join("\n"));
        let answers = if item.answers.is_empty() {
            parse_answer_choices(&escaped, None)
        } else {
            item.answers.clone()
        };

        let mut content = item.content.clone();
        content.push(ContentSegment::text(escaped));
        let hash = content_hash(&content);

        storage
            .update_item_segments(&item.id, &content, &answers, &hash)
            .await?;
        summary.extracted += 1;
    }

    summary.elapsed = start.elapsed();
    info!(
        processed = summary.processed,
        extracted = summary.extracted,
        unavailable = summary.unavailable,
        skipped = summary.skipped,
        elapsed_ms = summary.elapsed.as_millis(),
        "extraction pass complete"
    );
    Ok(summary)
}
