//! HTTP adapter for the OCR provider.
//!
//! The adapter never fails the pipeline: provider errors, recognition
//! failures, and empty results all degrade to an empty string. Callers treat
//! empty text as "extraction unavailable", never as a valid blank answer.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use examflow_shared::{ExamflowError, Result};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Examflow/", env!("CARGO_PKG_VERSION"));

/// Output formats requested from the provider. Only the plain-text form is
/// consumed; the others are requested so the provider runs its full pipeline.
const REQUEST_FORMATS: [&str; 3] = ["text", "html", "data"];

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    src: &'a str,
    formats: [&'a str; 3],
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    html: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    data: Option<serde_json::Value>,
    /// Set by the provider on recognition failure.
    #[serde(default)]
    error: Option<String>,
}

/// Client for the OCR provider endpoint.
pub struct OcrClient {
    client: Client,
    endpoint: String,
    app_key: String,
}

impl OcrClient {
    /// Create a new OCR client.
    pub fn new(endpoint: &str, app_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ExamflowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            app_key: app_key.to_string(),
        })
    }

    /// Extract plain text from the asset at `source_url`.
    ///
    /// The URL is normalized to direct-download form before the call. Any
    /// failure (transport, HTTP status, provider error field, empty result)
    /// is logged and returned as an empty string.
    pub async fn extract_text(&self, source_url: &str) -> String {
        let normalized = normalize_source_url(source_url);
        debug!(url = %normalized, "requesting OCR extraction");

        let request = OcrRequest {
            src: &normalized,
            formats: REQUEST_FORMATS,
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .header("app_key", &self.app_key)
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %normalized, error = %e, "OCR request failed");
                return String::new();
            }
        };

        if !response.status().is_success() {
            warn!(url = %normalized, status = %response.status(), "OCR provider returned error status");
            return String::new();
        }

        let body: OcrResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %normalized, error = %e, "OCR response could not be decoded");
                return String::new();
            }
        };

        if let Some(error) = body.error {
            warn!(url = %normalized, error = %error, "OCR recognition failed");
            return String::new();
        }

        match body.text {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                warn!(url = %normalized, "OCR returned empty text");
                String::new()
            }
        }
    }
}

/// Rewrite known share-link viewer URLs into direct-download form.
///
/// A URL containing a `/d/<file-id>/` segment is rewritten to
/// `https://drive.google.com/uc?export=download&id=<file-id>`. Anything else
/// passes through unchanged.
pub fn normalize_source_url(url: &str) -> String {
    if let Some(start) = url.find("/d/") {
        let rest = &url[start + 3..];
        let end = rest
            .find(|c| c == '/' || c == '?' || c == '#')
            .unwrap_or(rest.len());
        let file_id = &rest[..end];
        if !file_id.is_empty() {
            return format!("https://drive.google.com/uc?export=download&id={file_id}");
        }
    }
    url.to_string()
}
