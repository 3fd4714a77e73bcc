//! HTTP adapter for the ML classifier.
//!
//! Unlike OCR extraction, classification never degrades silently: a transport
//! error, a non-success status, or a malformed body is a hard error surfaced
//! to the caller, which skips the item and leaves it for the next pass.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use examflow_shared::{ExamflowError, Result};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Examflow/", env!("CARGO_PKG_VERSION"));

/// A classifier verdict for one item.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Predicted subject display name.
    pub subject_name: String,
    /// Predicted topic name within that subject.
    pub topic_name: String,
    /// Free-text rationale from the model.
    pub rationale: String,
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
    tentative_category: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    category: String,
    subcategory: String,
    #[serde(default)]
    rationale: String,
}

/// Client for the classifier endpoint.
pub struct ClassifierClient {
    client: Client,
    endpoint: String,
    access_key: String,
}

impl ClassifierClient {
    /// Create a new classifier client.
    pub fn new(endpoint: &str, access_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ExamflowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            access_key: access_key.to_string(),
        })
    }

    /// Classify item text, with the item's current subject name as a hint.
    pub async fn classify(&self, text: &str, tentative_category: &str) -> Result<Prediction> {
        debug!(chars = text.len(), hint = tentative_category, "requesting classification");

        let request = ClassifyRequest {
            text,
            tentative_category,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-access-key", &self.access_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExamflowError::Classification(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExamflowError::Classification(format!(
                "classifier returned HTTP {status}"
            )));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ExamflowError::Classification(format!("malformed response: {e}")))?;

        if body.category.trim().is_empty() || body.subcategory.trim().is_empty() {
            return Err(ExamflowError::Classification(
                "classifier returned blank category or subcategory".into(),
            ));
        }

        Ok(Prediction {
            subject_name: body.category,
            topic_name: body.subcategory,
            rationale: body.rationale,
        })
    }
}
