//! Reconciliation engine: the classification pass and ledger drift repair.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use examflow_classify::ClassifierClient;
use examflow_shared::{
    ClassificationProposal, Item, Result, SENTINEL_TOPIC_NAME, UNDECIDED_NAME,
};
use examflow_storage::Storage;

use crate::progress::PassProgress;

/// Summary of one classification pass.
#[derive(Debug, Clone)]
pub struct ClassificationSummary {
    /// Items considered (not yet in the ledger at pass start).
    pub processed: usize,
    /// Items that received a real prediction.
    pub classified: usize,
    /// Image-only items routed to the sentinel.
    pub undecided: usize,
    /// Items whose ledger row already existed (concurrent writer won).
    pub skipped: usize,
    /// Items whose classifier call failed; retried next pass.
    pub failed: usize,
    pub elapsed: Duration,
}

/// Summary of one drift-repair pass.
#[derive(Debug, Clone)]
pub struct RepairSummary {
    pub scanned: usize,
    pub repaired: usize,
    pub elapsed: Duration,
}

/// Run the classification pass over every item not yet in the ledger.
///
/// Items are processed one at a time in creation order. A classifier failure
/// is fatal only to its item: no ledger row is written and the item is
/// retried on the next pass. A subject or topic created for one item is
/// visible to the next item's lookup because every lookup hits the store.
#[instrument(skip_all)]
pub async fn run_classification_pass(
    storage: &Storage,
    classifier: &ClassifierClient,
    progress: &dyn PassProgress,
) -> Result<ClassificationSummary> {
    let start = Instant::now();
    progress.phase("Scanning ledger");
    let items = storage.list_unprocessed_items().await?;
    let total = items.len();

    info!(unprocessed = total, "starting classification pass");
    progress.phase("Classifying items");

    let mut summary = ClassificationSummary {
        processed: total,
        classified: 0,
        undecided: 0,
        skipped: 0,
        failed: 0,
        elapsed: Duration::ZERO,
    };

    for (i, item) in items.iter().enumerate() {
        progress.item(i + 1, total, &item.id.to_string());

        let (old_subject_id, old_subject_name) = match &item.subject_id {
            Some(id) => (
                Some(id.clone()),
                storage.get_subject(id).await?.map(|s| s.name),
            ),
            None => (None, None),
        };
        let (old_topic_id, old_topic_name) = match &item.topic_id {
            Some(id) => (
                Some(id.clone()),
                storage.get_topic(id).await?.map(|t| t.name),
            ),
            None => (None, None),
        };

        let proposal = if item.is_image_only() {
            // No extractable text: never call the classifier. Route toward
            // Undecided, with the sentinel topic name kept for audit.
            let undecided = storage.find_or_create_subject(UNDECIDED_NAME).await?;
            let placeholder = storage
                .find_or_create_topic(SENTINEL_TOPIC_NAME, &undecided.id)
                .await?;
            summary.undecided += 1;

            build_proposal(
                item,
                (old_subject_id, old_subject_name, old_topic_id, old_topic_name),
                &undecided.id,
                UNDECIDED_NAME,
                &placeholder.id,
                SENTINEL_TOPIC_NAME,
                "no extractable text",
            )
        } else {
            let hint = old_subject_name.as_deref().unwrap_or("");
            let prediction = match classifier.classify(&item.text_content(), hint).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "classification failed, will retry next pass");
                    summary.failed += 1;
                    continue;
                }
            };

            let subject = storage
                .find_or_create_subject(&prediction.subject_name)
                .await?;
            let topic = storage
                .find_or_create_topic(&prediction.topic_name, &subject.id)
                .await?;
            summary.classified += 1;

            build_proposal(
                item,
                (old_subject_id, old_subject_name, old_topic_id, old_topic_name),
                &subject.id,
                &subject.name,
                &topic.id,
                &topic.name,
                &prediction.rationale,
            )
        };

        if !storage.record_proposal(&proposal).await? {
            // A row for this item appeared since the scan; already done.
            summary.skipped += 1;
            if proposal.is_sentinel() {
                summary.undecided -= 1;
            } else {
                summary.classified -= 1;
            }
        }
    }

    summary.elapsed = start.elapsed();
    info!(
        processed = summary.processed,
        classified = summary.classified,
        undecided = summary.undecided,
        skipped = summary.skipped,
        failed = summary.failed,
        elapsed_ms = summary.elapsed.as_millis(),
        "classification pass complete"
    );
    Ok(summary)
}

/// Repair ledger rows whose proposed target drifted out of the live taxonomy.
///
/// A row drifts when its proposed topic is no longer a child of its proposed
/// subject under the recorded names (a manual taxonomy edit after staging).
/// Drifted rows are re-resolved by name and rewritten in place so the
/// migration driver never commits a stale id.
#[instrument(skip_all)]
pub async fn run_drift_repair(
    storage: &Storage,
    progress: &dyn PassProgress,
) -> Result<RepairSummary> {
    let start = Instant::now();
    progress.phase("Scanning ledger for drift");
    let proposals = storage.list_proposals().await?;
    let total = proposals.len();

    let mut repaired = 0usize;
    for (i, proposal) in proposals.iter().enumerate() {
        progress.item(i + 1, total, &proposal.item_id.to_string());

        if proposal_target_is_live(storage, proposal).await? {
            continue;
        }

        let subject = storage
            .find_or_create_subject(&proposal.new_subject_name)
            .await?;
        let topic = storage
            .find_or_create_topic(&proposal.new_topic_name, &subject.id)
            .await?;
        storage
            .rewrite_proposal_target(
                &proposal.id,
                &subject.id,
                &subject.name,
                &topic.id,
                &topic.name,
            )
            .await?;
        info!(
            item_id = %proposal.item_id,
            topic = %proposal.new_topic_name,
            "repaired drifted proposal"
        );
        repaired += 1;
    }

    let summary = RepairSummary {
        scanned: total,
        repaired,
        elapsed: start.elapsed(),
    };
    info!(
        scanned = summary.scanned,
        repaired = summary.repaired,
        "drift repair complete"
    );
    Ok(summary)
}

/// A proposal target is live when its topic id still resolves, still belongs
/// to the proposed subject, and still carries the recorded name.
async fn proposal_target_is_live(
    storage: &Storage,
    proposal: &ClassificationProposal,
) -> Result<bool> {
    let Some(topic) = storage.get_topic(&proposal.new_topic_id).await? else {
        return Ok(false);
    };
    Ok(topic.subject_id == proposal.new_subject_id
        && topic.name.eq_ignore_ascii_case(&proposal.new_topic_name))
}

#[allow(clippy::too_many_arguments)]
fn build_proposal(
    item: &Item,
    old: (Option<String>, Option<String>, Option<String>, Option<String>),
    new_subject_id: &str,
    new_subject_name: &str,
    new_topic_id: &str,
    new_topic_name: &str,
    rationale: &str,
) -> ClassificationProposal {
    let (old_subject_id, old_subject_name, old_topic_id, old_topic_name) = old;
    ClassificationProposal {
        id: Uuid::now_v7().to_string(),
        item_id: item.id.clone(),
        old_subject_id,
        old_subject_name,
        old_topic_id,
        old_topic_name,
        new_subject_id: new_subject_id.to_string(),
        new_subject_name: new_subject_name.to_string(),
        new_topic_id: new_topic_id.to_string(),
        new_topic_name: new_topic_name.to_string(),
        rationale: rationale.to_string(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use chrono::Utc;
    use examflow_shared::{ContentSegment, ItemId, content_hash};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ef_reconcile_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn text_item(text: &str) -> Item {
        let content = vec![ContentSegment::text(text)];
        let hash = content_hash(&content);
        Item {
            id: ItemId::new(),
            content,
            answers: vec![],
            subject_id: None,
            topic_id: None,
            source_label: "UTBK".into(),
            year: 2023,
            attempt_count: 0,
            content_hash: hash,
            created_at: Utc::now(),
        }
    }

    fn image_item(url: &str) -> Item {
        let content = vec![ContentSegment::media(url)];
        let hash = content_hash(&content);
        Item {
            id: ItemId::new(),
            content,
            answers: vec![],
            subject_id: None,
            topic_id: None,
            source_label: "UTBK".into(),
            year: 2023,
            attempt_count: 0,
            content_hash: hash,
            created_at: Utc::now(),
        }
    }

    fn prediction_response(subject: &str, topic: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "category": subject,
            "subcategory": topic,
            "rationale": "test rationale"
        }))
    }

    #[tokio::test]
    async fn classification_creates_taxonomy_and_ledger_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(prediction_response("Matematika", "Aljabar"))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let item = text_item("2+2=?");
        storage.insert_item(&item).await.unwrap();

        let classifier = ClassifierClient::new(&server.uri(), "key", 5).unwrap();
        let summary = run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(summary.classified, 1);
        assert_eq!(summary.failed, 0);

        // Exactly one new subject, one new topic, one ledger row.
        let subject = storage
            .find_subject_by_name("Matematika")
            .await
            .unwrap()
            .expect("subject created");
        let topics = storage.list_topics_by_subject(&subject.id).await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].name, "Aljabar");
        assert_eq!(storage.count_proposals().await.unwrap(), 1);

        let proposal = storage
            .get_proposal_for_item(&item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(proposal.new_subject_id, subject.id);
        assert_eq!(proposal.new_topic_id, topics[0].id);
        assert_eq!(proposal.rationale, "test rationale");
        assert_eq!(proposal.old_subject_id, None);
    }

    #[tokio::test]
    async fn second_run_classifies_nothing_new() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(prediction_response("Matematika", "Aljabar"))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        storage.insert_item(&text_item("2+2=?")).await.unwrap();
        storage.insert_item(&text_item("3*3=?")).await.unwrap();

        let classifier = ClassifierClient::new(&server.uri(), "key", 5).unwrap();
        run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();
        let count_after_first = storage.count_proposals().await.unwrap();
        assert_eq!(count_after_first, 2);

        let second = run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(storage.count_proposals().await.unwrap(), count_after_first);
    }

    #[tokio::test]
    async fn image_only_item_never_reaches_classifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(prediction_response("x", "y"))
            .expect(0)
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let item = image_item("http://img.example/scan.png");
        storage.insert_item(&item).await.unwrap();

        let classifier = ClassifierClient::new(&server.uri(), "key", 5).unwrap();
        let summary = run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(summary.undecided, 1);
        assert_eq!(summary.classified, 0);

        let proposal = storage
            .get_proposal_for_item(&item.id)
            .await
            .unwrap()
            .unwrap();
        assert!(proposal.is_sentinel());
        assert_eq!(proposal.new_subject_name, UNDECIDED_NAME);

        server.verify().await;
    }

    #[tokio::test]
    async fn classifier_failure_leaves_item_for_next_pass() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let item = text_item("2+2=?");
        storage.insert_item(&item).await.unwrap();

        let classifier = ClassifierClient::new(&server.uri(), "key", 5).unwrap();
        let summary = run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(storage.count_proposals().await.unwrap(), 0);

        // Recovered provider: next pass picks the item up again.
        server.reset().await;
        Mock::given(method("POST"))
            .respond_with(prediction_response("Fisika", "Optika"))
            .mount(&server)
            .await;

        let retry = run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(retry.classified, 1);
        assert!(storage.has_proposal(&item.id).await.unwrap());
    }

    #[tokio::test]
    async fn drift_repair_rewrites_stale_topic_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(prediction_response("Kimia", "Stoikiometri"))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let item = text_item("mol of NaCl?");
        storage.insert_item(&item).await.unwrap();

        let classifier = ClassifierClient::new(&server.uri(), "key", 5).unwrap();
        run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();

        let before = storage
            .get_proposal_for_item(&item.id)
            .await
            .unwrap()
            .unwrap();

        // Simulate a manual taxonomy edit: the staged topic disappears.
        storage.delete_topic(&before.new_topic_id).await.unwrap();

        let summary = run_drift_repair(&storage, &SilentProgress).await.unwrap();
        assert_eq!(summary.repaired, 1);

        let after = storage
            .get_proposal_for_item(&item.id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(after.new_topic_id, before.new_topic_id);
        assert_eq!(after.new_topic_name, "Stoikiometri");

        // The rewritten id resolves in the live taxonomy.
        let topic = storage.get_topic(&after.new_topic_id).await.unwrap().unwrap();
        assert_eq!(topic.subject_id, after.new_subject_id);
    }

    #[tokio::test]
    async fn drift_repair_leaves_live_rows_alone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(prediction_response("Biologi", "Genetika"))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        storage.insert_item(&text_item("DNA question")).await.unwrap();

        let classifier = ClassifierClient::new(&server.uri(), "key", 5).unwrap();
        run_classification_pass(&storage, &classifier, &SilentProgress)
            .await
            .unwrap();

        let summary = run_drift_repair(&storage, &SilentProgress).await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.repaired, 0);
    }
}
