//! Taxonomy sync: diff a subject's desired topic set against what is stored
//! and apply it with guarded removals.

use tracing::{info, instrument, warn};

use examflow_shared::{ExamflowError, Result};
use examflow_storage::Storage;

/// Plain set difference between desired and stored topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDiff {
    /// Desired but not stored; inserted unconditionally.
    pub to_create: Vec<String>,
    /// Stored but not desired; deleted only when unreferenced.
    pub to_remove: Vec<String>,
}

/// Result of applying a topic sync to one subject.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub created: usize,
    pub removed: usize,
    /// Removals blocked by the referenced-topic guard: (name, item count).
    pub blocked: Vec<(String, u64)>,
}

/// Compute `to_create = desired − current` and `to_remove = current − desired`.
/// Input order is preserved.
pub fn diff_topics(desired: &[String], current: &[String]) -> TopicDiff {
    let to_create = desired
        .iter()
        .filter(|name| !current.contains(name))
        .cloned()
        .collect();
    let to_remove = current
        .iter()
        .filter(|name| !desired.contains(name))
        .cloned()
        .collect();
    TopicDiff {
        to_create,
        to_remove,
    }
}

/// Reconcile a subject's stored topics with `desired`, in one transaction.
///
/// Creations always apply. A removal blocked by item references aborts only
/// that removal and is reported in the summary, never the whole sync.
#[instrument(skip_all, fields(subject = subject_name))]
pub async fn sync_subject_topics(
    storage: &Storage,
    subject_name: &str,
    desired: &[String],
) -> Result<SyncSummary> {
    let subject = storage.find_or_create_subject(subject_name).await?;

    let current: Vec<String> = storage
        .list_topics_by_subject(&subject.id)
        .await?
        .into_iter()
        .map(|t| t.name)
        .collect();

    let diff = diff_topics(desired, &current);
    info!(
        create = diff.to_create.len(),
        remove = diff.to_remove.len(),
        "applying topic sync"
    );

    let mut summary = SyncSummary {
        created: 0,
        removed: 0,
        blocked: Vec::new(),
    };

    storage.begin().await?;
    let apply = async {
        for name in &diff.to_create {
            storage.find_or_create_topic(name, &subject.id).await?;
            summary.created += 1;
        }

        for name in &diff.to_remove {
            let Some(topic) = storage.find_topic(name, &subject.id).await? else {
                continue;
            };
            match storage.delete_topic(&topic.id).await {
                Ok(()) => summary.removed += 1,
                Err(ExamflowError::TopicInUse { item_count, .. }) => {
                    warn!(topic = %name, item_count, "topic still referenced, keeping it");
                    summary.blocked.push((name.clone(), item_count));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
    .await;

    match apply {
        Ok(()) => {
            storage.commit().await?;
            Ok(summary)
        }
        Err(e) => {
            storage.rollback().await?;
            Err(e)
        }
    }
}
