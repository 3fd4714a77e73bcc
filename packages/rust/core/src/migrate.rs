//! Migration driver: apply staged classifications to items, then clean up
//! orphaned staging topics and duplicate items.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use examflow_shared::{ExamflowError, Result, SENTINEL_TOPIC_NAME, UNDECIDED_NAME};
use examflow_storage::Storage;

use crate::progress::PassProgress;

/// Summary of one migration pass.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    /// Items updated to a real proposal target.
    pub migrated: usize,
    /// Items routed to the Undecided bucket (sentinel or no proposal).
    pub undecided: usize,
    /// Orphaned staging topics removed afterwards.
    pub topics_removed: usize,
    /// Zero-attempt duplicate items removed afterwards.
    pub duplicates_removed: usize,
    pub elapsed: Duration,
}

/// Summary of the sentinel-cleanup pass.
#[derive(Debug, Clone)]
pub struct SentinelCleanupSummary {
    /// Sentinel ledger rows deleted.
    pub proposals_removed: u64,
    /// Whether the placeholder topic was removed.
    pub topic_removed: bool,
}

/// Apply every item's ledger proposal, then run orphan cleanup and dedup.
///
/// An item with a sentinel proposal, or with no proposal at all, routes to
/// the Undecided bucket: "never classified" and "explicitly unclassifiable"
/// are identical at migration time.
#[instrument(skip_all)]
pub async fn run_migration_pass(
    storage: &Storage,
    progress: &dyn PassProgress,
) -> Result<MigrationSummary> {
    let start = Instant::now();

    progress.phase("Resolving Undecided bucket");
    let undecided_subject = storage.find_or_create_subject(UNDECIDED_NAME).await?;
    let undecided_topic = storage
        .find_or_create_topic(UNDECIDED_NAME, &undecided_subject.id)
        .await?;

    progress.phase("Migrating items");
    let items = storage.list_items().await?;
    let total = items.len();
    info!(items = total, "starting migration pass");

    let mut summary = MigrationSummary {
        migrated: 0,
        undecided: 0,
        topics_removed: 0,
        duplicates_removed: 0,
        elapsed: Duration::ZERO,
    };

    // Topic ids seen in the ledger; candidates for orphan cleanup after all
    // items have moved.
    let mut staged_topic_ids: BTreeSet<String> = BTreeSet::new();

    for (i, item) in items.iter().enumerate() {
        progress.item(i + 1, total, &item.id.to_string());

        match storage.get_proposal_for_item(&item.id).await? {
            Some(proposal) if !proposal.is_sentinel() => {
                staged_topic_ids.insert(proposal.new_topic_id.clone());
                storage
                    .update_item_taxonomy(&item.id, &proposal.new_subject_id, &proposal.new_topic_id)
                    .await?;
                summary.migrated += 1;
            }
            Some(proposal) => {
                staged_topic_ids.insert(proposal.new_topic_id.clone());
                storage
                    .update_item_taxonomy(&item.id, &undecided_subject.id, &undecided_topic.id)
                    .await?;
                summary.undecided += 1;
            }
            None => {
                storage
                    .update_item_taxonomy(&item.id, &undecided_subject.id, &undecided_topic.id)
                    .await?;
                summary.undecided += 1;
            }
        }
    }

    progress.phase("Removing orphaned staging topics");
    for topic_id in &staged_topic_ids {
        if storage.get_topic(topic_id).await?.is_none() {
            continue;
        }
        if storage.topic_item_count(topic_id).await? > 0 {
            continue;
        }
        match storage.delete_topic(topic_id).await {
            Ok(()) => summary.topics_removed += 1,
            Err(ExamflowError::TopicInUse { topic_id, .. }) => {
                // Referenced between the count and the delete; keep it.
                warn!(topic_id = %topic_id, "topic gained references, skipping removal");
            }
            Err(e) => return Err(e),
        }
    }

    progress.phase("Deduplicating items");
    summary.duplicates_removed = dedup_items(storage).await?;

    summary.elapsed = start.elapsed();
    info!(
        migrated = summary.migrated,
        undecided = summary.undecided,
        topics_removed = summary.topics_removed,
        duplicates_removed = summary.duplicates_removed,
        elapsed_ms = summary.elapsed.as_millis(),
        "migration pass complete"
    );
    Ok(summary)
}

/// Remove zero-attempt duplicates within each (source, year, content) group.
///
/// Items with recorded attempts are never deleted. When no copy in a group
/// has attempts, the oldest copy survives.
async fn dedup_items(storage: &Storage) -> Result<usize> {
    let mut removed = 0usize;

    for group in storage.list_duplicate_groups().await? {
        let any_attempted = group.iter().any(|item| item.attempt_count > 0);

        // Groups are ordered oldest-first; without attempts the head survives.
        let keep_first_unattempted = !any_attempted;

        for (i, item) in group.iter().enumerate() {
            if item.attempt_count > 0 {
                continue;
            }
            if keep_first_unattempted && i == 0 {
                continue;
            }
            if storage.delete_item_if_unattempted(&item.id).await? {
                info!(item_id = %item.id, source = %item.source_label, "removed duplicate item");
                removed += 1;
            }
        }
    }

    Ok(removed)
}

/// Delete all sentinel ledger rows, then the now-empty placeholder topic.
///
/// This is the only path that ever deletes proposals. The placeholder topic
/// delete stays guarded: if something still references it, only the topic
/// removal is skipped.
#[instrument(skip_all)]
pub async fn run_sentinel_cleanup(storage: &Storage) -> Result<SentinelCleanupSummary> {
    let proposals_removed = storage
        .delete_proposals_with_topic_name(SENTINEL_TOPIC_NAME)
        .await?;

    let mut topic_removed = false;
    if let Some(subject) = storage.find_subject_by_name(UNDECIDED_NAME).await? {
        if let Some(placeholder) = storage.find_topic(SENTINEL_TOPIC_NAME, &subject.id).await? {
            match storage.delete_topic(&placeholder.id).await {
                Ok(()) => topic_removed = true,
                Err(ExamflowError::TopicInUse { item_count, .. }) => {
                    warn!(item_count, "placeholder topic still referenced, keeping it");
                }
                Err(e) => return Err(e),
            }
        }
    }

    info!(proposals_removed, topic_removed, "sentinel cleanup complete");
    Ok(SentinelCleanupSummary {
        proposals_removed,
        topic_removed,
    })
}
