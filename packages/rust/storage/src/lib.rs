//! libSQL storage layer for the Examflow pipeline.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the taxonomy
//! (subjects/topics), exam items, the classification staging ledger, and the
//! OCR extraction cache.
//!
//! **Write discipline:**
//! - Taxonomy writes are create-then-recover: `INSERT .. ON CONFLICT DO
//!   NOTHING` followed by a re-read, so concurrent identical calls converge
//!   on one row.
//! - Ledger inserts are one-per-item; a duplicate insert is a no-op.
//! - Cache writes are last-writer-wins upserts.

mod migrations;

use std::path::Path;

use chrono::Utc;
use examflow_shared::{
    AnswerOption, ClassificationProposal, ContentSegment, ExamflowError, Item, ItemId, Result,
    Subject, Topic,
};
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ExamflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (reporting tools).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ExamflowError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ExamflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Begin an explicit transaction.
    pub async fn begin(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("BEGIN", params![])
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Commit the current transaction.
    pub async fn commit(&self) -> Result<()> {
        self.conn
            .execute("COMMIT", params![])
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Roll back the current transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.conn
            .execute("ROLLBACK", params![])
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subject operations
    // -----------------------------------------------------------------------

    /// Find a subject by display name (case-insensitive), or create it with
    /// `alternate_name = name`. Safe under concurrent invocation.
    pub async fn find_or_create_subject(&self, name: &str) -> Result<Subject> {
        if let Some(subject) = self.find_subject_by_name(name).await? {
            return Ok(subject);
        }

        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO subjects (id, name, alternate_name, year, created_at)
                 VALUES (?1, ?2, ?2, NULL, ?3)
                 ON CONFLICT DO NOTHING",
                params![id.as_str(), name, now.as_str()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        // Re-read: either our row or the one a concurrent writer won with.
        self.find_subject_by_name(name)
            .await?
            .ok_or_else(|| ExamflowError::Storage(format!("subject '{name}' vanished after insert")))
    }

    /// Look up a subject by display name, case-insensitively. When several
    /// subjects share the name, the earliest-created one is returned.
    pub async fn find_subject_by_name(&self, name: &str) -> Result<Option<Subject>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, alternate_name, year FROM subjects
                 WHERE name = ?1 COLLATE NOCASE
                 ORDER BY created_at, id LIMIT 1",
                params![name],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subject(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    /// List all subjects, by name.
    pub async fn list_subjects(&self) -> Result<Vec<Subject>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, alternate_name, year FROM subjects ORDER BY name, created_at",
                params![],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_subject(&row)?);
        }
        Ok(results)
    }

    /// Get a subject by id.
    pub async fn get_subject(&self, id: &str) -> Result<Option<Subject>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, alternate_name, year FROM subjects WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subject(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Topic operations
    // -----------------------------------------------------------------------

    /// Find a topic by name (case-insensitive) scoped to `subject_id`, or
    /// create it. Safe under concurrent invocation.
    pub async fn find_or_create_topic(&self, name: &str, subject_id: &str) -> Result<Topic> {
        if let Some(topic) = self.find_topic(name, subject_id).await? {
            return Ok(topic);
        }

        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO topics (id, name, subject_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT DO NOTHING",
                params![id.as_str(), name, subject_id, now.as_str()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        self.find_topic(name, subject_id).await?.ok_or_else(|| {
            ExamflowError::Storage(format!("topic '{name}' vanished after insert"))
        })
    }

    /// Look up a topic by name within a subject, case-insensitively.
    pub async fn find_topic(&self, name: &str, subject_id: &str) -> Result<Option<Topic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, subject_id FROM topics
                 WHERE subject_id = ?1 AND name = ?2 COLLATE NOCASE",
                params![subject_id, name],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_topic(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    /// Get a topic by id.
    pub async fn get_topic(&self, id: &str) -> Result<Option<Topic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, subject_id FROM topics WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_topic(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    /// List all topics under a subject, by name.
    pub async fn list_topics_by_subject(&self, subject_id: &str) -> Result<Vec<Topic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, subject_id FROM topics WHERE subject_id = ?1 ORDER BY name",
                params![subject_id],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_topic(&row)?);
        }
        Ok(results)
    }

    /// Count items referencing a topic.
    pub async fn topic_item_count(&self, topic_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM items WHERE topic_id = ?1",
                params![topic_id],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<u64>(0)
                .map_err(|e| ExamflowError::Storage(e.to_string()))?),
            _ => Ok(0),
        }
    }

    /// Delete a topic, refusing when any item still references it.
    pub async fn delete_topic(&self, topic_id: &str) -> Result<()> {
        self.check_writable()?;
        let item_count = self.topic_item_count(topic_id).await?;
        if item_count > 0 {
            return Err(ExamflowError::TopicInUse {
                topic_id: topic_id.to_string(),
                item_count,
            });
        }
        self.conn
            .execute("DELETE FROM topics WHERE id = ?1", params![topic_id])
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Item operations
    // -----------------------------------------------------------------------

    /// Insert a new item record.
    pub async fn insert_item(&self, item: &Item) -> Result<()> {
        self.check_writable()?;
        let content_json = serde_json::to_string(&item.content)
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        let answers_json = serde_json::to_string(&item.answers)
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO items (id, content_json, answers_json, subject_id, topic_id,
                                    source_label, year, attempt_count, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    item.id.to_string(),
                    content_json.as_str(),
                    answers_json.as_str(),
                    item.subject_id.as_deref(),
                    item.topic_id.as_deref(),
                    item.source_label.as_str(),
                    item.year,
                    item.attempt_count,
                    item.content_hash.as_str(),
                    item.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get an item by id.
    pub async fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        let mut rows = self
            .conn
            .query(
                &format!("{ITEM_SELECT} WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    /// List all items in stable creation order.
    pub async fn list_items(&self) -> Result<Vec<Item>> {
        let mut rows = self
            .conn
            .query(
                &format!("{ITEM_SELECT} ORDER BY created_at, id"),
                params![],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_item(&row)?);
        }
        Ok(results)
    }

    /// List items with no ledger proposal, in stable creation order.
    pub async fn list_unprocessed_items(&self) -> Result<Vec<Item>> {
        let mut rows = self
            .conn
            .query(
                "SELECT i.id, i.content_json, i.answers_json, i.subject_id, i.topic_id,
                        i.source_label, i.year, i.attempt_count, i.content_hash, i.created_at
                 FROM items i
                 LEFT JOIN proposals p ON p.item_id = i.id
                 WHERE p.id IS NULL
                 ORDER BY i.created_at, i.id",
                params![],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_item(&row)?);
        }
        Ok(results)
    }

    /// Replace an item's content segments and answers (extraction pass).
    pub async fn update_item_segments(
        &self,
        id: &ItemId,
        content: &[ContentSegment],
        answers: &[AnswerOption],
        content_hash: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let content_json =
            serde_json::to_string(content).map_err(|e| ExamflowError::Storage(e.to_string()))?;
        let answers_json =
            serde_json::to_string(answers).map_err(|e| ExamflowError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE items SET content_json = ?1, answers_json = ?2, content_hash = ?3
                 WHERE id = ?4",
                params![
                    content_json.as_str(),
                    answers_json.as_str(),
                    content_hash,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Point an item at a resolved subject/topic pair (migration driver only).
    pub async fn update_item_taxonomy(
        &self,
        id: &ItemId,
        subject_id: &str,
        topic_id: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE items SET subject_id = ?1, topic_id = ?2 WHERE id = ?3",
                params![subject_id, topic_id, id.to_string()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Record a solve attempt against an item.
    pub async fn increment_attempts(&self, id: &ItemId) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE items SET attempt_count = attempt_count + 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Delete an item only if it has zero recorded attempts.
    /// Returns whether a row was deleted.
    pub async fn delete_item_if_unattempted(&self, id: &ItemId) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM items WHERE id = ?1 AND attempt_count = 0",
                params![id.to_string()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Groups of 2+ items sharing scope (source_label, year) and byte-identical
    /// primary content, ordered oldest-first within each group.
    pub async fn list_duplicate_groups(&self) -> Result<Vec<Vec<Item>>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "{ITEM_SELECT} ORDER BY source_label, year, content_hash, created_at, id"
                ),
                params![],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let mut groups: Vec<Vec<Item>> = Vec::new();
        let mut current: Vec<Item> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let item = row_to_item(&row)?;
            let same_group = current.first().is_some_and(|head: &Item| {
                head.source_label == item.source_label
                    && head.year == item.year
                    && head.content_hash == item.content_hash
            });
            if same_group {
                current.push(item);
            } else {
                if current.len() > 1 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
                current.push(item);
            }
        }
        if current.len() > 1 {
            groups.push(current);
        }
        Ok(groups)
    }

    // -----------------------------------------------------------------------
    // Staging ledger operations
    // -----------------------------------------------------------------------

    /// Whether the ledger already holds a proposal for this item.
    pub async fn has_proposal(&self, item_id: &ItemId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM proposals WHERE item_id = ?1",
                params![item_id.to_string()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        Ok(matches!(rows.next().await, Ok(Some(_))))
    }

    /// Append a proposal. A second proposal for the same item is a no-op
    /// ("already done"). Returns whether a row was inserted.
    pub async fn record_proposal(&self, proposal: &ClassificationProposal) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO proposals (id, item_id, old_subject_id, old_subject_name,
                                        old_topic_id, old_topic_name, new_subject_id,
                                        new_subject_name, new_topic_id, new_topic_name,
                                        rationale, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(item_id) DO NOTHING",
                params![
                    proposal.id.as_str(),
                    proposal.item_id.to_string(),
                    proposal.old_subject_id.as_deref(),
                    proposal.old_subject_name.as_deref(),
                    proposal.old_topic_id.as_deref(),
                    proposal.old_topic_name.as_deref(),
                    proposal.new_subject_id.as_str(),
                    proposal.new_subject_name.as_str(),
                    proposal.new_topic_id.as_str(),
                    proposal.new_topic_name.as_str(),
                    proposal.rationale.as_str(),
                    proposal.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Get the ledger proposal for an item, if any.
    pub async fn get_proposal_for_item(
        &self,
        item_id: &ItemId,
    ) -> Result<Option<ClassificationProposal>> {
        let mut rows = self
            .conn
            .query(
                &format!("{PROPOSAL_SELECT} WHERE item_id = ?1"),
                params![item_id.to_string()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_proposal(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    /// List all ledger proposals in creation order.
    pub async fn list_proposals(&self) -> Result<Vec<ClassificationProposal>> {
        let mut rows = self
            .conn
            .query(
                &format!("{PROPOSAL_SELECT} ORDER BY created_at, id"),
                params![],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_proposal(&row)?);
        }
        Ok(results)
    }

    /// Count ledger rows.
    pub async fn count_proposals(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM proposals", params![])
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row
                .get::<u64>(0)
                .map_err(|e| ExamflowError::Storage(e.to_string()))?),
            _ => Ok(0),
        }
    }

    /// Rewrite a proposal's resolved target (drift repair only).
    pub async fn rewrite_proposal_target(
        &self,
        proposal_id: &str,
        new_subject_id: &str,
        new_subject_name: &str,
        new_topic_id: &str,
        new_topic_name: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE proposals SET new_subject_id = ?1, new_subject_name = ?2,
                                      new_topic_id = ?3, new_topic_name = ?4
                 WHERE id = ?5",
                params![
                    new_subject_id,
                    new_subject_name,
                    new_topic_id,
                    new_topic_name,
                    proposal_id
                ],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Delete all sentinel proposals. Returns the number removed.
    pub async fn delete_proposals_with_topic_name(&self, topic_name: &str) -> Result<u64> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM proposals WHERE new_topic_name = ?1",
                params![topic_name],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Extraction cache operations
    // -----------------------------------------------------------------------

    /// Get a cached extraction result by normalized source URL.
    pub async fn get_extraction(&self, source_url: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT text FROM extraction_cache WHERE source_url = ?1",
                params![source_url],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let text: String = row
                    .get(0)
                    .map_err(|e| ExamflowError::Storage(e.to_string()))?;
                Ok(Some(text))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ExamflowError::Storage(e.to_string())),
        }
    }

    /// Store an extraction result (upserts; last writer wins).
    pub async fn put_extraction(&self, source_url: &str, text: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO extraction_cache (source_url, text, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_url) DO UPDATE SET
                   text = excluded.text,
                   created_at = excluded.created_at",
                params![source_url, text, now.as_str()],
            )
            .await
            .map_err(|e| ExamflowError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ITEM_SELECT: &str = "SELECT id, content_json, answers_json, subject_id, topic_id,
        source_label, year, attempt_count, content_hash, created_at FROM items";

const PROPOSAL_SELECT: &str = "SELECT id, item_id, old_subject_id, old_subject_name,
        old_topic_id, old_topic_name, new_subject_id, new_subject_name,
        new_topic_id, new_topic_name, rationale, created_at FROM proposals";

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| ExamflowError::Storage(e.to_string()))
}

fn parse_timestamp(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| ExamflowError::Storage(format!("invalid date: {e}")))
}

fn row_to_subject(row: &libsql::Row) -> Result<Subject> {
    Ok(Subject {
        id: get_string(row, 0)?,
        name: get_string(row, 1)?,
        alternate_name: get_string(row, 2)?,
        year: row.get::<i64>(3).ok(),
    })
}

fn row_to_topic(row: &libsql::Row) -> Result<Topic> {
    Ok(Topic {
        id: get_string(row, 0)?,
        name: get_string(row, 1)?,
        subject_id: get_string(row, 2)?,
    })
}

fn row_to_item(row: &libsql::Row) -> Result<Item> {
    let content_json = get_string(row, 1)?;
    let answers_json = get_string(row, 2)?;
    Ok(Item {
        id: get_string(row, 0)?
            .parse()
            .map_err(|e| ExamflowError::Storage(format!("invalid item id: {e}")))?,
        content: serde_json::from_str(&content_json)
            .map_err(|e| ExamflowError::Storage(format!("invalid content_json: {e}")))?,
        answers: serde_json::from_str(&answers_json)
            .map_err(|e| ExamflowError::Storage(format!("invalid answers_json: {e}")))?,
        subject_id: row.get::<String>(3).ok(),
        topic_id: row.get::<String>(4).ok(),
        source_label: get_string(row, 5)?,
        year: row
            .get::<i64>(6)
            .map_err(|e| ExamflowError::Storage(e.to_string()))?,
        attempt_count: row
            .get::<i64>(7)
            .map_err(|e| ExamflowError::Storage(e.to_string()))?,
        content_hash: get_string(row, 8)?,
        created_at: parse_timestamp(&get_string(row, 9)?)?,
    })
}

fn row_to_proposal(row: &libsql::Row) -> Result<ClassificationProposal> {
    Ok(ClassificationProposal {
        id: get_string(row, 0)?,
        item_id: get_string(row, 1)?
            .parse()
            .map_err(|e| ExamflowError::Storage(format!("invalid item id: {e}")))?,
        old_subject_id: row.get::<String>(2).ok(),
        old_subject_name: row.get::<String>(3).ok(),
        old_topic_id: row.get::<String>(4).ok(),
        old_topic_name: row.get::<String>(5).ok(),
        new_subject_id: get_string(row, 6)?,
        new_subject_name: get_string(row, 7)?,
        new_topic_id: get_string(row, 8)?,
        new_topic_name: get_string(row, 9)?,
        rationale: get_string(row, 10)?,
        created_at: parse_timestamp(&get_string(row, 11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use examflow_shared::{ContentSegment, content_hash};
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ef_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn make_item(text: &str, source: &str, year: i64) -> Item {
        let content = vec![ContentSegment::text(text)];
        let hash = content_hash(&content);
        Item {
            id: ItemId::new(),
            content,
            answers: vec![],
            subject_id: None,
            topic_id: None,
            source_label: source.into(),
            year,
            attempt_count: 0,
            content_hash: hash,
            created_at: Utc::now(),
        }
    }

    fn make_proposal(item_id: &ItemId, subject: (&str, &str), topic: (&str, &str)) -> ClassificationProposal {
        ClassificationProposal {
            id: Uuid::now_v7().to_string(),
            item_id: item_id.clone(),
            old_subject_id: None,
            old_subject_name: None,
            old_topic_id: None,
            old_topic_name: None,
            new_subject_id: subject.0.into(),
            new_subject_name: subject.1.into(),
            new_topic_id: topic.0.into(),
            new_topic_name: topic.1.into(),
            rationale: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ef_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn find_or_create_subject_is_idempotent() {
        let storage = test_storage().await;

        let first = storage
            .find_or_create_subject("Matematika")
            .await
            .expect("create");
        assert_eq!(first.alternate_name, "Matematika");

        // Same name, different case: must converge on the same row.
        let second = storage
            .find_or_create_subject("MATEMATIKA")
            .await
            .expect("find");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn find_or_create_topic_converges_on_one_row() {
        let storage = test_storage().await;
        let subject = storage.find_or_create_subject("Fisika").await.unwrap();

        let mut ids = std::collections::HashSet::new();
        for _ in 0..5 {
            let topic = storage
                .find_or_create_topic("Kinematika", &subject.id)
                .await
                .expect("find_or_create");
            ids.insert(topic.id);
        }
        assert_eq!(ids.len(), 1);

        let topics = storage.list_topics_by_subject(&subject.id).await.unwrap();
        assert_eq!(topics.len(), 1);
    }

    #[tokio::test]
    async fn topics_with_same_name_under_different_subjects() {
        let storage = test_storage().await;
        let math = storage.find_or_create_subject("Matematika").await.unwrap();
        let physics = storage.find_or_create_subject("Fisika").await.unwrap();

        let t1 = storage.find_or_create_topic("Vektor", &math.id).await.unwrap();
        let t2 = storage
            .find_or_create_topic("Vektor", &physics.id)
            .await
            .unwrap();
        assert_ne!(t1.id, t2.id);
    }

    #[tokio::test]
    async fn delete_topic_guarded_by_item_reference() {
        let storage = test_storage().await;
        let subject = storage.find_or_create_subject("Kimia").await.unwrap();
        let topic = storage
            .find_or_create_topic("Stoikiometri", &subject.id)
            .await
            .unwrap();

        let item = make_item("mol of NaCl?", "UTBK", 2023);
        storage.insert_item(&item).await.unwrap();
        storage
            .update_item_taxonomy(&item.id, &subject.id, &topic.id)
            .await
            .unwrap();

        let result = storage.delete_topic(&topic.id).await;
        assert!(matches!(
            result,
            Err(ExamflowError::TopicInUse { item_count: 1, .. })
        ));

        // Topic and item reference unchanged.
        assert!(storage.get_topic(&topic.id).await.unwrap().is_some());
        let reread = storage.get_item(&item.id).await.unwrap().unwrap();
        assert_eq!(reread.topic_id.as_deref(), Some(topic.id.as_str()));

        // Unreferenced topic deletes fine.
        let empty = storage
            .find_or_create_topic("Termokimia", &subject.id)
            .await
            .unwrap();
        storage.delete_topic(&empty.id).await.expect("delete empty");
        assert!(storage.get_topic(&empty.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_roundtrip() {
        let storage = test_storage().await;
        let mut item = make_item("2+2=?", "UTBK", 2023);
        item.answers = vec![
            AnswerOption::new('A', "3", false),
            AnswerOption::new('B', "4", true),
        ];
        storage.insert_item(&item).await.unwrap();

        let found = storage.get_item(&item.id).await.unwrap().expect("found");
        assert_eq!(found.text_content(), "2+2=?");
        assert_eq!(found.answers.len(), 2);
        assert_eq!(found.answers[1].key, 'B');
        assert!(found.answers[1].is_correct);
        assert_eq!(found.subject_id, None);
    }

    #[tokio::test]
    async fn proposal_dedup_and_unprocessed_listing() {
        let storage = test_storage().await;
        let a = make_item("first", "UTBK", 2023);
        let b = make_item("second", "UTBK", 2023);
        storage.insert_item(&a).await.unwrap();
        storage.insert_item(&b).await.unwrap();

        assert_eq!(storage.list_unprocessed_items().await.unwrap().len(), 2);

        let proposal = make_proposal(&a.id, ("s1", "Matematika"), ("t1", "Aljabar"));
        assert!(storage.record_proposal(&proposal).await.unwrap());
        assert!(storage.has_proposal(&a.id).await.unwrap());

        // Second write for the same item is a no-op, not an error.
        let dup = make_proposal(&a.id, ("s2", "Fisika"), ("t2", "Optika"));
        assert!(!storage.record_proposal(&dup).await.unwrap());
        assert_eq!(storage.count_proposals().await.unwrap(), 1);

        let stored = storage.get_proposal_for_item(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.new_subject_name, "Matematika");

        let unprocessed = storage.list_unprocessed_items().await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].id, b.id);
    }

    #[tokio::test]
    async fn proposal_rewrite_target() {
        let storage = test_storage().await;
        let item = make_item("rewrite me", "UTBK", 2023);
        storage.insert_item(&item).await.unwrap();

        let proposal = make_proposal(&item.id, ("s1", "Matematika"), ("stale", "Aljabar"));
        storage.record_proposal(&proposal).await.unwrap();

        storage
            .rewrite_proposal_target(&proposal.id, "s1", "Matematika", "fresh", "Aljabar")
            .await
            .unwrap();

        let stored = storage
            .get_proposal_for_item(&item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.new_topic_id, "fresh");
    }

    #[tokio::test]
    async fn extraction_cache_roundtrip() {
        let storage = test_storage().await;
        let url = "https://drive.google.com/uc?export=download&id=abc123";

        assert!(storage.get_extraction(url).await.unwrap().is_none());

        storage.put_extraction(url, "2+2=?").await.unwrap();
        assert_eq!(
            storage.get_extraction(url).await.unwrap().as_deref(),
            Some("2+2=?")
        );

        // Empty results are cached too.
        storage.put_extraction("https://broken.example/x", "").await.unwrap();
        assert_eq!(
            storage
                .get_extraction("https://broken.example/x")
                .await
                .unwrap()
                .as_deref(),
            Some("")
        );
    }

    #[tokio::test]
    async fn duplicate_groups_and_guarded_item_delete() {
        let storage = test_storage().await;
        let a = make_item("same text", "UTBK", 2023);
        let mut b = make_item("same text", "UTBK", 2023);
        b.attempt_count = 0;
        let c = make_item("same text", "SNBT", 2023); // different scope
        let d = make_item("other text", "UTBK", 2023);
        for item in [&a, &b, &c, &d] {
            storage.insert_item(item).await.unwrap();
        }
        storage.increment_attempts(&a.id).await.unwrap();

        let groups = storage.list_duplicate_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);

        // Item with attempts is never deleted by the guarded delete.
        assert!(!storage.delete_item_if_unattempted(&a.id).await.unwrap());
        assert!(storage.delete_item_if_unattempted(&b.id).await.unwrap());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ef_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.find_or_create_subject("Matematika").await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.find_or_create_subject("Fisika").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
