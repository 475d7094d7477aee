// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue on SQLite or MySQL.
//!
//! ```sql
//! CREATE TABLE sync_queue (
//!   seq BIGINT AUTO_INCREMENT PRIMARY KEY,  -- insertion order, FIFO tie-break
//!   id VARCHAR(36) NOT NULL UNIQUE,
//!   node_id VARCHAR(255),                   -- NULL = broadcast partition
//!   operation_kind, entity_type, entity_id, direction, status VARCHAR,
//!   payload LONGTEXT,                       -- JSON as text
//!   priority, retry_count INT,
//!   depends_on TEXT,                        -- JSON array of ids
//!   checksum, last_error, batch_id,
//!   created_at, processed_at, acknowledged_at, next_attempt_at BIGINT,
//!   node_outcomes TEXT                      -- JSON array
//! )
//! ```
//!
//! JSON columns are TEXT because the sqlx `Any` driver has no JSON mapping,
//! and it reads MySQL TEXT as bytes, so text columns are decoded with a
//! `Vec<u8>` fallback.
//!
//! The claim is a conditional `UPDATE ... WHERE status IN (...)`; the row
//! count tells the caller whether it won.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::{debug, info};

use super::{QueueFilter, QueuePage, QueueStore};
use crate::error::{Result, SyncError};
use crate::operation::{
    Direction, NodeOutcome, OperationId, OperationKind, OperationStatus, Partition,
    SyncOperation,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Max ids per `IN (...)` list.
const IN_CHUNK: usize = 500;

const DUE_CLAUSE: &str = "(status = 'pending' OR (status = 'retry_scheduled' \
     AND (next_attempt_at IS NULL OR next_attempt_at <= ?)))";

const COLUMNS: &str = "seq, id, node_id, operation_kind, entity_type, entity_id, payload, \
     priority, direction, depends_on, checksum, status, retry_count, last_error, created_at, \
     processed_at, acknowledged_at, next_attempt_at, batch_id, node_outcomes";

pub struct SqlQueue {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlQueue {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and
    /// create the schema if needed.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // Each connection to an in-memory SQLite database is its own database.
        let max_connections = if is_sqlite && connection_string.contains(":memory:") {
            1
        } else {
            10
        };

        let pool = retry("sql_queue_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| {
                    crate::metrics::record_connection_error("sql");
                    SyncError::Storage(e.to_string())
                })
        })
        .await?;

        let queue = Self { pool, is_sqlite };
        if is_sqlite {
            queue.enable_wal_mode().await?;
        }
        queue.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL queue ready");
        Ok(queue)
    }

    /// Clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&self.pool).await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_queue (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    node_id TEXT,
                    operation_kind TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    direction TEXT NOT NULL,
                    depends_on TEXT NOT NULL DEFAULT '[]',
                    checksum TEXT,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at INTEGER NOT NULL,
                    processed_at INTEGER,
                    acknowledged_at INTEGER,
                    next_attempt_at INTEGER,
                    batch_id TEXT,
                    node_outcomes TEXT NOT NULL DEFAULT '[]'
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_partition ON sync_queue (node_id, status)",
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue (entity_type, entity_id)",
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue (status)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS sync_queue (
                    seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                    id VARCHAR(36) NOT NULL UNIQUE,
                    node_id VARCHAR(255),
                    operation_kind VARCHAR(16) NOT NULL,
                    entity_type VARCHAR(128) NOT NULL,
                    entity_id VARCHAR(255) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    priority INT NOT NULL,
                    direction VARCHAR(32) NOT NULL,
                    depends_on TEXT NOT NULL,
                    checksum VARCHAR(64),
                    status VARCHAR(32) NOT NULL,
                    retry_count INT NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at BIGINT NOT NULL,
                    processed_at BIGINT,
                    acknowledged_at BIGINT,
                    next_attempt_at BIGINT,
                    batch_id VARCHAR(64),
                    node_outcomes TEXT NOT NULL,
                    INDEX idx_partition (node_id, status),
                    INDEX idx_entity (entity_type, entity_id),
                    INDEX idx_status (status)
                )
                "#]
        };

        for sql in statements {
            retry("sql_queue_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(SyncError::from)
            })
            .await?;
        }
        Ok(())
    }

    async fn fetch_one_by_id(&self, id: OperationId) -> Result<Option<SyncOperation>> {
        let sql = format!("SELECT {COLUMNS} FROM sync_queue WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_op).transpose()
    }

    /// Run a `WHERE id = ? AND status = 'processing'` update, turning a
    /// zero row count into `NotFound` or `InvalidTransition`.
    async fn transition_from_processing<'q>(
        &self,
        id: OperationId,
        to: OperationStatus,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<()> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.fetch_one_by_id(id).await? {
            None => Err(SyncError::NotFound(format!("operation {id}"))),
            Some(op) => Err(SyncError::InvalidTransition {
                id,
                from: op.status,
                to,
            }),
        }
    }
}

/// Read a nullable text column: String first (SQLite), then bytes (MySQL).
fn text_col(row: &AnyRow, col: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(col)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(col)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn required_text(row: &AnyRow, col: &str) -> Result<String> {
    text_col(row, col).ok_or_else(|| SyncError::Storage(format!("column '{col}' is empty")))
}

fn int_col(row: &AnyRow, col: &str) -> Option<i64> {
    row.try_get::<Option<i64>, _>(col).ok().flatten()
}

fn row_to_op(row: &AnyRow) -> Result<SyncOperation> {
    let id: OperationId = required_text(row, "id")?.parse()?;
    let operation_kind: OperationKind = required_text(row, "operation_kind")?
        .parse()
        .map_err(|e: SyncError| SyncError::Storage(e.to_string()))?;
    let direction: Direction = required_text(row, "direction")?
        .parse()
        .map_err(|e: SyncError| SyncError::Storage(e.to_string()))?;
    let status: OperationStatus = required_text(row, "status")?.parse()?;

    let payload = serde_json::from_str(&required_text(row, "payload")?)?;
    let depends_on = match text_col(row, "depends_on") {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    let node_outcomes = match text_col(row, "node_outcomes") {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };

    Ok(SyncOperation {
        id,
        seq: int_col(row, "seq").unwrap_or(0) as u64,
        node_id: text_col(row, "node_id"),
        operation_kind,
        entity_type: required_text(row, "entity_type")?,
        entity_id: required_text(row, "entity_id")?,
        payload,
        priority: int_col(row, "priority").unwrap_or(0) as i32,
        direction,
        depends_on,
        checksum: text_col(row, "checksum"),
        status,
        retry_count: int_col(row, "retry_count").unwrap_or(0) as u32,
        last_error: text_col(row, "last_error"),
        created_at: int_col(row, "created_at").unwrap_or(0),
        processed_at: int_col(row, "processed_at"),
        acknowledged_at: int_col(row, "acknowledged_at"),
        next_attempt_at: int_col(row, "next_attempt_at"),
        batch_id: text_col(row, "batch_id"),
        node_outcomes,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// WHERE fragment and binds for a query filter, without its status.
fn scope_clause(filter: &QueueFilter) -> (String, Vec<String>) {
    let mut clauses = vec!["1 = 1".to_string()];
    let mut binds = Vec::new();
    match (&filter.node_id, filter.broadcast_only) {
        (Some(node), _) => {
            clauses.push("node_id = ?".into());
            binds.push(node.clone());
        }
        (None, true) => clauses.push("node_id IS NULL".into()),
        (None, false) => {}
    }
    if let Some(entity_type) = &filter.entity_type {
        clauses.push("entity_type = ?".into());
        binds.push(entity_type.clone());
    }
    if let Some(direction) = filter.direction {
        clauses.push("direction = ?".into());
        binds.push(direction.as_str().to_string());
    }
    (clauses.join(" AND "), binds)
}

#[async_trait]
impl QueueStore for SqlQueue {
    fn backend(&self) -> &'static str {
        "sql"
    }

    async fn insert(&self, op: SyncOperation) -> Result<SyncOperation> {
        let depends_on = serde_json::to_string(&op.depends_on)?;
        let node_outcomes = serde_json::to_string(&op.node_outcomes)?;
        let payload = serde_json::to_string(&op.payload)?;

        sqlx::query(
            "INSERT INTO sync_queue (id, node_id, operation_kind, entity_type, entity_id, payload, \
             priority, direction, depends_on, checksum, status, retry_count, last_error, created_at, \
             processed_at, acknowledged_at, next_attempt_at, batch_id, node_outcomes) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(op.id.to_string())
        .bind(op.node_id.clone())
        .bind(op.operation_kind.as_str())
        .bind(op.entity_type.clone())
        .bind(op.entity_id.clone())
        .bind(payload)
        .bind(i64::from(op.priority))
        .bind(op.direction.as_str())
        .bind(depends_on)
        .bind(op.checksum.clone())
        .bind(op.status.as_str())
        .bind(i64::from(op.retry_count))
        .bind(op.last_error.clone())
        .bind(op.created_at)
        .bind(op.processed_at)
        .bind(op.acknowledged_at)
        .bind(op.next_attempt_at)
        .bind(op.batch_id.clone())
        .bind(node_outcomes)
        .execute(&self.pool)
        .await?;

        self.fetch_one_by_id(op.id)
            .await?
            .ok_or_else(|| SyncError::Storage(format!("operation {} vanished after insert", op.id)))
    }

    async fn get(&self, id: OperationId) -> Result<Option<SyncOperation>> {
        retry("sql_queue_get", &RetryConfig::query(), || self.fetch_one_by_id(id)).await
    }

    async fn next_batch(
        &self,
        partition: &Partition,
        limit: usize,
        now: i64,
    ) -> Result<Vec<SyncOperation>> {
        let _timer = crate::metrics::LatencyTimer::new("sql", "next_batch");
        if limit == 0 {
            return Ok(Vec::new());
        }
        let partition_clause = match partition {
            Partition::Node(_) => "node_id = ?",
            Partition::Broadcast => "node_id IS NULL",
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE {partition_clause} AND {DUE_CLAUSE} \
             ORDER BY priority DESC, created_at ASC, seq ASC LIMIT ? OFFSET ?"
        );

        // Dependency gating happens after the fetch, so keep paging until the
        // batch is full or the partition runs out.
        let page_size = (limit * 2).max(16);
        let mut offset = 0usize;
        let mut batch = Vec::with_capacity(limit);
        loop {
            let mut query = sqlx::query(&sql);
            if let Partition::Node(node_id) = partition {
                query = query.bind(node_id.clone());
            }
            let rows = query
                .bind(now)
                .bind(page_size as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;
            let fetched = rows.len();
            let candidates = rows.iter().map(row_to_op).collect::<Result<Vec<_>>>()?;

            let deps: Vec<OperationId> = candidates
                .iter()
                .flat_map(|op| op.depends_on.iter().copied())
                .collect();
            let statuses = self.statuses(&deps).await?;

            for op in candidates {
                if super::unmet_dependencies(&op, &statuses).is_empty() {
                    batch.push(op);
                    if batch.len() == limit {
                        return Ok(batch);
                    }
                }
            }
            if fetched < page_size {
                return Ok(batch);
            }
            offset += fetched;
        }
    }

    async fn mark_processing(&self, id: OperationId, now: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE sync_queue SET status = 'processing', processed_at = NULL \
             WHERE id = ? AND {DUE_CLAUSE}"
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: OperationId, now: i64) -> Result<()> {
        let query = sqlx::query(
            "UPDATE sync_queue SET status = 'completed', processed_at = ?, acknowledged_at = ?, \
             next_attempt_at = NULL, last_error = NULL WHERE id = ? AND status = 'processing'",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string());
        self.transition_from_processing(id, OperationStatus::Completed, query)
            .await
    }

    async fn schedule_retry(
        &self,
        id: OperationId,
        not_before: i64,
        error: &str,
        now: i64,
    ) -> Result<u32> {
        let query = sqlx::query(
            "UPDATE sync_queue SET status = 'retry_scheduled', retry_count = retry_count + 1, \
             next_attempt_at = ?, last_error = ?, processed_at = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(not_before)
        .bind(error.to_string())
        .bind(now)
        .bind(id.to_string());
        self.transition_from_processing(id, OperationStatus::RetryScheduled, query)
            .await?;

        let op = self
            .fetch_one_by_id(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
        Ok(op.retry_count)
    }

    async fn mark_failed(&self, id: OperationId, error: &str, now: i64) -> Result<()> {
        let query = sqlx::query(
            "UPDATE sync_queue SET status = 'failed', last_error = ?, processed_at = ?, \
             next_attempt_at = NULL WHERE id = ? AND status = 'processing'",
        )
        .bind(error.to_string())
        .bind(now)
        .bind(id.to_string());
        self.transition_from_processing(id, OperationStatus::Failed, query)
            .await
    }

    async fn set_node_outcomes(&self, id: OperationId, outcomes: &[NodeOutcome]) -> Result<()> {
        let json = serde_json::to_string(outcomes)?;
        let result = sqlx::query("UPDATE sync_queue SET node_outcomes = ? WHERE id = ?")
            .bind(json)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 && self.fetch_one_by_id(id).await?.is_none() {
            return Err(SyncError::NotFound(format!("operation {id}")));
        }
        Ok(())
    }

    async fn statuses(&self, ids: &[OperationId]) -> Result<HashMap<OperationId, OperationStatus>> {
        let unique: Vec<OperationId> = ids
            .iter()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut statuses = HashMap::with_capacity(unique.len());

        for chunk in unique.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT id, status FROM sync_queue WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id.to_string());
            }
            for row in query.fetch_all(&self.pool).await? {
                let id: OperationId = required_text(&row, "id")?.parse()?;
                let status: OperationStatus = required_text(&row, "status")?.parse()?;
                statuses.insert(id, status);
            }
        }
        Ok(statuses)
    }

    async fn find_newer_outbound(
        &self,
        entity_type: &str,
        entity_id: &str,
        since: i64,
    ) -> Result<Option<SyncOperation>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE direction = 'central_to_local' \
             AND entity_type = ? AND entity_id = ? AND created_at > ? \
             AND status IN ('pending', 'processing', 'completed') \
             ORDER BY created_at DESC, seq DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(entity_type.to_string())
            .bind(entity_id.to_string())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_op).transpose()
    }

    async fn blocked_by_failure(&self, limit: usize) -> Result<Vec<(SyncOperation, OperationId)>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_queue \
             WHERE status IN ('pending', 'retry_scheduled') AND depends_on <> '[]' \
             ORDER BY priority DESC, created_at ASC, seq ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let waiting = rows.iter().map(row_to_op).collect::<Result<Vec<_>>>()?;

        let deps: Vec<OperationId> = waiting
            .iter()
            .flat_map(|op| op.depends_on.iter().copied())
            .collect();
        let statuses = self.statuses(&deps).await?;

        Ok(waiting
            .into_iter()
            .filter_map(|op| {
                let failed = op
                    .depends_on
                    .iter()
                    .find(|dep| statuses.get(dep) == Some(&OperationStatus::Failed))
                    .copied()?;
                Some((op, failed))
            })
            .take(limit)
            .collect())
    }

    async fn query(&self, filter: &QueueFilter) -> Result<QueuePage> {
        let (page, page_size) = filter.paging();
        let (scope, binds) = scope_clause(filter);

        let hist_sql = format!(
            "SELECT status, COUNT(*) AS cnt FROM sync_queue WHERE {scope} GROUP BY status"
        );
        let mut hist_query = sqlx::query(&hist_sql);
        for value in &binds {
            hist_query = hist_query.bind(value.clone());
        }
        let mut histogram = BTreeMap::new();
        for row in hist_query.fetch_all(&self.pool).await? {
            let status: OperationStatus = required_text(&row, "status")?.parse()?;
            let count = int_col(&row, "cnt").unwrap_or(0) as u64;
            histogram.insert(status, count);
        }

        let total = match filter.status {
            Some(status) => histogram.get(&status).copied().unwrap_or(0),
            None => histogram.values().sum(),
        };

        let status_clause = if filter.status.is_some() { " AND status = ?" } else { "" };
        let items_sql = format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE {scope}{status_clause} \
             ORDER BY created_at DESC, seq DESC LIMIT ? OFFSET ?"
        );
        let mut items_query = sqlx::query(&items_sql);
        for value in &binds {
            items_query = items_query.bind(value.clone());
        }
        if let Some(status) = filter.status {
            items_query = items_query.bind(status.as_str());
        }
        let rows = items_query
            .bind(page_size as i64)
            .bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(row_to_op).collect::<Result<Vec<_>>>()?;

        Ok(QueuePage {
            items,
            total,
            page,
            page_size,
            histogram,
        })
    }

    async fn purge_terminal(&self, older_than: i64) -> Result<u64> {
        let live_rows = sqlx::query(
            "SELECT depends_on FROM sync_queue \
             WHERE status NOT IN ('completed', 'failed') AND depends_on <> '[]'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut referenced: HashSet<String> = HashSet::new();
        for row in &live_rows {
            if let Some(json) = text_col(row, "depends_on") {
                let deps: Vec<OperationId> = serde_json::from_str(&json)?;
                referenced.extend(deps.iter().map(ToString::to_string));
            }
        }

        let candidates = sqlx::query(
            "SELECT id FROM sync_queue WHERE status IN ('completed', 'failed') \
             AND COALESCE(processed_at, created_at) < ?",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        let doomed: Vec<String> = candidates
            .iter()
            .filter_map(|row| text_col(row, "id"))
            .filter(|id| !referenced.contains(id))
            .collect();

        let mut purged = 0;
        for chunk in doomed.chunks(IN_CHUNK) {
            let sql = format!(
                "DELETE FROM sync_queue WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id.clone());
            }
            purged += query.execute(&self.pool).await?.rows_affected();
        }
        debug!(purged, kept_referenced = candidates.len() - doomed.len(), "Purged terminal operations");
        Ok(purged)
    }

    async fn release(&self, id: OperationId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'pending', processed_at = NULL \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue SET status = 'pending' \
             WHERE status = 'processing' AND processed_at IS NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
