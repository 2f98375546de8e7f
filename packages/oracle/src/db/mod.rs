//! Postgres task store
//!
//! Each trait operation is one transaction. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent senders never see the same row,
//! and signature recording locks the task row before counting so the quorum
//! release happens exactly once.

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use tracing::{debug, error};

use crate::error::StoreError;
use crate::store::{
    status_after_signatures, BatchOutcome, ScanPosition, SignatureOutcome, TaskStore,
    UpsertOutcome,
};
use crate::types::{ChainCursor, EventKind, Fingerprint, RelayTask, Status};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

const PK_MATCH: &str = "source_chain_id = $1 AND source_tx_hash = $2 AND log_index = $3";

/// Task store backed by Postgres
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
    quorum: usize,
}

impl PgTaskStore {
    pub fn new(pool: PgPool, quorum: usize) -> Self {
        Self {
            pool,
            quorum: quorum.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn load_signatures(
    conn: &mut PgConnection,
    fingerprint: &Fingerprint,
) -> Result<Vec<SignatureRow>, StoreError> {
    let (chain, hash, index) = fingerprint_key(fingerprint);
    let rows = sqlx::query_as::<_, SignatureRow>(&format!(
        "SELECT validator_id, signature FROM validator_signatures WHERE {} \
         ORDER BY validator_id",
        PK_MATCH
    ))
    .bind(chain)
    .bind(hash)
    .bind(index)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

async fn hydrate(conn: &mut PgConnection, rows: Vec<TaskRow>) -> Result<Vec<RelayTask>, StoreError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let signatures = load_signatures(conn, &row.fingerprint()?).await?;
        tasks.push(row.into_task(signatures)?);
    }
    Ok(tasks)
}

/// Insert a task row if its fingerprint is new; returns whether it was
async fn insert_task(conn: &mut PgConnection, task: &RelayTask) -> Result<bool, StoreError> {
    let (chain, hash, index) = fingerprint_key(&task.fingerprint);
    let payload =
        serde_json::to_value(&task.payload).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let result = sqlx::query(
        r#"
        INSERT INTO relay_tasks (source_chain_id, source_tx_hash, log_index, event_type,
            destination_chain_id, payload, source_block, source_confirmations, status,
            created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (source_chain_id, source_tx_hash, log_index) DO NOTHING
        "#,
    )
    .bind(chain)
    .bind(hash)
    .bind(index)
    .bind(task.event_type.as_str())
    .bind(task.destination_chain_id as i64)
    .bind(payload)
    .bind(task.source_block as i64)
    .bind(task.source_confirmations as i64)
    .bind(task.status.as_str())
    .bind(task.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn record_signature_in(
    conn: &mut PgConnection,
    fingerprint: &Fingerprint,
    validator_id: &str,
    signature: &Bytes,
    quorum: usize,
) -> Result<SignatureOutcome, StoreError> {
    let (chain, hash, index) = fingerprint_key(fingerprint);

    // Row lock serializes concurrent signers of the same task
    let status: Option<String> = sqlx::query_scalar(&format!(
        "SELECT status FROM relay_tasks WHERE {} FOR UPDATE",
        PK_MATCH
    ))
    .bind(chain)
    .bind(&hash)
    .bind(index)
    .fetch_optional(&mut *conn)
    .await?;
    let status: Status = status
        .ok_or(StoreError::NotFound(*fingerprint))?
        .parse()
        .map_err(|e: crate::types::UnknownName| StoreError::Corrupt(e.to_string()))?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO validator_signatures (source_chain_id, source_tx_hash, log_index,
            validator_id, signature)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(chain)
    .bind(&hash)
    .bind(index)
    .bind(validator_id)
    .bind(signature.as_ref())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM validator_signatures WHERE {}",
        PK_MATCH
    ))
    .bind(chain)
    .bind(&hash)
    .bind(index)
    .fetch_one(&mut *conn)
    .await?;
    let count = count as usize;

    if !inserted {
        return Ok(SignatureOutcome::Duplicate { count });
    }

    let next = status_after_signatures(status, count, quorum);
    if next != status {
        sqlx::query(&format!(
            "UPDATE relay_tasks SET status = $4, updated_at = NOW() WHERE {}",
            PK_MATCH
        ))
        .bind(chain)
        .bind(&hash)
        .bind(index)
        .bind(next.as_str())
        .execute(&mut *conn)
        .await?;
        debug!(fingerprint = %fingerprint, count, "Quorum reached, task released");
        return Ok(SignatureOutcome::Released);
    }

    Ok(SignatureOutcome::Recorded { count })
}

/// Upsert one task and record the signatures it carries
async fn upsert_in(
    conn: &mut PgConnection,
    task: &RelayTask,
    quorum: usize,
) -> Result<(UpsertOutcome, usize), StoreError> {
    let outcome = if insert_task(conn, task).await? {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Duplicate
    };

    let mut released = 0;
    for (validator, signature) in &task.signatures {
        if record_signature_in(conn, &task.fingerprint, validator, signature, quorum).await?
            == SignatureOutcome::Released
        {
            released += 1;
        }
    }
    Ok((outcome, released))
}

impl PgTaskStore {
    /// Explain why a conditional update touched no row
    async fn transition_error(&self, fingerprint: &Fingerprint, to: Status) -> StoreError {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let current: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(&format!(
            "SELECT status FROM relay_tasks WHERE {}",
            PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .fetch_optional(&self.pool)
        .await;

        match current {
            Ok(None) => StoreError::NotFound(*fingerprint),
            Ok(Some(status)) => match status.parse::<Status>() {
                Ok(from) => StoreError::InvalidTransition {
                    fingerprint: *fingerprint,
                    from,
                    to,
                },
                Err(e) => StoreError::Corrupt(e.to_string()),
            },
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn upsert(&self, task: &RelayTask) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (outcome, _) = upsert_in(&mut tx, task, self.quorum).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_next_pending(
        &self,
        destination_chain_id: u64,
        sender_id: &str,
    ) -> Result<Option<RelayTask>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE relay_tasks
            SET status = 'claimed', claimed_by = $2, attempt_count = attempt_count + 1,
                last_attempt_at = NOW(), updated_at = NOW()
            WHERE (source_chain_id, source_tx_hash, log_index) = (
                SELECT source_chain_id, source_tx_hash, log_index
                FROM relay_tasks
                WHERE destination_chain_id = $1 AND status IN ('pending', 'ready_to_send')
                ORDER BY created_at, source_block, log_index
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(destination_chain_id as i64)
        .bind(sender_id)
        .fetch_optional(&mut *tx)
        .await?;

        let task = match row {
            Some(row) => {
                let signatures = load_signatures(&mut tx, &row.fingerprint()?).await?;
                Some(row.into_task(signatures)?)
            }
            None => None,
        };
        tx.commit().await?;
        Ok(task)
    }

    async fn record_signature(
        &self,
        fingerprint: &Fingerprint,
        validator_id: &str,
        signature: Bytes,
    ) -> Result<SignatureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome =
            record_signature_in(&mut tx, fingerprint, validator_id, &signature, self.quorum)
                .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        tx_hash: B256,
        nonce: u64,
    ) -> Result<(), StoreError> {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let updated = sqlx::query(&format!(
            "UPDATE relay_tasks SET destination_tx_hash = $4, destination_nonce = $5, \
             last_attempt_at = NOW(), updated_at = NOW() \
             WHERE {} AND status = 'claimed'",
            PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .bind(tx_hash.to_string())
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(fingerprint, Status::Claimed).await);
        }
        Ok(())
    }

    async fn record_rejection(
        &self,
        fingerprint: &Fingerprint,
        reason: &str,
    ) -> Result<u32, StoreError> {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let total: Option<i32> = sqlx::query_scalar(&format!(
            "UPDATE relay_tasks SET rejection_count = rejection_count + 1, error_message = $4, \
             updated_at = NOW() \
             WHERE {} AND status = 'claimed' \
             RETURNING rejection_count",
            PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match total {
            Some(total) => u32::try_from(total)
                .map_err(|_| StoreError::Corrupt(format!("negative rejection_count: {}", total))),
            None => Err(self.transition_error(fingerprint, Status::Claimed).await),
        }
    }

    async fn mark_sent(&self, fingerprint: &Fingerprint, tx_hash: B256) -> Result<(), StoreError> {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let updated = sqlx::query(&format!(
            "UPDATE relay_tasks SET status = 'sent', destination_tx_hash = $4, \
             last_attempt_at = NOW(), updated_at = NOW() \
             WHERE {} AND status IN ('claimed', 'sent')",
            PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .bind(tx_hash.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(fingerprint, Status::Sent).await);
        }
        Ok(())
    }

    async fn mark_confirmed(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let updated = sqlx::query(&format!(
            "UPDATE relay_tasks SET status = 'confirmed', updated_at = NOW() \
             WHERE {} AND status = 'sent'",
            PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(fingerprint, Status::Confirmed).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, fingerprint: &Fingerprint, reason: &str) -> Result<(), StoreError> {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let updated = sqlx::query(&format!(
            "UPDATE relay_tasks SET status = 'failed', error_message = $4, updated_at = NOW() \
             WHERE {} AND status NOT IN ('confirmed', 'failed')",
            PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(fingerprint = %fingerprint, error = %e, "Failed to mark task failed");
            e
        })?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(fingerprint, Status::Failed).await);
        }
        Ok(())
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<RelayTask>, StoreError> {
        let (chain, hash, index) = fingerprint_key(fingerprint);
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM relay_tasks WHERE {}",
            TASK_COLUMNS, PK_MATCH
        ))
        .bind(chain)
        .bind(hash)
        .bind(index)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(hydrate(&mut conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn load_cursor(
        &self,
        chain_id: u64,
        event_type: EventKind,
    ) -> Result<Option<ChainCursor>, StoreError> {
        let row = sqlx::query_as::<_, CursorRow>(
            "SELECT chain_id, event_type, last_processed_block FROM chain_cursors \
             WHERE chain_id = $1 AND event_type = $2",
        )
        .bind(chain_id as i64)
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChainCursor::try_from).transpose()
    }

    async fn commit_batch(
        &self,
        cursor: &ChainCursor,
        tasks: &[RelayTask],
    ) -> Result<BatchOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut outcome = BatchOutcome::default();
        for task in tasks {
            let (upserted, released) = upsert_in(&mut tx, task, self.quorum).await?;
            match upserted {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::Duplicate => outcome.duplicates += 1,
            }
            outcome.released += released;
        }

        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain_id, event_type, last_processed_block)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, event_type) DO UPDATE SET
                last_processed_block = GREATEST(chain_cursors.last_processed_block,
                                                EXCLUDED.last_processed_block),
                updated_at = NOW()
            "#,
        )
        .bind(cursor.chain_id as i64)
        .bind(cursor.event_type.as_str())
        .bind(cursor.last_processed_block as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn in_flight(
        &self,
        destination_chain_id: u64,
        sender_id: &str,
    ) -> Result<Vec<RelayTask>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM relay_tasks \
             WHERE destination_chain_id = $1 AND claimed_by = $2 \
             AND status IN ('claimed', 'sent') \
             ORDER BY created_at, source_block, log_index",
            TASK_COLUMNS
        ))
        .bind(destination_chain_id as i64)
        .bind(sender_id)
        .fetch_all(&mut *conn)
        .await?;

        hydrate(&mut conn, rows).await
    }

    async fn count_by_status(&self) -> Result<Vec<(Status, u64)>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM relay_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: Vec<(Status, u64)> = Status::ALL.into_iter().map(|s| (s, 0)).collect();
        for (status, count) in rows {
            let status: Status = status
                .parse()
                .map_err(|e: crate::types::UnknownName| StoreError::Corrupt(e.to_string()))?;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 = count as u64;
            }
        }
        Ok(counts)
    }

    async fn list_by_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<RelayTask>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM relay_tasks WHERE status = $1 \
             ORDER BY created_at DESC LIMIT $2",
            TASK_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        hydrate(&mut conn, rows).await
    }

    async fn awaiting_signature(
        &self,
        chain_id: u64,
        event_type: EventKind,
        validator_id: &str,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<RelayTask>, StoreError> {
        // Hex hashes of equal length sort like the bytes they encode, and
        // "" sorts before every hash
        let (block, hash, index) = match after {
            Some(p) => (p.source_block as i64, p.tx_hash.to_string(), p.log_index as i64),
            None => (-1, String::new(), -1),
        };

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {} FROM relay_tasks t
            WHERE t.status = 'awaiting_quorum'
              AND t.source_chain_id = $1 AND t.event_type = $2
              AND NOT EXISTS (
                  SELECT 1 FROM validator_signatures s
                  WHERE s.source_chain_id = t.source_chain_id
                    AND s.source_tx_hash = t.source_tx_hash
                    AND s.log_index = t.log_index
                    AND s.validator_id = $3
              )
              AND (t.source_block, t.source_tx_hash, t.log_index) > ($4, $5, $6)
            ORDER BY t.source_block, t.source_tx_hash, t.log_index
            LIMIT $7
            "#,
            TASK_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(event_type.as_str())
        .bind(validator_id)
        .bind(block)
        .bind(hash)
        .bind(index)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        hydrate(&mut conn, rows).await
    }
}
