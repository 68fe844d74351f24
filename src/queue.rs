//! Durable pending-write queue.
//!
//! Order records created while the sink is unreachable wait here, in FIFO
//! position order, until a drain pass submits them. Failures are
//! rescheduled with bounded exponential backoff and move to a dead-letter
//! state after `MAX_SYNC_ATTEMPTS`; they are then only retried via an
//! explicit requeue. A drain pass applies all of its outcomes in a single
//! transaction so a crash mid-pass observes the previous queue or the new
//! one, never a partial mix.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::error::{RelayError, Result};
use crate::models::OrderRecord;

pub const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
pub const MAX_RETRY_DELAY_MS: i64 = 300_000;
/// Attempts before an entry stops retrying and dead-letters.
pub const MAX_SYNC_ATTEMPTS: i64 = 8;

const STATUS_PENDING: &str = "pending";
const STATUS_DEAD_LETTER: &str = "dead_letter";

/// One queue entry: the record plus its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedOrder {
    pub queue_id: i64,
    pub record: OrderRecord,
    pub attempts: i64,
    pub retry_delay_ms: i64,
    pub last_error: Option<String>,
}

/// Outcome of one submission attempt inside a drain pass.
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    Failed(RelayError),
}

/// Summary of a completed drain pass.
#[derive(Debug, Default, PartialEq)]
pub struct DrainReport {
    pub attempted: usize,
    pub submitted: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

// ---------------------------------------------------------------------------
// Retry scheduling
// ---------------------------------------------------------------------------

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter)).to_rfc3339()
}

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

/// Append a record at the tail of the queue. The insert is a single
/// statement, so the persisted queue is never observed half-written.
pub fn enqueue(db: &DbState, record: &OrderRecord) -> Result<()> {
    let payload = serde_json::to_string(record)?;
    let conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO pending_queue (record_id, payload, status, retry_delay_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            record.id.to_string(),
            payload,
            STATUS_PENDING,
            DEFAULT_RETRY_DELAY_MS
        ],
    )?;
    info!(record_id = %record.id, client = %record.client_name, "order queued for sync");
    Ok(())
}

fn rows_with_status(db: &DbState, status: &str) -> Result<Vec<QueuedOrder>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT id, payload, attempts, retry_delay_ms, last_error
         FROM pending_queue WHERE status = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![status], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (queue_id, payload, attempts, retry_delay_ms, last_error) = row?;
        let record: OrderRecord = serde_json::from_str(&payload)
            .map_err(|e| RelayError::Storage(format!("corrupt queue payload {queue_id}: {e}")))?;
        entries.push(QueuedOrder {
            queue_id,
            record,
            attempts,
            retry_delay_ms,
            last_error,
        });
    }
    Ok(entries)
}

/// Current queue contents in FIFO submission order, without mutation.
pub fn snapshot(db: &DbState) -> Result<Vec<QueuedOrder>> {
    rows_with_status(db, STATUS_PENDING)
}

/// Entries that have exhausted their retry budget.
pub fn dead_letters(db: &DbState) -> Result<Vec<QueuedOrder>> {
    rows_with_status(db, STATUS_DEAD_LETTER)
}

pub fn pending_len(db: &DbState) -> Result<usize> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_queue WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Pending entries whose backoff window has elapsed, FIFO order.
fn due_entries(db: &DbState) -> Result<Vec<QueuedOrder>> {
    let now = Utc::now().to_rfc3339();
    let mut entries = snapshot(db)?;
    let conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let mut due_ids = std::collections::HashSet::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id FROM pending_queue
             WHERE status = 'pending'
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get::<_, i64>(0))?;
        for row in rows {
            due_ids.insert(row?);
        }
    }
    drop(conn);
    entries.retain(|e| due_ids.contains(&e.queue_id));
    Ok(entries)
}

/// Run one drain pass: submit every due entry in FIFO order via `submit`,
/// then persist the pass's outcome in a single transaction. Successes are
/// deleted; failures keep their payload untouched, get their backoff
/// doubled, and dead-letter once `MAX_SYNC_ATTEMPTS` is reached.
///
/// Callers must serialize drain passes; the coordinator's single-slot
/// guard enforces that.
pub async fn drain<S, F>(db: &DbState, mut submit: S) -> Result<DrainReport>
where
    S: FnMut(OrderRecord) -> F,
    F: Future<Output = SubmitOutcome>,
{
    let due = due_entries(db)?;
    if due.is_empty() {
        return Ok(DrainReport::default());
    }

    debug!(count = due.len(), "draining pending queue");

    let mut report = DrainReport {
        attempted: due.len(),
        ..DrainReport::default()
    };
    let mut outcomes: Vec<(QueuedOrder, SubmitOutcome)> = Vec::with_capacity(due.len());

    for entry in due {
        let outcome = submit(entry.record.clone()).await;
        outcomes.push((entry, outcome));
    }

    let mut conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let tx = conn.transaction()?;
    for (entry, outcome) in outcomes {
        match outcome {
            SubmitOutcome::Accepted => {
                tx.execute(
                    "DELETE FROM pending_queue WHERE id = ?1",
                    params![entry.queue_id],
                )?;
                report.submitted += 1;
                info!(record_id = %entry.record.id, "queued order submitted");
            }
            SubmitOutcome::Failed(err) => {
                let attempts = entry.attempts + 1;
                if attempts >= MAX_SYNC_ATTEMPTS {
                    tx.execute(
                        "UPDATE pending_queue
                         SET status = ?1, attempts = ?2, last_error = ?3,
                             updated_at = datetime('now')
                         WHERE id = ?4",
                        params![STATUS_DEAD_LETTER, attempts, err.to_string(), entry.queue_id],
                    )?;
                    report.dead_lettered += 1;
                    warn!(
                        record_id = %entry.record.id,
                        attempts,
                        error = %err,
                        "order moved to dead-letter after exhausting retries"
                    );
                } else {
                    let next_delay =
                        (entry.retry_delay_ms * 2).clamp(DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS);
                    let next_at = schedule_next_retry(entry.retry_delay_ms, entry.queue_id);
                    tx.execute(
                        "UPDATE pending_queue
                         SET attempts = ?1, retry_delay_ms = ?2, next_attempt_at = ?3,
                             last_error = ?4, updated_at = datetime('now')
                         WHERE id = ?5",
                        params![attempts, next_delay, next_at, err.to_string(), entry.queue_id],
                    )?;
                    report.failed += 1;
                    warn!(
                        record_id = %entry.record.id,
                        attempts,
                        error = %err,
                        "order submission failed; retry scheduled"
                    );
                }
            }
        }
    }
    tx.commit()?;

    Ok(report)
}

/// Put every dead-lettered entry back into rotation with a fresh retry
/// budget. Explicit user action only; nothing calls this automatically.
pub fn requeue_dead_letters(db: &DbState) -> Result<usize> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let changed = conn.execute(
        "UPDATE pending_queue
         SET status = 'pending', attempts = 0, retry_delay_ms = ?1,
             next_attempt_at = NULL, updated_at = datetime('now')
         WHERE status = 'dead_letter'",
        params![DEFAULT_RETRY_DELAY_MS],
    )?;
    if changed > 0 {
        info!(count = changed, "dead-lettered orders requeued");
    }
    Ok(changed)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{OrderDraft, OrderItem, Priority};

    fn draft(client: &str) -> OrderDraft {
        OrderDraft {
            order_kind: "BULK ORDER".to_string(),
            client_name: client.to_string(),
            deadline_date: "2025-11-28".to_string(),
            deadline_time: "17:00".to_string(),
            location: "Orchard Branch".to_string(),
            priority: Priority::Normal,
            items: vec![OrderItem::new("Boxes", 10, "boxes")],
            notes: "fragile".to_string(),
        }
    }

    fn enqueue_one(db: &DbState, client: &str) -> OrderRecord {
        let record = OrderRecord::from_draft(draft(client));
        enqueue(db, &record).unwrap();
        record
    }

    #[test]
    fn test_enqueue_snapshot_preserves_fifo_order() {
        let db = db::init_in_memory();
        enqueue_one(&db, "First");
        enqueue_one(&db, "Second");
        enqueue_one(&db, "Third");

        let snap = snapshot(&db).unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].record.client_name, "First");
        assert_eq!(snap[2].record.client_name, "Third");

        // snapshot does not mutate
        assert_eq!(pending_len(&db).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drain_removes_successes_keeps_failures_unchanged() {
        let db = db::init_in_memory();
        enqueue_one(&db, "Wins");
        let failing = enqueue_one(&db, "Loses");

        let report = drain(&db, |record| {
            let fail = record.client_name == "Loses";
            async move {
                if fail {
                    SubmitOutcome::Failed(RelayError::Transport("connection refused".into()))
                } else {
                    SubmitOutcome::Accepted
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 0);

        let snap = snapshot(&db).unwrap();
        assert_eq!(snap.len(), 1, "exactly the failures remain queued");
        let kept = &snap[0];
        assert_eq!(kept.record.client_name, "Loses");
        assert_eq!(kept.record.id, failing.id, "payload untouched");
        assert_eq!(kept.record.items[0].quantity, 10);
        assert_eq!(kept.attempts, 1);
        assert_eq!(kept.last_error.as_deref(), Some("transport failure: connection refused"));
    }

    #[tokio::test]
    async fn test_failed_entry_backs_off_and_is_not_immediately_due() {
        let db = db::init_in_memory();
        enqueue_one(&db, "Acme Corp");

        let report = drain(&db, |_| async {
            SubmitOutcome::Failed(RelayError::Transport("timeout".into()))
        })
        .await
        .unwrap();
        assert_eq!(report.failed, 1);

        // Still queued, but scheduled in the future: a second pass right
        // away finds nothing due.
        assert_eq!(pending_len(&db).unwrap(), 1);
        let report = drain(&db, |_| async { SubmitOutcome::Accepted }).await.unwrap();
        assert_eq!(report.attempted, 0, "backoff window defers the retry");
    }

    #[tokio::test]
    async fn test_exhausted_retries_move_to_dead_letter() {
        let db = db::init_in_memory();
        enqueue_one(&db, "Doomed");

        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            // Clear the backoff window so every pass retries immediately.
            {
                let conn = db.conn.lock().unwrap();
                conn.execute("UPDATE pending_queue SET next_attempt_at = NULL", [])
                    .unwrap();
            }
            let report = drain(&db, |_| async {
                SubmitOutcome::Failed(RelayError::Transport("unreachable".into()))
            })
            .await
            .unwrap();

            if attempt < MAX_SYNC_ATTEMPTS {
                assert_eq!(report.failed, 1, "attempt {attempt} retries");
            } else {
                assert_eq!(report.dead_lettered, 1, "final attempt dead-letters");
            }
        }

        assert_eq!(pending_len(&db).unwrap(), 0);
        let dead = dead_letters(&db).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, MAX_SYNC_ATTEMPTS);

        // Dead-lettered entries are never drained implicitly.
        let report = drain(&db, |_| async { SubmitOutcome::Accepted }).await.unwrap();
        assert_eq!(report.attempted, 0);

        // Explicit requeue restores them with a fresh budget.
        assert_eq!(requeue_dead_letters(&db).unwrap(), 1);
        let snap = snapshot(&db).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_is_a_noop() {
        let db = db::init_in_memory();
        let report = drain(&db, |_| async { SubmitOutcome::Accepted }).await.unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        assert_eq!(deterministic_jitter_ms(42), deterministic_jitter_ms(42));
        for seed in [-5_i64, 0, 1, 699, 700, 12345] {
            let j = deterministic_jitter_ms(seed);
            assert!((50..750).contains(&j), "jitter {j} out of range");
        }
    }
}
