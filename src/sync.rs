//! Sync coordinator.
//!
//! Owns the `Idle -> Draining -> Idle` cycle: drain the pending-write
//! queue against the webhook, then refresh the cached remote snapshot.
//! A single-slot atomic guard keeps at most one cycle in flight; extra
//! requests are coalesced. Cycle triggers: an online edge from the
//! connectivity observer, an explicit refresh, or a new local submission.

use chrono::Utc;
use rusqlite::params;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::SheetClient;
use crate::connectivity::Transition;
use crate::db::DbState;
use crate::error::{RelayError, Result};
use crate::models::{FulfillmentState, OrderDraft, OrderRecord, Priority, RecordId, SyncState};
use crate::queue::{self, DrainReport, SubmitOutcome};
use crate::AppContext;

/// Shared coordinator state.
pub struct SyncCoordinatorState {
    /// Single-slot drain guard: true while a cycle is in flight.
    drain_slot: AtomicBool,
    /// Background loop run flag.
    pub loop_running: AtomicBool,
    pub last_sync: Mutex<Option<String>>,
}

impl SyncCoordinatorState {
    pub fn new() -> Self {
        Self {
            drain_slot: AtomicBool::new(false),
            loop_running: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }
}

impl Default for SyncCoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the drain slot when the cycle ends, even on early return.
struct DrainSlotGuard<'a>(&'a AtomicBool);

impl Drop for DrainSlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one cycle request.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// True when another cycle was already in flight and this request
    /// was skipped.
    pub coalesced: bool,
    pub drain: DrainReport,
    /// Whether the cached snapshot was replaced this cycle.
    pub refreshed: bool,
}

// ---------------------------------------------------------------------------
// Remote snapshot cache
// ---------------------------------------------------------------------------

/// Replace the cached snapshot wholesale, inside one transaction, so a
/// crash observes the old cache or the new one.
pub fn replace_cached_orders(db: &DbState, records: &[OrderRecord]) -> Result<()> {
    let mut conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cached_orders", [])?;
    for (position, record) in records.iter().enumerate() {
        let Some(sheet_row) = record.id.remote_row() else {
            // Only remote-confirmed records belong in the cache.
            continue;
        };
        let fulfillment = match record.fulfillment_state {
            FulfillmentState::Completed => "Completed",
            FulfillmentState::Pending => "Pending",
        };
        tx.execute(
            "INSERT INTO cached_orders
                (position, sheet_row, formatted_timestamp, fulfillment_status,
                 order_kind, client_name, location, priority, item_count, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                position as i64,
                sheet_row,
                record.formatted_timestamp,
                fulfillment,
                record.order_kind,
                record.client_name,
                record.location,
                record.priority.as_str(),
                record.item_count as i64,
                record.notes,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Read the cached snapshot in display order (newest first).
pub fn cached_orders(db: &DbState) -> Result<Vec<OrderRecord>> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| RelayError::Storage(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT sheet_row, formatted_timestamp, fulfillment_status, order_kind,
                client_name, location, priority, item_count, notes
         FROM cached_orders ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(OrderRecord {
            id: RecordId::Remote(row.get::<_, i64>(0)?),
            sync_state: SyncState::Synced,
            fulfillment_state: if row
                .get::<_, String>(2)?
                .eq_ignore_ascii_case("completed")
            {
                FulfillmentState::Completed
            } else {
                FulfillmentState::Pending
            },
            client_request_id: String::new(),
            timestamp: String::new(),
            formatted_timestamp: row.get(1)?,
            order_kind: row.get(3)?,
            client_name: row.get(4)?,
            deadline_date: String::new(),
            deadline_time: String::new(),
            location: row.get(5)?,
            priority: Priority::parse(&row.get::<_, String>(6)?),
            items: Vec::new(),
            item_count: row.get::<_, i64>(7)?.max(0) as u32,
            notes: row.get(8)?,
        })
    })?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Run one cycle with injected submit/fetch operations. `run_sync_cycle`
/// binds these to the webhook client; tests bind fakes.
pub async fn run_cycle_with<S, SF, F, FF>(
    ctx: &AppContext,
    submit: S,
    fetch: F,
    refresh_reads: bool,
) -> Result<CycleReport>
where
    S: FnMut(OrderRecord) -> SF,
    SF: Future<Output = SubmitOutcome>,
    F: FnOnce() -> FF,
    FF: Future<Output = Result<Vec<OrderRecord>>>,
{
    let state = &ctx.sync_state;
    if state
        .drain_slot
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("sync cycle already in flight; request coalesced");
        return Ok(CycleReport {
            coalesced: true,
            ..CycleReport::default()
        });
    }
    let _slot = DrainSlotGuard(&state.drain_slot);

    let drain = queue::drain(&ctx.db, submit).await?;

    // Refresh the read model after draining. A fetch failure is absorbed:
    // the previous cache keeps serving the display list.
    let mut refreshed = false;
    if refresh_reads || drain.submitted > 0 {
        match fetch().await {
            Ok(mut records) => {
                // The sheet returns oldest-first; display wants newest-first.
                records.reverse();
                replace_cached_orders(&ctx.db, &records)?;
                refreshed = true;
            }
            Err(e) => {
                warn!(error = %e, "remote fetch failed; keeping cached snapshot");
            }
        }
    }

    if let Ok(mut guard) = state.last_sync.lock() {
        *guard = Some(Utc::now().to_rfc3339());
    }

    Ok(CycleReport {
        coalesced: false,
        drain,
        refreshed,
    })
}

/// Run one full cycle against the configured webhook endpoint.
pub async fn run_sync_cycle(ctx: &AppContext, refresh_reads: bool) -> Result<CycleReport> {
    let client = ctx.sheet_client()?;
    run_cycle_with(
        ctx,
        |record| {
            let client = &client;
            async move {
                match client.create(&record).await {
                    Ok(()) => SubmitOutcome::Accepted,
                    Err(e) => SubmitOutcome::Failed(e),
                }
            }
        },
        || {
            let client = &client;
            async move { client.fetch_all().await }
        },
        refresh_reads,
    )
    .await
}

/// Explicit user-refresh trigger: drain whatever is due and re-fetch.
pub async fn force_sync(ctx: &AppContext) -> Result<CycleReport> {
    run_sync_cycle(ctx, true).await
}

// ---------------------------------------------------------------------------
// Order operations
// ---------------------------------------------------------------------------

/// Create an order: stamp the draft, persist it to the pending queue, and
/// kick a catch-up cycle when the network looks up. The record is visible
/// in `merged_history` immediately either way.
pub async fn create_order(ctx: &AppContext, draft: OrderDraft) -> Result<OrderRecord> {
    let record = OrderRecord::from_draft(draft);
    queue::enqueue(&ctx.db, &record)?;

    if ctx.observer.is_online() {
        match run_sync_cycle(ctx, true).await {
            Ok(report) if !report.coalesced => {
                debug!(
                    submitted = report.drain.submitted,
                    "catch-up cycle after submission"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "catch-up cycle failed; order stays queued"),
        }
    }

    Ok(record)
}

/// The one authoritative display list: locally queued records first
/// (newest first), then the cached remote snapshot, no duplicate
/// identities.
pub fn merged_history(ctx: &AppContext) -> Result<Vec<OrderRecord>> {
    let mut seen: HashSet<RecordId> = HashSet::new();
    let mut merged = Vec::new();

    let mut local: Vec<OrderRecord> = queue::snapshot(&ctx.db)?
        .into_iter()
        .map(|entry| entry.record)
        .collect();
    local.reverse();
    for record in local {
        if seen.insert(record.id.clone()) {
            merged.push(record);
        }
    }

    for record in cached_orders(&ctx.db)? {
        if seen.insert(record.id.clone()) {
            merged.push(record);
        }
    }

    Ok(merged)
}

/// Mark a synced order's logistics task completed.
///
/// Only records sourced from the remote snapshot carry a sheet row, and a
/// completed record is terminal — both preconditions surface before any
/// network call. Row addressing can go stale if the sheet is edited
/// between fetch and update (accepted limitation); on failure the cache
/// is refetched so the display reflects current rows.
pub async fn complete_order(ctx: &AppContext, id: &RecordId) -> Result<()> {
    let cached = cached_orders(&ctx.db)?;
    let target = cached.iter().find(|r| &r.id == id);

    let record = match (id, target) {
        (RecordId::Local(_), _) => {
            return Err(RelayError::Configuration(
                "order has not synced yet; wait for sync before completing".to_string(),
            ));
        }
        (_, None) => {
            return Err(RelayError::Configuration(format!(
                "order {id} is not in the current snapshot"
            )));
        }
        (_, Some(record)) => record,
    };

    if record.fulfillment_state == FulfillmentState::Completed {
        return Err(RelayError::Configuration(format!(
            "order {id} is already completed"
        )));
    }
    let row = record
        .id
        .remote_row()
        .ok_or_else(|| RelayError::Configuration(format!("order {id} has no sheet row")))?;

    // Optimistic removal: the sheet excludes completed rows from fetches,
    // so dropping it mirrors what the next snapshot will say.
    let remaining: Vec<OrderRecord> = cached.into_iter().filter(|r| &r.id != id).collect();
    replace_cached_orders(&ctx.db, &remaining)?;

    let client = ctx.sheet_client()?;
    if let Err(e) = client.mark_completed(row).await {
        warn!(row, error = %e, "mark-completed failed; refetching snapshot");
        match client.fetch_all().await {
            Ok(mut records) => {
                records.reverse();
                let _ = replace_cached_orders(&ctx.db, &records);
            }
            Err(fetch_err) => {
                warn!(error = %fetch_err, "snapshot refetch also failed; cache may lag");
            }
        }
        return Err(e);
    }

    info!(row, "order completed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Status summary
// ---------------------------------------------------------------------------

/// Point-in-time sync status for display.
#[derive(Debug, serde::Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending: usize,
    pub dead_lettered: usize,
    pub last_sync: Option<String>,
}

pub fn sync_status(ctx: &AppContext) -> Result<SyncStatus> {
    let last_sync = ctx
        .sync_state
        .last_sync
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or(None);
    Ok(SyncStatus {
        is_online: ctx.observer.is_online(),
        pending: queue::pending_len(&ctx.db)?,
        dead_lettered: queue::dead_letters(&ctx.db)?.len(),
        last_sync,
    })
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background loop: probe connectivity every `interval_secs`,
/// feed the observer, and run one cycle per online edge plus a drain pass
/// on steady online ticks so backoff timers eventually fire.
pub fn start_sync_loop(ctx: Arc<AppContext>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    ctx.sync_state.loop_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {interval_secs}s)");

        loop {
            if !ctx.sync_state.loop_running.load(Ordering::SeqCst) {
                info!("Sync loop stopped");
                break;
            }

            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !ctx.sync_state.loop_running.load(Ordering::SeqCst) {
                break;
            }

            // No endpoint configured yet: nothing to probe or drain.
            let client = match ctx.sheet_client() {
                Ok(c) => c,
                Err(_) => continue,
            };

            let online = client.probe().await;
            let edge = ctx.observer.report(online);

            if !online {
                continue;
            }

            // Refresh the read model on the online edge; steady ticks only
            // drain due retries and fetch when something was submitted.
            let refresh = edge == Some(Transition::Online);
            match run_sync_cycle(&ctx, refresh).await {
                Ok(report) if report.drain.submitted > 0 => {
                    info!(
                        submitted = report.drain.submitted,
                        failed = report.drain.failed,
                        "sync cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "sync cycle failed"),
            }
        }
    })
}

/// Signal the background loop to exit after its current tick.
pub fn stop_sync_loop(ctx: &AppContext) {
    ctx.sync_state.loop_running.store(false, Ordering::SeqCst);
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderItem, SyncState as RecordSyncState};
    use crate::AppContext;
    use std::sync::atomic::AtomicUsize;

    fn ctx() -> AppContext {
        AppContext::for_tests()
    }

    fn draft(client: &str, kind: &str) -> OrderDraft {
        OrderDraft {
            order_kind: kind.to_string(),
            client_name: client.to_string(),
            deadline_date: "2025-11-28".to_string(),
            deadline_time: "17:00".to_string(),
            location: "Orchard Branch".to_string(),
            priority: Priority::Urgent,
            items: vec![OrderItem::new("Boxes", 10, "boxes")],
            notes: String::new(),
        }
    }

    fn remote_record(row: i64, client: &str) -> OrderRecord {
        OrderRecord {
            id: RecordId::Remote(row),
            sync_state: RecordSyncState::Synced,
            fulfillment_state: FulfillmentState::Pending,
            client_request_id: String::new(),
            timestamp: String::new(),
            formatted_timestamp: "11/24/2025, 5:03 PM".to_string(),
            order_kind: "BULK ORDER".to_string(),
            client_name: client.to_string(),
            deadline_date: String::new(),
            deadline_time: String::new(),
            location: "Orchard Branch".to_string(),
            priority: Priority::Normal,
            items: Vec::new(),
            item_count: 2,
            notes: String::new(),
        }
    }

    #[test]
    fn test_offline_submission_is_visible_and_queued() {
        let ctx = ctx();
        // Offline: no probe has reported online.
        assert!(!ctx.observer.is_online());

        let record = OrderRecord::from_draft(draft("Acme Corp", "URGENT"));
        queue::enqueue(&ctx.db, &record).unwrap();

        assert_eq!(queue::pending_len(&ctx.db).unwrap(), 1);
        assert_eq!(record.sync_state, RecordSyncState::PendingSync);

        let history = merged_history(&ctx).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].id.to_string().starts_with("offline-"));
        assert_eq!(history[0].client_name, "Acme Corp");
        assert_eq!(history[0].order_kind, "URGENT");
    }

    #[tokio::test]
    async fn test_create_order_while_offline_queues_without_network() {
        let ctx = ctx();
        // Offline and unconfigured: create must still succeed locally.
        let record = create_order(&ctx, draft("Acme Corp", "URGENT"))
            .await
            .unwrap();

        assert_eq!(record.sync_state, RecordSyncState::PendingSync);
        assert_eq!(queue::pending_len(&ctx.db).unwrap(), 1);

        let history = merged_history(&ctx).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].id.to_string().starts_with("offline-"));
    }

    #[test]
    fn test_merged_history_orders_local_first_newest_first() {
        let ctx = ctx();
        let older = OrderRecord::from_draft(draft("Older Local", "BULK ORDER"));
        let newer = OrderRecord::from_draft(draft("Newer Local", "BULK ORDER"));
        queue::enqueue(&ctx.db, &older).unwrap();
        queue::enqueue(&ctx.db, &newer).unwrap();
        replace_cached_orders(&ctx.db, &[remote_record(3, "Remote A"), remote_record(2, "Remote B")])
            .unwrap();

        let history = merged_history(&ctx).unwrap();
        let names: Vec<&str> = history.iter().map(|r| r.client_name.as_str()).collect();
        assert_eq!(names, vec!["Newer Local", "Older Local", "Remote A", "Remote B"]);
    }

    #[test]
    fn test_merged_history_has_no_duplicate_identities() {
        let ctx = ctx();
        replace_cached_orders(&ctx.db, &[remote_record(2, "Once")]).unwrap();
        // A stale duplicate with the same row must not appear twice.
        let history = merged_history(&ctx).unwrap();
        assert_eq!(history.len(), 1);

        let ids: HashSet<String> = merged_history(&ctx)
            .unwrap()
            .iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids.len(), history.len());
    }

    #[tokio::test]
    async fn test_cycle_drains_then_refreshes_from_remote() {
        let ctx = ctx();
        let record = OrderRecord::from_draft(draft("Acme Corp", "BULK ORDER"));
        queue::enqueue(&ctx.db, &record).unwrap();

        let report = run_cycle_with(
            &ctx,
            |_| async { SubmitOutcome::Accepted },
            || async {
                // Sheet order: oldest first; our new row lands at the end.
                Ok(vec![remote_record(2, "Earlier"), remote_record(3, "Acme Corp")])
            },
            true,
        )
        .await
        .unwrap();

        assert!(!report.coalesced);
        assert_eq!(report.drain.submitted, 1);
        assert!(report.refreshed);

        // Round-trip: gone from the queue, present once, sourced remotely.
        assert_eq!(queue::pending_len(&ctx.db).unwrap(), 0);
        let history = merged_history(&ctx).unwrap();
        let acme: Vec<_> = history
            .iter()
            .filter(|r| r.client_name == "Acme Corp")
            .collect();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].id, RecordId::Remote(3));
        assert_eq!(acme[0].sync_state, RecordSyncState::Synced);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_previous_cache() {
        let ctx = ctx();
        replace_cached_orders(&ctx.db, &[remote_record(2, "Kept")]).unwrap();

        let report = run_cycle_with(
            &ctx,
            |_| async { SubmitOutcome::Accepted },
            || async { Err(RelayError::Transport("offline mid-cycle".into())) },
            true,
        )
        .await
        .unwrap();

        assert!(!report.refreshed);
        let cached = cached_orders(&ctx.db).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].client_name, "Kept");
    }

    #[tokio::test]
    async fn test_concurrent_cycle_requests_coalesce() {
        let ctx = ctx();
        // Occupy the slot as an in-flight cycle would.
        ctx.sync_state.drain_slot.store(true, Ordering::SeqCst);

        let calls = AtomicUsize::new(0);
        let report = run_cycle_with(
            &ctx,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { SubmitOutcome::Accepted }
            },
            || async { Ok(Vec::new()) },
            true,
        )
        .await
        .unwrap();

        assert!(report.coalesced);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no work while coalesced");

        // Slot is released by the owning cycle, not the coalesced request.
        assert!(ctx.sync_state.drain_slot.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_slot_released_after_cycle_completes() {
        let ctx = ctx();
        let record = OrderRecord::from_draft(draft("Acme Corp", "BULK ORDER"));
        queue::enqueue(&ctx.db, &record).unwrap();

        run_cycle_with(
            &ctx,
            |_| async { SubmitOutcome::Failed(RelayError::Transport("down".into())) },
            || async { Ok(Vec::new()) },
            false,
        )
        .await
        .unwrap();

        assert!(!ctx.sync_state.drain_slot.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_one_cycle_per_online_edge() {
        let ctx = ctx();
        let record = OrderRecord::from_draft(draft("Retry Me", "BULK ORDER"));
        queue::enqueue(&ctx.db, &record).unwrap();

        let cycles = AtomicUsize::new(0);

        // Two identical "online" probe results: only the first is an edge,
        // so only one drain/refresh cycle runs.
        for online in [true, true] {
            if ctx.observer.report(online) == Some(Transition::Online) {
                let report = run_cycle_with(
                    &ctx,
                    |_| async { SubmitOutcome::Accepted },
                    || async { Ok(Vec::new()) },
                    true,
                )
                .await
                .unwrap();
                assert!(!report.coalesced);
                cycles.fetch_add(1, Ordering::SeqCst);
            }
        }

        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue::pending_len(&ctx.db).unwrap(),
            0,
            "retried record synced on the single edge cycle"
        );
    }

    #[tokio::test]
    async fn test_complete_order_rejects_unsynced_and_terminal_records() {
        let ctx = ctx();
        let local = RecordId::Local("abc".to_string());
        assert!(matches!(
            complete_order(&ctx, &local).await,
            Err(RelayError::Configuration(_))
        ));

        let mut done = remote_record(2, "Done Corp");
        done.fulfillment_state = FulfillmentState::Completed;
        replace_cached_orders(&ctx.db, &[done]).unwrap();
        assert!(matches!(
            complete_order(&ctx, &RecordId::Remote(2)).await,
            Err(RelayError::Configuration(_))
        ));

        // Unknown row: not in the snapshot.
        assert!(matches!(
            complete_order(&ctx, &RecordId::Remote(99)).await,
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn test_sync_status_counts() {
        let ctx = ctx();
        let record = OrderRecord::from_draft(draft("Acme Corp", "BULK ORDER"));
        queue::enqueue(&ctx.db, &record).unwrap();

        let status = sync_status(&ctx).unwrap();
        assert!(!status.is_online);
        assert_eq!(status.pending, 1);
        assert_eq!(status.dead_lettered, 0);
        assert!(status.last_sync.is_none());
    }
}
