//! Core order types shared by the queue, sink client, and coordinator.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One line item on a bulk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OrderItem {
    pub fn new(name: &str, quantity: u32, unit: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            quantity,
            unit: unit.to_string(),
            notes: None,
        }
    }
}

/// Logistics priority as entered on the form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "Normal",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        }
    }

    /// Lenient parse for values coming back from the sheet, where the
    /// column is free text. Unknown values fall back to `Normal`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the record's existence has been confirmed by the remote sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Created locally, not yet queued for submission.
    LocalOnly,
    /// Sitting in the pending-write queue awaiting a successful submit.
    PendingSync,
    /// Observed in (or accepted by) the remote sheet.
    Synced,
}

/// Whether the logistics task itself is done, independent of where the
/// record lives. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FulfillmentState {
    Pending,
    Completed,
}

/// Record identity. Local and remote identities are disjoint spaces: a
/// locally created record keeps its uuid until it is *observed* from the
/// remote snapshot, at which point the displayed entry carries the sheet
/// row index instead. The two are never compared across spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordId {
    /// Locally generated uuid; rendered with an `offline-` prefix so the
    /// user can tell unsynced entries apart.
    Local(String),
    /// 1-based sheet row index, valid only until the sheet is edited.
    Remote(i64),
}

impl RecordId {
    pub fn new_local() -> Self {
        RecordId::Local(Uuid::new_v4().to_string())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RecordId::Local(_))
    }

    pub fn remote_row(&self) -> Option<i64> {
        match self {
            RecordId::Remote(row) => Some(*row),
            RecordId::Local(_) => None,
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordId::Local(id) => write!(f, "offline-{id}"),
            RecordId::Remote(row) => write!(f, "row-{row}"),
        }
    }
}

/// The form fields the user fills out, before the engine stamps identity
/// and timestamps onto them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    /// Order kind label ("BULK ORDER", "REMINDER", "URGENT", "TAKE NOTE").
    pub order_kind: String,
    pub client_name: String,
    /// Deadline date in `YYYY-MM-DD`.
    pub deadline_date: String,
    /// Deadline time in `HH:MM` (24h).
    pub deadline_time: String,
    /// Outlet / delivery location.
    pub location: String,
    pub priority: Priority,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub notes: String,
}

/// A full order record as held in the queue, the cache, and the merged
/// display list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: RecordId,
    pub sync_state: SyncState,
    pub fulfillment_state: FulfillmentState,
    /// Stable idempotency token sent with every create attempt so a retry
    /// of an already-applied write can be detected remotely.
    pub client_request_id: String,
    /// RFC 3339 creation instant.
    pub timestamp: String,
    /// Human-readable timestamp in the sheet's display format.
    pub formatted_timestamp: String,
    pub order_kind: String,
    pub client_name: String,
    pub deadline_date: String,
    pub deadline_time: String,
    pub location: String,
    pub priority: Priority,
    /// Full line items for locally created records; empty for records
    /// sourced from the remote snapshot, which only reports a count.
    pub items: Vec<OrderItem>,
    /// Item count as shown in the sheet. Matches `items.len()` for local
    /// records and the fetched ITEM COUNT column for remote ones.
    pub item_count: u32,
    pub notes: String,
}

impl OrderRecord {
    /// Stamp a draft into a pending local record. The idempotency token is
    /// fixed here and never regenerated, so every retry of this record is
    /// recognizable as the same logical write.
    pub fn from_draft(draft: OrderDraft) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new_local(),
            sync_state: SyncState::PendingSync,
            fulfillment_state: FulfillmentState::Pending,
            client_request_id: Uuid::new_v4().to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            formatted_timestamp: format_sheet_timestamp(now),
            order_kind: draft.order_kind,
            client_name: draft.client_name,
            deadline_date: draft.deadline_date,
            deadline_time: draft.deadline_time,
            location: draft.location,
            priority: draft.priority,
            item_count: draft.items.len() as u32,
            items: draft.items,
            notes: draft.notes,
        }
    }

    /// Only synced records have a sheet row and can be marked complete.
    pub fn completable(&self) -> bool {
        self.sync_state == SyncState::Synced
            && self.fulfillment_state == FulfillmentState::Pending
            && self.id.remote_row().is_some()
    }
}

/// Sheet display timestamp, e.g. `11/24/2025, 5:03 PM`. Matches what the
/// sheet script writes into the TIMESTAMP column so fetched and locally
/// created entries render the same.
pub fn format_sheet_timestamp(instant: DateTime<Utc>) -> String {
    let local = instant.with_timezone(&Local);
    let hour24 = chrono::Timelike::hour(&local);
    let (hour12, meridiem) = match hour24 {
        0 => (12, "AM"),
        1..=11 => (hour24, "AM"),
        12 => (12, "PM"),
        _ => (hour24 - 12, "PM"),
    };
    format!(
        "{}/{}/{}, {}:{:02} {}",
        chrono::Datelike::month(&local),
        chrono::Datelike::day(&local),
        chrono::Datelike::year(&local),
        hour12,
        chrono::Timelike::minute(&local),
        meridiem
    )
}

// ===========================================================================
// Tests
// ===========================================================================
