//! Spreadsheet webhook client.
//!
//! Talks to the Apps Script web-app endpoint backing the order sheet:
//! `POST {action:"create"}` appends a row, `POST {action:"update"}` marks
//! a row completed, `GET` returns every not-yet-completed row. Unlike the
//! browser original, every response body is read and parsed, so a
//! remote-side `{error}` is distinguishable from an accepted write.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::models::{FulfillmentState, OrderRecord, Priority, RecordId, SyncState};

/// Default timeout for webhook requests. Apps Script cold starts are slow.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the webhook URL:
/// - strip surrounding whitespace and trailing slashes
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_webhook_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Normalise and validate the webhook URL. The deployed web-app URL always
/// ends in `/exec`; the `/dev` and `/edit` variants users paste by mistake
/// are rejected here, before any network attempt.
pub fn validate_webhook_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(RelayError::Configuration(
            "webhook endpoint URL is not set".to_string(),
        ));
    }
    let normalized = normalize_webhook_url(trimmed);
    if !normalized.ends_with("/exec") {
        return Err(RelayError::Configuration(format!(
            "webhook URL must end in /exec, got {normalized}"
        )));
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach webhook at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid webhook URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Build the `create` body the sheet script expects. Field names match the
/// script's `data.*` lookups; `clientRequestId` rides along as a stable
/// idempotency token for retried submissions.
pub fn build_create_payload(record: &OrderRecord) -> Value {
    json!({
        "action": "create",
        "clientRequestId": record.client_request_id,
        "timestamp": record.timestamp,
        "formattedTimestamp": record.formatted_timestamp,
        "orderId": record.order_kind,
        "clientName": record.client_name,
        "deadlineDate": record.deadline_date,
        "deadlineTime": record.deadline_time,
        "location": record.location,
        "priority": record.priority.as_str(),
        "items": record.items,
        "itemCount": record.item_count,
        "notes": record.notes,
    })
}

/// Interpret a write response body. The script answers
/// `{"result":"Created"}` / `{"result":"Updated"}` on success and
/// `{"error":"..."}` when its own handler threw.
fn parse_write_ack(body: &str, expected: &str) -> Result<()> {
    let value: Value = serde_json::from_str(body.trim()).map_err(|e| {
        RelayError::Remote(format!("unreadable webhook response: {e}"))
    })?;

    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return Err(RelayError::Remote(err.to_string()));
    }
    match value.get("result").and_then(Value::as_str) {
        Some(result) if result == expected => Ok(()),
        Some(other) => Err(RelayError::Remote(format!(
            "unexpected webhook result: {other}"
        ))),
        None => Err(RelayError::Remote(
            "webhook response missing result field".to_string(),
        )),
    }
}

/// Lenient field readers for fetched rows. The sheet returns display
/// values, so numeric columns may arrive as strings.
fn row_str(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn row_i64(v: &Value, key: &str) -> Option<i64> {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Map one fetched row into a display record. Rows without a usable row
/// index are skipped by the caller — there is nothing to address them by.
pub fn record_from_row(row: &Value) -> Option<OrderRecord> {
    let sheet_row = row_i64(row, "row")?;
    let status = row_str(row, "fulfillmentStatus");
    let fulfillment = if status.eq_ignore_ascii_case("completed") {
        FulfillmentState::Completed
    } else {
        FulfillmentState::Pending
    };

    Some(OrderRecord {
        id: RecordId::Remote(sheet_row),
        sync_state: SyncState::Synced,
        fulfillment_state: fulfillment,
        client_request_id: String::new(),
        timestamp: String::new(),
        formatted_timestamp: row_str(row, "formattedTimestamp"),
        order_kind: row_str(row, "orderId"),
        client_name: row_str(row, "clientName"),
        deadline_date: String::new(),
        deadline_time: String::new(),
        location: row_str(row, "location"),
        priority: Priority::parse(&row_str(row, "priority")),
        items: Vec::new(),
        item_count: row_i64(row, "itemCount").unwrap_or(0).max(0) as u32,
        notes: row_str(row, "notes"),
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client bound to one validated webhook endpoint. Constructed by the
/// `AppContext`; holds no ambient state.
pub struct SheetClient {
    endpoint: String,
    client: Client,
}

impl SheetClient {
    pub fn new(endpoint_url: &str) -> Result<Self> {
        let endpoint = validate_webhook_url(endpoint_url)?;
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Configuration(format!("build HTTP client: {e}")))?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Submit one order for appending to the sheet.
    pub async fn create(&self, record: &OrderRecord) -> Result<()> {
        let payload = build_create_payload(record);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RelayError::Transport(friendly_error(&self.endpoint, &e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RelayError::Transport(friendly_error(&self.endpoint, &e)))?;

        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "webhook returned HTTP {status}"
            )));
        }

        parse_write_ack(&body, "Created")?;
        info!(record_id = %record.id, client = %record.client_name, "order row created");
        Ok(())
    }

    /// Mark the given sheet row completed.
    ///
    /// Row numbers are only stable until someone edits the sheet; callers
    /// should refetch after a failure rather than retry blindly.
    pub async fn mark_completed(&self, row: i64) -> Result<()> {
        let payload = json!({ "action": "update", "row": row, "status": "Completed" });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RelayError::Transport(friendly_error(&self.endpoint, &e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RelayError::Transport(friendly_error(&self.endpoint, &e)))?;

        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "webhook returned HTTP {status}"
            )));
        }

        parse_write_ack(&body, "Updated")?;
        info!(row, "sheet row marked completed");
        Ok(())
    }

    /// Fetch every not-yet-completed row, in sheet order (oldest first).
    /// A malformed body yields an error; local state is never touched here.
    pub async fn fetch_all(&self) -> Result<Vec<OrderRecord>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| RelayError::Transport(friendly_error(&self.endpoint, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "webhook returned HTTP {status}"
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| RelayError::Transport(friendly_error(&self.endpoint, &e)))?;

        let rows: Vec<Value> = serde_json::from_str(body.trim())
            .map_err(|e| RelayError::Remote(format!("invalid row list from webhook: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match record_from_row(row) {
                Some(record) => records.push(record),
                None => warn!("skipping fetched row without a row index: {row}"),
            }
        }
        debug!(count = records.len(), "fetched remote order rows");
        Ok(records)
    }

    /// Lightweight reachability probe. Any HTTP response at all counts as
    /// online; only a failed connection means offline.
    pub async fn probe(&self) -> bool {
        let client = match Client::builder().timeout(PROBE_TIMEOUT).build() {
            Ok(c) => c,
            Err(_) => return false,
        };
        client.head(&self.endpoint).send().await.is_ok()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
