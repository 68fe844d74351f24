//! BulkOrder Pro relay engine.
//!
//! Offline-first order relay for a spreadsheet-backed logistics workflow:
//! orders are written to a durable local queue first, drained to the
//! webhook when connectivity allows, and the display list merges the
//! local queue with the cached remote snapshot. All state flows through
//! an explicit [`AppContext`]; there are no process-wide globals.

use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod calendar;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod message;
pub mod models;
pub mod queue;
pub mod sync;

pub use error::{RelayError, Result};

/// Setting coordinates for the webhook endpoint URL.
const SETTING_CATEGORY_WEBHOOK: &str = "webhook";
const SETTING_KEY_ENDPOINT: &str = "endpoint_url";

/// Everything the coordinator and sink client need, built once at startup
/// and passed explicitly. Dropping the context is the teardown.
pub struct AppContext {
    pub db: db::DbState,
    pub sync_state: sync::SyncCoordinatorState,
    pub observer: connectivity::ConnectivityObserver,
}

impl AppContext {
    pub fn new(db: db::DbState) -> Arc<Self> {
        Arc::new(Self {
            db,
            sync_state: sync::SyncCoordinatorState::new(),
            observer: connectivity::ConnectivityObserver::new(),
        })
    }

    /// The saved webhook endpoint, if one has been configured.
    pub fn endpoint_url(&self) -> Option<String> {
        db::setting_get(&self.db, SETTING_CATEGORY_WEBHOOK, SETTING_KEY_ENDPOINT)
    }

    /// Validate and persist the webhook endpoint. Rejects non-`/exec`
    /// URLs before anything is stored.
    pub fn set_endpoint_url(&self, url: &str) -> Result<()> {
        let normalized = api::validate_webhook_url(url)?;
        db::setting_set(
            &self.db,
            SETTING_CATEGORY_WEBHOOK,
            SETTING_KEY_ENDPOINT,
            &normalized,
        )
    }

    /// Build a sink client for the configured endpoint.
    pub fn sheet_client(&self) -> Result<api::SheetClient> {
        let endpoint = self.endpoint_url().ok_or_else(|| {
            RelayError::Configuration("webhook endpoint URL is not set".to_string())
        })?;
        api::SheetClient::new(&endpoint)
    }

    /// In-memory context for unit tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            db: db::init_in_memory(),
            sync_state: sync::SyncCoordinatorState::new(),
            observer: connectivity::ConnectivityObserver::new(),
        }
    }
}

/// Initialize structured logging for the process. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bulkorder_relay=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

// ===========================================================================
// Tests
// ===========================================================================
