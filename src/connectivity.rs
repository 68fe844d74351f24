//! Connectivity observer.
//!
//! Collapses a stream of online/offline probe results into edge events:
//! exactly one `Transition` per genuine change, never two in a row for the
//! same state. The coordinator runs one sync cycle per `Online` edge,
//! whether or not anything is queued.

use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Online,
    Offline,
}

pub struct ConnectivityObserver {
    last_seen: Mutex<Option<bool>>,
}

impl ConnectivityObserver {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(None),
        }
    }

    /// Feed one probe result. Returns a transition only when the state
    /// actually changed; the very first report always counts as an edge.
    pub fn report(&self, online: bool) -> Option<Transition> {
        let mut last = match self.last_seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *last == Some(online) {
            return None;
        }
        *last = Some(online);
        if online {
            info!("network restored; resuming queued sync");
            Some(Transition::Online)
        } else {
            info!("network offline; deferring remote sync and keeping queue pending");
            Some(Transition::Offline)
        }
    }

    /// Last observed state; `false` until a probe has reported.
    pub fn is_online(&self) -> bool {
        match self.last_seen.lock() {
            Ok(guard) => guard.unwrap_or(false),
            Err(poisoned) => poisoned.into_inner().unwrap_or(false),
        }
    }
}

impl Default for ConnectivityObserver {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_report_is_an_edge() {
        let observer = ConnectivityObserver::new();
        assert!(!observer.is_online());
        assert_eq!(observer.report(true), Some(Transition::Online));
        assert!(observer.is_online());
    }

    #[test]
    fn test_duplicate_reports_are_suppressed() {
        let observer = ConnectivityObserver::new();
        assert_eq!(observer.report(true), Some(Transition::Online));
        assert_eq!(observer.report(true), None, "second identical report");
        assert_eq!(observer.report(true), None);
        assert_eq!(observer.report(false), Some(Transition::Offline));
        assert_eq!(observer.report(false), None);
    }

    #[test]
    fn test_alternating_reports_emit_each_edge_once() {
        let observer = ConnectivityObserver::new();
        let edges: Vec<_> = [false, false, true, true, false, true]
            .into_iter()
            .filter_map(|online| observer.report(online))
            .collect();
        assert_eq!(
            edges,
            vec![
                Transition::Offline,
                Transition::Online,
                Transition::Offline,
                Transition::Online
            ]
        );
    }
}
