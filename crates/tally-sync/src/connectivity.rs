//! # Connectivity
//!
//! Offline state is the OR of three inputs:
//!
//! ```text
//! offline = manual_offline || !browser_online || !server_online
//!              │                  │                  │
//!              │                  │                  └─ last liveness probe
//!              │                  └─ hint passed by the caller
//!              └─ cashier toggle (persisted)
//! ```
//!
//! The probe runs on the worker's interval with a hard timeout. At most one
//! probe is in flight; a tick that finds one running is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::PosBackend;

/// Shared connectivity flags. Clones share state.
#[derive(Debug, Clone)]
pub struct Connectivity {
    manual_offline: Arc<AtomicBool>,
    server_online: Arc<AtomicBool>,
    probe_in_flight: Arc<AtomicBool>,
}

impl Connectivity {
    /// Starts optimistic: the server is assumed online until a probe fails.
    pub fn new(manual_offline: bool) -> Self {
        Connectivity {
            manual_offline: Arc::new(AtomicBool::new(manual_offline)),
            server_online: Arc::new(AtomicBool::new(true)),
            probe_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_offline(&self, browser_online: bool) -> bool {
        self.manual_offline() || !browser_online || !self.server_online()
    }

    /// Offline state when the caller has no network hint.
    pub fn is_online(&self) -> bool {
        !self.is_offline(true)
    }

    pub fn manual_offline(&self) -> bool {
        self.manual_offline.load(Ordering::SeqCst)
    }

    pub fn set_manual_offline(&self, value: bool) {
        self.manual_offline.store(value, Ordering::SeqCst);
    }

    pub fn server_online(&self) -> bool {
        self.server_online.load(Ordering::SeqCst)
    }

    /// Records a probe result. Returns true if the value changed.
    pub fn set_server_online(&self, online: bool) -> bool {
        self.server_online.swap(online, Ordering::SeqCst) != online
    }

    /// Runs one liveness probe.
    ///
    /// Returns `None` when another probe is still running, otherwise the
    /// probe result. A timeout counts as offline. The result is recorded.
    pub async fn probe(&self, backend: &dyn PosBackend, timeout: Duration) -> Option<bool> {
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Probe already in flight, skipping");
            return None;
        }

        let online = match tokio::time::timeout(timeout, backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Liveness probe timed out");
                false
            }
        };

        self.set_server_online(online);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        Some(online)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    #[test]
    fn test_offline_is_any_input() {
        let c = Connectivity::new(false);
        assert!(!c.is_offline(true));
        assert!(c.is_offline(false));

        c.set_manual_offline(true);
        assert!(c.is_offline(true));
        c.set_manual_offline(false);

        assert!(c.set_server_online(false));
        assert!(!c.set_server_online(false));
        assert!(c.is_offline(true));
    }

    #[tokio::test]
    async fn test_probe_records_result() {
        let backend = MockBackend::new();
        let c = Connectivity::new(false);

        backend.set_online(false);
        assert_eq!(c.probe(&backend, Duration::from_secs(1)).await, Some(false));
        assert!(!c.server_online());

        backend.set_online(true);
        assert_eq!(c.probe(&backend, Duration::from_secs(1)).await, Some(true));
        assert!(c.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_offline() {
        let backend = MockBackend::new();
        backend.set_ping_delay(Duration::from_secs(10));
        let c = Connectivity::new(false);

        assert_eq!(c.probe(&backend, Duration::from_secs(3)).await, Some(false));
        assert!(!c.server_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_in_flight() {
        let backend = std::sync::Arc::new(MockBackend::new());
        backend.set_ping_delay(Duration::from_secs(2));
        let c = Connectivity::new(false);

        let first = {
            let (c, backend) = (c.clone(), backend.clone());
            tokio::spawn(async move { c.probe(backend.as_ref(), Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(c.probe(backend.as_ref(), Duration::from_secs(3)).await, None);
        assert_eq!(first.await.unwrap(), Some(true));
        assert_eq!(backend.calls("ping"), 1);
    }
}
