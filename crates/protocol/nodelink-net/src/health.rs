//! Connection health checks.
//!
//! A check sends a `healthcheck` request carrying a random token and
//! expects the token echoed back. Consecutive failures are counted per
//! connection; at most one check per connection runs at a time.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use nodelink_types::{categories, NetworkRequest, NetworkResponse, NodeId};

use crate::connection::ConnectionId;
use crate::traits::RequestHandler;

/// Answers health-check requests by echoing their content.
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthCheckRequestHandler;

#[async_trait]
impl RequestHandler for HealthCheckRequestHandler {
    fn is_applicable(&self, request: &NetworkRequest) -> bool {
        request.category() == Some(categories::HEALTH_CHECK)
    }

    async fn handle(&self, request: &NetworkRequest, _sender: &NodeId) -> anyhow::Result<NetworkResponse> {
        Ok(NetworkResponse::success(request, request.content().to_vec()))
    }
}

/// A fresh health-check request with a random token as content.
pub fn health_check_request() -> NetworkRequest {
    let token = format!("{:016x}", rand::random::<u64>());
    NetworkRequest::builder()
        .category(categories::HEALTH_CHECK)
        .content(token.into_bytes())
        .build()
}

/// Whether `response` is a correct answer to `request`.
pub fn is_valid_echo(request: &NetworkRequest, response: &NetworkResponse) -> bool {
    response.is_success() && response.content() == request.content()
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The echo came back; `recovered_from` counts failures before it.
    Healthy { recovered_from: u32 },
    /// The check failed but the limit was not reached.
    Failed { consecutive: u32 },
    /// The failure limit was reached and the connection reported broken.
    Broken { consecutive: u32 },
    /// Not checked: unknown or closed connection, a check already running,
    /// or a connection dropped while its check ran.
    Skipped,
}

#[derive(Debug, Default)]
struct HealthState {
    failures: u32,
    in_progress: bool,
}

/// Per-connection failure counters with single-flight checks.
#[derive(Debug, Default)]
pub(crate) struct HealthMonitor {
    states: Mutex<HashMap<ConnectionId, HealthState>>,
}

impl HealthMonitor {
    fn states(&self) -> MutexGuard<'_, HashMap<ConnectionId, HealthState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the check slot of `id`; false if a check is already running.
    pub(crate) fn try_begin(&self, id: &ConnectionId) -> bool {
        let mut states = self.states();
        let state = states.entry(id.clone()).or_default();
        if state.in_progress {
            return false;
        }
        state.in_progress = true;
        true
    }

    /// Record a success; returns the failure count it resets.
    ///
    /// A connection forgotten while its check ran stays forgotten.
    pub(crate) fn record_success(&self, id: &ConnectionId) -> u32 {
        match self.states().get_mut(id) {
            Some(state) => {
                state.in_progress = false;
                std::mem::take(&mut state.failures)
            }
            None => 0,
        }
    }

    /// Record a failure; returns the new consecutive failure count, or
    /// `None` if the connection was forgotten while its check ran.
    pub(crate) fn record_failure(&self, id: &ConnectionId) -> Option<u32> {
        let mut states = self.states();
        let state = states.get_mut(id)?;
        state.in_progress = false;
        state.failures += 1;
        Some(state.failures)
    }

    pub(crate) fn failures(&self, id: &ConnectionId) -> u32 {
        self.states().get(id).map(|s| s.failures).unwrap_or(0)
    }

    pub(crate) fn forget(&self, id: &ConnectionId) {
        self.states().remove(id);
    }
}
