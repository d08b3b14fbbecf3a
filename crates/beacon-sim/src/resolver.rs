//! Scriptable resolver
//!
//! Outcomes are keyed by the packet id (last 8 hex chars of the payload).
//! Unscripted payloads resolve to `tag-<packet id>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_upstream::{ResolveError, ResolveRequest, ResolvedIdentity, Resolver};

#[derive(Debug, Default)]
struct ResolverState {
    outcomes: Mutex<HashMap<String, Result<ResolvedIdentity, ResolveError>>>,
    requests: Mutex<Vec<ResolveRequest>>,
    calls: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct SimResolver {
    state: Arc<ResolverState>,
    delay: Duration,
}

impl SimResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every answer back for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, packet_id: &str, outcome: Result<ResolvedIdentity, ResolveError>) {
        self.outcomes().insert(packet_id.to_uppercase(), outcome);
    }

    pub fn deny(&self, packet_id: &str) {
        self.script(packet_id, Err(ResolveError::ResolveDenied));
    }

    /// Fail resolves for `packet_id` with a retryable error
    pub fn unavailable(&self, packet_id: &str, reason: &str) {
        self.script(packet_id, Err(ResolveError::Unavailable(reason.to_string())));
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ResolveRequest> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn outcomes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Result<ResolvedIdentity, ResolveError>>> {
        self.state
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn answer(&self, request: &ResolveRequest) -> Result<ResolvedIdentity, ResolveError> {
        let payload = request
            .packets
            .first()
            .map(|p| p.payload.as_str())
            .unwrap_or_default();
        // Last 8 characters, cut on a char boundary
        let start = payload.char_indices().rev().nth(7).map_or(0, |(i, _)| i);
        let packet_id = &payload[start..];
        match self.outcomes().get(packet_id) {
            Some(outcome) => outcome.clone(),
            None => Ok(ResolvedIdentity::new(format!("tag-{packet_id}"))),
        }
    }
}

impl Resolver for SimResolver {
    async fn resolve(&self, request: ResolveRequest) -> Result<ResolvedIdentity, ResolveError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.answer(&request);
        self.state
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        outcome
    }
}
