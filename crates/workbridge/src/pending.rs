//! Correlation table: outstanding calls awaiting their response.
//!
//! Each entry is settled at most once. Settlement removes the entry, so a
//! duplicate or late response finds nothing and is discarded.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::bridge::protocol::CallId;
use crate::error::BridgeError;

pub type CallResult = Result<serde_json::Value, BridgeError>;

struct PendingCall {
    operation: String,
    issued_at: DateTime<Utc>,
    started: Instant,
    tx: oneshot::Sender<CallResult>,
}

/// Snapshot of an outstanding call for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: CallId,
    pub operation: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<CallId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and record the call.
    pub fn register(&self, operation: &str) -> (CallId, oneshot::Receiver<CallResult>) {
        loop {
            let id = CallId::new();
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall {
                    operation: operation.to_string(),
                    issued_at: Utc::now(),
                    started: Instant::now(),
                    tx,
                });
                return (id, rx);
            }
        }
    }

    /// Settle the call with a result built from its operation name.
    ///
    /// Returns false when no such call is outstanding.
    pub fn complete(&self, id: &CallId, result: impl FnOnce(&str) -> CallResult) -> bool {
        let Some((_, call)) = self.calls.remove(id) else {
            tracing::trace!(call_id = %id, "Discarding response for unknown or settled call");
            return false;
        };
        let result = result(&call.operation);
        tracing::trace!(
            call_id = %id,
            operation = %call.operation,
            ok = result.is_ok(),
            elapsed_ms = call.started.elapsed().as_millis() as u64,
            "Call settled"
        );
        if call.tx.send(result).is_err() {
            tracing::trace!(call_id = %id, "Caller stopped waiting before settlement");
        }
        true
    }

    /// Drop the entry without notifying the caller (caller gave up).
    pub fn forget(&self, id: &CallId) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Settle every outstanding call with the same error.
    pub fn reject_all(&self, err: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<CallId> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.iter()
            .filter(|id| self.complete(id, |_| Err(err())))
            .count()
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Outstanding calls, oldest first.
    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let mut calls: Vec<PendingInfo> = self
            .calls
            .iter()
            .map(|entry| PendingInfo {
                id: *entry.key(),
                operation: entry.operation.clone(),
                issued_at: entry.issued_at,
            })
            .collect();
        calls.sort_by_key(|info| info.issued_at);
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn settles_exactly_once() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register("restart");
        assert!(pending.contains(&id));

        assert!(pending.complete(&id, |_| Ok(json!("first"))));
        assert!(!pending.complete(&id, |_| Ok(json!("second"))));

        assert_eq!(rx.await.unwrap().unwrap(), json!("first"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn result_sees_operation_name() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register("importIpynb");
        pending.complete(&id, |op| {
            Err(BridgeError::UnknownHandler {
                operation: op.to_string(),
            })
        });
        assert_eq!(
            rx.await.unwrap().unwrap_err(),
            BridgeError::UnknownHandler {
                operation: "importIpynb".to_string()
            }
        );
    }

    #[tokio::test]
    async fn reject_all_drains_table() {
        let pending = PendingCalls::new();
        let (_a, rx_a) = pending.register("onload");
        let (_b, rx_b) = pending.register("updateConfig");
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.reject_all(|| BridgeError::Terminated), 2);
        assert!(pending.is_empty());
        assert_eq!(rx_a.await.unwrap(), Err(BridgeError::Terminated));
        assert_eq!(rx_b.await.unwrap(), Err(BridgeError::Terminated));
    }

    #[test]
    fn ids_are_distinct_while_pending() {
        let pending = PendingCalls::new();
        let ids: std::collections::HashSet<CallId> =
            (0..100).map(|_| pending.register("ping").0).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn forget_removes_silently() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register("ping");
        assert!(pending.forget(&id));
        assert!(!pending.forget(&id));
        assert_eq!(pending.snapshot(), vec![]);
    }

    #[test]
    fn snapshot_lists_operations() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register("addViewEvent");
        let snapshot = pending.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].operation, "addViewEvent");
    }
}
