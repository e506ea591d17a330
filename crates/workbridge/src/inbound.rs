//! Fire-and-forget calls from synchronous event sources.
//!
//! Event listeners (edit and view events, UI callbacks) cannot await a call.
//! They push onto a [`CallSender`]; a pump task posts the calls in arrival
//! order and logs failures instead of surfacing them.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::endpoint::Bridge;
use crate::registry::{Operation, encode_args};

struct QueuedCall {
    operation: &'static str,
    args: Vec<Value>,
}

/// Cloneable, non-blocking handle for queuing calls.
#[derive(Clone)]
pub struct CallSender {
    tx: mpsc::UnboundedSender<QueuedCall>,
}

impl CallSender {
    /// Queue a call. Returns false when the pump has stopped or the
    /// arguments could not be encoded.
    pub fn notify<O: Operation>(&self, args: O::Args) -> bool {
        let args = match encode_args(&args) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(operation = O::NAME, error = %e, "Dropping event with unencodable arguments");
                return false;
            }
        };
        self.tx
            .send(QueuedCall {
                operation: O::NAME,
                args,
            })
            .is_ok()
    }
}

/// Start a pump posting queued calls on `bridge`.
///
/// The pump ends once every sender is dropped, returning how many calls it
/// posted. Calls are posted strictly in queue order.
pub fn call_queue(bridge: Arc<Bridge>) -> (CallSender, JoinHandle<usize>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedCall>();
    let pump = tokio::spawn(async move {
        let mut posted = 0;
        while let Some(call) = rx.recv().await {
            let reply = bridge.begin_raw(call.operation, call.args);
            posted += 1;
            tokio::spawn(async move {
                let operation = reply.operation().to_string();
                if let Err(e) = reply.wait().await {
                    tracing::warn!(%operation, error = %e, "Queued call failed");
                }
            });
        }
        tracing::debug!(posted, "Call queue drained");
        posted
    });
    (CallSender { tx }, pump)
}
