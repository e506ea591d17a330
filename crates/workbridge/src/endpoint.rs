//! Bridge endpoint shared by the controller (master) and worker sides.
//!
//! Flow of a call:
//! 1. `begin` allocates a correlation id, records the pending call and queues
//!    the Call envelope (never suspends)
//! 2. The writer task posts queued envelopes on the channel
//! 3. The reader task routes the peer's Response/Pong to the pending call by id,
//!    and runs handlers for the peer's Calls, posting their outcome back
//! 4. `terminate` rejects everything outstanding and closes the channel

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{Channel, EnvelopeSink, EnvelopeStream};
use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, encoded_len};
use crate::bridge::protocol::{CallId, Envelope, Failure, response_outcome};
use crate::error::BridgeError;
use crate::pending::{CallResult, PendingCalls, PendingInfo};
use crate::registry::{HandlerRegistry, Operation, PING, RegistryError, decode_args, encode_args};
use crate::version::VersionInfo;

/// Liveness probes fail after this long without a Pong.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Master => "master",
            Role::Worker => "worker",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline for ordinary calls. None waits until response or termination.
    pub call_timeout: Option<Duration>,
    pub ping_timeout: Duration,
    /// Reported to the peer in Pong envelopes.
    pub version: VersionInfo,
    /// Largest envelope body this side will post. Larger calls fail alone
    /// with `Codec`; larger results go back as a handler failure.
    pub max_frame_length: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            version: VersionInfo::new(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

struct Shared {
    role: Role,
    label: String,
    config: BridgeConfig,
    registry: HandlerRegistry,
    pending: PendingCalls,
    outbound: mpsc::UnboundedSender<Envelope>,
    terminated: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// One endpoint of the bridge.
///
/// Dropping the bridge terminates it. Share it by reference or `Arc`; hand
/// handlers a [`Peer`] instead.
pub struct Bridge {
    shared: Arc<Shared>,
}

/// Weak calling handle to a bridge, for handlers and background tasks.
///
/// Calls through a peer whose bridge is gone fail with `Unreachable`.
#[derive(Clone)]
pub struct Peer {
    shared: Weak<Shared>,
}

/// A call that has been posted and awaits its response.
///
/// Dropping it unsettled, directly or by dropping the `wait` future,
/// removes the call from the correlation table.
#[must_use = "a pending reply does nothing unless waited on"]
pub struct PendingReply {
    shared: Arc<Shared>,
    operation: String,
    timeout: Option<Duration>,
    id: Option<CallId>,
    state: ReplyState,
}

enum ReplyState {
    Failed(BridgeError),
    Waiting(oneshot::Receiver<CallResult>),
    Taken,
}

impl Bridge {
    /// Controller-side bridge with default configuration.
    pub fn master(channel: Channel, registry: HandlerRegistry) -> Self {
        Self::start(Role::Master, channel, BridgeConfig::default(), registry)
    }

    /// Worker-side bridge with default configuration.
    pub fn worker(channel: Channel, registry: HandlerRegistry) -> Self {
        Self::start(Role::Worker, channel, BridgeConfig::default(), registry)
    }

    /// Start serving the channel. Must be called inside a tokio runtime.
    pub fn start(
        role: Role,
        channel: Channel,
        config: BridgeConfig,
        registry: HandlerRegistry,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let label = channel.label().to_string();
        let shared = Arc::new(Shared::new(role, label, config, registry, outbound));
        Self::spawn_io(shared, channel, outbound_rx)
    }

    /// Start with a registry whose handlers can call back through the bridge.
    pub fn start_with<F>(
        role: Role,
        channel: Channel,
        config: BridgeConfig,
        build: F,
    ) -> Result<Self, RegistryError>
    where
        F: FnOnce(Peer) -> Result<HandlerRegistry, RegistryError>,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let label = channel.label().to_string();
        let mut failed = None;
        let shared = Arc::new_cyclic(|weak| {
            let registry = match build(Peer {
                shared: weak.clone(),
            }) {
                Ok(registry) => registry,
                Err(e) => {
                    failed = Some(e);
                    HandlerRegistry::new()
                }
            };
            Shared::new(role, label, config, registry, outbound)
        });
        if let Some(e) = failed {
            return Err(e);
        }
        Ok(Self::spawn_io(shared, channel, outbound_rx))
    }

    fn spawn_io(
        shared: Arc<Shared>,
        channel: Channel,
        outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let (sink, stream) = channel.into_parts();
        tracing::debug!(
            role = %shared.role,
            channel = %shared.label,
            operations = ?shared.registry.names(),
            "Bridge started"
        );
        tokio::spawn(write_loop(Arc::clone(&shared), sink, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), stream));
        Self { shared }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn peer(&self) -> Peer {
        Peer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Invoke an operation on the peer.
    pub async fn call<O: Operation>(&self, args: O::Args) -> Result<O::Output, BridgeError> {
        self.shared.call::<O>(args, self.shared.config.call_timeout).await
    }

    /// Invoke with a deadline. The remote handler may still run to completion.
    pub async fn call_with_timeout<O: Operation>(
        &self,
        args: O::Args,
        timeout: Duration,
    ) -> Result<O::Output, BridgeError> {
        self.shared.call::<O>(args, Some(timeout)).await
    }

    /// Post a call now and wait for it later.
    pub fn begin<O: Operation>(&self, args: O::Args) -> PendingReply {
        self.shared.begin_typed::<O>(&args)
    }

    /// Post a call by name with already-encoded positional arguments.
    pub fn begin_raw(&self, name: &str, args: Vec<Value>) -> PendingReply {
        self.shared
            .begin(name, self.shared.config.call_timeout, |id| {
                Envelope::call(id, name, args)
            })
    }

    /// Call by name and wait; the result is left as JSON.
    pub async fn call_raw(&self, name: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.begin_raw(name, args).wait().await
    }

    /// Probe the peer. Any failure means "not running"; never retried here.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        self.shared.ping().await.map(|_| ())
    }

    /// Probe the peer and return its reported version.
    pub async fn ping_info(&self) -> Result<VersionInfo, BridgeError> {
        self.shared.ping().await
    }

    /// Add a handler after construction. Calls naming it before this fail.
    pub fn register<O, F, Fut>(&self, f: F) -> Result<(), RegistryError>
    where
        O: Operation,
        F: Fn(O::Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<O::Output>> + Send + 'static,
    {
        self.shared.registry.register::<O, F, Fut>(f)
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.shared.registry.names()
    }

    pub fn pending_calls(&self) -> Vec<PendingInfo> {
        self.shared.pending.snapshot()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// False once terminated or once the channel has closed.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Resolves when the bridge stops serving: terminated or channel lost.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Reject all pending calls with `Terminated` and close the channel.
    ///
    /// Idempotent. Responses arriving afterwards are dropped.
    pub fn terminate(&self) {
        self.shared.terminate();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

impl Peer {
    pub async fn call<O: Operation>(&self, args: O::Args) -> Result<O::Output, BridgeError> {
        let shared = self.upgrade()?;
        let timeout = shared.config.call_timeout;
        shared.call::<O>(args, timeout).await
    }

    pub fn begin<O: Operation>(&self, args: O::Args) -> Result<PendingReply, BridgeError> {
        Ok(self.upgrade()?.begin_typed::<O>(&args))
    }

    pub async fn ping(&self) -> Result<(), BridgeError> {
        self.upgrade()?.ping().await.map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.shared.upgrade().is_some_and(|s| s.is_open())
    }

    fn upgrade(&self) -> Result<Arc<Shared>, BridgeError> {
        self.shared.upgrade().ok_or(BridgeError::Unreachable)
    }
}

impl PendingReply {
    pub fn id(&self) -> Option<CallId> {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn wait(mut self) -> Result<Value, BridgeError> {
        let rx = match std::mem::replace(&mut self.state, ReplyState::Taken) {
            ReplyState::Failed(e) => return Err(e),
            ReplyState::Taken => return Err(BridgeError::Terminated),
            ReplyState::Waiting(rx) => rx,
        };
        let received = match self.timeout {
            None => rx.await,
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Drop forgets the entry.
                    tracing::debug!(
                        role = %self.shared.role,
                        call_id = ?self.id,
                        operation = %self.operation,
                        timeout_ms = after.as_millis() as u64,
                        "Call timed out"
                    );
                    return Err(BridgeError::Timeout {
                        operation: std::mem::take(&mut self.operation),
                        after,
                    });
                }
            },
        };
        // Sender dropped unsettled: only happens when the table itself is gone.
        received.unwrap_or(Err(BridgeError::Terminated))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let Some(id) = self.id else { return };
        if self.shared.pending.forget(&id) {
            tracing::trace!(role = %self.shared.role, call_id = %id, "Abandoned call forgotten");
        }
    }
}

impl Shared {
    fn new(
        role: Role,
        label: String,
        config: BridgeConfig,
        registry: HandlerRegistry,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            role,
            label,
            config,
            registry,
            pending: PendingCalls::new(),
            outbound,
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn is_open(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn call<O: Operation>(
        self: &Arc<Self>,
        args: O::Args,
        timeout: Option<Duration>,
    ) -> Result<O::Output, BridgeError> {
        let mut reply = self.begin_typed::<O>(&args);
        reply.timeout = timeout;
        let value = reply.wait().await?;
        decode_args::<(O::Output,)>(vec![value])
            .map(|(output,)| output)
            .map_err(BridgeError::codec)
    }

    fn begin_typed<O: Operation>(self: &Arc<Self>, args: &O::Args) -> PendingReply {
        match encode_args(args) {
            Ok(args) => self.begin(O::NAME, self.config.call_timeout, |id| {
                Envelope::call(id, O::NAME, args)
            }),
            Err(e) => self.failed_reply(O::NAME, BridgeError::codec(e)),
        }
    }

    async fn ping(self: &Arc<Self>) -> Result<VersionInfo, BridgeError> {
        let value = self
            .begin(PING, Some(self.config.ping_timeout), |id| Envelope::Ping { id })
            .wait()
            .await?;
        serde_json::from_value(value).map_err(BridgeError::codec)
    }

    fn begin(
        self: &Arc<Self>,
        operation: &str,
        timeout: Option<Duration>,
        build: impl FnOnce(CallId) -> Envelope,
    ) -> PendingReply {
        if !self.is_open() {
            return self.failed_reply(operation, BridgeError::Unreachable);
        }
        let (id, rx) = self.pending.register(operation);
        if self.outbound.send(build(id)).is_err() {
            self.pending.forget(&id);
            return self.failed_reply(operation, BridgeError::Unreachable);
        }
        // Closed between the check and registration: reject_all may have missed us.
        if self.terminated.load(Ordering::SeqCst) {
            self.pending.complete(&id, |_| Err(BridgeError::Terminated));
        } else if self.closed.load(Ordering::SeqCst) {
            self.pending.complete(&id, |_| Err(BridgeError::Unreachable));
        }
        tracing::trace!(role = %self.role, call_id = %id, %operation, "Call posted");
        PendingReply {
            shared: Arc::clone(self),
            operation: operation.to_string(),
            timeout,
            id: Some(id),
            state: ReplyState::Waiting(rx),
        }
    }

    fn failed_reply(self: &Arc<Self>, operation: &str, err: BridgeError) -> PendingReply {
        PendingReply {
            shared: Arc::clone(self),
            operation: operation.to_string(),
            timeout: None,
            id: None,
            state: ReplyState::Failed(err),
        }
    }

    fn post(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            tracing::trace!(role = %self.role, "Channel closed, dropping outbound envelope");
        }
    }

    async fn receive(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Call { id, name, args } => self.dispatch(id, name, args).await,
            Envelope::Response {
                id,
                ok,
                value,
                error,
            } => {
                let outcome = response_outcome(ok, value, error);
                self.pending.complete(&id, |operation| {
                    outcome.map_err(|failure| BridgeError::from_failure(operation, failure))
                });
            }
            Envelope::Ping { id } => {
                tracing::trace!(role = %self.role, call_id = %id, "Answering ping");
                self.post(Envelope::Pong {
                    id,
                    version: self.config.version.clone(),
                });
            }
            Envelope::Pong { id, version } => {
                self.pending.complete(&id, |_| {
                    serde_json::to_value(&version).map_err(BridgeError::codec)
                });
            }
        }
    }

    /// Start the handler for an inbound call.
    ///
    /// The first poll runs on the reader, so handlers start in arrival order
    /// and everything before their first suspension point runs in that order.
    /// Only the remainder is spawned; async bodies may interleave.
    async fn dispatch(self: &Arc<Self>, id: CallId, name: String, args: Vec<Value>) {
        let Some(handler) = self.registry.get(&name) else {
            tracing::debug!(role = %self.role, call_id = %id, operation = %name, "No handler registered");
            self.post(Envelope::failure(id, Failure::unknown_handler(&name)));
            return;
        };

        let mut invocation =
            Box::pin(AssertUnwindSafe(async move { handler.invoke(args).await }).catch_unwind());
        if let Poll::Ready(result) = futures::poll!(invocation.as_mut()) {
            self.finish(id, &name, result);
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = invocation.await;
            shared.finish(id, &name, result);
        });
    }

    fn finish(
        &self,
        id: CallId,
        name: &str,
        result: Result<Result<Value, Failure>, Box<dyn Any + Send>>,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(role = %self.role, call_id = %id, operation = %name, %message, "Handler panicked");
                Err(Failure::handler_threw(format!("handler panicked: {message}")))
            }
        };
        if let Err(failure) = &outcome {
            tracing::debug!(
                role = %self.role,
                call_id = %id,
                operation = %name,
                kind = ?failure.kind,
                message = %failure.message,
                "Handler failed"
            );
        }
        self.post(Envelope::from_outcome(id, outcome));
    }

    /// Why this envelope cannot go on the wire, if it cannot.
    fn unsendable(&self, envelope: &Envelope) -> Option<String> {
        let max = self.config.max_frame_length;
        match encoded_len(envelope) {
            Ok(len) if len <= max => None,
            Ok(len) => Some(format!("envelope of {len} bytes exceeds the {max} byte frame limit")),
            Err(e) => Some(format!("envelope cannot be serialized: {e}")),
        }
    }

    /// Fail a single envelope that cannot be sent; the channel stays up.
    fn reject_unsendable(&self, envelope: Envelope, reason: String) {
        match envelope {
            Envelope::Call { id, name, .. } => {
                tracing::warn!(role = %self.role, call_id = %id, operation = %name, %reason, "Call not sent");
                self.pending.complete(&id, |_| Err(BridgeError::Codec(reason)));
            }
            Envelope::Response { id, .. } => {
                tracing::warn!(role = %self.role, call_id = %id, %reason, "Result not sent");
                let failure = Failure::handler_threw(format!("result too large to send: {reason}"));
                self.post(Envelope::failure(id, failure));
            }
            Envelope::Ping { id } => {
                self.pending.complete(&id, |_| Err(BridgeError::Codec(reason)));
            }
            Envelope::Pong { id, .. } => {
                tracing::warn!(role = %self.role, call_id = %id, %reason, "Pong not sent");
            }
        }
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let rejected = self.pending.reject_all(|| BridgeError::Terminated);
        tracing::debug!(role = %self.role, channel = %self.label, rejected, "Bridge terminated");
        self.shutdown.cancel();
    }

    fn mark_unreachable(&self) {
        if self.closed.swap(true, Ordering::SeqCst) || self.terminated.load(Ordering::SeqCst) {
            self.shutdown.cancel();
            return;
        }
        let rejected = self.pending.reject_all(|| BridgeError::Unreachable);
        tracing::warn!(role = %self.role, channel = %self.label, rejected, "Channel closed, peer unreachable");
        self.shutdown.cancel();
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: EnvelopeSink,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,

            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                if let Some(reason) = shared.unsendable(&envelope) {
                    shared.reject_unsendable(envelope, reason);
                } else if let Err(e) = sink.send(envelope).await {
                    tracing::warn!(role = %shared.role, error = %e, "Failed to post envelope");
                    shared.mark_unreachable();
                    break;
                }
            }
        }
    }
    if let Err(e) = sink.close().await {
        tracing::trace!(role = %shared.role, error = %e, "Channel close failed");
    }
    tracing::trace!(role = %shared.role, "Writer task exiting");
}

async fn read_loop(shared: Arc<Shared>, mut stream: EnvelopeStream) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(envelope)) => shared.receive(envelope).await,
            // FramedRead yields nothing after a decode error, so any read
            // error ends the channel.
            Some(Err(e)) => {
                tracing::error!(role = %shared.role, error = %e, "Channel read error");
                shared.mark_unreachable();
                break;
            }
            None => {
                shared.mark_unreachable();
                break;
            }
        }
    }
    tracing::trace!(role = %shared.role, "Reader task exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
