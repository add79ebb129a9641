//! JSON-RPC channel - request correlation and notification dispatch
//!
//! [`JsonRpcChannel`] composes the process, transport and framing layers
//! into two public operations: send a request and await its typed result,
//! or send a fire-and-forget notification. Inbound frames are peeked for an
//! `id` (routed to the matching pending request) or a `method` (routed to
//! the handler registered for it); anything else is logged and dropped.
//!
//! Concurrency model: any number of callers may hold the channel (it is
//! cheaply cloneable) and issue requests concurrently. All outbound frames
//! funnel through one queue drained by a single I/O task, so writes never
//! interleave; the same task owns the inbound frame buffer exclusively.
//! Results are delivered through per-request oneshot channels, so a slow
//! caller never stalls the read path.

use crate::io::process::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StopMode,
};
use crate::io::transport::Transport;
use crate::rpc::framing::{FrameBuffer, encode_frame};
use crate::rpc::protocol::{
    JsonRpcNotification, JsonRpcRequest, MessageEnvelope, RpcError, WrappedResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// Handler invoked with the raw payload of a notification frame
///
/// Decoding is the handler's responsibility, since the payload shape is
/// method-specific.
type NotificationHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// A channel speaking framed JSON-RPC with a server child process
///
/// Clones share the same underlying channel state.
#[derive(Clone)]
pub struct JsonRpcChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    /// Request id counter; incremented before each use and rendered as a
    /// decimal string
    next_id: AtomicU64,

    /// Launch generation, bumped on every connect/shutdown. Cleanup paths
    /// belonging to a superseded launch compare against it and back off.
    generation: AtomicU64,

    /// Pending requests: id to the oneshot delivering the raw response.
    /// Inserted from caller contexts, removed from the read path.
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,

    /// Notification handlers keyed by method name; last registration wins
    handlers: Mutex<HashMap<String, NotificationHandler>>,

    /// Queue into the current I/O task, present only while connected
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,

    /// The server process, when this channel launched one itself
    process: tokio::sync::Mutex<Option<ChildProcessManager>>,

    /// Last-known server executable path, used for notification relaunch
    server_path: Mutex<Option<String>>,

    /// Environment overlay applied to every launch
    environment: Mutex<HashMap<String, String>>,
}

impl JsonRpcChannel {
    /// Create a channel with no transport attached yet
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                next_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                process: tokio::sync::Mutex::new(None),
                server_path: Mutex::new(None),
                environment: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Set the environment overlay merged into the server process
    /// environment on the next launch
    pub fn set_environment(&self, environment: HashMap<String, String>) {
        *self.inner.environment.lock().unwrap() = environment;
    }

    /// Launch the server executable at `path` and bind this channel to its
    /// stdio pipes
    ///
    /// The path is remembered: a later notification sent while the process
    /// is dead relaunches from it. Requests still pending on a previous
    /// incarnation fail with [`RpcError::ProcessNotRunning`]; only the new
    /// process could ever answer them, and it never saw them. Launching
    /// never blocks on the child; the spawn itself is the only awaited
    /// step.
    pub async fn start_channel(&self, path: &str) -> Result<(), RpcError> {
        let generation = self.supersede();

        let environment = self.inner.environment.lock().unwrap().clone();
        let mut manager = ChildProcessManager::new(path.to_string(), Vec::new(), environment);
        manager.set_exit_handler(Arc::new(ExitWatcher {
            inner: Arc::downgrade(&self.inner),
            generation,
        }));

        manager.start().await.map_err(RpcError::Launch)?;
        let transport = manager
            .create_stdio_transport()
            .map_err(RpcError::Launch)?;

        *self.inner.server_path.lock().unwrap() = Some(path.to_string());
        {
            let mut guard = self.inner.process.lock().await;
            // A replaced manager force-kills its process on drop
            *guard = Some(manager);
        }

        self.spawn_io(transport, generation);
        Ok(())
    }

    /// Bind this channel to an already-established transport
    ///
    /// Used by tests and by embedders that manage the process themselves;
    /// no relaunch is possible on such a channel. Like [`start_channel`],
    /// rebinding fails any requests pending on the previous transport.
    ///
    /// [`start_channel`]: JsonRpcChannel::start_channel
    pub fn connect_transport<T: Transport + 'static>(&self, transport: T) {
        let generation = self.supersede();
        self.spawn_io(transport, generation);
    }

    /// Retire the current incarnation and return the new generation number
    ///
    /// Requests in flight on the superseded incarnation can never be
    /// answered (its process is being replaced or torn down), so they are
    /// failed here, before the old cleanup paths become generation-stale.
    fn supersede(&self) -> u64 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.outbound.lock().unwrap().take();
        self.inner.reject_all();
        generation
    }

    fn spawn_io<T: Transport + 'static>(&self, transport: T, generation: u64) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock().unwrap() = Some(outbound_tx);
        tokio::spawn(run_io_task(
            transport,
            outbound_rx,
            Arc::clone(&self.inner),
            generation,
        ));
    }

    /// Whether the server process is alive right now
    pub async fn is_running(&self) -> bool {
        let guard = self.inner.process.lock().await;
        guard.as_ref().map(|p| p.is_running()).unwrap_or(false)
    }

    /// Send a request and await its result, decoded as `R`
    ///
    /// The request is assigned the next id from the channel's counter and a
    /// completion is registered before the frame is queued, so a response
    /// can never slip past its waiter. There is no per-request timeout: the
    /// future resolves on a matching response, or fails with
    /// [`RpcError::ProcessNotRunning`] when the channel terminates.
    pub async fn send_request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = params
            .map(|p| serde_json::to_value(p))
            .transpose()
            .map_err(RpcError::Encoding)?;

        let id = self.inner.next_request_id();
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let body = serde_json::to_vec(&request).map_err(RpcError::Encoding)?;

        let receiver = self.inner.register_pending(id.clone());
        debug!(id = %id, method, "sending request");

        if let Err(e) = self.inner.queue_write(&body) {
            self.inner.remove_pending(&id);
            return Err(e);
        }

        let raw = match receiver.await {
            Ok(raw) => raw,
            // Sender dropped: the channel terminated while we were waiting
            Err(_) => return Err(RpcError::ProcessNotRunning),
        };

        let wrapped: WrappedResponse =
            serde_json::from_slice(&raw).map_err(RpcError::Decoding)?;

        if let Some(error) = wrapped.error {
            return Err(RpcError::Server {
                code: error.code,
                message: error.message,
            });
        }

        match wrapped.result {
            Some(value) => serde_json::from_value(value).map_err(RpcError::Decoding),
            // Null results (e.g. shutdown) decode R from null
            None => serde_json::from_value(Value::Null).map_err(|_| RpcError::MissingResult),
        }
    }

    /// Send a fire-and-forget notification
    ///
    /// If this channel launched its server and the process has since died,
    /// one relaunch from the last-known path is attempted first. Requests
    /// deliberately do not share this recovery path (see DESIGN.md).
    pub async fn send_notification<P>(&self, method: &str, params: Option<P>) -> Result<(), RpcError>
    where
        P: Serialize,
    {
        let params = params
            .map(|p| serde_json::to_value(p))
            .transpose()
            .map_err(RpcError::Encoding)?;

        self.relaunch_if_dead().await?;

        let notification = JsonRpcNotification::new(method, params);
        let body = serde_json::to_vec(&notification).map_err(RpcError::Encoding)?;
        debug!(method, "sending notification");
        self.inner.queue_write(&body)
    }

    /// Register the handler for an inbound notification method
    ///
    /// At most one handler per method; registering again replaces the
    /// previous one.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Shut the channel down: terminate the server process, fail every
    /// pending request with [`RpcError::ProcessNotRunning`], and release
    /// the pipes. Idempotent.
    pub async fn shutdown_channel(&self) {
        self.supersede();

        let manager = self.inner.process.lock().await.take();
        if let Some(mut manager) = manager {
            if let Err(e) = manager.stop(StopMode::Graceful).await {
                warn!("error stopping server process: {}", e);
            }
        }
    }

    async fn relaunch_if_dead(&self) -> Result<(), RpcError> {
        if self.is_running().await {
            return Ok(());
        }

        let path = self.inner.server_path.lock().unwrap().clone();
        match path {
            Some(path) => {
                debug!("server process not running, relaunching {}", path);
                self.start_channel(&path).await
            }
            // Never launched by us (external transport): nothing to relaunch
            None => Ok(()),
        }
    }
}

impl Default for JsonRpcChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelInner {
    fn next_request_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn register_pending(&self, id: String) -> oneshot::Receiver<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, sender);
        receiver
    }

    fn remove_pending(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    /// Frame a message body and hand it to the I/O task as one ordered write
    fn queue_write(&self, body: &[u8]) -> Result<(), RpcError> {
        let outbound = self.outbound.lock().unwrap();
        let sender = outbound.as_ref().ok_or(RpcError::ProcessNotRunning)?;
        sender
            .send(encode_frame(body))
            .map_err(|_| RpcError::ProcessNotRunning)
    }

    /// Route one complete inbound frame
    ///
    /// Only the envelope (optional id, optional method) is decoded here;
    /// the full typed decode happens at the destination.
    fn dispatch_frame(&self, frame: Vec<u8>) {
        let envelope: MessageEnvelope = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("dropping undecodable frame: {}", e);
                return;
            }
        };

        if let Some(id) = envelope.id {
            let sender = self.pending.lock().unwrap().remove(&id);
            match sender {
                // The receiver may be gone if the caller gave up; both ways
                // the id leaves the pending set exactly once
                Some(sender) => {
                    let _ = sender.send(frame);
                }
                None => debug!(id = %id, "response for unknown or already-resolved request"),
            }
        } else if let Some(method) = envelope.method {
            let handler = self.handlers.lock().unwrap().get(&method).cloned();
            match handler {
                Some(handler) => {
                    trace!(method = %method, "dispatching notification");
                    // Deliver off the read path so a slow handler cannot
                    // stall frame extraction
                    tokio::spawn(async move { handler(frame) });
                }
                None => debug!(method = %method, "no handler registered for notification"),
            }
        } else {
            debug!("dropping frame with neither id nor method");
        }
    }

    /// Fail every pending request and clear the set
    fn reject_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.is_empty() {
            debug!("rejecting {} pending request(s)", pending.len());
        }
        // Dropping the senders resolves each waiting caller with
        // ProcessNotRunning
        pending.clear();
    }

    /// Terminal transition for the launch identified by `generation`
    ///
    /// A stale generation means a newer launch has already taken over the
    /// channel; its state must not be torn down.
    fn terminate(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!("ignoring termination of superseded channel generation");
            return;
        }
        self.outbound.lock().unwrap().take();
        self.reject_all();
    }
}

/// Rejects pending requests when the wait task sees the process exit, even
/// if the stdout pipe never delivered an EOF
struct ExitWatcher {
    inner: Weak<ChannelInner>,
    generation: u64,
}

#[async_trait::async_trait]
impl ProcessExitHandler for ExitWatcher {
    async fn on_process_exit(&self, _event: ProcessExitEvent) {
        if let Some(inner) = self.inner.upgrade() {
            debug!("server process exited, terminating channel");
            inner.terminate(self.generation);
        }
    }
}

/// The single I/O task: drains the outbound queue into the transport and
/// splits inbound chunks into frames, in strict arrival order
async fn run_io_task<T: Transport + 'static>(
    transport: T,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inner: Arc<ChannelInner>,
    generation: u64,
) {
    let transport = Arc::new(tokio::sync::Mutex::new(transport));
    let mut frames = FrameBuffer::new();

    loop {
        tokio::select! {
            maybe_frame = outbound.recv() => {
                match maybe_frame {
                    Some(bytes) => {
                        let mut transport = transport.lock().await;
                        if let Err(e) = transport.send(&bytes).await {
                            error!("failed to write frame: {}", e);
                            break;
                        }
                    }
                    None => {
                        trace!("outbound queue closed, stopping I/O task");
                        break;
                    }
                }
            }
            chunk = async {
                let mut transport = transport.lock().await;
                transport.receive().await
            } => {
                match chunk {
                    Ok(bytes) => {
                        frames.extend(&bytes);
                        // One chunk may complete several frames; dispatch
                        // them in extraction order
                        while let Some(frame) = frames.next_frame() {
                            inner.dispatch_frame(frame);
                        }
                    }
                    Err(e) => {
                        debug!("transport closed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    inner.terminate(generation);
    trace!("I/O task finished");
}
