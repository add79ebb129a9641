//! High-level language client
//!
//! [`LanguageClient`] wraps a [`JsonRpcChannel`] with the LSP session
//! protocol: it launches the server, performs the initialize handshake,
//! keeps the server's reported capabilities, and decodes the two
//! notifications servers push at clients - published diagnostics (cached
//! per document URI) and log messages (offered to delegates).

use crate::messages::{
    Diagnostic, InitializeParams, InitializeResult, LogMessageParams, PublishDiagnosticsParams,
    ServerCapabilities,
};
use crate::rpc::channel::JsonRpcChannel;
use crate::rpc::protocol::{NotificationMessage, RpcError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Notification methods the client decodes itself
const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
const LOG_MESSAGE: &str = "window/logMessage";

/// Receives notifications the client has decoded on a listener's behalf
pub trait NotificationDelegate: Send + Sync {
    /// Called with the full replacement diagnostic set for the document the
    /// delegate registered for
    fn receive_diagnostics(&self, diagnostics: &[Diagnostic]);

    /// Called with a server log message. Return `true` to mark the message
    /// handled and stop it being offered to further delegates.
    fn receive_log_message(&self, message: &LogMessageParams) -> bool;
}

#[derive(Default)]
struct ClientState {
    /// Capabilities reported by the server, populated after initialization
    capabilities: Mutex<Option<ServerCapabilities>>,

    /// Latest diagnostic set per document URI. Each publish replaces the
    /// document's previous set wholesale.
    diagnostics: Mutex<HashMap<String, Vec<Diagnostic>>>,

    /// Delegates with the document URI each one registered for
    delegates: Mutex<Vec<(String, Arc<dyn NotificationDelegate>)>>,
}

/// A client for a language server process, speaking LSP over its stdio
pub struct LanguageClient {
    channel: JsonRpcChannel,
    state: Arc<ClientState>,
}

impl LanguageClient {
    /// Create a client; no server is started until [`start_server`]
    ///
    /// [`start_server`]: LanguageClient::start_server
    pub fn new() -> Self {
        let channel = JsonRpcChannel::new();
        let state = Arc::new(ClientState::default());

        {
            let state = Arc::clone(&state);
            channel.on_notification(PUBLISH_DIAGNOSTICS, move |payload| {
                state.handle_diagnostics(&payload);
            });
        }
        {
            let state = Arc::clone(&state);
            channel.on_notification(LOG_MESSAGE, move |payload| {
                state.handle_log_message(&payload);
            });
        }

        Self { channel, state }
    }

    /// Set environment variables passed to the server process on launch
    pub fn set_environment(&self, environment: HashMap<String, String>) {
        self.channel.set_environment(environment);
    }

    /// Register a delegate for notifications about a particular document
    pub fn register_delegate(&self, uri: impl Into<String>, delegate: Arc<dyn NotificationDelegate>) {
        self.state
            .delegates
            .lock()
            .unwrap()
            .push((uri.into(), delegate));
    }

    /// Start the language server at `server_path` and initialize it for the
    /// content rooted at `source_path`
    pub async fn start_server(
        &self,
        server_path: &str,
        source_path: &str,
    ) -> Result<InitializeResult, RpcError> {
        info!(server_path, source_path, "starting language server");
        self.channel.start_channel(server_path).await?;
        self.initialize(source_path).await
    }

    /// Run the initialize handshake over the already-connected channel
    async fn initialize(&self, source_path: &str) -> Result<InitializeResult, RpcError> {
        let params = InitializeParams::new(source_path);
        let result: InitializeResult = self
            .channel
            .send_request("initialize", Some(params))
            .await?;

        *self.state.capabilities.lock().unwrap() = Some(result.capabilities.clone());

        // Servers may defer work until the client confirms the handshake
        self.channel
            .send_notification::<serde_json::Value>("initialized", Some(serde_json::json!({})))
            .await?;

        Ok(result)
    }

    /// Capabilities the server reported, once initialized
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.state.capabilities.lock().unwrap().clone()
    }

    /// The latest diagnostics published for `uri`
    pub fn diagnostics_for(&self, uri: &str) -> Vec<Diagnostic> {
        self.state
            .diagnostics
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the server process is alive right now
    pub async fn is_running(&self) -> bool {
        self.channel.is_running().await
    }

    /// Send an arbitrary typed request to the server
    pub async fn send_request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, RpcError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.channel.send_request(method, params).await
    }

    /// Send an arbitrary typed notification to the server
    pub async fn send_notification<P>(&self, method: &str, params: Option<P>) -> Result<(), RpcError>
    where
        P: serde::Serialize,
    {
        self.channel.send_notification(method, params).await
    }

    /// End the session: ask the server to shut down, tell it to exit, then
    /// tear the channel down
    ///
    /// The polite sequence is best-effort; the channel is torn down even if
    /// the server no longer answers.
    pub async fn shutdown(&self) {
        match self
            .channel
            .send_request::<(), serde_json::Value>("shutdown", None)
            .await
        {
            Ok(_) => {
                if let Err(e) = self.channel.send_notification::<()>("exit", None).await {
                    debug!("exit notification not delivered: {}", e);
                }
            }
            Err(e) => warn!("shutdown request failed: {}", e),
        }

        self.channel.shutdown_channel().await;
    }
}

impl Default for LanguageClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientState {
    fn handle_diagnostics(&self, payload: &[u8]) {
        let message: NotificationMessage<PublishDiagnosticsParams> =
            match serde_json::from_slice(payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("undecodable diagnostics notification: {}", e);
                    return;
                }
            };

        let params = message.params;
        debug!(
            uri = %params.uri,
            count = params.diagnostics.len(),
            "diagnostics published"
        );

        self.diagnostics
            .lock()
            .unwrap()
            .insert(params.uri.clone(), params.diagnostics.clone());

        let delegates = self.delegates.lock().unwrap().clone();
        for (uri, delegate) in &delegates {
            if *uri == params.uri {
                delegate.receive_diagnostics(&params.diagnostics);
            }
        }
    }

    fn handle_log_message(&self, payload: &[u8]) {
        let message: NotificationMessage<LogMessageParams> =
            match serde_json::from_slice(payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("undecodable log message notification: {}", e);
                    return;
                }
            };

        debug!(kind = message.params.kind.0, "server log: {}", message.params.message);

        // Offer to delegates in registration order until one claims it
        let delegates = self.delegates.lock().unwrap().clone();
        for (_, delegate) in &delegates {
            if delegate.receive_log_message(&message.params) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::{MockTransport, MockTransportHandle};
    use crate::messages::MessageType;
    use crate::rpc::framing::{HEADER_TERMINATOR, encode_frame};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(10);
    const DEADLINE: Duration = Duration::from_secs(5);

    fn mock_client() -> (LanguageClient, MockTransportHandle) {
        let (transport, handle) = MockTransport::new();
        let client = LanguageClient::new();
        client.channel.connect_transport(transport);
        (client, handle)
    }

    fn sent_body(frame: &[u8]) -> Value {
        let at = frame
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
            .unwrap();
        serde_json::from_slice(&frame[at + HEADER_TERMINATOR.len()..]).unwrap()
    }

    fn push_json(handle: &MockTransportHandle, body: Value) {
        handle.push_chunk(encode_frame(body.to_string().as_bytes()));
    }

    async fn wait_for_sent(handle: &MockTransportHandle, count: usize) {
        timeout(DEADLINE, async {
            while handle.sent_count() < count {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .expect("expected frames were never written");
    }

    struct RecordingDelegate {
        diagnostics: Mutex<Vec<Vec<Diagnostic>>>,
        log_messages: Mutex<Vec<LogMessageParams>>,
        claims_logs: bool,
    }

    impl RecordingDelegate {
        fn new(claims_logs: bool) -> Arc<Self> {
            Arc::new(Self {
                diagnostics: Mutex::new(Vec::new()),
                log_messages: Mutex::new(Vec::new()),
                claims_logs,
            })
        }
    }

    impl NotificationDelegate for RecordingDelegate {
        fn receive_diagnostics(&self, diagnostics: &[Diagnostic]) {
            self.diagnostics.lock().unwrap().push(diagnostics.to_vec());
        }

        fn receive_log_message(&self, message: &LogMessageParams) -> bool {
            self.log_messages.lock().unwrap().push(message.clone());
            self.claims_logs
        }
    }

    fn diagnostics_note(uri: &str, messages: &[&str]) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri,
                "diagnostics": messages.iter().map(|m| json!({
                    "range": {
                        "start": {"line": 0, "character": 0},
                        "end": {"line": 0, "character": 1}
                    },
                    "severity": 1,
                    "message": m
                })).collect::<Vec<_>>()
            }
        })
    }

    #[tokio::test]
    async fn test_initialize_handshake_captures_capabilities() {
        let (client, handle) = mock_client();

        let session = {
            let channel = client.channel.clone();
            let state = Arc::clone(&client.state);
            tokio::spawn(async move {
                let shadow = LanguageClient { channel, state };
                shadow.initialize("/work/project").await
            })
        };

        wait_for_sent(&handle, 1).await;
        let body = sent_body(&handle.sent()[0]);
        assert_eq!(body["method"], "initialize");
        assert_eq!(body["params"]["rootPath"], "/work/project");

        push_json(
            &handle,
            json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": {"capabilities": {"hoverProvider": true, "textDocumentSync": 1}}
            }),
        );

        let result = timeout(DEADLINE, session).await.unwrap().unwrap().unwrap();
        assert_eq!(result.capabilities.hover_provider, Some(true));
        assert_eq!(client.capabilities().unwrap().hover_provider, Some(true));

        // The handshake confirmation follows the response
        wait_for_sent(&handle, 2).await;
        let confirm = sent_body(&handle.sent()[1]);
        assert_eq!(confirm["method"], "initialized");
        assert!(confirm.get("id").is_none());
    }

    #[tokio::test]
    async fn test_diagnostics_cached_per_uri_and_replaced() {
        let (client, handle) = mock_client();

        push_json(&handle, diagnostics_note("file:///a.rs", &["first", "second"]));
        push_json(&handle, diagnostics_note("file:///b.rs", &["other file"]));

        timeout(DEADLINE, async {
            while client.diagnostics_for("file:///b.rs").is_empty() {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(client.diagnostics_for("file:///a.rs").len(), 2);
        assert_eq!(client.diagnostics_for("file:///b.rs").len(), 1);
        assert!(client.diagnostics_for("file:///c.rs").is_empty());

        // A new publish replaces the cached set, including clearing it
        push_json(&handle, diagnostics_note("file:///a.rs", &[]));
        timeout(DEADLINE, async {
            while !client.diagnostics_for("file:///a.rs").is_empty() {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delegate_receives_only_its_document() {
        let (client, handle) = mock_client();

        let delegate_a = RecordingDelegate::new(false);
        let delegate_b = RecordingDelegate::new(false);
        client.register_delegate("file:///a.rs", delegate_a.clone());
        client.register_delegate("file:///b.rs", delegate_b.clone());

        push_json(&handle, diagnostics_note("file:///a.rs", &["only for a"]));

        timeout(DEADLINE, async {
            while delegate_a.diagnostics.lock().unwrap().is_empty() {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(delegate_a.diagnostics.lock().unwrap().len(), 1);
        assert!(delegate_b.diagnostics.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_message_stops_at_first_claiming_delegate() {
        let (client, handle) = mock_client();

        let first = RecordingDelegate::new(true);
        let second = RecordingDelegate::new(false);
        client.register_delegate("file:///a.rs", first.clone());
        client.register_delegate("file:///b.rs", second.clone());

        push_json(
            &handle,
            json!({
                "jsonrpc": "2.0",
                "method": "window/logMessage",
                "params": {"type": 1, "message": "compile error"}
            }),
        );

        timeout(DEADLINE, async {
            while first.log_messages.lock().unwrap().is_empty() {
                tokio::time::sleep(TICK).await;
            }
        })
        .await
        .unwrap();

        let received = first.log_messages.lock().unwrap();
        assert_eq!(received[0].kind, MessageType::ERROR);
        assert_eq!(received[0].message, "compile error");
        assert!(second.log_messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_sends_polite_sequence() {
        let (client, handle) = mock_client();

        let shutdown = {
            let channel = client.channel.clone();
            let state = Arc::clone(&client.state);
            tokio::spawn(async move {
                let shadow = LanguageClient { channel, state };
                shadow.shutdown().await;
            })
        };

        wait_for_sent(&handle, 1).await;
        let request = sent_body(&handle.sent()[0]);
        assert_eq!(request["method"], "shutdown");

        push_json(
            &handle,
            json!({"jsonrpc": "2.0", "id": request["id"], "result": null}),
        );

        timeout(DEADLINE, shutdown).await.unwrap().unwrap();

        let sent = handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent_body(&sent[1])["method"], "exit");

        // The channel is terminal afterwards
        let result = client
            .send_request::<Value, Value>("textDocument/hover", None)
            .await;
        assert!(matches!(result, Err(RpcError::ProcessNotRunning)));
    }
}
