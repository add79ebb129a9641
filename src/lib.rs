//! Async client for language servers speaking Content-Length framed
//! JSON-RPC over stdio
//!
//! The crate launches a language server as a child process, frames JSON-RPC
//! messages onto its stdin/stdout pipes, correlates responses back to the
//! request that caused them, and dispatches server-initiated notifications
//! to registered handlers.
//!
//! Layers, bottom up:
//!
//! - [`io`]: child process lifecycle and raw byte transport
//! - [`rpc`]: Content-Length framing, the JSON-RPC message model, and the
//!   correlating channel
//! - [`messages`]: typed LSP payloads for the handshake and the
//!   notifications the client decodes
//! - [`client`]: the [`LanguageClient`] session façade
//!
//! ```no_run
//! use language_client::LanguageClient;
//!
//! # async fn example() -> Result<(), language_client::RpcError> {
//! let client = LanguageClient::new();
//! let result = client.start_server("/usr/bin/clangd", "/work/project").await?;
//! println!("hover support: {:?}", result.capabilities.hover_provider);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod io;
pub mod logging;
pub mod messages;
pub mod rpc;

pub use client::{LanguageClient, NotificationDelegate};
pub use io::{ChildProcessManager, ProcessManager, ProcessState, StopMode, Transport};
pub use messages::{
    Diagnostic, DiagnosticSeverity, InitializeResult, LogMessageParams, MessageType,
    ServerCapabilities,
};
pub use rpc::{JsonRpcChannel, RpcError};
