//! Transport layer - Pure I/O abstraction for byte-stream exchange
//!
//! This module provides the core transport abstraction that handles
//! bidirectional byte exchange without knowledge of message framing
//! or process management. Chunks read from the peer arrive in order
//! but at arbitrary boundaries; framing is layered on top.

use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Core transport trait for bidirectional byte exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a block of bytes as one ordered write
    async fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Receive the next chunk of bytes (arbitrary length, in arrival order)
    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport implementation using stdin/stdout pipes of a child process
///
/// All writes funnel through a single writer task, so bytes submitted by one
/// `send` call never interleave with another's on the wire. A single reader
/// task owns the stdout pipe and forwards chunks in arrival order.
#[derive(Debug)]
pub struct StdioTransport {
    /// Channel for queueing writes to the stdin writer task
    stdin_sender: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Channel for receiving chunks from the stdout reader task
    stdout_receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,

    /// Connection status
    connected: bool,
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes queued byte blocks to stdin, one at a time
    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(bytes) = receiver.recv().await {
            trace!("StdioTransport: writing {} bytes to stdin", bytes.len());

            if let Err(e) = stdin.write_all(&bytes).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }

            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that reads raw chunks from stdout
    async fn stdout_reader_task(
        mut stdout: ChildStdout,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => {
                    // EOF reached
                    trace!("StdioTransport: stdout reader reached EOF");
                    break;
                }
                Ok(n) => {
                    trace!("StdioTransport: read {} bytes from stdout", n);

                    if sender.send(buf[..n].to_vec()).is_err() {
                        trace!("StdioTransport: stdout receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(bytes.to_vec())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        receiver
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
}

/// Handle for controlling a [`MockTransport`] from a test
///
/// Allows pushing inbound chunks after the transport has been handed to a
/// channel, and inspecting what was sent through it. Dropping every handle
/// signals end-of-stream.
#[derive(Clone)]
pub struct MockTransportHandle {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransportHandle {
    /// Queue a chunk that will be returned by a later `receive()` call
    pub fn push_chunk(&self, chunk: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(chunk.into());
    }

    /// Get all byte blocks that were sent via the transport
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of byte blocks sent so far
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

/// Mock transport for testing - records sent bytes and replays queued chunks
///
/// When every [`MockTransportHandle`] has been dropped, `receive()` reports
/// end-of-stream, mimicking the peer closing its pipe.
pub struct MockTransport {
    /// Byte blocks that were sent via this transport
    sent: Arc<Mutex<Vec<Vec<u8>>>>,

    /// Inbound chunks pushed from the test side
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,

    /// Connection status
    connected: bool,
}

impl MockTransport {
    /// Create a new mock transport and the handle controlling it
    pub fn new() -> (Self, MockTransportHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            sent: Arc::clone(&sent),
            receiver,
            connected: true,
        };
        let handle = MockTransportHandle {
            sent,
            inbound: sender,
        };
        (transport, handle)
    }

    /// Create a mock transport with predefined inbound chunks
    pub fn with_chunks(chunks: Vec<Vec<u8>>) -> (Self, MockTransportHandle) {
        let (transport, handle) = Self::new();
        for chunk in chunks {
            handle.push_chunk(chunk);
        }
        (transport, handle)
    }

    /// Get all byte blocks that were sent via this transport
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.receiver
            .recv()
            .await
            .ok_or(MockTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================
