//! JSON-RPC layer - framing, message model, and the channel
//!
//! Three sublayers, bottom up:
//!
//! - **Framing**: Content-Length header codec and incremental frame
//!   extraction from a chunked byte stream
//! - **Protocol**: JSON-RPC 2.0 message shapes and the error taxonomy
//! - **Channel**: request/response correlation and notification dispatch
//!   over a [`Transport`](crate::io::Transport)

pub mod channel;
pub mod framing;
pub mod protocol;

// Re-export main types for convenience
pub use channel::JsonRpcChannel;
pub use framing::{FrameBuffer, encode_frame};
pub use protocol::{
    JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, NotificationMessage, RpcError,
};
