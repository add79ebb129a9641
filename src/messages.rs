//! Typed LSP message payloads
//!
//! The subset of Language Server Protocol shapes the client itself needs:
//! the initialize handshake plus the two server-to-client notifications it
//! decodes (`textDocument/publishDiagnostics` and `window/logMessage`).
//! Everything uses the protocol's camelCase field names on the wire.
//!
//! Server-sent structures deserialize leniently: every capability field is
//! optional and unknown fields are ignored, so a server advertising more
//! than this subset still initializes cleanly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Initialize handshake
// ============================================================================

/// Parameters of the `initialize` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// The client's process id, letting the server exit if the client dies
    pub process_id: Option<u32>,

    /// Root path of the workspace being edited
    pub root_path: Option<String>,

    /// Capabilities provided by the client
    pub capabilities: ClientCapabilities,
}

impl InitializeParams {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            process_id: Some(std::process::id()),
            root_path: Some(root_path.into()),
            capabilities: ClientCapabilities::default(),
        }
    }
}

/// Capabilities advertised to the server
///
/// Empty for now; servers fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCapabilities {}

/// Result of the `initialize` request
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// The capabilities the language server provides
    pub capabilities: ServerCapabilities,
}

/// The capability set a server reports during initialization
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// How text documents should be synced
    #[serde(default)]
    pub text_document_sync: Option<TextDocumentSync>,

    #[serde(default)]
    pub hover_provider: Option<bool>,

    #[serde(default)]
    pub completion_provider: Option<CompletionOptions>,

    #[serde(default)]
    pub definition_provider: Option<bool>,

    #[serde(default)]
    pub references_provider: Option<bool>,

    #[serde(default)]
    pub document_symbol_provider: Option<bool>,

    #[serde(default)]
    pub workspace_symbol_provider: Option<bool>,

    #[serde(default)]
    pub document_formatting_provider: Option<bool>,

    #[serde(default)]
    pub rename_provider: Option<bool>,
}

/// Servers report sync behavior either as a bare kind number or as an
/// options object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TextDocumentSync {
    Kind(i64),
    Options(TextDocumentSyncOptions),
}

impl TextDocumentSync {
    /// The effective sync kind: 0 none, 1 full, 2 incremental
    pub fn sync_kind(&self) -> i64 {
        match self {
            TextDocumentSync::Kind(kind) => *kind,
            TextDocumentSync::Options(options) => options.change.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentSyncOptions {
    #[serde(default)]
    pub open_close: Option<bool>,

    #[serde(default)]
    pub change: Option<i64>,

    #[serde(default)]
    pub save: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOptions {
    #[serde(default)]
    pub resolve_provider: Option<bool>,

    #[serde(default)]
    pub trigger_characters: Option<Vec<String>>,
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Parameters of a `textDocument/publishDiagnostics` notification
#[derive(Debug, Clone, Deserialize)]
pub struct PublishDiagnosticsParams {
    /// The URI of the document the diagnostics belong to
    pub uri: String,

    /// The complete current diagnostic set for that document
    pub diagnostics: Vec<Diagnostic>,
}

/// A single diagnostic reported by the server
#[derive(Debug, Clone, Deserialize)]
pub struct Diagnostic {
    /// The range at which the message applies
    pub range: Range,

    /// Severity; when omitted the client decides how to interpret it
    #[serde(default)]
    pub severity: Option<DiagnosticSeverity>,

    /// The diagnostic's code; servers send either a number or a string
    #[serde(default)]
    pub code: Option<Value>,

    /// Human-readable source, e.g. "clangd"
    #[serde(default)]
    pub source: Option<String>,

    /// The diagnostic's message
    pub message: String,
}

/// Diagnostic severity as defined by the protocol (1 error through 4 hint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticSeverity(pub i64);

impl DiagnosticSeverity {
    pub const ERROR: DiagnosticSeverity = DiagnosticSeverity(1);
    pub const WARNING: DiagnosticSeverity = DiagnosticSeverity(2);
    pub const INFORMATION: DiagnosticSeverity = DiagnosticSeverity(3);
    pub const HINT: DiagnosticSeverity = DiagnosticSeverity(4);
}

/// The most severe diagnostic in a set; unset severity counts as error
pub fn most_severe(diagnostics: &[Diagnostic]) -> Option<&Diagnostic> {
    diagnostics
        .iter()
        .min_by_key(|d| d.severity.unwrap_or(DiagnosticSeverity::ERROR))
}

/// A range in a text document, expressed as start and end positions
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Zero-based line and character offset in a document
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

// ============================================================================
// Log messages
// ============================================================================

/// Parameters of a `window/logMessage` notification
#[derive(Debug, Clone, Deserialize)]
pub struct LogMessageParams {
    /// The message type (1 error through 4 log)
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// The log message text
    pub message: String,
}

/// Log message type as defined by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub i64);

impl MessageType {
    pub const ERROR: MessageType = MessageType(1);
    pub const WARNING: MessageType = MessageType(2);
    pub const INFO: MessageType = MessageType(3);
    pub const LOG: MessageType = MessageType(4);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_params_use_wire_names() {
        let params = InitializeParams::new("/work/project");
        let value = serde_json::to_value(&params).unwrap();

        assert!(value["processId"].is_number());
        assert_eq!(value["rootPath"], "/work/project");
        assert_eq!(value["capabilities"], json!({}));
    }

    #[test]
    fn test_server_capabilities_tolerate_unknown_fields() {
        let result: InitializeResult = serde_json::from_value(json!({
            "capabilities": {
                "textDocumentSync": 2,
                "hoverProvider": true,
                "semanticTokensProvider": {"full": true},
                "experimental": {"anything": 1}
            }
        }))
        .unwrap();

        assert_eq!(result.capabilities.hover_provider, Some(true));
        assert_eq!(
            result.capabilities.text_document_sync.unwrap().sync_kind(),
            2
        );
    }

    #[test]
    fn test_text_document_sync_as_options_object() {
        let capabilities: ServerCapabilities = serde_json::from_value(json!({
            "textDocumentSync": {"openClose": true, "change": 1}
        }))
        .unwrap();

        let sync = capabilities.text_document_sync.unwrap();
        assert_eq!(sync.sync_kind(), 1);
    }

    #[test]
    fn test_publish_diagnostics_decode() {
        let params: PublishDiagnosticsParams = serde_json::from_value(json!({
            "uri": "file:///src/main.cpp",
            "diagnostics": [
                {
                    "range": {
                        "start": {"line": 4, "character": 2},
                        "end": {"line": 4, "character": 9}
                    },
                    "severity": 2,
                    "code": "unused-variable",
                    "source": "clangd",
                    "message": "unused variable 'x'"
                },
                {
                    "range": {
                        "start": {"line": 0, "character": 0},
                        "end": {"line": 0, "character": 1}
                    },
                    "message": "something vague"
                }
            ]
        }))
        .unwrap();

        assert_eq!(params.uri, "file:///src/main.cpp");
        assert_eq!(params.diagnostics.len(), 2);
        assert_eq!(
            params.diagnostics[0].severity,
            Some(DiagnosticSeverity::WARNING)
        );
        assert!(params.diagnostics[1].severity.is_none());
    }

    #[test]
    fn test_most_severe_prefers_errors_and_unset() {
        let diagnostics: Vec<Diagnostic> = serde_json::from_value(json!([
            {
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
                "severity": 4,
                "message": "hint"
            },
            {
                "range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 1}},
                "message": "unset counts as error"
            },
            {
                "range": {"start": {"line": 2, "character": 0}, "end": {"line": 2, "character": 1}},
                "severity": 2,
                "message": "warning"
            }
        ]))
        .unwrap();

        let worst = most_severe(&diagnostics).unwrap();
        assert_eq!(worst.message, "unset counts as error");
        assert!(most_severe(&[]).is_none());
    }

    #[test]
    fn test_log_message_decode() {
        let params: LogMessageParams = serde_json::from_value(json!({
            "type": 3,
            "message": "indexing started"
        }))
        .unwrap();

        assert_eq!(params.kind, MessageType::INFO);
        assert_eq!(params.message, "indexing started");
    }
}
