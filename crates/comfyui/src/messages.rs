//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI pushes JSON text frames shaped `{"type": "<kind>", "data": {...}}`.
//! Parsing happens in two steps: the envelope first, then the payload for
//! the kinds this crate models. Kinds it does not model come back as
//! [`ComfyUIMessage::Other`] instead of an error, so new server versions
//! do not break the wait loop.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Push messages a job may observe.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth).
    Status(StatusData),
    /// A prompt has started executing.
    ExecutionStart(PromptRef),
    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(ExecutionCachedData),
    /// A node is executing, or the prompt finished when `node` is `None`.
    Executing(ExecutingData),
    /// Step-level progress inside a node.
    Progress(ProgressData),
    /// A node finished and produced output.
    Executed(ExecutedData),
    /// Newer servers announce success explicitly before the final
    /// `executing` frame.
    ExecutionSuccess(PromptRef),
    /// Execution failed inside a node.
    ExecutionError(ErrorData),
    /// Execution was interrupted (e.g. via `/interrupt`).
    ExecutionInterrupted(InterruptedData),
    /// Any message kind not listed above.
    Other { kind: String },
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i64,
}

/// Payload carrying only the prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ComfyUIMessage {
    /// Prompt the message refers to, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::ExecutionStart(d) | ComfyUIMessage::ExecutionSuccess(d) => {
                Some(d.prompt_id.as_str())
            }
            ComfyUIMessage::ExecutionCached(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::Executing(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Progress(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Executed(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::ExecutionError(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::ExecutionInterrupted(d) => Some(d.prompt_id.as_str()),
            ComfyUIMessage::Status(_) | ComfyUIMessage::Other { .. } => None,
        }
    }

    /// True for `executing` with a null node for exactly `prompt_id`,
    /// which ComfyUI sends once the whole graph has run.
    pub fn completes(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            ComfyUIMessage::Executing(ExecutingData { node: None, prompt_id: Some(id) })
                if id == prompt_id
        )
    }
}

/// Parse a ComfyUI WebSocket text message.
///
/// Returns `Err` for malformed JSON or a known kind with a malformed
/// payload. Callers should log and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let data = envelope.data;

    Ok(match envelope.kind.as_str() {
        "status" => ComfyUIMessage::Status(payload(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(payload(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(payload(data)?),
        "executing" => ComfyUIMessage::Executing(payload(data)?),
        "progress" => ComfyUIMessage::Progress(payload(data)?),
        "executed" => ComfyUIMessage::Executed(payload(data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess(payload(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(payload(data)?),
        "execution_interrupted" => ComfyUIMessage::ExecutionInterrupted(payload(data)?),
        _ => ComfyUIMessage::Other {
            kind: envelope.kind,
        },
    })
}

fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn executing_with_null_node_completes_own_prompt_only() {
        let msg = parse_message(r#"{"type":"executing","data":{"node":null,"prompt_id":"p-1"}}"#)
            .unwrap();
        assert!(msg.completes("p-1"));
        assert!(!msg.completes("p-2"));
    }

    #[test]
    fn executing_with_node_does_not_complete() {
        let msg = parse_message(
            r#"{"type":"executing","data":{"node":"42","display_node":"42","prompt_id":"p-1"}}"#,
        )
        .unwrap();
        assert!(!msg.completes("p-1"));
        assert_eq!(msg.prompt_id(), Some("p-1"));
    }

    #[test]
    fn executing_without_prompt_id_never_completes() {
        let msg = parse_message(r#"{"type":"executing","data":{"node":null}}"#).unwrap();
        assert!(!msg.completes(""));
        assert!(msg.prompt_id().is_none());
    }

    #[test]
    fn status_message_carries_queue_depth() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"abc"}}"#;
        assert_matches!(
            parse_message(json).unwrap(),
            ComfyUIMessage::Status(data) if data.status.exec_info.queue_remaining == 3
        );
    }

    #[test]
    fn execution_error_payload() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"5","node_type":"KSampler","exception_message":"out of memory","exception_type":"torch.OutOfMemoryError","traceback":[]}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.prompt_id(), Some("p"));
        assert_matches!(msg, ComfyUIMessage::ExecutionError(data) => {
            assert_eq!(data.node_id.as_deref(), Some("5"));
            assert_eq!(data.exception_message, "out of memory");
        });
    }

    #[test]
    fn execution_cached_without_nodes() {
        let msg = parse_message(r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#).unwrap();
        assert_matches!(msg, ComfyUIMessage::ExecutionCached(data) if data.nodes.is_empty());
    }

    #[test]
    fn unknown_kind_is_other_not_error() {
        let msg = parse_message(r#"{"type":"crystools.monitor","data":{"cpu":12.5}}"#).unwrap();
        assert_matches!(msg, ComfyUIMessage::Other { kind } if kind == "crystools.monitor");
    }

    #[test]
    fn known_kind_with_bad_payload_is_error() {
        assert!(parse_message(r#"{"type":"progress","data":{"value":"x"}}"#).is_err());
    }

    #[test]
    fn invalid_json_is_error() {
        assert!(parse_message("not json at all").is_err());
    }
}
