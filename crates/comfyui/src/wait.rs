//! Completion wait on a ComfyUI push channel.
//!
//! Reads frames until ComfyUI reports that a given prompt has finished
//! (`executing` with a null node for that prompt id). The wait is bounded
//! by a deadline and can be cancelled; a closed channel ends it instead
//! of blocking forever.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_message, ComfyUIMessage};

/// Default upper bound on how long a single prompt may run.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Execution timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("WebSocket closed before prompt {prompt_id} completed")]
    ConnectionClosed { prompt_id: String },

    #[error("WebSocket receive error: {0}")]
    Receive(#[from] tungstenite::Error),

    #[error("Execution of prompt {prompt_id} failed: {message}")]
    ExecutionFailed { prompt_id: String, message: String },
}

/// Block until `prompt_id` completes, the deadline passes, or `cancel`
/// fires.
///
/// Frames for other prompts, progress for non-final nodes, binary
/// preview frames, and unparseable text are ignored.
pub async fn wait_for_completion<S>(
    stream: &mut S,
    prompt_id: &str,
    options: WaitOptions,
    cancel: &CancellationToken,
) -> Result<(), WaitError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        result = tokio::time::timeout(options.timeout, read_until_complete(stream, prompt_id)) => {
            result.map_err(|_| WaitError::TimedOut(options.timeout))?
        }
    }
}

async fn read_until_complete<S>(stream: &mut S, prompt_id: &str) -> Result<(), WaitError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => {
                if handle_text(&text, prompt_id)? {
                    return Ok(());
                }
            }
            Message::Binary(_) => {
                tracing::trace!(prompt_id, "Ignoring binary message (preview image)");
            }
            Message::Close(frame) => {
                tracing::info!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                break;
            }
            // Ping/pong are answered by tungstenite.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    Err(WaitError::ConnectionClosed {
        prompt_id: prompt_id.to_string(),
    })
}

/// Returns `Ok(true)` once the completion frame for `prompt_id` arrives.
fn handle_text(text: &str, prompt_id: &str) -> Result<bool, WaitError> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to parse ComfyUI message");
            return Ok(false);
        }
    };

    if msg.completes(prompt_id) {
        tracing::info!(prompt_id, "Execution completed (all nodes done)");
        return Ok(true);
    }

    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
        tracing::trace!(prompt_id, other = ?msg.prompt_id(), "Ignoring message for another prompt");
        return Ok(false);
    }

    match msg {
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            Err(WaitError::ExecutionFailed {
                prompt_id: prompt_id.to_string(),
                message: format!(
                    "{} in node {}: {}",
                    data.exception_type,
                    data.node_id.as_deref().unwrap_or("?"),
                    data.exception_message
                ),
            })
        }
        ComfyUIMessage::ExecutionInterrupted(data) => Err(WaitError::ExecutionFailed {
            prompt_id: prompt_id.to_string(),
            message: format!(
                "interrupted at node {}",
                data.node_id.as_deref().unwrap_or("?")
            ),
        }),
        ComfyUIMessage::Executing(data) => {
            tracing::debug!(prompt_id, node = ?data.node, "Executing node");
            Ok(false)
        }
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(prompt_id, value = data.value, max = data.max, "Generation progress");
            Ok(false)
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            Ok(false)
        }
        other => {
            tracing::trace!(prompt_id, message = ?other, "Ignoring message");
            Ok(false)
        }
    }
}
