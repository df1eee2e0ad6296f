//! Execution history records returned by `GET /history/{prompt_id}`.
//!
//! Only the parts a job reads are modelled: per-node output images.
//! Everything else in the record (status, timing, meta) is ignored.

use std::collections::HashMap;

use serde::Deserialize;

/// History response: prompt id -> record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct History {
    pub entries: HashMap<String, HistoryEntry>,
}

/// One completed prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
}

/// Output produced by a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Storage descriptor of a produced asset, as accepted by `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Folder namespace (`output`, `temp`, ...).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Prompt {0} not found in history")]
    PromptNotFound(String),

    #[error("No output images found for node {node_id}")]
    NoOutput { node_id: String },
}

impl History {
    /// First image produced by `node_id` for `prompt_id`.
    pub fn first_image(&self, prompt_id: &str, node_id: &str) -> Result<&ImageRef, HistoryError> {
        let entry = self
            .entries
            .get(prompt_id)
            .ok_or_else(|| HistoryError::PromptNotFound(prompt_id.to_string()))?;

        entry
            .outputs
            .get(node_id)
            .and_then(|output| output.images.first())
            .ok_or_else(|| HistoryError::NoOutput {
                node_id: node_id.to_string(),
            })
    }
}
