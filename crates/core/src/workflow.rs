//! ComfyUI workflow graphs in API format.
//!
//! A workflow is a map from node id to `{class_type, inputs}`. Input
//! values are either literals or `[node_id, output_index]` edges. This
//! module locates the nodes playing the roles the adapter cares about
//! (image input, image output, LoRA loaders) and produces patched
//! copies of a graph without mutating the original.

use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Node class / field constants
// ---------------------------------------------------------------------------

/// Input field that names the uploaded image on a load-image node.
pub const IMAGE_FIELD: &str = "image";

/// Input field that names the weights file on a LoRA loader node.
pub const LORA_NAME_FIELD: &str = "lora_name";

/// Node class types recognised as image inputs by default.
pub const DEFAULT_INPUT_CLASSES: &[&str] = &["LoadImage", "LoadImageMask", "LoadImageOutput"];

/// Node class type recognised as the image output by default.
pub const DEFAULT_OUTPUT_CLASS: &str = "SaveImage";

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// A single node descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// ComfyUI class type (e.g. "LoadImage", "KSampler").
    pub class_type: String,
    /// Parameter name -> literal or `[node_id, output_index]` edge.
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Keys the adapter does not interpret (`_meta`, ...), passed through.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A workflow graph keyed by node id, in document order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow {
    nodes: IndexMap<String, WorkflowNode>,
}

impl Workflow {
    /// Build a workflow from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        if !value.is_object() {
            return Err(CoreError::Validation(
                "Workflow must be a JSON object keyed by node id".to_string(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("Malformed workflow: {e}")))
    }

    /// Parse a workflow from JSON text (e.g. the contents of a workflow file).
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Workflow is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Serialize back to the JSON shape the backend expects.
    pub fn to_value(&self) -> Result<Value, CoreError> {
        serde_json::to_value(self)
            .map_err(|e| CoreError::Validation(format!("Workflow cannot be serialized: {e}")))
    }

    pub fn get(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in the order they appear in the document.
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Ids of every node satisfying `pred`, in document order.
    pub fn ids_where<F>(&self, pred: F) -> Vec<&str>
    where
        F: Fn(&WorkflowNode) -> bool,
    {
        self.node_ids()
            .into_iter()
            .filter(|id| self.nodes.get(*id).is_some_and(&pred))
            .collect()
    }

    /// Return a copy of this graph with the patch applied at `roles`.
    ///
    /// The uploaded image name always lands on the input node. LoRA names
    /// are only written when both the role and the patch value exist.
    pub fn patched(&self, roles: &NodeRoles, patch: &Patch) -> Result<Workflow, CoreError> {
        let mut out = self.clone();

        out.set_input(&roles.image_input, "image input", IMAGE_FIELD, &patch.image)?;

        if let (Some(id), Some(name)) = (&roles.lora_background, &patch.lora_background) {
            out.set_input(id, "background LoRA", LORA_NAME_FIELD, name)?;
        }
        if let (Some(id), Some(name)) = (&roles.lora_subject, &patch.lora_subject) {
            out.set_input(id, "subject LoRA", LORA_NAME_FIELD, name)?;
        }

        Ok(out)
    }

    fn set_input(
        &mut self,
        id: &str,
        role: &'static str,
        field: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let node = self.nodes.get_mut(id).ok_or_else(|| CoreError::NodeNotFound {
            role,
            id: id.to_string(),
        })?;
        node.inputs
            .insert(field.to_string(), Value::String(value.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Role resolution
// ---------------------------------------------------------------------------

/// Node ids for each role the adapter patches or reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRoles {
    pub image_input: String,
    pub image_output: String,
    pub lora_background: Option<String>,
    pub lora_subject: Option<String>,
}

/// Values written into the graph before submission.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    /// Stored filename returned by the upload endpoint.
    pub image: String,
    pub lora_background: Option<String>,
    pub lora_subject: Option<String>,
}

/// Pre-agreed node ids for a workflow with known topology.
#[derive(Debug, Clone)]
pub struct FixedNodes {
    pub image_input: String,
    pub image_output: String,
    pub lora_background: Option<String>,
    pub lora_subject: Option<String>,
}

/// How to pick a node when several share a recognised class type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// More than one candidate is an error.
    #[default]
    Unique,
    /// The candidate appearing last in the document wins.
    Last,
}

impl FromStr for MatchPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unique" => Ok(Self::Unique),
            "last" => Ok(Self::Last),
            other => Err(CoreError::Validation(format!(
                "Unknown node match policy: '{other}'. Valid policies: unique, last"
            ))),
        }
    }
}

/// Locates roles in a self-describing workflow by node class type.
#[derive(Debug, Clone)]
pub struct ClassMatcher {
    pub input_classes: Vec<String>,
    pub output_class: String,
    pub policy: MatchPolicy,
}

impl Default for ClassMatcher {
    fn default() -> Self {
        Self {
            input_classes: DEFAULT_INPUT_CLASSES.iter().map(|s| s.to_string()).collect(),
            output_class: DEFAULT_OUTPUT_CLASS.to_string(),
            policy: MatchPolicy::Unique,
        }
    }
}

impl ClassMatcher {
    fn pick(
        &self,
        role: &'static str,
        expected: String,
        candidates: Vec<&str>,
    ) -> Result<String, CoreError> {
        match (candidates.as_slice(), self.policy) {
            ([], _) => Err(CoreError::RoleUnmatched { role, expected }),
            ([only], _) => Ok(only.to_string()),
            (_, MatchPolicy::Unique) => Err(CoreError::RoleAmbiguous {
                role,
                count: candidates.len(),
                ids: candidates.join(", "),
            }),
            (many, MatchPolicy::Last) => Ok(many[many.len() - 1].to_string()),
        }
    }
}

/// Strategy for finding the image-input / image-output nodes of a graph.
#[derive(Debug, Clone)]
pub enum RoleLocator {
    /// Roles addressed by configured node ids.
    Fixed(FixedNodes),
    /// Roles found by scanning node class types.
    ByClass(ClassMatcher),
}

impl RoleLocator {
    pub fn locate(&self, workflow: &Workflow) -> Result<NodeRoles, CoreError> {
        match self {
            RoleLocator::Fixed(nodes) => locate_fixed(nodes, workflow),
            RoleLocator::ByClass(matcher) => locate_by_class(matcher, workflow),
        }
    }
}

fn locate_fixed(nodes: &FixedNodes, workflow: &Workflow) -> Result<NodeRoles, CoreError> {
    let require = |role: &'static str, id: &str| -> Result<String, CoreError> {
        if workflow.get(id).is_some() {
            Ok(id.to_string())
        } else {
            Err(CoreError::NodeNotFound {
                role,
                id: id.to_string(),
            })
        }
    };

    Ok(NodeRoles {
        image_input: require("image input", &nodes.image_input)?,
        image_output: require("image output", &nodes.image_output)?,
        lora_background: nodes
            .lora_background
            .as_deref()
            .map(|id| require("background LoRA", id))
            .transpose()?,
        lora_subject: nodes
            .lora_subject
            .as_deref()
            .map(|id| require("subject LoRA", id))
            .transpose()?,
    })
}

fn locate_by_class(matcher: &ClassMatcher, workflow: &Workflow) -> Result<NodeRoles, CoreError> {
    let inputs = workflow.ids_where(|n| matcher.input_classes.iter().any(|c| *c == n.class_type));
    let outputs = workflow.ids_where(|n| n.class_type == matcher.output_class);

    Ok(NodeRoles {
        image_input: matcher.pick("image input", matcher.input_classes.join(", "), inputs)?,
        image_output: matcher.pick("image output", matcher.output_class.clone(), outputs)?,
        lora_background: None,
        lora_subject: None,
    })
}
