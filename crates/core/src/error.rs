#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Node not found: {role} node '{id}' is not in the workflow")]
    NodeNotFound { role: &'static str, id: String },

    #[error("No {role} node found (expected class types: {expected})")]
    RoleUnmatched { role: &'static str, expected: String },

    #[error("Ambiguous {role} node: {count} candidates ({ids})")]
    RoleAmbiguous {
        role: &'static str,
        count: usize,
        ids: String,
    },
}
