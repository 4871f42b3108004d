/// Errors raised by the weighting core and the graph integration layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdaptiveError {
    /// Malformed prediction or outcome payload. Never leaves a partial weight update behind.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Integration called with a missing graph or an unknown target node.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("layer already registered: {0}")]
    DuplicateLayer(String),

    #[error("layer {0} has no agents")]
    EmptyLayer(String),

    #[error("agent {agent} already belongs to layer {layer}")]
    AgentConflict { agent: String, layer: String },

    #[error("weight calculator {node} already injected for target {target}")]
    DuplicateInjection { target: String, node: String },

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),
}

pub type AdaptiveResult<T> = Result<T, AdaptiveError>;
