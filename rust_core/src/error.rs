//! Error types for graph construction, differentiation, compilation and
//! model building.

use thiserror::Error;

/// Errors raised by the expression graph: building nodes, differentiating
/// them, and evaluating compiled functions.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    /// Element-wise operands must share a shape or one must be 0-d.
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("variable `{0}` already exists in this graph")]
    DuplicateVariable(String),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("node {0} does not exist")]
    UnknownNode(usize),

    /// Gradients are only defined for 0-d costs.
    #[error("cost must be a scalar, got shape {0:?}")]
    NonScalarCost(Vec<usize>),

    #[error("node {0} is not a variable")]
    NotAVariable(usize),

    #[error("cannot differentiate with respect to discrete variable `{0}`")]
    DiscreteVariable(String),

    #[error("cost does not depend on variable `{0}`")]
    Disconnected(String),

    #[error("operation `{0}` has no derivative")]
    NotDifferentiable(&'static str),

    #[error("index {index} out of bounds for {len} elements")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("expected {expected} value(s), got {got}")]
    Arity { expected: usize, got: usize },

    /// A table listed a column it could not produce.
    #[error("table lists column `{name}` but has no data for it")]
    MissingColumn { name: String },

    #[error("no value supplied for input `{name}`")]
    MissingInput { name: String },

    #[error("point supplies `{name}`, which is not an input of this function")]
    UnusedInput { name: String },

    #[error("input `{name}` expects shape {expected:?}, got {got:?}")]
    InputShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("output {index} is not finite")]
    NonFinite { index: usize },
}

/// Errors raised by the context stack.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    /// Nothing of this context type is open on the current thread.
    #[error("no {context} context is active")]
    Empty { context: &'static str },

    /// A scope was exited while another scope was still open inside it.
    #[error("{context} scope exited out of order")]
    OutOfOrder { context: &'static str },
}

/// Errors raised while building or querying a model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("variable `{name}` has no test value")]
    MissingTestValue { name: String },
}
