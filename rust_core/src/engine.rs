//! The contract the derivative builder needs from a differentiation engine.
//!
//! [`crate::derivatives`] and [`crate::expr`] are written against [`Engine`]
//! only; [`Graph`] is the engine shipped with this crate.

use crate::autodiff;
use crate::error::GraphError;
use crate::graph::{Graph, NodeId, VarKind};

pub trait Engine {
    /// Handle to an expression.
    type Expr: Copy + Eq + std::fmt::Debug;
    type Error;

    /// Variable leaves feeding `outputs`, in a stable order.
    fn free_inputs(&self, outputs: &[Self::Expr]) -> Result<Vec<Self::Expr>, Self::Error>;

    /// Kind of a variable leaf, `None` for any other expression.
    fn var_kind(&self, var: Self::Expr) -> Option<VarKind>;

    /// Number of elements `expr` produces.
    fn size(&self, expr: Self::Expr) -> Result<usize, Self::Error>;

    /// Gradient of the scalar `cost` with respect to `wrt`, shaped like `wrt`.
    fn gradient_of(&mut self, cost: Self::Expr, wrt: Self::Expr) -> Result<Self::Expr, Self::Error>;

    fn flatten(&mut self, expr: Self::Expr) -> Result<Self::Expr, Self::Error>;

    /// Element `index` of the flattened expression, as a scalar.
    fn element(&mut self, expr: Self::Expr, index: usize) -> Result<Self::Expr, Self::Error>;

    /// Flattened parts joined into one vector.
    fn concat(&mut self, parts: &[Self::Expr]) -> Result<Self::Expr, Self::Error>;

    /// Vectors of length `len` stacked as matrix rows.
    fn stack_rows(&mut self, rows: &[Self::Expr], len: usize) -> Result<Self::Expr, Self::Error>;

    /// Matrices with `rows` rows joined along the column axis.
    fn concat_columns(&mut self, blocks: &[Self::Expr], rows: usize) -> Result<Self::Expr, Self::Error>;

    fn neg(&mut self, expr: Self::Expr) -> Result<Self::Expr, Self::Error>;
}

impl Engine for Graph {
    type Expr = NodeId;
    type Error = GraphError;

    fn free_inputs(&self, outputs: &[NodeId]) -> Result<Vec<NodeId>, GraphError> {
        self.inputs_of(outputs)
    }

    fn var_kind(&self, var: NodeId) -> Option<VarKind> {
        self.variable(var).map(|v| v.kind)
    }

    fn size(&self, expr: NodeId) -> Result<usize, GraphError> {
        Graph::size(self, expr)
    }

    fn gradient_of(&mut self, cost: NodeId, wrt: NodeId) -> Result<NodeId, GraphError> {
        autodiff::grad(self, cost, wrt)
    }

    fn flatten(&mut self, expr: NodeId) -> Result<NodeId, GraphError> {
        Graph::flatten(self, expr)
    }

    fn element(&mut self, expr: NodeId, index: usize) -> Result<NodeId, GraphError> {
        Graph::element(self, expr, index)
    }

    fn concat(&mut self, parts: &[NodeId]) -> Result<NodeId, GraphError> {
        Graph::concat(self, parts)
    }

    fn stack_rows(&mut self, rows: &[NodeId], len: usize) -> Result<NodeId, GraphError> {
        Graph::stack_rows(self, rows, len)
    }

    fn concat_columns(&mut self, blocks: &[NodeId], rows: usize) -> Result<NodeId, GraphError> {
        Graph::concat_columns(self, blocks, rows)
    }

    fn neg(&mut self, expr: NodeId) -> Result<NodeId, GraphError> {
        Graph::neg(self, expr)
    }
}
