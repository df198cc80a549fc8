use crate::error::GraphError;
use crate::point::{scalar, Tensor};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Whether a variable can be differentiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Continuous,
    Discrete,
}

/// A named leaf of the graph.
#[derive(Debug, Clone)]
pub struct Variable {
    pub node: NodeId,
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: VarKind,
    pub test_value: Option<Tensor>,
}

impl Variable {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_continuous(&self) -> bool {
        self.kind == VarKind::Continuous
    }
}

/// Operations supported in the computation graph.
///
/// Binary element-wise ops accept operands of equal shape, or a 0-d operand
/// that is broadcast against the other.
#[derive(Debug, Clone)]
pub enum Op {
    /// A free variable (index into the graph's variable table).
    Var(usize),
    Constant(Tensor),
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Div(NodeId, NodeId),
    Neg(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Square(NodeId),
    Sigmoid(NodeId),
    /// `ln(1 + exp(x))`, evaluated without overflow.
    Softplus(NodeId),
    /// Zeros shaped like the input. Reads the input only to stay connected
    /// to it; its derivative is zero.
    ZerosLike(NodeId),
    /// Sum of all elements (0-d result).
    Sum(NodeId),
    /// Same elements, new shape (stored on the node).
    Reshape(NodeId),
    /// One element of the flattened input (0-d result).
    Element { x: NodeId, index: usize },
    /// Flattened inputs joined end to end (1-D result).
    Concat(Vec<NodeId>),
    /// `len` elements of the flattened input starting at `start`.
    Slice { x: NodeId, start: usize, len: usize },
    /// The flattened input placed at `start` in a 1-D zero vector.
    Pad { x: NodeId, start: usize, len: usize },
    /// A 0-d input placed at a flat index of a zero tensor.
    Scatter { x: NodeId, index: usize },
    /// `inner` where `lower <= value <= upper`, otherwise `fill`.
    Bound {
        value: NodeId,
        inner: NodeId,
        lower: f64,
        upper: f64,
        fill: f64,
    },
    /// 1-D rows of equal length stacked into a matrix.
    StackRows(Vec<NodeId>),
    /// Matrices with equal row counts joined along the column axis.
    ConcatColumns(Vec<NodeId>),
}

impl Op {
    /// Nodes this op reads, in operand order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            Op::Var(_) | Op::Constant(_) => Vec::new(),
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::Div(a, b) => vec![*a, *b],
            Op::Neg(a)
            | Op::Exp(a)
            | Op::Log(a)
            | Op::Square(a)
            | Op::Sigmoid(a)
            | Op::Softplus(a)
            | Op::ZerosLike(a)
            | Op::Sum(a)
            | Op::Reshape(a) => vec![*a],
            Op::Element { x, .. }
            | Op::Slice { x, .. }
            | Op::Pad { x, .. }
            | Op::Scatter { x, .. } => vec![*x],
            Op::Bound { value, inner, .. } => vec![*value, *inner],
            Op::Concat(parts) | Op::StackRows(parts) | Op::ConcatColumns(parts) => parts.clone(),
        }
    }

    /// The same op reading `f(operand)` instead of each operand.
    pub(crate) fn remap(&self, f: impl Fn(NodeId) -> NodeId) -> Op {
        let all = |ids: &[NodeId]| ids.iter().map(|&id| f(id)).collect::<Vec<_>>();
        match self {
            Op::Var(idx) => Op::Var(*idx),
            Op::Constant(c) => Op::Constant(c.clone()),
            Op::Add(a, b) => Op::Add(f(*a), f(*b)),
            Op::Sub(a, b) => Op::Sub(f(*a), f(*b)),
            Op::Mul(a, b) => Op::Mul(f(*a), f(*b)),
            Op::Div(a, b) => Op::Div(f(*a), f(*b)),
            Op::Neg(a) => Op::Neg(f(*a)),
            Op::Exp(a) => Op::Exp(f(*a)),
            Op::Log(a) => Op::Log(f(*a)),
            Op::Square(a) => Op::Square(f(*a)),
            Op::Sigmoid(a) => Op::Sigmoid(f(*a)),
            Op::Softplus(a) => Op::Softplus(f(*a)),
            Op::ZerosLike(a) => Op::ZerosLike(f(*a)),
            Op::Sum(a) => Op::Sum(f(*a)),
            Op::Reshape(a) => Op::Reshape(f(*a)),
            Op::Element { x, index } => Op::Element {
                x: f(*x),
                index: *index,
            },
            Op::Concat(parts) => Op::Concat(all(parts)),
            Op::Slice { x, start, len } => Op::Slice {
                x: f(*x),
                start: *start,
                len: *len,
            },
            Op::Pad { x, start, len } => Op::Pad {
                x: f(*x),
                start: *start,
                len: *len,
            },
            Op::Scatter { x, index } => Op::Scatter {
                x: f(*x),
                index: *index,
            },
            Op::Bound {
                value,
                inner,
                lower,
                upper,
                fill,
            } => Op::Bound {
                value: f(*value),
                inner: f(*inner),
                lower: *lower,
                upper: *upper,
                fill: *fill,
            },
            Op::StackRows(rows) => Op::StackRows(all(rows)),
            Op::ConcatColumns(blocks) => Op::ConcatColumns(all(blocks)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Var(_) => "var",
            Op::Constant(_) => "constant",
            Op::Add(..) => "add",
            Op::Sub(..) => "sub",
            Op::Mul(..) => "mul",
            Op::Div(..) => "div",
            Op::Neg(_) => "neg",
            Op::Exp(_) => "exp",
            Op::Log(_) => "log",
            Op::Square(_) => "square",
            Op::Sigmoid(_) => "sigmoid",
            Op::Softplus(_) => "softplus",
            Op::ZerosLike(_) => "zeros_like",
            Op::Sum(_) => "sum",
            Op::Reshape(_) => "reshape",
            Op::Element { .. } => "element",
            Op::Concat(_) => "concat",
            Op::Slice { .. } => "slice",
            Op::Pad { .. } => "pad",
            Op::Scatter { .. } => "scatter",
            Op::Bound { .. } => "bound",
            Op::StackRows(_) => "stack_rows",
            Op::ConcatColumns(_) => "concat_columns",
        }
    }
}

/// A single node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub shape: Vec<usize>,
}

impl Node {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Append-only expression graph.
///
/// Stores nodes in topological order (each node only references earlier
/// nodes), so a forward pass is a single sweep over `nodes` and the reverse
/// pass is the same sweep backwards. Derivatives are built by appending new
/// nodes, which keeps every gradient differentiable in turn.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    variables: Vec<Variable>,
    name_to_node: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&mut self, op: Op, shape: Vec<usize>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, op, shape });
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id.0))
    }

    pub fn shape(&self, id: NodeId) -> Result<&[usize], GraphError> {
        Ok(&self.node(id)?.shape)
    }

    /// Number of elements produced by a node.
    pub fn size(&self, id: NodeId) -> Result<usize, GraphError> {
        Ok(self.node(id)?.size())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ── variables ────────────────────────────────────────────────────

    /// Register a named variable. Names are unique within a graph.
    pub fn add_variable(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        kind: VarKind,
        test_value: Option<Tensor>,
    ) -> Result<NodeId, GraphError> {
        if self.name_to_node.contains_key(name) {
            return Err(GraphError::DuplicateVariable(name.to_string()));
        }
        let idx = self.variables.len();
        let node = self.add_node(Op::Var(idx), shape.clone());
        self.variables.push(Variable {
            node,
            name: name.to_string(),
            shape,
            kind,
            test_value,
        });
        self.name_to_node.insert(name.to_string(), node);
        Ok(node)
    }

    /// The variable behind `id`, if `id` is a variable node.
    pub fn variable(&self, id: NodeId) -> Option<&Variable> {
        match self.nodes.get(id.0)?.op {
            Op::Var(idx) => self.variables.get(idx),
            _ => None,
        }
    }

    /// Index into the variable table, if `id` is a variable node.
    pub(crate) fn var_slot(&self, id: NodeId) -> Option<usize> {
        match self.nodes.get(id.0)?.op {
            Op::Var(idx) => Some(idx),
            _ => None,
        }
    }

    pub(crate) fn variable_at(&self, idx: usize) -> Option<&Variable> {
        self.variables.get(idx)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    /// Drop every node from `len` on, together with the variables among them.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
        while let Some(var) = self.variables.last() {
            if var.node.0 < len {
                break;
            }
            let name = var.name.clone();
            self.variables.pop();
            self.name_to_node.remove(&name);
        }
    }

    /// Variable nodes feeding `outputs`, in creation order.
    pub fn inputs_of(&self, outputs: &[NodeId]) -> Result<Vec<NodeId>, GraphError> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = Vec::with_capacity(outputs.len());
        for &out in outputs {
            self.node(out)?;
            stack.push(out);
        }
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            stack.extend(self.nodes[id.0].op.operands());
        }
        Ok(self
            .nodes
            .iter()
            .filter(|n| seen[n.id.0] && matches!(n.op, Op::Var(_)))
            .map(|n| n.id)
            .collect())
    }

    // ── leaves ───────────────────────────────────────────────────────

    pub fn constant(&mut self, value: Tensor) -> NodeId {
        let shape = value.shape().to_vec();
        self.add_node(Op::Constant(value), shape)
    }

    pub fn scalar(&mut self, value: f64) -> NodeId {
        self.constant(scalar(value))
    }

    pub fn zeros(&mut self, shape: &[usize]) -> NodeId {
        self.constant(ArrayD::zeros(IxDyn(shape)))
    }

    /// The value of a 0-d constant node.
    pub fn constant_value(&self, id: NodeId) -> Option<f64> {
        match &self.nodes.get(id.0)?.op {
            Op::Constant(t) if t.ndim() == 0 => t.iter().next().copied(),
            _ => None,
        }
    }

    // ── element-wise ─────────────────────────────────────────────────

    fn broadcast(&self, op: &'static str, a: NodeId, b: NodeId) -> Result<Vec<usize>, GraphError> {
        let sa = self.shape(a)?;
        let sb = self.shape(b)?;
        if sa == sb || sb.is_empty() {
            Ok(sa.to_vec())
        } else if sa.is_empty() {
            Ok(sb.to_vec())
        } else {
            Err(GraphError::ShapeMismatch {
                op,
                left: sa.to_vec(),
                right: sb.to_vec(),
            })
        }
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        let shape = self.broadcast("add", a, b)?;
        Ok(self.add_node(Op::Add(a, b), shape))
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        let shape = self.broadcast("sub", a, b)?;
        Ok(self.add_node(Op::Sub(a, b), shape))
    }

    /// `a * b`. A 0-d constant `1` on either side folds away.
    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        let shape = self.broadcast("mul", a, b)?;
        if self.constant_value(a) == Some(1.0) {
            return Ok(b);
        }
        if self.constant_value(b) == Some(1.0) {
            return Ok(a);
        }
        Ok(self.add_node(Op::Mul(a, b), shape))
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        let shape = self.broadcast("div", a, b)?;
        Ok(self.add_node(Op::Div(a, b), shape))
    }

    fn unary(&mut self, x: NodeId, op: Op) -> Result<NodeId, GraphError> {
        let shape = self.shape(x)?.to_vec();
        Ok(self.add_node(op, shape))
    }

    pub fn neg(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::Neg(x))
    }

    pub fn exp(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::Exp(x))
    }

    pub fn log(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::Log(x))
    }

    pub fn square(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::Square(x))
    }

    pub fn sigmoid(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::Sigmoid(x))
    }

    pub fn softplus(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::Softplus(x))
    }

    pub fn zeros_like(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(x, Op::ZerosLike(x))
    }

    /// `inner` where `lower <= value <= upper`, `fill` elsewhere.
    pub fn bound(
        &mut self,
        value: NodeId,
        inner: NodeId,
        lower: f64,
        upper: f64,
        fill: f64,
    ) -> Result<NodeId, GraphError> {
        let shape = self.broadcast("bound", value, inner)?;
        Ok(self.add_node(
            Op::Bound {
                value,
                inner,
                lower,
                upper,
                fill,
            },
            shape,
        ))
    }

    // ── structural ───────────────────────────────────────────────────

    pub fn sum(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.node(x)?;
        Ok(self.add_node(Op::Sum(x), Vec::new()))
    }

    pub fn reshape(&mut self, x: NodeId, shape: Vec<usize>) -> Result<NodeId, GraphError> {
        let from = self.shape(x)?;
        if from == shape.as_slice() {
            return Ok(x);
        }
        if from.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(GraphError::ShapeMismatch {
                op: "reshape",
                left: from.to_vec(),
                right: shape,
            });
        }
        Ok(self.add_node(Op::Reshape(x), shape))
    }

    /// Reshape to 1-D.
    pub fn flatten(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        let n = self.size(x)?;
        self.reshape(x, vec![n])
    }

    pub fn element(&mut self, x: NodeId, index: usize) -> Result<NodeId, GraphError> {
        let len = self.size(x)?;
        if index >= len {
            return Err(GraphError::IndexOutOfBounds { index, len });
        }
        Ok(self.add_node(Op::Element { x, index }, Vec::new()))
    }

    /// Join flattened `parts` end to end. No parts gives an empty vector.
    pub fn concat(&mut self, parts: &[NodeId]) -> Result<NodeId, GraphError> {
        let mut total = 0;
        for &p in parts {
            total += self.size(p)?;
        }
        if parts.is_empty() {
            return Ok(self.zeros(&[0]));
        }
        Ok(self.add_node(Op::Concat(parts.to_vec()), vec![total]))
    }

    pub fn slice(&mut self, x: NodeId, start: usize, len: usize) -> Result<NodeId, GraphError> {
        let size = self.size(x)?;
        if start + len > size {
            return Err(GraphError::IndexOutOfBounds {
                index: start + len,
                len: size,
            });
        }
        Ok(self.add_node(Op::Slice { x, start, len }, vec![len]))
    }

    pub fn pad(&mut self, x: NodeId, start: usize, len: usize) -> Result<NodeId, GraphError> {
        let size = self.size(x)?;
        if start + size > len {
            return Err(GraphError::IndexOutOfBounds {
                index: start + size,
                len,
            });
        }
        Ok(self.add_node(Op::Pad { x, start, len }, vec![len]))
    }

    pub fn scatter(&mut self, x: NodeId, index: usize, shape: Vec<usize>) -> Result<NodeId, GraphError> {
        let from = self.shape(x)?;
        if !from.is_empty() {
            return Err(GraphError::ShapeMismatch {
                op: "scatter",
                left: from.to_vec(),
                right: Vec::new(),
            });
        }
        let len: usize = shape.iter().product();
        if index >= len {
            return Err(GraphError::IndexOutOfBounds { index, len });
        }
        Ok(self.add_node(Op::Scatter { x, index }, shape))
    }

    /// Stack 1-D rows of equal length into an `(rows, len)` matrix.
    pub fn stack_rows(&mut self, rows: &[NodeId], len: usize) -> Result<NodeId, GraphError> {
        for &r in rows {
            let shape = self.shape(r)?;
            if shape != [len] {
                return Err(GraphError::ShapeMismatch {
                    op: "stack_rows",
                    left: shape.to_vec(),
                    right: vec![len],
                });
            }
        }
        if rows.is_empty() {
            return Ok(self.zeros(&[0, len]));
        }
        Ok(self.add_node(Op::StackRows(rows.to_vec()), vec![rows.len(), len]))
    }

    /// Join `(rows, k)` matrices along the column axis.
    pub fn concat_columns(&mut self, blocks: &[NodeId], rows: usize) -> Result<NodeId, GraphError> {
        let mut cols = 0;
        for &b in blocks {
            let shape = self.shape(b)?;
            if shape.len() != 2 || shape[0] != rows {
                return Err(GraphError::ShapeMismatch {
                    op: "concat_columns",
                    left: shape.to_vec(),
                    right: vec![rows],
                });
            }
            cols += shape[1];
        }
        if blocks.is_empty() {
            return Ok(self.zeros(&[rows, 0]));
        }
        Ok(self.add_node(Op::ConcatColumns(blocks.to_vec()), vec![rows, cols]))
    }
}
