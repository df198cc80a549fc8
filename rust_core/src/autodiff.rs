use crate::error::GraphError;
use crate::graph::{Graph, Node, NodeId, Op, VarKind};
use crate::point::{scalar, vector, Tensor};
use ndarray::{concatenate, ArrayD, Axis, IxDyn, Zip};

/// Forward-evaluate `nodes` and return the per-node values.
///
/// `nodes` must be in topological order with `nodes[i].id == NodeId(i)`.
/// `var_value(idx)` supplies the value of variable `idx`.
pub fn forward<F>(nodes: &[Node], mut var_value: F) -> Result<Vec<Tensor>, GraphError>
where
    F: FnMut(usize) -> Result<Tensor, GraphError>,
{
    let mut values: Vec<Tensor> = Vec::with_capacity(nodes.len());

    for node in nodes {
        let val = match &node.op {
            Op::Var(idx) => var_value(*idx)?,
            Op::Constant(c) => c.clone(),
            Op::Add(a, b) => zip_with("add", &values[a.0], &values[b.0], |x, y| x + y)?,
            Op::Sub(a, b) => zip_with("sub", &values[a.0], &values[b.0], |x, y| x - y)?,
            Op::Mul(a, b) => zip_with("mul", &values[a.0], &values[b.0], |x, y| x * y)?,
            Op::Div(a, b) => zip_with("div", &values[a.0], &values[b.0], |x, y| x / y)?,
            Op::Neg(a) => values[a.0].mapv(|v| -v),
            Op::Exp(a) => values[a.0].mapv(f64::exp),
            Op::Log(a) => values[a.0].mapv(f64::ln),
            Op::Square(a) => values[a.0].mapv(|v| v * v),
            Op::Sigmoid(a) => values[a.0].mapv(sigmoid),
            Op::Softplus(a) => values[a.0].mapv(softplus),
            Op::ZerosLike(a) => ArrayD::zeros(values[a.0].raw_dim()),
            Op::Sum(a) => scalar(values[a.0].sum()),
            Op::Reshape(a) => reshaped(&values[a.0], &node.shape)?,
            Op::Element { x, index } => {
                let src = &values[x.0];
                let v = src.iter().nth(*index).copied().ok_or(GraphError::IndexOutOfBounds {
                    index: *index,
                    len: src.len(),
                })?;
                scalar(v)
            }
            Op::Concat(parts) => vector(
                parts
                    .iter()
                    .flat_map(|p| values[p.0].iter().copied())
                    .collect(),
            ),
            Op::Slice { x, start, len } => {
                vector(values[x.0].iter().skip(*start).take(*len).copied().collect())
            }
            Op::Pad { x, start, len } => {
                let mut out = vec![0.0; *len];
                for (slot, v) in out.iter_mut().skip(*start).zip(values[x.0].iter()) {
                    *slot = *v;
                }
                vector(out)
            }
            Op::Scatter { x, index } => {
                let mut out = ArrayD::zeros(IxDyn(&node.shape));
                if let Some(slot) = out.iter_mut().nth(*index) {
                    *slot = item(&values[x.0]);
                }
                out
            }
            Op::Bound {
                value,
                inner,
                lower,
                upper,
                fill,
            } => {
                let (lo, hi, fill) = (*lower, *upper, *fill);
                zip_with("bound", &values[value.0], &values[inner.0], |v, i| {
                    if v >= lo && v <= hi {
                        i
                    } else {
                        fill
                    }
                })?
            }
            Op::StackRows(rows) => {
                let data: Vec<f64> = rows.iter().flat_map(|r| values[r.0].iter().copied()).collect();
                reshaped(&vector(data), &node.shape)?
            }
            Op::ConcatColumns(blocks) => {
                let views: Vec<_> = blocks.iter().map(|b| values[b.0].view()).collect();
                concatenate(Axis(1), &views).map_err(|_| GraphError::ShapeMismatch {
                    op: "concat_columns",
                    left: node.shape.clone(),
                    right: Vec::new(),
                })?
            }
        };
        values.push(val);
    }

    Ok(values)
}

/// Symbolic reverse-mode gradient of the 0-d `cost` with respect to the
/// variable `wrt`.
///
/// Adjoints are appended to the graph as ordinary nodes, so the returned
/// node (shaped like `wrt`) can itself be differentiated.
pub fn grad(graph: &mut Graph, cost: NodeId, wrt: NodeId) -> Result<NodeId, GraphError> {
    let cost_shape = graph.shape(cost)?;
    if !cost_shape.is_empty() {
        return Err(GraphError::NonScalarCost(cost_shape.to_vec()));
    }
    let var = graph.variable(wrt).ok_or(GraphError::NotAVariable(wrt.0))?;
    if var.kind == VarKind::Discrete {
        return Err(GraphError::DiscreteVariable(var.name.clone()));
    }
    let var_name = var.name.clone();

    let n = cost.0 + 1;
    let depends = downstream(graph, wrt, cost);
    if !depends[cost.0] {
        return Err(GraphError::Disconnected(var_name));
    }

    let mut adj: Vec<Option<NodeId>> = vec![None; n];
    adj[cost.0] = Some(graph.scalar(1.0));

    // Reverse pass
    for i in (wrt.0 + 1..n).rev() {
        if !depends[i] {
            continue;
        }
        let Some(g) = adj[i] else { continue };
        let op = graph.nodes[i].op.clone();
        for (operand, contribution) in backprop(graph, NodeId(i), &op, g, &depends)? {
            adj[operand.0] = Some(match adj[operand.0] {
                Some(prev) => graph.add(prev, contribution)?,
                None => contribution,
            });
        }
    }

    // Connected only through piecewise-constant paths.
    let Some(g) = adj[wrt.0] else {
        return graph.zeros_like(wrt);
    };
    // A constant adjoint still has to reach `wrt` so it can be
    // differentiated again (to zero).
    if downstream(graph, wrt, g)[g.0] {
        Ok(g)
    } else {
        let zeros = graph.zeros_like(wrt)?;
        graph.add(g, zeros)
    }
}

/// Flags for nodes `0..=upto` that read `wrt`, directly or not.
fn downstream(graph: &Graph, wrt: NodeId, upto: NodeId) -> Vec<bool> {
    let n = upto.0 + 1;
    let mut depends = vec![false; n];
    if wrt.0 < n {
        depends[wrt.0] = true;
        for i in wrt.0 + 1..n {
            depends[i] = graph.nodes[i].op.operands().iter().any(|o| depends[o.0]);
        }
    }
    depends
}

/// Adjoint contributions of node `out = op(...)` to each operand that
/// depends on the differentiation target.
fn backprop(
    graph: &mut Graph,
    out: NodeId,
    op: &Op,
    g: NodeId,
    depends: &[bool],
) -> Result<Vec<(NodeId, NodeId)>, GraphError> {
    let wants = |id: &NodeId| depends[id.0];
    let mut contribs = Vec::new();

    match op {
        Op::Var(_) | Op::Constant(_) => {}
        Op::Add(a, b) => {
            if wants(a) {
                contribs.push((*a, unbroadcast(graph, g, *a)?));
            }
            if wants(b) {
                contribs.push((*b, unbroadcast(graph, g, *b)?));
            }
        }
        Op::Sub(a, b) => {
            if wants(a) {
                contribs.push((*a, unbroadcast(graph, g, *a)?));
            }
            if wants(b) {
                let neg = graph.neg(g)?;
                contribs.push((*b, unbroadcast(graph, neg, *b)?));
            }
        }
        Op::Mul(a, b) => {
            if wants(a) {
                let ga = graph.mul(g, *b)?;
                contribs.push((*a, unbroadcast(graph, ga, *a)?));
            }
            if wants(b) {
                let gb = graph.mul(g, *a)?;
                contribs.push((*b, unbroadcast(graph, gb, *b)?));
            }
        }
        Op::Div(a, b) => {
            if wants(a) {
                let ga = graph.div(g, *b)?;
                contribs.push((*a, unbroadcast(graph, ga, *a)?));
            }
            if wants(b) {
                // d(a/b)/db = -(a/b)/b
                let t = graph.mul(g, out)?;
                let t = graph.div(t, *b)?;
                let gb = graph.neg(t)?;
                contribs.push((*b, unbroadcast(graph, gb, *b)?));
            }
        }
        Op::Neg(a) => {
            if wants(a) {
                contribs.push((*a, graph.neg(g)?));
            }
        }
        Op::Exp(a) => {
            if wants(a) {
                contribs.push((*a, graph.mul(g, out)?));
            }
        }
        Op::Log(a) => {
            if wants(a) {
                contribs.push((*a, graph.div(g, *a)?));
            }
        }
        Op::Square(a) => {
            if wants(a) {
                let two = graph.scalar(2.0);
                let d = graph.mul(two, *a)?;
                contribs.push((*a, graph.mul(g, d)?));
            }
        }
        Op::Sigmoid(a) => {
            if wants(a) {
                // s * (1 - s)
                let one = graph.scalar(1.0);
                let rest = graph.sub(one, out)?;
                let d = graph.mul(out, rest)?;
                contribs.push((*a, graph.mul(g, d)?));
            }
        }
        Op::Softplus(a) => {
            if wants(a) {
                let s = graph.sigmoid(*a)?;
                contribs.push((*a, graph.mul(g, s)?));
            }
        }
        Op::ZerosLike(_) => {}
        Op::Sum(a) => {
            if wants(a) {
                let shape = graph.shape(*a)?.to_vec();
                let ones = graph.constant(ArrayD::ones(IxDyn(&shape)));
                contribs.push((*a, graph.mul(g, ones)?));
            }
        }
        Op::Reshape(a) => {
            if wants(a) {
                let shape = graph.shape(*a)?.to_vec();
                contribs.push((*a, graph.reshape(g, shape)?));
            }
        }
        Op::Element { x, index } => {
            if wants(x) {
                let shape = graph.shape(*x)?.to_vec();
                contribs.push((*x, graph.scatter(g, *index, shape)?));
            }
        }
        Op::Concat(parts) => {
            let mut offset = 0;
            for p in parts {
                let shape = graph.shape(*p)?.to_vec();
                let len: usize = shape.iter().product();
                if wants(p) {
                    let window = graph.slice(g, offset, len)?;
                    contribs.push((*p, graph.reshape(window, shape)?));
                }
                offset += len;
            }
        }
        Op::Slice { x, start, .. } => {
            if wants(x) {
                let shape = graph.shape(*x)?.to_vec();
                let padded = graph.pad(g, *start, shape.iter().product())?;
                contribs.push((*x, graph.reshape(padded, shape)?));
            }
        }
        Op::Pad { x, start, .. } => {
            if wants(x) {
                let shape = graph.shape(*x)?.to_vec();
                let window = graph.slice(g, *start, shape.iter().product())?;
                contribs.push((*x, graph.reshape(window, shape)?));
            }
        }
        Op::Scatter { x, index } => {
            if wants(x) {
                contribs.push((*x, graph.element(g, *index)?));
            }
        }
        Op::Bound {
            value,
            inner,
            lower,
            upper,
            ..
        } => {
            // Piecewise constant in `value`; only `inner` receives gradient.
            if wants(inner) {
                let masked = graph.bound(*value, g, *lower, *upper, 0.0)?;
                contribs.push((*inner, unbroadcast(graph, masked, *inner)?));
            }
        }
        Op::StackRows(_) | Op::ConcatColumns(_) => {
            return Err(GraphError::NotDifferentiable(op.name()));
        }
    }

    Ok(contribs)
}

/// Reduce an adjoint back to a 0-d operand that was broadcast.
fn unbroadcast(graph: &mut Graph, g: NodeId, operand: NodeId) -> Result<NodeId, GraphError> {
    let target = graph.shape(operand)?;
    if target.is_empty() && !graph.shape(g)?.is_empty() {
        graph.sum(g)
    } else {
        Ok(g)
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// The single element of a 0-d (or one-element) tensor.
pub(crate) fn item(t: &Tensor) -> f64 {
    t.iter().next().copied().unwrap_or(f64::NAN)
}

fn reshaped(t: &Tensor, shape: &[usize]) -> Result<Tensor, GraphError> {
    ArrayD::from_shape_vec(IxDyn(shape), t.iter().copied().collect()).map_err(|_| {
        GraphError::ShapeMismatch {
            op: "reshape",
            left: t.shape().to_vec(),
            right: shape.to_vec(),
        }
    })
}

fn zip_with(
    op: &'static str,
    a: &Tensor,
    b: &Tensor,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, GraphError> {
    if a.shape() == b.shape() {
        Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)))
    } else if a.ndim() == 0 {
        let s = item(a);
        Ok(b.mapv(|y| f(s, y)))
    } else if b.ndim() == 0 {
        let s = item(b);
        Ok(a.mapv(|x| f(x, s)))
    } else {
        Err(GraphError::ShapeMismatch {
            op,
            left: a.shape().to_vec(),
            right: b.shape().to_vec(),
        })
    }
}
