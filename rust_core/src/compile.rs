//! Compilation of graph outputs into self-contained callables.

use crate::autodiff::{forward, item};
use crate::error::GraphError;
use crate::graph::{Graph, Node, NodeId};
use crate::point::{Point, Tensor};
use ndarray::{Array1, Array2, ArrayD, Ix2, IxDyn};
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

/// What to do with point entries that are not inputs of the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnusedInput {
    #[default]
    Ignore,
    Raise,
}

/// Compilation settings.
///
/// The defaults are lenient: extra point entries are ignored and input values
/// are coerced to the variable's shape where the element count allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub unused_input: UnusedInput,
    /// Reshape values with the right element count; broadcast 0-d values.
    pub coerce_inputs: bool,
    /// Report non-finite outputs as errors.
    pub check_finite: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            unused_input: UnusedInput::Ignore,
            coerce_inputs: true,
            check_finite: false,
        }
    }
}

impl CompileOptions {
    pub fn strict() -> Self {
        Self {
            unused_input: UnusedInput::Raise,
            coerce_inputs: false,
            check_finite: true,
        }
    }

    pub fn with_unused_input(mut self, policy: UnusedInput) -> Self {
        self.unused_input = policy;
        self
    }

    pub fn with_coerce_inputs(mut self, coerce: bool) -> Self {
        self.coerce_inputs = coerce;
        self
    }

    pub fn with_check_finite(mut self, check: bool) -> Self {
        self.check_finite = check;
        self
    }
}

/// A variable the compiled function reads from its point argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub name: String,
    pub shape: Vec<usize>,
    var: usize,
}

/// A compiled function of named inputs.
///
/// Holds its own copy of the nodes it needs, so it is independent of later
/// changes to the graph it came from and can be shared across threads.
#[derive(Debug, Clone)]
pub struct Function {
    nodes: Vec<Node>,
    inputs: Vec<Input>,
    outputs: Vec<usize>,
    options: CompileOptions,
}

/// Compile `outputs` into a callable over the free inputs they depend on.
pub fn compile(graph: &Graph, outputs: &[NodeId], options: CompileOptions) -> Result<Function, GraphError> {
    let inputs = graph
        .inputs_of(outputs)?
        .into_iter()
        .filter_map(|id| {
            let var = graph.var_slot(id)?;
            let v = graph.variable_at(var)?;
            Some(Input {
                name: v.name.clone(),
                shape: v.shape.clone(),
                var,
            })
        })
        .collect::<Vec<_>>();

    // Keep only the nodes the outputs reach.
    let mut needed = vec![false; graph.len()];
    for out in outputs {
        needed[out.0] = true;
    }
    for i in (0..graph.len()).rev() {
        if needed[i] {
            for o in graph.nodes[i].op.operands() {
                needed[o.0] = true;
            }
        }
    }

    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
    let mut nodes = Vec::new();
    for node in graph.nodes.iter().filter(|n| needed[n.id.0]) {
        let id = NodeId(nodes.len());
        remap.insert(node.id, id);
        nodes.push(Node {
            id,
            op: node.op.remap(|o| remap.get(&o).copied().unwrap_or(o)),
            shape: node.shape.clone(),
        });
    }
    let outputs = outputs
        .iter()
        .map(|o| remap.get(o).map(|id| id.0).ok_or(GraphError::UnknownNode(o.0)))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        nodes = nodes.len(),
        inputs = inputs.len(),
        outputs = outputs.len(),
        "compiled function"
    );

    Ok(Function {
        nodes,
        inputs,
        outputs,
        options,
    })
}

impl Function {
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Number of nodes evaluated per call.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    /// Evaluate all outputs at `point`.
    pub fn call(&self, point: &Point) -> Result<Vec<Tensor>, GraphError> {
        if self.options.unused_input == UnusedInput::Raise {
            if let Some(name) = point
                .names()
                .find(|name| !self.inputs.iter().any(|i| i.name == *name))
            {
                return Err(GraphError::UnusedInput {
                    name: name.to_string(),
                });
            }
        }

        let mut provided: HashMap<usize, Tensor> = HashMap::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let value = point.get(&input.name).ok_or_else(|| GraphError::MissingInput {
                name: input.name.clone(),
            })?;
            provided.insert(input.var, self.coerce(input, value)?);
        }

        let values = forward(&self.nodes, |idx| {
            provided.remove(&idx).ok_or(GraphError::UnknownVariable(format!("#{idx}")))
        })?;

        let mut results = Vec::with_capacity(self.outputs.len());
        for (index, &out) in self.outputs.iter().enumerate() {
            let value = values[out].clone();
            if self.options.check_finite && value.iter().any(|v| !v.is_finite()) {
                return Err(GraphError::NonFinite { index });
            }
            results.push(value);
        }
        Ok(results)
    }

    /// Evaluate at many points in parallel.
    pub fn call_batch(&self, points: &[Point]) -> Result<Vec<Vec<Tensor>>, GraphError> {
        points.par_iter().map(|p| self.call(p)).collect()
    }

    fn coerce(&self, input: &Input, value: &Tensor) -> Result<Tensor, GraphError> {
        if value.shape() == input.shape.as_slice() {
            return Ok(value.clone());
        }
        let mismatch = || GraphError::InputShape {
            name: input.name.clone(),
            expected: input.shape.clone(),
            got: value.shape().to_vec(),
        };
        if !self.options.coerce_inputs {
            return Err(mismatch());
        }
        let size: usize = input.shape.iter().product();
        if value.len() == size {
            ArrayD::from_shape_vec(IxDyn(&input.shape), value.iter().copied().collect())
                .map_err(|_| mismatch())
        } else if value.ndim() == 0 {
            Ok(ArrayD::from_elem(IxDyn(&input.shape), item(value)))
        } else {
            Err(mismatch())
        }
    }
}

/// Compiled scalar log-probability.
#[derive(Debug, Clone)]
pub struct LogpFn(Function);

impl LogpFn {
    pub fn new(graph: &Graph, logp: NodeId, options: CompileOptions) -> Result<Self, GraphError> {
        compile(graph, &[logp], options).map(Self)
    }

    pub fn call(&self, point: &Point) -> Result<f64, GraphError> {
        let out = self.0.call(point)?;
        Ok(out.first().map(item).unwrap_or(f64::NAN))
    }

    /// Log-probability at many points, evaluated in parallel.
    pub fn call_batch(&self, points: &[Point]) -> Result<Vec<f64>, GraphError> {
        let outs = self.0.call_batch(points)?;
        Ok(outs
            .iter()
            .map(|out| out.first().map(item).unwrap_or(f64::NAN))
            .collect())
    }

    pub fn function(&self) -> &Function {
        &self.0
    }
}

/// Compiled flat gradient vector.
#[derive(Debug, Clone)]
pub struct GradientFn(Function);

impl GradientFn {
    pub fn new(graph: &Graph, gradient: NodeId, options: CompileOptions) -> Result<Self, GraphError> {
        compile(graph, &[gradient], options).map(Self)
    }

    pub fn call(&self, point: &Point) -> Result<Array1<f64>, GraphError> {
        let out = self.0.call(point)?;
        Ok(out
            .first()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_else(|| Array1::zeros(0)))
    }

    pub fn function(&self) -> &Function {
        &self.0
    }
}

/// Compiled Hessian matrix.
#[derive(Debug, Clone)]
pub struct HessianFn(Function);

impl HessianFn {
    pub fn new(graph: &Graph, hessian: NodeId, options: CompileOptions) -> Result<Self, GraphError> {
        compile(graph, &[hessian], options).map(Self)
    }

    pub fn call(&self, point: &Point) -> Result<Array2<f64>, GraphError> {
        let out = self.0.call(point)?;
        let matrix = out.into_iter().next().unwrap_or_else(|| ArrayD::zeros(IxDyn(&[0, 0])));
        let shape = matrix.shape().to_vec();
        matrix
            .into_dimensionality::<Ix2>()
            .map_err(|_| GraphError::ShapeMismatch {
                op: "hessian",
                left: shape,
                right: vec![0, 0],
            })
    }

    pub fn function(&self) -> &Function {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VarKind;
    use crate::point::scalar;

    /// f = Σ exp(x) * y
    fn build() -> (Graph, NodeId) {
        let mut g = Graph::new();
        let x = g.add_variable("x", vec![2], VarKind::Continuous, None).unwrap();
        let y = g.add_variable("y", vec![], VarKind::Continuous, None).unwrap();
        g.add_variable("unused", vec![], VarKind::Continuous, None).unwrap();
        let e = g.exp(x).unwrap();
        let m = g.mul(e, y).unwrap();
        let f = g.sum(m).unwrap();
        (g, f)
    }

    #[test]
    fn test_inputs_are_free_variables_only() {
        let (g, f) = build();
        let func = compile(&g, &[f], CompileOptions::default()).unwrap();
        let names: Vec<_> = func.inputs().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(func.len() < g.len());
    }

    #[test]
    fn test_lenient_defaults() {
        let (g, f) = build();
        let func = compile(&g, &[f], CompileOptions::default()).unwrap();
        // Extra key ignored, integer coerced, 0-d value broadcast to [2].
        let point = Point::new().with("x", 0.0).with("y", 3_i64).with("z", 1.0);
        let out = func.call(&point).unwrap();
        assert_eq!(out, vec![scalar(6.0)]);
    }

    #[test]
    fn test_reshapes_matching_element_count() {
        let mut g = Graph::new();
        let m = g.add_variable("m", vec![2, 2], VarKind::Continuous, None).unwrap();
        let s = g.sum(m).unwrap();
        let func = compile(&g, &[s], CompileOptions::default()).unwrap();
        let out = func.call(&Point::new().with("m", vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(out[0], scalar(10.0));
    }

    #[test]
    fn test_strict_options() {
        let (g, f) = build();
        let func = compile(&g, &[f], CompileOptions::strict()).unwrap();
        let extra = Point::new()
            .with("x", vec![0.0, 0.0])
            .with("y", 1.0)
            .with("z", 1.0);
        assert_eq!(
            func.call(&extra).unwrap_err(),
            GraphError::UnusedInput { name: "z".into() }
        );
        let scalar_x = Point::new().with("x", 0.0).with("y", 1.0);
        assert!(matches!(
            func.call(&scalar_x).unwrap_err(),
            GraphError::InputShape { .. }
        ));
    }

    #[test]
    fn test_missing_input() {
        let (g, f) = build();
        let func = compile(&g, &[f], CompileOptions::default()).unwrap();
        assert_eq!(
            func.call(&Point::new().with("x", vec![0.0, 0.0])).unwrap_err(),
            GraphError::MissingInput { name: "y".into() }
        );
    }

    #[test]
    fn test_check_finite() {
        let mut g = Graph::new();
        let x = g.add_variable("x", vec![], VarKind::Continuous, None).unwrap();
        let l = g.log(x).unwrap();
        let opts = CompileOptions::default().with_check_finite(true);
        let func = compile(&g, &[x, l], opts).unwrap();
        assert_eq!(
            func.call(&Point::new().with("x", 0.0)).unwrap_err(),
            GraphError::NonFinite { index: 1 }
        );
        assert_eq!(func.num_outputs(), 2);
    }

    #[test]
    fn test_independent_of_later_graph_changes() {
        let (mut g, f) = build();
        let func = compile(&g, &[f], CompileOptions::default()).unwrap();
        let point = Point::new().with("x", vec![0.0, 0.0]).with("y", 2.0);
        let before = func.call(&point).unwrap();
        let two = g.scalar(2.0);
        g.mul(f, two).unwrap();
        assert_eq!(func.call(&point).unwrap(), before);
    }

    #[test]
    fn test_call_batch_matches_call() {
        let (g, f) = build();
        let func = compile(&g, &[f], CompileOptions::default()).unwrap();
        let points: Vec<Point> = (0..16)
            .map(|i| Point::new().with("x", vec![0.0, i as f64 * 0.1]).with("y", i as f64))
            .collect();
        let batch = func.call_batch(&points).unwrap();
        for (p, out) in points.iter().zip(&batch) {
            assert_eq!(&func.call(p).unwrap(), out);
        }
    }

    #[test]
    fn test_typed_wrappers() {
        let mut g = Graph::new();
        let x = g.add_variable("x", vec![2], VarKind::Continuous, None).unwrap();
        let sq = g.square(x).unwrap();
        let f = g.sum(sq).unwrap();
        let point = Point::new().with("x", vec![1.0, -2.0]);

        let logp = LogpFn::new(&g, f, CompileOptions::default()).unwrap();
        assert_eq!(logp.call(&point).unwrap(), 5.0);
        let batch = [point.clone(), Point::new().with("x", vec![0.0, 3.0])];
        assert_eq!(logp.call_batch(&batch).unwrap(), vec![5.0, 9.0]);

        let grad = crate::derivatives::gradient(&mut g, f, None).unwrap();
        let grad = GradientFn::new(&g, grad, CompileOptions::default()).unwrap();
        assert_eq!(grad.call(&point).unwrap(), ndarray::arr1(&[2.0, -4.0]));

        let hess = crate::derivatives::hessian(&mut g, f, None).unwrap();
        let hess = HessianFn::new(&g, hess, CompileOptions::default()).unwrap();
        assert_eq!(
            hess.call(&point).unwrap(),
            ndarray::arr2(&[[-2.0, 0.0], [0.0, -2.0]])
        );
    }
}
