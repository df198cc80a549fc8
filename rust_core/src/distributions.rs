use crate::error::GraphError;
use crate::graph::{Graph, NodeId, VarKind};
use crate::point::Tensor;
use ndarray::{ArrayD, IxDyn};

/// A named probability distribution: creates its variables and builds its
/// log-density as a graph expression.
pub trait Distribution {
    /// Shape of one draw. Empty for scalars.
    fn shape(&self) -> Vec<usize> {
        Vec::new()
    }

    fn kind(&self) -> VarKind {
        VarKind::Continuous
    }

    /// Value attached to new variables as their test value.
    fn default_value(&self) -> Option<Tensor> {
        None
    }

    /// Register a fresh variable distributed like `self`.
    fn make_var(&self, graph: &mut Graph, name: &str) -> Result<NodeId, GraphError> {
        graph.add_variable(name, self.shape(), self.kind(), self.default_value())
    }

    /// Element-wise log-density at `values` (positional arguments).
    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError>;
}

/// A distribution parameter: a fixed number or an expression in the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param {
    Value(f64),
    Node(NodeId),
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Value(v)
    }
}

impl From<NodeId> for Param {
    fn from(id: NodeId) -> Self {
        Param::Node(id)
    }
}

impl Param {
    fn node(self, graph: &mut Graph) -> NodeId {
        match self {
            Param::Value(v) => graph.scalar(v),
            Param::Node(id) => id,
        }
    }

    fn value(self) -> Option<f64> {
        match self {
            Param::Value(v) => Some(v),
            Param::Node(_) => None,
        }
    }
}

fn single(values: &[NodeId]) -> Result<NodeId, GraphError> {
    match values {
        [v] => Ok(*v),
        _ => Err(GraphError::Arity {
            expected: 1,
            got: values.len(),
        }),
    }
}

fn filled(shape: &[usize], v: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(shape), v)
}

const HALF_LN_TAU: f64 = 0.918_938_533_204_672_8;

// ── Normal (unconstrained) ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Normal {
    pub mu: Param,
    pub sigma: Param,
    pub shape: Vec<usize>,
}

impl Normal {
    pub fn new(mu: impl Into<Param>, sigma: impl Into<Param>) -> Self {
        Self {
            mu: mu.into(),
            sigma: sigma.into(),
            shape: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }
}

impl Distribution for Normal {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn default_value(&self) -> Option<Tensor> {
        Some(filled(&self.shape, self.mu.value().unwrap_or(0.0)))
    }

    /// -(x - mu)^2 / (2 sigma^2) - ln(sigma) - ln(2 pi) / 2
    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
        let x = single(values)?;
        let mu = self.mu.node(graph);
        let sigma = self.sigma.node(graph);
        let diff = graph.sub(x, mu)?;
        let z = graph.div(diff, sigma)?;
        let z2 = graph.square(z)?;
        let half = graph.scalar(-0.5);
        let quad = graph.mul(half, z2)?;
        let log_sigma = graph.log(sigma)?;
        let t = graph.sub(quad, log_sigma)?;
        let norm = graph.scalar(-HALF_LN_TAU);
        graph.add(t, norm)
    }
}

// ── HalfNormal (x >= 0) ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HalfNormal {
    pub sigma: Param,
    pub shape: Vec<usize>,
}

impl HalfNormal {
    pub fn new(sigma: impl Into<Param>) -> Self {
        Self {
            sigma: sigma.into(),
            shape: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }
}

impl Distribution for HalfNormal {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn default_value(&self) -> Option<Tensor> {
        Some(filled(&self.shape, self.sigma.value().unwrap_or(1.0)))
    }

    /// Normal(0, sigma) density doubled on x >= 0, -inf below.
    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
        let x = single(values)?;
        let inner = Normal::new(0.0, self.sigma).logp(graph, &[x])?;
        let ln2 = graph.scalar(std::f64::consts::LN_2);
        let inner = graph.add(inner, ln2)?;
        graph.bound(x, inner, 0.0, f64::INFINITY, f64::NEG_INFINITY)
    }
}

// ── Uniform (lower <= x <= upper) ───────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Uniform {
    pub lower: f64,
    pub upper: f64,
    pub shape: Vec<usize>,
}

impl Uniform {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self {
            lower,
            upper,
            shape: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }
}

impl Distribution for Uniform {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn default_value(&self) -> Option<Tensor> {
        Some(filled(&self.shape, 0.5 * (self.lower + self.upper)))
    }

    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
        let x = single(values)?;
        let density = graph.scalar(-(self.upper - self.lower).ln());
        graph.bound(x, density, self.lower, self.upper, f64::NEG_INFINITY)
    }
}

// ── Exponential (x >= 0) ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Exponential {
    pub lam: Param,
    pub shape: Vec<usize>,
}

impl Exponential {
    pub fn new(lam: impl Into<Param>) -> Self {
        Self {
            lam: lam.into(),
            shape: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }
}

impl Distribution for Exponential {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn default_value(&self) -> Option<Tensor> {
        let mean = self.lam.value().map(|l| 1.0 / l).unwrap_or(1.0);
        Some(filled(&self.shape, mean))
    }

    /// ln(lam) - lam * x on x >= 0.
    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
        let x = single(values)?;
        let lam = self.lam.node(graph);
        let log_lam = graph.log(lam)?;
        let rate = graph.mul(lam, x)?;
        let inner = graph.sub(log_lam, rate)?;
        graph.bound(x, inner, 0.0, f64::INFINITY, f64::NEG_INFINITY)
    }
}

// ── Bernoulli (discrete, not differentiable) ────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Bernoulli {
    pub p: Param,
    pub shape: Vec<usize>,
}

impl Bernoulli {
    pub fn new(p: impl Into<Param>) -> Self {
        Self {
            p: p.into(),
            shape: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }
}

impl Distribution for Bernoulli {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn kind(&self) -> VarKind {
        VarKind::Discrete
    }

    fn default_value(&self) -> Option<Tensor> {
        let mode = match self.p.value() {
            Some(p) if p >= 0.5 => 1.0,
            _ => 0.0,
        };
        Some(filled(&self.shape, mode))
    }

    /// x ln(p) + (1 - x) ln(1 - p) on 0 <= x <= 1.
    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
        let x = single(values)?;
        let p = self.p.node(graph);
        let one = graph.scalar(1.0);
        let log_p = graph.log(p)?;
        let q = graph.sub(one, p)?;
        let log_q = graph.log(q)?;
        let not_x = graph.sub(one, x)?;
        let hit = graph.mul(x, log_p)?;
        let miss = graph.mul(not_x, log_q)?;
        let inner = graph.add(hit, miss)?;
        graph.bound(x, inner, 0.0, 1.0, f64::NEG_INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{forward, item};
    use crate::point::{scalar, vector};
    use approx::assert_abs_diff_eq;

    fn logp_at(dist: &dyn Distribution, value: Tensor) -> Tensor {
        let mut g = Graph::new();
        let x = g.constant(value);
        let lp = dist.logp(&mut g, &[x]).unwrap();
        forward(&g.nodes, |_| unreachable!()).unwrap()[lp.0].clone()
    }

    #[test]
    fn test_normal_logp() {
        let lp = item(&logp_at(&Normal::new(1.0, 2.0), scalar(2.0)));
        let expected = -0.5 * 0.25 - 2.0_f64.ln() - HALF_LN_TAU;
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(HALF_LN_TAU, 0.5 * std::f64::consts::TAU.ln(), epsilon = 1e-15);
    }

    #[test]
    fn test_normal_is_elementwise() {
        let lp = logp_at(&Normal::new(0.0, 1.0), vector(vec![0.0, 1.0, 2.0]));
        assert_eq!(lp.shape(), &[3]);
        assert_abs_diff_eq!(lp[[1]] - lp[[0]], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_normal_with_node_mean() {
        let mut g = Graph::new();
        let mu = g.add_variable("mu", vec![], VarKind::Continuous, None).unwrap();
        let obs = g.scalar(3.0);
        let lp = Normal::new(mu, 1.0).logp(&mut g, &[obs]).unwrap();
        let values = forward(&g.nodes, |_| Ok(scalar(1.0))).unwrap();
        assert_abs_diff_eq!(item(&values[lp.0]), -2.0 - HALF_LN_TAU, epsilon = 1e-12);
    }

    #[test]
    fn test_half_normal_support() {
        let d = HalfNormal::new(1.0);
        assert_eq!(item(&logp_at(&d, scalar(-0.1))), f64::NEG_INFINITY);
        let expected = std::f64::consts::LN_2 - 0.5 - HALF_LN_TAU;
        assert_abs_diff_eq!(item(&logp_at(&d, scalar(1.0))), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_density() {
        let d = Uniform::new(-1.0, 3.0);
        assert_abs_diff_eq!(item(&logp_at(&d, scalar(0.0))), -(4.0_f64.ln()), epsilon = 1e-12);
        assert_eq!(item(&logp_at(&d, scalar(3.5))), f64::NEG_INFINITY);
        let lp = logp_at(&d.clone().with_shape(vec![2]), vector(vec![0.0, 5.0]));
        assert_eq!(lp[[1]], f64::NEG_INFINITY);
        assert_eq!(d.default_value().unwrap(), scalar(1.0));
    }

    #[test]
    fn test_exponential() {
        let d = Exponential::new(2.0);
        assert_abs_diff_eq!(item(&logp_at(&d, scalar(0.5))), 2.0_f64.ln() - 1.0, epsilon = 1e-12);
        assert_eq!(d.default_value().unwrap(), scalar(0.5));
    }

    #[test]
    fn test_bernoulli() {
        let d = Bernoulli::new(0.3);
        assert_eq!(d.kind(), VarKind::Discrete);
        assert_abs_diff_eq!(item(&logp_at(&d, scalar(1.0))), 0.3_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(item(&logp_at(&d, scalar(0.0))), 0.7_f64.ln(), epsilon = 1e-12);
        assert_eq!(d.default_value().unwrap(), scalar(0.0));
    }

    #[test]
    fn test_make_var_uses_default_as_test_value() {
        let mut g = Graph::new();
        let d = Normal::new(2.0, 1.0).with_shape(vec![3]);
        let x = d.make_var(&mut g, "x").unwrap();
        let var = g.variable(x).unwrap();
        assert_eq!(var.shape, vec![3]);
        assert_eq!(var.test_value.as_ref().unwrap(), &vector(vec![2.0, 2.0, 2.0]));
    }

    #[test]
    fn test_arity_checked() {
        let mut g = Graph::new();
        let a = g.scalar(0.0);
        let err = Normal::new(0.0, 1.0).logp(&mut g, &[a, a]).unwrap_err();
        assert_eq!(err, GraphError::Arity { expected: 1, got: 2 });
    }
}
