use crate::distributions::Distribution;
use crate::error::GraphError;
use crate::graph::{Graph, NodeId, VarKind};
use crate::point::Tensor;

/// A bijection between a constrained value and an unconstrained "raw" one.
///
/// Applying a transform to a distribution gives a distribution over the raw
/// value, with the density corrected by the log-Jacobian of `backward`.
pub trait Transform {
    /// Short name, used as the prefix of raw variable names.
    fn name(&self) -> &str;

    /// Constrained to raw, on concrete values.
    fn forward_value(&self, value: &Tensor) -> Tensor;

    /// Raw to constrained, as an expression.
    fn backward(&self, graph: &mut Graph, raw: NodeId) -> Result<NodeId, GraphError>;

    /// Element-wise log |d backward / d raw|.
    fn log_jacobian(&self, graph: &mut Graph, raw: NodeId) -> Result<NodeId, GraphError>;

    fn apply<D: Distribution>(self, base: D) -> Transformed<D, Self>
    where
        Self: Sized,
    {
        Transformed {
            base,
            transform: self,
        }
    }
}

/// `base` reparameterized through `transform`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed<D, T> {
    pub base: D,
    pub transform: T,
}

impl<D: Distribution, T: Transform> Distribution for Transformed<D, T> {
    fn shape(&self) -> Vec<usize> {
        self.base.shape()
    }

    fn kind(&self) -> VarKind {
        self.base.kind()
    }

    fn default_value(&self) -> Option<Tensor> {
        self.base
            .default_value()
            .map(|v| self.transform.forward_value(&v))
    }

    fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
        let raw = match values {
            [raw] => *raw,
            _ => {
                return Err(GraphError::Arity {
                    expected: 1,
                    got: values.len(),
                })
            }
        };
        let value = self.transform.backward(graph, raw)?;
        let lp = self.base.logp(graph, &[value])?;
        let jac = self.transform.log_jacobian(graph, raw)?;
        graph.add(lp, jac)
    }
}

/// Positive reals: `x = exp(raw)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogTransform;

impl Transform for LogTransform {
    fn name(&self) -> &str {
        "log"
    }

    fn forward_value(&self, value: &Tensor) -> Tensor {
        value.mapv(f64::ln)
    }

    fn backward(&self, graph: &mut Graph, raw: NodeId) -> Result<NodeId, GraphError> {
        graph.exp(raw)
    }

    fn log_jacobian(&self, _graph: &mut Graph, raw: NodeId) -> Result<NodeId, GraphError> {
        Ok(raw)
    }
}

/// The open interval `(lower, upper)`: `x = lower + (upper - lower) * sigmoid(raw)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalTransform {
    pub lower: f64,
    pub upper: f64,
}

impl IntervalTransform {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }
}

impl Transform for IntervalTransform {
    fn name(&self) -> &str {
        "interval"
    }

    fn forward_value(&self, value: &Tensor) -> Tensor {
        let (a, b) = (self.lower, self.upper);
        value.mapv(|x| ((x - a) / (b - x)).ln())
    }

    fn backward(&self, graph: &mut Graph, raw: NodeId) -> Result<NodeId, GraphError> {
        let s = graph.sigmoid(raw)?;
        let width = graph.scalar(self.upper - self.lower);
        let scaled = graph.mul(width, s)?;
        let lower = graph.scalar(self.lower);
        graph.add(lower, scaled)
    }

    /// `ln(upper - lower) + ln σ(raw) + ln(1 - σ(raw))`, written as
    /// `ln(upper - lower) - softplus(-raw) - softplus(raw)` so it stays finite
    /// for large `|raw|`.
    fn log_jacobian(&self, graph: &mut Graph, raw: NodeId) -> Result<NodeId, GraphError> {
        let neg = graph.neg(raw)?;
        let left = graph.softplus(neg)?;
        let right = graph.softplus(raw)?;
        let both = graph.add(left, right)?;
        let log_width = graph.scalar((self.upper - self.lower).ln());
        graph.sub(log_width, both)
    }
}
