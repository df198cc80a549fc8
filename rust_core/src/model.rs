//! The model: free variables, additive log-probability factors, and the
//! compiled log-probability and derivatives built from them.
//!
//! Building and querying are not separate phases in the type system. Query
//! operations reflect whatever has been added so far. The nodes a query
//! appends are reused by later queries until another factor is added.

use crate::compile::{CompileOptions, GradientFn, HessianFn, LogpFn};
use crate::context::{with_context, Context, Shared};
use crate::derivatives;
use crate::distributions::Distribution;
use crate::error::{GraphError, ModelError};
use crate::expr::{filter_by_kind, normalize_data, Data};
use crate::graph::{Graph, NodeId, VarKind};
use crate::point::Point;
use crate::transforms::Transform;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Shared model handle, as stored on the context stack.
pub type ModelRef = Shared<Model>;

#[derive(Debug, Clone, Default)]
pub struct Model {
    graph: Graph,
    vars: Vec<NodeId>,
    factors: Vec<NodeId>,
    options: CompileOptions,
    built: Built,
}

/// Query nodes already in the graph, valid for the first `factors` factors.
#[derive(Debug, Clone, Default)]
struct Built {
    factors: usize,
    logp: Option<NodeId>,
    gradients: HashMap<Option<Vec<NodeId>>, NodeId>,
    hessians: HashMap<Option<Vec<NodeId>>, NodeId>,
}

impl Context for Model {}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh model behind a shared handle, ready for [`Context::enter`].
    pub fn shared() -> ModelRef {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph access, for building parameter expressions out of
    /// existing variables.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Free variables, in the order they were added.
    pub fn vars(&self) -> &[NodeId] {
        &self.vars
    }

    /// Log-probability terms, in the order they were added.
    pub fn factors(&self) -> &[NodeId] {
        &self.factors
    }

    /// A free variable of this model by name.
    pub fn variable(&self, name: &str) -> Option<NodeId> {
        self.graph
            .node_by_name(name)
            .filter(|id| self.vars.contains(id))
    }

    pub fn compile_options(&self) -> CompileOptions {
        self.options
    }

    pub fn set_compile_options(&mut self, options: CompileOptions) {
        self.options = options;
    }

    /// Run `build` against the graph, undoing every node it appended if it
    /// fails.
    fn atomically<R>(&mut self, build: impl FnOnce(&mut Graph) -> Result<R, GraphError>) -> Result<R, GraphError> {
        let mark = self.graph.len();
        let result = build(&mut self.graph);
        if result.is_err() {
            self.graph.truncate(mark);
        }
        result
    }

    /// The query cache, cleared if factors were added since it was filled.
    fn built(&mut self) -> &mut Built {
        if self.built.factors != self.factors.len() {
            self.built = Built {
                factors: self.factors.len(),
                ..Built::default()
            };
        }
        &mut self.built
    }

    // ── building ─────────────────────────────────────────────────────

    /// Add a log-probability factor for observed data. Creates no variable.
    pub fn add_observation<D>(&mut self, data: impl Into<Data>, dist: &D) -> Result<(), ModelError>
    where
        D: Distribution + ?Sized,
    {
        let values = normalize_data(data.into())?;
        let factor = self.atomically(|graph| {
            let args: Vec<NodeId> = values.into_iter().map(|v| graph.constant(v)).collect();
            dist.logp(graph, &args)
        })?;
        self.factors.push(factor);
        debug!(factor = factor.0, "added observation");
        Ok(())
    }

    /// Add a named free variable distributed as `dist`, with its factor.
    pub fn add_variable<D>(&mut self, name: &str, dist: &D) -> Result<NodeId, ModelError>
    where
        D: Distribution + ?Sized,
    {
        let (var, factor) = self.atomically(|graph| {
            let var = dist.make_var(graph, name)?;
            let factor = dist.logp(graph, &[var])?;
            Ok((var, factor))
        })?;
        self.vars.push(var);
        self.factors.push(factor);
        debug!(name, var = var.0, kind = ?dist.kind(), "added variable");
        Ok(var)
    }

    /// Add `dist` reparameterized through `transform`.
    ///
    /// The free variable is the raw one, named `"<transform>_<name>"`. Returns
    /// the constrained value (`backward(raw)`) and the raw variable.
    pub fn add_transformed_variable<D, T>(
        &mut self,
        name: &str,
        dist: D,
        transform: T,
    ) -> Result<(NodeId, NodeId), ModelError>
    where
        D: Distribution,
        T: Transform,
    {
        let raw_name = format!("{}_{}", transform.name(), name);
        let transformed = transform.apply(dist);
        let (raw, factor, value) = self.atomically(|graph| {
            let raw = transformed.make_var(graph, &raw_name)?;
            let factor = transformed.logp(graph, &[raw])?;
            let value = transformed.transform.backward(graph, raw)?;
            Ok((raw, factor, value))
        })?;
        self.vars.push(raw);
        self.factors.push(factor);
        debug!(name = %raw_name, var = raw.0, "added transformed variable");
        Ok((value, raw))
    }

    // ── querying ─────────────────────────────────────────────────────

    /// Total log-probability: each factor summed to a scalar, then the
    /// scalars added. A model without factors has log-probability 0.
    pub fn logp(&mut self) -> Result<NodeId, ModelError> {
        if let Some(logp) = self.built().logp {
            return Ok(logp);
        }
        let factors = self.factors.clone();
        let total = self.atomically(|graph| {
            let mut total: Option<NodeId> = None;
            for factor in factors {
                let term = graph.sum(factor)?;
                total = Some(match total {
                    Some(acc) => graph.add(acc, term)?,
                    None => term,
                });
            }
            Ok(match total {
                Some(t) => t,
                None => graph.scalar(0.0),
            })
        })?;
        self.built.logp = Some(total);
        Ok(total)
    }

    pub fn compiled_logp(&mut self) -> Result<LogpFn, ModelError> {
        let logp = self.logp()?;
        Ok(LogpFn::new(&self.graph, logp, self.options)?)
    }

    /// Compiled gradient of the log-probability. `None` differentiates with
    /// respect to every continuous input of the log-probability.
    pub fn compiled_gradient(&mut self, vars: Option<&[NodeId]>) -> Result<GradientFn, ModelError> {
        let logp = self.logp()?;
        let key = vars.map(<[NodeId]>::to_vec);
        let gradient = match self.built.gradients.get(&key) {
            Some(&gradient) => gradient,
            None => {
                let gradient = self.atomically(|graph| derivatives::gradient(graph, logp, vars))?;
                self.built.gradients.insert(key, gradient);
                gradient
            }
        };
        Ok(GradientFn::new(&self.graph, gradient, self.options)?)
    }

    /// Compiled (negated) Hessian of the log-probability.
    pub fn compiled_hessian(&mut self, vars: Option<&[NodeId]>) -> Result<HessianFn, ModelError> {
        let logp = self.logp()?;
        let key = vars.map(<[NodeId]>::to_vec);
        let hessian = match self.built.hessians.get(&key) {
            Some(&hessian) => hessian,
            None => {
                let hessian = self.atomically(|graph| derivatives::hessian(graph, logp, vars))?;
                self.built.hessians.insert(key, hessian);
                hessian
            }
        };
        Ok(HessianFn::new(&self.graph, hessian, self.options)?)
    }

    /// The log-probability at one point, compiled and evaluated once.
    pub fn logp_at(&mut self, point: &Point) -> Result<f64, ModelError> {
        Ok(self.compiled_logp()?.call(point)?)
    }

    /// Every variable's attached test value.
    pub fn test_point(&self) -> Result<Point, ModelError> {
        self.vars
            .iter()
            .filter_map(|&id| self.graph.variable(id))
            .map(|var| match &var.test_value {
                Some(value) => Ok((var.name.clone(), value.clone())),
                None => Err(ModelError::MissingTestValue {
                    name: var.name.clone(),
                }),
            })
            .collect()
    }

    pub fn continuous_variables(&self) -> Vec<NodeId> {
        filter_by_kind(&self.graph, &self.vars, VarKind::Continuous)
    }
}

// ── ambient builders ─────────────────────────────────────────────────
//
// `model: None` targets the innermost model opened with `Model::enter`.

pub fn add_variable<D>(model: Option<&ModelRef>, name: &str, dist: &D) -> Result<NodeId, ModelError>
where
    D: Distribution + ?Sized,
{
    with_context(model, |m| m.borrow_mut().add_variable(name, dist))?
}

pub fn add_observation<D>(model: Option<&ModelRef>, data: impl Into<Data>, dist: &D) -> Result<(), ModelError>
where
    D: Distribution + ?Sized,
{
    with_context(model, |m| m.borrow_mut().add_observation(data, dist))?
}

pub fn add_transformed_variable<D, T>(
    model: Option<&ModelRef>,
    name: &str,
    dist: D,
    transform: T,
) -> Result<(NodeId, NodeId), ModelError>
where
    D: Distribution,
    T: Transform,
{
    with_context(model, |m| m.borrow_mut().add_transformed_variable(name, dist, transform))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::item;
    use crate::distributions::{Bernoulli, HalfNormal, Normal, Uniform};
    use crate::error::ContextError;
    use crate::graph::Op;
    use crate::point::{scalar, vector, Tensor};
    use crate::transforms::{IntervalTransform, LogTransform};
    use approx::assert_abs_diff_eq;

    const HALF_LN_TAU: f64 = 0.918_938_533_204_672_8;

    /// A distribution without a default value.
    struct Flat;

    impl Distribution for Flat {
        fn logp(&self, graph: &mut Graph, values: &[NodeId]) -> Result<NodeId, GraphError> {
            let zero = graph.scalar(0.0);
            graph.mul(zero, values[0])
        }
    }

    /// x ~ N(0, 1); 3.0 ~ N(x, 1)
    fn scenario() -> (Model, NodeId) {
        let mut m = Model::new();
        let x = m.add_variable("x", &Normal::new(0.0, 1.0)).unwrap();
        m.add_observation(3.0, &Normal::new(x, 1.0)).unwrap();
        (m, x)
    }

    #[test]
    fn test_scenario_logp_and_derivatives() {
        let (mut m, _) = scenario();
        let at = Point::new().with("x", 0.0);

        let lp = m.compiled_logp().unwrap().call(&at).unwrap();
        assert_abs_diff_eq!(lp, -4.5 - 2.0 * HALF_LN_TAU, epsilon = 1e-12);

        // d/dx [-x²/2 - (3 - x)²/2] = 3 - 2x
        let grad = m.compiled_gradient(None).unwrap().call(&at).unwrap();
        assert_eq!(grad.len(), 1);
        assert_abs_diff_eq!(grad[0], 3.0, epsilon = 1e-12);
        let grad = m.compiled_gradient(None).unwrap().call(&Point::new().with("x", 1.0)).unwrap();
        assert_abs_diff_eq!(grad[0], 1.0, epsilon = 1e-12);

        let hess = m.compiled_hessian(None).unwrap().call(&at).unwrap();
        assert_eq!(hess.shape(), &[1, 1]);
        assert_abs_diff_eq!(hess[[0, 0]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_logp_is_additive() {
        let mut m = Model::new();
        let a = Normal::new(1.0, 2.0);
        let b = Uniform::new(-1.0, 1.0).with_shape(vec![2]);
        m.add_variable("a", &a).unwrap();
        m.add_variable("b", &b).unwrap();

        let at = Point::new().with("a", 0.5).with("b", vec![0.1, -0.3]);
        let total = m.logp_at(&at).unwrap();
        let expected = (-0.5 * 0.0625 - 2.0_f64.ln() - HALF_LN_TAU) + 2.0 * -(2.0_f64.ln());
        assert_abs_diff_eq!(total, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_vector_factor_is_reduced_first() {
        let mut m = Model::new();
        let mu = m.add_variable("mu", &Normal::new(0.0, 10.0)).unwrap();
        m.add_observation(vec![1.0, 2.0, 3.0], &Normal::new(mu, 1.0)).unwrap();
        assert_eq!(m.graph().shape(m.factors()[1]).unwrap(), &[3]);

        let logp = m.logp().unwrap();
        assert_eq!(m.graph().shape(logp).unwrap(), &[] as &[usize]);

        let grad = m.compiled_gradient(None).unwrap();
        let g = grad.call(&Point::new().with("mu", 2.0)).unwrap();
        // Σ (y - mu) - mu / 100
        assert_abs_diff_eq!(g[0], 0.0 - 0.02, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_model() {
        let mut m = Model::new();
        assert_eq!(m.logp_at(&Point::new()).unwrap(), 0.0);
        assert!(m.test_point().unwrap().is_empty());
        let grad = m.compiled_gradient(None).unwrap().call(&Point::new()).unwrap();
        assert_eq!(grad.len(), 0);
    }

    #[test]
    fn test_continuous_variables_exclude_discrete() {
        let mut m = Model::new();
        let x = m.add_variable("x", &Normal::new(0.0, 1.0)).unwrap();
        assert_eq!(m.continuous_variables(), vec![x]);
        let k = m.add_variable("k", &Bernoulli::new(0.4)).unwrap();
        assert_eq!(m.vars(), &[x, k]);
        assert_eq!(m.continuous_variables(), vec![x]);
    }

    #[test]
    fn test_discrete_inputs_are_not_default_targets() {
        let mut m = Model::new();
        let k = m.add_variable("k", &Bernoulli::new(0.4)).unwrap();
        let x = m.add_variable("x", &Normal::new(0.0, 1.0)).unwrap();
        let mean = m.graph_mut().mul(k, x).unwrap();
        m.add_observation(1.0, &Normal::new(mean, 1.0)).unwrap();

        let grad = m.compiled_gradient(None).unwrap();
        let at = Point::new().with("k", 1.0).with("x", 0.0);
        let g = grad.call(&at).unwrap();
        assert_eq!(g.len(), 1);
        assert_abs_diff_eq!(g[0], 1.0, epsilon = 1e-12);

        let err = m.compiled_gradient(Some(&[k])).unwrap_err();
        assert_eq!(err, ModelError::Graph(GraphError::DiscreteVariable("k".into())));
    }

    #[test]
    fn test_transformed_variable() {
        let mut m = Model::new();
        let (sigma, raw) = m
            .add_transformed_variable("sigma", HalfNormal::new(1.0), LogTransform)
            .unwrap();

        assert_eq!(m.vars(), &[raw]);
        assert_eq!(m.factors().len(), 1);
        assert_eq!(m.graph().variable(raw).unwrap().name, "log_sigma");
        assert_eq!(m.variable("log_sigma"), Some(raw));
        assert_eq!(m.variable("sigma"), None);
        assert!(matches!(m.graph().node(sigma).unwrap().op, Op::Exp(r) if r == raw));

        // Test value lives in the raw space.
        let tp = m.test_point().unwrap();
        assert_abs_diff_eq!(item(tp.get("log_sigma").unwrap()), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_transformed_hessian_matches_gradient_differences() {
        let mut m = Model::new();
        let (p, _) = m
            .add_transformed_variable("p", Uniform::new(0.0, 1.0), IntervalTransform::new(0.0, 1.0))
            .unwrap();
        m.add_observation(vec![1.0, 0.0, 1.0], &Bernoulli::new(p)).unwrap();

        let grad = m.compiled_gradient(None).unwrap();
        let hess = m.compiled_hessian(None).unwrap();
        let r = 0.4;
        let eps = 1e-6;
        let g = |v: f64| grad.call(&Point::new().with("interval_p", v)).unwrap()[0];
        let fd = (g(r + eps) - g(r - eps)) / (2.0 * eps);
        let h = hess.call(&Point::new().with("interval_p", r)).unwrap();
        assert_abs_diff_eq!(h[[0, 0]], -fd, epsilon = 1e-5);
    }

    #[test]
    fn test_failed_add_leaves_model_unchanged() {
        let mut m = Model::new();
        let v = m.graph_mut().add_variable("v", vec![2], VarKind::Continuous, None).unwrap();
        let before = m.graph().len();

        let bad = Normal::new(v, 1.0).with_shape(vec![3]);
        let err = m.add_variable("x", &bad).unwrap_err();
        assert!(matches!(err, ModelError::Graph(GraphError::ShapeMismatch { .. })));
        assert!(m.vars().is_empty());
        assert!(m.factors().is_empty());
        assert_eq!(m.graph().len(), before);
        assert!(m.add_variable("x", &Normal::new(0.0, 1.0)).is_ok());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut m = Model::new();
        m.add_variable("x", &Normal::new(0.0, 1.0)).unwrap();
        let err = m.add_variable("x", &Normal::new(0.0, 1.0)).unwrap_err();
        assert_eq!(err, ModelError::Graph(GraphError::DuplicateVariable("x".into())));
        assert_eq!(m.vars().len(), 1);
    }

    #[test]
    fn test_test_point() {
        let (m, _) = scenario();
        let tp = m.test_point().unwrap();
        assert_eq!(tp.len(), 1);
        assert_eq!(tp.get("x").unwrap(), &scalar(0.0));

        let mut m = Model::new();
        m.add_variable("flat", &Flat).unwrap();
        assert_eq!(
            m.test_point().unwrap_err(),
            ModelError::MissingTestValue { name: "flat".into() }
        );
    }

    #[test]
    fn test_gradient_layout_follows_vars() {
        let mut m = Model::new();
        let a = m.add_variable("a", &Normal::new(0.0, 1.0).with_shape(vec![2])).unwrap();
        let b = m.add_variable("b", &Normal::new(0.0, 1.0)).unwrap();
        let at = Point::new().with("a", vec![1.0, 2.0]).with("b", 3.0);

        let ab = m.compiled_gradient(Some(&[a, b])).unwrap().call(&at).unwrap();
        let ba = m.compiled_gradient(Some(&[b, a])).unwrap().call(&at).unwrap();
        assert_eq!(ab.to_vec(), vec![-1.0, -2.0, -3.0]);
        assert_eq!(ba.to_vec(), vec![-3.0, -1.0, -2.0]);
    }

    #[test]
    fn test_extra_point_entries_ignored() {
        let (mut m, _) = scenario();
        let at = Point::new().with("x", 0.0).with("unrelated", vector(vec![1.0, 2.0]));
        assert!(m.logp_at(&at).is_ok());
        let missing = m.logp_at(&Point::new()).unwrap_err();
        assert_eq!(missing, ModelError::Graph(GraphError::MissingInput { name: "x".into() }));
    }

    #[test]
    fn test_ambient_model() {
        let a = Model::shared();
        let b = Model::shared();
        {
            let _outer = Model::enter(&a);
            add_variable(None, "x", &Normal::new(0.0, 1.0)).unwrap();
            {
                let _inner = Model::enter(&b);
                add_variable(None, "y", &Normal::new(0.0, 1.0)).unwrap();
                add_transformed_variable(None, "s", HalfNormal::new(1.0), LogTransform).unwrap();
                // An explicit model always wins.
                add_observation(Some(&a), 1.0, &Normal::new(0.0, 1.0)).unwrap();
            }
            add_observation(None, vec![1.0, 2.0], &Normal::new(0.0, 1.0)).unwrap();
        }

        let a = a.borrow();
        let b = b.borrow();
        assert_eq!(a.vars().len(), 1);
        assert_eq!(a.factors().len(), 3);
        assert!(a.variable("x").is_some());
        assert_eq!(b.vars().len(), 2);
        assert!(b.variable("log_s").is_some());

        let err = add_variable(None, "z", &Normal::new(0.0, 1.0)).unwrap_err();
        assert!(matches!(err, ModelError::Context(ContextError::Empty { .. })));
    }

    #[test]
    fn test_repeated_queries_reuse_nodes() {
        let (mut m, x) = scenario();
        let mut lens = Vec::new();
        for _ in 0..3 {
            m.logp().unwrap();
            m.compiled_logp().unwrap();
            m.compiled_gradient(None).unwrap();
            m.compiled_hessian(None).unwrap();
            lens.push(m.graph().len());
        }
        assert_eq!(lens[0], lens[1]);
        assert_eq!(lens[1], lens[2]);

        // Explicit targets are a separate entry.
        m.compiled_gradient(Some(&[x])).unwrap();
        let len = m.graph().len();
        m.compiled_gradient(Some(&[x])).unwrap();
        assert_eq!(m.graph().len(), len);
    }

    #[test]
    fn test_queries_follow_new_factors() {
        let (mut m, x) = scenario();
        let at = Point::new().with("x", 0.0);
        let before = m.compiled_gradient(None).unwrap().call(&at).unwrap();
        assert_abs_diff_eq!(before[0], 3.0, epsilon = 1e-12);

        // A second observation at 1.0 adds 1 - x to the slope.
        m.add_observation(1.0, &Normal::new(x, 1.0)).unwrap();
        let after = m.compiled_gradient(None).unwrap().call(&at).unwrap();
        assert_abs_diff_eq!(after[0], 4.0, epsilon = 1e-12);
        let lp = m.logp_at(&at).unwrap();
        assert_abs_diff_eq!(lp, -5.0 - 3.0 * HALF_LN_TAU, epsilon = 1e-12);
    }

    #[test]
    fn test_hessian_with_bounded_prior() {
        // Inside its support the Uniform density is flat in `u`.
        let mut m = Model::new();
        let u = m.add_variable("u", &Uniform::new(0.0, 1.0)).unwrap();
        let x = m.add_variable("x", &Normal::new(0.0, 1.0)).unwrap();
        let at = Point::new().with("u", 0.5).with("x", 0.3);

        let g = m.compiled_gradient(None).unwrap().call(&at).unwrap();
        assert_abs_diff_eq!(g[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g[1], -0.3, epsilon = 1e-12);

        let h = m.compiled_hessian(None).unwrap().call(&at).unwrap();
        assert_eq!(h.shape(), &[2, 2]);
        for (got, want) in h.iter().zip([0.0, 0.0, 0.0, 1.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }

        let only_u = m.compiled_hessian(Some(&[u])).unwrap().call(&at).unwrap();
        assert_eq!(only_u.shape(), &[1, 1]);
        assert_abs_diff_eq!(only_u[[0, 0]], 0.0, epsilon = 1e-12);
        let only_x = m.compiled_hessian(Some(&[x])).unwrap().call(&at).unwrap();
        assert_abs_diff_eq!(only_x[[0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compile_options_are_applied() {
        let (mut m, _) = scenario();
        m.set_compile_options(CompileOptions::strict());
        let f = m.compiled_logp().unwrap();
        let at = Point::new().with("x", 0.0).with("extra", 1.0);
        assert_eq!(
            f.call(&at).unwrap_err(),
            GraphError::UnusedInput { name: "extra".into() }
        );
        let value: Tensor = scalar(0.0);
        assert!(f.call(&Point::new().with("x", value)).is_ok());
    }
}
