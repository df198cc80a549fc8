use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArrayDyn};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use rustppl_core::distributions::{HalfNormal, Normal, Param, Uniform};
use rustppl_core::point::{scalar, vector};
use rustppl_core::transforms::{IntervalTransform, LogTransform};
use rustppl_core::{GradientFn, HessianFn, LogpFn, Model, NodeId, Point, Tensor};

fn value_error(err: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Handle to a model quantity: a free variable or a value derived from one.
#[pyclass(frozen)]
#[derive(Debug, Clone)]
struct Var {
    #[pyo3(get)]
    name: String,
    node: usize,
}

#[pymethods]
impl Var {
    fn __repr__(&self) -> String {
        format!("Var({})", self.name)
    }
}

/// A float, a list of floats, or a float numpy array.
fn tensor_from_py(value: &Bound<'_, PyAny>) -> PyResult<Tensor> {
    if let Ok(v) = value.extract::<f64>() {
        return Ok(scalar(v));
    }
    if let Ok(values) = value.extract::<Vec<f64>>() {
        return Ok(vector(values));
    }
    let arr: PyReadonlyArrayDyn<'_, f64> = value.extract()?;
    Ok(arr.as_array().to_owned())
}

fn point_from_dict(point: &Bound<'_, PyDict>) -> PyResult<Point> {
    let mut out = Point::new();
    for (key, value) in point.iter() {
        let name: String = key.extract()?;
        out.insert(name, tensor_from_py(&value)?);
    }
    Ok(out)
}

#[pyclass(name = "Model")]
#[derive(Debug, Default)]
struct PyModel {
    inner: Model,
    compiled: Compiled,
}

/// Functions compiled since the last variable or observation was added.
#[derive(Debug, Default)]
struct Compiled {
    logp: Option<LogpFn>,
    grad: Option<GradientFn>,
    hessian: Option<HessianFn>,
}

impl PyModel {
    fn param(&self, arg: Option<&Bound<'_, PyAny>>, default: f64) -> PyResult<Param> {
        let Some(arg) = arg else {
            return Ok(Param::Value(default));
        };
        if let Ok(var) = arg.downcast::<Var>() {
            let node = NodeId(var.get().node);
            self.inner.graph().node(node).map_err(value_error)?;
            return Ok(Param::Node(node));
        }
        Ok(Param::Value(arg.extract()?))
    }

    fn logp_fn(&mut self) -> PyResult<&LogpFn> {
        let f = match self.compiled.logp.take() {
            Some(f) => f,
            None => self.inner.compiled_logp().map_err(value_error)?,
        };
        Ok(&*self.compiled.logp.insert(f))
    }

    fn grad_fn(&mut self) -> PyResult<&GradientFn> {
        let f = match self.compiled.grad.take() {
            Some(f) => f,
            None => self.inner.compiled_gradient(None).map_err(value_error)?,
        };
        Ok(&*self.compiled.grad.insert(f))
    }

    fn hessian_fn(&mut self) -> PyResult<&HessianFn> {
        let f = match self.compiled.hessian.take() {
            Some(f) => f,
            None => self.inner.compiled_hessian(None).map_err(value_error)?,
        };
        Ok(&*self.compiled.hessian.insert(f))
    }

    fn node(&mut self, arg: &Bound<'_, PyAny>) -> PyResult<NodeId> {
        match self.param(Some(arg), 0.0)? {
            Param::Node(node) => Ok(node),
            Param::Value(v) => Ok(self.inner.graph_mut().scalar(v)),
        }
    }
}

fn shape_of(size: Option<usize>) -> Vec<usize> {
    size.map(|n| vec![n]).unwrap_or_default()
}

#[pymethods]
impl PyModel {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    #[pyo3(signature = (name, mu=None, sigma=None, size=None))]
    fn normal(
        &mut self,
        name: &str,
        mu: Option<&Bound<'_, PyAny>>,
        sigma: Option<&Bound<'_, PyAny>>,
        size: Option<usize>,
    ) -> PyResult<Var> {
        let dist = Normal::new(self.param(mu, 0.0)?, self.param(sigma, 1.0)?).with_shape(shape_of(size));
        let node = self.inner.add_variable(name, &dist).map_err(value_error)?;
        self.compiled = Compiled::default();
        Ok(Var {
            name: name.to_string(),
            node: node.0,
        })
    }

    /// Positive variable, sampled on the log scale.
    #[pyo3(signature = (name, sigma=None, size=None))]
    fn half_normal(&mut self, name: &str, sigma: Option<&Bound<'_, PyAny>>, size: Option<usize>) -> PyResult<Var> {
        let dist = HalfNormal::new(self.param(sigma, 1.0)?).with_shape(shape_of(size));
        let (value, _) = self
            .inner
            .add_transformed_variable(name, dist, LogTransform)
            .map_err(value_error)?;
        self.compiled = Compiled::default();
        Ok(Var {
            name: name.to_string(),
            node: value.0,
        })
    }

    /// Variable on `(lower, upper)`, sampled through a logistic map.
    #[pyo3(signature = (name, lower=0.0, upper=1.0, size=None))]
    fn uniform(&mut self, name: &str, lower: f64, upper: f64, size: Option<usize>) -> PyResult<Var> {
        if !(lower < upper) {
            return Err(PyValueError::new_err(format!(
                "uniform bounds must satisfy lower < upper, got ({lower}, {upper})"
            )));
        }
        let dist = Uniform::new(lower, upper).with_shape(shape_of(size));
        let (value, _) = self
            .inner
            .add_transformed_variable(name, dist, IntervalTransform::new(lower, upper))
            .map_err(value_error)?;
        self.compiled = Compiled::default();
        Ok(Var {
            name: name.to_string(),
            node: value.0,
        })
    }

    /// `intercept + slope * x` for a data vector `x`.
    fn linear(&mut self, intercept: &Bound<'_, PyAny>, slope: &Bound<'_, PyAny>, x: &Bound<'_, PyAny>) -> PyResult<Var> {
        let data = tensor_from_py(x)?;
        let a = self.node(intercept)?;
        let b = self.node(slope)?;
        let graph = self.inner.graph_mut();
        let xs = graph.constant(data);
        let bx = graph.mul(b, xs).map_err(value_error)?;
        let mu = graph.add(a, bx).map_err(value_error)?;
        Ok(Var {
            name: "linear".to_string(),
            node: mu.0,
        })
    }

    #[pyo3(signature = (data, mu=None, sigma=None))]
    fn observe_normal(
        &mut self,
        data: &Bound<'_, PyAny>,
        mu: Option<&Bound<'_, PyAny>>,
        sigma: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<()> {
        let observed = tensor_from_py(data)?;
        let dist = Normal::new(self.param(mu, 0.0)?, self.param(sigma, 1.0)?);
        self.inner.add_observation(observed, &dist).map_err(value_error)?;
        self.compiled = Compiled::default();
        Ok(())
    }

    fn logp(&mut self, point: &Bound<'_, PyDict>) -> PyResult<f64> {
        let point = point_from_dict(point)?;
        self.logp_fn()?.call(&point).map_err(value_error)
    }

    /// Log-probability at each point of a list, evaluated in parallel.
    fn logp_batch<'py>(&mut self, py: Python<'py>, points: Vec<Bound<'py, PyDict>>) -> PyResult<Bound<'py, PyArray1<f64>>> {
        let points = points.iter().map(point_from_dict).collect::<PyResult<Vec<_>>>()?;
        let logp = self.logp_fn()?;
        let values = py.allow_threads(|| logp.call_batch(&points)).map_err(value_error)?;
        Ok(values.into_pyarray(py))
    }

    fn grad<'py>(&mut self, py: Python<'py>, point: &Bound<'py, PyDict>) -> PyResult<Bound<'py, PyArray1<f64>>> {
        let point = point_from_dict(point)?;
        let grad = self.grad_fn()?;
        let values = py.allow_threads(|| grad.call(&point)).map_err(value_error)?;
        Ok(values.into_pyarray(py))
    }

    /// Negated Hessian of the log-probability.
    fn hessian<'py>(&mut self, py: Python<'py>, point: &Bound<'py, PyDict>) -> PyResult<Bound<'py, PyArray2<f64>>> {
        let point = point_from_dict(point)?;
        let hess = self.hessian_fn()?;
        let values = py.allow_threads(|| hess.call(&point)).map_err(value_error)?;
        Ok(values.into_pyarray(py))
    }

    fn test_point<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let point = self.inner.test_point().map_err(value_error)?;
        let dict = PyDict::new(py);
        for name in self.var_names() {
            let Some(value) = point.get(&name) else { continue };
            if value.ndim() == 0 {
                dict.set_item(name, value.sum())?;
            } else {
                dict.set_item(name, value.clone().into_pyarray(py))?;
            }
        }
        Ok(dict)
    }

    /// Names of the free variables, in gradient order.
    fn var_names(&self) -> Vec<String> {
        self.inner
            .vars()
            .iter()
            .filter_map(|&id| self.inner.graph().variable(id))
            .map(|v| v.name.clone())
            .collect()
    }

    fn __repr__(&self) -> String {
        format!(
            "rustppl Model ({} variables, {} factors)",
            self.inner.vars().len(),
            self.inner.factors().len()
        )
    }
}

#[pymodule]
fn rustppl(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyModel>()?;
    m.add_class::<Var>()?;
    Ok(())
}
