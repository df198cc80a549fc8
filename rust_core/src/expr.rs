//! Expression helpers: free inputs, kind filtering, and normalisation of
//! observed data into positional log-density arguments.

use crate::engine::Engine;
use crate::error::GraphError;
use crate::graph::VarKind;
use crate::point::{scalar, vector, Tensor};
use std::fmt::Debug;

/// Variable leaves feeding `outputs`. The order is stable across calls and
/// defines the coordinate layout of gradients built from it.
pub fn free_inputs<E: Engine>(engine: &E, outputs: &[E::Expr]) -> Result<Vec<E::Expr>, E::Error> {
    engine.free_inputs(outputs)
}

/// The variables in `vars` tagged with `kind`, order preserved.
pub fn filter_by_kind<E: Engine>(engine: &E, vars: &[E::Expr], kind: VarKind) -> Vec<E::Expr> {
    vars.iter()
        .copied()
        .filter(|v| engine.var_kind(*v) == Some(kind))
        .collect()
}

/// Continuous free inputs of `f`: the default differentiation targets.
pub fn continuous_inputs<E: Engine>(engine: &E, f: E::Expr) -> Result<Vec<E::Expr>, E::Error> {
    let inputs = free_inputs(engine, &[f])?;
    Ok(filter_by_kind(engine, &inputs, VarKind::Continuous))
}

/// Tabular data with named columns.
pub trait Columnar: Debug {
    /// Column names in column order.
    fn columns(&self) -> Vec<String>;
    fn column(&self, name: &str) -> Option<Tensor>;
}

/// A minimal column store: ordered named f64 columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<(String, Vec<f64>)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column, replacing one with the same name in place.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = values,
            None => self.columns.push((name, values)),
        }
        self
    }
}

impl Columnar for Table {
    fn columns(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }

    fn column(&self, name: &str) -> Option<Tensor> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| vector(v.clone()))
    }
}

/// Observed data in any of the accepted forms.
#[derive(Debug)]
pub enum Data {
    /// An explicit ordered group of arrays, passed through as is.
    Group(Vec<Tensor>),
    /// Column-wise data, expanded to one array per column.
    Table(Box<dyn Columnar>),
    /// A single array or scalar.
    Value(Tensor),
}

impl From<Tensor> for Data {
    fn from(value: Tensor) -> Self {
        Data::Value(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Value(scalar(value))
    }
}

impl From<Vec<f64>> for Data {
    fn from(values: Vec<f64>) -> Self {
        Data::Value(vector(values))
    }
}

impl From<Vec<Tensor>> for Data {
    fn from(group: Vec<Tensor>) -> Self {
        Data::Group(group)
    }
}

impl From<(Tensor, Tensor)> for Data {
    fn from((a, b): (Tensor, Tensor)) -> Self {
        Data::Group(vec![a, b])
    }
}

impl From<Table> for Data {
    fn from(table: Table) -> Self {
        Data::Table(Box::new(table))
    }
}

/// Canonical positional arguments for a log-density.
///
/// Fails if a table lists a column it cannot produce, since skipping it
/// would shift every later argument.
pub fn normalize_data(data: Data) -> Result<Vec<Tensor>, GraphError> {
    match data {
        Data::Group(group) => Ok(group),
        Data::Table(table) => table
            .columns()
            .into_iter()
            .map(|name| table.column(&name).ok_or(GraphError::MissingColumn { name }))
            .collect(),
        Data::Value(value) => Ok(vec![value]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn test_normalize_single_value() {
        assert_eq!(normalize_data(3.0.into()).unwrap(), vec![scalar(3.0)]);
        assert_eq!(
            normalize_data(vec![1.0, 2.0].into()).unwrap(),
            vec![vector(vec![1.0, 2.0])]
        );
    }

    #[test]
    fn test_normalize_group_passes_through() {
        let group = vec![vector(vec![1.0]), scalar(2.0), vector(vec![3.0, 4.0])];
        assert_eq!(normalize_data(Data::Group(group.clone())).unwrap(), group);
    }

    #[test]
    fn test_normalize_table_in_column_order() {
        let table = Table::new()
            .with_column("b", vec![1.0, 2.0])
            .with_column("a", vec![3.0, 4.0]);
        assert_eq!(
            normalize_data(table.into()).unwrap(),
            vec![vector(vec![1.0, 2.0]), vector(vec![3.0, 4.0])]
        );
    }

    /// Lists a column it cannot produce.
    #[derive(Debug)]
    struct Ragged;

    impl Columnar for Ragged {
        fn columns(&self) -> Vec<String> {
            vec!["a".into(), "gone".into(), "c".into()]
        }

        fn column(&self, name: &str) -> Option<Tensor> {
            (name != "gone").then(|| scalar(1.0))
        }
    }

    #[test]
    fn test_normalize_table_missing_column() {
        assert_eq!(
            normalize_data(Data::Table(Box::new(Ragged))).unwrap_err(),
            GraphError::MissingColumn { name: "gone".into() }
        );
    }

    #[test]
    fn test_filter_by_kind_keeps_order() {
        let mut g = Graph::new();
        let a = g.add_variable("a", vec![], VarKind::Continuous, None).unwrap();
        let k = g.add_variable("k", vec![], VarKind::Discrete, None).unwrap();
        let b = g.add_variable("b", vec![3], VarKind::Continuous, None).unwrap();
        let c = g.scalar(1.0);

        assert_eq!(filter_by_kind(&g, &[b, k, a, c], VarKind::Continuous), vec![b, a]);
        assert_eq!(filter_by_kind(&g, &[b, k, a, c], VarKind::Discrete), vec![k]);

        let s = g.sum(b).unwrap();
        let t = g.mul(a, k).unwrap();
        let f = g.add(s, t).unwrap();
        assert_eq!(free_inputs(&g, &[f]).unwrap(), vec![a, k, b]);
        assert_eq!(continuous_inputs(&g, f).unwrap(), vec![a, b]);
    }
}
