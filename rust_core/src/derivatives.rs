//! Gradient, Jacobian and Hessian construction over any [`Engine`].
//!
//! Everything here builds expressions; nothing is evaluated. When `vars` is
//! `None` the targets default to the continuous free inputs of `f`, in the
//! engine's free-input order. An explicit empty slice means "no variables":
//! `Some(&[])` never falls back to the defaults, so its gradient is an empty
//! vector and its Hessian an empty `0 x 0` matrix.
//!
//! Layout: gradients are the flattened per-variable gradients concatenated
//! in `vars` order. Jacobian columns follow the same layout; rows follow the
//! flattened elements of `f`.

use crate::engine::Engine;
use crate::expr::continuous_inputs;
use tracing::debug;

fn targets<E: Engine>(engine: &E, f: E::Expr, vars: Option<&[E::Expr]>) -> Result<Vec<E::Expr>, E::Error> {
    match vars {
        Some(vars) => Ok(vars.to_vec()),
        None => continuous_inputs(engine, f),
    }
}

/// Gradient of the scalar `f` with respect to `v`, flattened to 1-D.
pub fn flat_gradient<E: Engine>(engine: &mut E, f: E::Expr, v: E::Expr) -> Result<E::Expr, E::Error> {
    let g = engine.gradient_of(f, v)?;
    engine.flatten(g)
}

/// Flat gradient vectors of `f` for each variable, concatenated.
pub fn gradient<E: Engine>(
    engine: &mut E,
    f: E::Expr,
    vars: Option<&[E::Expr]>,
) -> Result<E::Expr, E::Error> {
    let vars = targets(engine, f, vars)?;
    debug!(vars = vars.len(), "building gradient");
    let parts = vars
        .iter()
        .map(|&v| flat_gradient(engine, f, v))
        .collect::<Result<Vec<_>, _>>()?;
    engine.concat(&parts)
}

/// Jacobian of the vector-valued `f` with respect to one variable: row `i`
/// is `flat_gradient(f[i], v)`.
pub fn jacobian1<E: Engine>(engine: &mut E, f: E::Expr, v: E::Expr) -> Result<E::Expr, E::Error> {
    let f = engine.flatten(f)?;
    let n = engine.size(f)?;
    let cols = engine.size(v)?;

    // Each row only reads `f` and `v`; rows are independent of each other.
    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let fi = engine.element(f, i)?;
        rows.push(flat_gradient(engine, fi, v)?);
    }
    engine.stack_rows(&rows, cols)
}

/// Per-variable Jacobians joined along the column axis.
pub fn jacobian<E: Engine>(
    engine: &mut E,
    f: E::Expr,
    vars: Option<&[E::Expr]>,
) -> Result<E::Expr, E::Error> {
    let vars = targets(engine, f, vars)?;
    let rows = engine.size(f)?;
    debug!(vars = vars.len(), rows, "building jacobian");
    let blocks = vars
        .iter()
        .map(|&v| jacobian1(engine, f, v))
        .collect::<Result<Vec<_>, _>>()?;
    engine.concat_columns(&blocks, rows)
}

/// `-jacobian(gradient(f, vars), vars)`.
///
/// The sign is the library convention: this is the Hessian of `-f`, which
/// is positive semi-definite at a maximum of `f`.
pub fn hessian<E: Engine>(
    engine: &mut E,
    f: E::Expr,
    vars: Option<&[E::Expr]>,
) -> Result<E::Expr, E::Error> {
    // Resolve defaults against `f` so both passes use the same targets.
    let vars = targets(engine, f, vars)?;
    let g = gradient(engine, f, Some(&vars))?;
    let j = jacobian(engine, g, Some(&vars))?;
    engine.neg(j)
}
