//! Modeling core for probabilistic programs.
//!
//! A [`Model`] collects free variables and additive log-probability factors
//! in an expression [`Graph`]. From it you get the total log-probability and
//! its symbolic gradient and Hessian, compiled into functions of a [`Point`].

pub mod autodiff;
pub mod compile;
pub mod context;
pub mod derivatives;
pub mod distributions;
pub mod engine;
pub mod error;
pub mod expr;
pub mod graph;
pub mod model;
pub mod point;
pub mod transforms;

pub use compile::{compile, CompileOptions, Function, GradientFn, HessianFn, LogpFn, UnusedInput};
pub use context::{with_context, Context, Scope};
pub use derivatives::{flat_gradient, gradient, hessian, jacobian, jacobian1};
pub use engine::Engine;
pub use error::{ContextError, GraphError, ModelError};
pub use graph::{Graph, NodeId, VarKind};
pub use model::{Model, ModelRef};
pub use point::{Point, Tensor};
