#![forbid(unsafe_code)]

//! Formulas over a versioned time-series store.
//!
//! A formula is an s-expression such as `(add (series "a") (* 2 (series "b")))`
//! registered under a name and read like any stored series: at a revision
//! date, as a full history of versions, as a staircase of values known some
//! delay ahead, or once per scenario through formula bindings.
//!
//! The building blocks live in their own crates and are re-exported here:
//!
//! - [`types`]: the static type lattice and literal values.
//! - [`index`]: timestamps, sorted indexes and windows.
//! - [`frame`]: series, tables, combinators and version histories.
//! - [`expr`]: the formula codec and tree rewrites.
//! - [`runtime`]: engine configuration, policy and the decision ledger.
//!
//! The engine itself, with its store, sources and analysis passes, is at the
//! crate root.

pub use tf_expr as expr;
pub use tf_formula::*;
pub use tf_frame as frame;
pub use tf_index as index;
pub use tf_runtime as runtime;
pub use tf_types as types;

pub use tf_expr::{Node, parse, serialize};
pub use tf_frame::{Frame, Series};
pub use tf_index::{Stamp, Window};
pub use tf_runtime::{EngineConfig, RuntimePolicy};
