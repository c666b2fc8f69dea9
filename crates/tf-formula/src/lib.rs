#![forbid(unsafe_code)]

pub mod analysis;
pub mod binder;
mod builtins;
pub mod engine;
mod error;
pub mod interp;
pub mod metadata;
mod query;
pub mod registry;
pub mod source;
pub mod store;
mod value;

pub use analysis::{LeafMeta, check_tz, find_metas, find_series, typecheck, unknown_operators};
pub use binder::{Binding, BindingRow, Combination, combinations};
pub use engine::{FormulaEngine, FormulaRecord, GroupType, RegisterOptions, SeriesType};
pub use error::FormulaError;
pub use interp::{Interpreter, Resolve};
pub use metadata::Metadata;
pub use query::{HistoryQuery, Query};
pub use registry::{Arity, Builtin, Descriptor, Metas, Operator, Registry, Returns, Signature};
pub use source::{Component, Components, Source, Sources};
pub use store::{MemoryStore, SeriesStore, StoreError};
pub use tf_frame::{History, IDate};
pub use value::{Args, Value};
