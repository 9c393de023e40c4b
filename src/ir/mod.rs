//! The functional IR: an ahead-of-time let-list representation compiled to
//! native code by the [`crate::jit`] backend.

pub mod builder;
pub mod node;
pub mod print;
pub mod types;

pub use builder::FunctionBuilder;
pub use node::{Constant, Expr, Function, Primitive, VarId};
pub use types::{StructRegistry, StructType, Type};
