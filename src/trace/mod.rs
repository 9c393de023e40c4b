//! The trace recorder: SSA value records, instructions, and external handles.

pub mod handle;
pub mod inst;
pub mod table;

pub use handle::Handle;
pub use inst::{BinOp, Inst, UnOp};
pub use table::{Value, ValueId, ValueTable, PREDEFINED_COUNT, THREAD_INDEX};
