//! Trace instructions.
//!
//! One `Inst` is recorded per SSA value. Operands are indices of earlier
//! values; stores additionally name the destination buffer slab directly,
//! which is why their dataflow dependencies differ from their operand layout.

use smallvec::{smallvec, SmallVec};

use crate::runtime::buffers::BufferId;
use crate::trace::table::ValueId;

/// Dependency edges of an instruction, in operand order.
pub type DepList = SmallVec<[ValueId; 3]>;

/// Binary opcodes. The arithmetic group is spelled `F*` but is emitted on
/// whatever element type the frontend recorded; the kernel dialect's usual
/// promotion rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
    Mod,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    CmpEq,
    CmpNe,
}

impl BinOp {
    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            BinOp::CmpLt | BinOp::CmpLe | BinOp::CmpGt | BinOp::CmpGe | BinOp::CmpEq | BinOp::CmpNe
        )
    }

    /// Infix spelling in the kernel dialect.
    pub fn dialect_op(self) -> &'static str {
        match self {
            BinOp::FAdd => "+",
            BinOp::FSub => "-",
            BinOp::FMul => "*",
            BinOp::FDiv => "/",
            BinOp::Mod => "%",
            BinOp::CmpLt => "<",
            BinOp::CmpLe => "<=",
            BinOp::CmpGt => ">",
            BinOp::CmpGe => ">=",
            BinOp::CmpEq => "==",
            BinOp::CmpNe => "!=",
        }
    }
}

/// Unary library-call opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Sin,
    Cos,
    Sqrt,
}

impl UnOp {
    pub fn dialect_fn(self) -> &'static str {
        match self {
            UnOp::Sin => "sin",
            UnOp::Cos => "cos",
            UnOp::Sqrt => "sqrt",
        }
    }
}

/// A recorded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    /// The work-item index pseudo-value. Only ever lives in the predefined
    /// slot; appending it is invalid.
    ThreadIndex,
    ConstInt(i32),
    ConstFloat(f64),
    Binary { op: BinOp, lhs: ValueId, rhs: ValueId },
    Unary { op: UnOp, arg: ValueId },
    Select { cond: ValueId, if_true: ValueId, if_false: ValueId },
    /// Masked gather from the buffer owned by `src` (which must have been
    /// materialized by an earlier launch): `mask ? buf[index] : 0`.
    Load { src: ValueId, mask: ValueId, index: ValueId },
    /// Masked scatter into an explicit buffer slab:
    /// `if (mask) buf[index] = value`.
    Store { buffer: BufferId, index: ValueId, value: ValueId, mask: ValueId },
}

impl Inst {
    /// Dataflow dependencies, in the order the scheduler visits them.
    pub fn deps(&self) -> DepList {
        match *self {
            Inst::ThreadIndex | Inst::ConstInt(_) | Inst::ConstFloat(_) => smallvec![],
            Inst::Binary { lhs, rhs, .. } => smallvec![lhs, rhs],
            Inst::Unary { arg, .. } => smallvec![arg],
            Inst::Select { cond, if_true, if_false } => smallvec![cond, if_true, if_false],
            Inst::Load { src, mask, index } => smallvec![src, mask, index],
            Inst::Store { index, value, mask, .. } => smallvec![index, value, mask],
        }
    }
}
