//! Interpreter for parsed host programs.
//!
//! Runs the kernel body once per work item. Arithmetic follows the device
//! dialect's C rules: operands promote bool → int → float, the result is
//! converted to the declared type of the destination local, and integer
//! overflow wraps.

use crate::backend::DeviceBufferId;
use crate::common::types::ElemType;
use crate::trace::inst::{BinOp, UnOp};

use super::parser::{HostProgram, Rhs, Stmt};

#[derive(Debug, Clone, Copy)]
enum Scalar {
    B(bool),
    I(i32),
    F(f32),
}

impl Scalar {
    fn as_i32(self) -> i32 {
        match self {
            Scalar::B(b) => b as i32,
            Scalar::I(i) => i,
            Scalar::F(f) => f as i32,
        }
    }

    fn as_f32(self) -> f32 {
        match self {
            Scalar::B(b) => b as i32 as f32,
            Scalar::I(i) => i as f32,
            Scalar::F(f) => f,
        }
    }

    fn truthy(self) -> bool {
        match self {
            Scalar::B(b) => b,
            Scalar::I(i) => i != 0,
            Scalar::F(f) => f != 0.0,
        }
    }

    fn convert(self, ty: ElemType) -> Scalar {
        match ty {
            ElemType::Bool => Scalar::B(self.truthy()),
            ElemType::I32 => Scalar::I(self.as_i32()),
            ElemType::F32 => Scalar::F(self.as_f32()),
            ElemType::None => panic!("cannot hold a value of type none"),
        }
    }
}

pub(super) fn run(
    prog: &HostProgram,
    global_size: usize,
    store: &mut [Option<Vec<u8>>],
    args: &[DeviceBufferId],
) -> Result<(), String> {
    if args.len() < prog.params.len() {
        return Err(format!(
            "kernel takes {} buffer arguments, {} bound",
            prog.params.len(),
            args.len()
        ));
    }
    let mut locals: Vec<Scalar> = vec![Scalar::I(0); prog.locals.len()];
    for gid in 0..global_size {
        for stmt in &prog.stmts {
            match *stmt {
                Stmt::Assign { local, ref rhs } => {
                    let value = eval_rhs(prog, rhs, gid, &locals, store, args)?;
                    locals[local] = value.convert(prog.locals[local]);
                }
                Stmt::WriteGid { buffer, src } => {
                    write_elem(prog, store, args, buffer, gid, locals[src])?;
                }
                Stmt::MaskedWrite { mask, buffer, index, value } => {
                    if locals[mask].truthy() {
                        let idx = element_index(locals[index])?;
                        write_elem(prog, store, args, buffer, idx, locals[value])?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn eval_rhs(
    prog: &HostProgram,
    rhs: &Rhs,
    gid: usize,
    locals: &[Scalar],
    store: &[Option<Vec<u8>>],
    args: &[DeviceBufferId],
) -> Result<Scalar, String> {
    Ok(match *rhs {
        Rhs::Gid => Scalar::I(gid as i32),
        Rhs::IntLit(x) => Scalar::I(x),
        Rhs::FloatLit(x) => Scalar::F(x as f32),
        Rhs::Binary { op, lhs, rhs } => binary(op, locals[lhs], locals[rhs])?,
        Rhs::Call { op, arg } => {
            let x = locals[arg].as_f32();
            Scalar::F(match op {
                UnOp::Sin => x.sin(),
                UnOp::Cos => x.cos(),
                UnOp::Sqrt => x.sqrt(),
            })
        }
        Rhs::Select { cond, if_true, if_false } => {
            if locals[cond].truthy() {
                locals[if_true]
            } else {
                locals[if_false]
            }
        }
        Rhs::MaskedLoad { mask, buffer, index } => {
            if locals[mask].truthy() {
                let idx = element_index(locals[index])?;
                read_elem(prog, store, args, buffer, idx)?
            } else {
                Scalar::I(0)
            }
        }
        Rhs::BufferRead { buffer } => read_elem(prog, store, args, buffer, gid)?,
    })
}

fn binary(op: BinOp, a: Scalar, b: Scalar) -> Result<Scalar, String> {
    let float = matches!(a, Scalar::F(_)) || matches!(b, Scalar::F(_));
    Ok(if float {
        let (x, y) = (a.as_f32(), b.as_f32());
        match op {
            BinOp::FAdd => Scalar::F(x + y),
            BinOp::FSub => Scalar::F(x - y),
            BinOp::FMul => Scalar::F(x * y),
            BinOp::FDiv => Scalar::F(x / y),
            BinOp::Mod => return Err("`%` applied to float operands".to_string()),
            BinOp::CmpLt => Scalar::B(x < y),
            BinOp::CmpLe => Scalar::B(x <= y),
            BinOp::CmpGt => Scalar::B(x > y),
            BinOp::CmpGe => Scalar::B(x >= y),
            BinOp::CmpEq => Scalar::B(x == y),
            BinOp::CmpNe => Scalar::B(x != y),
        }
    } else {
        let (x, y) = (a.as_i32(), b.as_i32());
        match op {
            BinOp::FAdd => Scalar::I(x.wrapping_add(y)),
            BinOp::FSub => Scalar::I(x.wrapping_sub(y)),
            BinOp::FMul => Scalar::I(x.wrapping_mul(y)),
            BinOp::FDiv if y == 0 => return Err("integer division by zero".to_string()),
            BinOp::FDiv => Scalar::I(x.wrapping_div(y)),
            BinOp::Mod if y == 0 => return Err("integer modulo by zero".to_string()),
            BinOp::Mod => Scalar::I(x.wrapping_rem(y)),
            BinOp::CmpLt => Scalar::B(x < y),
            BinOp::CmpLe => Scalar::B(x <= y),
            BinOp::CmpGt => Scalar::B(x > y),
            BinOp::CmpGe => Scalar::B(x >= y),
            BinOp::CmpEq => Scalar::B(x == y),
            BinOp::CmpNe => Scalar::B(x != y),
        }
    })
}

fn element_index(idx: Scalar) -> Result<usize, String> {
    let i = idx.as_i32();
    if i < 0 {
        return Err(format!("negative buffer index {}", i));
    }
    Ok(i as usize)
}

fn param_ty(prog: &HostProgram, buffer: usize) -> Result<ElemType, String> {
    prog.params.get(buffer).copied().ok_or_else(|| {
        format!("kernel references buffer {} but takes {} arguments", buffer, prog.params.len())
    })
}

fn buffer_bytes<'a>(
    store: &'a [Option<Vec<u8>>],
    args: &[DeviceBufferId],
    buffer: usize,
) -> Result<&'a [u8], String> {
    let handle = args[buffer].0 as usize;
    store
        .get(handle)
        .and_then(|b| b.as_deref())
        .ok_or_else(|| format!("argument {} is bound to a freed buffer", buffer))
}

fn read_elem(
    prog: &HostProgram,
    store: &[Option<Vec<u8>>],
    args: &[DeviceBufferId],
    buffer: usize,
    idx: usize,
) -> Result<Scalar, String> {
    let ty = param_ty(prog, buffer)?;
    let bytes = buffer_bytes(store, args, buffer)?;
    let offset = idx * ty.size();
    if offset + ty.size() > bytes.len() {
        return Err(format!("read at element {} past end of buffer {}", idx, buffer));
    }
    Ok(match ty {
        ElemType::Bool => Scalar::B(bytes[offset] != 0),
        ElemType::I32 => {
            Scalar::I(i32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap()))
        }
        ElemType::F32 => {
            Scalar::F(f32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap()))
        }
        ElemType::None => unreachable!(),
    })
}

fn write_elem(
    prog: &HostProgram,
    store: &mut [Option<Vec<u8>>],
    args: &[DeviceBufferId],
    buffer: usize,
    idx: usize,
    value: Scalar,
) -> Result<(), String> {
    let ty = param_ty(prog, buffer)?;
    let handle = args[buffer].0 as usize;
    let bytes = store
        .get_mut(handle)
        .and_then(|b| b.as_deref_mut())
        .ok_or_else(|| format!("argument {} is bound to a freed buffer", buffer))?;
    let offset = idx * ty.size();
    if offset + ty.size() > bytes.len() {
        return Err(format!("write at element {} past end of buffer {}", idx, buffer));
    }
    match ty {
        ElemType::Bool => bytes[offset] = value.truthy() as u8,
        ElemType::I32 => bytes[offset..offset + 4].copy_from_slice(&value.as_i32().to_ne_bytes()),
        ElemType::F32 => bytes[offset..offset + 4].copy_from_slice(&value.as_f32().to_ne_bytes()),
        ElemType::None => unreachable!(),
    }
    Ok(())
}
