//! Parser for the kernel dialect.
//!
//! Handles exactly the subset of the dialect that `KernelCodegen` emits:
//! one statement per line, locals named `v0`, `v1`, … in declaration order,
//! buffers named by argument position. Anything else is a build error whose
//! message becomes the device build log.

use crate::common::types::ElemType;
use crate::trace::inst::{BinOp, UnOp};

#[derive(Debug)]
pub struct HostProgram {
    /// Element type of each kernel parameter, in argument order.
    pub params: Vec<ElemType>,
    /// Declared type of each local, indexed by slot.
    pub locals: Vec<ElemType>,
    pub stmts: Vec<Stmt>,
}

#[derive(Debug)]
pub enum Rhs {
    Gid,
    IntLit(i32),
    FloatLit(f64),
    Binary { op: BinOp, lhs: usize, rhs: usize },
    Call { op: UnOp, arg: usize },
    Select { cond: usize, if_true: usize, if_false: usize },
    /// `vM ? bufferK[vI] : 0`
    MaskedLoad { mask: usize, buffer: usize, index: usize },
    /// `bufferK[get_global_id(0)]`
    BufferRead { buffer: usize },
}

#[derive(Debug)]
pub enum Stmt {
    Assign { local: usize, rhs: Rhs },
    /// `bufferK[get_global_id(0)] = vN;`
    WriteGid { buffer: usize, src: usize },
    /// `if(vM){ bufferK[vI] = vV; }`
    MaskedWrite { mask: usize, buffer: usize, index: usize, value: usize },
}

pub fn parse(source: &str) -> Result<HostProgram, String> {
    let mut lines = source.lines();
    let header = lines.next().ok_or("empty kernel source")?;
    let params = parse_header(header)?;

    let mut prog = HostProgram { params, locals: Vec::new(), stmts: Vec::new() };
    let mut closed = false;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            closed = true;
            break;
        }
        let stmt = parse_stmt(line, &mut prog.locals)?;
        prog.stmts.push(stmt);
    }
    if !closed {
        return Err("kernel body is not terminated by `}`".to_string());
    }
    Ok(prog)
}

fn parse_header(header: &str) -> Result<Vec<ElemType>, String> {
    let inner = header
        .strip_prefix("__kernel void main(")
        .and_then(|rest| rest.strip_suffix("){"))
        .ok_or_else(|| format!("malformed kernel header `{}`", header))?;
    let mut params = Vec::new();
    if inner.is_empty() {
        return Ok(params);
    }
    for (pos, decl) in inner.split(", ").enumerate() {
        let rest = decl
            .strip_prefix("__global ")
            .ok_or_else(|| format!("malformed parameter `{}`", decl))?;
        let (ty, name) = rest
            .split_once(" * ")
            .ok_or_else(|| format!("malformed parameter `{}`", decl))?;
        let expect = format!("buffer{}", pos);
        if name != expect {
            return Err(format!("parameter {} is named `{}`, expected `{}`", pos, name, expect));
        }
        params.push(ty.parse::<ElemType>()?);
    }
    Ok(params)
}

fn parse_stmt(line: &str, locals: &mut Vec<ElemType>) -> Result<Stmt, String> {
    if let Some(rest) = line.strip_prefix("if(") {
        // if(vM){ bufferK[vI] = vV; }
        let (mask, body) = rest
            .split_once("){ ")
            .ok_or_else(|| format!("malformed conditional store `{}`", line))?;
        let body = body
            .strip_suffix("; }")
            .ok_or_else(|| format!("malformed conditional store `{}`", line))?;
        let (dst, value) = body
            .split_once(" = ")
            .ok_or_else(|| format!("malformed conditional store `{}`", line))?;
        let (buffer, index) = parse_buffer_ref(dst)?;
        let index = match index {
            BufIndex::Local(i) => i,
            BufIndex::Gid => return Err(format!("unexpected store index in `{}`", line)),
        };
        return Ok(Stmt::MaskedWrite {
            mask: parse_local(mask)?,
            buffer,
            index,
            value: parse_local(value)?,
        });
    }

    if line.starts_with("buffer") {
        // bufferK[get_global_id(0)] = vN;
        let body = line
            .strip_suffix(';')
            .ok_or_else(|| format!("missing `;` in `{}`", line))?;
        let (dst, src) = body
            .split_once(" = ")
            .ok_or_else(|| format!("malformed buffer write `{}`", line))?;
        let (buffer, index) = parse_buffer_ref(dst)?;
        if !matches!(index, BufIndex::Gid) {
            return Err(format!("buffer write must index the work item in `{}`", line));
        }
        return Ok(Stmt::WriteGid { buffer, src: parse_local(src)? });
    }

    // TYPE vN = RHS;
    let body = line
        .strip_suffix(';')
        .ok_or_else(|| format!("missing `;` in `{}`", line))?;
    let (ty, rest) = body
        .split_once(' ')
        .ok_or_else(|| format!("malformed assignment `{}`", line))?;
    let ty = ty.parse::<ElemType>()?;
    let (name, rhs) = rest
        .split_once(" = ")
        .ok_or_else(|| format!("malformed assignment `{}`", line))?;
    let local = parse_local(name)?;
    if local != locals.len() {
        return Err(format!("local `{}` declared out of order", name));
    }
    locals.push(ty);
    Ok(Stmt::Assign { local, rhs: parse_rhs(rhs, ty)? })
}

fn parse_rhs(rhs: &str, ty: ElemType) -> Result<Rhs, String> {
    if rhs == "get_global_id(0)" {
        return Ok(Rhs::Gid);
    }
    if let Some(args) = call_args(rhs, "select") {
        let (c, t, f) = three(&args, rhs)?;
        return Ok(Rhs::Select { cond: c, if_true: t, if_false: f });
    }
    for op in [UnOp::Sin, UnOp::Cos, UnOp::Sqrt] {
        if let Some(args) = call_args(rhs, op.dialect_fn()) {
            let arg = one(&args, rhs)?;
            return Ok(Rhs::Call { op, arg });
        }
    }
    if let Some((mask, rest)) = rhs.split_once(" ? ") {
        let access = rest
            .strip_suffix(" : 0")
            .ok_or_else(|| format!("malformed masked load `{}`", rhs))?;
        let (buffer, index) = parse_buffer_ref(access)?;
        let index = match index {
            BufIndex::Local(i) => i,
            BufIndex::Gid => return Err(format!("unexpected load index in `{}`", rhs)),
        };
        return Ok(Rhs::MaskedLoad { mask: parse_local(mask)?, buffer, index });
    }
    if rhs.starts_with("buffer") {
        let (buffer, index) = parse_buffer_ref(rhs)?;
        if !matches!(index, BufIndex::Gid) {
            return Err(format!("buffer read must index the work item in `{}`", rhs));
        }
        return Ok(Rhs::BufferRead { buffer });
    }

    let tokens: Vec<&str> = rhs.split(' ').collect();
    match tokens.as_slice() {
        [a, op, b] => {
            let op = binop_from_str(op).ok_or_else(|| format!("unknown operator `{}`", op))?;
            Ok(Rhs::Binary { op, lhs: parse_local(a)?, rhs: parse_local(b)? })
        }
        [lit] => {
            if ty.is_integer() {
                lit.parse::<i32>()
                    .map(Rhs::IntLit)
                    .map_err(|_| format!("bad integer literal `{}`", lit))
            } else {
                lit.parse::<f64>()
                    .map(Rhs::FloatLit)
                    .map_err(|_| format!("bad float literal `{}`", lit))
            }
        }
        _ => Err(format!("unparseable expression `{}`", rhs)),
    }
}

enum BufIndex {
    Gid,
    Local(usize),
}

/// `bufferK[...]` → (argument position, index expression).
fn parse_buffer_ref(s: &str) -> Result<(usize, BufIndex), String> {
    let rest = s
        .strip_prefix("buffer")
        .ok_or_else(|| format!("expected buffer reference, found `{}`", s))?;
    let open = rest
        .find('[')
        .ok_or_else(|| format!("malformed buffer reference `{}`", s))?;
    let buffer = rest[..open]
        .parse::<usize>()
        .map_err(|_| format!("bad buffer id in `{}`", s))?;
    let index = rest[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| format!("malformed buffer reference `{}`", s))?;
    let index = if index == "get_global_id(0)" {
        BufIndex::Gid
    } else {
        BufIndex::Local(parse_local(index)?)
    };
    Ok((buffer, index))
}

fn parse_local(name: &str) -> Result<usize, String> {
    name.strip_prefix('v')
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| format!("expected local name, found `{}`", name))
}

fn call_args(rhs: &str, func: &str) -> Option<Vec<String>> {
    let inner = rhs.strip_prefix(func)?.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner.split(", ").map(str::to_string).collect())
}

fn one(args: &[String], ctx: &str) -> Result<usize, String> {
    match args {
        [a] => parse_local(a),
        _ => Err(format!("wrong arity in `{}`", ctx)),
    }
}

fn three(args: &[String], ctx: &str) -> Result<(usize, usize, usize), String> {
    match args {
        [a, b, c] => Ok((parse_local(a)?, parse_local(b)?, parse_local(c)?)),
        _ => Err(format!("wrong arity in `{}`", ctx)),
    }
}

fn binop_from_str(op: &str) -> Option<BinOp> {
    Some(match op {
        "+" => BinOp::FAdd,
        "-" => BinOp::FSub,
        "*" => BinOp::FMul,
        "/" => BinOp::FDiv,
        "%" => BinOp::Mod,
        "<" => BinOp::CmpLt,
        "<=" => BinOp::CmpLe,
        ">" => BinOp::CmpGt,
        ">=" => BinOp::CmpGe,
        "==" => BinOp::CmpEq,
        "!=" => BinOp::CmpNe,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast_add() {
        let prog = parse(
            "__kernel void main(__global float * buffer0){\n\
             float v0 = 2;\n\
             int v1 = get_global_id(0);\n\
             float v2 = v0 + v1;\n\
             buffer0[get_global_id(0)] = v2;\n\
             }",
        )
        .unwrap();
        assert_eq!(prog.params, vec![ElemType::F32]);
        assert_eq!(prog.locals, vec![ElemType::F32, ElemType::I32, ElemType::F32]);
        assert_eq!(prog.stmts.len(), 4);
        assert!(matches!(prog.stmts[2], Stmt::Assign { local: 2, rhs: Rhs::Binary { op: BinOp::FAdd, lhs: 0, rhs: 1 } }));
        assert!(matches!(prog.stmts[3], Stmt::WriteGid { buffer: 0, src: 2 }));
    }

    #[test]
    fn test_parse_masked_forms() {
        let prog = parse(
            "__kernel void main(__global int * buffer0){\n\
             bool v0 = 1;\n\
             int v1 = get_global_id(0);\n\
             int v2 = v0 ? buffer0[v1] : 0;\n\
             if(v0){ buffer0[v1] = v2; }\n\
             }",
        )
        .unwrap();
        assert!(matches!(prog.stmts[2], Stmt::Assign { rhs: Rhs::MaskedLoad { mask: 0, buffer: 0, index: 1 }, .. }));
        assert!(matches!(prog.stmts[3], Stmt::MaskedWrite { mask: 0, buffer: 0, index: 1, value: 2 }));
    }

    #[test]
    fn test_parse_empty_parameter_list() {
        let prog = parse("__kernel void main(){\nint v0 = 4;\n}").unwrap();
        assert!(prog.params.is_empty());
        assert_eq!(prog.stmts.len(), 1);
    }

    #[test]
    fn test_reject_out_of_order_local() {
        let err = parse("__kernel void main(){\nint v1 = 4;\n}").unwrap_err();
        assert!(err.contains("out of order"));
    }

    #[test]
    fn test_reject_unknown_syntax() {
        assert!(parse("__kernel void foo(){\n}").is_err());
        assert!(parse("__kernel void main(){\nint v0 = goto;\n}").is_err());
    }
}
