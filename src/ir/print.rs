//! Text dump for the functional IR.
//!
//! One line per let binding, the returned variable last. The output is
//! stable and unique per structurally distinct function, which makes it a
//! convenient regression fingerprint in tests.

use std::fmt::Write as _;

use super::node::{Constant, Expr, Function};

pub fn to_text(func: &Function) -> String {
    let mut out = String::from("fn (");
    for (i, p) in func.params.iter().enumerate() {
        if i != 0 {
            out.push(' ');
        }
        write!(out, "%{}: {}", p.0, func.var_ty(*p).name()).unwrap();
    }
    out.push_str("){\n");
    for (var, expr) in &func.lets {
        writeln!(out, " let %{} = {} : {}", var.0, render(expr), func.var_ty(*var).name())
            .unwrap();
    }
    writeln!(out, " %{}", func.ret.0).unwrap();
    out.push('}');
    out
}

fn render(expr: &Expr) -> String {
    match expr {
        Expr::Const(c) => match c {
            Constant::I32(x) => format!("{}", x),
            Constant::F32(x) => format!("{}", x),
            Constant::F64(x) => format!("{}", x),
        },
        Expr::Call { op, args } => {
            let mut s = String::from(op.name());
            s.push('(');
            for (i, a) in args.iter().enumerate() {
                if i != 0 {
                    s.push_str(", ");
                }
                write!(s, "%{}", a.0).unwrap();
            }
            s.push(')');
            s
        }
        Expr::Select { cond, if_true, if_false } => {
            format!("select(%{}, %{}, %{})", cond.0, if_true.0, if_false.0)
        }
        Expr::UndefStruct(ty) => format!("decl {}", ty.name()),
        Expr::LoadField { agg, field } => format!("load field %{} {}", agg.0, field),
        Expr::StoreField { agg, field, value } => {
            format!("store field %{} {} %{}", agg.0, field, value.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::node::Primitive;
    use crate::ir::types::{StructRegistry, Type};

    #[test]
    fn test_dump_clamped_square() {
        let mut fb = FunctionBuilder::new();
        let x = fb.make_parameter(Type::F32);
        let zero = fb.constant(Constant::F32(0.0));
        let neg = fb.call(Primitive::FCmpLt, &[x, zero]);
        let sq = fb.call(Primitive::FMul, &[x, x]);
        let clamped = fb.select(neg, zero, sq);
        let two = fb.constant(Constant::F32(2.0));
        let out = fb.call(Primitive::FAdd, &[clamped, two]);
        let func = fb.finish(out);

        assert_eq!(
            to_text(&func),
            "fn (%0: f32){\n \
             let %1 = 0 : f32\n \
             let %2 = FCmpLt(%0, %1) : bool\n \
             let %3 = FMul(%0, %0) : f32\n \
             let %4 = select(%2, %1, %3) : f32\n \
             let %5 = 2 : f32\n \
             let %6 = FAdd(%4, %5) : f32\n \
             %6\n\
             }"
        );
    }

    #[test]
    fn test_dump_struct_function() {
        let mut reg = StructRegistry::new();
        let vec2 = reg.intern("Vec2", vec![("x".into(), Type::F32), ("y".into(), Type::F32)]);
        let mut fb = FunctionBuilder::new();
        let p = fb.make_parameter(Type::Struct(vec2));
        let x = fb.load_field(p, 0);
        let y = fb.load_field(p, 1);
        let s = fb.call(Primitive::FAdd, &[x, y]);
        let func = fb.finish(s);

        assert_eq!(
            to_text(&func),
            "fn (%0: Vec2){\n \
             let %1 = load field %0 0 : f32\n \
             let %2 = load field %0 1 : f32\n \
             let %3 = FAdd(%1, %2) : f32\n \
             %3\n\
             }"
        );
    }

    #[test]
    fn test_distinct_functions_have_distinct_dumps() {
        let build = |op: Primitive| {
            let mut fb = FunctionBuilder::new();
            let a = fb.make_parameter(Type::F32);
            let b = fb.make_parameter(Type::F32);
            let r = fb.call(op, &[a, b]);
            fb.finish(r)
        };
        assert_ne!(to_text(&build(Primitive::FAdd)), to_text(&build(Primitive::FSub)));
    }
}
