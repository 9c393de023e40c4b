//! The let-list builder.
//!
//! Every operation appends one let binding and returns the bound variable;
//! finalizing yields the `Function` node. The builder is an explicit value:
//! construct one per function, on whatever thread is convenient.

use std::rc::Rc;

use smallvec::SmallVec;

use super::node::{Constant, Expr, Function, Primitive, VarId};
use super::types::Type;

pub struct FunctionBuilder {
    params: Vec<VarId>,
    lets: Vec<(VarId, Expr)>,
    var_tys: Vec<Type>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        FunctionBuilder { params: Vec::new(), lets: Vec::new(), var_tys: Vec::new() }
    }

    fn fresh(&mut self, ty: Type) -> VarId {
        let var = VarId(self.var_tys.len() as u32);
        self.var_tys.push(ty);
        var
    }

    fn push(&mut self, expr: Expr, ty: Type) -> VarId {
        let var = self.fresh(ty);
        self.lets.push((var, expr));
        var
    }

    fn ty(&self, var: VarId) -> &Type {
        &self.var_tys[var.0 as usize]
    }

    /// A variable bound by the caller rather than a let; recorded on the
    /// parameter list.
    pub fn make_parameter(&mut self, ty: Type) -> VarId {
        let var = self.fresh(ty);
        self.params.push(var);
        var
    }

    pub fn constant(&mut self, c: Constant) -> VarId {
        let ty = c.ty();
        self.push(Expr::Const(c), ty)
    }

    /// Append a primitive call. Panics on arity or operand-type misuse; the
    /// typing rules are the lowering tables' preconditions.
    pub fn call(&mut self, op: Primitive, args: &[VarId]) -> VarId {
        assert_eq!(args.len(), op.arity(), "{} takes {} operands", op.name(), op.arity());
        let ty = self.result_ty(op, args);
        self.push(Expr::Call { op, args: SmallVec::from_slice(args) }, ty)
    }

    fn result_ty(&self, op: Primitive, args: &[VarId]) -> Type {
        use Primitive::*;
        let a = self.ty(args[0]).clone();
        match op {
            IAdd | ISub | IMul | IDiv | IMod | And | Or | Xor | Shl | Shr => {
                assert_eq!(a, Type::I32, "{} requires i32 operands", op.name());
                assert_eq!(self.ty(args[1]), &Type::I32, "{} requires i32 operands", op.name());
                Type::I32
            }
            FAdd | FSub | FMul | FDiv => {
                assert!(a.is_float(), "{} requires float operands", op.name());
                assert_eq!(self.ty(args[1]), &a, "{} requires matching operands", op.name());
                a
            }
            ICmpLt | ICmpLe | ICmpGt | ICmpGe | ICmpEq | ICmpNe => {
                assert_eq!(a, Type::I32, "{} requires i32 operands", op.name());
                assert_eq!(self.ty(args[1]), &Type::I32, "{} requires i32 operands", op.name());
                Type::Bool
            }
            FCmpLt | FCmpLe | FCmpGt | FCmpGe | FCmpEq | FCmpNe => {
                assert!(a.is_float(), "{} requires float operands", op.name());
                assert_eq!(self.ty(args[1]), &a, "{} requires matching operands", op.name());
                Type::Bool
            }
            Not => {
                assert_eq!(a, Type::Bool, "Not requires a bool operand");
                Type::Bool
            }
            INeg => {
                assert_eq!(a, Type::I32, "INeg requires an i32 operand");
                Type::I32
            }
            FNeg => {
                assert!(a.is_float(), "FNeg requires a float operand");
                a
            }
            F32ToI32 => {
                assert_eq!(a, Type::F32, "F32ToI32 requires an f32 operand");
                Type::I32
            }
            F64ToI32 => {
                assert_eq!(a, Type::F64, "F64ToI32 requires an f64 operand");
                Type::I32
            }
            I32ToF32 => {
                assert_eq!(a, Type::I32, "I32ToF32 requires an i32 operand");
                Type::F32
            }
            I32ToF64 => {
                assert_eq!(a, Type::I32, "I32ToF64 requires an i32 operand");
                Type::F64
            }
        }
    }

    pub fn select(&mut self, cond: VarId, if_true: VarId, if_false: VarId) -> VarId {
        assert_eq!(self.ty(cond), &Type::Bool, "select condition must be bool");
        let ty = self.ty(if_true).clone();
        assert_eq!(self.ty(if_false), &ty, "select arms must have one type");
        self.push(Expr::Select { cond, if_true, if_false }, ty)
    }

    pub fn undef_struct(&mut self, ty: Type) -> VarId {
        assert!(ty.as_struct().is_some(), "undef_struct requires a struct type");
        self.push(Expr::UndefStruct(ty.clone()), ty)
    }

    pub fn load_field(&mut self, agg: VarId, field: usize) -> VarId {
        let st = self
            .ty(agg)
            .as_struct()
            .unwrap_or_else(|| panic!("load_field on non-struct variable %{}", agg.0))
            .clone();
        let (_, field_ty) = st
            .fields
            .get(field)
            .unwrap_or_else(|| panic!("struct `{}` has no field {}", st.name, field));
        let field_ty = field_ty.clone();
        self.push(Expr::LoadField { agg, field }, field_ty)
    }

    /// A functional field update: yields a new aggregate with field `field`
    /// replaced by `value`.
    pub fn store_field(&mut self, agg: VarId, field: usize, value: VarId) -> VarId {
        let ty = self.ty(agg).clone();
        let st = ty
            .as_struct()
            .unwrap_or_else(|| panic!("store_field on non-struct variable %{}", agg.0));
        let (_, field_ty) = st
            .fields
            .get(field)
            .unwrap_or_else(|| panic!("struct `{}` has no field {}", st.name, field));
        assert_eq!(self.ty(value), field_ty, "stored value must match the field type");
        self.push(Expr::StoreField { agg, field, value }, ty)
    }

    /// Designate the return value and finalize.
    pub fn finish(self, ret: VarId) -> Rc<Function> {
        assert!((ret.0 as usize) < self.var_tys.len(), "return variable is not bound");
        Rc::new(Function { params: self.params, lets: self.lets, ret, var_tys: self.var_tys })
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::StructRegistry;

    #[test]
    fn test_let_list_accumulates_in_order() {
        let mut fb = FunctionBuilder::new();
        let x = fb.make_parameter(Type::F32);
        let two = fb.constant(Constant::F32(2.0));
        let sum = fb.call(Primitive::FAdd, &[x, two]);
        let func = fb.finish(sum);

        assert_eq!(func.params, vec![x]);
        assert_eq!(func.lets.len(), 2);
        assert_eq!(func.lets[0].0, two);
        assert_eq!(func.lets[1].0, sum);
        assert_eq!(func.return_ty(), &Type::F32);
    }

    #[test]
    fn test_comparison_produces_bool() {
        let mut fb = FunctionBuilder::new();
        let x = fb.make_parameter(Type::F32);
        let zero = fb.constant(Constant::F32(0.0));
        let lt = fb.call(Primitive::FCmpLt, &[x, zero]);
        assert_eq!(fb.ty(lt), &Type::Bool);
    }

    #[test]
    fn test_struct_field_round_trip_types() {
        let mut reg = StructRegistry::new();
        let vec2 =
            reg.intern("Vec2", vec![("x".into(), Type::F32), ("y".into(), Type::F32)]);
        let mut fb = FunctionBuilder::new();
        let undef = fb.undef_struct(Type::Struct(vec2));
        let one = fb.constant(Constant::F32(1.0));
        let packed = fb.store_field(undef, 0, one);
        let back = fb.load_field(packed, 0);
        assert_eq!(fb.ty(packed).name(), "Vec2");
        assert_eq!(fb.ty(back), &Type::F32);
    }

    #[test]
    #[should_panic(expected = "takes 2 operands")]
    fn test_arity_misuse_panics() {
        let mut fb = FunctionBuilder::new();
        let x = fb.make_parameter(Type::I32);
        fb.call(Primitive::IAdd, &[x]);
    }

    #[test]
    #[should_panic(expected = "requires i32 operands")]
    fn test_type_misuse_panics() {
        let mut fb = FunctionBuilder::new();
        let x = fb.make_parameter(Type::F32);
        let y = fb.make_parameter(Type::F32);
        fb.call(Primitive::IAdd, &[x, y]);
    }
}
