//! Native-code lowering for the functional IR.
//!
//! One Cranelift function per IR function. The let-chain is walked in order
//! with an environment mapping IR variables to packs of Cranelift values:
//! scalars are one-element packs, aggregates flatten to one element per
//! field (recursively). Aggregate parameters therefore become one scalar
//! parameter per field, matching the entry-unpacking the builder performs.
//!
//! Compiled functions are memoized by node identity: compiling the same
//! `Rc<Function>` twice returns the same address.

use std::rc::Rc;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Value as ClifValue};
use cranelift_frontend::{FunctionBuilder as ClifFunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use smallvec::SmallVec;

use crate::common::fx_hash::FxHashMap;
use crate::ir::node::{Constant, Expr, Function, Primitive, VarId};
use crate::ir::types::Type;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("native compilation failed: {0}")]
    Module(#[from] cranelift_module::ModuleError),
}

/// A flattened value: one Cranelift value per scalar field.
type ValuePack = SmallVec<[ClifValue; 4]>;

pub struct Jit {
    module: JITModule,
    builder_ctx: FunctionBuilderContext,
    /// `Rc` pointer of a compiled function → its entry address.
    cache: FxHashMap<usize, *const u8>,
    /// Keeps cached identities alive for the lifetime of the backend.
    retained: Vec<Rc<Function>>,
    next_id: u32,
}

impl Jit {
    pub fn new() -> Self {
        let builder = JITBuilder::new(default_libcall_names())
            .unwrap_or_else(|e| panic!("failed to initialise the JIT: {}", e));
        Jit {
            module: JITModule::new(builder),
            builder_ctx: FunctionBuilderContext::new(),
            cache: FxHashMap::default(),
            retained: Vec::new(),
            next_id: 0,
        }
    }

    /// Compile `func` and return its entry address. Failures abort; the IR
    /// comes from the builder, which already rejected ill-typed programs.
    pub fn compile(&mut self, func: &Rc<Function>) -> *const u8 {
        self.try_compile(func)
            .unwrap_or_else(|e| panic!("{}", e))
    }

    fn try_compile(&mut self, func: &Rc<Function>) -> Result<*const u8, JitError> {
        let key = Rc::as_ptr(func) as usize;
        if let Some(&addr) = self.cache.get(&key) {
            return Ok(addr);
        }

        let mut ctx = self.module.make_context();
        for p in &func.params {
            for ty in flatten_type(func.var_ty(*p)) {
                ctx.func.signature.params.push(AbiParam::new(ty));
            }
        }
        for ty in flatten_type(func.return_ty()) {
            ctx.func.signature.returns.push(AbiParam::new(ty));
        }

        {
            let mut b = ClifFunctionBuilder::new(&mut ctx.func, &mut self.builder_ctx);
            let block = b.create_block();
            b.append_block_params_for_function_params(block);
            b.switch_to_block(block);
            b.seal_block(block);

            let mut env: FxHashMap<VarId, ValuePack> = FxHashMap::default();
            let mut block_params = b.block_params(block).to_vec().into_iter();
            for p in &func.params {
                let n = flatten_type(func.var_ty(*p)).len();
                let pack: ValuePack = block_params.by_ref().take(n).collect();
                env.insert(*p, pack);
            }

            for (var, expr) in &func.lets {
                let pack = lower_expr(&mut b, func, &env, expr);
                env.insert(*var, pack);
            }

            let ret = env
                .get(&func.ret)
                .unwrap_or_else(|| panic!("return variable %{} is unbound", func.ret.0))
                .clone();
            b.ins().return_(&ret);
            b.finalize();
        }

        log::debug!("jit ir:\n{}", ctx.func.display());

        let name = format!("wf_fn_{}", self.next_id);
        self.next_id += 1;
        let id = self.module.declare_function(&name, Linkage::Export, &ctx.func.signature)?;
        self.module.define_function(id, &mut ctx)?;
        self.module.clear_context(&mut ctx);
        self.module.finalize_definitions()?;

        let addr = self.module.get_finalized_function(id);
        self.cache.insert(key, addr);
        self.retained.push(func.clone());
        Ok(addr)
    }
}

impl Default for Jit {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_type(ty: &Type) -> SmallVec<[types::Type; 4]> {
    let mut out = SmallVec::new();
    flatten_into(ty, &mut out);
    out
}

fn flatten_into(ty: &Type, out: &mut SmallVec<[types::Type; 4]>) {
    match ty {
        Type::Bool => out.push(types::I8),
        Type::I32 => out.push(types::I32),
        Type::F32 => out.push(types::F32),
        Type::F64 => out.push(types::F64),
        Type::Struct(st) => {
            for (_, field) in &st.fields {
                flatten_into(field, out);
            }
        }
    }
}

/// Position and length of `field` within its struct's flattened pack.
fn field_slice(ty: &Type, field: usize) -> (usize, usize) {
    let st = ty.as_struct().expect("field access on non-struct type");
    let offset: usize =
        st.fields[..field].iter().map(|(_, f)| flatten_type(f).len()).sum();
    let len = flatten_type(&st.fields[field].1).len();
    (offset, len)
}

fn lower_expr(
    b: &mut ClifFunctionBuilder,
    func: &Function,
    env: &FxHashMap<VarId, ValuePack>,
    expr: &Expr,
) -> ValuePack {
    let lookup = |env: &FxHashMap<VarId, ValuePack>, v: VarId| -> ValuePack {
        env.get(&v).unwrap_or_else(|| panic!("variable %{} is unbound", v.0)).clone()
    };

    match expr {
        Expr::Const(c) => {
            let v = match *c {
                Constant::I32(x) => b.ins().iconst(types::I32, x as i64),
                Constant::F32(x) => b.ins().f32const(x),
                Constant::F64(x) => b.ins().f64const(x),
            };
            SmallVec::from_slice(&[v])
        }
        Expr::Call { op, args } => {
            let vals: SmallVec<[ClifValue; 2]> =
                args.iter().map(|a| lookup(env, *a)[0]).collect();
            SmallVec::from_slice(&[lower_call(b, *op, &vals)])
        }
        Expr::Select { cond, if_true, if_false } => {
            let c = lookup(env, *cond)[0];
            let t = lookup(env, *if_true);
            let f = lookup(env, *if_false);
            t.iter().zip(f.iter()).map(|(&x, &y)| b.ins().select(c, x, y)).collect()
        }
        Expr::UndefStruct(ty) => flatten_type(ty)
            .iter()
            .map(|&t| {
                if t == types::F32 {
                    b.ins().f32const(0.0)
                } else if t == types::F64 {
                    b.ins().f64const(0.0)
                } else {
                    b.ins().iconst(t, 0)
                }
            })
            .collect(),
        Expr::LoadField { agg, field } => {
            let pack = lookup(env, *agg);
            let (offset, len) = field_slice(func.var_ty(*agg), *field);
            SmallVec::from_slice(&pack[offset..offset + len])
        }
        Expr::StoreField { agg, field, value } => {
            let mut pack = lookup(env, *agg);
            let val = lookup(env, *value);
            let (offset, len) = field_slice(func.var_ty(*agg), *field);
            pack[offset..offset + len].copy_from_slice(&val);
            pack
        }
    }
}

fn lower_call(b: &mut ClifFunctionBuilder, op: Primitive, v: &[ClifValue]) -> ClifValue {
    use Primitive::*;
    match op {
        IAdd => b.ins().iadd(v[0], v[1]),
        ISub => b.ins().isub(v[0], v[1]),
        IMul => b.ins().imul(v[0], v[1]),
        IDiv => b.ins().sdiv(v[0], v[1]),
        IMod => b.ins().srem(v[0], v[1]),
        And => b.ins().band(v[0], v[1]),
        Or => b.ins().bor(v[0], v[1]),
        Xor => b.ins().bxor(v[0], v[1]),
        Shl => b.ins().ishl(v[0], v[1]),
        Shr => b.ins().sshr(v[0], v[1]),
        Not => b.ins().icmp_imm(IntCC::Equal, v[0], 0),
        INeg => b.ins().ineg(v[0]),
        FNeg => b.ins().fneg(v[0]),
        FAdd => b.ins().fadd(v[0], v[1]),
        FSub => b.ins().fsub(v[0], v[1]),
        FMul => b.ins().fmul(v[0], v[1]),
        FDiv => b.ins().fdiv(v[0], v[1]),
        ICmpLt => b.ins().icmp(IntCC::SignedLessThan, v[0], v[1]),
        ICmpLe => b.ins().icmp(IntCC::SignedLessThanOrEqual, v[0], v[1]),
        ICmpGt => b.ins().icmp(IntCC::SignedGreaterThan, v[0], v[1]),
        ICmpGe => b.ins().icmp(IntCC::SignedGreaterThanOrEqual, v[0], v[1]),
        ICmpEq => b.ins().icmp(IntCC::Equal, v[0], v[1]),
        ICmpNe => b.ins().icmp(IntCC::NotEqual, v[0], v[1]),
        // Ordered predicates throughout: NaN compares false.
        FCmpLt => b.ins().fcmp(FloatCC::LessThan, v[0], v[1]),
        FCmpLe => b.ins().fcmp(FloatCC::LessThanOrEqual, v[0], v[1]),
        FCmpGt => b.ins().fcmp(FloatCC::GreaterThan, v[0], v[1]),
        FCmpGe => b.ins().fcmp(FloatCC::GreaterThanOrEqual, v[0], v[1]),
        FCmpEq => b.ins().fcmp(FloatCC::Equal, v[0], v[1]),
        FCmpNe => b.ins().fcmp(FloatCC::OrderedNotEqual, v[0], v[1]),
        F32ToI32 | F64ToI32 => b.ins().fcvt_to_sint(types::I32, v[0]),
        I32ToF32 => b.ins().fcvt_from_sint(types::F32, v[0]),
        I32ToF64 => b.ins().fcvt_from_sint(types::F64, v[0]),
    }
}
