//! Kernel source generation.
//!
//! Serializes an ordered trace slice into the device dialect: a 1-D kernel
//! whose body assigns one local per traced value. Locals are numbered
//! sequentially per kernel rather than by SSA index so that replaying the
//! same program after a collection produces byte-identical source; the
//! program cache is keyed by source text and lives or dies by this.

use std::fmt::Write as _;

use crate::backend::Device;
use crate::common::fx_hash::FxHashMap;
use crate::runtime::buffers::BufferPool;
use crate::trace::inst::Inst;
use crate::trace::table::{ValueId, ValueTable};

pub struct KernelCodegen {
    /// Trace index → kernel local name, rebuilt per kernel.
    names: FxHashMap<ValueId, String>,
    next_local: u32,
    body: String,
}

impl KernelCodegen {
    pub fn new() -> Self {
        KernelCodegen {
            names: FxHashMap::default(),
            next_local: 0,
            body: String::new(),
        }
    }

    /// Emit the kernel for one bucket's trace.
    ///
    /// Materialization happens here: a multi-lane value that is externally
    /// referenced gets a slab (allocated on first need) and a buffer write
    /// right after its assignment, and is stamped with the current
    /// generation. Executed stores are stamped the same way.
    pub fn generate(
        &mut self,
        values: &mut ValueTable,
        pool: &mut BufferPool,
        device: &mut dyn Device,
        trace: &[ValueId],
        generation: u64,
    ) -> String {
        self.names.clear();
        self.next_local = 0;
        self.body.clear();

        for &id in trace {
            let inst = values.get(id).inst.clone();
            match inst {
                Inst::Store { buffer, index, value, mask } => {
                    let i = self.operand(values, index);
                    let v = self.operand(values, value);
                    let m = self.operand(values, mask);
                    writeln!(self.body, "if({}){{ buffer{}[{}] = {}; }}", m, buffer.0, i, v)
                        .unwrap();
                    values.get_mut(id).last_sync = Some(generation);
                }
                _ => {
                    let rhs = self.emit_rhs(values, &inst);
                    let v = values.get(id);
                    let (ty, width, ref_ext) = (v.ty, v.width, v.ref_ext);
                    let name = self.fresh_local();
                    writeln!(self.body, "{} {} = {};", ty.dialect_name(), name, rhs).unwrap();
                    self.names.insert(id, name.clone());

                    if width != 1 && ref_ext > 0 {
                        let buf = match values.get(id).buffer {
                            Some(b) => b,
                            None => {
                                let b = pool.alloc(device, width * ty.size(), ty, false);
                                values.get_mut(id).buffer = Some(b);
                                b
                            }
                        };
                        writeln!(self.body, "buffer{}[get_global_id(0)] = {};", buf.0, name)
                            .unwrap();
                        values.get_mut(id).last_sync = Some(generation);
                    }
                }
            }
        }

        let mut source = String::from("__kernel void main(");
        let slabs = pool.slabs();
        for (i, slab) in slabs.iter().enumerate() {
            write!(source, "__global {} * buffer{}", slab.ty.dialect_name(), i).unwrap();
            if i + 1 != slabs.len() {
                source.push_str(", ");
            }
        }
        source.push_str("){\n");
        source.push_str(&self.body);
        source.push('}');
        source
    }

    fn fresh_local(&mut self) -> String {
        let name = format!("v{}", self.next_local);
        self.next_local += 1;
        name
    }

    /// Local name for an operand. An operand without a name must have been
    /// materialized by an earlier generation; it is re-read from its buffer
    /// at the work-item index.
    fn operand(&mut self, values: &ValueTable, id: ValueId) -> String {
        if let Some(name) = self.names.get(&id) {
            return name.clone();
        }
        let v = values.get(id);
        let buf = v.buffer.unwrap_or_else(|| {
            panic!("operand {} has neither a kernel local nor a buffer", id.0)
        });
        let name = self.fresh_local();
        writeln!(
            self.body,
            "{} {} = buffer{}[get_global_id(0)];",
            v.ty.dialect_name(),
            name,
            buf.0
        )
        .unwrap();
        self.names.insert(id, name.clone());
        name
    }

    fn emit_rhs(&mut self, values: &ValueTable, inst: &Inst) -> String {
        match *inst {
            Inst::ThreadIndex => "get_global_id(0)".to_string(),
            Inst::ConstInt(x) => format!("{}", x),
            Inst::ConstFloat(x) => format!("{}", x),
            Inst::Binary { op, lhs, rhs } => {
                let a = self.operand(values, lhs);
                let b = self.operand(values, rhs);
                format!("{} {} {}", a, op.dialect_op(), b)
            }
            Inst::Unary { op, arg } => {
                let a = self.operand(values, arg);
                format!("{}({})", op.dialect_fn(), a)
            }
            Inst::Select { cond, if_true, if_false } => {
                let c = self.operand(values, cond);
                let t = self.operand(values, if_true);
                let f = self.operand(values, if_false);
                format!("select({}, {}, {})", c, t, f)
            }
            Inst::Load { src, mask, index } => {
                let buf = values.get(src).buffer.unwrap_or_else(|| {
                    panic!("load from value {} which owns no buffer", src.0)
                });
                let m = self.operand(values, mask);
                let i = self.operand(values, index);
                format!("{} ? buffer{}[{}] : 0", m, buf.0, i)
            }
            Inst::Store { .. } => unreachable!("stores are emitted as statements"),
        }
    }
}

impl Default for KernelCodegen {
    fn default() -> Self {
        Self::new()
    }
}
