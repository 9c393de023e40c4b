//! The runtime context and its public surface.
//!
//! One context per thread, installed by [`init`] and removed by [`destroy`].
//! It owns the value table, the live set, the buffer pool, the kernel cache,
//! and the device. All entry points the array frontend needs are exposed as
//! free functions over the thread-local context; `Context` itself is public
//! for callers that prefer to manage the lifetime explicitly.

pub mod buffers;
pub mod scheduler;

use std::cell::RefCell;

use crate::backend::host::HostDevice;
use crate::backend::{Device, ProgramId};
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::types::ElemType;
use crate::trace::inst::{BinOp, Inst};
use crate::trace::table::{ValueId, ValueTable};

use crate::backend::kernel::KernelCodegen;
use self::buffers::{BufferId, BufferPool};

pub struct Context {
    values: ValueTable,
    /// Indices with `ref_ext > 0` that have not been scheduled yet; the
    /// roots of the next evaluation.
    live: FxHashSet<ValueId>,
    buffers: BufferPool,
    device: Box<dyn Device>,
    codegen: KernelCodegen,
    /// Compiled programs keyed by kernel source text.
    kernel_cache: FxHashMap<String, ProgramId>,
    generation: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl Context {
    pub fn new(device: Box<dyn Device>) -> Self {
        Context {
            values: ValueTable::new(),
            live: FxHashSet::default(),
            buffers: BufferPool::default(),
            device,
            codegen: KernelCodegen::new(),
            kernel_cache: FxHashMap::default(),
            generation: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    pub fn trace_append(&mut self, inst: Inst, ty: ElemType) -> ValueId {
        match &inst {
            Inst::ThreadIndex => panic!("the thread index is predefined and cannot be appended"),
            Inst::ConstInt(_) | Inst::ConstFloat(_) => {}
            Inst::Binary { op, lhs, rhs } => {
                let (a, b) = (self.values.get(*lhs), self.values.get(*rhs));
                check_width_compat(a.width, b.width);
                if *op == BinOp::Mod {
                    assert!(
                        a.ty.is_integer() && b.ty.is_integer() && ty.is_integer(),
                        "`mod` requires integer operands"
                    );
                }
            }
            Inst::Unary { arg, .. } => {
                self.values.get(*arg);
            }
            Inst::Select { cond, if_true, if_false } => {
                let c = self.values.get(*cond).width;
                let t = self.values.get(*if_true).width;
                let f = self.values.get(*if_false).width;
                check_width_compat(c, t);
                check_width_compat(c, f);
                check_width_compat(t, f);
            }
            Inst::Load { src, mask, index } => {
                self.values.get(*src);
                self.values.get(*mask);
                self.values.get(*index);
            }
            Inst::Store { buffer, index, value, mask } => {
                self.buffers.get(*buffer);
                self.values.get(*index);
                self.values.get(*value);
                self.values.get(*mask);
            }
        }
        self.values.append(inst, ty)
    }

    pub fn set_width(&mut self, id: ValueId, width: usize) {
        assert!(width > 0, "width must be positive");
        let v = self.values.get_mut(id);
        assert!(
            v.buffer.is_none(),
            "cannot change the width of value {} after materialization",
            id.0
        );
        if v.width != 1 && v.width != width {
            panic!("width conflict: value {} has {} lanes, cannot become {}", id.0, v.width, width);
        }
        v.width = width;
    }

    pub fn width_of(&self, id: ValueId) -> usize {
        self.values.get(id).width
    }

    pub fn buffer_id_of(&self, id: ValueId) -> Option<BufferId> {
        self.values.get(id).buffer
    }

    pub fn inc_ext(&mut self, id: ValueId) {
        if id.is_predefined() {
            return;
        }
        let v = self.values.get_mut(id);
        v.ref_ext += 1;
        if v.ref_ext == 1 {
            self.live.insert(id);
        }
    }

    pub fn dec_ext(&mut self, id: ValueId) {
        if id.is_predefined() {
            return;
        }
        let v = self.values.get_mut(id);
        assert!(v.ref_ext > 0, "external refcount underflow on value {}", id.0);
        v.ref_ext -= 1;
        if v.ref_ext == 0 {
            self.live.remove(&id);
        }
    }

    pub fn inc_int(&mut self, id: ValueId) {
        self.values.get_mut(id).ref_int += 1;
    }

    pub fn dec_int(&mut self, id: ValueId) {
        let v = self.values.get_mut(id);
        assert!(v.ref_int > 0, "internal refcount underflow on value {}", id.0);
        v.ref_int -= 1;
    }

    pub fn ref_ext(&self, id: ValueId) -> u32 {
        self.values.get(id).ref_ext
    }

    /// Allocate an explicit device buffer. Explicit buffers are pinned: the
    /// collector renumbers but never frees them.
    pub fn alloc(&mut self, bytes: usize, ty: ElemType) -> BufferId {
        self.buffers.alloc(self.device.as_mut(), bytes, ty, true)
    }

    pub fn free_buffer(&mut self, id: BufferId) {
        self.buffers.unpin(id);
        let mut dead = FxHashSet::default();
        dead.insert(id);
        let remap = self.buffers.sweep(self.device.as_mut(), &dead);
        self.rewrite_buffer_ids(&remap);
    }

    pub fn write_buffer(&mut self, id: BufferId, offset: usize, data: &[u8]) {
        self.buffers.write(self.device.as_mut(), id, offset, data);
    }

    pub fn read_buffer(&self, id: BufferId, offset: usize, dst: &mut [u8]) {
        self.buffers.read(self.device.as_ref(), id, offset, dst);
    }

    /// Copy a value's lanes to host memory, evaluating first if needed.
    /// `dst` must be exactly `width * size_of(ty)` bytes. Fatal if nothing
    /// ever materialized the value.
    pub fn copy_to_host(&mut self, id: ValueId, dst: &mut [u8]) {
        self.eval();
        let v = self.values.get(id);
        let buffer = v.buffer.unwrap_or_else(|| {
            panic!("value {} was never materialized and cannot be copied to the host", id.0)
        });
        let bytes = v.width * v.ty.size();
        assert_eq!(
            dst.len(),
            bytes,
            "destination is {} bytes, value {} occupies {}",
            dst.len(),
            id.0,
            bytes
        );
        self.buffers.read(self.device.as_ref(), buffer, 0, dst);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn check_width_compat(a: usize, b: usize) {
    assert!(a == b || a == 1 || b == 1, "width conflict: {} lanes vs {} lanes", a, b);
}

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Install a context backed by the host reference device.
pub fn init() {
    init_with_device(Box::new(HostDevice::new()));
}

pub fn init_with_device(device: Box<dyn Device>) {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(slot.is_none(), "runtime already initialised on this thread");
        log::info!("using device: {}", device.name());
        *slot = Some(Context::new(device));
    });
}

/// Tear the context down, releasing buffers, programs, and the device.
pub fn destroy() {
    CONTEXT.with(|cell| {
        cell.borrow_mut().take().expect("runtime not initialised on this thread");
    });
}

pub(crate) fn with<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        f(slot.as_mut().expect("runtime not initialised on this thread"))
    })
}

/// `dec_ext` that tolerates a missing context; used by handle drops that can
/// outlive `destroy`.
pub(crate) fn release_ext(id: ValueId) {
    CONTEXT.with(|cell| {
        if let Ok(mut slot) = cell.try_borrow_mut() {
            if let Some(ctx) = slot.as_mut() {
                ctx.dec_ext(id);
            }
        }
    });
}

pub fn eval() {
    with(|ctx| ctx.eval());
}

pub fn trace_append(inst: Inst, ty: ElemType) -> ValueId {
    with(|ctx| ctx.trace_append(inst, ty))
}

pub fn set_width(id: ValueId, width: usize) {
    with(|ctx| ctx.set_width(id, width));
}

pub fn width_of(id: ValueId) -> usize {
    with(|ctx| ctx.width_of(id))
}

pub fn buffer_id_of(id: ValueId) -> Option<BufferId> {
    with(|ctx| ctx.buffer_id_of(id))
}

pub fn inc_ext(id: ValueId) {
    with(|ctx| ctx.inc_ext(id));
}

pub fn dec_ext(id: ValueId) {
    with(|ctx| ctx.dec_ext(id));
}

pub fn inc_int(id: ValueId) {
    with(|ctx| ctx.inc_int(id));
}

pub fn dec_int(id: ValueId) {
    with(|ctx| ctx.dec_int(id));
}

pub fn ref_ext(id: ValueId) -> u32 {
    with(|ctx| ctx.ref_ext(id))
}

pub fn alloc(bytes: usize, ty: ElemType) -> BufferId {
    with(|ctx| ctx.alloc(bytes, ty))
}

pub fn free_buffer(id: BufferId) {
    with(|ctx| ctx.free_buffer(id));
}

pub fn write_buffer(id: BufferId, offset: usize, data: &[u8]) {
    with(|ctx| ctx.write_buffer(id, offset, data));
}

pub fn read_buffer(id: BufferId, offset: usize, dst: &mut [u8]) {
    with(|ctx| ctx.read_buffer(id, offset, dst));
}

pub fn copy_to_host(id: ValueId, dst: &mut [u8]) {
    with(|ctx| ctx.copy_to_host(id, dst));
}

pub fn generation() -> u64 {
    with(|ctx| ctx.generation())
}
