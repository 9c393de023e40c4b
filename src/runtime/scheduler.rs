//! Lazy evaluation.
//!
//! An evaluation pass partitions the live roots by lane width, linearizes
//! each bucket's reachable dependencies, emits and launches one kernel per
//! bucket (smallest width first), and finally collects records and buffers
//! that nothing can observe anymore.

use std::collections::BTreeMap;

use crate::backend::DeviceError;
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::runtime::buffers::BufferId;
use crate::runtime::Context;
use crate::trace::inst::Inst;
use crate::trace::table::{ValueId, ValueTable, PREDEFINED_COUNT};

impl Context {
    pub fn eval(&mut self) {
        if self.live.is_empty() {
            return;
        }

        let mut buckets: BTreeMap<usize, Vec<ValueId>> = BTreeMap::new();
        for &root in &self.live {
            buckets.entry(self.values.get(root).width).or_default().push(root);
        }
        self.live.clear();

        for (width, mut roots) in buckets {
            roots.sort_unstable();
            let trace = order_bucket(&self.values, &roots);
            if trace.is_empty() {
                continue;
            }
            let dim = trace.iter().map(|&id| self.values.get(id).width).max().unwrap();
            debug_assert_eq!(dim, width);

            let source = self.codegen.generate(
                &mut self.values,
                &mut self.buffers,
                self.device.as_mut(),
                &trace,
                self.generation,
            );
            log::debug!("kernel for {}-lane bucket:\n{}", width, source);

            let program = if let Some(&p) = self.kernel_cache.get(&source) {
                self.cache_hits += 1;
                p
            } else {
                self.cache_misses += 1;
                let p = match self.device.compile(&source) {
                    Ok(p) => p,
                    Err(DeviceError::Build { log }) => {
                        log::error!("kernel build failed:\n{}", log);
                        panic!("kernel build failed");
                    }
                    Err(e) => {
                        log::error!("{}", e);
                        panic!("kernel compilation failed");
                    }
                };
                self.kernel_cache.insert(source, p);
                p
            };

            let args = self.buffers.device_args();
            log::debug!("launching {} work items over {} buffers", dim, args.len());
            if let Err(e) = self.device.dispatch(program, dim, &args) {
                log::error!("{}", e);
                panic!("kernel dispatch failed");
            }
        }

        self.collect_garbage();
        self.generation += 1;
    }

    /// Erase every record the user cannot observe anymore and free the
    /// buffers those records owned.
    ///
    /// Marking starts from externally referenced values and follows operand
    /// edges, but stops at values that already ran (materialized values and
    /// executed stores): their results are re-readable, so their producers
    /// are no longer needed.
    fn collect_garbage(&mut self) {
        let mut keep = FxHashSet::default();
        let mut stack: Vec<ValueId> =
            self.values.user_ids().filter(|&id| self.values.get(id).ref_ext > 0).collect();
        while let Some(id) = stack.pop() {
            if !keep.insert(id) {
                continue;
            }
            let v = self.values.get(id);
            if v.last_sync.is_none() {
                for d in v.inst.deps() {
                    if !d.is_predefined() && !keep.contains(&d) {
                        stack.push(d);
                    }
                }
            }
        }

        let dead: Vec<ValueId> = self.values.user_ids().filter(|id| !keep.contains(id)).collect();
        let mut dead_buffers = FxHashSet::default();
        for &id in &dead {
            if let Some(b) = self.values.get(id).buffer {
                dead_buffers.insert(b);
            }
            self.values.erase(id);
        }

        let remap = self.buffers.sweep(self.device.as_mut(), &dead_buffers);
        self.rewrite_buffer_ids(&remap);

        // Predefined widths are per-program state; the next trace may range
        // over a different lane count.
        for i in 0..PREDEFINED_COUNT {
            self.values.get_mut(ValueId(i)).width = 1;
        }

        log::trace!("gc: erased {} records, freed {} buffers", dead.len(), dead_buffers.len());
    }

    /// Apply a slab renumbering to every surviving record: the `buffer`
    /// field of materialized values and the destination of recorded stores.
    pub(crate) fn rewrite_buffer_ids(&mut self, remap: &FxHashMap<BufferId, BufferId>) {
        let ids: Vec<ValueId> = self.values.user_ids().collect();
        for id in ids {
            let v = self.values.get_mut(id);
            if let Some(b) = v.buffer {
                let new = remap.get(&b).unwrap_or_else(|| {
                    panic!("value {} references swept buffer {}", id.0, b.0)
                });
                v.buffer = Some(*new);
            }
            if let Inst::Store { buffer, .. } = &mut v.inst {
                if let Some(&new) = remap.get(buffer) {
                    *buffer = new;
                }
            }
        }
    }
}

/// Linearize one bucket: iterative post-order DFS from each root, operands
/// before consumers, each value at most once. Values that ran on a previous
/// generation are left out; kernels re-read them from their buffers.
fn order_bucket(values: &ValueTable, roots: &[ValueId]) -> Vec<ValueId> {
    let mut order = Vec::new();
    let mut visited = FxHashSet::default();
    let mut stack: Vec<(ValueId, bool)> = Vec::new();

    for &root in roots {
        stack.push((root, false));
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if visited.contains(&id) {
                continue;
            }
            let v = values.get(id);
            if v.last_sync.is_some() {
                continue;
            }
            visited.insert(id);
            stack.push((id, true));
            let deps = v.inst.deps();
            for &d in deps.iter().rev() {
                if !visited.contains(&d) {
                    stack.push((d, false));
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ElemType;
    use crate::runtime::{self, with};
    use crate::trace::inst::BinOp;
    use crate::trace::table::THREAD_INDEX;
    use crate::trace::Handle;

    fn const_f32(x: f64) -> Handle {
        Handle::from_id(runtime::trace_append(Inst::ConstFloat(x), ElemType::F32))
    }

    fn const_i32(x: i32) -> Handle {
        Handle::from_id(runtime::trace_append(Inst::ConstInt(x), ElemType::I32))
    }

    fn range(n: usize) -> Handle {
        runtime::set_width(THREAD_INDEX, n);
        Handle::from_id(THREAD_INDEX)
    }

    fn binary(op: BinOp, a: &Handle, b: &Handle, ty: ElemType) -> Handle {
        let w = runtime::width_of(a.id()).max(runtime::width_of(b.id()));
        let id = runtime::trace_append(
            Inst::Binary { op, lhs: a.id(), rhs: b.id() },
            ty,
        );
        runtime::set_width(id, w);
        Handle::from_id(id)
    }

    fn read_f32(h: &Handle) -> Vec<f32> {
        let w = runtime::width_of(h.id());
        let mut bytes = vec![0u8; w * 4];
        runtime::copy_to_host(h.id(), &mut bytes);
        bytes.chunks_exact(4).map(|c| f32::from_ne_bytes(c.try_into().unwrap())).collect()
    }

    fn read_i32(h: &Handle) -> Vec<i32> {
        let w = runtime::width_of(h.id());
        let mut bytes = vec![0u8; w * 4];
        runtime::copy_to_host(h.id(), &mut bytes);
        bytes.chunks_exact(4).map(|c| i32::from_ne_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn test_broadcast_add_reads_back() {
        runtime::init();
        let a = const_f32(2.0);
        let r = range(128);
        let s = binary(BinOp::FAdd, &a, &r, ElemType::F32);

        let data = read_f32(&s);
        let expect: Vec<f32> = (0..128).map(|i| 2.0 + i as f32).collect();
        assert_eq!(data, expect);

        with(|c| {
            assert!(c.live.is_empty());
            assert_eq!(c.generation, 1);
            let slab = c.buffers.get(c.values.get(s.id()).buffer.unwrap());
            assert_eq!(slab.bytes, 128 * 4);
        });
        drop((a, r, s));
        runtime::destroy();
    }

    #[test]
    fn test_iterated_accumulation_single_trace() {
        runtime::init();
        let r = range(128);
        let mut a = const_f32(2.0);
        for _ in 0..5 {
            a = binary(BinOp::FAdd, &a, &r, ElemType::F32);
        }
        let data = read_f32(&a);
        let expect: Vec<f32> = (0..128).map(|i| 2.0 + 5.0 * i as f32).collect();
        assert_eq!(data, expect);
        drop((r, a));
        runtime::destroy();
    }

    #[test]
    fn test_iterated_accumulation_across_generations() {
        runtime::init();
        let r = range(128);
        let mut a = const_f32(2.0);
        for _ in 0..5 {
            a = binary(BinOp::FAdd, &a, &r, ElemType::F32);
            runtime::eval();
        }
        let data = read_f32(&a);
        let expect: Vec<f32> = (0..128).map(|i| 2.0 + 5.0 * i as f32).collect();
        assert_eq!(data, expect);

        // Iterations 2..5 replay the same incremental kernel: one miss for
        // the first shape, one for the steady state, hits for the rest.
        with(|c| {
            assert_eq!(c.cache_misses, 2);
            assert_eq!(c.cache_hits, 3);
            assert_eq!(c.generation, 5);
        });
        drop((r, a));
        runtime::destroy();
    }

    #[test]
    fn test_dropped_intermediates_are_collected() {
        runtime::init();
        let r = range(128);
        let one = const_f32(1.0);
        let x = binary(BinOp::FAdd, &one, &r, ElemType::F32);
        drop(one);

        let mut intermediate_ids = Vec::new();
        let mut y = binary(BinOp::FAdd, &x, &x, ElemType::F32);
        for _ in 0..4 {
            intermediate_ids.push(y.id());
            y = binary(BinOp::FAdd, &y, &x, ElemType::F32);
        }
        let x_id = x.id();
        drop(x);
        drop(r);
        runtime::eval();

        // Only the final value survives; its buffer was renumbered to the
        // dense prefix.
        assert_eq!(runtime::buffer_id_of(y.id()), Some(BufferId(0)));
        with(|c| {
            assert_eq!(c.buffers.len(), 1);
            assert!(!c.values.contains(x_id));
            for id in &intermediate_ids {
                assert!(!c.values.contains(*id));
            }
        });

        let data = read_f32(&y);
        let expect: Vec<f32> = (0..128).map(|i| 6.0 * (1.0 + i as f32)).collect();
        assert_eq!(data, expect);
        drop(y);
        runtime::destroy();
    }

    #[test]
    fn test_width_buckets_launch_smallest_first() {
        runtime::init();
        let r8 = range(8);
        let s8 = binary(BinOp::FAdd, &const_f32(1.0), &r8, ElemType::F32);
        // A scalar-only computation lands in the width-1 bucket.
        let s1 = binary(BinOp::FAdd, &const_f32(2.0), &const_f32(3.0), ElemType::F32);
        runtime::eval();

        assert!(runtime::buffer_id_of(s8.id()).is_some());
        // Scalars are never persisted; observing one is a programmer error,
        // but its record survives while the handle does.
        assert_eq!(runtime::buffer_id_of(s1.id()), None);
        with(|c| assert!(c.values.contains(s1.id())));
        drop((r8, s8, s1));
        runtime::destroy();
    }

    #[test]
    fn test_masked_store_and_load_round_trip() {
        runtime::init();
        let buf = runtime::alloc(8 * 4, ElemType::I32);
        let r = range(8);
        let three = const_i32(3);
        let v = binary(BinOp::FMul, &r, &three, ElemType::I32);
        let two = const_i32(2);
        let zero = const_i32(0);
        let parity = binary(BinOp::Mod, &r, &two, ElemType::I32);
        let mask = {
            let id = runtime::trace_append(
                Inst::Binary { op: BinOp::CmpEq, lhs: parity.id(), rhs: zero.id() },
                ElemType::Bool,
            );
            runtime::set_width(id, 8);
            Handle::from_id(id)
        };
        let store = {
            let id = runtime::trace_append(
                Inst::Store { buffer: buf, index: r.id(), value: v.id(), mask: mask.id() },
                ElemType::None,
            );
            runtime::set_width(id, 8);
            Handle::from_id(id)
        };
        runtime::eval();

        let mut bytes = vec![0u8; 8 * 4];
        runtime::read_buffer(buf, 0, &mut bytes);
        let stored: Vec<i32> =
            bytes.chunks_exact(4).map(|c| i32::from_ne_bytes(c.try_into().unwrap())).collect();
        assert_eq!(stored, vec![0, 0, 6, 0, 12, 0, 18, 0]);

        // Masked gather from the materialized multiplier: the stored value
        // where the mask holds, zero elsewhere.
        let loaded = {
            let id = runtime::trace_append(
                Inst::Load { src: v.id(), mask: mask.id(), index: r.id() },
                ElemType::I32,
            );
            runtime::set_width(id, 8);
            Handle::from_id(id)
        };
        assert_eq!(read_i32(&loaded), vec![0, 0, 6, 0, 12, 0, 18, 0]);

        drop((r, three, v, two, zero, parity, mask, store, loaded));
        runtime::destroy();
    }

    #[test]
    fn test_free_buffer_renumbers_explicit_slabs() {
        runtime::init();
        let first = runtime::alloc(16, ElemType::I32);
        runtime::alloc(16, ElemType::F32);
        runtime::free_buffer(first);
        with(|c| {
            assert_eq!(c.buffers.len(), 1);
            assert_eq!(c.buffers.get(BufferId(0)).ty, ElemType::F32);
        });
        runtime::write_buffer(BufferId(0), 0, &1.5f32.to_ne_bytes());
        runtime::destroy();
    }

    #[test]
    fn test_eval_with_empty_live_set_is_a_noop() {
        runtime::init();
        runtime::eval();
        with(|c| assert_eq!(c.generation, 0));
        runtime::destroy();
    }

    #[test]
    #[should_panic(expected = "width conflict")]
    fn test_width_conflict_is_fatal() {
        runtime::init();
        let r8 = range(8);
        let a = binary(BinOp::FAdd, &const_f32(0.0), &r8, ElemType::F32);
        // Forcing a second, different multi-lane width on the same value.
        runtime::set_width(a.id(), 16);
    }

    #[test]
    #[should_panic(expected = "never materialized")]
    fn test_observing_a_scalar_is_fatal() {
        runtime::init();
        let a = const_f32(1.0);
        let mut bytes = [0u8; 4];
        runtime::copy_to_host(a.id(), &mut bytes);
    }

    #[test]
    #[should_panic(expected = "`mod` requires integer operands")]
    fn test_float_mod_is_rejected() {
        runtime::init();
        let a = const_f32(1.0);
        let b = const_f32(2.0);
        binary(BinOp::Mod, &a, &b, ElemType::F32);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_double_release_is_fatal() {
        runtime::init();
        let id = runtime::trace_append(Inst::ConstInt(1), ElemType::I32);
        runtime::inc_ext(id);
        runtime::dec_ext(id);
        runtime::dec_ext(id);
    }

    #[test]
    fn test_order_bucket_places_operands_first() {
        let mut values = ValueTable::new();
        let a = values.append(Inst::ConstInt(1), ElemType::I32);
        let b = values.append(Inst::ConstInt(2), ElemType::I32);
        let s = values.append(Inst::Binary { op: BinOp::FAdd, lhs: a, rhs: b }, ElemType::I32);
        let t = values.append(Inst::Binary { op: BinOp::FMul, lhs: s, rhs: b }, ElemType::I32);
        let order = order_bucket(&values, &[t, s]);
        assert_eq!(order, vec![a, b, s, t]);
    }

    #[test]
    fn test_order_bucket_skips_prior_generation_values() {
        let mut values = ValueTable::new();
        let a = values.append(Inst::ConstInt(1), ElemType::I32);
        let b = values.append(Inst::ConstInt(2), ElemType::I32);
        let s = values.append(Inst::Binary { op: BinOp::FAdd, lhs: a, rhs: b }, ElemType::I32);
        values.get_mut(a).last_sync = Some(0);
        let order = order_bucket(&values, &[s]);
        assert_eq!(order, vec![b, s]);
    }
}
