//! Device-memory slabs.
//!
//! Slab ids are dense and double as kernel argument positions: argument `i`
//! of every kernel binds the slab with id `i`. Sweeping dead slabs therefore
//! renumbers the survivors and hands the caller a remap table so that every
//! recorded reference can be rewritten.

use crate::backend::{Device, DeviceBufferId};
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::common::types::ElemType;

/// Pool index of a slab; also its kernel argument position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone)]
pub struct Slab {
    pub device: DeviceBufferId,
    pub ty: ElemType,
    pub bytes: usize,
    /// Pinned slabs were handed out through `alloc` and have no owning
    /// value; the collector never sweeps them.
    pub pinned: bool,
}

#[derive(Default)]
pub struct BufferPool {
    slabs: Vec<Slab>,
}

impl BufferPool {
    pub fn alloc(
        &mut self,
        device: &mut dyn Device,
        bytes: usize,
        ty: ElemType,
        pinned: bool,
    ) -> BufferId {
        let handle = device.alloc(bytes);
        let id = BufferId(self.slabs.len() as u32);
        self.slabs.push(Slab { device: handle, ty, bytes, pinned });
        id
    }

    pub fn get(&self, id: BufferId) -> &Slab {
        self.slabs
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("no slab for buffer id {}", id.0))
    }

    pub fn len(&self) -> usize {
        self.slabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    /// Device handles of all slabs, in id order. This is the kernel argument
    /// list.
    pub fn device_args(&self) -> Vec<DeviceBufferId> {
        self.slabs.iter().map(|s| s.device).collect()
    }

    pub fn read(&self, device: &dyn Device, id: BufferId, offset: usize, dst: &mut [u8]) {
        let slab = self.get(id);
        assert!(offset + dst.len() <= slab.bytes, "read past end of buffer {}", id.0);
        device.read(slab.device, offset, dst);
    }

    pub fn write(&self, device: &mut dyn Device, id: BufferId, offset: usize, data: &[u8]) {
        let slab = self.get(id);
        assert!(offset + data.len() <= slab.bytes, "write past end of buffer {}", id.0);
        device.write(slab.device, offset, data);
    }

    /// Free every slab in `dead` and renumber the survivors to a dense
    /// prefix. Returns the old-id → new-id map for the survivors.
    ///
    /// Sweeping a pinned slab is a hard error: explicit buffers are released
    /// through [`BufferPool::unpin`] followed by a sweep, never by the
    /// collector.
    pub fn sweep(
        &mut self,
        device: &mut dyn Device,
        dead: &FxHashSet<BufferId>,
    ) -> FxHashMap<BufferId, BufferId> {
        let slabs = std::mem::take(&mut self.slabs);
        let mut remap = FxHashMap::default();
        for (i, slab) in slabs.into_iter().enumerate() {
            let old = BufferId(i as u32);
            if dead.contains(&old) {
                assert!(!slab.pinned, "cannot sweep pinned buffer {}", old.0);
                device.free(slab.device);
            } else {
                remap.insert(old, BufferId(self.slabs.len() as u32));
                self.slabs.push(slab);
            }
        }
        remap
    }

    /// Clear a slab's pinned flag so an explicit free can sweep it.
    pub fn unpin(&mut self, id: BufferId) {
        self.slabs
            .get_mut(id.0 as usize)
            .unwrap_or_else(|| panic!("no slab for buffer id {}", id.0))
            .pinned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;
    use proptest::prelude::*;

    #[test]
    fn test_ids_are_argument_positions() {
        let mut device = HostDevice::new();
        let mut pool = BufferPool::default();
        let a = pool.alloc(&mut device, 16, ElemType::I32, false);
        let b = pool.alloc(&mut device, 32, ElemType::F32, false);
        assert_eq!(a, BufferId(0));
        assert_eq!(b, BufferId(1));
        assert_eq!(pool.device_args().len(), 2);
    }

    #[test]
    #[should_panic(expected = "cannot sweep pinned buffer")]
    fn test_sweep_rejects_pinned_slabs() {
        let mut device = HostDevice::new();
        let mut pool = BufferPool::default();
        let pinned = pool.alloc(&mut device, 16, ElemType::I32, true);
        let mut dead = FxHashSet::default();
        dead.insert(pinned);
        pool.sweep(&mut device, &dead);
    }

    #[test]
    fn test_unpin_allows_explicit_free() {
        let mut device = HostDevice::new();
        let mut pool = BufferPool::default();
        let a = pool.alloc(&mut device, 16, ElemType::I32, true);
        let b = pool.alloc(&mut device, 16, ElemType::F32, false);
        pool.unpin(a);
        let mut dead = FxHashSet::default();
        dead.insert(a);
        let remap = pool.sweep(&mut device, &dead);
        assert_eq!(pool.len(), 1);
        assert_eq!(remap[&b], BufferId(0));
        assert_eq!(pool.get(BufferId(0)).ty, ElemType::F32);
    }

    #[test]
    fn test_sweep_renumbers_densely() {
        let mut device = HostDevice::new();
        let mut pool = BufferPool::default();
        let ids: Vec<BufferId> =
            (0..4).map(|_| pool.alloc(&mut device, 8, ElemType::I32, false)).collect();
        let mut dead = FxHashSet::default();
        dead.insert(ids[0]);
        dead.insert(ids[2]);
        let remap = pool.sweep(&mut device, &dead);
        assert_eq!(pool.len(), 2);
        assert_eq!(remap[&ids[1]], BufferId(0));
        assert_eq!(remap[&ids[3]], BufferId(1));
        assert!(!remap.contains_key(&ids[0]));
    }

    proptest! {
        #[test]
        fn prop_sweep_is_dense_and_order_preserving(kill in proptest::collection::vec(any::<bool>(), 0..24)) {
            let mut device = HostDevice::new();
            let mut pool = BufferPool::default();
            for _ in 0..kill.len() {
                pool.alloc(&mut device, 4, ElemType::F32, false);
            }
            let dead: FxHashSet<BufferId> = kill
                .iter()
                .enumerate()
                .filter(|(_, &k)| k)
                .map(|(i, _)| BufferId(i as u32))
                .collect();
            let remap = pool.sweep(&mut device, &dead);

            prop_assert_eq!(pool.len(), kill.len() - dead.len());
            prop_assert_eq!(remap.len(), pool.len());
            // New ids are exactly 0..len, and survivors keep their relative order.
            let mut pairs: Vec<(BufferId, BufferId)> = remap.into_iter().collect();
            pairs.sort_by_key(|&(old, _)| old);
            for (pos, (_, new)) in pairs.iter().enumerate() {
                prop_assert_eq!(*new, BufferId(pos as u32));
            }
        }
    }
}
