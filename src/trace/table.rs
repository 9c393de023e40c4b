//! The SSA value table.
//!
//! Append-only: indices are never reused, so a handle held across
//! evaluations keeps meaning the same value. Erased slots stay as holes;
//! looking one up is a hard error because only the garbage collector erases
//! records, and it proves beforehand that nothing can reach them.

use crate::common::types::ElemType;
use crate::runtime::buffers::BufferId;
use crate::trace::inst::Inst;

/// Number of reserved slots at the front of the table.
pub const PREDEFINED_COUNT: u32 = 1;

/// The work-item index pseudo-value.
pub const THREAD_INDEX: ValueId = ValueId(0);

/// Index of a value record in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn is_predefined(self) -> bool {
        self.0 < PREDEFINED_COUNT
    }
}

/// One SSA value record.
#[derive(Debug, Clone)]
pub struct Value {
    pub inst: Inst,
    pub ty: ElemType,
    /// Lane count; 1 is a scalar broadcast across the launch.
    pub width: usize,
    /// Slab holding this value's lanes, once materialized.
    pub buffer: Option<BufferId>,
    pub ref_int: u32,
    pub ref_ext: u32,
    /// Generation at which this value was last written to `buffer` (or, for
    /// stores, at which the store executed).
    pub last_sync: Option<u64>,
}

impl Value {
    fn new(inst: Inst, ty: ElemType) -> Self {
        Value {
            inst,
            ty,
            width: 1,
            buffer: None,
            ref_int: 0,
            ref_ext: 0,
            last_sync: None,
        }
    }
}

/// Dense map from SSA index to value record.
pub struct ValueTable {
    slots: Vec<Option<Value>>,
}

impl ValueTable {
    pub fn new() -> Self {
        let mut table = ValueTable { slots: Vec::new() };
        table.slots.push(Some(Value::new(Inst::ThreadIndex, ElemType::I32)));
        debug_assert_eq!(table.slots.len(), PREDEFINED_COUNT as usize);
        table
    }

    pub fn append(&mut self, inst: Inst, ty: ElemType) -> ValueId {
        let id = ValueId(self.slots.len() as u32);
        self.slots.push(Some(Value::new(inst, ty)));
        id
    }

    pub fn contains(&self, id: ValueId) -> bool {
        self.slots.get(id.0 as usize).is_some_and(|s| s.is_some())
    }

    pub fn get(&self, id: ValueId) -> &Value {
        self.slots
            .get(id.0 as usize)
            .and_then(|s| s.as_ref())
            .unwrap_or_else(|| panic!("no value record for index {}", id.0))
    }

    pub fn get_mut(&mut self, id: ValueId) -> &mut Value {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|s| s.as_mut())
            .unwrap_or_else(|| panic!("no value record for index {}", id.0))
    }

    /// Erase a user record. Predefined slots cannot be erased.
    pub fn erase(&mut self, id: ValueId) {
        assert!(!id.is_predefined(), "cannot erase predefined slot {}", id.0);
        let slot = self
            .slots
            .get_mut(id.0 as usize)
            .unwrap_or_else(|| panic!("no value record for index {}", id.0));
        assert!(slot.is_some(), "double erase of index {}", id.0);
        *slot = None;
    }

    /// Iterate the ids of all live user records (predefined slots excluded).
    pub fn user_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .skip(PREDEFINED_COUNT as usize)
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| ValueId(i as u32))
    }
}

impl Default for ValueTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_thread_index() {
        let table = ValueTable::new();
        let v = table.get(THREAD_INDEX);
        assert!(matches!(v.inst, Inst::ThreadIndex));
        assert_eq!(v.ty, ElemType::I32);
        assert_eq!(v.width, 1);
    }

    #[test]
    fn test_append_initializes_record() {
        let mut table = ValueTable::new();
        let id = table.append(Inst::ConstInt(3), ElemType::I32);
        assert_eq!(id, ValueId(PREDEFINED_COUNT));
        let v = table.get(id);
        assert_eq!(v.width, 1);
        assert_eq!(v.ref_ext, 0);
        assert!(v.buffer.is_none());
        assert!(v.last_sync.is_none());
    }

    #[test]
    fn test_erase_leaves_hole() {
        let mut table = ValueTable::new();
        let a = table.append(Inst::ConstInt(1), ElemType::I32);
        let b = table.append(Inst::ConstInt(2), ElemType::I32);
        table.erase(a);
        assert!(!table.contains(a));
        assert!(table.contains(b));
        assert_eq!(table.user_ids().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    #[should_panic(expected = "no value record")]
    fn test_missing_index_panics() {
        let table = ValueTable::new();
        table.get(ValueId(42));
    }
}
