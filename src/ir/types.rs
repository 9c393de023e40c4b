//! Types for the functional IR.
//!
//! Primitive scalars plus nominal struct types. Structs are interned by name
//! through a [`StructRegistry`] so that every mention of a struct shares one
//! allocation and backend lowerings can key off the name.

use std::rc::Rc;

use crate::common::fx_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    I32,
    F32,
    F64,
    Struct(Rc<StructType>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl Type {
    pub fn is_float(&self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    pub fn as_struct(&self) -> Option<&Rc<StructType>> {
        match self {
            Type::Struct(st) => Some(st),
            _ => None,
        }
    }

    /// Human-readable spelling, used by the printer.
    pub fn name(&self) -> &str {
        match self {
            Type::Bool => "bool",
            Type::I32 => "i32",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::Struct(st) => &st.name,
        }
    }
}

#[derive(Default)]
pub struct StructRegistry {
    by_name: FxHashMap<String, Rc<StructType>>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a struct type. A second registration under the same name must
    /// carry the same field list.
    pub fn intern(&mut self, name: &str, fields: Vec<(String, Type)>) -> Rc<StructType> {
        if let Some(existing) = self.by_name.get(name) {
            assert_eq!(
                existing.fields, fields,
                "struct `{}` registered twice with different fields",
                name
            );
            return existing.clone();
        }
        let st = Rc::new(StructType { name: name.to_string(), fields });
        self.by_name.insert(name.to_string(), st.clone());
        st
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<StructType>> {
        self.by_name.get(name).cloned()
    }
}
