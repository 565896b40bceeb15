//! Declarative description of an interceptable operations layout
//!
//! A per-type wrapper describes where the operations live (a pointer field
//! referring to a shared table, or fields of the object itself), how large
//! the table is, and which named slots it intercepts with which
//! intermediate (replacement) function. The description is validated once,
//! when it is built, and never mutated afterwards.
//!
//! ```
//! use optrap::{Addr, IntermediateOp, OpsSchema};
//!
//! #[repr(C)]
//! struct Ops {
//!     read: Option<extern "C" fn(*mut Obj) -> i32>,
//!     release: Option<extern "C" fn(*mut Obj)>,
//! }
//! #[repr(C)]
//! struct Obj {
//!     ops: *const Ops,
//! }
//!
//! extern "C" fn read_intermediate(_obj: *mut Obj) -> i32 {
//!     0
//! }
//!
//! let schema = OpsSchema::indirect(
//!     "obj_operations",
//!     std::mem::offset_of!(Obj, ops),
//!     std::mem::size_of::<Ops>(),
//! )
//! .operation(IntermediateOp::new(
//!     "read",
//!     std::mem::offset_of!(Ops, read),
//!     Addr::new(read_intermediate as *const () as usize),
//! ))
//! .build()
//! .unwrap();
//! assert_eq!(schema.offset_of("read"), Some(0));
//! ```

use crate::addr::{Addr, SLOT_SIZE};
use crate::error::{InterceptError, Result};
use std::collections::HashSet;

/// A named pointer-sized slot at a byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSlot {
    pub name: &'static str,
    pub offset: usize,
}

/// One interceptable operation and its intermediate function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediateOp {
    pub slot: OpSlot,
    pub replacement: Addr,
    /// Operations sharing a non-zero group are always intercepted together
    pub group: u32,
    /// External (default-behaviour) handlers are refused for this operation
    pub internal_only: bool,
}

impl IntermediateOp {
    pub fn new(name: &'static str, offset: usize, replacement: Addr) -> Self {
        Self {
            slot: OpSlot { name, offset },
            replacement,
            group: 0,
            internal_only: false,
        }
    }

    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    pub fn internal_only(mut self) -> Self {
        self.internal_only = true;
        self
    }

    pub fn offset(&self) -> usize {
        self.slot.offset
    }

    pub fn name(&self) -> &'static str {
        self.slot.name
    }
}

/// Where an object's operations live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsLocation {
    /// The object holds a pointer (at `field_offset`) to a table of
    /// `table_size` bytes
    Indirect {
        field_offset: usize,
        table_size: usize,
    },
    /// The operations are fields of the object itself
    Direct { object_size: usize },
}

/// Validated operations layout
#[derive(Debug, Clone)]
pub struct OpsSchema {
    name: String,
    location: OpsLocation,
    intermediates: Vec<IntermediateOp>,
}

/// Collects operations for an [`OpsSchema`]
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    location: OpsLocation,
    intermediates: Vec<IntermediateOp>,
}

impl SchemaBuilder {
    pub fn operation(mut self, op: IntermediateOp) -> Self {
        self.intermediates.push(op);
        self
    }

    pub fn operations(mut self, ops: impl IntoIterator<Item = IntermediateOp>) -> Self {
        self.intermediates.extend(ops);
        self
    }

    pub fn build(self) -> Result<OpsSchema> {
        let schema = OpsSchema {
            name: self.name,
            location: self.location,
            intermediates: self.intermediates,
        };
        schema.validate()?;
        Ok(schema)
    }
}

fn invalid(msg: String) -> InterceptError {
    InterceptError::InvalidSchema(msg)
}

impl OpsSchema {
    /// Layout with operations reached through a table pointer field
    pub fn indirect(name: impl Into<String>, field_offset: usize, table_size: usize) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            location: OpsLocation::Indirect {
                field_offset,
                table_size,
            },
            intermediates: Vec::new(),
        }
    }

    /// Layout with operations stored in the object itself
    pub fn direct(name: impl Into<String>, object_size: usize) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            location: OpsLocation::Direct { object_size },
            intermediates: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> OpsLocation {
        self.location
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.location, OpsLocation::Direct { .. })
    }

    /// Offset of the table pointer field, for indirect layouts
    pub fn field_offset(&self) -> Option<usize> {
        match self.location {
            OpsLocation::Indirect { field_offset, .. } => Some(field_offset),
            OpsLocation::Direct { .. } => None,
        }
    }

    /// Size of the region holding the operation slots
    pub fn region_size(&self) -> usize {
        match self.location {
            OpsLocation::Indirect { table_size, .. } => table_size,
            OpsLocation::Direct { object_size } => object_size,
        }
    }

    pub fn intermediates(&self) -> &[IntermediateOp] {
        &self.intermediates
    }

    pub fn find(&self, offset: usize) -> Option<&IntermediateOp> {
        self.intermediates.iter().find(|op| op.offset() == offset)
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.intermediates
            .iter()
            .find(|op| op.name() == name)
            .map(IntermediateOp::offset)
    }

    /// True if `addr` is one of this layout's intermediate functions
    pub fn is_replacement(&self, addr: Addr) -> bool {
        self.intermediates.iter().any(|op| op.replacement == addr)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("schema name is empty".to_string()));
        }
        if self.intermediates.is_empty() {
            return Err(invalid(format!("{}: no intermediate operations", self.name)));
        }

        let region = self.region_size();
        match self.location {
            OpsLocation::Indirect {
                field_offset,
                table_size,
            } => {
                if field_offset % SLOT_SIZE != 0 {
                    return Err(invalid(format!(
                        "{}: operations field offset {} is not pointer-aligned",
                        self.name, field_offset
                    )));
                }
                if table_size == 0 || table_size % SLOT_SIZE != 0 {
                    return Err(invalid(format!(
                        "{}: table size {} is not a positive multiple of {}",
                        self.name, table_size, SLOT_SIZE
                    )));
                }
            }
            OpsLocation::Direct { object_size } => {
                if object_size == 0 {
                    return Err(invalid(format!("{}: object size is zero", self.name)));
                }
            }
        }

        let mut offsets = HashSet::new();
        let mut names = HashSet::new();
        for op in &self.intermediates {
            let offset = op.offset();
            if offset % SLOT_SIZE != 0 {
                return Err(invalid(format!(
                    "{}: operation '{}' at offset {} is not pointer-aligned",
                    self.name,
                    op.name(),
                    offset
                )));
            }
            if offset + SLOT_SIZE > region {
                return Err(invalid(format!(
                    "{}: operation '{}' at offset {} lies outside {} bytes",
                    self.name,
                    op.name(),
                    offset,
                    region
                )));
            }
            if op.replacement.is_null() {
                return Err(invalid(format!(
                    "{}: operation '{}' has no intermediate function",
                    self.name,
                    op.name()
                )));
            }
            if !offsets.insert(offset) {
                return Err(invalid(format!(
                    "{}: duplicate operation offset {}",
                    self.name, offset
                )));
            }
            if !names.insert(op.name()) {
                return Err(invalid(format!(
                    "{}: duplicate operation name '{}'",
                    self.name,
                    op.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &'static str, offset: usize) -> IntermediateOp {
        IntermediateOp::new(name, offset, Addr::new(0xdead_0000 + offset))
    }

    #[test]
    fn test_valid_indirect_schema() {
        let schema = OpsSchema::indirect("ops", 8, 4 * SLOT_SIZE)
            .operation(op("open", 0))
            .operation(op("release", SLOT_SIZE).group(1))
            .build()
            .unwrap();

        assert_eq!(schema.field_offset(), Some(8));
        assert_eq!(schema.offset_of("release"), Some(SLOT_SIZE));
        assert_eq!(schema.find(SLOT_SIZE).unwrap().group, 1);
        assert!(schema.is_replacement(Addr::new(0xdead_0000)));
        assert!(!schema.is_direct());
    }

    #[test]
    fn test_direct_schema() {
        let schema = OpsSchema::direct("callbacks", 3 * SLOT_SIZE)
            .operation(op("fire", 2 * SLOT_SIZE))
            .build()
            .unwrap();
        assert!(schema.is_direct());
        assert_eq!(schema.field_offset(), None);
        assert_eq!(schema.region_size(), 3 * SLOT_SIZE);
    }

    #[test]
    fn test_rejects_out_of_bounds_slot() {
        let err = OpsSchema::indirect("ops", 0, 2 * SLOT_SIZE)
            .operation(op("far", 2 * SLOT_SIZE))
            .build()
            .unwrap_err();
        assert!(matches!(err, InterceptError::InvalidSchema(msg) if msg.contains("outside")));
    }

    #[test]
    fn test_rejects_misaligned_and_duplicates() {
        assert!(OpsSchema::indirect("ops", 0, 4 * SLOT_SIZE)
            .operation(op("odd", 3))
            .build()
            .is_err());
        assert!(OpsSchema::indirect("ops", 0, 4 * SLOT_SIZE)
            .operation(op("a", 0))
            .operation(op("b", 0))
            .build()
            .is_err());
        assert!(OpsSchema::indirect("ops", 0, 4 * SLOT_SIZE)
            .operation(op("a", 0))
            .operation(op("a", SLOT_SIZE))
            .build()
            .is_err());
        assert!(OpsSchema::indirect("ops", 3, 4 * SLOT_SIZE)
            .operation(op("a", 0))
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_empty_and_null_replacement() {
        assert!(OpsSchema::indirect("ops", 0, SLOT_SIZE).build().is_err());
        assert!(OpsSchema::indirect("ops", 0, SLOT_SIZE)
            .operation(IntermediateOp::new("nil", 0, Addr::NULL))
            .build()
            .is_err());
    }
}
