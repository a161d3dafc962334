//! The addressed, typed pattern tree. A `Pattern` is a cheaply cloneable
//! handle (`Rc<RefCell<..>>`) so that `parent` back-references can be kept
//! as `Weak` pointers instead of the raw/owning pointers the
//! original walker used.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use pat_diagnostics::Location;
use serde::{Deserialize, Serialize};
use ustr::Ustr;

use crate::literal::Literal;

pub type SectionId = u64;
pub const MAIN_SECTION_ID: SectionId = 0;
pub const HEAP_SECTION_ID: SectionId = 1;
pub const PATTERN_LOCAL_SECTION_ID: SectionId = 2;
pub const INSTANTIATION_SECTION_ID: SectionId = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    Visible,
    Hidden,
    HighlightHidden,
    TreeHidden,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endian {
    Big,
    Little,
    Native,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndianSetting {
    pub endian: Endian,
    pub overridden: bool,
}

impl EndianSetting {
    pub fn inherited(endian: Endian) -> Self {
        Self { endian, overridden: false }
    }

    pub fn explicit(endian: Endian) -> Self {
        Self { endian, overridden: true }
    }
}

/// Variant-specific data. Containers own their children directly (`Vec<Pattern>`);
/// a child's `parent` is a `Weak` handle back into this tree, never a strong
/// cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Variant {
    Padding,
    Unsigned,
    Signed,
    Float,
    Boolean,
    Character,
    WideCharacter,
    String,
    WideString,
    ArrayStatic { children: Vec<Pattern>, element_type_name: String },
    ArrayDynamic { children: Vec<Pattern>, element_type_name: String },
    Struct { children: Vec<Pattern> },
    Union { children: Vec<Pattern> },
    Bitfield { children: Vec<Pattern> },
    BitfieldField { bits: BitfieldFieldKind },
    BitfieldArray { children: Vec<Pattern> },
    Enum { entries: Vec<(Ustr, Literal)> },
    Pointer { pointee: Box<Pattern>, pointer_type_name: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitfieldFieldKind {
    Unsigned,
    Signed,
    Boolean,
    Enum,
}

#[derive(Serialize, Deserialize)]
pub struct PatternData {
    pub offset: u64,
    pub size: u64,
    pub bit_offset: Option<u8>,
    pub bit_size: Option<u8>,
    pub section_id: SectionId,
    pub endian: EndianSetting,
    pub variable_name: String,
    pub name_location: Location,
    pub type_name: String,
    pub comment: Option<String>,
    pub color: Option<u32>,
    pub visibility: Visibility,
    pub format_read_function: Option<String>,
    pub format_write_function: Option<String>,
    pub transform_function: Option<String>,
    pub attributes: AHashMap<String, Vec<Literal>>,
    pub location: Location,
    #[serde(skip)]
    pub parent: Option<Weak<RefCell<PatternData>>>,
    pub variant: Variant,
}

/// A handle to a pattern-tree node. Cloning is `Rc` clone (shared), not a
/// deep copy; use [`Pattern::detach`] for a genuinely detached subtree.
///
/// Serializing a `Pattern` serializes the owned node data reachable through
/// it; `parent` back-references are skipped (they're rebuilt by the
/// container that deserializes a subtree, the same way [`Pattern::detach`]
/// rebuilds them for a clone).
#[derive(Clone, Serialize, Deserialize)]
pub struct Pattern(Rc<RefCell<PatternData>>);

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        f.debug_struct("Pattern")
            .field("variable_name", &data.variable_name)
            .field("type_name", &data.type_name)
            .field("offset", &data.offset)
            .field("size", &data.size)
            .finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Pattern {
    pub fn new(data: PatternData) -> Self {
        Self(Rc::new(RefCell::new(data)))
    }

    pub fn borrow(&self) -> Ref<'_, PatternData> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, PatternData> {
        self.0.borrow_mut()
    }

    pub fn downgrade(&self) -> Weak<RefCell<PatternData>> {
        Rc::downgrade(&self.0)
    }

    pub fn parent(&self) -> Option<Pattern> {
        self.0.borrow().parent.as_ref().and_then(|w| w.upgrade()).map(Pattern)
    }

    pub fn set_parent(&self, parent: &Pattern) {
        self.0.borrow_mut().parent = Some(parent.downgrade());
    }

    pub fn formatted_name(&self) -> String {
        let data = self.0.borrow();
        if data.variable_name.is_empty() {
            data.type_name.clone()
        } else {
            format!("{} {}", data.type_name, data.variable_name)
        }
    }

    pub fn is_iterable(&self) -> bool {
        matches!(
            self.0.borrow().variant,
            Variant::ArrayStatic { .. }
                | Variant::ArrayDynamic { .. }
                | Variant::Struct { .. }
                | Variant::Union { .. }
                | Variant::Bitfield { .. }
                | Variant::BitfieldArray { .. }
        )
    }

    pub fn is_indexable(&self) -> bool {
        self.is_iterable()
    }

    /// `IIterable`: enumerate children in declaration order.
    pub fn children(&self) -> Vec<Pattern> {
        match &self.0.borrow().variant {
            Variant::ArrayStatic { children, .. }
            | Variant::ArrayDynamic { children, .. }
            | Variant::Struct { children }
            | Variant::Union { children }
            | Variant::Bitfield { children }
            | Variant::BitfieldArray { children } => children.clone(),
            _ => Vec::new(),
        }
    }

    /// `IIndexable`: random access by position among children.
    pub fn child_at(&self, index: usize) -> Option<Pattern> {
        self.children().get(index).cloned()
    }

    /// Rebuilds `parent` links after deserializing a subtree, whose
    /// `parent` fields all come back as `None`.
    pub fn relink_parents(&self) {
        for child in self.children() {
            child.set_parent(self);
            child.relink_parents();
        }
        if let Variant::Pointer { pointee, .. } = &self.0.borrow().variant {
            pointee.set_parent(self);
            pointee.relink_parents();
        }
    }

    pub fn accept(&self, visitor: &mut dyn Visitor) {
        visitor.visit(self);
        if self.is_iterable() {
            for child in self.children() {
                child.accept(visitor);
            }
        }
    }

    /// A detached clone: a fresh, independent subtree sharing no parent
    /// with the original.
    pub fn detach(&self) -> Pattern {
        let data = self.0.borrow();
        let variant = clone_variant_detached(&data.variant);
        let cloned = Pattern::new(PatternData {
            offset: data.offset,
            size: data.size,
            bit_offset: data.bit_offset,
            bit_size: data.bit_size,
            section_id: data.section_id,
            endian: data.endian,
            variable_name: data.variable_name.clone(),
            name_location: data.name_location,
            type_name: data.type_name.clone(),
            comment: data.comment.clone(),
            color: data.color,
            visibility: data.visibility,
            format_read_function: data.format_read_function.clone(),
            format_write_function: data.format_write_function.clone(),
            transform_function: data.transform_function.clone(),
            attributes: data.attributes.clone(),
            location: data.location,
            parent: None,
            variant,
        });
        for child in cloned.children() {
            child.set_parent(&cloned);
        }
        log::trace!("detached pattern `{}` from its parent", cloned.borrow().variable_name);
        cloned
    }
}

fn clone_variant_detached(variant: &Variant) -> Variant {
    match variant {
        Variant::ArrayStatic { children, element_type_name } => {
            Variant::ArrayStatic { children: children.iter().map(Pattern::detach).collect(), element_type_name: element_type_name.clone() }
        }
        Variant::ArrayDynamic { children, element_type_name } => {
            Variant::ArrayDynamic { children: children.iter().map(Pattern::detach).collect(), element_type_name: element_type_name.clone() }
        }
        Variant::Struct { children } => Variant::Struct { children: children.iter().map(Pattern::detach).collect() },
        Variant::Union { children } => Variant::Union { children: children.iter().map(Pattern::detach).collect() },
        Variant::Bitfield { children } => Variant::Bitfield { children: children.iter().map(Pattern::detach).collect() },
        Variant::BitfieldArray { children } => Variant::BitfieldArray { children: children.iter().map(Pattern::detach).collect() },
        Variant::Pointer { pointee, pointer_type_name } => {
            Variant::Pointer { pointee: Box::new(pointee.detach()), pointer_type_name: pointer_type_name.clone() }
        }
        other => other.clone(),
    }
}

/// Receives every pattern in a depth-first, declaration-order walk.
pub trait Visitor {
    fn visit(&mut self, pattern: &Pattern);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, offset: u64, size: u64) -> Pattern {
        Pattern::new(PatternData {
            offset,
            size,
            bit_offset: None,
            bit_size: None,
            section_id: MAIN_SECTION_ID,
            endian: EndianSetting::inherited(Endian::Little),
            variable_name: name.to_string(),
            name_location: Location::empty(),
            type_name: "u8".to_string(),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location: Location::empty(),
            parent: None,
            variant: Variant::Unsigned,
        })
    }

    fn struct_of(name: &str, children: Vec<Pattern>) -> Pattern {
        let size = children.iter().map(|c| c.borrow().size).sum();
        let parent = Pattern::new(PatternData {
            offset: 0,
            size,
            bit_offset: None,
            bit_size: None,
            section_id: MAIN_SECTION_ID,
            endian: EndianSetting::inherited(Endian::Little),
            variable_name: name.to_string(),
            name_location: Location::empty(),
            type_name: name.to_string(),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location: Location::empty(),
            parent: None,
            variant: Variant::Struct { children: children.clone() },
        });
        for child in &children {
            child.set_parent(&parent);
        }
        parent
    }

    #[test]
    fn struct_children_share_parent() {
        let a = leaf("a", 0, 1);
        let b = leaf("b", 1, 1);
        let s = struct_of("P", vec![a.clone(), b.clone()]);
        assert_eq!(a.parent().unwrap(), s);
        assert_eq!(s.children().len(), 2);
        assert_eq!(s.borrow().size, 2);
    }

    #[test]
    fn detach_produces_parentless_clone() {
        let a = leaf("a", 0, 1);
        let s = struct_of("P", vec![a]);
        let clone = s.detach();
        assert!(clone.parent().is_none());
        assert_ne!(clone, s);
        assert_eq!(clone.children()[0].parent().unwrap(), clone);
    }

    struct CountVisitor(usize);
    impl Visitor for CountVisitor {
        fn visit(&mut self, _pattern: &Pattern) {
            self.0 += 1;
        }
    }

    #[test]
    fn accept_visits_every_node_depth_first() {
        let a = leaf("a", 0, 1);
        let b = leaf("b", 1, 1);
        let s = struct_of("P", vec![a, b]);
        let mut v = CountVisitor(0);
        s.accept(&mut v);
        assert_eq!(v.0, 3);
    }
}
