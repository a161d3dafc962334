//! The literal value type and the addressed, typed pattern tree: what the
//! parser's `Literal` AST node carries, and what the evaluator
//! materializes while walking the AST against sections.

pub mod literal;
pub mod pattern;

pub use literal::{CoercionError, Literal};
pub use pattern::{
    BitfieldFieldKind, Endian, EndianSetting, Pattern, PatternData, SectionId, Variant, Visibility, Visitor,
    HEAP_SECTION_ID, INSTANTIATION_SECTION_ID, MAIN_SECTION_ID, PATTERN_LOCAL_SECTION_ID,
};
