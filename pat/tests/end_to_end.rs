//! End-to-end runs of the full pipeline through the runtime facade, against
//! small fixed byte buffers, one per language feature that the facade has
//! to get right: struct layout, bitfields, pointers, conditional layout,
//! match-with-default, and user functions with `out` variables.
//!
//! `Runtime::patterns()` is a flat list of every declared variable at every
//! nesting depth (struct/union members push onto it just like top-level
//! declarations do), so tests look patterns up by name rather than assuming
//! a particular length or index.

use ahash::AHashMap;
use pat::tree::{Literal, Pattern, Variant};
use pat::Runtime;

fn run(source: &str, data: &[u8]) -> Runtime {
    let mut rt = Runtime::new();
    rt.set_data_source(data.to_vec());
    let ok = rt.execute_string(source, AHashMap::new(), AHashMap::new());
    assert!(ok, "execution failed: {:?}", rt.error());
    rt
}

fn find<'a>(patterns: &'a [Pattern], name: &str) -> &'a Pattern {
    patterns
        .iter()
        .find(|p| p.borrow().variable_name == name)
        .unwrap_or_else(|| panic!("no pattern named {name:?} among {patterns:?}"))
}

#[test]
fn fixed_struct_places_members_in_order() {
    let rt = run("struct P { u8 a; u16 b; u8 c; }; P p @ 0x00;", &[0x01, 0x02, 0x03, 0x04]);
    let patterns = rt.patterns();
    let p = find(patterns, "p");
    assert_eq!(p.borrow().offset, 0);
    assert_eq!(p.borrow().size, 4);

    let children = p.children();
    assert_eq!(children.len(), 3);
    assert_eq!((children[0].borrow().offset, children[0].borrow().size), (0, 1));
    assert_eq!((children[1].borrow().offset, children[1].borrow().size), (1, 2));
    assert_eq!((children[2].borrow().offset, children[2].borrow().size), (3, 1));
}

#[test]
fn bitfield_reads_right_to_left_by_default() {
    // 0xA5 == 1010_0101; with the low 3 bits as `x` and the next 5 as `y`,
    // x = 0b101 = 5 and y = 0b10100 = 0x14.
    let rt = run("bitfield B { x : 3; y : 5; }; B b @ 0;", &[0xA5]);
    let b = find(rt.patterns(), "b");
    let children = b.children();
    assert_eq!(children.len(), 2);
    assert!(matches!(children[0].borrow().variant, Variant::BitfieldField { .. }));
    assert_eq!(children[0].borrow().bit_offset, Some(0));
    assert_eq!(children[0].borrow().bit_size, Some(3));
    assert_eq!(children[1].borrow().bit_offset, Some(3));
    assert_eq!(children[1].borrow().bit_size, Some(5));
}

#[test]
fn bitfield_honors_explicit_left_to_right_order() {
    // Same fields as the right-to-left case, but flipped: the
    // first-declared field (x) now occupies the high 3 bits instead of the
    // low 3.
    let rt = run("bitfield B { x : 3; y : 5; } [[bitfield_order(\"left_to_right\")]]; B b @ 0;", &[0xA5]);
    let b = find(rt.patterns(), "b");
    let children = b.children();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].borrow().bit_offset, Some(5));
    assert_eq!(children[0].borrow().bit_size, Some(3));
    assert_eq!(children[1].borrow().bit_offset, Some(0));
    assert_eq!(children[1].borrow().bit_size, Some(5));
}

#[test]
fn pointer_materializes_pointee_at_target_address() {
    // byte 0 is the pointer (u8, value 2); the pointee `T` sits at offset 2.
    let rt = run("struct T { char data; }; T *p : u8 @ 0x00;", &[0x02, 0x00, 0x41]);
    let pointer = find(rt.patterns(), "p");
    assert_eq!(pointer.borrow().offset, 0);
    assert_eq!(pointer.borrow().size, 1);
    match &pointer.borrow().variant {
        Variant::Pointer { pointee, .. } => {
            assert_eq!(pointee.borrow().offset, 2);
            let data = pointee.children();
            assert_eq!(data.len(), 1);
            assert_eq!(data[0].borrow().offset, 2);
        }
        other => panic!("expected a pointer variant, got {other:?}"),
    }
}

#[test]
fn conditional_member_only_materializes_when_tag_matches() {
    let rt = run(
        "struct H { u8 tag; if (tag == 1) u32 v; }; H h @ 0x00;",
        &[0x01, 0x10, 0x00, 0x00, 0x00],
    );
    let h = find(rt.patterns(), "h");
    assert_eq!(h.borrow().size, 5);
    let children = h.children();
    assert_eq!(children.len(), 2);
    assert_eq!(children[1].borrow().variable_name, "v");
}

#[test]
fn conditional_member_is_skipped_when_tag_does_not_match() {
    let rt = run("struct H { u8 tag; if (tag == 1) u32 v; }; H h @ 0x00;", &[0x02]);
    let h = find(rt.patterns(), "h");
    assert_eq!(h.borrow().size, 1);
    assert_eq!(h.children().len(), 1);
}

#[test]
fn match_statement_falls_through_to_default_arm() {
    let rt = run(
        "u8 x @ 0; match(x) { (1): u8 a @ 1; (2): u16 b @ 1; (_): padding c @ 1; };",
        &[0x03, 0x00],
    );
    let names: Vec<String> = rt.patterns().iter().map(|p| p.borrow().variable_name.clone()).collect();
    assert!(names.contains(&"c".to_string()), "expected default arm `c`, got {names:?}");
    assert!(!names.contains(&"a".to_string()));
    assert!(!names.contains(&"b".to_string()));
}

#[test]
fn user_function_return_value_is_exported_through_out_variable() {
    let rt = run("fn main() { return 42; } out u32 r; r = main();", &[]);
    assert_eq!(rt.out_variables().get("r"), Some(&Literal::Unsigned(42)));
}
