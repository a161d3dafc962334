//! Facade-level checks for behaviors that are easy to regress silently:
//! a `#error` directive failing the run, `#pragma once` deduplicating a
//! repeated `#include`, an `eval_depth` pragma tightening the recursion
//! limit enforced by validation, and the main data section refusing writes.

use std::io::Write;

use ahash::AHashMap;
use pat::Runtime;

#[test]
fn error_directive_fails_the_run_with_user_error_code() {
    let mut rt = Runtime::new();
    rt.set_data_source(Vec::new());
    let ok = rt.execute_string("#error \"not supported on this target\"", AHashMap::new(), AHashMap::new());
    assert!(!ok);
    assert_eq!(rt.error().unwrap().diagnostic().code_str(), "M0004");
}

#[test]
fn pragma_once_deduplicates_a_repeated_include() {
    let dir = std::env::temp_dir().join(format!("pat-rt-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let shared_path = dir.join("shared.pat");
    std::fs::File::create(&shared_path)
        .unwrap()
        .write_all(b"#pragma once\nstruct Shared { u8 x; };")
        .unwrap();

    let mut rt = Runtime::new();
    rt.set_data_source(vec![0x00]);
    rt.set_include_paths(vec![dir.clone()]);
    let ok = rt.execute_string(
        "#include \"shared\"\n#include \"shared\"\nShared s @ 0x00;",
        AHashMap::new(),
        AHashMap::new(),
    );
    assert!(ok, "execution failed: {:?}", rt.error());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn eval_depth_pragma_rejects_a_type_that_recurses_past_the_limit() {
    let mut rt = Runtime::new();
    rt.set_data_source(Vec::new());
    let ok = rt.execute_string(
        "#pragma eval_depth 2\nstruct A { B b; }; struct B { C c; }; struct C { A a; };",
        AHashMap::new(),
        AHashMap::new(),
    );
    assert!(!ok);
    assert_eq!(rt.error().unwrap().diagnostic().code_str(), "V0003");
}

#[test]
fn writing_to_the_main_data_section_is_refused() {
    let mut rt = Runtime::new();
    rt.set_data_source(vec![0x05]);
    let ok = rt.execute_string("u8 x @ 0x00; x = 9;", AHashMap::new(), AHashMap::new());
    assert!(!ok);
    assert_eq!(rt.error().unwrap().diagnostic().code_str(), "E0011");
}
