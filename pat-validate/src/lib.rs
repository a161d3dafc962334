//! Walks the parser's output enforcing the structural checks that must hold
//! before evaluation: no redefinitions, no duplicate enum entries, no
//! cyclic value-type references, and a bounded recursion depth along
//! non-cyclic type reference chains.

pub mod error;

use ahash::AHashMap;
use pat_diagnostics::Diagnostic;
use pat_parser::{Kind, Node, ParseOutput};

pub use error::Error;

/// Default recursion bound along type references; overridden by
/// `#pragma eval_depth` at the runtime layer and threaded in here.
pub const DEFAULT_RECURSION_LIMIT: u32 = 32;

pub struct Validator<'a> {
    types: &'a AHashMap<String, Node>,
    recursion_limit: u32,
    diagnostics: Vec<Diagnostic>,
}

/// Validates a parse output, returning the (still owned) output unchanged
/// on success or the accumulated diagnostics on failure.
pub fn validate(output: ParseOutput, recursion_limit: u32) -> Result<ParseOutput, Vec<Diagnostic>> {
    let diagnostics = Validator::new(&output.types, recursion_limit).run(&output.statements);
    if diagnostics.is_empty() {
        Ok(output)
    } else {
        log::debug!("validation failed with {} diagnostics", diagnostics.len());
        Err(diagnostics)
    }
}

impl<'a> Validator<'a> {
    pub fn new(types: &'a AHashMap<String, Node>, recursion_limit: u32) -> Self {
        Self { types, recursion_limit, diagnostics: Vec::new() }
    }

    pub fn run(mut self, statements: &[Node]) -> Vec<Diagnostic> {
        self.check_top_level_redefinitions(statements);
        for node in statements {
            self.check_node(node);
        }
        for (name, node) in self.types.iter() {
            self.check_recursion(name, node, &mut Vec::new());
        }
        self.diagnostics
    }

    /// Top-level name collisions the parser's type table doesn't already
    /// cover: function and `using` declarations share the same namespace as
    /// types, so `fn foo` and `struct foo` collide too.
    fn check_top_level_redefinitions(&mut self, statements: &[Node]) {
        let mut seen: AHashMap<String, pat_diagnostics::Location> = AHashMap::new();
        for node in statements {
            let name = match &*node.kind {
                Kind::FunctionDefinition { name, .. } => Some(name.clone()),
                Kind::TypeDecl { name, .. } => Some(name.to_string()),
                Kind::Using { name, .. } => Some(name.to_string()),
                _ => None,
            };
            let Some(name) = name else { continue };
            if let Some(&first) = seen.get(&name) {
                self.diagnostics.push(
                    Error::Redefinition { name: name.clone(), location: node.location, first }.into_diagnostic(),
                );
            } else {
                seen.insert(name, node.location);
            }
        }
    }

    fn check_node(&mut self, node: &Node) {
        match &*node.kind {
            Kind::Enum { entries, .. } => self.check_enum_entries(entries),
            Kind::TypeDecl { body, .. } => self.check_node(body),
            Kind::Struct { members, .. } | Kind::Union { members, .. } | Kind::Bitfield { members, .. } => {
                for member in members {
                    self.check_node(member);
                }
            }
            Kind::Namespace { body, .. } => {
                for stmt in body {
                    self.check_node(stmt);
                }
            }
            Kind::FunctionDefinition { body, .. } => {
                for stmt in body {
                    self.check_node(stmt);
                }
            }
            Kind::ConditionalStatement { then_branch, else_branch, .. } => {
                for stmt in then_branch.iter().chain(else_branch.iter()) {
                    self.check_node(stmt);
                }
            }
            Kind::WhileStatement { body, .. } => {
                for stmt in body {
                    self.check_node(stmt);
                }
            }
            Kind::MatchStatement { cases, default, .. } => {
                for (_, body) in cases {
                    for stmt in body {
                        self.check_node(stmt);
                    }
                }
                if let Some(body) = default {
                    for stmt in body {
                        self.check_node(stmt);
                    }
                }
            }
            Kind::TryCatchStatement { try_body, catch_body } => {
                for stmt in try_body.iter().chain(catch_body.iter()) {
                    self.check_node(stmt);
                }
            }
            Kind::CompoundStatement(stmts) | Kind::MultiVariableDecl(stmts) => {
                for stmt in stmts {
                    self.check_node(stmt);
                }
            }
            _ => {}
        }
    }

    fn check_enum_entries(&mut self, entries: &[(ustr::Ustr, Option<Node>)]) {
        let mut seen: AHashMap<ustr::Ustr, pat_diagnostics::Location> = AHashMap::new();
        for (name, value) in entries {
            let location = value.as_ref().map(|v| v.location).unwrap_or_default();
            if let Some(&first) = seen.get(name) {
                self.diagnostics.push(
                    Error::DuplicateEnumEntry { name: name.to_string(), location, first }.into_diagnostic(),
                );
            } else {
                seen.insert(*name, location);
            }
        }
    }

    /// Follows `ImportedType`/`TypeApplication` chains through the type
    /// table, failing on the first already-visited (cyclic) type and on any
    /// chain that exceeds `recursion_limit` without cycling. Cycle
    /// membership is checked before the depth bound: a direct or short
    /// mutual cycle closes long before a generous `recursion_limit` would
    /// ever trip, and it is always invalid regardless of how long the
    /// chain leading to it was.
    fn check_recursion(&mut self, name: &str, node: &Node, visiting: &mut Vec<String>) {
        if visiting.iter().any(|n| n == name) {
            self.diagnostics.push(
                Error::CyclicTypeReference { name: name.to_string(), location: node.location }.into_diagnostic(),
            );
            return;
        }
        if visiting.len() as u32 > self.recursion_limit {
            self.diagnostics.push(
                Error::RecursionLimit { limit: self.recursion_limit, location: node.location }.into_diagnostic(),
            );
            return;
        }
        visiting.push(name.to_string());
        self.walk_type_refs(node, visiting);
        visiting.pop();
    }

    fn walk_type_refs(&mut self, node: &Node, visiting: &mut Vec<String>) {
        match &*node.kind {
            Kind::TypeDecl { body, .. } => self.walk_type_refs(body, visiting),
            Kind::Struct { members, inherits, .. } => {
                for member in members.iter().chain(inherits.iter()) {
                    self.follow_member_type(member, visiting);
                }
            }
            Kind::Union { members, .. } | Kind::Bitfield { members, .. } => {
                for member in members {
                    self.follow_member_type(member, visiting);
                }
            }
            Kind::Using { target, .. } => self.follow_type_ref(target, visiting),
            Kind::ImportedType { name } => self.follow_named(name, node, visiting),
            Kind::TypeApplication { type_, .. } => self.follow_type_ref(type_, visiting),
            _ => {}
        }
    }

    /// `PointerVariableDecl` deliberately does not feed its pointee type
    /// into the cycle graph: a pointer's own size comes from its
    /// `size_type`, not its pointee, so a self-referential pointer (a
    /// linked list's `Node *next`) is not a static-size cycle. Runaway
    /// pointer chains are instead bounded at evaluation time by
    /// `pat-eval`'s instantiation-depth counter.
    fn follow_member_type(&mut self, member: &Node, visiting: &mut Vec<String>) {
        match &*member.kind {
            Kind::VariableDecl { type_, .. } | Kind::ArrayVariableDecl { type_, .. } => self.follow_type_ref(type_, visiting),
            _ => {}
        }
    }

    fn follow_type_ref(&mut self, type_ref: &Node, visiting: &mut Vec<String>) {
        match &*type_ref.kind {
            Kind::ImportedType { name } => self.follow_named(name, type_ref, visiting),
            Kind::TypeApplication { type_, .. } => self.follow_type_ref(type_, visiting),
            _ => {}
        }
    }

    fn follow_named(&mut self, name: &str, site: &Node, visiting: &mut Vec<String>) {
        if let Some(target) = self.types.get(name) {
            if visiting.iter().any(|n| n == name) {
                self.diagnostics.push(
                    Error::CyclicTypeReference { name: name.to_string(), location: site.location }.into_diagnostic(),
                );
                return;
            }
            if visiting.len() as u32 + 1 > self.recursion_limit {
                self.diagnostics.push(
                    Error::RecursionLimit { limit: self.recursion_limit, location: site.location }.into_diagnostic(),
                );
                return;
            }
            visiting.push(name.to_string());
            self.walk_type_refs(target, visiting);
            visiting.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ParseOutput {
        let (tokens, lex_errors) = pat_lexer::lex(1u32, src);
        assert!(lex_errors.is_empty());
        pat_parser::parse(tokens).expect("clean parse")
    }

    #[test]
    fn accepts_well_formed_program() {
        let out = parse("struct A { u8 x; }; struct B { A a; };");
        assert!(validate(out, DEFAULT_RECURSION_LIMIT).is_ok());
    }

    #[test]
    fn rejects_duplicate_enum_entries() {
        let out = parse("enum E : u8 { A = 0, A = 1 };");
        let err = validate(out, DEFAULT_RECURSION_LIMIT).expect_err("expected duplicate entry diagnostic");
        assert!(err.iter().any(|d| d.code_str() == "V0002"));
    }

    #[test]
    fn rejects_recursive_type_reference_past_limit() {
        // A chain that self-references three levels deep; an eval_depth of
        // 2 must fail it.
        let out = parse("struct A { B b; }; struct B { C c; }; struct C { A a; };");
        let err = validate(out, 2).expect_err("expected recursion diagnostic");
        assert!(err.iter().any(|d| d.code_str() == "V0003"));
    }

    #[test]
    fn rejects_direct_self_reference_even_at_the_default_limit() {
        let out = parse("struct A { A a; };");
        let err = validate(out, DEFAULT_RECURSION_LIMIT).expect_err("expected cyclic type diagnostic");
        assert!(err.iter().any(|d| d.code_str() == "V0003"));
    }

    #[test]
    fn rejects_short_mutual_cycle_even_at_the_default_limit() {
        let out = parse("struct A { B b; }; struct B { A a; };");
        let err = validate(out, DEFAULT_RECURSION_LIMIT).expect_err("expected cyclic type diagnostic");
        assert!(err.iter().any(|d| d.code_str() == "V0003"));
    }

    #[test]
    fn accepts_self_referential_pointer() {
        // A linked-list node: the pointee type is the struct itself, but a
        // pointer's size comes from its size type, not its pointee, so this
        // is not a static-size cycle.
        let out = parse("struct Node { u32 value; Node *next : u32; };");
        assert!(validate(out, DEFAULT_RECURSION_LIMIT).is_ok());
    }

    #[test]
    fn rejects_function_and_type_name_collision() {
        let out = parse("struct dup {}; fn dup() {};");
        let err = validate(out, DEFAULT_RECURSION_LIMIT).expect_err("expected redefinition diagnostic");
        assert!(err.iter().any(|d| d.code_str() == "V0002"));
    }
}
