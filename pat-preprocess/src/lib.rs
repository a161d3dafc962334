//! Directive expansion, conditional compilation, and include splicing over
//! a lexed token stream. Lexes each source exactly once, then operates
//! purely on tokens.

pub mod error;

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use pat_diagnostics::{Diagnostic, Location, SourceId};
use pat_lexer::token::{Token, TokenKind};
use pat_source::{Resolver, Source};
use ustr::Ustr;

pub use error::Error;

/// A recorded `#pragma key value`, handed to the runtime's pragma handlers
/// after preprocessing completes.
#[derive(Debug, Clone, PartialEq)]
pub struct PragmaDirective {
    pub key: String,
    pub value: String,
    pub location: Location,
}

#[derive(Debug, Default)]
pub struct Output {
    pub tokens: Vec<Token>,
    pub pragmas: Vec<PragmaDirective>,
    /// Token locations that fell inside a false `#ifdef`/`#ifndef` block,
    /// forwarded to IDE tooling so it can grey them out.
    pub excluded: Vec<Location>,
}

const MAX_INCLUDE_DEPTH: u32 = 128;

pub struct Preprocessor<'r> {
    resolver: &'r mut Resolver,
    defines: AHashMap<Ustr, Vec<Token>>,
    once_sources: AHashSet<SourceId>,
    pragmas: Vec<PragmaDirective>,
    excluded: Vec<Location>,
    diagnostics: Vec<Diagnostic>,
    depth: u32,
}

impl<'r> Preprocessor<'r> {
    pub fn new(resolver: &'r mut Resolver) -> Self {
        Self {
            resolver,
            defines: AHashMap::new(),
            once_sources: AHashSet::new(),
            pragmas: Vec::new(),
            excluded: Vec::new(),
            diagnostics: Vec::new(),
            depth: 0,
        }
    }

    /// Mirrors the embedding API's `add_define(name[, value])`.
    pub fn add_define(&mut self, name: &str, value: &str) {
        let (tokens, _) = pat_lexer::lex(pat_diagnostics::EMPTY_SOURCE, value);
        let tokens: Vec<Token> = tokens.into_iter().filter(|t| !t.is_eof()).collect();
        self.defines.insert(Ustr::from(name), tokens);
    }

    pub fn run(mut self, source: Arc<Source>) -> Result<Output, Vec<Diagnostic>> {
        let tokens = self.process_source(&source);
        log::trace!("preprocessed {} into {} tokens", source.name(), tokens.len());
        if self.diagnostics.is_empty() {
            Ok(Output { tokens, pragmas: self.pragmas, excluded: self.excluded })
        } else {
            Err(self.diagnostics)
        }
    }

    fn process_source(&mut self, source: &Arc<Source>) -> Vec<Token> {
        let (tokens, lex_errors) = pat_lexer::lex(source.id(), source.content());
        for e in lex_errors {
            self.diagnostics.push(error::lexer_diagnostic(e));
        }
        self.process_tokens(source, &tokens)
    }

    fn process_tokens(&mut self, source: &Arc<Source>, tokens: &[Token]) -> Vec<Token> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut cond_stack: Vec<bool> = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let tok = &tokens[i];
            if tok.is_eof() {
                break;
            }

            let line_start = i == 0 || tokens[i - 1].location.line != tok.location.line;

            if matches!(tok.kind, TokenKind::Directive(_)) && line_start {
                i = self.handle_directive(source, tokens, i, &mut cond_stack, &mut out);
                continue;
            }

            let active = cond_stack.iter().all(|&b| b);
            if !active {
                self.excluded.push(tok.location);
                i += 1;
                continue;
            }

            if let TokenKind::Identifier(name) = &tok.kind {
                if let Some(expansion) = self.defines.get(name) {
                    out.extend(expansion.iter().cloned());
                    i += 1;
                    continue;
                }
            }

            out.push(tok.clone());
            i += 1;
        }

        out
    }

    fn handle_directive(
        &mut self,
        source: &Arc<Source>,
        tokens: &[Token],
        i: usize,
        cond_stack: &mut Vec<bool>,
        out: &mut Vec<Token>,
    ) -> usize {
        let name = match &tokens[i].kind {
            TokenKind::Directive(n) => *n,
            _ => unreachable!(),
        };
        let directive_loc = tokens[i].location;
        let end = line_end(tokens, i);
        let args = &tokens[i + 1..end];
        let active = cond_stack.iter().all(|&b| b);

        match name.as_str() {
            "ifdef" => {
                let defined = ident_arg(args).map(|n| self.defines.contains_key(&n)).unwrap_or(false);
                cond_stack.push(defined);
            }
            "ifndef" => {
                let defined = ident_arg(args).map(|n| self.defines.contains_key(&n)).unwrap_or(false);
                cond_stack.push(!defined);
            }
            "endif" => {
                cond_stack.pop();
            }
            "define" if active => {
                if let Some(def_name) = ident_arg(args) {
                    let value = args.get(1..).unwrap_or(&[]).to_vec();
                    self.defines.insert(def_name, value);
                }
            }
            "undef" if active => {
                if let Some(def_name) = ident_arg(args) {
                    self.defines.remove(&def_name);
                }
            }
            "pragma" if active => {
                if let Some(key) = ident_arg(args) {
                    let value = raw_text(source.content(), args.get(1..).unwrap_or(&[]));
                    if key.as_str() == "once" {
                        self.once_sources.insert(source.id());
                    }
                    self.pragmas.push(PragmaDirective { key: key.to_string(), value, location: directive_loc });
                }
            }
            "include" if active => {
                let raw = raw_text(source.content(), args);
                let path = strip_delims(&raw);
                match self.resolver.resolve(&path) {
                    Ok(included) => {
                        if !self.once_sources.contains(&included.id()) {
                            self.depth += 1;
                            if self.depth > MAX_INCLUDE_DEPTH {
                                self.diagnostics.push(
                                    Error::IncludeNotFound {
                                        path: path.clone(),
                                        location: directive_loc,
                                        reason: "include depth exceeded".into(),
                                    }
                                    .into_diagnostic(),
                                );
                            } else {
                                let spliced = self.process_source(&included);
                                out.extend(spliced);
                            }
                            self.depth -= 1;
                        }
                    }
                    Err(err) => {
                        self.diagnostics.push(
                            Error::IncludeNotFound { path, location: directive_loc, reason: err.to_string() }
                                .into_diagnostic(),
                        );
                    }
                }
            }
            "error" if active => {
                let message = raw_text(source.content(), args);
                self.diagnostics.push(Error::UserError { message, location: directive_loc }.into_diagnostic());
            }
            _ if active => {
                self.diagnostics
                    .push(Error::UnknownDirective { name: name.to_string(), location: directive_loc }.into_diagnostic());
            }
            _ => {}
        }

        end
    }
}

fn line_end(tokens: &[Token], from: usize) -> usize {
    let line = tokens[from].location.line;
    let mut j = from + 1;
    while j < tokens.len() && !tokens[j].is_eof() && tokens[j].location.line == line {
        j += 1;
    }
    j
}

fn ident_arg(args: &[Token]) -> Option<Ustr> {
    match args.first().map(|t| &t.kind) {
        Some(TokenKind::Identifier(name)) => Some(*name),
        _ => None,
    }
}

fn raw_text(content: &str, args: &[Token]) -> String {
    let Some(first) = args.first() else { return String::new() };
    let last = args.last().unwrap();
    let line_no = first.location.line;
    let line = content.lines().nth((line_no - 1) as usize).unwrap_or("");
    let chars: Vec<char> = line.chars().collect();
    let start_col = (first.location.column - 1) as usize;
    let end_col = ((last.location.column - 1) + last.location.length) as usize;
    let end_col = end_col.min(chars.len());
    if start_col >= end_col {
        return String::new();
    }
    chars[start_col..end_col].iter().collect::<String>().trim().to_string()
}

fn strip_delims(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (open, close) = (bytes[0], bytes[bytes.len() - 1]);
        if (open == b'"' && close == b'"') || (open == b'<' && close == b'>') {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> Result<Output, Vec<Diagnostic>> {
        let mut resolver = Resolver::new();
        let source = resolver.add_virtual(src, "test");
        Preprocessor::new(&mut resolver).run(source)
    }

    fn non_eof_count(tokens: &[Token]) -> usize {
        tokens.iter().filter(|t| !t.is_eof()).count()
    }

    #[test]
    fn passes_through_plain_tokens() {
        let out = run("struct P { u8 a; };").unwrap();
        assert_eq!(non_eof_count(&out.tokens), 8);
    }

    #[test]
    fn expands_define() {
        let out = run("#define SIZE 4\nu8 a[SIZE];").unwrap();
        let kinds: Vec<_> = out.tokens.iter().map(|t| &t.kind).collect();
        assert!(kinds.iter().any(|k| matches!(k, TokenKind::Integer(4, _))));
    }

    #[test]
    fn ifndef_false_branch_is_excluded() {
        let out = run("#define X\n#ifndef X\nu8 a;\n#endif\nu16 b;").unwrap();
        // only the `u16 b;` statement (3 tokens incl. `;`) should survive
        assert_eq!(non_eof_count(&out.tokens), 3);
        assert!(!out.excluded.is_empty());
    }

    #[test]
    fn pragma_once_on_include_is_recorded_and_deduplicated() {
        let mut resolver = Resolver::new();
        resolver.add_virtual("#pragma once\nstruct Shared {};", "shared");
        let main = resolver.add_virtual("#include \"shared\"\n#include \"shared\"\nu8 a;", "main");
        let out = Preprocessor::new(&mut resolver).run(main).unwrap();
        // `struct Shared {};` tokens should appear exactly once, plus `u8 a;`
        assert_eq!(non_eof_count(&out.tokens), 8);
    }

    #[test]
    fn error_directive_produces_diagnostic() {
        let err = run("#error \"boom\"").unwrap_err();
        assert_eq!(err[0].code, 4);
    }

    #[test]
    fn unknown_directive_is_reported() {
        let err = run("#bogus foo").unwrap_err();
        assert_eq!(err[0].code, 1);
    }
}
