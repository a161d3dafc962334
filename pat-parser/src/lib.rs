//! Recursive-descent parser: tokens to AST, with a parser-owned type table
//! and template parameter handling.

pub mod ast;
pub mod error;

use ahash::AHashMap;
use pat_diagnostics::{Diagnostic, Location};
use pat_lexer::token::{Keyword, Operator, Separator, Token, TokenKind, ValueType};
use pat_tree::Endian;
use ustr::Ustr;

pub use ast::{
    Attribute, AstBitfieldFieldKind, ControlFlowKind, IoQualifier, Kind, Node, Param, PathSegment, TemplateParameter,
    TypeOperatorKind,
};
pub use error::Error;

/// A registered type declaration, tracking whether it is still a forward
/// declaration awaiting its body.
struct TypeEntry {
    node: Node,
    forward: bool,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    types: AHashMap<String, TypeEntry>,
    namespace_stack: Vec<Ustr>,
    import_aliases: Vec<(Ustr, Vec<Ustr>)>,
    diagnostics: Vec<Diagnostic>,
    pending_doc: Option<String>,
}

pub struct ParseOutput {
    pub statements: Vec<Node>,
    pub types: AHashMap<String, Node>,
}

/// Parses a full token stream, returning the top-level statements and the
/// fully qualified type table even when errors occurred: an unrecoverable
/// failure returns the errors accumulated so far.
pub fn parse(tokens: Vec<Token>) -> Result<ParseOutput, Vec<Diagnostic>> {
    log::trace!("parsing {} tokens", tokens.len());
    let mut parser = Parser::new(tokens);
    let statements = parser.parse_program();
    if parser.diagnostics.is_empty() {
        let types = parser.types.into_iter().map(|(k, v)| (k, v.node)).collect();
        Ok(ParseOutput { statements, types })
    } else {
        log::debug!("parse failed with {} diagnostics", parser.diagnostics.len());
        Err(parser.diagnostics)
    }
}

type PResult<T> = Result<T, Error>;

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            types: AHashMap::new(),
            namespace_stack: Vec::new(),
            import_aliases: Vec::new(),
            diagnostics: Vec::new(),
            pending_doc: None,
        }
    }

    // --- cursor ---------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn at_end(&self) -> bool {
        self.peek().is_eof()
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !tok.is_eof() {
            self.pos += 1;
        }
        tok
    }

    /// `begin`/`reset`: save and restore the cursor around a speculative
    /// alternative.
    fn begin(&self) -> usize {
        self.pos
    }

    fn reset(&mut self, mark: usize) {
        self.pos = mark;
    }

    /// `partBegin`/`partReset`: save and restore the cursor around a
    /// bounded look-ahead that doesn't commit to an alternative.
    fn part_begin(&self) -> usize {
        self.pos
    }

    fn part_reset(&mut self, mark: usize) {
        self.pos = mark;
    }

    fn is_kw(&self, kw: Keyword) -> bool {
        matches!(self.peek().kind, TokenKind::Keyword(k) if k == kw)
    }

    fn is_op(&self, op: Operator) -> bool {
        matches!(self.peek().kind, TokenKind::Operator(o) if o == op)
    }

    fn is_sep(&self, sep: Separator) -> bool {
        matches!(self.peek().kind, TokenKind::Separator(s) if s == sep)
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.is_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: Operator) -> bool {
        if self.is_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_sep(&mut self, sep: Separator) -> bool {
        if self.is_sep(sep) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sep(&mut self, sep: Separator, ctx: &'static str) -> PResult<Token> {
        if self.is_sep(sep) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(ctx))
        }
    }

    fn expect_op(&mut self, op: Operator, ctx: &'static str) -> PResult<Token> {
        if self.is_op(op) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(ctx))
        }
    }

    fn expect_ident(&mut self, ctx: &'static str) -> PResult<(Ustr, Location)> {
        if let TokenKind::Identifier(name) = self.peek().kind {
            let loc = self.peek().location;
            self.advance();
            Ok((name, loc))
        } else {
            Err(self.unexpected(ctx))
        }
    }

    fn unexpected(&self, expected: &'static str) -> Error {
        if self.at_end() {
            Error::UnexpectedEof { expected: expected.to_string(), location: self.peek().location }
        } else {
            Error::UnexpectedToken { expected: expected.to_string(), location: self.peek().location }
        }
    }

    /// Skips comment/doc-comment tokens, remembering the most recent
    /// doc-comment text for the next declaration.
    fn skip_trivia(&mut self) {
        loop {
            match &self.peek().kind {
                TokenKind::Comment(_) => {
                    self.advance();
                }
                TokenKind::DocComment { text, .. } => {
                    self.pending_doc = Some(text.clone());
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn take_doc(&mut self) -> Option<String> {
        self.pending_doc.take()
    }

    fn recover_to_statement_boundary(&mut self) {
        while !self.at_end() {
            if self.is_sep(Separator::Semi) {
                self.advance();
                return;
            }
            if self.is_sep(Separator::RBrace) {
                return;
            }
            self.advance();
        }
    }

    fn qualify(&self, name: Ustr) -> String {
        if self.namespace_stack.is_empty() {
            name.to_string()
        } else {
            let prefix = self.namespace_stack.iter().map(|u| u.as_str()).collect::<Vec<_>>().join("::");
            format!("{prefix}::{name}")
        }
    }

    fn register_type(&mut self, qualified: String, node: Node, forward: bool) {
        match self.types.get(&qualified) {
            Some(existing) if !existing.forward && !forward => {
                self.diagnostics.push(
                    Error::TypeRedefinition { name: qualified, location: node.location, first: existing.node.location }
                        .into_diagnostic(),
                );
            }
            _ => {
                self.types.insert(qualified, TypeEntry { node, forward });
            }
        }
    }

    // --- program ---------------------------------------------------------

    fn parse_program(&mut self) -> Vec<Node> {
        let mut statements = Vec::new();
        loop {
            self.skip_trivia();
            if self.at_end() {
                break;
            }
            match self.parse_statement() {
                Ok(Some(node)) => statements.push(node),
                Ok(None) => {}
                Err(_) => {
                    // diagnostic already recorded by caller; resynchronize
                    self.recover_to_statement_boundary();
                }
            }
        }
        statements
    }

    fn parse_block(&mut self) -> Vec<Node> {
        let mut statements = Vec::new();
        if self.expect_sep(Separator::LBrace, "`{`").is_err() {
            self.fail_current("`{`");
            return statements;
        }
        loop {
            self.skip_trivia();
            if self.is_sep(Separator::RBrace) || self.at_end() {
                break;
            }
            match self.parse_statement() {
                Ok(Some(node)) => statements.push(node),
                Ok(None) => {}
                Err(_) => self.recover_to_statement_boundary(),
            }
        }
        self.eat_sep(Separator::RBrace);
        statements
    }

    fn fail_current(&mut self, expected: &'static str) {
        let err = self.unexpected(expected);
        self.diagnostics.push(err.into_diagnostic());
    }

    fn fail(&mut self, err: Error) {
        self.diagnostics.push(err.into_diagnostic());
    }

    // --- statements --------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Option<Node>> {
        self.skip_trivia();
        let doc = self.take_doc();

        if self.eat_sep(Separator::Semi) {
            return Ok(None);
        }

        let node = if self.is_kw(Keyword::Struct) {
            self.parse_struct_or_union(true)?
        } else if self.is_kw(Keyword::Union) {
            self.parse_struct_or_union(false)?
        } else if self.is_kw(Keyword::Enum) {
            self.parse_enum()?
        } else if self.is_kw(Keyword::Bitfield) {
            self.parse_bitfield()?
        } else if self.is_kw(Keyword::Using) {
            self.parse_using()?
        } else if self.is_kw(Keyword::Fn) {
            self.parse_function()?
        } else if self.is_kw(Keyword::Namespace) {
            self.parse_namespace()?
        } else if self.is_kw(Keyword::Import) {
            self.parse_import()?
        } else if self.is_kw(Keyword::If) {
            self.parse_if()?
        } else if self.is_kw(Keyword::While) {
            self.parse_while()?
        } else if self.is_kw(Keyword::For) {
            self.parse_for()?
        } else if self.is_kw(Keyword::Match) {
            self.parse_match()?
        } else if self.is_kw(Keyword::Try) {
            self.parse_try()?
        } else if self.is_kw(Keyword::Break) {
            let loc = self.advance().location;
            self.expect_sep(Separator::Semi, "`;`")?;
            Node::new(loc, Kind::ControlFlowStatement { kind: ControlFlowKind::Break, value: None })
        } else if self.is_kw(Keyword::Continue) {
            let loc = self.advance().location;
            self.expect_sep(Separator::Semi, "`;`")?;
            Node::new(loc, Kind::ControlFlowStatement { kind: ControlFlowKind::Continue, value: None })
        } else if self.is_kw(Keyword::Return) {
            let loc = self.advance().location;
            let value = if self.is_sep(Separator::Semi) { None } else { Some(self.parse_expression()?) };
            self.expect_sep(Separator::Semi, "`;`")?;
            Node::new(loc, Kind::ControlFlowStatement { kind: ControlFlowKind::Return, value })
        } else if self.is_kw(Keyword::In) || self.is_kw(Keyword::Out) {
            self.parse_variable_decl_like()?
        } else if self.looks_like_type_start() {
            self.parse_variable_decl_like()?
        } else {
            let expr = self.parse_expression()?;
            let node = if self.eat_op(Operator::Assign) {
                let rhs = self.parse_expression()?;
                self.assignment_from(expr, rhs)?
            } else {
                expr
            };
            self.expect_sep(Separator::Semi, "`;`")?;
            node
        };

        Ok(Some(node.with_doc(doc)))
    }

    fn assignment_from(&mut self, lhs: Node, rhs: Node) -> PResult<Node> {
        let loc = lhs.location.merge(&rhs.location);
        match *lhs.kind {
            Kind::RValue(path) => Ok(Node::new(loc, Kind::LValueAssignment { path, value: rhs })),
            _ => Err(Error::UnexpectedToken { expected: "assignable expression".into(), location: loc }),
        }
    }

    /// Looks for a type-reference start: a value type keyword, `be`/`le`
    /// endian modifier, or an identifier not immediately followed by `=`
    /// or `(` (which would make it a bare expression/function-call
    /// statement instead).
    fn looks_like_type_start(&self) -> bool {
        match &self.peek().kind {
            TokenKind::ValueType(_) => true,
            TokenKind::Keyword(Keyword::Be) | TokenKind::Keyword(Keyword::Le) => true,
            TokenKind::Keyword(Keyword::Unsigned) | TokenKind::Keyword(Keyword::Signed) => true,
            TokenKind::Identifier(_) => {
                matches!(self.peek_at(1).kind, TokenKind::Identifier(_))
            }
            _ => false,
        }
    }

    // --- attributes --------------------------------------------------------

    /// Trailing `[[name(args), name2]]`, as written after a declaration and
    /// before its terminating `;`. Returns an empty list when none is
    /// present (attributes are always optional).
    fn parse_trailing_attributes(&mut self) -> PResult<Vec<Attribute>> {
        let mut attrs = Vec::new();
        if !self.eat_sep(Separator::LBracket) {
            return Ok(attrs);
        }
        if !self.eat_sep(Separator::LBracket) {
            // single `[` wasn't an attribute opener; this shouldn't happen
            // in a trailing-attribute position, but bail out gracefully.
            return Ok(attrs);
        }
        loop {
            let (name, loc) = self.expect_ident("attribute name")?;
            let mut args = Vec::new();
            if self.eat_sep(Separator::LParen) {
                if !self.is_sep(Separator::RParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.eat_sep(Separator::Comma) {
                            break;
                        }
                    }
                }
                self.expect_sep(Separator::RParen, "`)`")?;
            }
            attrs.push(Attribute { name, args, location: loc });
            if !self.eat_sep(Separator::Comma) {
                break;
            }
        }
        self.eat_sep(Separator::RBracket);
        self.eat_sep(Separator::RBracket);
        Ok(attrs)
    }

    // --- template parameters -------------------------------------------

    /// `<auto T, u32 N = 4>` following a type name in a declaration.
    fn parse_template_params(&mut self) -> PResult<Vec<TemplateParameter>> {
        let mut params = Vec::new();
        if !self.eat_op(Operator::Lt) {
            return Ok(params);
        }
        if !self.is_op(Operator::Gt) {
            loop {
                let is_type = self.eat_kw(Keyword::Using) || self.eat_ident_text("auto");
                let (name, _) = self.expect_ident("template parameter name")?;
                let default = if self.eat_op(Operator::Assign) { Some(self.parse_expression()?) } else { None };
                params.push(TemplateParameter { name, is_type, default });
                if !self.eat_sep(Separator::Comma) {
                    break;
                }
            }
        }
        self.expect_op(Operator::Gt, "`>`")?;
        Ok(params)
    }

    /// Consumes an identifier token only if its text matches `text`
    /// exactly (used for the contextual `auto` template-parameter marker,
    /// which is not a reserved keyword).
    fn eat_ident_text(&mut self, text: &str) -> bool {
        if let TokenKind::Identifier(name) = self.peek().kind {
            if name.as_str() == text {
                self.advance();
                return true;
            }
        }
        false
    }

    fn parse_template_args(&mut self) -> PResult<Vec<Node>> {
        let mut args = Vec::new();
        if !self.eat_op(Operator::Lt) {
            return Ok(args);
        }
        if !self.is_op(Operator::Gt) {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat_sep(Separator::Comma) {
                    break;
                }
            }
        }
        self.expect_op(Operator::Gt, "`>`")?;
        Ok(args)
    }

    // --- type references -------------------------------------------------

    fn parse_scoped_name(&mut self) -> PResult<(Vec<Ustr>, Location)> {
        let (first, mut loc) = self.expect_ident("identifier")?;
        let mut path = vec![first];
        while self.is_op(Operator::ScopeRes) {
            self.advance();
            let (next, next_loc) = self.expect_ident("identifier after `::`")?;
            path.push(next);
            loc = loc.merge(&next_loc);
        }
        Ok((path, loc))
    }

    fn parse_type_ref(&mut self) -> PResult<Node> {
        let start_loc = self.peek().location;
        let endian = if self.eat_kw(Keyword::Be) {
            Some(Endian::Big)
        } else if self.eat_kw(Keyword::Le) {
            Some(Endian::Little)
        } else {
            None
        };

        let base = if let TokenKind::ValueType(vt) = self.peek().kind {
            let loc = self.peek().location;
            self.advance();
            Node::new(loc, Kind::BuiltinType(vt))
        } else if self.eat_kw(Keyword::Unsigned) {
            Node::new(start_loc, Kind::BuiltinType(ValueType::U8))
        } else if self.eat_kw(Keyword::Signed) {
            Node::new(start_loc, Kind::BuiltinType(ValueType::S8))
        } else if matches!(self.peek().kind, TokenKind::Identifier(_)) {
            let (path, loc) = self.parse_scoped_name()?;
            let name = path.iter().map(|u| u.as_str()).collect::<Vec<_>>().join("::");
            let type_node = Node::new(loc, Kind::ImportedType { name });
            let template_args = self.parse_template_args()?;
            if template_args.is_empty() {
                type_node
            } else {
                let loc = type_node.location;
                Node::new(loc, Kind::TypeApplication { type_: type_node, template_args, endian: None })
            }
        } else {
            return Err(Error::UnknownType { name: "<unknown>".to_string(), location: start_loc });
        };

        if let Some(endian) = endian {
            let loc = start_loc.merge(&base.location);
            Ok(Node::new(loc, Kind::TypeApplication { type_: base, template_args: Vec::new(), endian: Some(endian) }))
        } else {
            Ok(base)
        }
    }

    // --- type declarations -------------------------------------------------

    fn parse_struct_or_union(&mut self, is_struct: bool) -> PResult<Node> {
        let start = self.advance().location; // `struct`/`union`
        let (name, _) = self.expect_ident("type name")?;
        let template_params = self.parse_template_params()?;

        let mut inherits = Vec::new();
        if self.eat_op(Operator::Colon) {
            loop {
                inherits.push(self.parse_type_ref()?);
                if !self.eat_sep(Separator::Comma) {
                    break;
                }
            }
        }

        if self.eat_sep(Separator::Semi) {
            // forward declaration
            let body = Node::new(start, Kind::CompoundStatement(Vec::new()));
            let decl = Node::new(start, Kind::TypeDecl { name, body, template_params });
            self.register_type(self.qualify(name), decl.clone(), true);
            return Ok(decl);
        }

        let members = self.parse_block();
        let attributes = self.parse_trailing_attributes()?;
        self.eat_sep(Separator::Semi);

        let body_kind = if is_struct {
            Kind::Struct { members, inherits, attributes }
        } else {
            Kind::Union { members, attributes }
        };
        let body = Node::new(start, body_kind);
        let decl = Node::new(start, Kind::TypeDecl { name, body, template_params });
        self.register_type(self.qualify(name), decl.clone(), false);
        Ok(decl)
    }

    fn parse_bitfield(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `bitfield`
        let (name, _) = self.expect_ident("type name")?;
        let template_params = self.parse_template_params()?;

        self.expect_sep(Separator::LBrace, "`{`")?;
        let mut members = Vec::new();
        loop {
            self.skip_trivia();
            if self.is_sep(Separator::RBrace) || self.at_end() {
                break;
            }
            match self.parse_bitfield_field() {
                Ok(node) => members.push(node),
                Err(_) => self.recover_to_statement_boundary(),
            }
        }
        self.eat_sep(Separator::RBrace);
        let attributes = self.parse_trailing_attributes()?;
        self.eat_sep(Separator::Semi);

        let body = Node::new(start, Kind::Bitfield { members, attributes });
        let decl = Node::new(start, Kind::TypeDecl { name, body, template_params });
        self.register_type(self.qualify(name), decl.clone(), false);
        Ok(decl)
    }

    /// `u3 a : 3;` / `bool flag : 1;` / `name : 3;` (implicit unsigned) /
    /// `name : 3 [4];` (bitfield array).
    fn parse_bitfield_field(&mut self) -> PResult<Node> {
        let mark = self.begin();
        let type_hint = if self.looks_like_type_start() { Some(self.parse_type_ref()?) } else { None };
        let (name, loc) = match self.expect_ident("field name") {
            Ok(v) => v,
            Err(e) => {
                self.reset(mark);
                return Err(e);
            }
        };
        self.expect_op(Operator::Colon, "`:`")?;
        let size = self.parse_expression()?;

        if self.eat_sep(Separator::LBracket) {
            let count = self.parse_expression()?;
            self.expect_sep(Separator::RBracket, "`]`")?;
            let attributes = self.parse_trailing_attributes()?;
            self.expect_sep(Separator::Semi, "`;`")?;
            return Ok(Node::new(loc, Kind::BitfieldArrayVariableDecl { name, field_size: size, count, attributes }));
        }

        let kind = match &type_hint {
            Some(t) => match &*t.kind {
                Kind::BuiltinType(ValueType::Bool) => AstBitfieldFieldKind::Boolean,
                Kind::BuiltinType(vt) if vt.is_signed() => AstBitfieldFieldKind::Signed,
                Kind::ImportedType { .. } => AstBitfieldFieldKind::Typed,
                _ => AstBitfieldFieldKind::Plain,
            },
            None => AstBitfieldFieldKind::Plain,
        };
        self.expect_sep(Separator::Semi, "`;`")?;
        Ok(Node::new(loc, Kind::BitfieldField { name, size, kind, type_: type_hint }))
    }

    fn parse_enum(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `enum`
        let (name, _) = self.expect_ident("type name")?;
        let underlying = if self.eat_op(Operator::Colon) { self.parse_type_ref()? } else { Node::new(start, Kind::BuiltinType(ValueType::U32)) };

        self.expect_sep(Separator::LBrace, "`{`")?;
        let mut entries = Vec::new();
        loop {
            self.skip_trivia();
            if self.is_sep(Separator::RBrace) || self.at_end() {
                break;
            }
            let (entry_name, _) = self.expect_ident("enum entry")?;
            let value = if self.eat_op(Operator::Assign) { Some(self.parse_expression()?) } else { None };
            entries.push((entry_name, value));
            if !self.eat_sep(Separator::Comma) {
                break;
            }
        }
        self.expect_sep(Separator::RBrace, "`}`")?;
        self.eat_sep(Separator::Semi);

        let body = Node::new(start, Kind::Enum { underlying, entries });
        let decl = Node::new(start, Kind::TypeDecl { name, body, template_params: Vec::new() });
        self.register_type(self.qualify(name), decl.clone(), false);
        Ok(decl)
    }

    fn parse_using(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `using`
        let (name, _) = self.expect_ident("alias name")?;
        let template_params = self.parse_template_params()?;
        self.expect_op(Operator::Assign, "`=`")?;
        let target = self.parse_type_ref()?;
        self.expect_sep(Separator::Semi, "`;`")?;

        let decl = Node::new(start, Kind::Using { name, target, template_params });
        self.register_type(self.qualify(name), decl.clone(), false);
        Ok(decl)
    }

    // --- functions ---------------------------------------------------------

    fn parse_function(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `fn`
        let (path, _) = self.parse_scoped_name()?;
        let name = path.iter().map(|u| u.as_str()).collect::<Vec<_>>().join("::");

        self.expect_sep(Separator::LParen, "`(`")?;
        let mut params = Vec::new();
        let mut parameter_pack = None;
        if !self.is_sep(Separator::RParen) {
            loop {
                let is_auto = self.eat_ident_text("auto");
                let type_ = if is_auto { None } else { Some(self.parse_type_ref()?) };
                let (pname, _) = self.expect_ident("parameter name")?;
                // a parameter pack's trailing ellipsis lexes as three `Dot` operators
                if self.is_op(Operator::Dot) && self.peek_at(1).kind == TokenKind::Operator(Operator::Dot) {
                    self.advance();
                    self.advance();
                    self.eat_op(Operator::Dot);
                    parameter_pack = Some(pname);
                } else {
                    let default = if self.eat_op(Operator::Assign) { Some(self.parse_expression()?) } else { None };
                    params.push(Param { type_, name: pname, default });
                }
                if !self.eat_sep(Separator::Comma) {
                    break;
                }
            }
        }
        self.expect_sep(Separator::RParen, "`)`")?;
        let body = self.parse_block();
        Ok(Node::new(start, Kind::FunctionDefinition { name, params, body, parameter_pack }))
    }

    // --- namespace / import -------------------------------------------------

    fn parse_namespace(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `namespace`
        let (path, _) = self.parse_scoped_name()?;
        self.namespace_stack.extend(path.iter().copied());
        let body = self.parse_block();
        for _ in &path {
            self.namespace_stack.pop();
        }
        Ok(Node::new(start, Kind::Namespace { path, body }))
    }

    fn parse_import(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `import`
        let path = if let TokenKind::String(s) = self.peek().kind.clone() {
            self.advance();
            s
        } else {
            let (segs, _) = self.parse_scoped_name()?;
            segs.iter().map(|u| u.as_str()).collect::<Vec<_>>().join("::")
        };
        let as_prefix = if self.eat_kw(Keyword::As) { Some(self.expect_ident("namespace alias")?.0) } else { None };
        self.expect_sep(Separator::Semi, "`;`")?;
        if let Some(prefix) = as_prefix {
            self.import_aliases.push((prefix, path.split("::").map(Ustr::from).collect()));
        }
        Ok(Node::new(start, Kind::Import { path, as_prefix }))
    }

    // --- control flow --------------------------------------------------------

    fn parse_if(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `if`
        self.expect_sep(Separator::LParen, "`(`")?;
        let cond = self.parse_expression()?;
        self.expect_sep(Separator::RParen, "`)`")?;
        let then_branch = self.parse_braced_or_single();
        let else_branch = if self.eat_kw(Keyword::Else) {
            if self.is_kw(Keyword::If) {
                vec![self.parse_if()?]
            } else {
                self.parse_braced_or_single()
            }
        } else {
            Vec::new()
        };
        Ok(Node::new(start, Kind::ConditionalStatement { cond, then_branch, else_branch }))
    }

    /// A statement body that may be a `{ ... }` block or a single
    /// statement, as in C-family conditionals.
    fn parse_braced_or_single(&mut self) -> Vec<Node> {
        if self.is_sep(Separator::LBrace) {
            self.parse_block()
        } else {
            match self.parse_statement() {
                Ok(Some(node)) => vec![node],
                _ => Vec::new(),
            }
        }
    }

    fn parse_while(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `while`
        self.expect_sep(Separator::LParen, "`(`")?;
        let cond = if self.is_sep(Separator::RParen) { None } else { Some(self.parse_expression()?) };
        self.expect_sep(Separator::RParen, "`)`")?;
        let body = self.parse_braced_or_single();
        Ok(Node::new(start, Kind::WhileStatement { cond, body, post: None }))
    }

    fn parse_for(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `for`
        self.expect_sep(Separator::LParen, "`(`")?;
        let init = if self.is_sep(Separator::Semi) {
            self.advance();
            None
        } else {
            let stmt = self.parse_statement()?;
            stmt
        };
        let cond = if self.is_sep(Separator::Semi) { None } else { Some(self.parse_expression()?) };
        self.expect_sep(Separator::Semi, "`;`")?;
        let post = if self.is_sep(Separator::RParen) { None } else { Some(self.parse_expression()?) };
        self.expect_sep(Separator::RParen, "`)`")?;
        let body = self.parse_braced_or_single();
        let loop_node = Node::new(start, Kind::WhileStatement { cond, body, post });
        match init {
            Some(init) => Ok(Node::new(start, Kind::CompoundStatement(vec![init, loop_node]))),
            None => Ok(loop_node),
        }
    }

    /// `match (a, b) { (1, _): { ... } (_, _): { ... } }`
    fn parse_match(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `match`
        self.expect_sep(Separator::LParen, "`(`")?;
        let mut scrutinee = vec![self.parse_expression()?];
        while self.eat_sep(Separator::Comma) {
            scrutinee.push(self.parse_expression()?);
        }
        self.expect_sep(Separator::RParen, "`)`")?;
        self.expect_sep(Separator::LBrace, "`{`")?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            self.skip_trivia();
            if self.is_sep(Separator::RBrace) || self.at_end() {
                break;
            }
            self.expect_sep(Separator::LParen, "`(`")?;
            let mut is_default = false;
            let mut patterns = Vec::new();
            loop {
                if self.eat_ident_text("_") {
                    is_default = true;
                    patterns.push(Node::new(self.peek().location, Kind::RValue(vec![PathSegment::Identifier(Ustr::from("_"))])));
                } else {
                    patterns.push(self.parse_expression()?);
                }
                if !self.eat_sep(Separator::Comma) {
                    break;
                }
            }
            self.expect_sep(Separator::RParen, "`)`")?;
            self.expect_op(Operator::Colon, "`:`")?;
            let body = self.parse_braced_or_single();
            if is_default && patterns.len() == scrutinee.len().max(1) {
                default = Some(body);
            } else {
                cases.push((patterns, body));
            }
        }
        self.expect_sep(Separator::RBrace, "`}`")?;
        self.eat_sep(Separator::Semi);
        Ok(Node::new(start, Kind::MatchStatement { scrutinee, cases, default }))
    }

    fn parse_try(&mut self) -> PResult<Node> {
        let start = self.advance().location; // `try`
        let try_body = self.parse_block();
        let catch_body = if self.eat_kw(Keyword::Catch) { self.parse_block() } else { Vec::new() };
        Ok(Node::new(start, Kind::TryCatchStatement { try_body, catch_body }))
    }

    // --- variable declarations -------------------------------------------------

    /// Handles every declaration that starts with a type (or `in`/`out`):
    /// plain, array, pointer, and multi-declarations (`u8 a, b;`).
    fn parse_variable_decl_like(&mut self) -> PResult<Node> {
        let start = self.peek().location;
        let is_in = self.eat_kw(Keyword::In);
        let is_out = if is_in { false } else { self.eat_kw(Keyword::Out) };
        let io = if is_in {
            IoQualifier::In
        } else if is_out {
            IoQualifier::Out
        } else {
            IoQualifier::None
        };

        let type_ = self.parse_type_ref()?;
        let mut decls = vec![self.parse_single_declarator(type_.clone(), io)?];
        while self.eat_sep(Separator::Comma) {
            decls.push(self.parse_single_declarator(type_.clone(), io)?);
        }
        self.expect_sep(Separator::Semi, "`;`")?;

        if decls.len() == 1 {
            Ok(decls.into_iter().next().unwrap())
        } else {
            Ok(Node::new(start, Kind::MultiVariableDecl(decls)))
        }
    }

    fn parse_placement(&mut self) -> PResult<(Option<Node>, Option<Node>)> {
        let placement = if self.eat_op(Operator::At) { Some(self.parse_expression()?) } else { None };
        let section = if self.eat_kw(Keyword::In) { Some(self.parse_expression()?) } else { None };
        Ok((placement, section))
    }

    fn parse_single_declarator(&mut self, type_: Node, io: IoQualifier) -> PResult<Node> {
        let is_pointer = self.eat_op(Operator::Star);
        let (name, loc) = self.expect_ident("variable name")?;

        if is_pointer {
            self.expect_op(Operator::Colon, "`:` (pointer size type)")?;
            let size_type = self.parse_type_ref()?;
            let (placement, section) = self.parse_placement()?;
            let attributes = self.parse_trailing_attributes()?;
            return Ok(Node::new(loc, Kind::PointerVariableDecl { type_, name, size_type, placement, section, attributes }));
        }

        if self.eat_sep(Separator::LBracket) {
            let size = if self.is_sep(Separator::RBracket) { None } else { Some(self.parse_expression()?) };
            self.expect_sep(Separator::RBracket, "`]`")?;
            let (placement, section) = self.parse_placement()?;
            let attributes = self.parse_trailing_attributes()?;
            return Ok(Node::new(loc, Kind::ArrayVariableDecl { type_, name, size, placement, section, attributes }));
        }

        if self.eat_op(Operator::Assign) {
            let value = self.parse_expression()?;
            return Ok(Node::new(loc, Kind::RValueAssignment { name, value }));
        }

        let (placement, section) = self.parse_placement()?;
        let attributes = self.parse_trailing_attributes()?;
        Ok(Node::new(loc, Kind::VariableDecl { type_, name, placement, section, attributes, io }))
    }

    // --- expressions: precedence ladder ----------------------------------------

    fn parse_expression(&mut self) -> PResult<Node> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<Node> {
        let cond = self.parse_bool_or()?;
        if self.eat_op(Operator::Question) {
            let then_branch = self.parse_expression()?;
            self.expect_op(Operator::Colon, "`:`")?;
            let else_branch = self.parse_ternary()?;
            let loc = cond.location.merge(&else_branch.location);
            Ok(Node::new(loc, Kind::TernaryExpression { cond, then_branch, else_branch }))
        } else {
            Ok(cond)
        }
    }

    fn parse_bool_or(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::OrOr], Self::parse_bool_xor)
    }

    fn parse_bool_xor(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::XorXor], Self::parse_bool_and)
    }

    fn parse_bool_and(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::AndAnd], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Eq, Operator::NotEq], Self::parse_relational)
    }

    fn parse_relational(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Lt, Operator::Gt, Operator::LtEq, Operator::GtEq], Self::parse_bitor)
    }

    fn parse_bitor(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Pipe], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Caret], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Amp], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Shl, Operator::Shr], Self::parse_additive)
    }

    fn parse_additive(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Plus, Operator::Minus], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> PResult<Node> {
        self.parse_left_assoc(&[Operator::Star, Operator::Slash, Operator::Percent], Self::parse_unary)
    }

    fn parse_left_assoc(&mut self, ops: &[Operator], next: fn(&mut Self) -> PResult<Node>) -> PResult<Node> {
        let mut lhs = next(self)?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Operator(o) if ops.contains(o) => *o,
                _ => break,
            };
            self.advance();
            let rhs = next(self)?;
            let loc = lhs.location.merge(&rhs.location);
            lhs = Node::new(loc, Kind::MathematicalExpression { op, lhs, rhs });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Node> {
        let unary_ops = [Operator::Minus, Operator::Not, Operator::Tilde, Operator::Plus];
        if let TokenKind::Operator(op) = self.peek().kind {
            if unary_ops.contains(&op) {
                let loc = self.peek().location;
                self.advance();
                let operand = self.parse_cast()?;
                return Ok(Node::new(loc.merge(&operand.location), Kind::UnaryExpression { op, operand }));
            }
        }
        self.parse_cast()
    }

    /// Cast/reinterpret: `Type(expr)` is a function-call-shaped cast in
    /// this grammar; a leading type name directly followed by `(` at this
    /// precedence level is parsed as a cast rather than a call.
    fn parse_cast(&mut self) -> PResult<Node> {
        if matches!(self.peek().kind, TokenKind::ValueType(_)) && self.peek_at(1).kind == TokenKind::Separator(Separator::LParen) {
            let target_type = self.parse_type_ref()?;
            self.expect_sep(Separator::LParen, "`(`")?;
            let value = self.parse_expression()?;
            self.expect_sep(Separator::RParen, "`)`")?;
            let loc = target_type.location.merge(&value.location);
            return Ok(Node::new(loc, Kind::Cast { target_type, value, reinterpret: false }));
        }
        self.parse_factor()
    }

    fn parse_factor(&mut self) -> PResult<Node> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Integer(value, suffix) => {
                self.advance();
                let literal = if matches!(suffix, pat_lexer::token::IntSuffix::Unsigned) {
                    pat_tree::Literal::Unsigned(value)
                } else {
                    pat_tree::Literal::Signed(value as i128)
                };
                Ok(Node::new(tok.location, Kind::Literal(literal)))
            }
            TokenKind::Float(value, _) => {
                self.advance();
                Ok(Node::new(tok.location, Kind::Literal(pat_tree::Literal::Float(value))))
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Node::new(tok.location, Kind::Literal(pat_tree::Literal::Str(s))))
            }
            TokenKind::Character(c) => {
                self.advance();
                Ok(Node::new(tok.location, Kind::Literal(pat_tree::Literal::Char(c))))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Node::new(tok.location, Kind::Literal(pat_tree::Literal::Boolean(true))))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Node::new(tok.location, Kind::Literal(pat_tree::Literal::Boolean(false))))
            }
            TokenKind::Keyword(Keyword::Parent) => {
                self.advance();
                self.parse_path_tail(vec![PathSegment::Parent], tok.location)
            }
            TokenKind::Keyword(Keyword::This) => {
                self.advance();
                self.parse_path_tail(vec![PathSegment::This], tok.location)
            }
            TokenKind::Keyword(Keyword::SizeOf) => self.parse_type_operator(TypeOperatorKind::SizeOf),
            TokenKind::Keyword(Keyword::AddressOf) => self.parse_type_operator(TypeOperatorKind::AddressOf),
            TokenKind::Keyword(Keyword::TypeNameOf) => self.parse_type_operator(TypeOperatorKind::TypeNameOf),
            TokenKind::Separator(Separator::LParen) => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect_sep(Separator::RParen, "`)`")?;
                Ok(inner)
            }
            TokenKind::Separator(Separator::LBrace) => self.parse_array_init(),
            TokenKind::Identifier(_) => self.parse_identifier_factor(),
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_type_operator(&mut self, op: TypeOperatorKind) -> PResult<Node> {
        let loc = self.advance().location;
        self.expect_sep(Separator::LParen, "`(`")?;
        let target = self.parse_expression()?;
        self.expect_sep(Separator::RParen, "`)`")?;
        Ok(Node::new(loc, Kind::TypeOperator { op, target }))
    }

    fn parse_array_init(&mut self) -> PResult<Node> {
        let loc = self.advance().location; // `{`
        let mut elements = Vec::new();
        if !self.is_sep(Separator::RBrace) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.eat_sep(Separator::Comma) {
                    break;
                }
            }
        }
        self.expect_sep(Separator::RBrace, "`}`")?;
        Ok(Node::new(loc, Kind::FunctionCall { path: vec![Ustr::from("std::array_init")], args: elements }))
    }

    /// An identifier may start a scope-resolution chain (`A::B`), a
    /// function call (`f(...)`, possibly after a scope path), or an
    /// `RValue` path with `.member`/`[index]` accessors.
    fn parse_identifier_factor(&mut self) -> PResult<Node> {
        let (first, first_loc) = self.expect_ident("identifier")?;
        let mut path = vec![first];
        let mut loc = first_loc;
        while self.is_op(Operator::ScopeRes) {
            self.advance();
            let (next, next_loc) = self.expect_ident("identifier after `::`")?;
            path.push(next);
            loc = loc.merge(&next_loc);
        }

        if self.is_sep(Separator::LParen) {
            self.advance();
            let mut args = Vec::new();
            if !self.is_sep(Separator::RParen) {
                loop {
                    args.push(self.parse_expression()?);
                    if !self.eat_sep(Separator::Comma) {
                        break;
                    }
                }
            }
            self.expect_sep(Separator::RParen, "`)`")?;
            return Ok(Node::new(loc, Kind::FunctionCall { path, args }));
        }

        if path.len() > 1 {
            return Ok(Node::new(loc, Kind::ScopeResolution { path }));
        }

        let segments = vec![PathSegment::Identifier(path[0])];
        self.parse_path_tail(segments, loc)
    }

    fn parse_path_tail(&mut self, mut segments: Vec<PathSegment>, mut loc: Location) -> PResult<Node> {
        loop {
            if self.eat_op(Operator::Dot) {
                let (name, name_loc) = self.expect_ident("member name")?;
                segments.push(PathSegment::Identifier(name));
                loc = loc.merge(&name_loc);
            } else if self.eat_sep(Separator::LBracket) {
                let index = self.parse_expression()?;
                let end = self.expect_sep(Separator::RBracket, "`]`")?;
                loc = loc.merge(&end.location);
                segments.push(PathSegment::Index(index));
            } else {
                break;
            }
        }
        Ok(Node::new(loc, Kind::RValue(segments)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> ParseOutput {
        let (tokens, lex_errors) = pat_lexer::lex(1u32, src);
        assert!(lex_errors.is_empty(), "unexpected lexer errors: {lex_errors:?}");
        parse(tokens).expect("expected a clean parse")
    }

    #[test]
    fn parses_struct_with_fields() {
        let out = parse_ok("struct Header { u32 magic; u8 version; };");
        assert_eq!(out.statements.len(), 1);
        assert!(out.types.contains_key("Header"));
        match &*out.statements[0].kind {
            Kind::TypeDecl { body, .. } => match &*body.kind {
                Kind::Struct { members, .. } => assert_eq!(members.len(), 2),
                other => panic!("expected Struct body, got {other:?}"),
            },
            other => panic!("expected TypeDecl, got {other:?}"),
        }
    }

    #[test]
    fn parses_bitfield_with_mixed_fields() {
        let out = parse_ok("bitfield Flags { a : 1; bool b : 1; u8 reserved : 6; };");
        match &*out.statements[0].kind {
            Kind::TypeDecl { body, .. } => match &*body.kind {
                Kind::Bitfield { members, .. } => assert_eq!(members.len(), 3),
                other => panic!("expected Bitfield body, got {other:?}"),
            },
            other => panic!("expected TypeDecl, got {other:?}"),
        }
    }

    #[test]
    fn parses_pointer_and_array_declarations() {
        let out = parse_ok("struct S { u8 *ptr : u32; u16 arr[4]; };");
        match &*out.statements[0].kind {
            Kind::TypeDecl { body, .. } => match &*body.kind {
                Kind::Struct { members, .. } => {
                    assert!(matches!(&*members[0].kind, Kind::PointerVariableDecl { .. }));
                    assert!(matches!(&*members[1].kind, Kind::ArrayVariableDecl { .. }));
                }
                other => panic!("expected Struct body, got {other:?}"),
            },
            other => panic!("expected TypeDecl, got {other:?}"),
        }
    }

    #[test]
    fn parses_expression_precedence() {
        let out = parse_ok("u32 x = 1 + 2 * 3;");
        match &*out.statements[0].kind {
            Kind::RValueAssignment { value, .. } => {
                assert!(matches!(&*value.kind, Kind::MathematicalExpression { .. }));
            }
            other => panic!("expected RValueAssignment, got {other:?}"),
        }
    }

    #[test]
    fn parses_if_and_match_statements() {
        let out = parse_ok(
            "fn pick(u8 x) { if (x == 1) { return 1; } match (x) { (2): { return 2; } (_): { return 0; } } };",
        );
        assert_eq!(out.statements.len(), 1);
        match &*out.statements[0].kind {
            Kind::FunctionDefinition { body, .. } => {
                assert_eq!(body.len(), 2);
                assert!(matches!(&*body[0].kind, Kind::ConditionalStatement { .. }));
                assert!(matches!(&*body[1].kind, Kind::MatchStatement { .. }));
            }
            other => panic!("expected FunctionDefinition, got {other:?}"),
        }
    }

    #[test]
    fn detects_type_redefinition() {
        let (tokens, _) = pat_lexer::lex(1u32, "struct A {}; struct A {};");
        let err = parse(tokens).expect_err("expected a redefinition diagnostic");
        assert!(err.iter().any(|d| d.code_str().contains("P0008")));
    }

    #[test]
    fn forward_declaration_does_not_conflict_with_definition() {
        let out = parse_ok("struct A; struct A { u8 x; };");
        assert_eq!(out.statements.len(), 2);
        assert!(out.types.contains_key("A"));
    }
}
