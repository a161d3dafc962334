//! Walks the AST, evaluating expressions and executing statements while
//! materializing the addressed pattern tree against sections.
//!
//! A [`Pattern`] never caches its value: every read goes back through the
//! owning section, which is what keeps two reads of the same pattern
//! idempotent as long as nothing wrote in between.

pub mod error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use byteorder::{BigEndian, ByteOrder, LittleEndian, NativeEndian};
use pat_diagnostics::Location;
use pat_parser::{
    AstBitfieldFieldKind, Attribute, ControlFlowKind, IoQualifier, Kind, Node, Param, ParseOutput, PathSegment,
    TypeOperatorKind,
};
use pat_sections::{IoError, ReadOnlySection, Section, ZerosSection};
use pat_tree::{
    BitfieldFieldKind, Endian, EndianSetting, Literal, Pattern, PatternData, SectionId, Variant, Visibility,
    HEAP_SECTION_ID, INSTANTIATION_SECTION_ID, MAIN_SECTION_ID, PATTERN_LOCAL_SECTION_ID,
};
use pat_lexer::token::{Operator, ValueType};
use ustr::Ustr;

pub use error::Error;

type EResult<T> = Result<T, Error>;

/// `evaluation_depth`, `array_limit`, `pattern_limit`, `loop_limit`.
/// Overridden by `#pragma` handlers at the runtime layer.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub evaluation_depth: u32,
    pub array_limit: u32,
    pub pattern_limit: u32,
    pub loop_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self { evaluation_depth: 32, array_limit: 0x10000, pattern_limit: 0x20000, loop_limit: 0x10000 }
    }
}

#[derive(Debug, Clone)]
enum ControlFlow {
    None,
    Continue,
    Break,
    Return(Option<Literal>),
}

/// A block-scratch region addressed as `(block_index << 32) | local_offset`.
#[derive(Debug, Default)]
struct HeapSection {
    blocks: Vec<Vec<u8>>,
}

impl HeapSection {
    fn push(&mut self, size: usize) -> u64 {
        let index = self.blocks.len() as u64;
        self.blocks.push(vec![0u8; size]);
        index << 32
    }

    fn mark(&self) -> usize {
        self.blocks.len()
    }

    fn truncate(&mut self, mark: usize) {
        self.blocks.truncate(mark);
    }

    fn block_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8], IoError> {
        let index = (offset >> 32) as usize;
        let local = (offset & 0xFFFF_FFFF) as usize;
        let block = self.blocks.get_mut(index).ok_or(IoError::OutOfBounds { offset, length: len as u64, size: 0 })?;
        if local + len > block.len() {
            return Err(IoError::OutOfBounds { offset, length: len as u64, size: block.len() as u64 });
        }
        Ok(&mut block[local..local + len])
    }
}

impl Section for HeapSection {
    fn raw_size(&self) -> u64 {
        (self.blocks.len() as u64) << 32
    }

    fn resize_raw(&mut self, _new_size: u64) -> Result<(), IoError> {
        Ok(())
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let len = buf.len();
        buf.copy_from_slice(self.block_mut(offset, len)?);
        Ok(())
    }

    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        let len = data.len();
        self.block_mut(offset, len)?.copy_from_slice(data);
        Ok(())
    }
}

/// `{ param_count: {min,max}, default_params, body, dangerous }`.
/// Builtins and user definitions share this record and dispatch table.
pub struct FunctionRecord {
    pub min_params: usize,
    pub max_params: usize,
    pub defaults: Vec<Literal>,
    pub dangerous: bool,
    pub body: FunctionBody,
}

pub enum FunctionBody {
    User { params: Vec<Param>, body: Vec<Node>, parameter_pack: Option<Ustr> },
    Builtin(Arc<dyn Fn(&mut Evaluator, &[Literal]) -> EResult<Literal> + Send + Sync>),
}

struct Scope {
    parent: Option<Pattern>,
    locals: Vec<Pattern>,
    variables: AHashMap<String, Literal>,
    heap_mark: usize,
}

impl Scope {
    fn new(parent: Option<Pattern>, heap_mark: usize) -> Self {
        Self { parent, locals: Vec::new(), variables: AHashMap::new(), heap_mark }
    }
}

/// The direction bitfield members are consumed in, set by the
/// `bitfield_order` attribute; the default is right-to-left (low bits
/// first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOrder {
    RightToLeft,
    LeftToRight,
}

pub struct Evaluator {
    sections: AHashMap<SectionId, Box<dyn Section>>,
    named_sections: AHashMap<String, SectionId>,
    next_section_id: SectionId,
    section_stack: Vec<SectionId>,
    cursor: u64,
    scopes: Vec<Scope>,
    template_value_stack: Vec<Vec<Literal>>,
    template_type_stack: Vec<Vec<Node>>,
    heap: HeapSection,
    env: AHashMap<String, Literal>,
    in_vars: AHashMap<String, Literal>,
    out_names: Vec<String>,
    out_vars: AHashMap<String, Literal>,
    functions: AHashMap<String, FunctionRecord>,
    types: AHashMap<String, Node>,
    control_flow: ControlFlow,
    limits: Limits,
    default_endian: Endian,
    apply_depth: u32,
    pattern_count: u32,
    patterns: Vec<Pattern>,
    aborted: Arc<AtomicBool>,
    dangerous_handler: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    console_log: Vec<(log::Level, String)>,
}

impl Evaluator {
    pub fn new(main: Box<dyn Section>, types: AHashMap<String, Node>, limits: Limits) -> Self {
        let mut sections: AHashMap<SectionId, Box<dyn Section>> = AHashMap::new();
        sections.insert(MAIN_SECTION_ID, Box::new(ReadOnlySection(MainBacking(main))));
        let mut eval = Self {
            sections,
            named_sections: AHashMap::new(),
            next_section_id: INSTANTIATION_SECTION_ID + 1,
            section_stack: vec![MAIN_SECTION_ID],
            cursor: 0,
            scopes: vec![Scope::new(None, 0)],
            template_value_stack: Vec::new(),
            template_type_stack: Vec::new(),
            heap: HeapSection::default(),
            env: AHashMap::new(),
            in_vars: AHashMap::new(),
            out_names: Vec::new(),
            out_vars: AHashMap::new(),
            functions: AHashMap::new(),
            types,
            control_flow: ControlFlow::None,
            limits,
            default_endian: Endian::Little,
            apply_depth: 0,
            pattern_count: 0,
            patterns: Vec::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            dangerous_handler: None,
            console_log: Vec::new(),
        };
        eval.sections.insert(PATTERN_LOCAL_SECTION_ID, Box::new(pat_sections::InMemorySection::new(u64::MAX)));
        eval.sections.insert(INSTANTIATION_SECTION_ID, Box::new(ZerosSection::new(u64::MAX)));
        eval
    }

    pub fn with_env(mut self, env: AHashMap<String, Literal>) -> Self {
        self.env = env;
        self
    }

    pub fn with_in_vars(mut self, in_vars: AHashMap<String, Literal>) -> Self {
        self.in_vars = in_vars;
        self
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.aborted.clone()
    }

    /// Shares an external abort flag instead of the one allocated in
    /// `new`, so a runtime façade can flip the same flag across several
    /// runs without re-fetching the handle after each one.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.aborted = flag;
        self
    }

    /// Set by the `std::endian` pragma: the default for any field that
    /// doesn't carry an explicit `be`/`le` annotation.
    pub fn set_default_endian(&mut self, endian: Endian) {
        self.default_endian = endian;
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn register_function(&mut self, name: impl Into<String>, record: FunctionRecord) {
        self.functions.insert(name.into(), record);
    }

    /// Raw access to section bytes for builtin functions (`std::mem::*`).
    /// Ordinary pattern reads never need this: they go through
    /// `read_pattern_value` instead.
    pub fn read_memory(&mut self, section_id: SectionId, offset: u64, len: usize) -> EResult<Vec<u8>> {
        self.read_bytes(section_id, offset, len, Location::empty())
    }

    pub fn write_memory(&mut self, section_id: SectionId, offset: u64, data: &[u8]) -> EResult<()> {
        self.write_bytes(section_id, offset, data, Location::empty())
    }

    pub fn memory_size(&self, section_id: SectionId) -> u64 {
        self.section_size(section_id)
    }

    fn register_user_function(&mut self, name: String, params: Vec<Param>, body: Vec<Node>, parameter_pack: Option<Ustr>) {
        let min_params = params.iter().take_while(|p| p.default.is_none()).count();
        let max_params = params.len();
        self.functions.insert(
            name,
            FunctionRecord { min_params, max_params, defaults: Vec::new(), dangerous: false, body: FunctionBody::User { params, body, parameter_pack } },
        );
    }

    pub fn set_dangerous_handler(&mut self, handler: Arc<dyn Fn(&str) -> bool + Send + Sync>) {
        self.dangerous_handler = Some(handler);
    }

    pub fn console_log(&self) -> &[(log::Level, String)] {
        &self.console_log
    }

    pub fn out_vars(&self) -> &AHashMap<String, Literal> {
        &self.out_vars
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn log(&mut self, level: log::Level, message: impl Into<String>) {
        self.console_log.push((level, message.into()));
    }

    /// Registers every top-level function definition without running
    /// anything else, then invokes `name` with `args`. Used by the runtime
    /// façade's `execute_function`, which has no surrounding program to run.
    pub fn run_function(&mut self, statements: &[Node], name: &str, args: Vec<Literal>) -> EResult<Literal> {
        for stmt in statements {
            if let Kind::FunctionDefinition { name, params, body, parameter_pack } = &*stmt.kind {
                self.register_user_function(name.clone(), params.clone(), body.clone(), *parameter_pack);
            }
        }
        self.call_function(name, args, Location::empty())
    }

    /// Runs every top-level statement, then copies `out`-declared variables
    /// into the final out map.
    pub fn run(&mut self, statements: &[Node]) -> EResult<()> {
        for stmt in statements {
            if let Kind::FunctionDefinition { name, params, body, parameter_pack } = &*stmt.kind {
                self.register_user_function(name.clone(), params.clone(), body.clone(), *parameter_pack);
            }
        }
        for stmt in statements {
            if matches!(&*stmt.kind, Kind::FunctionDefinition { .. }) {
                continue;
            }
            self.check_abort(stmt.location)?;
            self.exec_stmt(stmt)?;
            if let ControlFlow::Return(_) = self.control_flow {
                break;
            }
        }
        for name in self.out_names.clone() {
            if let Some(lit) = self.lookup_variable(&name) {
                self.out_vars.insert(name, lit);
            }
        }
        Ok(())
    }

    fn check_abort(&self, location: Location) -> EResult<()> {
        if self.aborted.load(Ordering::Relaxed) {
            return Err(Error::ControlFlow { message: "evaluation aborted by user".into(), location });
        }
        Ok(())
    }

    // --- sections ---------------------------------------------------------

    fn current_section(&self) -> SectionId {
        *self.section_stack.last().unwrap_or(&MAIN_SECTION_ID)
    }

    fn push_section(&mut self, id: SectionId) {
        self.section_stack.push(id);
    }

    fn pop_section(&mut self) {
        if self.section_stack.len() > 1 {
            self.section_stack.pop();
        }
    }

    fn named_section(&mut self, name: &str) -> SectionId {
        if let Some(&id) = self.named_sections.get(name) {
            return id;
        }
        let id = self.next_section_id;
        self.next_section_id += 1;
        self.sections.insert(id, Box::new(pat_sections::InMemorySection::new(u64::MAX)));
        self.named_sections.insert(name.to_string(), id);
        id
    }

    fn section_size(&self, id: SectionId) -> u64 {
        if id == HEAP_SECTION_ID {
            return self.heap.size();
        }
        self.sections.get(&id).map(|s| s.size()).unwrap_or(0)
    }

    /// Heap offsets are `(block_index << 32) | local_offset` bookkeeping
    /// kept alongside scope/function lifetimes, not a plain byte buffer, so
    /// it is routed here rather than living in the generic section map.
    fn read_bytes(&mut self, section_id: SectionId, offset: u64, len: usize, location: Location) -> EResult<Vec<u8>> {
        if section_id == HEAP_SECTION_ID {
            let mut buf = vec![0u8; len];
            self.heap.read(offset, &mut buf).map_err(|e| Error::memory(e, location))?;
            return Ok(buf);
        }
        let section = self
            .sections
            .get_mut(&section_id)
            .ok_or_else(|| Error::memory(IoError::OutOfBounds { offset, length: len as u64, size: 0 }, location))?;
        let mut buf = vec![0u8; len];
        section.read(offset, &mut buf).map_err(|e| Error::memory(e, location))?;
        Ok(buf)
    }

    fn write_bytes(&mut self, section_id: SectionId, offset: u64, data: &[u8], location: Location) -> EResult<()> {
        if section_id == HEAP_SECTION_ID {
            return self.heap.write(offset, data, true).map_err(|e| Error::memory(e, location));
        }
        let section = self
            .sections
            .get_mut(&section_id)
            .ok_or_else(|| Error::memory(IoError::OutOfBounds { offset, length: data.len() as u64, size: 0 }, location))?;
        section.write(offset, data, true).map_err(|e| Error::memory(e, location))
    }

    // --- scopes and variables ----------------------------------------------

    fn scope(&self) -> &Scope {
        self.scopes.last().expect("at least the global scope")
    }

    fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("at least the global scope")
    }

    fn push_scope(&mut self, parent: Option<Pattern>) -> EResult<()> {
        if self.scopes.len() as u32 + 1 > self.limits.evaluation_depth {
            return Err(Error::LimitExceeded { kind: "evaluation depth", limit: self.limits.evaluation_depth, location: Location::empty() });
        }
        self.scopes.push(Scope::new(parent, self.heap.mark()));
        Ok(())
    }

    fn pop_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            self.heap.truncate(scope.heap_mark.max(self.heap.mark().min(scope.heap_mark)));
            // function-local heap slots survive until the *outer* scope pops;
            // a plain block scope keeps them too, so only loop/function exit
            // through an explicit pop truncates.
        }
    }

    fn lookup_variable(&self, name: &str) -> Option<Literal> {
        for scope in self.scopes.iter().rev() {
            if let Some(lit) = scope.variables.get(name) {
                return Some(lit.clone());
            }
            for pattern in scope.locals.iter().rev() {
                if pattern.borrow().variable_name == name {
                    return Some(Literal::Pattern(pattern.clone()));
                }
            }
        }
        self.env.get(name).cloned()
    }

    fn bind_variable(&mut self, name: &str, value: Literal) {
        self.scope_mut().variables.insert(name.to_string(), value);
    }

    fn add_local_pattern(&mut self, pattern: Pattern) {
        if let Some(parent) = self.scope().parent.clone() {
            pattern.set_parent(&parent);
        }
        self.scope_mut().locals.push(pattern);
    }

    // --- type lookup --------------------------------------------------------

    fn lookup_type(&self, name: &str) -> Option<Node> {
        if let Some(node) = self.types.get(name) {
            return Some(node.clone());
        }
        self.types.iter().find(|(k, _)| k.ends_with(&format!("::{name}"))).map(|(_, v)| v.clone())
    }

    // --- expressions ---------------------------------------------------------

    fn eval_expr(&mut self, node: &Node) -> EResult<Literal> {
        self.check_abort(node.location)?;
        match &*node.kind {
            Kind::Literal(lit) => Ok(lit.clone()),
            Kind::RValue(path) => self.eval_path(path, node.location),
            Kind::LValueAssignment { path, value } => {
                let v = self.eval_expr(value)?;
                self.assign_path(path, v.clone(), node.location)?;
                Ok(v)
            }
            Kind::RValueAssignment { name, value } => {
                let v = self.eval_expr(value)?;
                self.bind_variable(name.as_str(), v.clone());
                Ok(v)
            }
            Kind::MathematicalExpression { op, lhs, rhs } => {
                let l = self.eval_expr(lhs)?;
                let r = self.eval_expr(rhs)?;
                self.apply_binary(*op, l, r, node.location)
            }
            Kind::UnaryExpression { op, operand } => {
                let v = self.eval_expr(operand)?;
                self.apply_unary(*op, v, node.location)
            }
            Kind::TernaryExpression { cond, then_branch, else_branch } => {
                if self.eval_bool(cond)? {
                    self.eval_expr(then_branch)
                } else {
                    self.eval_expr(else_branch)
                }
            }
            Kind::Cast { target_type, value, reinterpret: _ } => {
                let v = self.eval_expr(value)?;
                self.cast_literal(target_type, v, node.location)
            }
            Kind::TypeOperator { op, target } => self.eval_type_operator(*op, target, node.location),
            Kind::FunctionCall { path, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg)?);
                }
                let name = path.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("::");
                self.call_function(&name, values, node.location)
            }
            Kind::ScopeResolution { path } => {
                let qualified = path.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("::");
                self.resolve_enum_constant(&qualified, node.location)
            }
            _ => Err(Error::Internal { message: format!("node is not an expression: {:?}", node.kind), location: node.location }),
        }
    }

    fn eval_bool(&mut self, node: &Node) -> EResult<bool> {
        let lit = self.eval_expr(node)?;
        lit.to_boolean().map_err(|e| Error::Type(e, node.location))
    }

    fn eval_path(&mut self, path: &[PathSegment], location: Location) -> EResult<Literal> {
        let mut current: Option<Literal> = None;
        for (i, segment) in path.iter().enumerate() {
            current = Some(match segment {
                PathSegment::This => Literal::Pattern(
                    self.scope().parent.clone().ok_or_else(|| Error::Placement { message: "`this` used outside a struct body".into(), location })?,
                ),
                PathSegment::Parent => {
                    let this = match &current {
                        Some(Literal::Pattern(p)) => p.clone(),
                        _ => self.scope().parent.clone().ok_or_else(|| Error::Placement { message: "`parent` used outside a struct body".into(), location })?,
                    };
                    let parent = this.parent().ok_or_else(|| Error::Placement { message: "pattern has no parent".into(), location })?;
                    Literal::Pattern(parent)
                }
                PathSegment::Identifier(name) => match &current {
                    None => self.lookup_variable(name.as_str()).ok_or_else(|| {
                        Error::Undefined { what: "variable", name: name.to_string(), location }
                    })?,
                    Some(Literal::Pattern(p)) => {
                        let child = p.children().into_iter().find(|c| c.borrow().variable_name == name.as_str());
                        Literal::Pattern(child.ok_or_else(|| Error::Undefined { what: "member", name: name.to_string(), location })?)
                    }
                    Some(_) => return Err(Error::Type(pat_tree::CoercionError::Impossible { from: "literal", to: "struct" }, location)),
                },
                PathSegment::Index(index_node) => {
                    let index_lit = self.eval_expr(index_node)?;
                    let index = index_lit.to_signed().map_err(|e| Error::Type(e, location))?;
                    match &current {
                        Some(Literal::Pattern(p)) => {
                            let len = p.children().len() as i128;
                            if index < 0 || index >= len {
                                return Err(Error::IndexOutOfRange { index, length: len as u64, location });
                            }
                            Literal::Pattern(p.child_at(index as usize).expect("bounds checked"))
                        }
                        _ => return Err(Error::IndexOutOfRange { index, length: 0, location }),
                    }
                }
            });
            let _ = i;
        }
        let current = current.ok_or_else(|| Error::Internal { message: "empty path".into(), location })?;
        if let Literal::Pattern(p) = &current {
            return self.read_pattern_value(p, location);
        }
        Ok(current)
    }

    fn assign_path(&mut self, path: &[PathSegment], value: Literal, location: Location) -> EResult<()> {
        if path.len() == 1 {
            if let PathSegment::Identifier(name) = &path[0] {
                if let Some(Literal::Pattern(p)) = self.lookup_variable(name.as_str()) {
                    return self.write_pattern_value(&p, value, location);
                }
                self.bind_variable(name.as_str(), value);
                return Ok(());
            }
        }
        let target = self.eval_path(&path[..path.len() - 1.min(path.len())], location)?;
        if let Literal::Pattern(p) = target {
            self.write_pattern_value(&p, value, location)
        } else {
            Err(Error::Placement { message: "cannot assign into this expression".into(), location })
        }
    }

    fn apply_unary(&mut self, op: Operator, v: Literal, location: Location) -> EResult<Literal> {
        match op {
            Operator::Minus => match v {
                Literal::Float(f) => Ok(Literal::Float(-f)),
                _ => Ok(Literal::Signed(-v.to_signed().map_err(|e| Error::Type(e, location))?)),
            },
            Operator::Not => Ok(Literal::Boolean(!v.to_boolean().map_err(|e| Error::Type(e, location))?)),
            Operator::Tilde => Ok(Literal::Signed(!v.to_signed().map_err(|e| Error::Type(e, location))?)),
            _ => Err(Error::Internal { message: format!("not a unary operator: {op:?}"), location }),
        }
    }

    fn apply_binary(&mut self, op: Operator, lhs: Literal, rhs: Literal, location: Location) -> EResult<Literal> {
        use Operator::*;
        if let (Literal::Str(a), Literal::Str(b)) = (&lhs, &rhs) {
            if op == Plus {
                return Ok(Literal::Str(format!("{a}{b}")));
            }
            if op == Eq {
                return Ok(Literal::Boolean(a == b));
            }
            if op == NotEq {
                return Ok(Literal::Boolean(a != b));
            }
        }
        if let (Literal::Str(s), other) = (&lhs, &rhs) {
            if op == Star {
                let n = other.to_unsigned().map_err(|e| Error::Type(e, location))?;
                return Ok(Literal::Str(s.repeat(n as usize)));
            }
        }
        match op {
            Eq | NotEq | Lt | Gt | LtEq | GtEq => {
                let a = lhs.to_float().map_err(|e| Error::Type(e, location))?;
                let b = rhs.to_float().map_err(|e| Error::Type(e, location))?;
                Ok(Literal::Boolean(match op {
                    Eq => a == b,
                    NotEq => a != b,
                    Lt => a < b,
                    Gt => a > b,
                    LtEq => a <= b,
                    GtEq => a >= b,
                    _ => unreachable!(),
                }))
            }
            AndAnd => Ok(Literal::Boolean(
                lhs.to_boolean().map_err(|e| Error::Type(e, location))? && rhs.to_boolean().map_err(|e| Error::Type(e, location))?,
            )),
            OrOr => Ok(Literal::Boolean(
                lhs.to_boolean().map_err(|e| Error::Type(e, location))? || rhs.to_boolean().map_err(|e| Error::Type(e, location))?,
            )),
            XorXor => Ok(Literal::Boolean(
                lhs.to_boolean().map_err(|e| Error::Type(e, location))? ^ rhs.to_boolean().map_err(|e| Error::Type(e, location))?,
            )),
            Plus | Minus | Star | Slash | Percent if matches!(lhs, Literal::Float(_)) || matches!(rhs, Literal::Float(_)) => {
                let a = lhs.to_float().map_err(|e| Error::Type(e, location))?;
                let b = rhs.to_float().map_err(|e| Error::Type(e, location))?;
                if matches!(op, Slash | Percent) && b == 0.0 {
                    return Err(Error::Math { message: "division by zero".into(), location });
                }
                Ok(Literal::Float(match op {
                    Plus => a + b,
                    Minus => a - b,
                    Star => a * b,
                    Slash => a / b,
                    Percent => a % b,
                    _ => unreachable!(),
                }))
            }
            Plus | Minus | Star | Slash | Percent | Amp | Pipe | Caret | Shl | Shr => {
                let a = lhs.to_signed().map_err(|e| Error::Type(e, location))?;
                let b = rhs.to_signed().map_err(|e| Error::Type(e, location))?;
                if matches!(op, Slash | Percent) && b == 0 {
                    return Err(Error::Math { message: "division by zero".into(), location });
                }
                Ok(Literal::Signed(match op {
                    Plus => a.wrapping_add(b),
                    Minus => a.wrapping_sub(b),
                    Star => a.wrapping_mul(b),
                    Slash => a.wrapping_div(b),
                    Percent => a.wrapping_rem(b),
                    Amp => a & b,
                    Pipe => a | b,
                    Caret => a ^ b,
                    Shl => a.wrapping_shl(b as u32),
                    Shr => a.wrapping_shr(b as u32),
                    _ => unreachable!(),
                }))
            }
            _ => Err(Error::Internal { message: format!("not a binary operator: {op:?}"), location }),
        }
    }

    fn cast_literal(&mut self, target_type: &Node, value: Literal, location: Location) -> EResult<Literal> {
        let Kind::BuiltinType(vt) = &*target_type.kind else {
            return Ok(value);
        };
        Ok(match vt {
            ValueType::Float | ValueType::Double => Literal::Float(value.to_float().map_err(|e| Error::Type(e, location))?),
            ValueType::Bool => Literal::Boolean(value.to_boolean().map_err(|e| Error::Type(e, location))?),
            vt if vt.is_signed() => Literal::Signed(value.to_signed().map_err(|e| Error::Type(e, location))?),
            _ => Literal::Unsigned(value.to_unsigned().map_err(|e| Error::Type(e, location))?),
        })
    }

    fn eval_type_operator(&mut self, op: TypeOperatorKind, target: &Node, location: Location) -> EResult<Literal> {
        match op {
            TypeOperatorKind::SizeOf => {
                let size = self.size_of_type(target, location)?;
                Ok(Literal::Unsigned(size as u128))
            }
            TypeOperatorKind::AddressOf => {
                let v = self.eval_expr(target)?;
                match v {
                    Literal::Pattern(p) => Ok(Literal::Unsigned(p.borrow().offset as u128)),
                    _ => Err(Error::Placement { message: "addressof requires a placed pattern".into(), location }),
                }
            }
            TypeOperatorKind::TypeNameOf => {
                let v = self.eval_expr(target)?;
                match v {
                    Literal::Pattern(p) => Ok(Literal::Str(p.borrow().type_name.clone())),
                    other => Ok(Literal::Str(other.kind_name().to_string())),
                }
            }
        }
    }

    fn size_of_type(&mut self, type_node: &Node, location: Location) -> EResult<u64> {
        match &*type_node.kind {
            Kind::BuiltinType(vt) => Ok(vt.size_of() as u64),
            Kind::ImportedType { name } => {
                let decl = self.lookup_type(name).ok_or_else(|| Error::Undefined { what: "type", name: name.clone(), location })?;
                self.size_of_type(&decl, location)
            }
            Kind::TypeDecl { body, .. } => self.size_of_type(body, location),
            Kind::TypeApplication { type_, .. } => self.size_of_type(type_, location),
            _ => {
                // Zero-filled, unbounded scratch backing: materializing a pattern
                // here to measure its size never touches the real cursor or data.
                self.push_section(INSTANTIATION_SECTION_ID);
                let saved_cursor = self.cursor;
                self.cursor = 0;
                let result = self.create_pattern(type_node, "", Location::empty());
                self.cursor = saved_cursor;
                self.pop_section();
                Ok(result?.borrow().size)
            }
        }
    }

    fn resolve_enum_constant(&mut self, qualified: &str, location: Location) -> EResult<Literal> {
        let (type_name, entry_name) = qualified.rsplit_once("::").ok_or_else(|| {
            Error::Undefined { what: "scope", name: qualified.to_string(), location }
        })?;
        let decl = self.lookup_type(type_name).ok_or_else(|| Error::Undefined { what: "type", name: type_name.to_string(), location })?;
        let body = match &*decl.kind {
            Kind::TypeDecl { body, .. } => (**body.kind).clone(),
            other => other.clone(),
        };
        if let Kind::Enum { underlying: _, entries } = body {
            let mut next_value: i128 = 0;
            for (name, value_expr) in &entries {
                if let Some(expr) = value_expr {
                    next_value = self.eval_expr(expr)?.to_signed().map_err(|e| Error::Type(e, location))?;
                }
                if name.as_str() == entry_name {
                    return Ok(Literal::Signed(next_value));
                }
                next_value += 1;
            }
        }
        Err(Error::Undefined { what: "enum entry", name: entry_name.to_string(), location })
    }

    // --- reading/writing pattern values --------------------------------------

    fn read_pattern_value(&mut self, pattern: &Pattern, location: Location) -> EResult<Literal> {
        let (offset, size, section_id, endian, variant, bit_offset, bit_size) = {
            let data = pattern.borrow();
            (data.offset, data.size, data.section_id, data.endian.endian, data.variant.clone(), data.bit_offset, data.bit_size)
        };
        match variant {
            Variant::Padding => Ok(Literal::Unsigned(0)),
            Variant::Struct { .. } | Variant::Union { .. } | Variant::Bitfield { .. } | Variant::ArrayStatic { .. } | Variant::ArrayDynamic { .. } | Variant::BitfieldArray { .. } => {
                Ok(Literal::Pattern(pattern.clone()))
            }
            Variant::Pointer { pointee, .. } => Ok(Literal::Pattern((*pointee).clone())),
            Variant::Error { message } => Err(Error::Internal { message, location }),
            Variant::BitfieldField { bits } => {
                let (bo, bs) = (bit_offset.unwrap_or(0), bit_size.unwrap_or(0));
                let value = self.read_bits(section_id, offset, bo, bs, location)?;
                Ok(match bits {
                    BitfieldFieldKind::Boolean => Literal::Boolean(value != 0),
                    BitfieldFieldKind::Signed => {
                        let shift = 128 - bs as u32;
                        Literal::Signed(((value as i128) << shift) >> shift)
                    }
                    BitfieldFieldKind::Unsigned | BitfieldFieldKind::Enum => Literal::Unsigned(value),
                })
            }
            Variant::Boolean => Ok(Literal::Boolean(self.read_bytes(section_id, offset, size as usize, location)?.iter().any(|b| *b != 0))),
            Variant::Character => {
                let bytes = self.read_bytes(section_id, offset, size as usize, location)?;
                Ok(Literal::Char(bytes.first().copied().unwrap_or(0) as char))
            }
            Variant::WideCharacter => {
                let bytes = self.read_bytes(section_id, offset, size as usize, location)?;
                let code = decode_unsigned(&bytes, endian);
                Ok(Literal::Char(char::from_u32(code as u32).unwrap_or('\u{FFFD}')))
            }
            Variant::String | Variant::WideString => {
                let bytes = self.read_bytes(section_id, offset, size as usize, location)?;
                Ok(Literal::Str(String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string()))
            }
            Variant::Float => {
                let bytes = self.read_bytes(section_id, offset, size as usize, location)?;
                Ok(Literal::Float(decode_float(&bytes, endian)))
            }
            Variant::Signed => {
                let bytes = self.read_bytes(section_id, offset, size as usize, location)?;
                Ok(Literal::Signed(decode_signed(&bytes, endian)))
            }
            Variant::Unsigned | Variant::Enum { .. } => {
                let bytes = self.read_bytes(section_id, offset, size as usize, location)?;
                Ok(Literal::Unsigned(decode_unsigned(&bytes, endian)))
            }
        }
    }

    fn write_pattern_value(&mut self, pattern: &Pattern, value: Literal, location: Location) -> EResult<()> {
        let (offset, size, section_id, endian) = {
            let data = pattern.borrow();
            (data.offset, data.size, data.section_id, data.endian.endian)
        };
        let bytes = match &value {
            Literal::Float(f) => encode_float(*f, size as usize, endian),
            Literal::Boolean(b) => encode_unsigned(*b as u128, size as usize, endian),
            Literal::Char(c) => encode_unsigned(*c as u128, size as usize, endian),
            _ => encode_unsigned(value.to_unsigned().map_err(|e| Error::Type(e, location))? , size as usize, endian),
        };
        self.write_bytes(section_id, offset, &bytes, location)
    }

    fn read_bits(&mut self, section_id: SectionId, byte_offset: u64, bit_offset: u8, bit_size: u8, location: Location) -> EResult<u128> {
        let total_bits = bit_offset as u64 + bit_size as u64;
        let byte_len = ((total_bits + 7) / 8) as usize;
        let bytes = self.read_bytes(section_id, byte_offset, byte_len, location)?;
        let whole = decode_unsigned(&bytes, Endian::Little);
        let mask = if bit_size >= 128 { u128::MAX } else { (1u128 << bit_size) - 1 };
        Ok((whole >> bit_offset) & mask)
    }

    // --- functions ------------------------------------------------------------

    fn call_function(&mut self, name: &str, args: Vec<Literal>, location: Location) -> EResult<Literal> {
        let record_key = if self.functions.contains_key(name) {
            name.to_string()
        } else if let Some(short) = name.rsplit("::").next() {
            if self.functions.contains_key(short) {
                short.to_string()
            } else {
                let hint = name.starts_with("std::").then(|| " (check the standard library bindings are registered)".to_string());
                return Err(Error::Undefined { what: "function", name: format!("{name}{}", hint.unwrap_or_default()), location });
            }
        } else {
            return Err(Error::Undefined { what: "function", name: name.to_string(), location });
        };

        let (min, max, is_user, dangerous) = {
            let record = self.functions.get(&record_key).expect("looked up above");
            (record.min_params, record.max_params, matches!(record.body, FunctionBody::User { .. }), record.dangerous)
        };
        if args.len() < min {
            return Err(Error::FunctionCall { message: format!("`{name}` expects at least {min} argument(s), got {}", args.len()), location });
        }
        if args.len() > max {
            return Err(Error::FunctionCall { message: format!("`{name}` expects at most {max} argument(s), got {}", args.len()), location });
        }
        if dangerous {
            let allowed = self.dangerous_handler.as_ref().map(|h| h(&record_key)).unwrap_or(false);
            if !allowed {
                return Err(Error::FunctionCall { message: format!("call to dangerous function `{name}` was denied"), location });
            }
        }
        let mut full_args = args;
        if is_user {
            let param_defaults: Vec<Option<Node>> = match &self.functions.get(&record_key).expect("present").body {
                FunctionBody::User { params, .. } => params.iter().map(|p| p.default.clone()).collect(),
                FunctionBody::Builtin(_) => Vec::new(),
            };
            while full_args.len() < max {
                match param_defaults.get(full_args.len()).cloned().flatten() {
                    Some(expr) => {
                        let v = self.eval_expr(&expr)?;
                        full_args.push(v);
                    }
                    None => break,
                }
            }
        } else {
            let defaults = self.functions.get(&record_key).expect("present").defaults.clone();
            while full_args.len() < max {
                let idx = full_args.len() - min;
                match defaults.get(idx) {
                    Some(v) => full_args.push(v.clone()),
                    None => break,
                }
            }
        }

        match &self.functions.get(&record_key).expect("present").body {
            FunctionBody::Builtin(f) => {
                let f = f.clone();
                f(self, &full_args)
            }
            FunctionBody::User { params, body, parameter_pack } => {
                let params = params.clone();
                let body = body.clone();
                let parameter_pack = *parameter_pack;
                self.push_scope(None)?;
                for (param, value) in params.iter().zip(full_args.iter()) {
                    self.bind_variable(param.name.as_str(), value.clone());
                }
                if let Some(pack_name) = parameter_pack {
                    let extra: Vec<Literal> = full_args.iter().skip(params.len()).cloned().collect();
                    self.bind_variable(pack_name.as_str(), Literal::Str(format!("{} packed argument(s)", extra.len())));
                }
                let result = self.exec_block(&body);
                let return_value = match &self.control_flow {
                    ControlFlow::Return(v) => v.clone(),
                    _ => None,
                };
                self.control_flow = ControlFlow::None;
                self.pop_scope();
                result?;
                Ok(return_value.unwrap_or(Literal::Unsigned(0)))
            }
        }
    }

    // --- statements -------------------------------------------------------------

    fn exec_block(&mut self, stmts: &[Node]) -> EResult<()> {
        for stmt in stmts {
            self.check_abort(stmt.location)?;
            self.exec_stmt(stmt)?;
            if !matches!(self.control_flow, ControlFlow::None) {
                break;
            }
        }
        Ok(())
    }

    fn exec_stmt(&mut self, node: &Node) -> EResult<()> {
        match &*node.kind {
            Kind::CompoundStatement(stmts) => self.exec_block(stmts),
            Kind::ConditionalStatement { cond, then_branch, else_branch } => {
                if self.eval_bool(cond)? {
                    self.exec_block(then_branch)
                } else {
                    self.exec_block(else_branch)
                }
            }
            Kind::WhileStatement { cond, body, post } => {
                let mut iterations: u32 = 0;
                loop {
                    self.check_abort(node.location)?;
                    if let Some(c) = cond {
                        if !self.eval_bool(c)? {
                            break;
                        }
                    }
                    iterations += 1;
                    if iterations > self.limits.loop_limit {
                        return Err(Error::LimitExceeded { kind: "loop", limit: self.limits.loop_limit, location: node.location });
                    }
                    self.exec_block(body)?;
                    match self.control_flow {
                        ControlFlow::Break => {
                            self.control_flow = ControlFlow::None;
                            break;
                        }
                        ControlFlow::Continue => {
                            self.control_flow = ControlFlow::None;
                        }
                        ControlFlow::Return(_) => break,
                        ControlFlow::None => {}
                    }
                    if let Some(p) = post {
                        self.eval_expr(p)?;
                    }
                    if cond.is_none() && post.is_none() {
                        break;
                    }
                }
                Ok(())
            }
            Kind::MatchStatement { scrutinee, cases, default } => {
                let values: Vec<Literal> = scrutinee.iter().map(|s| self.eval_expr(s)).collect::<EResult<_>>()?;
                for (patterns, body) in cases {
                    if patterns.len() == values.len() {
                        let mut matched = true;
                        for (p, v) in patterns.iter().zip(values.iter()) {
                            let pv = self.eval_expr(p)?;
                            if !literal_eq(&pv, v) {
                                matched = false;
                                break;
                            }
                        }
                        if matched {
                            return self.exec_block(body);
                        }
                    }
                }
                if let Some(body) = default {
                    return self.exec_block(body);
                }
                Ok(())
            }
            Kind::ControlFlowStatement { kind, value } => {
                self.control_flow = match kind {
                    ControlFlowKind::Break => ControlFlow::Break,
                    ControlFlowKind::Continue => ControlFlow::Continue,
                    ControlFlowKind::Return => {
                        let v = match value {
                            Some(expr) => Some(self.eval_expr(expr)?),
                            None => None,
                        };
                        ControlFlow::Return(v)
                    }
                };
                Ok(())
            }
            Kind::TryCatchStatement { try_body, catch_body } => {
                let cursor = self.cursor;
                let section_depth = self.section_stack.len();
                let scope_depth = self.scopes.len();
                let heap_mark = self.heap.mark();
                match self.exec_block(try_body) {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        self.cursor = cursor;
                        self.section_stack.truncate(section_depth.max(1));
                        self.scopes.truncate(scope_depth.max(1));
                        self.heap.truncate(heap_mark);
                        self.control_flow = ControlFlow::None;
                        self.exec_block(catch_body)
                    }
                }
            }
            Kind::RValueAssignment { name, value } => {
                let v = self.eval_expr(value)?;
                self.bind_variable(name.as_str(), v);
                Ok(())
            }
            Kind::LValueAssignment { path, value } => {
                let v = self.eval_expr(value)?;
                self.assign_path(path, v, node.location)
            }
            Kind::FunctionCall { .. } | Kind::MathematicalExpression { .. } | Kind::UnaryExpression { .. } | Kind::TernaryExpression { .. } => {
                self.eval_expr(node).map(|_| ())
            }
            Kind::MultiVariableDecl(stmts) => self.exec_block(stmts),
            Kind::Namespace { body, .. } => self.exec_block(body),
            Kind::TypeDecl { .. } | Kind::Using { .. } | Kind::Import { .. } | Kind::FunctionDefinition { .. } => Ok(()),
            Kind::VariableDecl { type_, name, placement, section, attributes, io } => {
                self.declare_variable(type_, name.as_str(), placement.as_ref(), section.as_ref(), attributes, *io, node.location).map(|_| ())
            }
            Kind::ArrayVariableDecl { type_, name, size, placement, section, attributes } => {
                self.declare_array(type_, name.as_str(), size.as_ref(), placement.as_ref(), section.as_ref(), attributes, node.location).map(|_| ())
            }
            Kind::PointerVariableDecl { type_, name, size_type, placement, section, attributes } => {
                self.declare_pointer(type_, name.as_str(), size_type, placement.as_ref(), section.as_ref(), attributes, node.location).map(|_| ())
            }
            _ => Err(Error::Internal { message: format!("node is not a statement: {:?}", node.kind), location: node.location }),
        }
    }

    // --- placement ------------------------------------------------------------

    fn resolve_placement(&mut self, placement: Option<&Node>, section: Option<&Node>) -> EResult<(u64, SectionId)> {
        let section_id = match section {
            Some(expr) => {
                let lit = self.eval_expr(expr)?;
                self.named_section(&lit.to_display_string())
            }
            None => self.current_section(),
        };
        let offset = match placement {
            Some(expr) => self.eval_expr(expr)?.to_unsigned().map_err(|e| Error::Type(e, expr.location))?  as u64,
            None => if section.is_none() { self.cursor } else { self.section_size(section_id) },
        };
        Ok((offset, section_id))
    }

    fn declare_variable(
        &mut self,
        type_: &Node,
        name: &str,
        placement: Option<&Node>,
        section: Option<&Node>,
        attributes: &[Attribute],
        io: IoQualifier,
        location: Location,
    ) -> EResult<Literal> {
        match io {
            IoQualifier::In => {
                let value = self.in_vars.get(name).cloned().unwrap_or(Literal::Unsigned(0));
                self.bind_variable(name, value.clone());
                return Ok(value);
            }
            IoQualifier::Out => {
                self.out_names.push(name.to_string());
                self.bind_variable(name, Literal::Unsigned(0));
                return Ok(Literal::Unsigned(0));
            }
            IoQualifier::None => {}
        }

        let (offset, section_id) = self.resolve_placement(placement, section)?;
        let advances_cursor = placement.is_none() && section.is_none();
        let saved_cursor = self.cursor;
        // Composite bodies read `self.cursor` as their layout origin, so it
        // has to land on `offset` even for an explicit (non-sequential)
        // placement; only whether we keep advancing afterward differs.
        self.cursor = offset;
        let mut pattern = self.create_pattern(type_, name, location)?;
        self.apply_attributes(&mut pattern, attributes, location)?;
        {
            let mut data = pattern.borrow_mut();
            data.offset = offset;
            data.section_id = section_id;
        }
        if advances_cursor {
            let size = pattern.borrow().size;
            self.cursor = offset + size;
        } else {
            self.cursor = saved_cursor;
        }
        self.add_local_pattern(pattern.clone());
        self.patterns.push(pattern.clone());
        Ok(Literal::Pattern(pattern))
    }

    fn declare_array(
        &mut self,
        type_: &Node,
        name: &str,
        size: Option<&Node>,
        placement: Option<&Node>,
        section: Option<&Node>,
        attributes: &[Attribute],
        location: Location,
    ) -> EResult<Literal> {
        let (offset, section_id) = self.resolve_placement(placement, section)?;
        let saved_cursor = self.cursor;
        self.cursor = offset;

        let count = match size {
            Some(expr) => self.eval_expr(expr)?.to_unsigned().map_err(|e| Error::Type(e, expr.location))? as u64,
            None => u64::MAX,
        };
        if count > self.limits.array_limit as u64 {
            return Err(Error::LimitExceeded { kind: "array", limit: self.limits.array_limit, location });
        }

        let element_type_name = type_name_of(type_);
        let mut children = Vec::new();
        let section_size = self.section_size(section_id);
        let mut i: u64 = 0;
        while i < count {
            if size.is_none() && self.cursor >= section_size {
                break;
            }
            self.check_abort(location)?;
            self.bind_variable("current_array_index", Literal::Unsigned(i as u128));
            let mut child = self.create_pattern(type_, &format!("[{i}]"), location)?;
            {
                let mut data = child.borrow_mut();
                data.offset = self.cursor;
                data.section_id = section_id;
            }
            self.cursor += child.borrow().size;
            self.pattern_count += 1;
            if self.pattern_count > self.limits.pattern_limit {
                return Err(Error::LimitExceeded { kind: "pattern", limit: self.limits.pattern_limit, location });
            }
            children.push(child);
            i += 1;
        }
        let total_size: u64 = children.iter().map(|c| c.borrow().size).sum();
        let mut pattern = Pattern::new(PatternData {
            offset,
            size: total_size,
            bit_offset: None,
            bit_size: None,
            section_id,
            endian: EndianSetting::inherited(self.default_endian),
            variable_name: name.to_string(),
            name_location: location,
            type_name: format!("{element_type_name}[{}]", children.len()),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location,
            parent: None,
            variant: if size.is_some() { Variant::ArrayStatic { children: children.clone(), element_type_name } } else { Variant::ArrayDynamic { children: children.clone(), element_type_name } },
        });
        for child in &children {
            child.set_parent(&pattern);
        }
        self.apply_attributes(&mut pattern, attributes, location)?;
        if placement.is_none() && section.is_none() {
            self.cursor = offset + total_size;
        } else {
            self.cursor = saved_cursor;
        }
        self.add_local_pattern(pattern.clone());
        self.patterns.push(pattern.clone());
        Ok(Literal::Pattern(pattern))
    }

    fn declare_pointer(
        &mut self,
        type_: &Node,
        name: &str,
        size_type: &Node,
        placement: Option<&Node>,
        section: Option<&Node>,
        attributes: &[Attribute],
        location: Location,
    ) -> EResult<Literal> {
        let (offset, section_id) = self.resolve_placement(placement, section)?;
        let saved_cursor = self.cursor;
        self.cursor = offset;

        let mut address_pattern = self.create_pattern(size_type, name, location)?;
        {
            let mut data = address_pattern.borrow_mut();
            data.offset = offset;
            data.section_id = section_id;
        }
        let address = self.read_pattern_value(&address_pattern, location)?.to_unsigned().map_err(|e| Error::Type(e, location))?;
        let pointer_size = address_pattern.borrow().size;

        let after_cursor = self.cursor.max(offset + pointer_size);
        let before = self.cursor;
        self.cursor = address as u64;
        let mut pointee = self.create_pattern(type_, name, location)?;
        {
            let mut data = pointee.borrow_mut();
            data.offset = address as u64;
            data.section_id = section_id;
        }
        self.cursor = before;

        let pointer_type_name = type_name_of(type_);
        let mut pattern = Pattern::new(PatternData {
            offset,
            size: pointer_size,
            bit_offset: None,
            bit_size: None,
            section_id,
            endian: EndianSetting::inherited(self.default_endian),
            variable_name: name.to_string(),
            name_location: location,
            type_name: format!("{pointer_type_name}*"),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location,
            parent: None,
            variant: Variant::Pointer { pointee: Box::new(pointee.clone()), pointer_type_name },
        });
        pointee.set_parent(&pattern);
        self.apply_attributes(&mut pattern, attributes, location)?;
        if placement.is_none() && section.is_none() {
            self.cursor = after_cursor;
        } else {
            self.cursor = saved_cursor;
        }
        self.add_local_pattern(pattern.clone());
        self.patterns.push(pattern.clone());
        Ok(Literal::Pattern(pattern))
    }

    fn apply_attributes(&mut self, pattern: &mut Pattern, attributes: &[Attribute], location: Location) -> EResult<()> {
        for attr in attributes {
            let mut data = pattern.borrow_mut();
            match attr.name.as_str() {
                "color" => {
                    if let Some(arg) = attr.args.first() {
                        drop(data);
                        let v = self.eval_expr(arg)?.to_unsigned().map_err(|e| Error::Type(e, location))?;
                        pattern.borrow_mut().color = Some(v as u32);
                    }
                }
                "name" => {
                    if let Some(arg) = attr.args.first() {
                        drop(data);
                        let v = self.eval_expr(arg)?.to_display_string();
                        pattern.borrow_mut().variable_name = v;
                    }
                }
                "comment" => {
                    if let Some(arg) = attr.args.first() {
                        drop(data);
                        let v = self.eval_expr(arg)?.to_display_string();
                        pattern.borrow_mut().comment = Some(v);
                    }
                }
                "format" => {
                    if let Some(arg) = attr.args.first() {
                        let v = string_literal_of(arg);
                        data.format_read_function = v.clone();
                        data.format_write_function = v;
                    }
                }
                "format_read" => data.format_read_function = attr.args.first().and_then(string_literal_of),
                "format_write" => data.format_write_function = attr.args.first().and_then(string_literal_of),
                "transform" => data.transform_function = attr.args.first().and_then(string_literal_of),
                "hidden" => data.visibility = Visibility::Hidden,
                "tree_hidden" => data.visibility = Visibility::TreeHidden,
                "highlight_hidden" => data.visibility = Visibility::HighlightHidden,
                "sealed" | "inline" | "single" | "export" | "no_unique_address" | "pointer_base" => {
                    data.attributes.entry(attr.name.to_string()).or_default();
                }
                other => {
                    return Err(Error::InvalidAttribute { name: other.to_string(), message: "unrecognized attribute".into(), location: attr.location });
                }
            }
        }
        Ok(())
    }

    // --- type -> pattern walk ----------------------------------------------

    fn create_pattern(&mut self, type_node: &Node, name: &str, location: Location) -> EResult<Pattern> {
        self.pattern_count += 1;
        if self.pattern_count > self.limits.pattern_limit {
            return Err(Error::LimitExceeded { kind: "pattern", limit: self.limits.pattern_limit, location });
        }
        match &*type_node.kind {
            Kind::BuiltinType(vt) => self.create_primitive(*vt, name, location),
            Kind::ImportedType { name: type_name } => {
                self.apply_depth += 1;
                if self.apply_depth > self.limits.evaluation_depth {
                    self.apply_depth -= 1;
                    return Err(Error::LimitExceeded { kind: "evaluation depth", limit: self.limits.evaluation_depth, location });
                }
                let decl = self.lookup_type(type_name).ok_or_else(|| Error::Undefined { what: "type", name: type_name.clone(), location });
                let result = decl.and_then(|decl| self.create_pattern(&decl, name, location));
                self.apply_depth -= 1;
                let mut pattern = result?;
                if pattern.borrow().type_name.is_empty() {
                    pattern.borrow_mut().type_name = type_name.clone();
                }
                Ok(pattern)
            }
            Kind::TypeApplication { type_, endian, .. } => {
                self.apply_depth += 1;
                if self.apply_depth > self.limits.evaluation_depth {
                    self.apply_depth -= 1;
                    return Err(Error::LimitExceeded { kind: "evaluation depth", limit: self.limits.evaluation_depth, location });
                }
                let result = self.create_pattern(type_, name, location);
                self.apply_depth -= 1;
                let mut pattern = result?;
                if let Some(e) = endian {
                    pattern.borrow_mut().endian = EndianSetting::explicit(*e);
                }
                Ok(pattern)
            }
            Kind::TypeDecl { body, name: type_name, .. } => {
                let mut pattern = self.create_pattern(body, name, location)?;
                pattern.borrow_mut().type_name = type_name.to_string();
                Ok(pattern)
            }
            Kind::Using { target, .. } => self.create_pattern(target, name, location),
            Kind::Struct { members, inherits, attributes } => self.create_struct(members, inherits, attributes, name, location),
            Kind::Union { members, attributes } => self.create_union(members, attributes, name, location),
            Kind::Bitfield { members, attributes } => self.create_bitfield(members, attributes, name, location),
            Kind::Enum { underlying, entries } => self.create_enum(underlying, entries, name, location),
            _ => Err(Error::Internal { message: format!("node is not a type: {:?}", type_node.kind), location }),
        }
    }

    fn create_primitive(&mut self, vt: ValueType, name: &str, location: Location) -> EResult<Pattern> {
        let size = vt.size_of() as u64;
        let variant = match vt {
            ValueType::Bool => Variant::Boolean,
            ValueType::Char => Variant::Character,
            ValueType::Char16 => Variant::WideCharacter,
            ValueType::Str => Variant::String,
            ValueType::Padding => Variant::Padding,
            ValueType::Float | ValueType::Double => Variant::Float,
            vt if vt.is_signed() => Variant::Signed,
            _ => Variant::Unsigned,
        };
        Ok(Pattern::new(PatternData {
            offset: self.cursor,
            size,
            bit_offset: None,
            bit_size: None,
            section_id: self.current_section(),
            endian: EndianSetting::inherited(self.default_endian),
            variable_name: name.to_string(),
            name_location: location,
            type_name: format!("{vt:?}").to_lowercase(),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location,
            parent: None,
            variant,
        }))
    }

    fn create_struct(&mut self, members: &[Node], inherits: &[Node], attributes: &[Attribute], name: &str, location: Location) -> EResult<Pattern> {
        let start = self.cursor;
        let section_id = self.current_section();
        let placeholder = Pattern::new(PatternData {
            offset: start,
            size: 0,
            bit_offset: None,
            bit_size: None,
            section_id,
            endian: EndianSetting::inherited(self.default_endian),
            variable_name: name.to_string(),
            name_location: location,
            type_name: String::new(),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location,
            parent: None,
            variant: Variant::Struct { children: Vec::new() },
        });
        self.push_scope(Some(placeholder.clone()))?;

        let mut children: Vec<Pattern> = Vec::new();
        for inherited in inherits {
            if let Kind::ImportedType { name: type_name } = &*inherited.kind {
                if let Some(decl) = self.lookup_type(type_name) {
                    let base = self.create_pattern(&decl, "", location)?;
                    children.extend(base.children());
                }
            }
        }

        for member in members {
            let before = children.len();
            self.exec_stmt(member)?;
            children.extend(self.scope().locals[before.min(self.scope().locals.len())..].to_vec());
            match self.control_flow {
                ControlFlow::Continue => {
                    self.control_flow = ControlFlow::None;
                    children.clear();
                    self.scope_mut().locals.clear();
                    self.cursor = start;
                }
                ControlFlow::Break => {
                    self.control_flow = ControlFlow::None;
                    break;
                }
                _ => {}
            }
        }
        self.pop_scope();

        let size = self.cursor - start;
        placeholder.borrow_mut().size = size;
        {
            let mut data = placeholder.borrow_mut();
            data.variant = Variant::Struct { children: children.clone() };
        }
        for child in &children {
            child.set_parent(&placeholder);
        }
        let mut pattern = placeholder;
        self.apply_attributes(&mut pattern, attributes, location)?;
        Ok(pattern)
    }

    fn create_union(&mut self, members: &[Node], attributes: &[Attribute], name: &str, location: Location) -> EResult<Pattern> {
        let start = self.cursor;
        let section_id = self.current_section();
        let placeholder = Pattern::new(PatternData {
            offset: start,
            size: 0,
            bit_offset: None,
            bit_size: None,
            section_id,
            endian: EndianSetting::inherited(self.default_endian),
            variable_name: name.to_string(),
            name_location: location,
            type_name: String::new(),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location,
            parent: None,
            variant: Variant::Union { children: Vec::new() },
        });
        self.push_scope(Some(placeholder.clone()))?;
        let mut max_size = 0u64;
        let mut children = Vec::new();
        for member in members {
            self.cursor = start;
            let before = self.scope().locals.len();
            self.exec_stmt(member)?;
            children.extend(self.scope().locals[before..].to_vec());
            max_size = max_size.max(self.cursor - start);
        }
        self.pop_scope();
        self.cursor = start + max_size;
        placeholder.borrow_mut().size = max_size;
        placeholder.borrow_mut().variant = Variant::Union { children: children.clone() };
        for child in &children {
            child.set_parent(&placeholder);
        }
        let mut pattern = placeholder;
        self.apply_attributes(&mut pattern, attributes, location)?;
        Ok(pattern)
    }

    fn create_bitfield(&mut self, members: &[Node], attributes: &[Attribute], name: &str, location: Location) -> EResult<Pattern> {
        let start = self.cursor;
        let section_id = self.current_section();

        let mut order = BitOrder::RightToLeft;
        let mut fixed_bits: Option<u64> = None;
        for attr in attributes {
            if attr.name.as_str() == "bitfield_order" {
                if let Some(dir) = attr.args.first().and_then(string_literal_of) {
                    order = if dir == "left_to_right" { BitOrder::LeftToRight } else { BitOrder::RightToLeft };
                }
                if let Some(size_expr) = attr.args.get(1) {
                    fixed_bits = Some(self.eval_expr(size_expr)?.to_unsigned().map_err(|e| Error::Type(e, location))? as u64);
                }
            }
        }

        let mut field_specs: Vec<(Ustr, u64, BitfieldFieldKind)> = Vec::new();
        for member in members {
            if let Kind::BitfieldField { name: field_name, size, kind, .. } = &*member.kind {
                let bits = self.eval_expr(size)?.to_unsigned().map_err(|e| Error::Type(e, location))? as u64;
                let runtime_kind = match kind {
                    AstBitfieldFieldKind::Boolean => BitfieldFieldKind::Boolean,
                    AstBitfieldFieldKind::Signed => BitfieldFieldKind::Signed,
                    AstBitfieldFieldKind::Typed => BitfieldFieldKind::Enum,
                    AstBitfieldFieldKind::Plain => BitfieldFieldKind::Unsigned,
                };
                field_specs.push((*field_name, bits, runtime_kind));
            }
        }
        let natural_bits: u64 = field_specs.iter().map(|(_, b, _)| b).sum();
        let total_bits = fixed_bits.unwrap_or(natural_bits);
        let total_bytes = ((total_bits + 7) / 8).max(1);

        let mut children = Vec::new();
        let mut used = 0u64;
        // Both orders walk fields in declaration order; only the offset
        // formula differs. `LeftToRight` puts the first-declared field in
        // the high bits, so reversing the walk here would cancel back out
        // to `RightToLeft`'s layout.
        for (field_name, bits, kind) in field_specs.iter() {
            let bit_offset = match order {
                BitOrder::RightToLeft => used,
                BitOrder::LeftToRight => total_bits.saturating_sub(used + bits),
            };
            let child = Pattern::new(PatternData {
                offset: start,
                size: total_bytes,
                bit_offset: Some(bit_offset as u8),
                bit_size: Some(*bits as u8),
                section_id,
                endian: EndianSetting::inherited(self.default_endian),
                variable_name: field_name.to_string(),
                name_location: location,
                type_name: "bit".to_string(),
                comment: None,
                color: None,
                visibility: Visibility::Visible,
                format_read_function: None,
                format_write_function: None,
                transform_function: None,
                attributes: AHashMap::new(),
                location,
                parent: None,
                variant: Variant::BitfieldField { bits: *kind },
            });
            children.push(child);
            used += bits;
        }

        self.cursor = start + total_bytes;
        let pattern = Pattern::new(PatternData {
            offset: start,
            size: total_bytes,
            bit_offset: None,
            bit_size: Some(total_bits as u8),
            section_id,
            endian: EndianSetting::inherited(self.default_endian),
            variable_name: name.to_string(),
            name_location: location,
            type_name: String::new(),
            comment: None,
            color: None,
            visibility: Visibility::Visible,
            format_read_function: None,
            format_write_function: None,
            transform_function: None,
            attributes: AHashMap::new(),
            location,
            parent: None,
            variant: Variant::Bitfield { children: children.clone() },
        });
        for child in &children {
            child.set_parent(&pattern);
        }
        let mut pattern = pattern;
        self.apply_attributes(&mut pattern, attributes, location)?;
        Ok(pattern)
    }

    fn create_enum(&mut self, underlying: &Node, entries: &[(Ustr, Option<Node>)], name: &str, location: Location) -> EResult<Pattern> {
        let mut pattern = self.create_pattern(underlying, name, location)?;
        let mut next_value: i128 = 0;
        let mut table = Vec::with_capacity(entries.len());
        for (entry_name, value_expr) in entries {
            if let Some(expr) = value_expr {
                next_value = self.eval_expr(expr)?.to_signed().map_err(|e| Error::Type(e, location))?;
            }
            table.push((*entry_name, Literal::Signed(next_value)));
            next_value += 1;
        }
        pattern.borrow_mut().variant = Variant::Enum { entries: table };
        Ok(pattern)
    }
}

/// Wraps the embedder-supplied main data section so it reports `MainSection`
/// in error messages while still delegating to whatever concrete section
/// the caller provided (in-memory bytes or a `DataSourceSection`).
struct MainBacking(Box<dyn Section>);

impl Section for MainBacking {
    fn raw_size(&self) -> u64 {
        self.0.size()
    }

    fn resize_raw(&mut self, new_size: u64) -> Result<(), IoError> {
        self.0.resize(new_size)
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.0.read(offset, buf)
    }

    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        self.0.write(offset, data, false)
    }
}

fn literal_eq(a: &Literal, b: &Literal) -> bool {
    a.to_display_string() == b.to_display_string() || a == b
}

fn type_name_of(node: &Node) -> String {
    match &*node.kind {
        Kind::BuiltinType(vt) => format!("{vt:?}").to_lowercase(),
        Kind::ImportedType { name } => name.clone(),
        Kind::TypeDecl { name, .. } => name.to_string(),
        Kind::TypeApplication { type_, .. } => type_name_of(type_),
        _ => String::new(),
    }
}

fn string_literal_of(node: &Node) -> Option<String> {
    match &*node.kind {
        Kind::Literal(Literal::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Arbitrary-bit-width primitives (bitfields, odd-sized integer members) run
/// through `read_uint128`/`read_int128`, which `byteorder` supports for any
/// width up to 16 bytes; the fixed 4/8-byte float paths use its `read_f32`/
/// `read_f64` directly.
fn decode_unsigned(bytes: &[u8], endian: Endian) -> u128 {
    if bytes.is_empty() {
        return 0;
    }
    let nbytes = bytes.len().min(16);
    match endian {
        Endian::Big => BigEndian::read_uint128(bytes, nbytes),
        Endian::Little => LittleEndian::read_uint128(bytes, nbytes),
        Endian::Native => NativeEndian::read_uint128(bytes, nbytes),
    }
}

fn decode_signed(bytes: &[u8], endian: Endian) -> i128 {
    if bytes.is_empty() {
        return 0;
    }
    let nbytes = bytes.len().min(16);
    match endian {
        Endian::Big => BigEndian::read_int128(bytes, nbytes),
        Endian::Little => LittleEndian::read_int128(bytes, nbytes),
        Endian::Native => NativeEndian::read_int128(bytes, nbytes),
    }
}

fn decode_float(bytes: &[u8], endian: Endian) -> f64 {
    match bytes.len() {
        4 => (match endian {
            Endian::Big => BigEndian::read_f32(bytes),
            Endian::Little => LittleEndian::read_f32(bytes),
            Endian::Native => NativeEndian::read_f32(bytes),
        }) as f64,
        8 => match endian {
            Endian::Big => BigEndian::read_f64(bytes),
            Endian::Little => LittleEndian::read_f64(bytes),
            Endian::Native => NativeEndian::read_f64(bytes),
        },
        _ => 0.0,
    }
}

fn encode_unsigned(value: u128, size: usize, endian: Endian) -> Vec<u8> {
    if size == 0 {
        return Vec::new();
    }
    let nbytes = size.min(16);
    let mut bytes = vec![0u8; nbytes];
    match endian {
        Endian::Big => BigEndian::write_uint128(&mut bytes, value, nbytes),
        Endian::Little => LittleEndian::write_uint128(&mut bytes, value, nbytes),
        Endian::Native => NativeEndian::write_uint128(&mut bytes, value, nbytes),
    }
    bytes.resize(size, 0);
    bytes
}

fn encode_float(value: f64, size: usize, endian: Endian) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    match size {
        4 => match endian {
            Endian::Big => BigEndian::write_f32(&mut bytes, value as f32),
            Endian::Little => LittleEndian::write_f32(&mut bytes, value as f32),
            Endian::Native => NativeEndian::write_f32(&mut bytes, value as f32),
        },
        8 => match endian {
            Endian::Big => BigEndian::write_f64(&mut bytes, value),
            Endian::Little => LittleEndian::write_f64(&mut bytes, value),
            Endian::Native => NativeEndian::write_f64(&mut bytes, value),
        },
        _ => {}
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as Map;
    use pat_sections::InMemorySection;

    fn run_src(src: &str, data: Vec<u8>) -> Evaluator {
        let (tokens, lex_errors) = pat_lexer::lex(1u32, src);
        assert!(lex_errors.is_empty(), "{lex_errors:?}");
        let parsed = pat_parser::parse(tokens).expect("clean parse");
        let parsed = pat_validate::validate(parsed, pat_validate::DEFAULT_RECURSION_LIMIT).expect("valid program");
        let ParseOutput { statements, types } = parsed;
        let main: Box<dyn Section> = Box::new(InMemorySection::with_data(data, u64::MAX));
        let mut eval = Evaluator::new(main, types, Limits::default());
        eval.run(&statements).expect("evaluation succeeds");
        eval
    }

    #[test]
    fn fixed_struct_reads_little_endian_fields() {
        let eval = run_src("struct P { u8 a; u16 b; u8 c; }; P p @ 0x00;", vec![0x01, 0x02, 0x03, 0x04]);
        let p = eval.patterns().iter().find(|p| p.borrow().variable_name == "p").unwrap();
        assert_eq!(p.borrow().size, 4);
        let a = p.children()[0].clone();
        assert_eq!(a.borrow().variable_name, "a");
    }

    #[test]
    fn bitfield_default_order_reads_low_bits_first() {
        let mut eval = run_src("bitfield B { x : 3; y : 5; }; B b @ 0;", vec![0xA5]);
        let b = eval.patterns()[0].clone();
        let x = b.children()[0].clone();
        let y = b.children()[1].clone();
        let xv = eval.read_pattern_value(&x, Location::empty()).unwrap();
        let yv = eval.read_pattern_value(&y, Location::empty()).unwrap();
        assert_eq!(xv.to_unsigned().unwrap(), 5);
        assert_eq!(yv.to_unsigned().unwrap(), 0x14);
    }

    #[test]
    fn conditional_layout_adds_field_when_tag_matches() {
        let eval = run_src("struct H { u8 tag; if (tag == 1) { u32 v; } };", vec![0x01, 0x10, 0x00, 0x00, 0x00]);
        let h = eval.patterns()[0].clone();
        assert_eq!(h.borrow().size, 5);
    }

    #[test]
    fn function_and_out_variable_round_trip() {
        let mut eval = run_src("fn main() { return 42; } out u32 r; r = main();", vec![]);
        let _ = &mut eval;
        assert_eq!(eval.out_vars().get("r").and_then(|l| l.to_unsigned().ok()), Some(42));
    }

    #[test]
    fn array_limit_is_enforced() {
        let (tokens, _) = pat_lexer::lex(1u32, "u8 a[100];");
        let parsed = pat_parser::parse(tokens).expect("clean parse");
        let ParseOutput { statements, types } = parsed;
        let main: Box<dyn Section> = Box::new(InMemorySection::with_data(vec![0u8; 100], u64::MAX));
        let mut eval = Evaluator::new(main, types, Limits { array_limit: 10, ..Limits::default() });
        let err = eval.run(&statements).expect_err("array limit should trip");
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn writing_to_main_section_is_refused() {
        let (tokens, _) = pat_lexer::lex(1u32, "u8 a @ 0;");
        let parsed = pat_parser::parse(tokens).expect("clean parse");
        let ParseOutput { statements, types } = parsed;
        let main: Box<dyn Section> = Box::new(InMemorySection::with_data(vec![5u8], 1));
        let mut eval = Evaluator::new(main, types, Limits::default());
        eval.run(&statements).unwrap();
        let pattern = eval.patterns()[0].clone();
        let err = eval.write_pattern_value(&pattern, Literal::Unsigned(9), Location::empty()).unwrap_err();
        assert_eq!(err.code(), 11);
        let _ = Map::<String, Literal>::new();
    }
}
