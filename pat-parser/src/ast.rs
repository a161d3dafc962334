//! The polymorphic AST node set. A tagged-variant enum with boxed
//! children, not a class hierarchy: every node carries its location and
//! doc-comment bookkeeping uniformly, and dispatches on `kind`.

use pat_diagnostics::Location;
use pat_lexer::token::{Operator, ValueType};
use pat_tree::Literal;
use ustr::Ustr;

#[derive(Debug, Clone)]
pub struct Node {
    pub location: Location,
    pub doc_comment: Option<String>,
    pub should_document: bool,
    pub kind: Box<Kind>,
}

impl Node {
    pub fn new(location: Location, kind: Kind) -> Self {
        Self { location, doc_comment: None, should_document: false, kind: Box::new(kind) }
    }

    pub fn with_doc(mut self, doc: Option<String>) -> Self {
        self.should_document = doc.is_some();
        self.doc_comment = doc;
        self
    }
}

/// One segment of an `RValue`/assignment path: `a.b[3].c`, `parent.x`, `this`.
#[derive(Debug, Clone)]
pub enum PathSegment {
    Identifier(Ustr),
    Index(Node),
    Parent,
    This,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TypeOperatorKind {
    SizeOf,
    AddressOf,
    TypeNameOf,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlFlowKind {
    Break,
    Continue,
    Return,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: Ustr,
    pub args: Vec<Node>,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub struct TemplateParameter {
    pub name: Ustr,
    pub is_type: bool,
    pub default: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub type_: Option<Node>,
    pub name: Ustr,
    pub default: Option<Node>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AstBitfieldFieldKind {
    Plain,
    Signed,
    Boolean,
    Typed,
}

/// Whether a top-level variable declaration is bound to the runtime's
/// `in`/`out` maps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IoQualifier {
    #[default]
    None,
    In,
    Out,
}

#[derive(Debug, Clone)]
pub enum Kind {
    Literal(Literal),
    RValue(Vec<PathSegment>),
    LValueAssignment { path: Vec<PathSegment>, value: Node },
    RValueAssignment { name: Ustr, value: Node },
    MathematicalExpression { op: Operator, lhs: Node, rhs: Node },
    UnaryExpression { op: Operator, operand: Node },
    TernaryExpression { cond: Node, then_branch: Node, else_branch: Node },
    Cast { target_type: Node, value: Node, reinterpret: bool },
    TypeOperator { op: TypeOperatorKind, target: Node },
    BuiltinType(ValueType),
    TypeDecl { name: Ustr, body: Node, template_params: Vec<TemplateParameter> },
    TypeApplication { type_: Node, template_args: Vec<Node>, endian: Option<pat_tree::Endian> },
    ImportedType { name: String },
    Struct { members: Vec<Node>, inherits: Vec<Node>, attributes: Vec<Attribute> },
    Union { members: Vec<Node>, attributes: Vec<Attribute> },
    Bitfield { members: Vec<Node>, attributes: Vec<Attribute> },
    Enum { underlying: Node, entries: Vec<(Ustr, Option<Node>)> },
    VariableDecl {
        type_: Node,
        name: Ustr,
        placement: Option<Node>,
        section: Option<Node>,
        attributes: Vec<Attribute>,
        io: IoQualifier,
    },
    ArrayVariableDecl {
        type_: Node,
        name: Ustr,
        size: Option<Node>,
        placement: Option<Node>,
        section: Option<Node>,
        attributes: Vec<Attribute>,
    },
    PointerVariableDecl {
        type_: Node,
        name: Ustr,
        size_type: Node,
        placement: Option<Node>,
        section: Option<Node>,
        attributes: Vec<Attribute>,
    },
    BitfieldField { name: Ustr, size: Node, kind: AstBitfieldFieldKind, type_: Option<Node> },
    BitfieldArrayVariableDecl { name: Ustr, field_size: Node, count: Node, attributes: Vec<Attribute> },
    FunctionDefinition { name: String, params: Vec<Param>, body: Vec<Node>, parameter_pack: Option<Ustr> },
    FunctionCall { path: Vec<Ustr>, args: Vec<Node> },
    CompoundStatement(Vec<Node>),
    ConditionalStatement { cond: Node, then_branch: Vec<Node>, else_branch: Vec<Node> },
    MatchStatement { scrutinee: Vec<Node>, cases: Vec<(Vec<Node>, Vec<Node>)>, default: Option<Vec<Node>> },
    WhileStatement { cond: Option<Node>, body: Vec<Node>, post: Option<Node> },
    ControlFlowStatement { kind: ControlFlowKind, value: Option<Node> },
    TryCatchStatement { try_body: Vec<Node>, catch_body: Vec<Node> },
    ScopeResolution { path: Vec<Ustr> },
    AttributeNode(Attribute),
    ParameterPack(Ustr),
    TemplateParameterNode(TemplateParameter),
    MultiVariableDecl(Vec<Node>),
    Namespace { path: Vec<Ustr>, body: Vec<Node> },
    Using { name: Ustr, target: Node, template_params: Vec<TemplateParameter> },
    Import { path: String, as_prefix: Option<Ustr> },
}
