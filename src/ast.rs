//! The dual-level AST node model.
//!
//! Every reconstructed function is represented as (at least) two trees over one shared pool of
//! nodes: a low-level tree that mirrors the decoded instructions one primitive
//! assignment/call at a time, and a high-level tree produced from it by value propagation and
//! dead-assignment elimination. Nodes refer to their children by id, never by value, so
//! structurally identical subtrees may be shared across parents and across trees.

use crate::containers::unordered::UnorderedSet;
use crate::containers::InsertionOrderedSet;

/// Identity of a statement *or* an instruction. The two families deliberately share one id space:
/// provenance facts relate high-level statements to low-level instructions by id, which only works
/// if an id names a unique node across both families.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(pub(crate) usize);

/// Identity of an lvalue node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LValId(pub(crate) usize);

/// Identity of an expression node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) usize);

/// Identity of an interned type node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) usize);

impl std::fmt::Debug for StmtId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}
impl std::fmt::Debug for LValId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}
impl std::fmt::Debug for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}
impl std::fmt::Debug for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The address span of the machine instruction(s) a node was reconstructed from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrSpan {
    /// Address of the first originating instruction
    pub lo: u64,
    /// One past the last originating byte
    pub hi: u64,
}
impl std::fmt::Debug for AddrSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.lo, self.hi)
    }
}

/// Retention overrides on an assignment, set by the (out of scope) per-opcode lowering.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct AssignFlags {
    /// Force retention even when the assigned value has been propagated downstream. Used for
    /// writes def-use analysis cannot see, such as struct or array element stores.
    pub expose: bool,
    /// The store must be materialized in the output regardless of any liveness evidence.
    pub must_materialize: bool,
}

impl AssignFlags {
    pub fn any(&self) -> bool {
        self.expose || self.must_materialize
    }
}

/// The target of a call instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CallTarget {
    /// Call to a named function
    Direct { name: String },
    /// Call through a computed address
    Indirect { callee: ExprId },
}

/// A statement or instruction node.
///
/// Statements are the structural family (blocks, branches, loops, ...); instructions are the two
/// primitive operation kinds (`Assign`, `Call`) that lowering emits one-or-more of per decoded
/// machine instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Stmt {
    /// A `{ ... }` grouping of statements
    Block { stmts: Vec<StmtId> },
    /// A straight-line run of instructions
    Seq { insts: Vec<StmtId> },
    /// An if/else. `else_stmt` is `None` for a one-armed branch.
    Branch {
        cond: ExprId,
        then_stmt: StmtId,
        else_stmt: Option<StmtId>,
    },
    /// A loop; `cond` of `None` loops forever (until broken out of by a `Goto`/`Return` inside)
    Loop { cond: Option<ExprId>, body: StmtId },
    /// Return from the function
    Return { value: Option<ExprId> },
    /// Unstructured jump to a label
    Goto { label: String },
    /// A switch over `scrutinee`; cases are `(match value, arm)` pairs
    Switch {
        scrutinee: ExprId,
        cases: Vec<(u64, StmtId)>,
        default: Option<StmtId>,
    },
    /// The assignment instruction `lhs = rhs`
    Assign {
        lhs: LValId,
        rhs: ExprId,
        flags: AssignFlags,
    },
    /// The call instruction. `kills` is the set of variable names whose propagated values the call
    /// invalidates (supplied by lowering; includes address-taken variables).
    Call {
        result: Option<LValId>,
        target: CallTarget,
        args: Vec<ExprId>,
        kills: Vec<String>,
    },
}

impl Stmt {
    /// True for the two instruction kinds, false for the structural statements.
    pub fn is_instruction(&self) -> bool {
        matches!(self, Stmt::Assign { .. } | Stmt::Call { .. })
    }
}

/// The sub-object selector carried by an lvalue.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Offset {
    /// The whole object
    None,
    /// A named struct field at a byte offset
    Field { name: String, byte_offset: u64 },
    /// An array element; `scale` is the element size in bytes
    Index { index: ExprId, scale: u64 },
}

/// An lvalue node: a location that can be written.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LVal {
    /// A named variable (resolved through the symbol tables)
    Var { name: String, offset: Offset },
    /// A memory location reached through a computed address
    Deref { addr: ExprId, offset: Offset },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum UnaryOp {
    Neg,
    BitNot,
    LogicalNot,
}

impl UnaryOp {
    pub fn all_ops() -> Vec<Self> {
        use UnaryOp::*;
        vec![Neg, BitNot, LogicalNot]
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
            UnaryOp::LogicalNot => "!",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    Eq,
    Ne,
    ULt,
    ULe,
    SLt,
    SLe,
}

impl BinaryOp {
    pub fn all_ops() -> Vec<Self> {
        use BinaryOp::*;
        vec![
            Add, Sub, Mul, UDiv, SDiv, URem, SRem, And, Or, Xor, Shl, LShr, AShr, Eq, Ne, ULt,
            ULe, SLt, SLe,
        ]
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::UDiv => "/u",
            BinaryOp::SDiv => "/",
            BinaryOp::URem => "%u",
            BinaryOp::SRem => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::LShr => ">>u",
            BinaryOp::AShr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::ULt => "<u",
            BinaryOp::ULe => "<=u",
            BinaryOp::SLt => "<",
            BinaryOp::SLe => "<=",
        }
    }
}

/// An expression node.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Expr {
    /// An integer literal of a given byte size
    Const { value: u64, size: u8 },
    /// A read of an lvalue
    Read { lval: LValId },
    /// A type cast
    Cast { ty: TypeId, arg: ExprId },
    Unary {
        op: UnaryOp,
        arg: ExprId,
    },
    Binary {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Ternary {
        cond: ExprId,
        then_expr: ExprId,
        else_expr: ExprId,
    },
    AddressOf { lval: LValId },
    SizeOf { ty: TypeId },
    /// An expression substituted in by forward value propagation. `original` is the lvalue whose
    /// read was replaced; it is kept for traceability (the renderer shows only the substitute).
    Substituted { original: LValId, substitute: ExprId },
}

/// An interned type node. Types are pure values, so the pool deduplicates them structurally.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum CType {
    Void,
    Int { size: u8, signed: bool },
    Float { size: u8 },
    Pointer { pointee: TypeId },
    Array { element: TypeId, count: u64 },
    Function { ret: TypeId, params: Vec<TypeId> },
    /// Reference to a struct layout registered in the global symbol table under `key`
    Struct { key: String },
    /// Reference to an enum definition registered in the global symbol table under `key`
    Enum { key: String },
    Typedef { name: String, aliased: TypeId },
}

/// The sole owner of every node in a translation unit.
///
/// Ids index directly into the pool and are monotonically increasing across all functions of the
/// unit, never reset, so shared or duplicated subtrees keep a stable identity everywhere. Only the
/// [`TreeBuilder`](crate::builder::TreeBuilder) mints ids; everything else holds plain indices.
#[derive(Default)]
pub struct NodePool {
    stmts: Vec<Stmt>,
    lvals: Vec<LVal>,
    exprs: Vec<Expr>,
    types: InsertionOrderedSet<CType>,
}

impl NodePool {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0]
    }

    pub fn lval(&self, id: LValId) -> &LVal {
        &self.lvals[id.0]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0]
    }

    pub fn ctype(&self, id: TypeId) -> &CType {
        self.types
            .get(id.0)
            .unwrap_or_else(|| panic!("Type {:?} was never interned in this pool", id))
    }

    pub(crate) fn alloc_stmt(&mut self, s: Stmt) -> StmtId {
        let id = StmtId(self.stmts.len());
        self.stmts.push(s);
        id
    }

    pub(crate) fn alloc_lval(&mut self, l: LVal) -> LValId {
        let id = LValId(self.lvals.len());
        self.lvals.push(l);
        id
    }

    pub(crate) fn alloc_expr(&mut self, e: Expr) -> ExprId {
        let id = ExprId(self.exprs.len());
        self.exprs.push(e);
        id
    }

    /// Intern a type, returning the id of a structurally equal pre-existing one if present.
    pub(crate) fn intern_type(&mut self, t: CType) -> TypeId {
        TypeId(self.types.insert(t))
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    pub fn lval_count(&self) -> usize {
        self.lvals.len()
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    /// Iterate over interned types in interning order
    pub fn types_iter(&self) -> impl Iterator<Item = (TypeId, &CType)> {
        self.types.iter().enumerate().map(|(i, t)| (TypeId(i), t))
    }
}

/// Uniform traversal over the closed node-kind sets.
///
/// Every method defaults to the recursive walk; an implementation overrides only the kinds it
/// cares about and calls the corresponding `walk_*` to continue downward. Dispatch is an
/// exhaustive `match`, so adding a node kind is a compile error in the walkers until it is
/// handled.
pub trait Visitor: Sized {
    fn visit_stmt(&mut self, pool: &NodePool, id: StmtId) {
        walk_stmt(self, pool, id)
    }
    fn visit_lval(&mut self, pool: &NodePool, id: LValId) {
        walk_lval(self, pool, id)
    }
    fn visit_expr(&mut self, pool: &NodePool, id: ExprId) {
        walk_expr(self, pool, id)
    }
    fn visit_type(&mut self, pool: &NodePool, id: TypeId) {
        walk_type(self, pool, id)
    }
}

pub fn walk_stmt<V: Visitor>(v: &mut V, pool: &NodePool, id: StmtId) {
    match pool.stmt(id) {
        Stmt::Block { stmts } => {
            for &s in stmts {
                v.visit_stmt(pool, s);
            }
        }
        Stmt::Seq { insts } => {
            for &s in insts {
                v.visit_stmt(pool, s);
            }
        }
        Stmt::Branch {
            cond,
            then_stmt,
            else_stmt,
        } => {
            v.visit_expr(pool, *cond);
            v.visit_stmt(pool, *then_stmt);
            if let Some(e) = else_stmt {
                v.visit_stmt(pool, *e);
            }
        }
        Stmt::Loop { cond, body } => {
            if let Some(c) = cond {
                v.visit_expr(pool, *c);
            }
            v.visit_stmt(pool, *body);
        }
        Stmt::Return { value } => {
            if let Some(e) = value {
                v.visit_expr(pool, *e);
            }
        }
        Stmt::Goto { label: _ } => {}
        Stmt::Switch {
            scrutinee,
            cases,
            default,
        } => {
            v.visit_expr(pool, *scrutinee);
            for (_, arm) in cases {
                v.visit_stmt(pool, *arm);
            }
            if let Some(d) = default {
                v.visit_stmt(pool, *d);
            }
        }
        Stmt::Assign {
            lhs,
            rhs,
            flags: _,
        } => {
            v.visit_lval(pool, *lhs);
            v.visit_expr(pool, *rhs);
        }
        Stmt::Call {
            result,
            target,
            args,
            kills: _,
        } => {
            if let Some(r) = result {
                v.visit_lval(pool, *r);
            }
            if let CallTarget::Indirect { callee } = target {
                v.visit_expr(pool, *callee);
            }
            for &a in args {
                v.visit_expr(pool, a);
            }
        }
    }
}

pub fn walk_lval<V: Visitor>(v: &mut V, pool: &NodePool, id: LValId) {
    let offset = match pool.lval(id) {
        LVal::Var { name: _, offset } => offset,
        LVal::Deref { addr, offset } => {
            v.visit_expr(pool, *addr);
            offset
        }
    };
    match offset {
        Offset::None | Offset::Field { .. } => {}
        Offset::Index { index, scale: _ } => v.visit_expr(pool, *index),
    }
}

pub fn walk_expr<V: Visitor>(v: &mut V, pool: &NodePool, id: ExprId) {
    match pool.expr(id) {
        Expr::Const { .. } => {}
        Expr::Read { lval } => v.visit_lval(pool, *lval),
        Expr::Cast { ty, arg } => {
            v.visit_type(pool, *ty);
            v.visit_expr(pool, *arg);
        }
        Expr::Unary { op: _, arg } => v.visit_expr(pool, *arg),
        Expr::Binary { op: _, lhs, rhs } => {
            v.visit_expr(pool, *lhs);
            v.visit_expr(pool, *rhs);
        }
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            v.visit_expr(pool, *cond);
            v.visit_expr(pool, *then_expr);
            v.visit_expr(pool, *else_expr);
        }
        Expr::AddressOf { lval } => v.visit_lval(pool, *lval),
        Expr::SizeOf { ty } => v.visit_type(pool, *ty),
        Expr::Substituted {
            original,
            substitute,
        } => {
            v.visit_lval(pool, *original);
            v.visit_expr(pool, *substitute);
        }
    }
}

pub fn walk_type<V: Visitor>(v: &mut V, pool: &NodePool, id: TypeId) {
    match pool.ctype(id) {
        CType::Void
        | CType::Int { .. }
        | CType::Float { .. }
        | CType::Struct { .. }
        | CType::Enum { .. } => {}
        CType::Pointer { pointee } => v.visit_type(pool, *pointee),
        CType::Array { element, count: _ } => v.visit_type(pool, *element),
        CType::Function { ret, params } => {
            v.visit_type(pool, *ret);
            for &p in params {
                v.visit_type(pool, p);
            }
        }
        CType::Typedef { name: _, aliased } => v.visit_type(pool, *aliased),
    }
}

/// The base name of an lvalue, if it is a named variable (with or without an offset).
pub fn lval_name(pool: &NodePool, id: LValId) -> Option<&str> {
    match pool.lval(id) {
        LVal::Var { name, offset: _ } => Some(name),
        LVal::Deref { .. } => None,
    }
}

/// True iff the lvalue is a whole named variable: no dereference and no sub-offset. These are the
/// only lvalues whose writes are candidates for propagation and dead-assignment elimination.
pub fn lval_is_plain(pool: &NodePool, id: LValId) -> bool {
    matches!(
        pool.lval(id),
        LVal::Var {
            name: _,
            offset: Offset::None
        }
    )
}

/// Visitor collecting the set of variable names whose values a node reads. A `Substituted` node
/// contributes only its substitute: the read it replaced no longer feeds the computed value and
/// is kept purely for traceability.
pub struct ReadNames {
    pub names: UnorderedSet<String>,
}

impl ReadNames {
    pub fn new() -> Self {
        Self {
            names: Default::default(),
        }
    }
}

impl Default for ReadNames {
    fn default() -> Self {
        Self::new()
    }
}

impl Visitor for ReadNames {
    fn visit_lval(&mut self, pool: &NodePool, id: LValId) {
        if let LVal::Var { name, offset: _ } = pool.lval(id) {
            self.names.insert(name.clone());
        }
        walk_lval(self, pool, id)
    }

    fn visit_expr(&mut self, pool: &NodePool, id: ExprId) {
        if let Expr::Substituted { substitute, .. } = pool.expr(id) {
            self.visit_expr(pool, *substitute)
        } else {
            walk_expr(self, pool, id)
        }
    }
}

/// Collect the names read by an expression
pub fn expr_read_names(pool: &NodePool, e: ExprId) -> UnorderedSet<String> {
    let mut v = ReadNames::new();
    v.visit_expr(pool, e);
    v.names
}

/// Does the expression mention (read or take the address of) the given variable name?
pub fn expr_mentions_name(pool: &NodePool, e: ExprId, name: &str) -> bool {
    let mut v = ReadNames::new();
    v.visit_expr(pool, e);
    v.names.contains(name)
}

/// Visitor counting nodes reachable from a root, with sharing respected (a node reachable through
/// two parents is counted once). Used to compare against the wire encoder's record count.
pub struct NodeCounter {
    seen_stmts: UnorderedSet<StmtId>,
    seen_lvals: UnorderedSet<LValId>,
    seen_exprs: UnorderedSet<ExprId>,
}

impl NodeCounter {
    pub fn new() -> Self {
        Self {
            seen_stmts: Default::default(),
            seen_lvals: Default::default(),
            seen_exprs: Default::default(),
        }
    }

    pub fn count(&self) -> usize {
        self.seen_stmts.len() + self.seen_lvals.len() + self.seen_exprs.len()
    }
}

impl Default for NodeCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Visitor for NodeCounter {
    fn visit_stmt(&mut self, pool: &NodePool, id: StmtId) {
        if self.seen_stmts.insert(id) {
            walk_stmt(self, pool, id)
        }
    }
    fn visit_lval(&mut self, pool: &NodePool, id: LValId) {
        if self.seen_lvals.insert(id) {
            walk_lval(self, pool, id)
        }
    }
    fn visit_expr(&mut self, pool: &NodePool, id: ExprId) {
        if self.seen_exprs.insert(id) {
            walk_expr(self, pool, id)
        }
    }
}

/// Render a type as C-like text
pub fn render_type(pool: &NodePool, id: TypeId) -> String {
    match pool.ctype(id) {
        CType::Void => "void".into(),
        CType::Int { size, signed } => {
            if *signed {
                format!("int{}_t", u32::from(*size) * 8)
            } else {
                format!("uint{}_t", u32::from(*size) * 8)
            }
        }
        CType::Float { size: 4 } => "float".into(),
        CType::Float { size: 8 } => "double".into(),
        CType::Float { size } => format!("float{}_t", u32::from(*size) * 8),
        CType::Pointer { pointee } => format!("{}*", render_type(pool, *pointee)),
        CType::Array { element, count } => format!("{}[{}]", render_type(pool, *element), count),
        CType::Function { ret, params } => {
            use itertools::Itertools;
            format!(
                "{}({})",
                render_type(pool, *ret),
                params.iter().map(|&p| render_type(pool, p)).join(", ")
            )
        }
        CType::Struct { key } => format!("struct {}", key),
        CType::Enum { key } => format!("enum {}", key),
        CType::Typedef { name, aliased: _ } => name.clone(),
    }
}

fn render_offset(pool: &NodePool, base: String, offset: &Offset) -> String {
    match offset {
        Offset::None => base,
        Offset::Field {
            name,
            byte_offset: _,
        } => format!("{}.{}", base, name),
        Offset::Index { index, scale: _ } => format!("{}[{}]", base, render_expr(pool, *index)),
    }
}

/// Render an lvalue as C-like text
pub fn render_lval(pool: &NodePool, id: LValId) -> String {
    match pool.lval(id) {
        LVal::Var { name, offset } => render_offset(pool, name.clone(), offset),
        LVal::Deref { addr, offset } => {
            render_offset(pool, format!("*({})", render_expr(pool, *addr)), offset)
        }
    }
}

/// Render an expression as C-like text.
///
/// No precedence minimization is attempted; sub-expressions of operators are always
/// parenthesized, keeping the output deterministic in service of the round-trip property.
pub fn render_expr(pool: &NodePool, id: ExprId) -> String {
    match pool.expr(id) {
        Expr::Const { value, size: _ } => {
            if *value > 9 {
                format!("{:#x}", value)
            } else {
                format!("{}", value)
            }
        }
        Expr::Read { lval } => render_lval(pool, *lval),
        Expr::Cast { ty, arg } => format!(
            "({}){}",
            render_type(pool, *ty),
            render_expr(pool, *arg)
        ),
        Expr::Unary { op, arg } => format!("{}{}", op.symbol(), render_expr(pool, *arg)),
        Expr::Binary { op, lhs, rhs } => format!(
            "({} {} {})",
            render_expr(pool, *lhs),
            op.symbol(),
            render_expr(pool, *rhs)
        ),
        Expr::Ternary {
            cond,
            then_expr,
            else_expr,
        } => format!(
            "({} ? {} : {})",
            render_expr(pool, *cond),
            render_expr(pool, *then_expr),
            render_expr(pool, *else_expr)
        ),
        Expr::AddressOf { lval } => format!("&{}", render_lval(pool, *lval)),
        Expr::SizeOf { ty } => format!("sizeof({})", render_type(pool, *ty)),
        Expr::Substituted {
            original: _,
            substitute,
        } => render_expr(pool, *substitute),
    }
}

fn render_stmt_into(pool: &NodePool, id: StmtId, indent: usize, out: &mut String) {
    use std::fmt::Write;
    let pad = "  ".repeat(indent);
    match pool.stmt(id) {
        Stmt::Block { stmts } | Stmt::Seq { insts: stmts } => {
            writeln!(out, "{}{{", pad).unwrap();
            for &s in stmts {
                render_stmt_into(pool, s, indent + 1, out);
            }
            writeln!(out, "{}}}", pad).unwrap();
        }
        Stmt::Branch {
            cond,
            then_stmt,
            else_stmt,
        } => {
            writeln!(out, "{}if ({})", pad, render_expr(pool, *cond)).unwrap();
            render_stmt_into(pool, *then_stmt, indent + 1, out);
            if let Some(e) = else_stmt {
                writeln!(out, "{}else", pad).unwrap();
                render_stmt_into(pool, *e, indent + 1, out);
            }
        }
        Stmt::Loop { cond, body } => {
            match cond {
                Some(c) => writeln!(out, "{}while ({})", pad, render_expr(pool, *c)).unwrap(),
                None => writeln!(out, "{}while (1)", pad).unwrap(),
            }
            render_stmt_into(pool, *body, indent + 1, out);
        }
        Stmt::Return { value } => match value {
            Some(e) => writeln!(out, "{}return {};", pad, render_expr(pool, *e)).unwrap(),
            None => writeln!(out, "{}return;", pad).unwrap(),
        },
        Stmt::Goto { label } => writeln!(out, "{}goto {};", pad, label).unwrap(),
        Stmt::Switch {
            scrutinee,
            cases,
            default,
        } => {
            writeln!(out, "{}switch ({})", pad, render_expr(pool, *scrutinee)).unwrap();
            for (value, arm) in cases {
                writeln!(out, "{}case {}:", pad, value).unwrap();
                render_stmt_into(pool, *arm, indent + 1, out);
            }
            if let Some(d) = default {
                writeln!(out, "{}default:", pad).unwrap();
                render_stmt_into(pool, *d, indent + 1, out);
            }
        }
        Stmt::Assign {
            lhs,
            rhs,
            flags: _,
        } => {
            writeln!(
                out,
                "{}{} = {};",
                pad,
                render_lval(pool, *lhs),
                render_expr(pool, *rhs)
            )
            .unwrap();
        }
        Stmt::Call {
            result,
            target,
            args,
            kills: _,
        } => {
            use itertools::Itertools;
            let callee = match target {
                CallTarget::Direct { name } => name.clone(),
                CallTarget::Indirect { callee } => format!("(*{})", render_expr(pool, *callee)),
            };
            let args = args.iter().map(|&a| render_expr(pool, a)).join(", ");
            match result {
                Some(r) => writeln!(
                    out,
                    "{}{} = {}({});",
                    pad,
                    render_lval(pool, *r),
                    callee,
                    args
                )
                .unwrap(),
                None => writeln!(out, "{}{}({});", pad, callee, args).unwrap(),
            }
        }
    }
}

/// Render a whole statement tree as C-like text. This is the comparison form of the round-trip
/// property: two trees that render identically are considered equivalent.
pub fn render_stmt(pool: &NodePool, id: StmtId) -> String {
    let mut out = String::new();
    render_stmt_into(pool, id, 0, &mut out);
    out
}
