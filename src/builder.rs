//! The tree builder: the sole minter of node ids.
//!
//! A [`ModuleContext`] lives for a whole translation unit and owns the node pool and the global
//! symbol table. A [`TreeBuilder`] borrows it for the duration of one function, adds that
//! function's local symbols, trees, spans, and provenance on top, and is consumed by
//! [`TreeBuilder::finish`] into an immutable [`FunctionTree`]. Because every function's builder
//! allocates out of the same pool, ids are unique across the whole unit and shared subtrees keep
//! a stable identity everywhere.

use crate::ast::{
    AddrSpan, AssignFlags, BinaryOp, CType, CallTarget, Expr, ExprId, LVal, LValId, NodePool,
    Offset, Stmt, StmtId, TypeId, UnaryOp,
};
use crate::containers::unordered::UnorderedMap;
use crate::provenance::Provenance;
use crate::symtab::{GlobalSymbols, LocalSymbols, VarInfo};

/// Translation-unit-wide state: the node pool and the global symbol table.
#[derive(Default)]
pub struct ModuleContext {
    pub pool: NodePool,
    pub globals: GlobalSymbols,
}

impl ModuleContext {
    pub fn new() -> Self {
        Default::default()
    }
}

/// Where a variable lives in the machine. Imported from the decoder and carried through to the
/// wire format for the benefit of downstream patch tooling.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StorageSlot {
    Register { name: String },
    StackOffset { offset: i64 },
    Memory { address: u64 },
}

/// The finished, immutable result of building one function.
pub struct FunctionTree {
    pub name: String,
    pub address: u64,
    /// Tree roots, most reduced first: `roots[0]` is the high-level tree, the last entry is the
    /// low-level ground truth, anything between is a partial reduction stage.
    pub roots: Vec<StmtId>,
    pub spans: UnorderedMap<StmtId, AddrSpan>,
    pub storage: UnorderedMap<String, StorageSlot>,
    pub provenance: Provenance,
    pub locals: LocalSymbols,
}

impl FunctionTree {
    pub fn high_root(&self) -> StmtId {
        self.roots[0]
    }

    pub fn low_root(&self) -> StmtId {
        *self
            .roots
            .last()
            .unwrap_or_else(|| panic!("Function {:?} has no trees", self.name))
    }
}

/// The per-function construction context.
pub struct TreeBuilder<'m> {
    ctx: &'m mut ModuleContext,
    name: String,
    address: u64,
    locals: LocalSymbols,
    roots: Vec<StmtId>,
    spans: UnorderedMap<StmtId, AddrSpan>,
    storage: UnorderedMap<String, StorageSlot>,
    provenance: Provenance,
}

impl<'m> TreeBuilder<'m> {
    pub fn new(ctx: &'m mut ModuleContext, name: &str, address: u64) -> Self {
        TreeBuilder {
            ctx,
            name: name.to_owned(),
            address,
            locals: LocalSymbols::new(),
            roots: Vec::new(),
            spans: Default::default(),
            storage: Default::default(),
            provenance: Provenance::new(),
        }
    }

    pub fn pool(&self) -> &NodePool {
        &self.ctx.pool
    }

    pub fn globals(&self) -> &GlobalSymbols {
        &self.ctx.globals
    }

    pub fn globals_mut(&mut self) -> &mut GlobalSymbols {
        &mut self.ctx.globals
    }

    pub fn locals(&self) -> &LocalSymbols {
        &self.locals
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn provenance_mut(&mut self) -> &mut Provenance {
        &mut self.provenance
    }

    pub fn function_name(&self) -> &str {
        &self.name
    }

    pub fn function_address(&self) -> u64 {
        self.address
    }

    pub fn add_local_symbol(&mut self, name: &str, info: VarInfo) {
        self.locals.add_symbol(name, info);
    }

    pub fn add_global_symbol(&mut self, name: &str, info: VarInfo) {
        self.ctx.globals.add_symbol(name, info);
    }

    /// Does `name` resolve through the global table rather than a local registration?
    pub fn is_global_name(&self, name: &str) -> bool {
        self.locals.is_global(&self.ctx.globals, name)
    }

    pub fn set_storage(&mut self, name: &str, slot: StorageSlot) {
        self.storage.insert(name.to_owned(), slot);
    }

    // --- statement factories ---

    pub fn make_block(&mut self, stmts: Vec<StmtId>) -> StmtId {
        self.ctx.pool.alloc_stmt(Stmt::Block { stmts })
    }

    pub fn make_instruction_sequence(&mut self, insts: Vec<StmtId>) -> StmtId {
        debug_assert!(insts
            .iter()
            .all(|&i| self.ctx.pool.stmt(i).is_instruction()));
        self.ctx.pool.alloc_stmt(Stmt::Seq { insts })
    }

    pub fn make_branch(
        &mut self,
        cond: ExprId,
        then_stmt: StmtId,
        else_stmt: Option<StmtId>,
    ) -> StmtId {
        self.ctx.pool.alloc_stmt(Stmt::Branch {
            cond,
            then_stmt,
            else_stmt,
        })
    }

    pub fn make_loop(&mut self, cond: Option<ExprId>, body: StmtId) -> StmtId {
        self.ctx.pool.alloc_stmt(Stmt::Loop { cond, body })
    }

    pub fn make_return(&mut self, value: Option<ExprId>) -> StmtId {
        self.ctx.pool.alloc_stmt(Stmt::Return { value })
    }

    pub fn make_goto(&mut self, label: &str) -> StmtId {
        self.ctx.pool.alloc_stmt(Stmt::Goto {
            label: label.to_owned(),
        })
    }

    pub fn make_switch(
        &mut self,
        scrutinee: ExprId,
        cases: Vec<(u64, StmtId)>,
        default: Option<StmtId>,
    ) -> StmtId {
        self.ctx.pool.alloc_stmt(Stmt::Switch {
            scrutinee,
            cases,
            default,
        })
    }

    pub fn make_assignment(
        &mut self,
        lhs: LValId,
        rhs: ExprId,
        flags: AssignFlags,
        span: Option<AddrSpan>,
    ) -> StmtId {
        let id = self.ctx.pool.alloc_stmt(Stmt::Assign { lhs, rhs, flags });
        if let Some(span) = span {
            self.spans.insert(id, span);
        }
        id
    }

    pub fn make_call(
        &mut self,
        result: Option<LValId>,
        target: CallTarget,
        args: Vec<ExprId>,
        kills: Vec<String>,
        span: Option<AddrSpan>,
    ) -> StmtId {
        let id = self.ctx.pool.alloc_stmt(Stmt::Call {
            result,
            target,
            args,
            kills,
        });
        if let Some(span) = span {
            self.spans.insert(id, span);
        }
        id
    }

    // --- lvalue factories ---

    pub fn make_variable_lval(&mut self, name: &str, offset: Offset) -> LValId {
        self.ctx.pool.alloc_lval(LVal::Var {
            name: name.to_owned(),
            offset,
        })
    }

    pub fn make_deref_lval(&mut self, addr: ExprId, offset: Offset) -> LValId {
        self.ctx.pool.alloc_lval(LVal::Deref { addr, offset })
    }

    /// Build an lvalue form of an already-built expression, for operand kinds that have one.
    /// A kind with no lvalue form is an error scoped to the one instruction being lowered; the
    /// per-instruction loop upstream is expected to catch it rather than abort the function.
    pub fn make_lval_from_expr(&mut self, expr: ExprId) -> Result<LValId, String> {
        match self.ctx.pool.expr(expr) {
            Expr::Read { lval } => Ok(*lval),
            Expr::Substituted { original, .. } => Ok(*original),
            other => Err(format!(
                "Operand kind has no lvalue form: {:?} ({:?})",
                expr, other
            )),
        }
    }

    // --- expression factories ---

    pub fn make_constant(&mut self, value: u64, size: u8) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Const { value, size })
    }

    pub fn make_lval_read(&mut self, lval: LValId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Read { lval })
    }

    pub fn make_cast(&mut self, ty: TypeId, arg: ExprId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Cast { ty, arg })
    }

    pub fn make_unary(&mut self, op: UnaryOp, arg: ExprId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Unary { op, arg })
    }

    pub fn make_binary(&mut self, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Binary { op, lhs, rhs })
    }

    pub fn make_ternary(&mut self, cond: ExprId, then_expr: ExprId, else_expr: ExprId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Ternary {
            cond,
            then_expr,
            else_expr,
        })
    }

    pub fn make_address_of(&mut self, lval: LValId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::AddressOf { lval })
    }

    pub fn make_sizeof(&mut self, ty: TypeId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::SizeOf { ty })
    }

    pub fn make_substituted(&mut self, original: LValId, substitute: ExprId) -> ExprId {
        self.ctx.pool.alloc_expr(Expr::Substituted {
            original,
            substitute,
        })
    }

    pub fn intern_type(&mut self, t: CType) -> TypeId {
        self.ctx.pool.intern_type(t)
    }

    // --- spans and roots ---

    pub fn record_span(&mut self, stmt: StmtId, span: AddrSpan) {
        self.spans.insert(stmt, span);
    }

    pub fn span_of(&self, stmt: StmtId) -> Option<AddrSpan> {
        self.spans.get(&stmt).copied()
    }

    /// Append a tree root. Roots are kept in most-reduced-first order; construction appends the
    /// low-level ground truth here and reduction prepends its result.
    pub fn add_tree_root(&mut self, root: StmtId) {
        self.roots.push(root);
    }

    /// Prepend a tree root produced by a reduction stage.
    pub fn prepend_tree_root(&mut self, root: StmtId) {
        self.roots.insert(0, root);
    }

    pub fn roots(&self) -> &[StmtId] {
        &self.roots
    }

    /// Run the provenance resolution pass over everything recorded so far. Must happen after all
    /// address-based facts are in and before any resolved-fact query.
    pub fn resolve_provenance(&mut self) {
        let Self {
            ctx,
            spans,
            provenance,
            ..
        } = self;
        provenance.resolve(&ctx.pool, spans);
    }

    /// Consume the builder into an immutable function record. A function must carry at least the
    /// high-level and low-level trees and its provenance must have been resolved.
    pub fn finish(self) -> FunctionTree {
        assert!(
            self.roots.len() >= 2,
            "Function {:?} finished with {} trees, need at least a high-level and a low-level one",
            self.name,
            self.roots.len()
        );
        assert!(
            self.provenance.is_resolved(),
            "Function {:?} finished with unresolved provenance",
            self.name
        );
        FunctionTree {
            name: self.name,
            address: self.address,
            roots: self.roots,
            spans: self.spans,
            storage: self.storage,
            provenance: self.provenance,
            locals: self.locals,
        }
    }
}
