//! Forward value propagation over a low-level tree.
//!
//! A single forward walk tracks, per variable name, the instruction that last assigned it and
//! the expression it was assigned. A later read of that name is replaced by a `Substituted` node
//! carrying both the original lvalue and the propagated expression, provided the propagated
//! expression does not itself read the name (a self-referential definition admits no safe
//! substitution). Substitution chains naturally: the tracked expression is the *rewritten* form
//! of the defining right-hand side, so `t = R0 + 4; R1 = *t` tracks `R1` as `*(R0 + 4)`.
//!
//! The pass never mutates existing nodes. Each rewritten expression is a fresh node recorded in
//! a side table keyed by `(enclosing instruction, low-level node)`; the reduction pass looks the
//! rewritten forms up when it assembles the high-level tree. Keying by the enclosing instruction
//! matters because nodes may be shared: one expression node reachable from two instructions can
//! legitimately rewrite two different ways.

use crate::ast::{expr_mentions_name, lval_is_plain, lval_name, Expr, ExprId, LVal, LValId, Offset, Stmt, StmtId};
use crate::builder::TreeBuilder;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;

/// What a name is currently known to hold.
#[derive(Clone, PartialEq, Eq, Debug)]
struct Definition {
    /// The assigning instruction
    stmt: StmtId,
    /// Its left-hand side
    lval: LValId,
    /// The (rewritten) assigned expression
    expr: ExprId,
}

type Env = UnorderedMap<String, Definition>;

/// Join at a branch merge: a name survives only if both sides agree on the defining instruction.
/// A name defined differently on the two paths is dropped, never merged.
fn intersect(a: Env, b: &Env) -> Env {
    a.into_iter()
        .filter(|(name, def)| b.get(name) == Some(def))
        .collect()
}

/// Kill `name`: drop its own entry, and every entry whose tracked expression reads `name`. A
/// definition computed from `name` can no longer be reproduced at a use site once `name` holds
/// a new value.
fn kill(b: &TreeBuilder, env: &mut Env, name: &str) {
    env.remove(name);
    let stale: Vec<String> = env
        .iter()
        .filter(|(_, def)| expr_mentions_name(b.pool(), def.expr, name))
        .map(|(tracked, _)| tracked.clone())
        .collect();
    for tracked in stale {
        env.remove(&tracked);
    }
}

/// The side tables produced by one propagation pass.
#[derive(Default)]
pub struct ValuePropagation {
    /// `(instruction, low expr)` to its rewritten form; absent means unchanged
    rewritten: UnorderedMap<(StmtId, ExprId), ExprId>,
    /// `(instruction, low lval)` to its rewritten form
    rewritten_lv: UnorderedMap<(StmtId, LValId), LValId>,
    /// Each `Substituted` node to the instruction whose value it carries
    substitution_def: UnorderedMap<ExprId, StmtId>,
    /// Instructions whose assigned value was substituted into at least one downstream read
    propagated_defs: UnorderedSet<StmtId>,
}

impl ValuePropagation {
    /// Run the pass over the tree rooted at `root`.
    pub fn analyze(b: &mut TreeBuilder, root: StmtId) -> Self {
        let mut vp = ValuePropagation::default();
        let mut env = Env::default();
        vp.walk(b, root, &mut env);
        vp
    }

    /// The rewritten form of `expr` as seen from `inst`, falling back to `expr` itself.
    pub fn rewritten_expr(&self, inst: StmtId, expr: ExprId) -> ExprId {
        self.rewritten.get(&(inst, expr)).copied().unwrap_or(expr)
    }

    /// The rewritten form of `lval` as seen from `inst`, falling back to `lval` itself.
    pub fn rewritten_lval(&self, inst: StmtId, lval: LValId) -> LValId {
        self.rewritten_lv
            .get(&(inst, lval))
            .copied()
            .unwrap_or(lval)
    }

    /// Was the value assigned by `inst` substituted into some downstream read?
    pub fn was_propagated(&self, inst: StmtId) -> bool {
        self.propagated_defs.contains(&inst)
    }

    /// The instruction whose assigned value a `Substituted` node carries.
    pub fn substitution_def(&self, subst: ExprId) -> Option<StmtId> {
        self.substitution_def.get(&subst).copied()
    }

    fn walk(&mut self, b: &mut TreeBuilder, stmt: StmtId, env: &mut Env) {
        match b.pool().stmt(stmt).clone() {
            Stmt::Block { stmts } => {
                for s in stmts {
                    self.walk(b, s, env);
                }
            }
            Stmt::Seq { insts } => {
                for s in insts {
                    self.walk(b, s, env);
                }
            }
            Stmt::Branch {
                cond,
                then_stmt,
                else_stmt,
            } => {
                self.rewrite_expr(b, stmt, cond, env);
                let mut then_env = env.clone();
                self.walk(b, then_stmt, &mut then_env);
                let mut else_env = env.clone();
                if let Some(e) = else_stmt {
                    self.walk(b, e, &mut else_env);
                }
                *env = intersect(then_env, &else_env);
            }
            Stmt::Loop { cond: _, body } => {
                // A back edge can invalidate any fact established before or inside the body, so
                // nothing is tracked across a loop.
                env.clear();
                let mut body_env = Env::default();
                self.walk(b, body, &mut body_env);
            }
            Stmt::Switch {
                scrutinee,
                cases,
                default,
            } => {
                self.rewrite_expr(b, stmt, scrutinee, env);
                for (_, arm) in cases {
                    let mut arm_env = env.clone();
                    self.walk(b, arm, &mut arm_env);
                }
                if let Some(d) = default {
                    let mut arm_env = env.clone();
                    self.walk(b, d, &mut arm_env);
                }
                // Fall-through between arms makes the per-arm results unreliable as a merge input
                env.clear();
            }
            Stmt::Return { value } => {
                if let Some(e) = value {
                    self.rewrite_expr(b, stmt, e, env);
                }
            }
            Stmt::Goto { label: _ } => {
                // The target may be anywhere; nothing established here survives the jump
                env.clear();
            }
            Stmt::Assign { lhs, rhs, flags: _ } => {
                let new_rhs = self.rewrite_expr(b, stmt, rhs, env);
                self.rewrite_lval(b, stmt, lhs, env);
                if lval_is_plain(b.pool(), lhs) && !b.is_global_name(name_of(b, lhs)) {
                    let name = name_of(b, lhs).to_owned();
                    kill(b, env, &name);
                    // A self-referential definition, e.g. `n = n + 1`, admits no safe
                    // substitution and leaves the name untracked
                    if !expr_mentions_name(b.pool(), new_rhs, &name) {
                        env.insert(
                            name,
                            Definition {
                                stmt,
                                lval: lhs,
                                expr: new_rhs,
                            },
                        );
                    }
                } else if let Some(name) = lval_name(b.pool(), lhs) {
                    // Partial or global write: the tracked whole-variable value, and anything
                    // computed from it, is stale
                    kill(b, env, name);
                }
            }
            Stmt::Call {
                result,
                target: _,
                args: _,
                kills,
            } => {
                // Call operands are never substituted into: a call is an ABI surface and its
                // argument reads stay as the named variables the calling convention sees
                for name in &kills {
                    kill(b, env, name);
                }
                if let Some(r) = result {
                    self.rewrite_lval(b, stmt, r, env);
                    if let Some(name) = lval_name(b.pool(), r) {
                        // The call produced the value; nothing expression-shaped to track
                        kill(b, env, name);
                    }
                }
            }
        }
    }

    /// Rewrite an expression under the current environment, returning its (possibly new) id.
    fn rewrite_expr(&mut self, b: &mut TreeBuilder, inst: StmtId, e: ExprId, env: &Env) -> ExprId {
        let new = match b.pool().expr(e).clone() {
            Expr::Const { .. } | Expr::SizeOf { .. } => e,
            Expr::Read { lval } => {
                if let Some(def) = plain_name(b, lval).and_then(|n| env.get(n)) {
                    let def = def.clone();
                    let name = name_of(b, lval);
                    if !expr_mentions_name(b.pool(), def.expr, name) {
                        trace!(
                            "Substituting propagated value";
                            "var" => name,
                            "def" => format!("{:?}", def.stmt),
                            "at" => format!("{:?}", inst),
                        );
                        let subst = b.make_substituted(lval, def.expr);
                        self.substitution_def.insert(subst, def.stmt);
                        self.propagated_defs.insert(def.stmt);
                        subst
                    } else {
                        e
                    }
                } else {
                    let new_lval = self.rewrite_lval(b, inst, lval, env);
                    if new_lval != lval {
                        b.make_lval_read(new_lval)
                    } else {
                        e
                    }
                }
            }
            Expr::Cast { ty, arg } => {
                let new_arg = self.rewrite_expr(b, inst, arg, env);
                if new_arg != arg {
                    b.make_cast(ty, new_arg)
                } else {
                    e
                }
            }
            Expr::Unary { op, arg } => {
                let new_arg = self.rewrite_expr(b, inst, arg, env);
                if new_arg != arg {
                    b.make_unary(op, new_arg)
                } else {
                    e
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let new_lhs = self.rewrite_expr(b, inst, lhs, env);
                let new_rhs = self.rewrite_expr(b, inst, rhs, env);
                if (new_lhs, new_rhs) != (lhs, rhs) {
                    b.make_binary(op, new_lhs, new_rhs)
                } else {
                    e
                }
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let new_cond = self.rewrite_expr(b, inst, cond, env);
                let new_then = self.rewrite_expr(b, inst, then_expr, env);
                let new_else = self.rewrite_expr(b, inst, else_expr, env);
                if (new_cond, new_then, new_else) != (cond, then_expr, else_expr) {
                    b.make_ternary(new_cond, new_then, new_else)
                } else {
                    e
                }
            }
            Expr::AddressOf { lval } => {
                // Taking an address is not a read of the value; only embedded index/address
                // expressions are candidates
                let new_lval = self.rewrite_lval(b, inst, lval, env);
                if new_lval != lval {
                    b.make_address_of(new_lval)
                } else {
                    e
                }
            }
            Expr::Substituted { .. } => e,
        };
        if new != e {
            self.rewritten.insert((inst, e), new);
        }
        new
    }

    /// Rewrite the expressions embedded in an lvalue (a dereferenced address, an index). The
    /// base variable of a named lvalue is a write target here, never substituted.
    fn rewrite_lval(&mut self, b: &mut TreeBuilder, inst: StmtId, lv: LValId, env: &Env) -> LValId {
        let new = match b.pool().lval(lv).clone() {
            LVal::Var { name, offset } => match self.rewrite_offset(b, inst, &offset, env) {
                Some(new_offset) => b.make_variable_lval(&name, new_offset),
                None => lv,
            },
            LVal::Deref { addr, offset } => {
                let new_addr = self.rewrite_expr(b, inst, addr, env);
                let new_offset = self.rewrite_offset(b, inst, &offset, env);
                if new_addr != addr || new_offset.is_some() {
                    b.make_deref_lval(new_addr, new_offset.unwrap_or(offset))
                } else {
                    lv
                }
            }
        };
        if new != lv {
            self.rewritten_lv.insert((inst, lv), new);
        }
        new
    }

    /// `Some` iff the offset contains an expression that rewrote to something new.
    fn rewrite_offset(
        &mut self,
        b: &mut TreeBuilder,
        inst: StmtId,
        offset: &Offset,
        env: &Env,
    ) -> Option<Offset> {
        match offset {
            Offset::None | Offset::Field { .. } => None,
            Offset::Index { index, scale } => {
                let new_index = self.rewrite_expr(b, inst, *index, env);
                (new_index != *index).then(|| Offset::Index {
                    index: new_index,
                    scale: *scale,
                })
            }
        }
    }
}

fn plain_name<'a>(b: &'a TreeBuilder, lval: LValId) -> Option<&'a str> {
    if lval_is_plain(b.pool(), lval) && !b.is_global_name(name_of(b, lval)) {
        Some(name_of(b, lval))
    } else {
        None
    }
}

fn name_of<'a>(b: &'a TreeBuilder, lval: LValId) -> &'a str {
    match b.pool().lval(lval) {
        LVal::Var { name, .. } => name,
        LVal::Deref { .. } => panic!("Named lvalue expected"),
    }
}
