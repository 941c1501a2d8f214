//! Backward liveness analysis over a low-level tree.
//!
//! A single reverse walk maintains the set of variable names whose values may still be read
//! after the current point. An assignment to a whole local variable kills its name and gens the
//! names its right-hand side reads; any other write (memory, global, field, element) is treated
//! as observable and never killable. The live-on-exit set of every assignment is snapshotted for
//! the reduction pass, which uses it both to decide retention and to narrow imported def-use
//! evidence.

use crate::ast::{
    expr_read_names, lval_is_plain, lval_name, CallTarget, LVal, NodePool, Offset, ReadNames,
    Stmt, StmtId, Visitor,
};
use crate::builder::TreeBuilder;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};

type LiveSet = UnorderedSet<String>;

/// The side tables produced by one liveness pass.
#[derive(Default)]
pub struct Liveness {
    /// Per assignment, the names live immediately after it
    live_on_exit: UnorderedMap<StmtId, LiveSet>,
    /// Per statement, whether anything below it must be kept
    live_stmt: UnorderedMap<StmtId, bool>,
}

impl Liveness {
    /// Run the pass over the tree rooted at `root`. Nothing is assumed live at function exit;
    /// values that escape do so through returns, memory writes, or calls, all of which gen their
    /// reads explicitly.
    pub fn analyze(b: &TreeBuilder, root: StmtId) -> Self {
        let mut lv = Liveness::default();
        let mut live = LiveSet::new();
        lv.walk(b, root, &mut live);
        lv
    }

    /// The names live immediately after an assignment. `None` for non-assignments.
    pub fn live_on_exit(&self, inst: StmtId) -> Option<&LiveSet> {
        self.live_on_exit.get(&inst)
    }

    /// Must the subtree at `stmt` be kept? Unknown statements are conservatively live.
    pub fn is_stmt_live(&self, stmt: StmtId) -> bool {
        self.live_stmt.get(&stmt).copied().unwrap_or(true)
    }

    fn walk(&mut self, b: &TreeBuilder, stmt: StmtId, live: &mut LiveSet) -> bool {
        let pool = b.pool();
        let is_live = match pool.stmt(stmt).clone() {
            Stmt::Block { stmts } => {
                let mut any = false;
                for &s in stmts.iter().rev() {
                    any |= self.walk(b, s, live);
                }
                any
            }
            Stmt::Seq { insts } => {
                let mut any = false;
                for &s in insts.iter().rev() {
                    any |= self.walk(b, s, live);
                }
                any
            }
            Stmt::Branch {
                cond,
                then_stmt,
                else_stmt,
            } => {
                // Both arms see the same exit set; whatever either may read stays live above
                let mut then_live = live.clone();
                let then_is_live = self.walk(b, then_stmt, &mut then_live);
                let else_is_live = match else_stmt {
                    Some(e) => self.walk(b, e, live),
                    None => false,
                };
                live.extend(then_live);
                live.extend(expr_read_names(pool, cond));
                then_is_live || else_is_live
            }
            Stmt::Loop { cond, body } => {
                // A name read anywhere in the body may be read on a later iteration, so it is
                // live at every point inside and before the loop
                let mut reads = ReadNames::new();
                reads.visit_stmt(pool, body);
                if let Some(c) = cond {
                    reads.visit_expr(pool, c);
                }
                live.extend(reads.names);
                let mut body_live = live.clone();
                let body_is_live = self.walk(b, body, &mut body_live);
                live.extend(body_live);
                body_is_live
            }
            Stmt::Switch {
                scrutinee,
                cases,
                default,
            } => {
                let mut any = false;
                let mut merged = live.clone();
                for &(_, arm) in &cases {
                    let mut arm_live = live.clone();
                    any |= self.walk(b, arm, &mut arm_live);
                    merged.extend(arm_live);
                }
                if let Some(d) = default {
                    let mut arm_live = live.clone();
                    any |= self.walk(b, d, &mut arm_live);
                    merged.extend(arm_live);
                }
                *live = merged;
                live.extend(expr_read_names(pool, scrutinee));
                any
            }
            Stmt::Return { value } => {
                if let Some(e) = value {
                    live.extend(expr_read_names(pool, e));
                }
                true
            }
            Stmt::Goto { label: _ } => {
                // The jump target is unknown to this walk; keep the jump and assume nothing
                // about what it makes dead
                true
            }
            Stmt::Assign { lhs, rhs, flags: _ } => {
                self.live_on_exit.insert(stmt, live.clone());
                let killable = lval_is_plain(pool, lhs)
                    && !b.is_global_name(plain_base_name(pool, lhs));
                let name_was_live = lval_name(pool, lhs)
                    .map(|n| live.contains(n))
                    .unwrap_or(false);
                if killable {
                    live.remove(plain_base_name(pool, lhs));
                } else {
                    // Partial or memory write: the location stays observable, and address/index
                    // computations in the left-hand side are uses
                    let mut reads = ReadNames::new();
                    reads.visit_lval(pool, lhs);
                    live.extend(reads.names);
                }
                live.extend(expr_read_names(pool, rhs));
                !killable || name_was_live
            }
            Stmt::Call {
                result,
                target,
                args,
                kills: _,
            } => {
                if let Some(r) = result {
                    if lval_is_plain(pool, r) && !b.is_global_name(plain_base_name(pool, r)) {
                        live.remove(plain_base_name(pool, r));
                    } else {
                        let mut reads = ReadNames::new();
                        reads.visit_lval(pool, r);
                        live.extend(reads.names);
                    }
                }
                if let CallTarget::Indirect { callee } = target {
                    live.extend(expr_read_names(pool, callee));
                }
                for a in args {
                    live.extend(expr_read_names(pool, a));
                }
                true
            }
        };
        self.live_stmt.insert(stmt, is_live);
        is_live
    }
}

fn plain_base_name(pool: &NodePool, lval: crate::ast::LValId) -> &str {
    match pool.lval(lval) {
        LVal::Var {
            name,
            offset: Offset::None,
        } => name,
        other => panic!("Whole-variable lvalue expected, got {:?}", other),
    }
}
