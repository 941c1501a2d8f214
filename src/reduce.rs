//! The code-reduction transformer: rewrites a function's low-level tree into its high-level
//! tree.
//!
//! Both dataflow passes run first. Their evidence, the retention flags set by lowering, and the
//! externally supplied used-variable set then feed a fixed keep/drop priority chain evaluated
//! per assignment. The chain order is load-bearing: reordering it observably changes which
//! instructions survive.
//!
//! Every kept instruction becomes a *fresh* high-level node (the low-level tree is never
//! mutated), wired back to its low-level origin through the provenance store. An assignment
//! whose right-hand side absorbed propagated values is additionally mapped to each instruction
//! it folded in, so one high-level statement may cover several low-level steps.

use crate::ast::{AssignFlags, Expr, ExprId, LValId, NodePool, Stmt, StmtId, Visitor};
use crate::builder::TreeBuilder;
use crate::containers::unordered::UnorderedSet;
use crate::liveness::Liveness;
use crate::log::*;
use crate::provenance::UseLoc;
use crate::reduction_config::CONFIG;
use crate::value_propagation::ValuePropagation;

/// Reduce the tree rooted at `low_root`, prepend the result as the function's high-level root,
/// and return it. `used_variables` is the externally supplied set of names the surrounding
/// program is known to consume from this function.
pub fn reduce(
    b: &mut TreeBuilder,
    low_root: StmtId,
    used_variables: &UnorderedSet<String>,
) -> StmtId {
    let vp = if CONFIG.propagate_values {
        ValuePropagation::analyze(b, low_root)
    } else {
        ValuePropagation::default()
    };
    let lv = if CONFIG.eliminate_dead_assignments {
        let lv = Liveness::analyze(b, low_root);
        narrow_defuse_evidence(b, low_root, &lv);
        lv
    } else {
        Liveness::default()
    };

    let mut r = Reducer {
        vp,
        lv,
        used_variables,
    };
    let hi_root = match r.rebuild(b, low_root) {
        Some(root) => root,
        // Everything reduced away; the high-level tree is an empty shell of the root's kind
        None => match b.pool().stmt(low_root) {
            Stmt::Block { .. } => b.make_block(vec![]),
            _ => b.make_instruction_sequence(vec![]),
        },
    };
    b.prepend_tree_root(hi_root);
    hi_root
}

/// Liveness evidence narrows the def-use-high records imported from the decoder: an assignment
/// to a whole local variable that liveness proves dead gets every recorded use of its left-hand
/// side inactivated, so the retention chain no longer sees those uses as reasons to keep it.
fn narrow_defuse_evidence(b: &mut TreeBuilder, root: StmtId, lv: &Liveness) {
    struct Assignments {
        found: Vec<(StmtId, LValId, AssignFlags)>,
    }
    impl Visitor for Assignments {
        fn visit_stmt(&mut self, pool: &NodePool, id: StmtId) {
            if let Stmt::Assign { lhs, flags, .. } = pool.stmt(id) {
                self.found.push((id, *lhs, *flags));
            }
            crate::ast::walk_stmt(self, pool, id)
        }
    }

    let mut assignments = Assignments { found: Vec::new() };
    assignments.visit_stmt(b.pool(), root);

    let mut to_inactivate: Vec<(LValId, UseLoc)> = Vec::new();
    for (inst, lhs, flags) in assignments.found {
        if flags.any() || !crate::ast::lval_is_plain(b.pool(), lhs) {
            continue;
        }
        let name = match crate::ast::lval_name(b.pool(), lhs) {
            Some(n) => n.to_owned(),
            None => continue,
        };
        if b.is_global_name(&name) {
            continue;
        }
        let dead = lv
            .live_on_exit(inst)
            .map(|set| !set.contains(&name))
            .unwrap_or(false);
        if !dead {
            continue;
        }
        if let Some(du) = b.provenance().lval_defuses_high(lhs) {
            to_inactivate.extend(du.recorded().map(|&u| (lhs, u)));
        }
    }
    for (lhs, loc) in to_inactivate {
        b.provenance_mut().inactivate(lhs, loc);
    }
}

struct Reducer<'u> {
    vp: ValuePropagation,
    lv: Liveness,
    used_variables: &'u UnorderedSet<String>,
}

impl Reducer<'_> {
    /// Rebuild one subtree. `None` means everything below reduced away and the parent should
    /// drop this child entirely.
    fn rebuild(&mut self, b: &mut TreeBuilder, stmt: StmtId) -> Option<StmtId> {
        if !self.lv.is_stmt_live(stmt) && !contains_flagged(b.pool(), stmt) {
            if CONFIG.trace_reduction_decisions {
                trace!("Dropping dead subtree"; "stmt" => format!("{:?}", stmt));
            }
            return None;
        }
        match b.pool().stmt(stmt).clone() {
            Stmt::Block { stmts } => {
                let kept: Vec<StmtId> =
                    stmts.iter().filter_map(|&s| self.rebuild(b, s)).collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(b.make_block(kept))
                }
            }
            Stmt::Seq { insts } => {
                let kept: Vec<StmtId> =
                    insts.iter().filter_map(|&s| self.rebuild(b, s)).collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(b.make_instruction_sequence(kept))
                }
            }
            Stmt::Branch {
                cond,
                then_stmt,
                else_stmt,
            } => {
                let new_then = self.rebuild(b, then_stmt);
                let new_else = else_stmt.and_then(|e| self.rebuild(b, e));
                match (new_then, new_else) {
                    // Both arms reduced away: the branch (condition included, conditions are
                    // pure) is replaced by an empty block
                    (None, None) => Some(b.make_block(vec![])),
                    (then_arm, else_arm) => {
                        let hi_cond = self.vp.rewritten_expr(stmt, cond);
                        let then_arm = match then_arm {
                            Some(t) => t,
                            None => b.make_block(vec![]),
                        };
                        Some(b.make_branch(hi_cond, then_arm, else_arm))
                    }
                }
            }
            Stmt::Loop { cond, body } => {
                let new_body = self.rebuild(b, body)?;
                let hi_cond = cond.map(|c| self.vp.rewritten_expr(stmt, c));
                Some(b.make_loop(hi_cond, new_body))
            }
            Stmt::Switch {
                scrutinee,
                cases,
                default,
            } => {
                let mut any_kept = false;
                let new_cases: Vec<(u64, StmtId)> = cases
                    .iter()
                    .map(|&(value, arm)| {
                        let arm = match self.rebuild(b, arm) {
                            Some(a) => {
                                any_kept = true;
                                a
                            }
                            None => b.make_block(vec![]),
                        };
                        (value, arm)
                    })
                    .collect();
                let new_default = default.and_then(|d| {
                    let d = self.rebuild(b, d);
                    any_kept |= d.is_some();
                    d
                });
                if !any_kept {
                    return None;
                }
                let hi_scrutinee = self.vp.rewritten_expr(stmt, scrutinee);
                Some(b.make_switch(hi_scrutinee, new_cases, new_default))
            }
            Stmt::Return { value } => {
                let hi_value = value.map(|e| self.vp.rewritten_expr(stmt, e));
                let hi = b.make_return(hi_value);
                b.provenance_mut().add_instruction_mapping(hi, stmt);
                if let (Some(lo), Some(hi_v)) = (value, hi_value) {
                    self.record_expr_mapping(b, hi, hi_v, lo);
                }
                Some(hi)
            }
            Stmt::Goto { label } => {
                let hi = b.make_goto(&label);
                b.provenance_mut().add_instruction_mapping(hi, stmt);
                Some(hi)
            }
            Stmt::Assign { lhs, rhs, flags } => {
                if !self.keep_assignment(b, stmt, lhs, flags) {
                    return None;
                }
                let hi_lhs = self.vp.rewritten_lval(stmt, lhs);
                let hi_rhs = self.vp.rewritten_expr(stmt, rhs);
                let span = b.span_of(stmt);
                let hi = b.make_assignment(hi_lhs, hi_rhs, flags, span);
                b.provenance_mut().add_instruction_mapping(hi, stmt);
                self.record_expr_mapping(b, hi, hi_rhs, rhs);
                if hi_lhs != lhs {
                    b.provenance_mut().add_lval_mapping(hi_lhs, lhs);
                }
                Some(hi)
            }
            Stmt::Call {
                result,
                target,
                args,
                kills,
            } => {
                // Call operands are never rewritten (the propagation pass leaves ABI surfaces
                // alone), but a result stored through a computed address may be
                let hi_result = result.map(|r| self.vp.rewritten_lval(stmt, r));
                let span = b.span_of(stmt);
                let hi = b.make_call(hi_result, target, args, kills, span);
                b.provenance_mut().add_instruction_mapping(hi, stmt);
                if let (Some(lo_r), Some(hi_r)) = (result, hi_result) {
                    if hi_r != lo_r {
                        b.provenance_mut().add_lval_mapping(hi_r, lo_r);
                    }
                }
                Some(hi)
            }
        }
    }

    /// The retention chain, evaluated in this exact order.
    fn keep_assignment(
        &self,
        b: &TreeBuilder,
        inst: StmtId,
        lhs: LValId,
        flags: AssignFlags,
    ) -> bool {
        let decision = |keep: bool, why: &str| {
            if CONFIG.trace_reduction_decisions {
                trace!(
                    "Assignment retention decision";
                    "inst" => format!("{:?}", inst),
                    "keep" => keep,
                    "why" => why,
                );
            }
            keep
        };
        if self.vp.was_propagated(inst) && !flags.expose {
            return decision(false, "value propagated downstream");
        }
        if flags.must_materialize {
            return decision(true, "must-materialize store");
        }
        if flags.expose {
            return decision(true, "exposed store");
        }
        let name = match crate::ast::lval_name(b.pool(), lhs) {
            Some(n) => n,
            // A memory write is always observable
            None => return decision(true, "memory write"),
        };
        if b.is_global_name(name) {
            return decision(true, "global write");
        }
        if !self.used_variables.contains(name) {
            return decision(false, "name not in used set");
        }
        if b.provenance()
            .lval_defuses_high(lhs)
            .map(|du| du.has_active())
            .unwrap_or(false)
        {
            return decision(true, "active def-use survives");
        }
        decision(false, "no surviving evidence")
    }

    /// Map a rewritten expression back to its low-level form, and the containing high-level
    /// instruction to every low-level instruction whose value the rewrite folded in.
    fn record_expr_mapping(&self, b: &mut TreeBuilder, hi_inst: StmtId, hi: ExprId, lo: ExprId) {
        if hi != lo {
            b.provenance_mut().add_expression_mapping(hi, lo);
        }
        let mut folded = FoldedDefs {
            vp: &self.vp,
            defs: Vec::new(),
        };
        folded.visit_expr(b.pool(), hi);
        for def in folded.defs {
            b.provenance_mut().add_instruction_mapping(hi_inst, def);
        }
    }
}

/// Collects the defining instructions of every `Substituted` node below an expression.
struct FoldedDefs<'a> {
    vp: &'a ValuePropagation,
    defs: Vec<StmtId>,
}

impl Visitor for FoldedDefs<'_> {
    fn visit_expr(&mut self, pool: &NodePool, id: ExprId) {
        if let Expr::Substituted { .. } = pool.expr(id) {
            if let Some(def) = self.vp.substitution_def(id) {
                self.defs.push(def);
            }
        }
        crate::ast::walk_expr(self, pool, id)
    }
}

/// Does the subtree contain an assignment carrying a retention flag? Liveness does not see
/// flags, so a dead-per-liveness subtree with a flagged store cannot be fast-path dropped.
fn contains_flagged(pool: &NodePool, root: StmtId) -> bool {
    struct Scan {
        found: bool,
    }
    impl Visitor for Scan {
        fn visit_stmt(&mut self, pool: &NodePool, id: StmtId) {
            if self.found {
                return;
            }
            if let Stmt::Assign { flags, .. } = pool.stmt(id) {
                if flags.any() {
                    self.found = true;
                    return;
                }
            }
            crate::ast::walk_stmt(self, pool, id)
        }
    }
    let mut scan = Scan { found: false };
    scan.visit_stmt(pool, root);
    scan.found
}
