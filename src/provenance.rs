//! The provenance store: the recorded correspondence between a function's high-level and
//! low-level trees, plus the dataflow facts (reaching definitions, def-use sets) imported from
//! the decoder layer.
//!
//! Recording is two-phase. The importer records facts against machine *addresses*, because at
//! that point the instruction nodes for those addresses may not exist yet. Once the low-level
//! tree is complete, [`Provenance::resolve`] converts every address-based fact into an
//! instruction-id-based fact using the recorded address spans; after that the address-based
//! facts are frozen. The node mappings themselves stay recordable after resolution since the
//! reduction pass produces the high-level side last.

use crate::ast::{lval_name, AddrSpan, ExprId, LValId, NodePool, Stmt, StmtId};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::reduction_config::CONFIG;

/// A use site: the address of the using instruction and which operand of it performed the use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UseLoc {
    pub address: u64,
    pub operand: usize,
}

impl std::fmt::Debug for UseLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x}:{}", self.address, self.operand)
    }
}

/// The use set recorded for one written lvalue. `inactivate` suppresses individual locations
/// without forgetting they were recorded, so queries can distinguish the original evidence from
/// what later passes have narrowed it down to.
#[derive(Clone, Debug, Default)]
pub struct DefUses {
    recorded: Vec<UseLoc>,
    inactive: UnorderedSet<UseLoc>,
}

impl DefUses {
    pub fn recorded(&self) -> impl Iterator<Item = &UseLoc> {
        self.recorded.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &UseLoc> {
        self.recorded.iter().filter(|u| !self.inactive.contains(*u))
    }

    pub fn inactive(&self) -> impl Iterator<Item = &UseLoc> {
        self.recorded.iter().filter(|u| self.inactive.contains(*u))
    }

    pub fn has_active(&self) -> bool {
        self.active().next().is_some()
    }
}

/// A reaching-definition fact as recorded: the read variable and the addresses of the
/// instructions that may have defined it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RawReachingDefs {
    pub var: String,
    pub def_addresses: Vec<u64>,
}

/// A reaching-definition fact after resolution: addresses replaced by instruction ids.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReachingDefs {
    pub var: String,
    pub defs: Vec<StmtId>,
}

/// All provenance facts for one function.
#[derive(Default)]
pub struct Provenance {
    /// One high-level instruction may summarize several low-level steps
    inst_map: UnorderedMap<StmtId, Vec<StmtId>>,
    expr_map: UnorderedMap<ExprId, ExprId>,
    lval_map: UnorderedMap<LValId, LValId>,

    raw_expr_defs: UnorderedMap<ExprId, Vec<RawReachingDefs>>,
    raw_flag_defs: UnorderedMap<ExprId, Vec<RawReachingDefs>>,
    expr_defs: UnorderedMap<ExprId, Vec<ReachingDefs>>,
    flag_defs: UnorderedMap<ExprId, Vec<ReachingDefs>>,

    defuses: UnorderedMap<LValId, DefUses>,
    defuses_high: UnorderedMap<LValId, DefUses>,

    resolved: bool,
}

impl Provenance {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Record that high-level instruction `hi` summarizes low-level instruction `lo`. Appending;
    /// call repeatedly when one statement folds several steps.
    pub fn add_instruction_mapping(&mut self, hi: StmtId, lo: StmtId) {
        self.inst_map.entry(hi).or_default().push(lo);
    }

    pub fn add_expression_mapping(&mut self, hi: ExprId, lo: ExprId) {
        let prev = self.expr_map.insert(hi, lo);
        assert!(
            prev.is_none() || prev == Some(lo),
            "Expression {:?} mapped to two different low-level expressions",
            hi
        );
    }

    pub fn add_lval_mapping(&mut self, hi: LValId, lo: LValId) {
        let prev = self.lval_map.insert(hi, lo);
        assert!(
            prev.is_none() || prev == Some(lo),
            "LValue {:?} mapped to two different low-level lvalues",
            hi
        );
    }

    /// Record the reaching definitions observed for a read expression. Address-based; must
    /// precede resolution.
    pub fn add_expr_reaching_defs(&mut self, expr: ExprId, defs: Vec<RawReachingDefs>) {
        assert!(!self.resolved, "Reaching defs recorded after resolution");
        self.raw_expr_defs.entry(expr).or_default().extend(defs);
    }

    /// Like [`Self::add_expr_reaching_defs`], but for the condition-flag inputs of an expression.
    pub fn add_flag_reaching_defs(&mut self, expr: ExprId, defs: Vec<RawReachingDefs>) {
        assert!(!self.resolved, "Flag reaching defs recorded after resolution");
        self.raw_flag_defs.entry(expr).or_default().extend(defs);
    }

    pub fn add_lval_defuses(&mut self, lval: LValId, uses: impl IntoIterator<Item = UseLoc>) {
        self.defuses.entry(lval).or_default().recorded.extend(uses);
    }

    pub fn add_lval_defuses_high(&mut self, lval: LValId, uses: impl IntoIterator<Item = UseLoc>) {
        self.defuses_high
            .entry(lval)
            .or_default()
            .recorded
            .extend(uses);
    }

    /// Suppress one use location of a written lvalue, keeping the record itself. Liveness
    /// analysis uses this to narrow def-use evidence it has disproven.
    pub fn inactivate(&mut self, lval: LValId, loc: UseLoc) {
        if let Some(du) = self.defuses_high.get_mut(&lval) {
            du.inactive.insert(loc);
        }
        if let Some(du) = self.defuses.get_mut(&lval) {
            du.inactive.insert(loc);
        }
    }

    pub fn instruction_mapped(&self, hi: StmtId) -> Option<&[StmtId]> {
        self.inst_map.get(&hi).map(|v| v.as_slice())
    }

    pub fn expression_mapped(&self, hi: ExprId) -> Option<ExprId> {
        self.expr_map.get(&hi).copied()
    }

    pub fn lval_mapped(&self, hi: LValId) -> Option<LValId> {
        self.lval_map.get(&hi).copied()
    }

    /// Resolved reaching definitions for a read expression; empty slice when none survive.
    pub fn expr_reaching_defs(&self, expr: ExprId) -> &[ReachingDefs] {
        assert!(self.resolved, "Reaching defs queried before resolution");
        self.expr_defs.get(&expr).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn flag_reaching_defs(&self, expr: ExprId) -> &[ReachingDefs] {
        assert!(self.resolved, "Flag reaching defs queried before resolution");
        self.flag_defs.get(&expr).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn lval_defuses(&self, lval: LValId) -> Option<&DefUses> {
        self.defuses.get(&lval)
    }

    pub fn lval_defuses_high(&self, lval: LValId) -> Option<&DefUses> {
        self.defuses_high.get(&lval)
    }

    pub fn inst_map_iter(&self) -> impl Iterator<Item = (&StmtId, &Vec<StmtId>)> {
        self.inst_map.iter()
    }

    pub fn expr_map_iter(&self) -> impl Iterator<Item = (&ExprId, &ExprId)> {
        self.expr_map.iter()
    }

    pub fn lval_map_iter(&self) -> impl Iterator<Item = (&LValId, &LValId)> {
        self.lval_map.iter()
    }

    /// The address-based facts as recorded. The wire format persists these rather than the
    /// resolved ids so a document survives re-decoding into a pool with different ids.
    pub fn raw_expr_defs_iter(&self) -> impl Iterator<Item = (&ExprId, &Vec<RawReachingDefs>)> {
        self.raw_expr_defs.iter()
    }

    pub fn raw_flag_defs_iter(&self) -> impl Iterator<Item = (&ExprId, &Vec<RawReachingDefs>)> {
        self.raw_flag_defs.iter()
    }

    pub fn expr_defs_iter(&self) -> impl Iterator<Item = (&ExprId, &Vec<ReachingDefs>)> {
        assert!(self.resolved, "Reaching defs iterated before resolution");
        self.expr_defs.iter()
    }

    pub fn flag_defs_iter(&self) -> impl Iterator<Item = (&ExprId, &Vec<ReachingDefs>)> {
        assert!(self.resolved, "Flag reaching defs iterated before resolution");
        self.flag_defs.iter()
    }

    pub fn defuses_iter(&self) -> impl Iterator<Item = (&LValId, &DefUses)> {
        self.defuses.iter()
    }

    pub fn defuses_high_iter(&self) -> impl Iterator<Item = (&LValId, &DefUses)> {
        self.defuses_high.iter()
    }

    /// Convert every address-based fact into an instruction-id-based one. `spans` maps each
    /// instruction node to the address span it was reconstructed from. A raw definition address
    /// resolves to the instruction at that address that writes the fact's variable (an
    /// assignment, or a call storing its result there). Locations that resolve to nothing are
    /// dropped with a diagnostic.
    pub(crate) fn resolve(
        &mut self,
        pool: &NodePool,
        spans: &UnorderedMap<StmtId, AddrSpan>,
    ) {
        assert!(!self.resolved, "Provenance resolved twice");

        let mut by_address: UnorderedMap<u64, Vec<StmtId>> = Default::default();
        for (&id, span) in spans.iter() {
            if pool.stmt(id).is_instruction() {
                by_address.entry(span.lo).or_default().push(id);
            }
        }

        self.expr_defs = resolve_raw(&self.raw_expr_defs, pool, &by_address);
        self.flag_defs = resolve_raw(&self.raw_flag_defs, pool, &by_address);
        self.resolved = true;
    }
}

fn written_name(pool: &NodePool, inst: StmtId) -> Option<&str> {
    match pool.stmt(inst) {
        Stmt::Assign { lhs, .. } => lval_name(pool, *lhs),
        Stmt::Call {
            result: Some(r), ..
        } => lval_name(pool, *r),
        _ => None,
    }
}

fn resolve_raw(
    raw: &UnorderedMap<ExprId, Vec<RawReachingDefs>>,
    pool: &NodePool,
    by_address: &UnorderedMap<u64, Vec<StmtId>>,
) -> UnorderedMap<ExprId, Vec<ReachingDefs>> {
    let mut out: UnorderedMap<ExprId, Vec<ReachingDefs>> = Default::default();
    for (&expr, facts) in raw.iter() {
        let mut resolved_facts = Vec::new();
        for fact in facts {
            let mut defs = Vec::new();
            for &address in &fact.def_addresses {
                let candidates = by_address.get(&address).map(|v| v.as_slice()).unwrap_or(&[]);
                let matched = candidates
                    .iter()
                    .find(|&&inst| written_name(pool, inst) == Some(fact.var.as_str()));
                match matched {
                    Some(&inst) => defs.push(inst),
                    None => {
                        if CONFIG.warn_on_resolution_miss {
                            warn!(
                                "Dropping unresolvable reaching definition";
                                "var" => &fact.var,
                                "address" => format!("{:#x}", address),
                            );
                        } else {
                            debug!(
                                "Dropping unresolvable reaching definition";
                                "var" => &fact.var,
                                "address" => format!("{:#x}", address),
                            );
                        }
                    }
                }
            }
            resolved_facts.push(ReachingDefs {
                var: fact.var.clone(),
                defs,
            });
        }
        out.insert(expr, resolved_facts);
    }
    out
}
