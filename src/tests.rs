use crate::ast::{AddrSpan, BinaryOp, CallTarget, Offset};
use crate::builder::{FunctionTree, ModuleContext, StorageSlot, TreeBuilder};
use crate::containers::unordered::UnorderedSet;
use crate::provenance::{RawReachingDefs, UseLoc};
use crate::symtab::VarInfo;

#[cfg(test)]
use crate::ast::{render_stmt, CType, NodeCounter, Stmt, Visitor};

#[cfg(test)]
fn assert_unorderedset_eq<T: Eq + std::hash::Hash + Ord + std::fmt::Debug>(
    a: impl IntoIterator<Item = T>,
    b: impl IntoIterator<Item = T>,
) {
    let a: UnorderedSet<_> = a.into_iter().collect();
    let b: UnorderedSet<_> = b.into_iter().collect();
    assert_eq!(a, b)
}

fn used(names: &[&str]) -> UnorderedSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The low-level sequence `t = R0 + 4; R1 = *(t); R1 = R1 & 0xff`, reduced. With `with_call`,
/// the value is consumed by a trailing `sink(R1)` call (with the matching def-use record the
/// decoder would supply); without it, nothing reads either variable afterward.
pub fn masked_load_function(ctx: &mut ModuleContext, with_call: bool) -> FunctionTree {
    let mut b = TreeBuilder::new(ctx, "masked_load", 0x1000);
    b.add_local_symbol(
        "R0",
        VarInfo {
            param_index: Some(0),
            ..Default::default()
        },
    );
    b.add_local_symbol("R1", Default::default());
    b.add_local_symbol("t", Default::default());
    b.set_storage(
        "R0",
        StorageSlot::Register { name: "r0".into() },
    );
    b.set_storage(
        "R1",
        StorageSlot::Register { name: "r1".into() },
    );
    b.set_storage("t", StorageSlot::StackOffset { offset: -8 });

    // t = R0 + 4
    let lv_t = b.make_variable_lval("t", Offset::None);
    let r0 = b.make_variable_lval("R0", Offset::None);
    let read_r0 = b.make_lval_read(r0);
    let four = b.make_constant(4, 8);
    let rhs1 = b.make_binary(BinaryOp::Add, read_r0, four);
    let s1 = b.make_assignment(
        lv_t,
        rhs1,
        Default::default(),
        Some(AddrSpan {
            lo: 0x1000,
            hi: 0x1004,
        }),
    );

    // R1 = *(t)
    let lv_r1 = b.make_variable_lval("R1", Offset::None);
    let t2 = b.make_variable_lval("t", Offset::None);
    let read_t = b.make_lval_read(t2);
    let deref_t = b.make_deref_lval(read_t, Offset::None);
    let rhs2 = b.make_lval_read(deref_t);
    let s2 = b.make_assignment(
        lv_r1,
        rhs2,
        Default::default(),
        Some(AddrSpan {
            lo: 0x1004,
            hi: 0x1008,
        }),
    );

    // R1 = R1 & 0xff
    let lv_r1b = b.make_variable_lval("R1", Offset::None);
    let r1 = b.make_variable_lval("R1", Offset::None);
    let read_r1 = b.make_lval_read(r1);
    let mask = b.make_constant(0xff, 8);
    let rhs3 = b.make_binary(BinaryOp::And, read_r1, mask);
    let s3 = b.make_assignment(
        lv_r1b,
        rhs3,
        Default::default(),
        Some(AddrSpan {
            lo: 0x1008,
            hi: 0x100c,
        }),
    );

    b.provenance_mut().add_expr_reaching_defs(
        read_t,
        vec![RawReachingDefs {
            var: "t".into(),
            def_addresses: vec![0x1000],
        }],
    );

    let mut insts = vec![s1, s2, s3];
    if with_call {
        let arg_lv = b.make_variable_lval("R1", Offset::None);
        let arg = b.make_lval_read(arg_lv);
        let s4 = b.make_call(
            None,
            CallTarget::Direct {
                name: "sink".into(),
            },
            vec![arg],
            vec![],
            Some(AddrSpan {
                lo: 0x100c,
                hi: 0x1010,
            }),
        );
        insts.push(s4);
        let use_loc = UseLoc {
            address: 0x100c,
            operand: 0,
        };
        b.provenance_mut().add_lval_defuses(lv_r1b, [use_loc]);
        b.provenance_mut().add_lval_defuses_high(lv_r1b, [use_loc]);
    }

    let low = b.make_instruction_sequence(insts);
    b.add_tree_root(low);
    b.resolve_provenance();

    let used_vars = if with_call { used(&["R1"]) } else { used(&[]) };
    crate::reduce::reduce(&mut b, low, &used_vars);
    b.finish()
}

#[test]
fn dead_sequence_reduces_to_empty() {
    let mut ctx = ModuleContext::new();
    let func = masked_load_function(&mut ctx, false);
    match ctx.pool.stmt(func.high_root()) {
        Stmt::Seq { insts } => assert!(insts.is_empty(), "expected no surviving instructions"),
        other => panic!("expected an instruction sequence, got {:?}", other),
    }
}

#[test]
fn consumed_value_folds_to_single_assignment() {
    let mut ctx = ModuleContext::new();
    let func = masked_load_function(&mut ctx, true);
    assert_eq!(
        render_stmt(&ctx.pool, func.high_root()),
        "{\n  R1 = (*((R0 + 4)) & 0xff);\n  sink(R1);\n}\n"
    );
    match ctx.pool.stmt(func.high_root()) {
        Stmt::Seq { insts } => {
            assert_eq!(insts.len(), 2);
            // The surviving assignment folds all three low-level steps
            let mapped = func
                .provenance
                .instruction_mapped(insts[0])
                .expect("surviving assignment carries provenance");
            assert_eq!(mapped.len(), 3);
        }
        other => panic!("expected an instruction sequence, got {:?}", other),
    }
}

#[test]
fn low_level_tree_is_untouched_by_reduction() {
    let mut ctx = ModuleContext::new();
    let func = masked_load_function(&mut ctx, true);
    assert_eq!(
        render_stmt(&ctx.pool, func.low_root()),
        "{\n  t = (R0 + 4);\n  R1 = *(t);\n  R1 = (R1 & 0xff);\n  sink(R1);\n}\n"
    );
}

#[test]
fn liveness_excludes_dead_plain_assignment() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "dead_store", 0x2000);
    b.add_local_symbol("a", Default::default());
    b.add_local_symbol("R0", Default::default());

    let lv_a = b.make_variable_lval("a", Offset::None);
    let one = b.make_constant(1, 8);
    let s1 = b.make_assignment(
        lv_a,
        one,
        Default::default(),
        Some(AddrSpan {
            lo: 0x2000,
            hi: 0x2004,
        }),
    );
    // Stale evidence from the decoder: a use site liveness will disprove
    let stale = UseLoc {
        address: 0x2004,
        operand: 0,
    };
    b.provenance_mut().add_lval_defuses_high(lv_a, [stale]);

    let r0 = b.make_variable_lval("R0", Offset::None);
    let read_r0 = b.make_lval_read(r0);
    let ret = b.make_return(Some(read_r0));
    let seq = b.make_instruction_sequence(vec![s1]);
    let low = b.make_block(vec![seq, ret]);
    b.add_tree_root(low);
    b.resolve_provenance();

    crate::reduce::reduce(&mut b, low, &used(&["a"]));
    let func = b.finish();

    match ctx.pool.stmt(func.high_root()) {
        Stmt::Block { stmts } => {
            assert_eq!(stmts.len(), 1);
            assert!(matches!(ctx.pool.stmt(stmts[0]), Stmt::Return { .. }));
        }
        other => panic!("expected a block, got {:?}", other),
    }
    // The evidence was narrowed, not erased
    let du = func.provenance.lval_defuses_high(lv_a).unwrap();
    assert_eq!(du.recorded().count(), 1);
    assert_eq!(du.active().count(), 0);
}

#[test]
fn self_referential_definition_is_never_substituted() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "self_ref", 0x3000);
    b.add_local_symbol("n", Default::default());
    b.add_local_symbol("m", Default::default());

    // n = n + 1
    let lv_n = b.make_variable_lval("n", Offset::None);
    let n_read_lv = b.make_variable_lval("n", Offset::None);
    let read_n = b.make_lval_read(n_read_lv);
    let one = b.make_constant(1, 8);
    let rhs1 = b.make_binary(BinaryOp::Add, read_n, one);
    let s1 = b.make_assignment(lv_n, rhs1, Default::default(), None);

    // m = n
    let lv_m = b.make_variable_lval("m", Offset::None);
    let n_read_lv2 = b.make_variable_lval("n", Offset::None);
    let read_n2 = b.make_lval_read(n_read_lv2);
    let s2 = b.make_assignment(lv_m, read_n2, Default::default(), None);

    let low = b.make_instruction_sequence(vec![s1, s2]);
    b.add_tree_root(low);

    let vp = crate::value_propagation::ValuePropagation::analyze(&mut b, low);
    assert_eq!(vp.rewritten_expr(s2, read_n2), read_n2);
    assert!(!vp.was_propagated(s1));
}

#[test]
fn branch_join_drops_names_with_differing_origins() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "join", 0x4000);
    for name in ["c", "w", "x", "y", "z"] {
        b.add_local_symbol(name, Default::default());
    }

    // w = 5 (before the branch, untouched by either arm)
    let lv_w = b.make_variable_lval("w", Offset::None);
    let five = b.make_constant(5, 8);
    let s_w = b.make_assignment(lv_w, five, Default::default(), None);

    // if (c) { x = 1 } else { x = 2 }
    let c = b.make_variable_lval("c", Offset::None);
    let read_c = b.make_lval_read(c);
    let lv_x1 = b.make_variable_lval("x", Offset::None);
    let one = b.make_constant(1, 8);
    let s_then = b.make_assignment(lv_x1, one, Default::default(), None);
    let then_seq = b.make_instruction_sequence(vec![s_then]);
    let lv_x2 = b.make_variable_lval("x", Offset::None);
    let two = b.make_constant(2, 8);
    let s_else = b.make_assignment(lv_x2, two, Default::default(), None);
    let else_seq = b.make_instruction_sequence(vec![s_else]);
    let branch = b.make_branch(read_c, then_seq, Some(else_seq));

    // y = x; z = w
    let lv_y = b.make_variable_lval("y", Offset::None);
    let x_read_lv = b.make_variable_lval("x", Offset::None);
    let read_x = b.make_lval_read(x_read_lv);
    let s_y = b.make_assignment(lv_y, read_x, Default::default(), None);
    let lv_z = b.make_variable_lval("z", Offset::None);
    let w_read_lv = b.make_variable_lval("w", Offset::None);
    let read_w = b.make_lval_read(w_read_lv);
    let s_z = b.make_assignment(lv_z, read_w, Default::default(), None);
    let tail = b.make_instruction_sequence(vec![s_y, s_z]);

    let low = b.make_block(vec![s_w, branch, tail]);
    b.add_tree_root(low);

    let vp = crate::value_propagation::ValuePropagation::analyze(&mut b, low);
    // x was defined differently on the two paths: no substitution
    assert_eq!(vp.rewritten_expr(s_y, read_x), read_x);
    // w flowed through the branch untouched: substituted
    assert_ne!(vp.rewritten_expr(s_z, read_w), read_w);
    assert!(vp.was_propagated(s_w));
}

#[test]
fn substitution_never_crosses_redefinition_of_an_input() {
    let mut ctx = ModuleContext::new();
    ctx.globals.add_symbol(
        "b",
        VarInfo {
            global_address: Some(0xa000),
            ..Default::default()
        },
    );
    let mut b = TreeBuilder::new(&mut ctx, "stale_input", 0x8000);
    b.add_local_symbol("a", Default::default());
    b.add_local_symbol("c", Default::default());

    // a = b + 1
    let lv_a = b.make_variable_lval("a", Offset::None);
    let b_read_lv = b.make_variable_lval("b", Offset::None);
    let read_b = b.make_lval_read(b_read_lv);
    let one = b.make_constant(1, 8);
    let rhs1 = b.make_binary(BinaryOp::Add, read_b, one);
    let s1 = b.make_assignment(
        lv_a,
        rhs1,
        Default::default(),
        Some(AddrSpan {
            lo: 0x8000,
            hi: 0x8004,
        }),
    );
    b.provenance_mut().add_lval_defuses_high(
        lv_a,
        [UseLoc {
            address: 0x8008,
            operand: 0,
        }],
    );

    // b = 2 (invalidates the tracked value of `a`, which was computed from the old `b`)
    let lv_b = b.make_variable_lval("b", Offset::None);
    let two = b.make_constant(2, 8);
    let s2 = b.make_assignment(lv_b, two, Default::default(), None);

    // c = a; return c
    let lv_c = b.make_variable_lval("c", Offset::None);
    let a_read_lv = b.make_variable_lval("a", Offset::None);
    let read_a = b.make_lval_read(a_read_lv);
    let s3 = b.make_assignment(lv_c, read_a, Default::default(), None);
    let c_read_lv = b.make_variable_lval("c", Offset::None);
    let read_c = b.make_lval_read(c_read_lv);
    let ret = b.make_return(Some(read_c));

    let seq = b.make_instruction_sequence(vec![s1, s2, s3]);
    let low = b.make_block(vec![seq, ret]);
    b.add_tree_root(low);
    b.resolve_provenance();

    crate::reduce::reduce(&mut b, low, &used(&["a", "c"]));
    let func = b.finish();

    // `a = b + 1` must survive: substituting `b + 1` past the write to `b` would
    // return the new value where the low-level tree returns the old one
    assert_eq!(
        render_stmt(&ctx.pool, func.high_root()),
        "{\n  {\n    a = (b + 1);\n    b = 2;\n  }\n  return a;\n}\n"
    );
}

#[test]
fn branch_with_both_arms_reduced_away_becomes_empty_block() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "hollow_branch", 0x9000);
    for name in ["c", "x"] {
        b.add_local_symbol(name, Default::default());
    }

    // if (c) { x = 1 } else { x = 2 }; return x -- with nothing in the used set,
    // both arms drop, but the branch itself is live per liveness
    let c = b.make_variable_lval("c", Offset::None);
    let read_c = b.make_lval_read(c);
    let lv_x1 = b.make_variable_lval("x", Offset::None);
    let one = b.make_constant(1, 8);
    let s_then = b.make_assignment(lv_x1, one, Default::default(), None);
    let then_seq = b.make_instruction_sequence(vec![s_then]);
    let lv_x2 = b.make_variable_lval("x", Offset::None);
    let two = b.make_constant(2, 8);
    let s_else = b.make_assignment(lv_x2, two, Default::default(), None);
    let else_seq = b.make_instruction_sequence(vec![s_else]);
    let branch = b.make_branch(read_c, then_seq, Some(else_seq));

    let x_read_lv = b.make_variable_lval("x", Offset::None);
    let read_x = b.make_lval_read(x_read_lv);
    let ret = b.make_return(Some(read_x));
    let low = b.make_block(vec![branch, ret]);
    b.add_tree_root(low);
    b.resolve_provenance();

    crate::reduce::reduce(&mut b, low, &used(&[]));
    let func = b.finish();

    match ctx.pool.stmt(func.high_root()) {
        Stmt::Block { stmts } => {
            assert_eq!(stmts.len(), 2);
            match ctx.pool.stmt(stmts[0]) {
                Stmt::Block { stmts } => assert!(stmts.is_empty(), "expected an empty block"),
                other => panic!("expected an empty block, got {:?}", other),
            }
            assert!(matches!(ctx.pool.stmt(stmts[1]), Stmt::Return { .. }));
        }
        other => panic!("expected a block, got {:?}", other),
    }
}

#[test]
fn symbol_reregistration_merges_and_never_regresses() {
    let mut ctx = ModuleContext::new();
    let t_int = ctx.pool.intern_type(CType::Int {
        size: 4,
        signed: true,
    });
    let t_other = ctx.pool.intern_type(CType::Int {
        size: 8,
        signed: false,
    });

    assert_eq!(ctx.globals.add_symbol("counter", Default::default()).ty, None);
    assert_eq!(ctx.globals.get_symbol("counter").ty, None);
    assert!(ctx.globals.lookup("unregistered").is_none());

    // A later registration with a real type updates the untyped entry, and the merged record
    // is handed back
    let merged = ctx.globals.add_symbol(
        "counter",
        VarInfo {
            ty: Some(t_int),
            ..Default::default()
        },
    );
    assert_eq!(merged.ty, Some(t_int));
    assert_eq!(ctx.globals.get_symbol("counter").ty, Some(t_int));

    // Neither a conflicting type nor an untyped re-registration regresses it
    ctx.globals.add_symbol(
        "counter",
        VarInfo {
            ty: Some(t_other),
            ..Default::default()
        },
    );
    ctx.globals.add_symbol("counter", Default::default());
    assert_eq!(ctx.globals.get_symbol("counter").ty, Some(t_int));
}

#[test]
#[should_panic(expected = "Conflicting struct layouts")]
fn conflicting_struct_layouts_are_fatal() {
    use crate::symtab::StructLayout;
    let mut ctx = ModuleContext::new();
    let t_int = ctx.pool.intern_type(CType::Int {
        size: 4,
        signed: true,
    });
    ctx.globals.add_struct_layout(
        "pair",
        StructLayout {
            fields: vec![("a".into(), 0, t_int)],
        },
    );
    ctx.globals.add_struct_layout(
        "pair",
        StructLayout {
            fields: vec![("b".into(), 0, t_int)],
        },
    );
}

#[test]
fn lval_from_expr_rejects_kinds_without_lvalue_form() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "f", 0);
    let c = b.make_constant(7, 4);
    assert!(b.make_lval_from_expr(c).is_err());

    let lv = b.make_variable_lval("x", Offset::None);
    let read = b.make_lval_read(lv);
    assert_eq!(b.make_lval_from_expr(read), Ok(lv));
}

#[test]
fn reaching_defs_resolve_by_address_and_variable() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "resolution", 0x5000);
    b.add_local_symbol("t", Default::default());
    b.add_local_symbol("u", Default::default());

    let lv_t = b.make_variable_lval("t", Offset::None);
    let one = b.make_constant(1, 8);
    let s1 = b.make_assignment(
        lv_t,
        one,
        Default::default(),
        Some(AddrSpan {
            lo: 0x5000,
            hi: 0x5004,
        }),
    );
    // An assignment to a different variable at the same address must not match
    let lv_u = b.make_variable_lval("u", Offset::None);
    let two = b.make_constant(2, 8);
    let s2 = b.make_assignment(
        lv_u,
        two,
        Default::default(),
        Some(AddrSpan {
            lo: 0x5000,
            hi: 0x5004,
        }),
    );
    let t_read_lv = b.make_variable_lval("t", Offset::None);
    let read_t = b.make_lval_read(t_read_lv);

    b.provenance_mut().add_expr_reaching_defs(
        read_t,
        vec![RawReachingDefs {
            var: "t".into(),
            // The second address resolves to nothing and is dropped
            def_addresses: vec![0x5000, 0xdead],
        }],
    );

    let low = b.make_instruction_sequence(vec![s1, s2]);
    b.add_tree_root(low);
    b.resolve_provenance();

    let facts = b.provenance().expr_reaching_defs(read_t);
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].var, "t");
    assert_eq!(facts[0].defs, vec![s1]);
}

#[cfg(test)]
fn round_trip_document() -> crate::pir::Document {
    let mut ctx = ModuleContext::new();
    let t_int = ctx.pool.intern_type(CType::Int {
        size: 8,
        signed: false,
    });
    let t_ptr = ctx.pool.intern_type(CType::Pointer { pointee: t_int });
    ctx.pool.intern_type(CType::Struct { key: "pair".into() });
    ctx.globals.add_struct_layout(
        "pair",
        crate::symtab::StructLayout {
            fields: vec![("lo".into(), 0, t_int), ("hi".into(), 8, t_int)],
        },
    );
    ctx.globals.add_symbol(
        "g",
        VarInfo {
            ty: Some(t_ptr),
            global_address: Some(0x8000),
            ..Default::default()
        },
    );
    let func = masked_load_function(&mut ctx, true);

    let mut doc = crate::pir::Document::new(ctx);
    assert_eq!(doc.add_fragment("mov r0, r0\nret"), 0);
    assert_eq!(doc.add_fragment("mov r0, r0\nret"), 0);
    assert_eq!(doc.add_fragment("nop"), 1);
    doc.functions.push(func);
    doc
}

#[test]
fn document_round_trips_exactly() {
    let doc = round_trip_document();
    let text = doc.encode();
    let doc2 = crate::pir::Document::decode(&text).expect("document decodes");
    assert_eq!(doc2.encode(), text);
    assert_eq!(doc2.fragments(), doc.fragments());

    // Both trees print identically after the round trip
    let func = &doc.functions[0];
    let func2 = &doc2.functions[0];
    assert_eq!(func2.name, func.name);
    assert_eq!(func2.address, func.address);
    assert_eq!(func2.roots.len(), func.roots.len());
    for (&r, &r2) in func.roots.iter().zip(func2.roots.iter()) {
        assert_eq!(
            render_stmt(&doc.context.pool, r),
            render_stmt(&doc2.context.pool, r2)
        );
    }

    // Deduplication never grows the forest
    let count = |doc: &crate::pir::Document, func: &FunctionTree| {
        let mut c = NodeCounter::new();
        for &r in &func.roots {
            c.visit_stmt(&doc.context.pool, r);
        }
        c.count()
    };
    assert!(count(&doc2, func2) <= count(&doc, func));
}

#[test]
fn equal_constants_share_a_wire_record() {
    let mut ctx = ModuleContext::new();
    ctx.globals.add_symbol(
        "g1",
        VarInfo {
            global_address: Some(0x9000),
            ..Default::default()
        },
    );
    ctx.globals.add_symbol(
        "g2",
        VarInfo {
            global_address: Some(0x9008),
            ..Default::default()
        },
    );

    let mut b = TreeBuilder::new(&mut ctx, "constants", 0x6000);
    // g1 = 7; g2 = 7; g1 = 8 -- two sevens from distinct pool nodes
    let lv_g1 = b.make_variable_lval("g1", Offset::None);
    let seven_a = b.make_constant(7, 8);
    let s1 = b.make_assignment(lv_g1, seven_a, Default::default(), None);
    let lv_g2 = b.make_variable_lval("g2", Offset::None);
    let seven_b = b.make_constant(7, 8);
    let s2 = b.make_assignment(lv_g2, seven_b, Default::default(), None);
    let lv_g1b = b.make_variable_lval("g1", Offset::None);
    let eight = b.make_constant(8, 8);
    let s3 = b.make_assignment(lv_g1b, eight, Default::default(), None);
    let low = b.make_instruction_sequence(vec![s1, s2, s3]);
    b.add_tree_root(low);
    b.resolve_provenance();
    crate::reduce::reduce(&mut b, low, &used(&[]));
    let func = b.finish();

    let mut doc = crate::pir::Document::new(ctx);
    doc.functions.push(func);
    let text = doc.encode();

    let const_records: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("\t\t") && l.contains("\tCONST\t"))
        .collect();
    assert_eq!(
        const_records
            .iter()
            .filter(|l| l.contains("\tCONST\t0x7\t"))
            .count(),
        1
    );
    assert_eq!(
        const_records
            .iter()
            .filter(|l| l.contains("\tCONST\t0x8\t"))
            .count(),
        1
    );
}

#[test]
fn unknown_node_tag_is_a_hard_decode_failure() {
    let text = "PIR\t1\n\nTYPES\n\nSYMBOLS\n\nFRAGMENTS\n\nFUNCTION\tf\t0x0\n\tROOTS\t0,0\n\tNODES\n\t\t0\tBOGUS\t-\n";
    let err = match crate::pir::Document::decode(text) {
        Err(e) => e,
        Ok(_) => panic!("decode unexpectedly succeeded"),
    };
    assert!(err.contains("Unknown node tag"), "unexpected error: {}", err);
}

#[test]
fn unsupported_version_is_rejected() {
    let err = match crate::pir::Document::decode("PIR\t99\n") {
        Err(e) => e,
        Ok(_) => panic!("decode unexpectedly succeeded"),
    };
    assert!(err.contains("Unsupported format version"), "unexpected error: {}", err);
}

#[test]
fn liveness_keeps_values_read_by_later_loop_iterations() {
    let mut ctx = ModuleContext::new();
    let mut b = TreeBuilder::new(&mut ctx, "loop_carried", 0x7000);
    b.add_local_symbol("i", Default::default());
    b.add_local_symbol("n", Default::default());

    // i = 0; while (i < n) { i = i + 1 }
    let lv_i = b.make_variable_lval("i", Offset::None);
    let zero = b.make_constant(0, 8);
    let s_init = b.make_assignment(lv_i, zero, Default::default(), None);

    let i_read_lv = b.make_variable_lval("i", Offset::None);
    let read_i = b.make_lval_read(i_read_lv);
    let n_read_lv = b.make_variable_lval("n", Offset::None);
    let read_n = b.make_lval_read(n_read_lv);
    let cond = b.make_binary(BinaryOp::SLt, read_i, read_n);

    let lv_i2 = b.make_variable_lval("i", Offset::None);
    let i_read_lv2 = b.make_variable_lval("i", Offset::None);
    let read_i2 = b.make_lval_read(i_read_lv2);
    let one = b.make_constant(1, 8);
    let inc = b.make_binary(BinaryOp::Add, read_i2, one);
    let s_inc = b.make_assignment(lv_i2, inc, Default::default(), None);
    let body = b.make_instruction_sequence(vec![s_inc]);
    let lp = b.make_loop(Some(cond), body);

    let low = b.make_block(vec![s_init, lp]);
    b.add_tree_root(low);

    let lv = crate::liveness::Liveness::analyze(&b, low);
    // The initialization's value is read by the loop, so it is live on exit
    assert_unorderedset_eq(
        lv.live_on_exit(s_init).unwrap().iter().cloned(),
        ["i".to_string(), "n".to_string()],
    );
    assert!(lv.is_stmt_live(s_init));
}
