//! The PIR wire format: a line-oriented, tab-indented text serialization of a whole translation
//! unit (node pool, symbol tables, code fragments, and every function's trees plus provenance).
//!
//! Encoding flattens each tree into `{id, tag, fields, child ids}` records, children before
//! parents, with two forms of sharing: a node reachable from several parents is emitted once
//! under one wire id, and side-effect-free value nodes (constants, sizeofs) additionally
//! collapse across *distinct* pool nodes when their records are byte-identical. Nodes whose
//! identity carries meaning beyond their value (anything def-use or mapping facts can attach to)
//! are never collapsed, so provenance survives a round trip.
//!
//! Decoding is a single memoized pass over the records, followed by the same provenance
//! resolution step construction uses: the wire format stores reaching definitions by machine
//! address, not node id, so a document re-resolves cleanly no matter what ids the decoding pool
//! hands out.

use std::iter::Peekable;

use itertools::Itertools;

use crate::ast::{
    AddrSpan, AssignFlags, BinaryOp, CType, CallTarget, Expr, ExprId, LVal, LValId, NodePool,
    Offset, Stmt, StmtId, TypeId, UnaryOp,
};
use crate::builder::{FunctionTree, ModuleContext, StorageSlot, TreeBuilder};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::provenance::{RawReachingDefs, UseLoc};
use crate::symtab::{EnumDef, StructLayout, VarInfo};

/// Format version emitted and accepted by this implementation.
pub const FORMAT_VERSION: u32 = 1;

/// A whole translation unit, as serialized: shared context, the verbatim code-fragment table,
/// and one record per function.
#[derive(Default)]
pub struct Document {
    pub context: ModuleContext,
    fragments: Vec<String>,
    pub functions: Vec<FunctionTree>,
}

impl Document {
    pub fn new(context: ModuleContext) -> Self {
        Document {
            context,
            fragments: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Add a verbatim code fragment, returning its index. Identical fragments share an entry.
    pub fn add_fragment(&mut self, fragment: &str) -> usize {
        match self.fragments.iter().position(|f| f == fragment) {
            Some(i) => i,
            None => {
                self.fragments.push(fragment.to_owned());
                self.fragments.len() - 1
            }
        }
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Serialize the whole document.
    pub fn encode(&self) -> String {
        let mut res = String::new();
        self.encode_to(&mut res).unwrap();
        res
    }

    fn encode_to(&self, f: &mut String) -> std::fmt::Result {
        use std::fmt::Write;

        writeln!(f, "PIR\t{}", FORMAT_VERSION)?;
        writeln!(f)?;

        let pool = &self.context.pool;

        writeln!(f, "TYPES")?;
        for (id, t) in pool.types_iter() {
            writeln!(f, "\t{}\t{}", id.0, encode_type(t))?;
        }
        writeln!(f)?;

        // Only layouts some interned type actually refers to are re-emitted
        let mut referenced: UnorderedSet<&str> = Default::default();
        for (_, t) in pool.types_iter() {
            match t {
                CType::Struct { key } | CType::Enum { key } => {
                    referenced.insert(key);
                }
                _ => {}
            }
        }

        writeln!(f, "SYMBOLS")?;
        for (name, info) in self.context.globals.vars_iter() {
            writeln!(f, "\tVAR\t{}\t{}", name, encode_varinfo(info))?;
        }
        for (key, layout) in self.context.globals.struct_layouts_iter() {
            if !referenced.contains(key.as_str()) {
                continue;
            }
            let fields = layout
                .fields
                .iter()
                .map(|(name, off, ty)| format!("{}:{}:{}", name, off, ty.0))
                .join(",");
            writeln!(f, "\tSTRUCT\t{}\t{}", key, or_dash(&fields))?;
        }
        for (key, def) in self.context.globals.enum_defs_iter() {
            if !referenced.contains(key.as_str()) {
                continue;
            }
            let members = def
                .members
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .join(",");
            writeln!(f, "\tENUM\t{}\t{}", key, or_dash(&members))?;
        }
        writeln!(f)?;

        writeln!(f, "FRAGMENTS")?;
        for (i, fragment) in self.fragments.iter().enumerate() {
            writeln!(f, "\t{}\t{}", i, escape(fragment))?;
        }
        writeln!(f)?;

        for func in &self.functions {
            encode_function(f, pool, func)?;
            writeln!(f)?;
        }

        Ok(())
    }

    /// Parse a document. Structural problems (unknown tag, missing field, dangling id) abort the
    /// decode with a descriptive error.
    pub fn decode(s: &str) -> Result<Document, String> {
        let mut lines = Lines::new(s);

        let header = lines.expect_line()?;
        let version = header
            .strip_prefix("PIR\t")
            .ok_or_else(|| lines.err("Expected PIR header"))?;
        let version: u32 = version
            .parse()
            .map_err(|_| lines.err("Malformed format version"))?;
        if version != FORMAT_VERSION {
            return Err(format!(
                "Unsupported format version {} (expected {})",
                version, FORMAT_VERSION
            ));
        }

        let mut doc = Document::default();

        lines.expect_header("TYPES")?;
        while let Some(line) = lines.take_indented(1) {
            let mut fields = Fields::new(line, lines.lineno());
            let wid: usize = fields.parse_next("type id")?;
            let t = decode_type(&mut fields)?;
            let id = doc.context.pool.intern_type(t);
            if id.0 != wid {
                return Err(fields.err("Type record out of order or duplicated"));
            }
        }

        lines.expect_header("SYMBOLS")?;
        while let Some(line) = lines.take_indented(1) {
            let mut fields = Fields::new(line, lines.lineno());
            match fields.next("symbol kind")? {
                "VAR" => {
                    let name = fields.next("variable name")?.to_owned();
                    let info = decode_varinfo(&mut fields, &doc.context.pool)?;
                    doc.context.globals.add_symbol(&name, info);
                }
                "STRUCT" => {
                    let key = fields.next("struct key")?.to_owned();
                    let body = fields.next("struct fields")?;
                    let mut layout = StructLayout { fields: Vec::new() };
                    for item in list_items(body) {
                        let mut parts = item.splitn(3, ':');
                        let name = parts
                            .next()
                            .ok_or_else(|| fields.err("Missing field name"))?;
                        let off: u64 = parts
                            .next()
                            .ok_or_else(|| fields.err("Missing field offset"))?
                            .parse()
                            .map_err(|_| fields.err("Malformed field offset"))?;
                        let ty = type_ref(
                            parts
                                .next()
                                .ok_or_else(|| fields.err("Missing field type"))?,
                            &doc.context.pool,
                            &fields,
                        )?;
                        layout.fields.push((name.to_owned(), off, ty));
                    }
                    doc.context.globals.add_struct_layout(&key, layout);
                }
                "ENUM" => {
                    let key = fields.next("enum key")?.to_owned();
                    let body = fields.next("enum members")?;
                    let mut def = EnumDef {
                        members: Vec::new(),
                    };
                    for item in list_items(body) {
                        let (name, value) = item
                            .split_once('=')
                            .ok_or_else(|| fields.err("Malformed enum member"))?;
                        let value: u64 = value
                            .parse()
                            .map_err(|_| fields.err("Malformed enum value"))?;
                        def.members.push((name.to_owned(), value));
                    }
                    doc.context.globals.add_enum_def(&key, def);
                }
                other => return Err(fields.err(&format!("Unknown symbol kind {:?}", other))),
            }
        }

        lines.expect_header("FRAGMENTS")?;
        while let Some(line) = lines.take_indented(1) {
            let mut fields = Fields::new(line, lines.lineno());
            let idx: usize = fields.parse_next("fragment index")?;
            if idx != doc.fragments.len() {
                return Err(fields.err("Fragment record out of order"));
            }
            doc.fragments.push(unescape(fields.rest(), &fields)?);
        }

        while let Some(line) = lines.next_nonblank() {
            let lineno = lines.lineno();
            let mut fields = Fields::new(line, lineno);
            let kw = fields.next("section")?;
            if kw != "FUNCTION" {
                return Err(fields.err(&format!("Unknown section {:?}", kw)));
            }
            let name = fields.next("function name")?.to_owned();
            let address = parse_hex(fields.next("function address")?, &fields)?;
            let func = decode_function(&mut lines, &mut doc.context, &name, address)?;
            doc.functions.push(func);
        }

        Ok(doc)
    }
}

// --- encoding ---

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
}

fn unescape(s: &str, fields: &Fields) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            _ => return Err(fields.err("Malformed escape sequence")),
        }
    }
    Ok(out)
}

/// Names travel on the wire unescaped, so they must not collide with the framing.
fn check_name(name: &str) -> &str {
    assert!(
        !name.contains(['\t', '\n', ',']),
        "Name {:?} cannot be serialized",
        name
    );
    name
}

fn encode_type(t: &CType) -> String {
    match t {
        CType::Void => "VOID".into(),
        CType::Int { size, signed } => {
            format!("INT\t{}\t{}", size, if *signed { "s" } else { "u" })
        }
        CType::Float { size } => format!("FLOAT\t{}", size),
        CType::Pointer { pointee } => format!("PTR\t{}", pointee.0),
        CType::Array { element, count } => format!("ARRAY\t{}\t{}", element.0, count),
        CType::Function { ret, params } => format!(
            "FN\t{}\t{}",
            ret.0,
            or_dash(&params.iter().map(|p| p.0.to_string()).join(","))
        ),
        CType::Struct { key } => format!("STRUCT\t{}", check_name(key)),
        CType::Enum { key } => format!("ENUM\t{}", check_name(key)),
        CType::Typedef { name, aliased } => format!("TYPEDEF\t{}\t{}", check_name(name), aliased.0),
    }
}

fn encode_varinfo(info: &VarInfo) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        info.ty.map(|t| t.0.to_string()).unwrap_or_else(|| "-".into()),
        info.global_address
            .map(|a| format!("{:#x}", a))
            .unwrap_or_else(|| "-".into()),
        info.param_index
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into()),
        info.description
            .as_deref()
            .map(escape)
            .unwrap_or_else(|| "-".into()),
    )
}

/// Per-function encoder: wire ids, memoization, and the value-node dedup table.
struct Encoder<'p> {
    pool: &'p NodePool,
    next: u64,
    stmt_wire: UnorderedMap<StmtId, u64>,
    lval_wire: UnorderedMap<LValId, u64>,
    expr_wire: UnorderedMap<ExprId, u64>,
    /// Record body to wire id, for the side-effect-free kinds only
    dedup: UnorderedMap<String, u64>,
    records: Vec<(u64, String)>,
}

impl<'p> Encoder<'p> {
    fn new(pool: &'p NodePool) -> Self {
        Encoder {
            pool,
            next: 0,
            stmt_wire: Default::default(),
            lval_wire: Default::default(),
            expr_wire: Default::default(),
            dedup: Default::default(),
            records: Vec::new(),
        }
    }

    fn fresh(&mut self, body: String) -> u64 {
        let wid = self.next;
        self.next += 1;
        self.records.push((wid, body));
        wid
    }

    fn stmt(&mut self, id: StmtId) -> u64 {
        if let Some(&wid) = self.stmt_wire.get(&id) {
            return wid;
        }
        let body = match self.pool.stmt(id).clone() {
            Stmt::Block { stmts } => {
                let children = stmts.iter().map(|&s| self.stmt(s).to_string()).join(",");
                format!("BLOCK\t{}", or_dash(&children))
            }
            Stmt::Seq { insts } => {
                let children = insts.iter().map(|&s| self.stmt(s).to_string()).join(",");
                format!("SEQ\t{}", or_dash(&children))
            }
            Stmt::Branch {
                cond,
                then_stmt,
                else_stmt,
            } => {
                let cond = self.expr(cond);
                let then_stmt = self.stmt(then_stmt);
                let else_stmt = else_stmt
                    .map(|e| self.stmt(e).to_string())
                    .unwrap_or_else(|| "-".into());
                format!("BRANCH\t{}\t{}\t{}", cond, then_stmt, else_stmt)
            }
            Stmt::Loop { cond, body } => {
                let cond = cond
                    .map(|c| self.expr(c).to_string())
                    .unwrap_or_else(|| "-".into());
                let body = self.stmt(body);
                format!("LOOP\t{}\t{}", cond, body)
            }
            Stmt::Return { value } => {
                let value = value
                    .map(|e| self.expr(e).to_string())
                    .unwrap_or_else(|| "-".into());
                format!("RETURN\t{}", value)
            }
            Stmt::Goto { label } => format!("GOTO\t{}", check_name(&label)),
            Stmt::Switch {
                scrutinee,
                cases,
                default,
            } => {
                let scrutinee = self.expr(scrutinee);
                let cases = cases
                    .iter()
                    .map(|&(value, arm)| format!("{}:{}", value, self.stmt(arm)))
                    .join(",");
                let default = default
                    .map(|d| self.stmt(d).to_string())
                    .unwrap_or_else(|| "-".into());
                format!("SWITCH\t{}\t{}\t{}", scrutinee, or_dash(&cases), default)
            }
            Stmt::Assign { lhs, rhs, flags } => {
                let lhs = self.lval(lhs);
                let rhs = self.expr(rhs);
                let mut fl = String::new();
                if flags.expose {
                    fl.push('E');
                }
                if flags.must_materialize {
                    fl.push('M');
                }
                format!("ASSIGN\t{}\t{}\t{}", lhs, rhs, or_dash(&fl))
            }
            Stmt::Call {
                result,
                target,
                args,
                kills,
            } => {
                let result = result
                    .map(|r| self.lval(r).to_string())
                    .unwrap_or_else(|| "-".into());
                let target = match target {
                    CallTarget::Direct { name } => format!("D\t{}", check_name(&name)),
                    CallTarget::Indirect { callee } => format!("I\t{}", self.expr(callee)),
                };
                let args = args.iter().map(|&a| self.expr(a).to_string()).join(",");
                let kills = kills.iter().map(|k| check_name(k)).join(",");
                format!(
                    "CALL\t{}\t{}\t{}\t{}",
                    result,
                    target,
                    or_dash(&args),
                    or_dash(&kills)
                )
            }
        };
        let wid = self.fresh(body);
        self.stmt_wire.insert(id, wid);
        wid
    }

    fn lval(&mut self, id: LValId) -> u64 {
        if let Some(&wid) = self.lval_wire.get(&id) {
            return wid;
        }
        let body = match self.pool.lval(id).clone() {
            LVal::Var { name, offset } => {
                format!("VAR\t{}\t{}", check_name(&name), self.offset(&offset))
            }
            LVal::Deref { addr, offset } => {
                let addr = self.expr(addr);
                format!("DEREF\t{}\t{}", addr, self.offset(&offset))
            }
        };
        let wid = self.fresh(body);
        self.lval_wire.insert(id, wid);
        wid
    }

    fn offset(&mut self, offset: &Offset) -> String {
        match offset {
            Offset::None => "N".into(),
            Offset::Field { name, byte_offset } => {
                format!("F\t{}\t{}", check_name(name), byte_offset)
            }
            Offset::Index { index, scale } => format!("X\t{}\t{}", self.expr(*index), scale),
        }
    }

    fn expr(&mut self, id: ExprId) -> u64 {
        if let Some(&wid) = self.expr_wire.get(&id) {
            return wid;
        }
        // Constants and sizeofs are pure values: identical records collapse to one wire id.
        // Everything else keeps per-node identity because provenance facts key on it.
        let (body, pure) = match self.pool.expr(id).clone() {
            Expr::Const { value, size } => (format!("CONST\t{:#x}\t{}", value, size), true),
            Expr::SizeOf { ty } => (format!("SIZEOF\t{}", ty.0), true),
            Expr::Read { lval } => (format!("READ\t{}", self.lval(lval)), false),
            Expr::Cast { ty, arg } => (format!("CAST\t{}\t{}", ty.0, self.expr(arg)), false),
            Expr::Unary { op, arg } => {
                (format!("UNARY\t{:?}\t{}", op, self.expr(arg)), false)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.expr(lhs);
                let rhs = self.expr(rhs);
                (format!("BINARY\t{:?}\t{}\t{}", op, lhs, rhs), false)
            }
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond = self.expr(cond);
                let then_expr = self.expr(then_expr);
                let else_expr = self.expr(else_expr);
                (format!("TERNARY\t{}\t{}\t{}", cond, then_expr, else_expr), false)
            }
            Expr::AddressOf { lval } => (format!("ADDROF\t{}", self.lval(lval)), false),
            Expr::Substituted {
                original,
                substitute,
            } => {
                let original = self.lval(original);
                let substitute = self.expr(substitute);
                (format!("SUBST\t{}\t{}", original, substitute), false)
            }
        };
        if pure {
            if let Some(&wid) = self.dedup.get(&body) {
                self.expr_wire.insert(id, wid);
                return wid;
            }
        }
        let wid = self.fresh(body.clone());
        if pure {
            self.dedup.insert(body, wid);
        }
        self.expr_wire.insert(id, wid);
        wid
    }
}

fn encode_function(f: &mut String, pool: &NodePool, func: &FunctionTree) -> std::fmt::Result {
    use std::fmt::Write;

    let mut enc = Encoder::new(pool);
    let roots: Vec<u64> = func.roots.iter().map(|&r| enc.stmt(r)).collect();

    writeln!(f, "FUNCTION\t{}\t{:#x}", check_name(&func.name), func.address)?;
    writeln!(f, "\tROOTS\t{}", roots.iter().map(|r| r.to_string()).join(","))?;

    writeln!(f, "\tNODES")?;
    for (wid, body) in &enc.records {
        writeln!(f, "\t\t{}\t{}", wid, body)?;
    }

    // Tables are written in wire-id order, not pool-id order: wire ids are assigned by the
    // traversal, so a decode and re-encode reproduces them while pool ids may differ
    writeln!(f, "\tSPANS")?;
    let mut spans: Vec<(u64, &AddrSpan)> = func
        .spans
        .iter()
        .filter_map(|(id, span)| enc.stmt_wire.get(id).map(|&wid| (wid, span)))
        .collect();
    spans.sort_by_key(|&(wid, _)| wid);
    for (wid, span) in spans {
        writeln!(f, "\t\t{}\t{:#x}\t{:#x}", wid, span.lo, span.hi)?;
    }

    writeln!(f, "\tSTORAGE")?;
    for (name, slot) in func.storage.iter() {
        let slot = match slot {
            StorageSlot::Register { name } => format!("REG\t{}", check_name(name)),
            StorageSlot::StackOffset { offset } => format!("STACK\t{}", offset),
            StorageSlot::Memory { address } => format!("MEM\t{:#x}", address),
        };
        writeln!(f, "\t\t{}\t{}", check_name(name), slot)?;
    }

    writeln!(f, "\tLOCALS")?;
    for (name, info) in func.locals.vars_iter() {
        writeln!(f, "\t\t{}\t{}", check_name(name), encode_varinfo(info))?;
    }

    let prov = &func.provenance;
    writeln!(f, "\tPROVENANCE")?;
    let mut inst_lines: Vec<(u64, String)> = Vec::new();
    for (&hi, los) in prov.inst_map_iter() {
        match (
            enc.stmt_wire.get(&hi),
            los.iter()
                .map(|lo| enc.stmt_wire.get(lo).map(|w| w.to_string()))
                .collect::<Option<Vec<_>>>(),
        ) {
            (Some(&hi), Some(los)) => inst_lines.push((hi, format!("{}\t{}", hi, los.join(",")))),
            _ => debug!("Skipping instruction mapping with unencoded node"),
        }
    }
    write_sorted(f, "INST", inst_lines)?;
    let mut expr_lines: Vec<(u64, String)> = Vec::new();
    for (&hi, &lo) in prov.expr_map_iter() {
        match (enc.expr_wire.get(&hi), enc.expr_wire.get(&lo)) {
            (Some(&hi), Some(&lo)) => expr_lines.push((hi, format!("{}\t{}", hi, lo))),
            _ => debug!("Skipping expression mapping with unencoded node"),
        }
    }
    write_sorted(f, "EXPR", expr_lines)?;
    let mut lval_lines: Vec<(u64, String)> = Vec::new();
    for (&hi, &lo) in prov.lval_map_iter() {
        match (enc.lval_wire.get(&hi), enc.lval_wire.get(&lo)) {
            (Some(&hi), Some(&lo)) => lval_lines.push((hi, format!("{}\t{}", hi, lo))),
            _ => debug!("Skipping lvalue mapping with unencoded node"),
        }
    }
    write_sorted(f, "LVAL", lval_lines)?;
    for (kw, entries) in [
        ("DEFUSE", prov.defuses_iter().collect::<Vec<_>>()),
        ("DEFUSE_HIGH", prov.defuses_high_iter().collect::<Vec<_>>()),
    ] {
        let mut du_lines: Vec<(u64, String)> = Vec::new();
        for (lval, du) in entries {
            let wid = match enc.lval_wire.get(lval) {
                Some(&wid) => wid,
                None => {
                    debug!("Skipping def-use record with unencoded lvalue");
                    continue;
                }
            };
            let recorded = du.recorded().map(|u| format!("{:?}", u)).join(",");
            let inactive = du.inactive().map(|u| format!("{:?}", u)).join(",");
            du_lines.push((
                wid,
                format!("{}\t{}\t{}", wid, or_dash(&recorded), or_dash(&inactive)),
            ));
        }
        write_sorted(f, kw, du_lines)?;
    }

    writeln!(f, "\tREACHING")?;
    for (kw, entries) in [
        ("EXPR", prov.raw_expr_defs_iter().collect::<Vec<_>>()),
        ("FLAG", prov.raw_flag_defs_iter().collect::<Vec<_>>()),
    ] {
        let mut fact_lines: Vec<(u64, String)> = Vec::new();
        for (expr, facts) in entries {
            let wid = match enc.expr_wire.get(expr) {
                Some(&wid) => wid,
                None => {
                    debug!("Skipping reaching-definition record with unencoded expression");
                    continue;
                }
            };
            for fact in facts {
                let addresses = fact
                    .def_addresses
                    .iter()
                    .map(|a| format!("{:#x}", a))
                    .join(",");
                fact_lines.push((
                    wid,
                    format!("{}\t{}\t{}", wid, check_name(&fact.var), or_dash(&addresses)),
                ));
            }
        }
        write_sorted(f, kw, fact_lines)?;
    }

    Ok(())
}

fn write_sorted(f: &mut String, kw: &str, mut lines: Vec<(u64, String)>) -> std::fmt::Result {
    use std::fmt::Write;
    lines.sort_by_key(|&(wid, _)| wid);
    for (_, line) in lines {
        writeln!(f, "\t\t{}\t{}", kw, line)?;
    }
    Ok(())
}

// --- decoding ---

/// Line cursor with one-deep lookahead and line numbers for diagnostics.
struct Lines<'a> {
    iter: Peekable<std::str::Lines<'a>>,
    lineno: usize,
}

impl<'a> Lines<'a> {
    fn new(s: &'a str) -> Self {
        Lines {
            iter: s.lines().peekable(),
            lineno: 0,
        }
    }

    fn lineno(&self) -> usize {
        self.lineno
    }

    fn err(&self, msg: &str) -> String {
        format!("{} at line {}", msg, self.lineno)
    }

    fn next_nonblank(&mut self) -> Option<&'a str> {
        loop {
            let line = self.iter.next()?;
            self.lineno += 1;
            if !line.trim().is_empty() {
                return Some(line);
            }
        }
    }

    fn expect_line(&mut self) -> Result<&'a str, String> {
        self.next_nonblank()
            .ok_or_else(|| self.err("Unexpected end of document"))
    }

    fn expect_header(&mut self, name: &str) -> Result<(), String> {
        let line = self.expect_line()?;
        if line == name {
            Ok(())
        } else {
            Err(self.err(&format!("Expected {} section, found {:?}", name, line)))
        }
    }

    /// Take the next line if it is indented by exactly `depth` tabs (and no more), skipping
    /// blank lines. Returns the de-indented remainder.
    fn take_indented(&mut self, depth: usize) -> Option<&'a str> {
        loop {
            let line = *self.iter.peek()?;
            if line.trim().is_empty() {
                self.iter.next();
                self.lineno += 1;
                continue;
            }
            let tabs = line.len() - line.trim_start_matches('\t').len();
            if tabs != depth {
                return None;
            }
            self.iter.next();
            self.lineno += 1;
            return Some(&line[depth..]);
        }
    }
}

/// Tab-separated field cursor over one line.
struct Fields<'a> {
    iter: std::str::Split<'a, char>,
    lineno: usize,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str, lineno: usize) -> Self {
        Fields {
            iter: line.split('\t'),
            lineno,
        }
    }

    fn err(&self, msg: &str) -> String {
        format!("{} at line {}", msg, self.lineno)
    }

    fn next(&mut self, what: &str) -> Result<&'a str, String> {
        self.iter
            .next()
            .ok_or_else(|| self.err(&format!("Missing field: {}", what)))
    }

    fn parse_next<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, String> {
        self.next(what)?
            .parse()
            .map_err(|_| self.err(&format!("Malformed field: {}", what)))
    }

    /// An optional field: `-` decodes as `None`.
    fn opt_next(&mut self, what: &str) -> Result<Option<&'a str>, String> {
        let s = self.next(what)?;
        Ok(if s == "-" { None } else { Some(s) })
    }

    fn rest(&mut self) -> &'a str {
        self.iter.next().unwrap_or("")
    }
}

fn parse_hex(s: &str, fields: &Fields) -> Result<u64, String> {
    s.strip_prefix("0x")
        .and_then(|h| u64::from_str_radix(h, 16).ok())
        .ok_or_else(|| fields.err(&format!("Malformed hex value {:?}", s)))
}

fn list_items(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').filter(|i| !i.is_empty() && *i != "-")
}

fn type_ref(s: &str, pool: &NodePool, fields: &Fields) -> Result<TypeId, String> {
    let idx: usize = s
        .parse()
        .map_err(|_| fields.err(&format!("Malformed type reference {:?}", s)))?;
    // Every type the document uses was declared in its TYPES section
    let id = TypeId(idx);
    if idx < pool.types_iter().count() {
        Ok(id)
    } else {
        Err(fields.err(&format!("Dangling type reference t{}", idx)))
    }
}

fn decode_type(fields: &mut Fields) -> Result<CType, String> {
    Ok(match fields.next("type tag")? {
        "VOID" => CType::Void,
        "INT" => {
            let size: u8 = fields.parse_next("int size")?;
            let signed = match fields.next("int signedness")? {
                "s" => true,
                "u" => false,
                other => return Err(fields.err(&format!("Malformed signedness {:?}", other))),
            };
            CType::Int { size, signed }
        }
        "FLOAT" => CType::Float {
            size: fields.parse_next("float size")?,
        },
        "PTR" => CType::Pointer {
            pointee: TypeId(fields.parse_next("pointee")?),
        },
        "ARRAY" => CType::Array {
            element: TypeId(fields.parse_next("element type")?),
            count: fields.parse_next("element count")?,
        },
        "FN" => {
            let ret = TypeId(fields.parse_next("return type")?);
            let params = list_items(fields.next("parameter types")?)
                .map(|p| p.parse().map(TypeId))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| fields.err("Malformed parameter type"))?;
            CType::Function { ret, params }
        }
        "STRUCT" => CType::Struct {
            key: fields.next("struct key")?.to_owned(),
        },
        "ENUM" => CType::Enum {
            key: fields.next("enum key")?.to_owned(),
        },
        "TYPEDEF" => CType::Typedef {
            name: fields.next("typedef name")?.to_owned(),
            aliased: TypeId(fields.parse_next("aliased type")?),
        },
        other => return Err(fields.err(&format!("Unknown type tag {:?}", other))),
    })
}

fn decode_varinfo(fields: &mut Fields, pool: &NodePool) -> Result<VarInfo, String> {
    let ty = match fields.opt_next("type")? {
        Some(t) => Some(type_ref(t, pool, fields)?),
        None => None,
    };
    let global_address = match fields.opt_next("address")? {
        Some(a) => Some(parse_hex(a, fields)?),
        None => None,
    };
    let param_index = match fields.opt_next("parameter index")? {
        Some(p) => Some(
            p.parse()
                .map_err(|_| fields.err("Malformed parameter index"))?,
        ),
        None => None,
    };
    let description = match fields.opt_next("description")? {
        Some(d) => Some(unescape(d, fields)?),
        None => None,
    };
    Ok(VarInfo {
        ty,
        global_address,
        param_index,
        description,
    })
}

/// Wire-id to pool-id maps for one function's records.
#[derive(Default)]
struct WireIds {
    stmts: UnorderedMap<u64, StmtId>,
    lvals: UnorderedMap<u64, LValId>,
    exprs: UnorderedMap<u64, ExprId>,
}

impl WireIds {
    fn stmt(&self, wid: u64, fields: &Fields) -> Result<StmtId, String> {
        self.stmts
            .get(&wid)
            .copied()
            .ok_or_else(|| fields.err(&format!("Dangling statement reference {}", wid)))
    }

    fn lval(&self, wid: u64, fields: &Fields) -> Result<LValId, String> {
        self.lvals
            .get(&wid)
            .copied()
            .ok_or_else(|| fields.err(&format!("Dangling lvalue reference {}", wid)))
    }

    fn expr(&self, wid: u64, fields: &Fields) -> Result<ExprId, String> {
        self.exprs
            .get(&wid)
            .copied()
            .ok_or_else(|| fields.err(&format!("Dangling expression reference {}", wid)))
    }

    fn stmt_field(&self, fields: &mut Fields, what: &str) -> Result<StmtId, String> {
        let wid = fields.parse_next(what)?;
        self.stmt(wid, fields)
    }

    fn lval_field(&self, fields: &mut Fields, what: &str) -> Result<LValId, String> {
        let wid = fields.parse_next(what)?;
        self.lval(wid, fields)
    }

    fn expr_field(&self, fields: &mut Fields, what: &str) -> Result<ExprId, String> {
        let wid = fields.parse_next(what)?;
        self.expr(wid, fields)
    }
}

fn parse_use_loc(s: &str, fields: &Fields) -> Result<UseLoc, String> {
    let (addr, op) = s
        .split_once(':')
        .ok_or_else(|| fields.err(&format!("Malformed use location {:?}", s)))?;
    Ok(UseLoc {
        address: parse_hex(addr, fields)?,
        operand: op
            .parse()
            .map_err(|_| fields.err("Malformed operand index"))?,
    })
}

fn decode_function(
    lines: &mut Lines,
    ctx: &mut ModuleContext,
    name: &str,
    address: u64,
) -> Result<FunctionTree, String> {
    let mut b = TreeBuilder::new(ctx, name, address);
    let mut ids = WireIds::default();

    let roots_line = lines
        .take_indented(1)
        .ok_or_else(|| lines.err("Missing ROOTS"))?;
    let mut fields = Fields::new(roots_line, lines.lineno());
    if fields.next("ROOTS")? != "ROOTS" {
        return Err(fields.err("Expected ROOTS"));
    }
    let root_wids: Vec<u64> = list_items(fields.next("root ids")?)
        .map(|r| r.parse())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| fields.err("Malformed root id"))?;
    if root_wids.len() < 2 {
        return Err(fields.err("A function carries at least two trees"));
    }

    expect_subheader(lines, "NODES")?;
    while let Some(line) = lines.take_indented(2) {
        let mut fields = Fields::new(line, lines.lineno());
        let wid: u64 = fields.parse_next("node id")?;
        decode_node(&mut b, &mut ids, wid, &mut fields)?;
    }

    for wid in root_wids {
        let fields = Fields::new("", lines.lineno());
        let root = ids.stmt(wid, &fields)?;
        b.add_tree_root(root);
    }

    expect_subheader(lines, "SPANS")?;
    while let Some(line) = lines.take_indented(2) {
        let mut fields = Fields::new(line, lines.lineno());
        let stmt = ids.stmt_field(&mut fields, "instruction id")?;
        let lo = parse_hex(fields.next("span start")?, &fields)?;
        let hi = parse_hex(fields.next("span end")?, &fields)?;
        b.record_span(stmt, AddrSpan { lo, hi });
    }

    expect_subheader(lines, "STORAGE")?;
    while let Some(line) = lines.take_indented(2) {
        let mut fields = Fields::new(line, lines.lineno());
        let name = fields.next("variable name")?.to_owned();
        let slot = match fields.next("storage kind")? {
            "REG" => StorageSlot::Register {
                name: fields.next("register name")?.to_owned(),
            },
            "STACK" => StorageSlot::StackOffset {
                offset: fields.parse_next("stack offset")?,
            },
            "MEM" => StorageSlot::Memory {
                address: parse_hex(fields.next("memory address")?, &fields)?,
            },
            other => return Err(fields.err(&format!("Unknown storage kind {:?}", other))),
        };
        b.set_storage(&name, slot);
    }

    expect_subheader(lines, "LOCALS")?;
    while let Some(line) = lines.take_indented(2) {
        let mut fields = Fields::new(line, lines.lineno());
        let name = fields.next("variable name")?.to_owned();
        let info = decode_varinfo(&mut fields, b.pool())?;
        b.add_local_symbol(&name, info);
    }

    // Mappings and def-use facts can be recorded in any order relative to resolution, but the
    // address-based reaching-definition records must be in before the resolve step below
    let mut mappings: Vec<String> = Vec::new();
    let mut mapping_linenos: Vec<usize> = Vec::new();
    expect_subheader(lines, "PROVENANCE")?;
    while let Some(line) = lines.take_indented(2) {
        mappings.push(line.to_owned());
        mapping_linenos.push(lines.lineno());
    }

    expect_subheader(lines, "REACHING")?;
    while let Some(line) = lines.take_indented(2) {
        let mut fields = Fields::new(line, lines.lineno());
        let kind = fields.next("reaching kind")?;
        let expr = ids.expr_field(&mut fields, "expression id")?;
        let var = fields.next("variable name")?.to_owned();
        let def_addresses = list_items(fields.next("definition addresses")?)
            .map(|a| parse_hex(a, &fields))
            .collect::<Result<Vec<_>, _>>()?;
        let fact = vec![RawReachingDefs { var, def_addresses }];
        match kind {
            "EXPR" => b.provenance_mut().add_expr_reaching_defs(expr, fact),
            "FLAG" => b.provenance_mut().add_flag_reaching_defs(expr, fact),
            other => return Err(fields.err(&format!("Unknown reaching kind {:?}", other))),
        }
    }

    for (line, lineno) in mappings.iter().zip(mapping_linenos) {
        let mut fields = Fields::new(line, lineno);
        match fields.next("provenance kind")? {
            "INST" => {
                let hi = ids.stmt_field(&mut fields, "high-level id")?;
                for lo in list_items(fields.next("low-level ids")?) {
                    let lo: u64 = lo
                        .parse()
                        .map_err(|_| fields.err("Malformed low-level id"))?;
                    let lo = ids.stmt(lo, &fields)?;
                    b.provenance_mut().add_instruction_mapping(hi, lo);
                }
            }
            "EXPR" => {
                let hi = ids.expr_field(&mut fields, "high-level id")?;
                let lo = ids.expr_field(&mut fields, "low-level id")?;
                b.provenance_mut().add_expression_mapping(hi, lo);
            }
            "LVAL" => {
                let hi = ids.lval_field(&mut fields, "high-level id")?;
                let lo = ids.lval_field(&mut fields, "low-level id")?;
                b.provenance_mut().add_lval_mapping(hi, lo);
            }
            kw @ ("DEFUSE" | "DEFUSE_HIGH") => {
                let lval = ids.lval_field(&mut fields, "lvalue id")?;
                let recorded = list_items(fields.next("use locations")?)
                    .map(|u| parse_use_loc(u, &fields))
                    .collect::<Result<Vec<_>, _>>()?;
                let inactive = list_items(fields.next("inactive locations")?)
                    .map(|u| parse_use_loc(u, &fields))
                    .collect::<Result<Vec<_>, _>>()?;
                if kw == "DEFUSE" {
                    b.provenance_mut().add_lval_defuses(lval, recorded);
                } else {
                    b.provenance_mut().add_lval_defuses_high(lval, recorded);
                }
                for loc in inactive {
                    b.provenance_mut().inactivate(lval, loc);
                }
            }
            other => return Err(fields.err(&format!("Unknown provenance kind {:?}", other))),
        }
    }

    b.resolve_provenance();
    Ok(b.finish())
}

fn expect_subheader(lines: &mut Lines, name: &str) -> Result<(), String> {
    match lines.take_indented(1) {
        Some(line) if line == name => Ok(()),
        Some(line) => Err(lines.err(&format!("Expected {} subsection, found {:?}", name, line))),
        None => Err(lines.err(&format!("Missing {} subsection", name))),
    }
}

fn decode_offset(
    ids: &WireIds,
    fields: &mut Fields,
) -> Result<Offset, String> {
    Ok(match fields.next("offset kind")? {
        "N" => Offset::None,
        "F" => Offset::Field {
            name: fields.next("field name")?.to_owned(),
            byte_offset: fields.parse_next("field offset")?,
        },
        "X" => Offset::Index {
            index: ids.expr_field(fields, "index expression")?,
            scale: fields.parse_next("index scale")?,
        },
        other => return Err(fields.err(&format!("Unknown offset kind {:?}", other))),
    })
}

fn decode_node(
    b: &mut TreeBuilder,
    ids: &mut WireIds,
    wid: u64,
    fields: &mut Fields,
) -> Result<(), String> {
    let tag = fields.next("node tag")?;
    match tag {
        "BLOCK" | "SEQ" => {
            let children = list_items(fields.next("children")?)
                .map(|c| {
                    let c: u64 = c.parse().map_err(|_| fields.err("Malformed child id"))?;
                    ids.stmt(c, fields)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let id = if tag == "BLOCK" {
                b.make_block(children)
            } else {
                b.make_instruction_sequence(children)
            };
            ids.stmts.insert(wid, id);
        }
        "BRANCH" => {
            let cond = ids.expr_field(fields, "condition")?;
            let then_stmt = ids.stmt_field(fields, "then arm")?;
            let else_stmt = match fields.opt_next("else arm")? {
                Some(e) => {
                    let e: u64 = e.parse().map_err(|_| fields.err("Malformed else id"))?;
                    Some(ids.stmt(e, fields)?)
                }
                None => None,
            };
            let id = b.make_branch(cond, then_stmt, else_stmt);
            ids.stmts.insert(wid, id);
        }
        "LOOP" => {
            let cond = match fields.opt_next("condition")? {
                Some(c) => {
                    let c: u64 = c.parse().map_err(|_| fields.err("Malformed condition id"))?;
                    Some(ids.expr(c, fields)?)
                }
                None => None,
            };
            let body = ids.stmt_field(fields, "body")?;
            let id = b.make_loop(cond, body);
            ids.stmts.insert(wid, id);
        }
        "RETURN" => {
            let value = match fields.opt_next("value")? {
                Some(v) => {
                    let v: u64 = v.parse().map_err(|_| fields.err("Malformed value id"))?;
                    Some(ids.expr(v, fields)?)
                }
                None => None,
            };
            let id = b.make_return(value);
            ids.stmts.insert(wid, id);
        }
        "GOTO" => {
            let id = b.make_goto(fields.next("label")?);
            ids.stmts.insert(wid, id);
        }
        "SWITCH" => {
            let scrutinee = ids.expr_field(fields, "scrutinee")?;
            let cases = list_items(fields.next("cases")?)
                .map(|c| {
                    let (value, arm) = c
                        .split_once(':')
                        .ok_or_else(|| fields.err("Malformed case"))?;
                    let value: u64 = value
                        .parse()
                        .map_err(|_| fields.err("Malformed case value"))?;
                    let arm: u64 = arm.parse().map_err(|_| fields.err("Malformed case arm"))?;
                    Ok((value, ids.stmt(arm, fields)?))
                })
                .collect::<Result<Vec<_>, String>>()?;
            let default = match fields.opt_next("default arm")? {
                Some(d) => {
                    let d: u64 = d.parse().map_err(|_| fields.err("Malformed default id"))?;
                    Some(ids.stmt(d, fields)?)
                }
                None => None,
            };
            let id = b.make_switch(scrutinee, cases, default);
            ids.stmts.insert(wid, id);
        }
        "ASSIGN" => {
            let lhs = ids.lval_field(fields, "left-hand side")?;
            let rhs = ids.expr_field(fields, "right-hand side")?;
            let mut flags = AssignFlags::default();
            if let Some(fl) = fields.opt_next("flags")? {
                for c in fl.chars() {
                    match c {
                        'E' => flags.expose = true,
                        'M' => flags.must_materialize = true,
                        other => {
                            return Err(fields.err(&format!("Unknown flag {:?}", other)))
                        }
                    }
                }
            }
            let id = b.make_assignment(lhs, rhs, flags, None);
            ids.stmts.insert(wid, id);
        }
        "CALL" => {
            let result = match fields.opt_next("result")? {
                Some(r) => {
                    let r: u64 = r.parse().map_err(|_| fields.err("Malformed result id"))?;
                    Some(ids.lval(r, fields)?)
                }
                None => None,
            };
            let target = match fields.next("target kind")? {
                "D" => CallTarget::Direct {
                    name: fields.next("callee name")?.to_owned(),
                },
                "I" => CallTarget::Indirect {
                    callee: ids.expr_field(fields, "callee expression")?,
                },
                other => return Err(fields.err(&format!("Unknown target kind {:?}", other))),
            };
            let args = list_items(fields.next("arguments")?)
                .map(|a| {
                    let a: u64 = a.parse().map_err(|_| fields.err("Malformed argument id"))?;
                    ids.expr(a, fields)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let kills = list_items(fields.next("kill set")?)
                .map(|k| k.to_owned())
                .collect();
            let id = b.make_call(result, target, args, kills, None);
            ids.stmts.insert(wid, id);
        }
        "VAR" => {
            let name = fields.next("variable name")?.to_owned();
            let offset = decode_offset(ids, fields)?;
            let id = b.make_variable_lval(&name, offset);
            ids.lvals.insert(wid, id);
        }
        "DEREF" => {
            let addr = ids.expr_field(fields, "address")?;
            let offset = decode_offset(ids, fields)?;
            let id = b.make_deref_lval(addr, offset);
            ids.lvals.insert(wid, id);
        }
        "CONST" => {
            let value = parse_hex(fields.next("value")?, fields)?;
            let size: u8 = fields.parse_next("size")?;
            let id = b.make_constant(value, size);
            ids.exprs.insert(wid, id);
        }
        "READ" => {
            let lval = ids.lval_field(fields, "lvalue")?;
            let id = b.make_lval_read(lval);
            ids.exprs.insert(wid, id);
        }
        "CAST" => {
            let ty = type_ref(fields.next("type")?, b.pool(), fields)?;
            let arg = ids.expr_field(fields, "argument")?;
            let id = b.make_cast(ty, arg);
            ids.exprs.insert(wid, id);
        }
        "UNARY" => {
            let op_name = fields.next("operator")?;
            let op = UnaryOp::all_ops()
                .into_iter()
                .find(|op| format!("{:?}", op) == op_name)
                .ok_or_else(|| fields.err(&format!("Unknown unary operator {:?}", op_name)))?;
            let arg = ids.expr_field(fields, "argument")?;
            let id = b.make_unary(op, arg);
            ids.exprs.insert(wid, id);
        }
        "BINARY" => {
            let op_name = fields.next("operator")?;
            let op = BinaryOp::all_ops()
                .into_iter()
                .find(|op| format!("{:?}", op) == op_name)
                .ok_or_else(|| fields.err(&format!("Unknown binary operator {:?}", op_name)))?;
            let lhs = ids.expr_field(fields, "left operand")?;
            let rhs = ids.expr_field(fields, "right operand")?;
            let id = b.make_binary(op, lhs, rhs);
            ids.exprs.insert(wid, id);
        }
        "TERNARY" => {
            let cond = ids.expr_field(fields, "condition")?;
            let then_expr = ids.expr_field(fields, "then value")?;
            let else_expr = ids.expr_field(fields, "else value")?;
            let id = b.make_ternary(cond, then_expr, else_expr);
            ids.exprs.insert(wid, id);
        }
        "ADDROF" => {
            let lval = ids.lval_field(fields, "lvalue")?;
            let id = b.make_address_of(lval);
            ids.exprs.insert(wid, id);
        }
        "SIZEOF" => {
            let ty = type_ref(fields.next("type")?, b.pool(), fields)?;
            let id = b.make_sizeof(ty);
            ids.exprs.insert(wid, id);
        }
        "SUBST" => {
            let original = ids.lval_field(fields, "original lvalue")?;
            let substitute = ids.expr_field(fields, "substitute")?;
            let id = b.make_substituted(original, substitute);
            ids.exprs.insert(wid, id);
        }
        other => return Err(fields.err(&format!("Unknown node tag {:?}", other))),
    }
    Ok(())
}
