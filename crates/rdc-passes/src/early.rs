//! Early passes: statement initialisation, global-constant
//! replacement, per-block simplification, and expression propagation.

use std::rc::Rc;

use rdc_ir::{
    Exp, ExpExt, ExpRole, Operator, Procedure, ProgramImage, SharedExp, SsaDef, StmtKind,
};
use rdc_util::{Address, FxHashMap};

use crate::manager::{Pass, PassId};
use crate::PassError;

/// Width of a machine word on the source machines we lift from.
pub(crate) const WORD_BITS: u16 = 32;

/// Memory-dereference depth cap for propagated expressions.
const MAX_PROP_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// StatementInit
// ---------------------------------------------------------------------------

/// Turn the front end's lifted blocks into a numbered CFG: place every
/// statement, set owner ids, and wire edges from the terminators.
pub struct StatementInitPass;

impl Pass for StatementInitPass {
    fn id(&self) -> PassId {
        PassId::StatementInit
    }

    fn name(&self) -> &'static str {
        "StatementInit"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        if proc.lifted.is_empty() {
            return Ok(false);
        }
        let lifted = std::mem::take(&mut proc.lifted);

        let mut by_addr: FxHashMap<Address, rdc_ir::BlockId> = FxHashMap::default();
        let mut blocks = Vec::with_capacity(lifted.len());
        for lb in &lifted {
            let id = proc.cfg.new_block(lb.lo, lb.hi);
            by_addr.insert(lb.lo, id);
            blocks.push(id);
        }

        for (lb, &block) in lifted.into_iter().zip(blocks.iter()) {
            for kind in lb.stmts {
                proc.append_stmt(block, kind);
            }
        }

        for &block in &blocks {
            let Some(&last) = proc.cfg.blocks[block].stmts.last() else {
                // an empty block falls through
                if let Some(&next) = by_addr.get(&proc.cfg.blocks[block].hi) {
                    proc.cfg.add_edge(block, next);
                }
                continue;
            };
            let fall_addr = proc.cfg.blocks[block].hi;

            match &proc.stmts[last].kind {
                StmtKind::Branch(b) => {
                    let dest = b.fixed_dest();
                    // taken edge in slot 0, fall-through in slot 1
                    match by_addr.get(&dest) {
                        Some(&taken) => proc.cfg.add_edge(block, taken),
                        None => log::debug!(
                            "branch {} targets undecoded address {dest}",
                            proc.stmts[last].number
                        ),
                    }
                    if let Some(&fall) = by_addr.get(&fall_addr) {
                        proc.cfg.add_edge(block, fall);
                    }
                }
                StmtKind::Goto(g) => {
                    if g.computed {
                        log::debug!("computed goto {} has no static edges", proc.stmts[last].number);
                    } else if let Some(dest) = g.dest.int_value() {
                        if let Some(&target) = by_addr.get(&Address::new(dest as u64)) {
                            proc.cfg.add_edge(block, target);
                        }
                    }
                }
                StmtKind::Case(c) => {
                    // switch targets come from the table when the image
                    // can be read; otherwise the case is opaque
                    let targets = case_targets(proc, c);
                    for t in targets {
                        if let Some(&target) = by_addr.get(&t) {
                            proc.cfg.add_edge(block, target);
                        }
                    }
                }
                StmtKind::Return(_) => {}
                _ => {
                    if let Some(&fall) = by_addr.get(&fall_addr) {
                        proc.cfg.add_edge(block, fall);
                    }
                }
            }
        }

        if let Some(entry) = proc.cfg.block_at(proc.entry_addr) {
            proc.cfg.entry = entry;
        }
        proc.renumber();
        Ok(true)
    }
}

fn case_targets(proc: &Procedure, case: &rdc_ir::CaseStmt) -> Vec<Address> {
    let Some(table) = &case.table else {
        return Vec::new();
    };
    let Some(image) = &proc.image else {
        return Vec::new();
    };
    let mut targets = Vec::with_capacity(table.num_cases);
    let word_bytes = u64::from(WORD_BITS / 8);
    for i in 0..table.num_cases {
        let slot = table.table_addr + i as u64 * word_bytes;
        if let Some(word) = image.read_word(slot, WORD_BITS) {
            let target = match table.form {
                rdc_ir::SwitchForm::Absolute => Address::new(word),
                rdc_ir::SwitchForm::Relative => table.table_addr + word,
            };
            targets.push(target);
        }
    }
    targets
}

// ---------------------------------------------------------------------------
// GlobalConstReplace
// ---------------------------------------------------------------------------

/// Replace reads of read-only global memory with the constant stored
/// there.
pub struct GlobalConstReplacePass;

impl Pass for GlobalConstReplacePass {
    fn id(&self) -> PassId {
        PassId::GlobalConstReplace
    }

    fn name(&self) -> &'static str {
        "GlobalConstReplace"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let Some(image) = proc.image.clone() else {
            return Ok(false);
        };

        let mut changed = false;
        for id in proc.stmt_order() {
            let mut stmt = proc.stmts[id].clone();
            let mut stmt_changed = false;
            stmt.map_exps(|root, role| match role {
                ExpRole::Use => {
                    let out = replace_global_reads(root, image.as_ref());
                    stmt_changed |= !Rc::ptr_eq(&out, root);
                    out
                }
                ExpRole::Def => {
                    // a store's address may still contain loads
                    if let rdc_ir::Exp::Unary {
                        op: Operator::MemOf,
                        sub,
                    } = &**root
                    {
                        let addr = replace_global_reads(sub, image.as_ref());
                        if Rc::ptr_eq(&addr, sub) {
                            Rc::clone(root)
                        } else {
                            stmt_changed = true;
                            Exp::mem_of(addr)
                        }
                    } else {
                        Rc::clone(root)
                    }
                }
            });
            if stmt_changed {
                proc.stmts[id] = stmt;
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn replace_global_reads(e: &SharedExp, image: &dyn ProgramImage) -> SharedExp {
    if let rdc_ir::Exp::Unary {
        op: Operator::MemOf,
        sub,
    } = &**e
    {
        if let Some(addr) = sub.int_value() {
            let addr = Address::new(addr as u64);
            if image.is_read_only(addr) {
                if let Some(word) = image.read_word(addr, WORD_BITS) {
                    return Exp::int(word as i64);
                }
            }
        }
    }
    e.map_children(|c| replace_global_reads(c, image))
}

// ---------------------------------------------------------------------------
// BBSimplify
// ---------------------------------------------------------------------------

/// Simplify every statement's expressions, block by block.
pub struct BBSimplifyPass;

impl Pass for BBSimplifyPass {
    fn id(&self) -> PassId {
        PassId::BBSimplify
    }

    fn name(&self) -> &'static str {
        "BBSimplify"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;
        for id in proc.stmt_order() {
            let mut stmt = proc.stmts[id].clone();
            if stmt.simplify_exps() {
                proc.stmts[id] = stmt;
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// StatementPropagation
// ---------------------------------------------------------------------------

/// Substitute defining expressions into their uses.
///
/// Subscripted uses name their definition directly, so in SSA form a
/// substitution is valid whenever the size conditions hold: the
/// definition cannot be killed on any path. Before renaming, a
/// conservative block-local version runs instead, tracking the last
/// definition of each location and killing entries whose operands are
/// redefined. Either way a substitution happens only if the result
/// simplifies or the definition has exactly one use.
pub struct StatementPropagationPass;

impl Pass for StatementPropagationPass {
    fn id(&self) -> PassId {
        PassId::StatementPropagation
    }

    fn name(&self) -> &'static str {
        "StatementPropagation"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = propagate_ssa(proc);
        changed |= propagate_block_local(proc);
        Ok(changed)
    }
}

/// Count textual uses of each SSA definition.
pub(crate) fn count_ssa_uses(proc: &Procedure) -> FxHashMap<rdc_ir::StmtId, usize> {
    let mut counts: FxHashMap<rdc_ir::StmtId, usize> = FxHashMap::default();
    for id in proc.stmt_order() {
        let stmt = &proc.stmts[id];
        stmt.for_each_exp(&mut |root, role| {
            // a store destination uses its address only
            let target = match role {
                ExpRole::Use => Some(Rc::clone(root)),
                ExpRole::Def => match &**root {
                    rdc_ir::Exp::Unary {
                        op: Operator::MemOf,
                        sub,
                    } => Some(Rc::clone(sub)),
                    rdc_ir::Exp::Subscript { base, .. } => match &**base {
                        rdc_ir::Exp::Unary {
                            op: Operator::MemOf,
                            sub,
                        } => Some(Rc::clone(sub)),
                        _ => None,
                    },
                    _ => None,
                },
            };
            if let Some(e) = target {
                collect_subscript_defs(&e, &mut counts);
            }
        });
        // phi operands are uses of their definitions
        if let StmtKind::PhiAssign(phi) = &stmt.kind {
            for arg in &phi.args {
                if let SsaDef::Stmt(d) = arg.def {
                    *counts.entry(d).or_default() += 1;
                }
            }
        }
    }
    counts
}

fn collect_subscript_defs(e: &SharedExp, counts: &mut FxHashMap<rdc_ir::StmtId, usize>) {
    if let rdc_ir::Exp::Subscript {
        def: SsaDef::Stmt(d),
        ..
    } = &**e
    {
        *counts.entry(*d).or_default() += 1;
    }
    for c in e.children() {
        collect_subscript_defs(c, counts);
    }
}

fn propagate_ssa(proc: &mut Procedure) -> bool {
    let counts = count_ssa_uses(proc);
    let mut changed = false;

    for id in proc.stmt_order() {
        let mut stmt = proc.stmts[id].clone();
        let mut stmt_changed = false;
        {
            let stmts = &proc.stmts;
            stmt.map_exps(|root, role| {
                match role {
                    ExpRole::Use => {
                        let out = substitute_ssa_defs(root, stmts, &counts);
                        stmt_changed |= !Rc::ptr_eq(&out, root);
                        out
                    }
                    ExpRole::Def => {
                        // rewrite only the address computation of a
                        // memory destination
                        let (memof, def) = match &**root {
                            rdc_ir::Exp::Unary {
                                op: Operator::MemOf,
                                sub,
                            } => (Some(Rc::clone(sub)), None),
                            rdc_ir::Exp::Subscript { base, def } => match &**base {
                                rdc_ir::Exp::Unary {
                                    op: Operator::MemOf,
                                    sub,
                                } => (Some(Rc::clone(sub)), Some(*def)),
                                _ => (None, None),
                            },
                            _ => (None, None),
                        };
                        match memof {
                            Some(addr) => {
                                let new_addr = substitute_ssa_defs(&addr, stmts, &counts);
                                if Rc::ptr_eq(&new_addr, &addr) {
                                    Rc::clone(root)
                                } else {
                                    stmt_changed = true;
                                    let loc = Exp::mem_of(new_addr);
                                    match def {
                                        Some(d) => Exp::subscript(loc, d),
                                        None => loc,
                                    }
                                }
                            }
                            None => Rc::clone(root),
                        }
                    }
                }
            });
        }
        if stmt_changed {
            stmt.simplify_exps();
            proc.stmts[id] = stmt;
            changed = true;
        }
    }
    changed
}

fn substitute_ssa_defs(
    e: &SharedExp,
    stmts: &rdc_util::IndexVec<rdc_ir::StmtId, rdc_ir::Statement>,
    counts: &FxHashMap<rdc_ir::StmtId, usize>,
) -> SharedExp {
    let rebuilt = e.map_children(|c| substitute_ssa_defs(c, stmts, counts));

    if let rdc_ir::Exp::Subscript {
        base,
        def: SsaDef::Stmt(d),
    } = &*rebuilt
    {
        if let StmtKind::Assign(a) = &stmts[*d].kind {
            // only substitute a definition of exactly this location
            if a.lhs.base() == *base {
                let rhs = &a.rhs;
                let single_use = counts.get(d).copied().unwrap_or(0) == 1;
                if rhs.mem_depth() <= MAX_PROP_DEPTH && (single_use || is_trivial(rhs)) {
                    return Rc::clone(rhs);
                }
            }
        }
    }
    rebuilt
}

/// Expressions always worth propagating: constants and plain locations.
fn is_trivial(e: &SharedExp) -> bool {
    match &**e {
        rdc_ir::Exp::Const(_) | rdc_ir::Exp::Terminal(_) => true,
        rdc_ir::Exp::Subscript { base, .. } => is_trivial(base),
        rdc_ir::Exp::Unary {
            op: Operator::RegOf,
            ..
        } => true,
        _ => false,
    }
}

fn propagate_block_local(proc: &mut Procedure) -> bool {
    // count syntactic base-location uses across the procedure, for the
    // single-use shortcut
    let mut base_uses: FxHashMap<SharedExp, usize> = FxHashMap::default();
    for id in proc.stmt_order() {
        proc.stmts[id].for_each_exp(&mut |root, role| {
            if role == ExpRole::Use {
                count_location_uses(root, &mut base_uses);
            }
        });
    }

    let mut changed = false;
    for block in proc.cfg.blocks.indices().collect::<Vec<_>>() {
        // last unkilled definition per location
        let mut avail: Vec<(SharedExp, SharedExp)> = Vec::new();

        for &id in proc.cfg.blocks[block].stmts.clone().iter() {
            let mut stmt = proc.stmts[id].clone();
            let mut stmt_changed = false;

            for (loc, rhs) in &avail {
                if loc.is_subscript() {
                    continue;
                }
                let single_use = base_uses.get(loc).copied().unwrap_or(0) == 1;
                if rhs.mem_depth() > MAX_PROP_DEPTH || !(single_use || is_trivial(rhs)) {
                    continue;
                }
                let mut replaced = false;
                stmt.map_exps(|root, role| match role {
                    ExpRole::Use => {
                        let (out, ch) = root.search_replace_all(loc, rhs);
                        replaced |= ch;
                        out
                    }
                    ExpRole::Def => Rc::clone(root),
                });
                stmt_changed |= replaced;
            }

            if stmt_changed {
                stmt.simplify_exps();
            }

            // kill entries invalidated by this statement's definitions
            let defs = stmt.definitions();
            avail.retain(|(loc, rhs)| {
                for def in &defs {
                    let base = def.base();
                    if *loc == base || rhs.search(&base).is_some() {
                        return false;
                    }
                    // a memory write may alias any tracked load
                    if base.is_mem_of() && (loc.is_mem_of() || rhs.mem_depth() > 0) {
                        return false;
                    }
                }
                true
            });

            // calls clobber everything they may define
            if matches!(stmt.kind, StmtKind::Call(_)) {
                avail.clear();
            }

            if let StmtKind::Assign(a) = &stmt.kind {
                if !a.lhs.is_subscript() && !a.lhs.is_mem_of() {
                    avail.push((Rc::clone(&a.lhs), Rc::clone(&a.rhs)));
                }
            }

            if stmt_changed {
                proc.stmts[id] = stmt;
                changed = true;
            }
        }
    }
    changed
}

fn count_location_uses(e: &SharedExp, counts: &mut FxHashMap<SharedExp, usize>) {
    if rdc_ir::is_location(e) && !e.is_subscript() {
        *counts.entry(Rc::clone(e)).or_default() += 1;
    }
    for c in e.children() {
        count_location_uses(c, counts);
    }
}
