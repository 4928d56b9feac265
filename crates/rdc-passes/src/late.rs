//! Late passes: relational synthesis, liveness-driven cleanup, SSA
//! dismantling, parameter recovery and symbol mapping.

use std::rc::Rc;

use rdc_ir::{
    Assign, BlockId, Exp, ExpExt, ExpRole, ImplicitAssign, Operator, Param, Procedure, SharedExp,
    SsaDef, StmtId, StmtKind, Ty,
};
use rdc_util::{FxHashMap, FxHashSet, Symbol};

use crate::dataflow::dominators;
use crate::manager::{Pass, PassId};
use crate::PassError;

// ---------------------------------------------------------------------------
// BranchAnalysis
// ---------------------------------------------------------------------------

/// Rewrite flag-based branch conditions into typed relationals. The
/// overflow and parity kinds have no relational form; those branches
/// keep the raw condition and count as unchanged.
pub struct BranchAnalysisPass;

impl Pass for BranchAnalysisPass {
    fn id(&self) -> PassId {
        PassId::BranchAnalysis
    }

    fn name(&self) -> &'static str {
        "BranchAnalysis"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;

        for id in proc.stmt_order() {
            let StmtKind::Branch(branch) = &proc.stmts[id].kind else {
                continue;
            };
            let kind = branch.kind;
            let cond = Rc::clone(&branch.cond);

            // already synthesised
            if cond.op().is_relational() {
                continue;
            }

            let setter = flag_setter_rhs(proc, id, &cond);
            let Some(rhs) = setter else {
                log::debug!(
                    "branch {}: no recognisable flag setter for {}",
                    proc.stmts[id].number,
                    cond
                );
                continue;
            };

            match rdc_ir::cond_to_relational(&rhs, kind) {
                Some(rel) => {
                    let is_float = rhs
                        .as_flag_call()
                        .is_some_and(|(name, _)| name.as_str() == rdc_ir::SETFFLAGS);
                    if let StmtKind::Branch(b) = &mut proc.stmts[id].kind {
                        b.cond = rel;
                        b.is_float |= is_float;
                    }
                    changed = true;
                }
                None => {
                    log::debug!(
                        "branch {}: kind '{}' has no relational form",
                        proc.stmts[id].number,
                        kind.name()
                    );
                }
            }
        }
        Ok(changed)
    }
}

/// The flag-call expression feeding a branch condition: either inside
/// the condition already (propagation got there first), named by the
/// condition's SSA subscript, or found as the nearest flag assignment
/// above the branch in its block.
fn flag_setter_rhs(proc: &Procedure, branch_id: StmtId, cond: &SharedExp) -> Option<SharedExp> {
    let flagcall_pattern = Exp::binary(
        Operator::FlagCall,
        Exp::terminal(Operator::WildStrConst),
        Exp::wild(),
    );
    if let Some(call) = cond.search(&flagcall_pattern) {
        return Some(call);
    }

    if !cond.base().is_flags() {
        return None;
    }

    // subscripted flags name their defining statement
    if let Exp::Subscript {
        def: SsaDef::Stmt(d),
        ..
    } = &**cond
    {
        if let StmtKind::Assign(a) = &proc.stmts[*d].kind {
            return a.rhs.search(&flagcall_pattern);
        }
        return None;
    }

    // raw flags: scan backwards in the block
    let block = proc.stmts[branch_id].block;
    let stmts = &proc.cfg.blocks[block].stmts;
    let at = stmts.iter().position(|&s| s == branch_id)?;
    for &sid in stmts[..at].iter().rev() {
        if let StmtKind::Assign(a) = &proc.stmts[sid].kind {
            if a.lhs.base().is_flags() {
                return a.rhs.search(&flagcall_pattern);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Use counting over SSA definitions
// ---------------------------------------------------------------------------

type DefKey = (StmtId, SharedExp);

/// Textual uses of each (defining statement, base location) pair,
/// phi operands included.
fn count_def_uses(proc: &Procedure) -> FxHashMap<DefKey, usize> {
    let mut counts: FxHashMap<DefKey, usize> = FxHashMap::default();
    for id in proc.stmt_order() {
        let stmt = &proc.stmts[id];
        stmt.for_each_exp(&mut |root, role| {
            match role {
                ExpRole::Use => collect_def_uses(root, &mut counts),
                ExpRole::Def => {
                    // address computation inside a store destination
                    let addr = match &**root {
                        Exp::Unary {
                            op: Operator::MemOf,
                            sub,
                        } => Some(sub),
                        Exp::Subscript { base, .. } => match &**base {
                            Exp::Unary {
                                op: Operator::MemOf,
                                sub,
                            } => Some(sub),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(addr) = addr {
                        collect_def_uses(addr, &mut counts);
                    }
                }
            }
        });
        if let StmtKind::PhiAssign(phi) = &stmt.kind {
            let base = phi.lhs.strip_subscripts();
            for arg in &phi.args {
                if let SsaDef::Stmt(d) = arg.def {
                    *counts.entry((d, Rc::clone(&base))).or_default() += 1;
                }
            }
        }
    }
    counts
}

fn collect_def_uses(e: &SharedExp, counts: &mut FxHashMap<DefKey, usize>) {
    if let Exp::Subscript {
        base,
        def: SsaDef::Stmt(d),
    } = &**e
    {
        *counts.entry((*d, base.strip_subscripts())).or_default() += 1;
    }
    for c in e.children() {
        collect_def_uses(c, counts);
    }
}

// ---------------------------------------------------------------------------
// CallLivenessRemoval
// ---------------------------------------------------------------------------

/// Trim call result lists down to the locations actually used
/// afterwards.
pub struct CallLivenessRemovalPass;

impl Pass for CallLivenessRemovalPass {
    fn id(&self) -> PassId {
        PassId::CallLivenessRemoval
    }

    fn name(&self) -> &'static str {
        "CallLivenessRemoval"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let counts = count_def_uses(proc);
        let mut changed = false;

        for id in proc.stmt_order() {
            let mut stmt = proc.stmts[id].clone();
            let StmtKind::Call(call) = &mut stmt.kind else {
                continue;
            };
            let before = call.defines.len();
            call.defines.retain(|d| {
                let base = d.lhs.strip_subscripts();
                counts.get(&(id, base)).copied().unwrap_or(0) > 0
            });
            if call.defines.len() != before {
                proc.stmts[id] = stmt;
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// UnusedStatementRemoval
// ---------------------------------------------------------------------------

/// Remove definitions nothing uses, iterating because each removal can
/// strand further definitions. Stores are kept: a memory write is
/// observable regardless of liveness.
pub struct UnusedStatementRemovalPass;

impl Pass for UnusedStatementRemovalPass {
    fn id(&self) -> PassId {
        PassId::UnusedStatementRemoval
    }

    fn name(&self) -> &'static str {
        "UnusedStatementRemoval"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;
        loop {
            let counts = count_def_uses(proc);
            let base_counts = count_unsubscripted_uses(proc);
            let mut removed = false;

            for id in proc.stmt_order() {
                let stmt = &proc.stmts[id];
                let removable = matches!(
                    stmt.kind,
                    StmtKind::Assign(_) | StmtKind::BoolAssign(_) | StmtKind::PhiAssign(_)
                );
                if !removable {
                    continue;
                }
                let Some(lhs) = stmt.lhs() else { continue };
                let base = lhs.strip_subscripts();
                if base.is_mem_of() {
                    continue;
                }
                // a definition is dead when no subscript names it and,
                // outside SSA form, its location is never read at all
                let ssa_uses = counts.get(&(id, Rc::clone(&base))).copied().unwrap_or(0);
                let raw_uses = base_counts.get(&base).copied().unwrap_or(0);
                if ssa_uses == 0 && raw_uses == 0 {
                    proc.remove_stmt(id);
                    removed = true;
                }
            }

            if !removed {
                break;
            }
            changed = true;
        }
        Ok(changed)
    }
}

/// Syntactic reads of locations that carry no SSA subscript.
fn count_unsubscripted_uses(proc: &Procedure) -> FxHashMap<SharedExp, usize> {
    let mut counts: FxHashMap<SharedExp, usize> = FxHashMap::default();
    for id in proc.stmt_order() {
        proc.stmts[id].for_each_exp(&mut |root, role| match role {
            ExpRole::Use => collect_unsubscripted(root, &mut counts),
            ExpRole::Def => {
                if let Exp::Unary {
                    op: Operator::MemOf,
                    sub,
                } = &*root.strip_subscripts()
                {
                    collect_unsubscripted(sub, &mut counts);
                }
            }
        });
    }
    counts
}

fn collect_unsubscripted(e: &SharedExp, counts: &mut FxHashMap<SharedExp, usize>) {
    if let Exp::Subscript { base, .. } = &**e {
        // the location itself is accounted for by its subscript; only
        // the address computation inside it is a raw read
        for c in base.children() {
            collect_unsubscripted(c, counts);
        }
        return;
    }
    if rdc_ir::is_location(e) {
        *counts.entry(Rc::clone(e)).or_default() += 1;
    }
    for c in e.children() {
        collect_unsubscripted(c, counts);
    }
}

// ---------------------------------------------------------------------------
// FromSSAForm
// ---------------------------------------------------------------------------

/// Leave SSA form: phi statements become copies on the incoming edges,
/// interfering parallel copies go through temporaries, and SSA
/// versions coalesce into one local name per congruence class. After
/// this pass no subscripts remain anywhere in the procedure.
pub struct FromSSAFormPass;

impl Pass for FromSSAFormPass {
    fn id(&self) -> PassId {
        PassId::FromSSAForm
    }

    fn name(&self) -> &'static str {
        "FromSSAForm"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let had_phis = lower_phis(proc);
        renumber_rpo(proc);
        let renamed = coalesce_versions(proc);
        Ok(had_phis || renamed)
    }
}

/// Replace each phi with copies at the ends of its predecessors,
/// splitting critical edges so a copy never executes on a path that
/// bypasses the join.
fn lower_phis(proc: &mut Procedure) -> bool {
    let mut any = false;

    for block in proc.cfg.blocks.indices().collect::<Vec<_>>() {
        let phi_ids: Vec<StmtId> = proc.cfg.blocks[block]
            .stmts
            .iter()
            .copied()
            .filter(|&sid| proc.stmts[sid].is_phi())
            .collect();
        if phi_ids.is_empty() {
            continue;
        }
        any = true;

        // copies per predecessor, in predecessor-list order
        let preds: Vec<BlockId> = proc.cfg.blocks[block].predecessors().to_vec();
        for pred in preds {
            let mut copies: Vec<(SharedExp, SharedExp)> = Vec::new();
            for &phi_id in &phi_ids {
                let StmtKind::PhiAssign(phi) = &proc.stmts[phi_id].kind else {
                    continue;
                };
                let base = phi.lhs.strip_subscripts();
                let Some(arg) = phi.args.iter().find(|a| a.pred == pred) else {
                    continue;
                };
                let dest = Exp::subscript(Rc::clone(&base), SsaDef::Stmt(phi_id));
                let src = Exp::subscript(base, arg.def);
                copies.push((dest, src));
            }
            if copies.is_empty() {
                continue;
            }

            // critical edge: the predecessor branches elsewhere too
            let site = if proc.cfg.blocks[pred].num_successors() > 1 {
                let mid = proc.cfg.split_edge(pred, block);
                let dest = proc.cfg.blocks[block].lo;
                proc.append_stmt(
                    mid,
                    StmtKind::Goto(rdc_ir::GotoStmt {
                        dest: Exp::int(dest.value() as i64),
                        computed: false,
                    }),
                );
                mid
            } else {
                pred
            };

            // break parallel-copy overwrites with temporaries
            let dests: Vec<SharedExp> = copies.iter().map(|(d, _)| Rc::clone(d)).collect();
            let mut staged: Vec<(SharedExp, SharedExp)> = Vec::new();
            for (dest, src) in copies.iter_mut() {
                if dests.iter().any(|d| d == src && d != dest) {
                    let tmp = Exp::local(fresh_temp(proc));
                    staged.push((Rc::clone(&tmp), Rc::clone(src)));
                    *src = tmp;
                }
            }
            staged.extend(copies);

            // place before the terminator
            let at = insertion_point(proc, site);
            for (dest, src) in staged.into_iter().rev() {
                proc.insert_stmt_at(site, at, StmtKind::Assign(Assign::new(dest, src)));
            }
        }

        for &phi_id in &phi_ids {
            proc.remove_stmt(phi_id);
        }
    }
    any
}

fn fresh_temp(proc: &mut Procedure) -> Symbol {
    let name = Symbol::intern(&format!("tmp{}", proc.locals.len()));
    proc.locals.insert(
        name,
        rdc_ir::Local {
            name,
            ty: Ty::Unknown,
            base: Exp::local(name),
        },
    );
    name
}

fn insertion_point(proc: &Procedure, block: BlockId) -> usize {
    let stmts = &proc.cfg.blocks[block].stmts;
    match stmts.last() {
        Some(&last) if proc.stmts[last].is_terminator() => stmts.len() - 1,
        _ => stmts.len(),
    }
}

/// Renumber statements so sequence numbers follow reverse post-order;
/// the live-range intervals below rely on it.
fn renumber_rpo(proc: &mut Procedure) {
    let dom = dominators(proc);
    let mut number = 0;
    for &block in &dom.rpo {
        for &sid in proc.cfg.blocks[block].stmts.clone().iter() {
            number += 1;
            proc.stmts[sid].number = number;
        }
    }
    // unreachable blocks keep deterministic numbers at the end
    for block in proc.cfg.blocks.indices().collect::<Vec<_>>() {
        if !dom.is_reachable(block) {
            for &sid in proc.cfg.blocks[block].stmts.clone().iter() {
                number += 1;
                proc.stmts[sid].number = number;
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Range {
    start: u32,
    end: u32,
}

/// Map every SSA version to a name: the first congruence class of a
/// base keeps the base location itself, later classes get fresh
/// locals. Classes are live-range intervals over the RPO numbering;
/// overlapping intervals of one base never share a name.
fn coalesce_versions(proc: &mut Procedure) -> bool {
    // live interval per (base, def)
    let mut ranges: FxHashMap<(SharedExp, SsaDef), Range> = FxHashMap::default();
    let mut order: Vec<(SharedExp, SsaDef)> = Vec::new();

    for id in proc.stmt_order() {
        let number = proc.stmts[id].number;
        let stmt = &proc.stmts[id];
        stmt.for_each_exp(&mut |root, role| {
            collect_versions(root, role, number, &mut ranges, &mut order);
        });
    }
    if ranges.is_empty() {
        return false;
    }

    // greedy interval assignment, versions in definition order
    order.sort_by_key(|key| ranges[key].start);
    let mut slots: FxHashMap<SharedExp, Vec<u32>> = FxHashMap::default();
    let mut names: FxHashMap<(SharedExp, SsaDef), Option<Symbol>> = FxHashMap::default();

    for key in order {
        let (base, def) = &key;
        let range = ranges[&key];
        let ends = slots.entry(Rc::clone(base)).or_default();

        let mut slot = None;
        for (i, end) in ends.iter().enumerate() {
            if *end < range.start {
                slot = Some(i);
                break;
            }
        }
        let slot = match slot {
            Some(i) => {
                ends[i] = ends[i].max(range.end);
                i
            }
            None => {
                ends.push(range.end);
                ends.len() - 1
            }
        };

        let name = if slot == 0 {
            None
        } else {
            let ty = proc
                .types
                .get(&Exp::subscript(Rc::clone(base), *def))
                .cloned()
                .unwrap_or(Ty::Unknown);
            Some(version_local(proc, base, ty))
        };
        names.insert((Rc::clone(base), *def), name);
    }

    // rewrite every subscript to its assigned name
    let mut changed = false;
    for id in proc.stmt_order() {
        let mut stmt = proc.stmts[id].clone();
        let mut stmt_changed = false;
        stmt.map_exps(|root, _| {
            let out = strip_versions(root, &names);
            stmt_changed |= !Rc::ptr_eq(&out, root);
            out
        });
        if stmt_changed {
            proc.stmts[id] = stmt;
            changed = true;
        }
    }
    changed
}

fn collect_versions(
    e: &SharedExp,
    role: ExpRole,
    number: u32,
    ranges: &mut FxHashMap<(SharedExp, SsaDef), Range>,
    order: &mut Vec<(SharedExp, SsaDef)>,
) {
    if let Exp::Subscript { base, def } = &**e {
        let key = (base.strip_subscripts(), *def);
        let entry = ranges.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            // implicit versions live from procedure entry
            let start = if *def == SsaDef::Implicit { 0 } else { number };
            Range { start, end: number }
        });
        match role {
            ExpRole::Def => entry.start = entry.start.min(number),
            ExpRole::Use => {}
        }
        entry.end = entry.end.max(number);
    }
    for c in e.children() {
        // anything inside this node is a value read
        collect_versions(c, ExpRole::Use, number, ranges, order);
    }
}

fn version_local(proc: &mut Procedure, base: &SharedExp, ty: Ty) -> Symbol {
    proc.new_local(base, ty)
}

fn strip_versions(
    e: &SharedExp,
    names: &FxHashMap<(SharedExp, SsaDef), Option<Symbol>>,
) -> SharedExp {
    let rebuilt = e.map_children(|c| strip_versions(c, names));
    if let Exp::Subscript { base, def } = &*rebuilt {
        let key = (base.strip_subscripts(), *def);
        return match names.get(&key) {
            Some(Some(name)) => Exp::local(*name),
            _ => Rc::clone(base),
        };
    }
    rebuilt
}

// ---------------------------------------------------------------------------
// Liveness over base locations
// ---------------------------------------------------------------------------

/// Base locations read by `root`, nested locations included.
fn collect_used_locations(root: &SharedExp, out: &mut Vec<SharedExp>) {
    let stripped = root.strip_subscripts();
    if rdc_ir::is_location(&stripped) && !out.contains(&stripped) {
        out.push(Rc::clone(&stripped));
    }
    for c in root.children() {
        collect_used_locations(c, out);
    }
}

/// Upward-exposed uses and definitions per block.
fn block_use_def(proc: &Procedure, block: BlockId) -> (Vec<SharedExp>, Vec<SharedExp>) {
    let mut uses: Vec<SharedExp> = Vec::new();
    let mut defs: Vec<SharedExp> = Vec::new();

    for &sid in &proc.cfg.blocks[block].stmts {
        let stmt = &proc.stmts[sid];
        stmt.for_each_exp(&mut |root, role| {
            let mut read: Vec<SharedExp> = Vec::new();
            match role {
                ExpRole::Use => collect_used_locations(root, &mut read),
                ExpRole::Def => {
                    // only the address of a store is read
                    if let Exp::Unary {
                        op: Operator::MemOf,
                        sub,
                    } = &*root.strip_subscripts()
                    {
                        collect_used_locations(sub, &mut read);
                    }
                }
            }
            for loc in read {
                if !defs.contains(&loc) && !uses.contains(&loc) {
                    uses.push(loc);
                }
            }
        });
        for def in stmt.definitions() {
            let base = def.strip_subscripts();
            if !defs.contains(&base) {
                defs.push(base);
            }
        }
    }
    (uses, defs)
}

/// Locations live on entry to the procedure: used on some path before
/// any definition.
pub(crate) fn live_in_at_entry(proc: &Procedure) -> Vec<SharedExp> {
    let n = proc.cfg.blocks.len();
    let mut use_sets = Vec::with_capacity(n);
    let mut def_sets = Vec::with_capacity(n);
    for block in proc.cfg.blocks.indices() {
        let (u, d) = block_use_def(proc, block);
        use_sets.push(u);
        def_sets.push(d);
    }

    let mut live_in: Vec<FxHashSet<SharedExp>> = vec![FxHashSet::default(); n];
    let mut iterations = 0;
    let max_iterations = n * n + 2;
    let mut changed = true;
    while changed && iterations < max_iterations {
        changed = false;
        iterations += 1;
        for (i, block) in proc.cfg.blocks.indices().enumerate().collect::<Vec<_>>() {
            let mut out: FxHashSet<SharedExp> = FxHashSet::default();
            for &succ in proc.cfg.blocks[block].successors() {
                out.extend(live_in[succ.0 as usize].iter().cloned());
            }
            let mut set: FxHashSet<SharedExp> = use_sets[i].iter().cloned().collect();
            for loc in out {
                if !def_sets[i].contains(&loc) {
                    set.insert(loc);
                }
            }
            if set != live_in[i] {
                live_in[i] = set;
                changed = true;
            }
        }
    }

    let entry = proc.cfg.entry;
    let mut result: Vec<SharedExp> = live_in[entry.0 as usize].iter().cloned().collect();
    // deterministic order for the passes that materialise statements
    result.sort_by_key(|e| e.to_string());
    result
}

// ---------------------------------------------------------------------------
// FinalParameterSearch
// ---------------------------------------------------------------------------

/// Infer the final parameter list from the register locations live on
/// entry once every other transformation has settled.
pub struct FinalParameterSearchPass;

impl Pass for FinalParameterSearchPass {
    fn id(&self) -> PassId {
        PassId::FinalParameterSearch
    }

    fn name(&self) -> &'static str {
        "FinalParameterSearch"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let sp_reg = proc.signature.conv.sp_reg;
        let live: Vec<SharedExp> = live_in_at_entry(proc)
            .into_iter()
            .filter(|loc| loc.is_reg_of() && loc.reg_num() != Some(sp_reg))
            .collect();

        let mut params = Vec::with_capacity(live.len());
        for (i, exp) in live.iter().enumerate() {
            let existing = proc.signature.params.iter().find(|p| p.exp == *exp);
            let name = match existing {
                Some(p) => p.name,
                None => Symbol::intern(&format!("param{i}")),
            };
            let ty = proc.types.get(exp).cloned().unwrap_or(Ty::Unknown);
            params.push(Param {
                exp: Rc::clone(exp),
                name,
                ty,
            });
        }

        let changed = params != proc.signature.params;
        proc.signature.params = params;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// UnusedLocalRemoval
// ---------------------------------------------------------------------------

/// Drop declared locals no statement references.
pub struct UnusedLocalRemovalPass;

impl Pass for UnusedLocalRemovalPass {
    fn id(&self) -> PassId {
        PassId::UnusedLocalRemoval
    }

    fn name(&self) -> &'static str {
        "UnusedLocalRemoval"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut used: FxHashSet<Symbol> = FxHashSet::default();
        for id in proc.stmt_order() {
            proc.stmts[id].for_each_exp(&mut |root, _| collect_local_names(root, &mut used));
        }

        let before = proc.locals.len();
        proc.locals.retain(|name, _| used.contains(name));
        let removed = before - proc.locals.len();
        if removed > 0 {
            let keep: FxHashSet<Symbol> = proc.locals.keys().copied().collect();
            proc.symbol_map
                .retain(|_, name| keep.contains(name) || !name.as_str().starts_with("local"));
            log::trace!("{}: removed {} unused locals", proc.name, removed);
        }
        Ok(removed > 0)
    }
}

fn collect_local_names(e: &SharedExp, out: &mut FxHashSet<Symbol>) {
    if let Some(name) = e.local_name() {
        out.insert(name);
    }
    for c in e.children() {
        collect_local_names(c, out);
    }
}

// ---------------------------------------------------------------------------
// UnusedParamRemoval
// ---------------------------------------------------------------------------

/// Remove parameters no reachable statement reads.
pub struct UnusedParamRemovalPass;

impl Pass for UnusedParamRemovalPass {
    fn id(&self) -> PassId {
        PassId::UnusedParamRemoval
    }

    fn name(&self) -> &'static str {
        "UnusedParamRemoval"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let order = proc.stmt_order();
        let params = proc.signature.params.clone();
        let mut keep = Vec::with_capacity(params.len());
        for param in params {
            let used = order
                .iter()
                .any(|&id| proc.stmts[id].uses_exp(&param.exp));
            if used {
                keep.push(param);
            }
        }
        let changed = keep != proc.signature.params;
        proc.signature.params = keep;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// ImplicitPlacement
// ---------------------------------------------------------------------------

/// Materialise an implicit assignment at procedure entry for every
/// location used before being defined, giving the back end a concrete
/// binding site.
pub struct ImplicitPlacementPass;

impl Pass for ImplicitPlacementPass {
    fn id(&self) -> PassId {
        PassId::ImplicitPlacement
    }

    fn name(&self) -> &'static str {
        "ImplicitPlacement"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let entry = proc.cfg.entry;
        let mut needed = live_in_at_entry(proc);

        // locations still marked implicit by renaming count too
        for id in proc.stmt_order() {
            proc.stmts[id].for_each_exp(&mut |root, _| {
                collect_implicit_bases(root, &mut needed);
            });
        }

        let existing: Vec<SharedExp> = proc.cfg.blocks[entry]
            .stmts
            .iter()
            .filter_map(|&sid| match &proc.stmts[sid].kind {
                StmtKind::ImplicitAssign(i) => Some(i.lhs.strip_subscripts()),
                _ => None,
            })
            .collect();

        let mut changed = false;
        for loc in needed {
            if existing.contains(&loc) {
                continue;
            }
            proc.insert_stmt_at(
                entry,
                0,
                StmtKind::ImplicitAssign(ImplicitAssign {
                    lhs: Rc::clone(&loc),
                }),
            );
            changed = true;
        }
        Ok(changed)
    }
}

fn collect_implicit_bases(e: &SharedExp, out: &mut Vec<SharedExp>) {
    if let Exp::Subscript {
        base,
        def: SsaDef::Implicit,
    } = &**e
    {
        let stripped = base.strip_subscripts();
        if !out.contains(&stripped) {
            out.push(stripped);
        }
    }
    for c in e.children() {
        collect_implicit_bases(c, out);
    }
}

// ---------------------------------------------------------------------------
// LocalAndParamMap
// ---------------------------------------------------------------------------

/// Map every remaining assignment destination to a symbol the back end
/// can declare; stack slots are rewritten to their local names.
pub struct LocalAndParamMapPass;

impl Pass for LocalAndParamMapPass {
    fn id(&self) -> PassId {
        PassId::LocalAndParamMap
    }

    fn name(&self) -> &'static str {
        "LocalAndParamMap"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;

        let params: Vec<(SharedExp, Symbol)> = proc
            .signature
            .params
            .iter()
            .map(|p| (Rc::clone(&p.exp), p.name))
            .collect();
        for (exp, name) in params {
            if proc.symbol_map.get(&exp) != Some(&name) {
                proc.symbol_map.insert(exp, name);
                changed = true;
            }
        }

        // name every assignment destination
        let sp_reg = proc.signature.conv.sp_reg;
        let mut stack_slots: Vec<(SharedExp, Symbol)> = Vec::new();
        for id in proc.stmt_order() {
            let Some(lhs) = proc.stmts[id].lhs() else {
                continue;
            };
            let base = lhs.strip_subscripts();
            if proc.symbol_map.contains_key(&base) {
                continue;
            }
            let ty = proc.types.get(&base).cloned().unwrap_or(Ty::Unknown);
            if is_stack_slot(&base, sp_reg) {
                let name = proc.new_local(&base, ty);
                stack_slots.push((base, name));
                changed = true;
            } else if base.is_reg_of() || base.local_name().is_some() {
                if base.local_name().is_none() {
                    proc.new_local(&base, ty);
                    changed = true;
                }
            }
        }

        // rewrite stack slots to their names everywhere
        for (slot, name) in stack_slots {
            let local = Exp::local(name);
            for id in proc.stmt_order() {
                let mut stmt = proc.stmts[id].clone();
                if stmt.search_replace_all(&slot, &local) {
                    proc.stmts[id] = stmt;
                }
            }
        }
        Ok(changed)
    }
}

/// `m[sp]`, `m[sp + k]` or `m[sp - k]`.
fn is_stack_slot(e: &SharedExp, sp_reg: u16) -> bool {
    let Exp::Unary {
        op: Operator::MemOf,
        sub,
    } = &**e
    else {
        return false;
    };
    let addr = sub.strip_subscripts();
    if addr.reg_num() == Some(sp_reg) {
        return true;
    }
    if let Exp::Binary {
        op: Operator::Plus | Operator::Minus,
        lhs,
        rhs,
    } = &*addr
    {
        return lhs.strip_subscripts().reg_num() == Some(sp_reg) && rhs.is_int_const();
    }
    false
}
