//! Middle passes: call/phi fix-up, preservation analysis, strength
//! reduction reversal and the small cleanup passes before type
//! analysis.

use std::rc::Rc;

use rdc_ir::{
    Assign, BlockId, Exp, ExpExt, ExpRole, Operator, Procedure, SharedExp, SsaDef, StmtKind,
};
use rdc_util::Symbol;

use crate::dataflow::dominators;
use crate::manager::{Pass, PassId};
use crate::PassError;

/// Recursion budget when resolving an SSA value to an expression over
/// entry values.
const MAX_RESOLVE_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// CallAndPhiFix
// ---------------------------------------------------------------------------

/// Reconcile phi operands with the current predecessor lists and
/// collapse degenerate phis; drop duplicate call results.
pub struct CallAndPhiFixPass;

impl Pass for CallAndPhiFixPass {
    fn id(&self) -> PassId {
        PassId::CallAndPhiFix
    }

    fn name(&self) -> &'static str {
        "CallAndPhiFix"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;

        for id in proc.stmt_order() {
            let mut stmt = proc.stmts[id].clone();
            let block = stmt.block;
            let mut stmt_changed = false;
            let mut collapse: Option<StmtKind> = None;

            match &mut stmt.kind {
                StmtKind::PhiAssign(phi) => {
                    let preds: Vec<BlockId> = proc.cfg.blocks[block].predecessors().to_vec();

                    let before = phi.args.len();
                    phi.args.retain(|a| preds.contains(&a.pred));
                    for &p in &preds {
                        if !phi.args.iter().any(|a| a.pred == p) {
                            phi.args.push(rdc_ir::PhiArg {
                                pred: p,
                                def: SsaDef::Implicit,
                            });
                        }
                    }
                    stmt_changed = phi.args.len() != before;

                    // all operands agree: the phi is a copy
                    if let Some(first) = phi.args.first().map(|a| a.def) {
                        if phi.args.iter().all(|a| a.def == first) {
                            let base = phi.lhs.strip_subscripts();
                            let rhs = Exp::subscript(base, first);
                            collapse = Some(StmtKind::Assign(Assign::new(
                                Rc::clone(&phi.lhs),
                                rhs,
                            )));
                        }
                    }
                }
                StmtKind::Call(call) => {
                    let mut seen: Vec<SharedExp> = Vec::new();
                    let before = call.defines.len();
                    call.defines.retain(|d| {
                        let base = d.lhs.strip_subscripts();
                        if seen.contains(&base) {
                            false
                        } else {
                            seen.push(base);
                            true
                        }
                    });
                    stmt_changed = call.defines.len() != before;
                }
                _ => {}
            }

            if let Some(kind) = collapse {
                stmt.kind = kind;
                stmt_changed = true;
            }
            if stmt_changed {
                proc.stmts[id] = stmt;
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Preservation machinery
// ---------------------------------------------------------------------------

/// The definition of `base` reaching the statement at `index` in
/// `block`, found by scanning backwards and then up the dominator tree.
fn reaching_def_before(
    proc: &Procedure,
    dom: &rdc_ir::DominatorInfo,
    base: &SharedExp,
    block: BlockId,
    index: usize,
) -> SsaDef {
    let mut cursor = block;
    let mut limit = Some(index);
    loop {
        let stmts = &proc.cfg.blocks[cursor].stmts;
        let upto = limit.unwrap_or(stmts.len());
        for &sid in stmts[..upto].iter().rev() {
            for def in proc.stmts[sid].definitions() {
                if def.strip_subscripts() == *base {
                    return SsaDef::Stmt(sid);
                }
            }
        }
        match dom.idom[cursor] {
            Some(parent) if parent != cursor => {
                cursor = parent;
                limit = None;
            }
            _ => return SsaDef::Implicit,
        }
    }
}

/// Resolve the value of `base` as of definition `def` into an
/// expression over entry values; `None` when the value escapes
/// analysis (opaque call, disagreeing phi, or recursion budget).
fn resolve_def(
    proc: &Procedure,
    dom: &rdc_ir::DominatorInfo,
    base: &SharedExp,
    def: SsaDef,
    depth: usize,
) -> Option<SharedExp> {
    if depth == 0 {
        return None;
    }
    match def {
        SsaDef::Implicit => Some(Exp::subscript(Rc::clone(base), SsaDef::Implicit)),
        SsaDef::Stmt(d) => match &proc.stmts[d].kind {
            StmtKind::Assign(a) => {
                if a.lhs.strip_subscripts() != *base {
                    return None;
                }
                resolve_exp(proc, dom, &a.rhs, depth - 1)
            }
            StmtKind::ImplicitAssign(_) => {
                Some(Exp::subscript(Rc::clone(base), SsaDef::Implicit))
            }
            StmtKind::PhiAssign(phi) => {
                let mut resolved: Option<SharedExp> = None;
                for arg in &phi.args {
                    let value = resolve_def(proc, dom, base, arg.def, depth - 1)?;
                    match &resolved {
                        None => resolved = Some(value),
                        Some(prev) if *prev == value => {}
                        Some(_) => return None,
                    }
                }
                resolved
            }
            StmtKind::Call(call) => {
                let callee_preserves = call
                    .signature
                    .as_ref()
                    // unknown callees start out preserving everything
                    .map_or(true, |sig| sig.preserves(base));
                if !callee_preserves {
                    return None;
                }
                // the callee hands back the value that reached the call
                let block = proc.stmts[d].block;
                let index = proc.cfg.blocks[block]
                    .stmts
                    .iter()
                    .position(|&s| s == d)?;
                let prev = reaching_def_before(proc, dom, base, block, index);
                resolve_def(proc, dom, base, prev, depth - 1)
            }
            _ => None,
        },
    }
}

/// Resolve every subscripted location inside `e` and simplify.
fn resolve_exp(
    proc: &Procedure,
    dom: &rdc_ir::DominatorInfo,
    e: &SharedExp,
    depth: usize,
) -> Option<SharedExp> {
    if depth == 0 {
        return None;
    }
    let resolved = resolve_walk(proc, dom, e, depth)?;
    Some(resolved.simplify().0)
}

fn resolve_walk(
    proc: &Procedure,
    dom: &rdc_ir::DominatorInfo,
    e: &SharedExp,
    depth: usize,
) -> Option<SharedExp> {
    if let Exp::Subscript { base, def } = &**e {
        let stripped = base.strip_subscripts();
        return resolve_def(proc, dom, &stripped, *def, depth - 1);
    }
    let mut failed = false;
    let out = e.map_children(|c| match resolve_walk(proc, dom, c, depth) {
        Some(r) => r,
        None => {
            failed = true;
            Rc::clone(c)
        }
    });
    if failed {
        None
    } else {
        Some(out)
    }
}

/// Is `loc` preserved: does its value at every return equal its value
/// on entry?
pub(crate) fn location_preserved(proc: &mut Procedure, loc: &SharedExp) -> bool {
    let dom = dominators(proc);
    let base = loc.strip_subscripts();
    let entry_value = Exp::subscript(Rc::clone(&base), SsaDef::Implicit);

    for id in proc.stmt_order() {
        let stmt = &proc.stmts[id];
        if !matches!(stmt.kind, StmtKind::Return(_)) {
            continue;
        }
        let block = stmt.block;
        let index = proc.cfg.blocks[block]
            .stmts
            .iter()
            .position(|&s| s == id)
            .unwrap_or(0);

        let def = reaching_def_before(proc, &dom, &base, block, index);
        match resolve_def(proc, &dom, &base, def, MAX_RESOLVE_DEPTH) {
            Some(value) if value.simplify().0 == entry_value => {}
            _ => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// SPPreservation
// ---------------------------------------------------------------------------

/// Stack-pointer preservation, run before the general analysis because
/// nearly every procedure restores the stack pointer and later passes
/// lean on that fact.
pub struct SPPreservationPass;

impl Pass for SPPreservationPass {
    fn id(&self) -> PassId {
        PassId::SPPreservation
    }

    fn name(&self) -> &'static str {
        "SPPreservation"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let sp = proc.sp();
        let preserved = location_preserved(proc, &sp);
        log::debug!(
            "{}: sp is {}",
            proc.name,
            if preserved { "preserved" } else { "not preserved" }
        );
        if preserved && !proc.preserved.contains(&sp) {
            proc.preserved.push(sp);
            return Ok(true);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// PreservationAnalysis
// ---------------------------------------------------------------------------

/// Decide, for every candidate location, whether the procedure
/// preserves it. Candidates are the convention's callee-saved set plus
/// every register this procedure defines.
pub struct PreservationAnalysisPass;

impl Pass for PreservationAnalysisPass {
    fn id(&self) -> PassId {
        PassId::PreservationAnalysis
    }

    fn name(&self) -> &'static str {
        "PreservationAnalysis"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut candidates: Vec<SharedExp> = proc.signature.conv.callee_saved.clone();
        let sp = proc.sp();
        if !candidates.contains(&sp) {
            candidates.push(sp);
        }
        for id in proc.stmt_order() {
            for def in proc.stmts[id].definitions() {
                let base = def.strip_subscripts();
                if base.is_reg_of() && !candidates.contains(&base) {
                    candidates.push(base);
                }
            }
        }

        let mut preserved = Vec::new();
        for loc in candidates {
            if location_preserved(proc, &loc) {
                preserved.push(loc);
            } else {
                log::trace!("{}: {} escapes", proc.name, loc);
            }
        }

        let changed = preserved != proc.preserved;
        proc.preserved = preserved;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// StrengthReductionReversal
// ---------------------------------------------------------------------------

/// Undo compiler strength reduction so emitted code reads like the
/// source: shifts by a constant become multiplications again.
pub struct StrengthReductionReversalPass;

impl Pass for StrengthReductionReversalPass {
    fn id(&self) -> PassId {
        PassId::StrengthReductionReversal
    }

    fn name(&self) -> &'static str {
        "StrengthReductionReversal"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;
        for id in proc.stmt_order() {
            let mut stmt = proc.stmts[id].clone();
            let mut stmt_changed = false;
            stmt.map_exps(|root, role| {
                if role != ExpRole::Use {
                    return Rc::clone(root);
                }
                let out = reverse_shifts(root);
                stmt_changed |= !Rc::ptr_eq(&out, root);
                out
            });
            if stmt_changed {
                proc.stmts[id] = stmt;
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn reverse_shifts(e: &SharedExp) -> SharedExp {
    let rebuilt = e.map_children(reverse_shifts);
    if let Exp::Binary {
        op: Operator::Shl,
        lhs,
        rhs,
    } = &*rebuilt
    {
        if let Some(k) = rhs.int_value() {
            if (0..63).contains(&k) {
                return Exp::binary(Operator::Mult, Rc::clone(lhs), Exp::int(1i64 << k));
            }
        }
    }
    rebuilt
}

// ---------------------------------------------------------------------------
// AssignRemoval
// ---------------------------------------------------------------------------

/// Drop assignments whose right side is the left side: the only form
/// that is unconditionally dead before liveness information exists.
pub struct AssignRemovalPass;

impl Pass for AssignRemovalPass {
    fn id(&self) -> PassId {
        PassId::AssignRemoval
    }

    fn name(&self) -> &'static str {
        "AssignRemoval"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;
        for id in proc.stmt_order() {
            if let StmtKind::Assign(a) = &proc.stmts[id].kind {
                if a.lhs == a.rhs {
                    proc.remove_stmt(id);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// DuplicateArgsRemoval
// ---------------------------------------------------------------------------

/// Remove repeated arguments from call statements.
pub struct DuplicateArgsRemovalPass;

impl Pass for DuplicateArgsRemovalPass {
    fn id(&self) -> PassId {
        PassId::DuplicateArgsRemoval
    }

    fn name(&self) -> &'static str {
        "DuplicateArgsRemoval"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;
        for id in proc.stmt_order() {
            let mut stmt = proc.stmts[id].clone();
            if let StmtKind::Call(call) = &mut stmt.kind {
                let mut seen: Vec<SharedExp> = Vec::new();
                let before = call.args.len();
                call.args.retain(|a| {
                    let key = a.lhs.strip_subscripts();
                    if seen.contains(&key) {
                        false
                    } else {
                        seen.push(key);
                        true
                    }
                });
                if call.args.len() != before {
                    proc.stmts[id] = stmt;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// ParameterSymbolMap
// ---------------------------------------------------------------------------

/// Give every declared parameter a stable symbol in the procedure's
/// symbol map.
pub struct ParameterSymbolMapPass;

impl Pass for ParameterSymbolMapPass {
    fn id(&self) -> PassId {
        PassId::ParameterSymbolMap
    }

    fn name(&self) -> &'static str {
        "ParameterSymbolMap"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut changed = false;
        let params: Vec<(SharedExp, Symbol)> = proc
            .signature
            .params
            .iter()
            .map(|p| (p.exp.strip_subscripts(), p.name))
            .collect();
        for (exp, name) in params {
            if proc.symbol_map.get(&exp) != Some(&name) {
                proc.symbol_map.insert(exp, name);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Expose a helper for tests and drivers: the resolved exit value of a
/// location, as an expression over entry values.
pub fn exit_value(proc: &mut Procedure, loc: &SharedExp) -> Option<SharedExp> {
    let dom = dominators(proc);
    let base = loc.strip_subscripts();
    let mut result = None;
    for id in proc.stmt_order() {
        let stmt = &proc.stmts[id];
        if !matches!(stmt.kind, StmtKind::Return(_)) {
            continue;
        }
        let block = stmt.block;
        let index = proc.cfg.blocks[block]
            .stmts
            .iter()
            .position(|&s| s == id)
            .unwrap_or(0);
        let def = reaching_def_before(proc, &dom, &base, block, index);
        result = resolve_def(proc, &dom, &base, def, MAX_RESOLVE_DEPTH);
    }
    result
}
