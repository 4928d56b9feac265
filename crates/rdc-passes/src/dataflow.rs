//! SSA construction: dominators, phi placement, and renaming.

use std::rc::Rc;

use rdc_ir::{
    BlockId, DominatorInfo, Exp, ExpExt, ExpRole, Operator, PhiArg, PhiAssign, Procedure,
    SharedExp, SsaDef, StmtId, StmtKind,
};
use rdc_util::FxHashMap;

use crate::manager::{Pass, PassId};
use crate::PassError;

// ---------------------------------------------------------------------------
// Dominators
// ---------------------------------------------------------------------------

/// Compute immediate dominators and dominance frontiers; stores the
/// result on the procedure for the later SSA passes.
pub struct DominatorsPass;

impl Pass for DominatorsPass {
    fn id(&self) -> PassId {
        PassId::Dominators
    }

    fn name(&self) -> &'static str {
        "Dominators"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        proc.dominators = Some(proc.cfg.compute_dominators());
        Ok(false)
    }
}

pub(crate) fn dominators(proc: &mut Procedure) -> DominatorInfo {
    if proc.dominators.is_none() {
        proc.dominators = Some(proc.cfg.compute_dominators());
    }
    proc.dominators.clone().unwrap()
}

// ---------------------------------------------------------------------------
// PhiPlacement
// ---------------------------------------------------------------------------

/// Insert phi statements at the iterated dominance frontier of every
/// location with more than one definition.
pub struct PhiPlacementPass;

impl Pass for PhiPlacementPass {
    fn id(&self) -> PassId {
        PassId::PhiPlacement
    }

    fn name(&self) -> &'static str {
        "PhiPlacement"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let dom = dominators(proc);

        // definition sites per base location, in first-seen order
        let mut order: Vec<SharedExp> = Vec::new();
        let mut sites: FxHashMap<SharedExp, Vec<BlockId>> = FxHashMap::default();
        for block in proc.cfg.blocks.indices().collect::<Vec<_>>() {
            for &sid in &proc.cfg.blocks[block].stmts {
                for def in proc.stmts[sid].definitions() {
                    let base = def.strip_subscripts();
                    let entry = sites.entry(Rc::clone(&base)).or_insert_with(|| {
                        order.push(Rc::clone(&base));
                        Vec::new()
                    });
                    if !entry.contains(&block) {
                        entry.push(block);
                    }
                }
            }
        }

        let mut changed = false;
        for base in order {
            let defblocks = &sites[&base];
            if defblocks.len() < 2 {
                continue;
            }

            let mut worklist = defblocks.clone();
            let mut placed: Vec<BlockId> = Vec::new();
            while let Some(b) = worklist.pop() {
                if !dom.is_reachable(b) {
                    continue;
                }
                for &df in &dom.frontier[b] {
                    if placed.contains(&df) {
                        continue;
                    }
                    placed.push(df);

                    let args = proc.cfg.blocks[df]
                        .predecessors()
                        .iter()
                        .map(|&pred| PhiArg {
                            pred,
                            def: SsaDef::Implicit,
                        })
                        .collect();
                    proc.insert_stmt_at(
                        df,
                        0,
                        StmtKind::PhiAssign(PhiAssign {
                            lhs: Rc::clone(&base),
                            args,
                        }),
                    );
                    changed = true;

                    // the phi is itself a new definition site
                    if !defblocks.contains(&df) {
                        worklist.push(df);
                    }
                }
            }
        }

        if changed {
            proc.renumber();
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// BlockVarRename
// ---------------------------------------------------------------------------

/// Rename definitions and uses to SSA form: a dominator-tree pre-order
/// walk pushing a version stack per location at each definition and
/// popping on the way back up.
pub struct BlockVarRenamePass;

type VersionStacks = FxHashMap<SharedExp, Vec<SsaDef>>;

impl Pass for BlockVarRenamePass {
    fn id(&self) -> PassId {
        PassId::BlockVarRename
    }

    fn name(&self) -> &'static str {
        "BlockVarRename"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let dom = dominators(proc);
        let mut stacks = VersionStacks::default();
        let mut changed = false;
        let entry = proc.cfg.entry;
        rename_block(proc, &dom, entry, &mut stacks, &mut changed);
        Ok(changed)
    }
}

fn rename_block(
    proc: &mut Procedure,
    dom: &DominatorInfo,
    block: BlockId,
    stacks: &mut VersionStacks,
    changed: &mut bool,
) {
    let mut pushed: Vec<SharedExp> = Vec::new();

    for sid in proc.cfg.blocks[block].stmts.clone() {
        let mut stmt = proc.stmts[sid].clone();
        let before = stmt.clone();

        stmt.map_exps(|root, role| match role {
            ExpRole::Use => rename_exp(root, stacks),
            ExpRole::Def => rename_def(root, sid, stacks, &mut pushed),
        });

        if stmt != before {
            *changed = true;
            proc.stmts[sid] = stmt;
        }
    }

    // fill this block's slot in each successor's phis
    for succ in proc.cfg.blocks[block].successors().to_vec() {
        for sid in proc.cfg.blocks[succ].stmts.clone() {
            let mut stmt = proc.stmts[sid].clone();
            let StmtKind::PhiAssign(phi) = &mut stmt.kind else {
                // phis sit at the front of the block
                break;
            };
            let base = phi.lhs.strip_subscripts();
            let def = top(stacks, &base);
            for arg in phi.args.iter_mut().filter(|a| a.pred == block) {
                if arg.def != def {
                    arg.def = def;
                    *changed = true;
                }
            }
            proc.stmts[sid] = stmt;
        }
    }

    for &child in &dom.children[block] {
        rename_block(proc, dom, child, stacks, changed);
    }

    for key in pushed.into_iter().rev() {
        if let Some(stack) = stacks.get_mut(&key) {
            stack.pop();
        }
    }
}

fn top(stacks: &VersionStacks, key: &SharedExp) -> SsaDef {
    stacks
        .get(key)
        .and_then(|s| s.last())
        .copied()
        .unwrap_or(SsaDef::Implicit)
}

/// Subscript every location in a value position with its reaching
/// definition. Locations already subscripted are left alone, so the
/// pass is idempotent.
pub(crate) fn rename_exp(e: &SharedExp, stacks: &VersionStacks) -> SharedExp {
    if e.is_subscript() {
        return Rc::clone(e);
    }
    match &**e {
        Exp::Unary {
            op: Operator::RegOf,
            ..
        }
        | Exp::Terminal(Operator::Flags)
        | Exp::Terminal(Operator::FFlags)
        | Exp::Terminal(Operator::Pc) => Exp::subscript(Rc::clone(e), top(stacks, e)),
        Exp::Unary {
            op: Operator::MemOf,
            sub,
        } => {
            let addr = rename_exp(sub, stacks);
            let loc = Exp::mem_of(addr);
            let key = loc.strip_subscripts();
            let def = top(stacks, &key);
            Exp::subscript(loc, def)
        }
        _ => e.map_children(|c| rename_exp(c, stacks)),
    }
}

fn rename_def(
    lhs: &SharedExp,
    sid: StmtId,
    stacks: &mut VersionStacks,
    pushed: &mut Vec<SharedExp>,
) -> SharedExp {
    // already renamed: re-push the existing version so later uses in
    // this subtree still resolve
    if let Exp::Subscript { base, def } = &**lhs {
        let key = base.strip_subscripts();
        stacks.entry(Rc::clone(&key)).or_default().push(*def);
        pushed.push(key);
        return Rc::clone(lhs);
    }

    let loc = match &**lhs {
        Exp::Unary {
            op: Operator::MemOf,
            sub,
        } => Exp::mem_of(rename_exp(sub, stacks)),
        _ => Rc::clone(lhs),
    };
    let key = loc.strip_subscripts();
    stacks
        .entry(Rc::clone(&key))
        .or_default()
        .push(SsaDef::Stmt(sid));
    pushed.push(key);
    Exp::subscript(loc, SsaDef::Stmt(sid))
}
