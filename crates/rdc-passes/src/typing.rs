//! Local type analysis.
//!
//! Every statement contributes constraints: `typeof(x) = T` from
//! constants, casts and condition kinds, and `typeof(x) = typeof(y)`
//! from copies. Equalities are solved by union-find over location
//! keys; type facts are met on the lattice, and a conflict keeps the
//! widest consistent supertype and logs a warning.

use std::rc::Rc;

use rdc_ir::{
    Exp, ExpExt, ExpRole, Procedure, SharedExp, StmtKind, Ty, TypeMap,
};
use rdc_util::FxHashMap;

use crate::manager::{Pass, PassId};
use crate::PassError;

pub struct LocalTypeAnalysisPass;

impl Pass for LocalTypeAnalysisPass {
    fn id(&self) -> PassId {
        PassId::LocalTypeAnalysis
    }

    fn name(&self) -> &'static str {
        "LocalTypeAnalysis"
    }

    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError> {
        let mut types = proc.types.clone();
        let mut equalities = UnionFind::default();
        let mut changed = false;

        // Round one gathers facts and equalities; round two repeats the
        // descent so signedness learned late still reaches every
        // comparison, and applies the expression rewrites.
        for round in 0..2 {
            let apply = round == 1;
            for id in proc.stmt_order() {
                let mut stmt = proc.stmts[id].clone();
                let mut stmt_changed = false;

                match &stmt.kind {
                    StmtKind::Assign(a) => {
                        let hint = a
                            .ty
                            .clone()
                            .or_else(|| types.get(&a.lhs).cloned())
                            .unwrap_or(Ty::Unknown);
                        let (_, ch) = a.rhs.descend_type(&hint, &mut types);
                        changed |= ch;

                        if rdc_ir::is_location(&a.rhs) {
                            equalities.union(&a.lhs, &a.rhs);
                        } else {
                            let estimate = infer_exp(&a.rhs, &types);
                            record(&mut types, &a.lhs, &estimate, &mut changed);
                        }
                    }
                    StmtKind::BoolAssign(b) => {
                        // the destination holds the truth value itself
                        record(&mut types, &b.lhs, &Ty::Bool, &mut changed);
                        let (_, ch) = b.cond.descend_type(&Ty::Bool, &mut types);
                        changed |= ch;
                    }
                    StmtKind::Branch(b) => {
                        let (_, ch) = b.cond.descend_type(&Ty::Bool, &mut types);
                        changed |= ch;
                    }
                    StmtKind::Call(c) => {
                        if let Some(sig) = &c.signature {
                            for (arg, param) in c.args.iter().zip(sig.params.iter()) {
                                record(&mut types, &arg.lhs, &param.ty, &mut changed);
                                let (_, ch) = arg.rhs.descend_type(&param.ty, &mut types);
                                changed |= ch;
                            }
                        }
                    }
                    StmtKind::Return(r) => {
                        let declared: Vec<Ty> = proc
                            .signature
                            .returns
                            .iter()
                            .map(|ret| ret.ty.clone())
                            .collect();
                        for (ret, ty) in r.returns.iter().zip(declared.iter()) {
                            record(&mut types, &ret.lhs, ty, &mut changed);
                            let (_, ch) = ret.rhs.descend_type(ty, &mut types);
                            changed |= ch;
                        }
                    }
                    _ => {}
                }

                if apply {
                    stmt.map_exps(|root, role| {
                        if role != ExpRole::Use {
                            return Rc::clone(root);
                        }
                        let hint = types.get(root).cloned().unwrap_or(Ty::Unknown);
                        let (out, ch) = root.descend_type(&hint, &mut types);
                        stmt_changed |= ch && !Rc::ptr_eq(&out, root);
                        out
                    });
                }

                if stmt_changed {
                    proc.stmts[id] = stmt;
                    changed = true;
                }
            }
        }

        // Solve the equalities: every member of a class gets the meet
        // of the class's accumulated types.
        for class in equalities.classes() {
            let mut merged = Ty::Unknown;
            for loc in &class {
                if let Some(t) = types.get(loc) {
                    let meet = merged.meet(t);
                    if meet.conflict {
                        log::warn!(
                            "type conflict between equal locations ({}): {} vs {}",
                            loc,
                            merged,
                            t
                        );
                    }
                    merged = meet.ty;
                }
            }
            if merged.is_unknown() {
                continue;
            }
            for loc in class {
                let entry = types.entry(loc).or_default();
                let meet = entry.meet(&merged);
                changed |= meet.refined;
                *entry = meet.ty;
            }
        }

        let table_changed = types != proc.types;
        proc.types = types;
        Ok(changed || table_changed)
    }
}

fn record(types: &mut TypeMap, loc: &SharedExp, ty: &Ty, changed: &mut bool) {
    if ty.is_unknown() || !rdc_ir::is_location(loc) {
        return;
    }
    let entry = types.entry(Rc::clone(loc)).or_default();
    let meet = entry.meet(ty);
    if meet.conflict {
        log::warn!("type conflict at {loc}: {entry} vs {ty}, keeping {}", meet.ty);
    }
    *changed |= meet.refined;
    *entry = meet.ty;
}

/// Bottom-up estimate of an expression's type.
fn infer_exp(e: &SharedExp, types: &TypeMap) -> Ty {
    use rdc_ir::Operator::*;

    if rdc_ir::is_location(e) {
        return types.get(e).cloned().unwrap_or(Ty::Unknown);
    }
    match &**e {
        Exp::Const(rdc_ir::Const::Int(_)) => Ty::int(0),
        Exp::Const(rdc_ir::Const::Flt(_)) => Ty::Float { width: 0 },
        Exp::Terminal(True) | Exp::Terminal(False) => Ty::Bool,
        Exp::Binary { op, lhs, rhs } => match op {
            Equals | NotEqual | Less | Greater | LessEq | GreaterEq | LessUns | GreaterUns
            | LessEqUns | GreaterEqUns | And | Or => Ty::Bool,
            SizeCast => match lhs.int_value() {
                Some(w) => Ty::int(w as u16),
                None => Ty::Unknown,
            },
            Plus | Minus | Mult | Mults | Div | Divs | Mod | Mods => {
                let l = infer_exp(lhs, types);
                let r = infer_exp(rhs, types);
                l.meet(&r).ty
            }
            _ => Ty::Unknown,
        },
        Exp::Unary { op: LNot, .. } => Ty::Bool,
        Exp::Unary { op: Neg, sub } => infer_exp(sub, types),
        Exp::Ternary { snd, trd, .. } => {
            infer_exp(snd, types).meet(&infer_exp(trd, types)).ty
        }
        _ => Ty::Unknown,
    }
}

/// Union-find over location keys, for `typeof(x) = typeof(y)`.
#[derive(Default)]
struct UnionFind {
    keys: Vec<SharedExp>,
    index: FxHashMap<SharedExp, usize>,
    parent: Vec<usize>,
}

impl UnionFind {
    fn slot(&mut self, loc: &SharedExp) -> usize {
        if let Some(&i) = self.index.get(loc) {
            return i;
        }
        let i = self.keys.len();
        self.keys.push(Rc::clone(loc));
        self.index.insert(Rc::clone(loc), i);
        self.parent.push(i);
        i
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: &SharedExp, b: &SharedExp) {
        let (ia, ib) = (self.slot(a), self.slot(b));
        let (ra, rb) = (self.find(ia), self.find(ib));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    /// Equivalence classes with at least two members.
    fn classes(&mut self) -> Vec<Vec<SharedExp>> {
        let mut by_root: FxHashMap<usize, Vec<SharedExp>> = FxHashMap::default();
        for i in 0..self.keys.len() {
            let root = self.find(i);
            by_root
                .entry(root)
                .or_default()
                .push(Rc::clone(&self.keys[i]));
        }
        let mut classes: Vec<Vec<SharedExp>> =
            by_root.into_values().filter(|c| c.len() > 1).collect();
        classes.sort_by_key(|c| c.len());
        classes
    }
}
