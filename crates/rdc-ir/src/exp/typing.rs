//! Top-down type descent over expressions.
//!
//! `descend_type` pushes a type hint from the root of an expression
//! towards its leaves, recording what it learns about locations in a
//! [`TypeMap`]. It also performs the one type-directed rewrite the
//! algebra owns: an unsigned comparison whose operands are known signed
//! integers becomes the signed comparison, with the change reported.

use std::rc::Rc;

use super::{Exp, Operator, SharedExp};
use crate::ty::{Ty, TypeMap};

/// Record `hint` for `e` and descend into children with derived hints.
/// Returns the (possibly rewritten) expression and whether anything
/// was learned or rewritten.
pub(super) fn descend_type(e: &SharedExp, hint: &Ty, types: &mut TypeMap) -> (SharedExp, bool) {
    use Operator::*;

    let mut changed = false;

    // Locations absorb the hint directly.
    if is_location(e) {
        changed |= record(types, e, hint);
        // The address inside a dereference is pointer-shaped.
        if let Exp::Unary { op: MemOf, sub } = &**e {
            let (_, ch) = descend_type(sub, &Ty::Pointer(Box::new(hint.clone())), types);
            changed |= ch;
        }
        return (Rc::clone(e), changed);
    }

    match &**e {
        Exp::Unary { op, sub } => {
            let sub_hint = match op {
                Neg => Ty::signed_int(hint.width()),
                BitNot => Ty::int(hint.width()),
                LNot => Ty::Bool,
                _ => Ty::Unknown,
            };
            let (new_sub, ch) = descend_type(sub, &sub_hint, types);
            changed |= ch;
            let out = if Rc::ptr_eq(&new_sub, sub) {
                Rc::clone(e)
            } else {
                Exp::unary(*op, new_sub)
            };
            (out, changed)
        }

        Exp::Binary { op, lhs, rhs } => {
            // Unsigned comparison over operands already known to be
            // signed: rewrite into the signed family before pushing
            // hints, so the signedness evidence is not diluted.
            let mut op = *op;
            if op.is_unsigned_relational() && known_signed(types, lhs) && known_signed(types, rhs)
            {
                op = op.to_signed();
                changed = true;
            }

            let (lhint, rhint) = binary_hints(op, hint);
            let (new_lhs, ch1) = descend_type(lhs, &lhint, types);
            let (new_rhs, ch2) = descend_type(rhs, &rhint, types);
            changed |= ch1 | ch2;

            let out = if op == e.op() && Rc::ptr_eq(&new_lhs, lhs) && Rc::ptr_eq(&new_rhs, rhs) {
                Rc::clone(e)
            } else {
                Exp::binary(op, new_lhs, new_rhs)
            };
            (out, changed)
        }

        Exp::Ternary {
            op: Tern,
            fst,
            snd,
            trd,
        } => {
            let (new_fst, ch1) = descend_type(fst, &Ty::Bool, types);
            let (new_snd, ch2) = descend_type(snd, hint, types);
            let (new_trd, ch3) = descend_type(trd, hint, types);
            changed |= ch1 | ch2 | ch3;
            let out = if Rc::ptr_eq(&new_fst, fst)
                && Rc::ptr_eq(&new_snd, snd)
                && Rc::ptr_eq(&new_trd, trd)
            {
                Rc::clone(e)
            } else {
                Exp::tern(new_fst, new_snd, new_trd)
            };
            (out, changed)
        }

        _ => (Rc::clone(e), changed),
    }
}

/// Expressions that name a storage location and so can carry a type.
pub fn is_location(e: &Exp) -> bool {
    match e {
        Exp::Subscript { .. } => true,
        Exp::Unary {
            op: Operator::RegOf | Operator::MemOf | Operator::LocalVar,
            ..
        } => true,
        Exp::Terminal(Operator::Flags | Operator::FFlags) => true,
        _ => false,
    }
}

fn record(types: &mut TypeMap, loc: &SharedExp, hint: &Ty) -> bool {
    if hint.is_unknown() {
        return false;
    }
    let entry = types.entry(Rc::clone(loc)).or_default();
    let meet = entry.meet(hint);
    if meet.conflict {
        log::warn!(
            "type conflict at {loc}: {entry} vs {hint}, keeping {}",
            meet.ty
        );
    }
    let refined = meet.refined;
    *entry = meet.ty;
    refined
}

fn known_signed(types: &TypeMap, e: &SharedExp) -> bool {
    types.get(e).is_some_and(|t| t.is_signed())
}

/// Hints for the two children of a binary operator.
fn binary_hints(op: Operator, hint: &Ty) -> (Ty, Ty) {
    use Operator::*;
    match op {
        Plus | Minus => {
            let h = if hint.is_unknown() {
                Ty::Num
            } else {
                hint.clone()
            };
            (h.clone(), h)
        }
        Mult | Div | Mod => (Ty::int(0), Ty::int(0)),
        Mults | Divs | Mods => (Ty::signed_int(0), Ty::signed_int(0)),
        BitAnd | BitOr | BitXor => (Ty::int(hint.width()), Ty::int(hint.width())),
        Shl | Shr | Shra => (Ty::int(hint.width()), Ty::unsigned_int(0)),
        Less | Greater | LessEq | GreaterEq => (Ty::signed_int(0), Ty::signed_int(0)),
        LessUns | GreaterUns | LessEqUns | GreaterEqUns => {
            (Ty::unsigned_int(0), Ty::unsigned_int(0))
        }
        Equals | NotEqual => (Ty::Unknown, Ty::Unknown),
        And | Or => (Ty::Bool, Ty::Bool),
        _ => (Ty::Unknown, Ty::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exp::{ExpExt, SsaDef};

    #[test]
    fn records_relational_signedness() {
        let a = Exp::subscript(Exp::reg(24), SsaDef::Implicit);
        let b = Exp::subscript(Exp::reg(25), SsaDef::Implicit);
        let cmp = Exp::binary(Operator::Less, Rc::clone(&a), Rc::clone(&b));

        let mut types = TypeMap::default();
        let (_, changed) = cmp.descend_type(&Ty::Bool, &mut types);
        assert!(changed);
        assert!(types.get(&a).unwrap().is_signed());
        assert!(types.get(&b).unwrap().is_signed());
    }

    #[test]
    fn unsigned_comparison_becomes_signed_when_types_dictate() {
        let a = Exp::subscript(Exp::reg(24), SsaDef::Implicit);
        let b = Exp::subscript(Exp::reg(25), SsaDef::Implicit);
        let mut types = TypeMap::default();
        types.insert(Rc::clone(&a), Ty::signed_int(32));
        types.insert(Rc::clone(&b), Ty::signed_int(32));

        let cmp = Exp::binary(Operator::LessUns, Rc::clone(&a), Rc::clone(&b));
        let (out, changed) = cmp.descend_type(&Ty::Bool, &mut types);
        assert!(changed);
        assert_eq!(out.op(), Operator::Less);
    }

    #[test]
    fn memof_address_gets_pointer_hint() {
        let addr = Exp::subscript(Exp::reg(28), SsaDef::Implicit);
        let loc = Exp::mem_of(Rc::clone(&addr));
        let mut types = TypeMap::default();
        let (_, changed) = loc.descend_type(&Ty::int(32), &mut types);
        assert!(changed);
        assert!(matches!(types.get(&addr), Some(Ty::Pointer(_))));
    }
}
