//! Algebraic simplification.
//!
//! `simplify` is total and idempotent: it never fails, and running it on
//! its own output reports no change. Rewrites happen bottom-up, with an
//! outer fixed-point loop because one local rule can expose another
//! (constant gathering after `x - k` normalisation, for instance).

use std::rc::Rc;

use super::{Exp, ExpExt, Operator, SharedExp};

/// Outer fixed-point cap. Each round strictly shrinks or canonicalises
/// the tree, so this bound is never hit in practice.
const MAX_ROUNDS: usize = 16;

/// Simplify to a canonical form. The flag reports whether the result
/// differs structurally from the input.
pub(super) fn simplify(e: &SharedExp) -> (SharedExp, bool) {
    let mut current = Rc::clone(e);
    for _ in 0..MAX_ROUNDS {
        let next = simplify_walk(&current);
        if *next == *current {
            break;
        }
        current = next;
    }
    let changed = *current != **e;
    (current, changed)
}

fn simplify_walk(e: &SharedExp) -> SharedExp {
    let rebuilt = e.map_children(|c| simplify_walk(c));
    simplify_node(&rebuilt)
}

fn bool_terminal(value: bool) -> SharedExp {
    Exp::terminal(if value {
        Operator::True
    } else {
        Operator::False
    })
}

/// Apply local rules at one node whose children are already simplified.
fn simplify_node(e: &SharedExp) -> SharedExp {
    use Operator::*;

    match &**e {
        Exp::Unary { op, sub } => simplify_unary(e, *op, sub),
        Exp::Binary { op, lhs, rhs } => simplify_binary(e, *op, lhs, rhs),
        Exp::Ternary {
            op: Tern,
            fst,
            snd,
            trd,
        } => {
            if fst.is_terminal(True) {
                return Rc::clone(snd);
            }
            if fst.is_terminal(False) {
                return Rc::clone(trd);
            }
            if snd == trd {
                return Rc::clone(snd);
            }
            Rc::clone(e)
        }
        _ => Rc::clone(e),
    }
}

fn simplify_unary(e: &SharedExp, op: Operator, sub: &SharedExp) -> SharedExp {
    use Operator::*;

    match op {
        Neg => {
            if let Some(v) = sub.int_value() {
                return Exp::int(v.wrapping_neg());
            }
            if let Some(v) = sub.flt_value() {
                return Exp::flt(-v);
            }
            if let Exp::Unary { op: Neg, sub: inner } = &**sub {
                return Rc::clone(inner);
            }
            Rc::clone(e)
        }
        BitNot => {
            if let Some(v) = sub.int_value() {
                return Exp::int(!v);
            }
            if let Exp::Unary {
                op: BitNot,
                sub: inner,
            } = &**sub
            {
                return Rc::clone(inner);
            }
            Rc::clone(e)
        }
        LNot => {
            if sub.is_terminal(True) {
                return bool_terminal(false);
            }
            if sub.is_terminal(False) {
                return bool_terminal(true);
            }
            if let Exp::Unary { op: LNot, sub: inner } = &**sub {
                return Rc::clone(inner);
            }
            // not(a < b) becomes a >= b, and so on
            if let Exp::Binary { op, lhs, rhs } = &**sub {
                if let Some(inv) = op.inverted() {
                    return Exp::binary(inv, Rc::clone(lhs), Rc::clone(rhs));
                }
                // De Morgan, only where it shortens
                if *op == And || *op == Or {
                    if let (
                        Exp::Unary { op: LNot, sub: a },
                        Exp::Unary { op: LNot, sub: b },
                    ) = (&**lhs, &**rhs)
                    {
                        let dual = if *op == And { Or } else { And };
                        return Exp::binary(dual, Rc::clone(a), Rc::clone(b));
                    }
                }
            }
            Rc::clone(e)
        }
        MemOf => {
            if let Exp::Unary {
                op: AddrOf,
                sub: inner,
            } = &**sub
            {
                return Rc::clone(inner);
            }
            Rc::clone(e)
        }
        AddrOf => {
            if let Exp::Unary {
                op: MemOf,
                sub: inner,
            } = &**sub
            {
                return Rc::clone(inner);
            }
            Rc::clone(e)
        }
        _ => Rc::clone(e),
    }
}

fn simplify_binary(e: &SharedExp, op: Operator, lhs: &SharedExp, rhs: &SharedExp) -> SharedExp {
    use Operator::*;

    // Constant folding first; everything below may assume at most one
    // constant operand.
    if let (Some(a), Some(b)) = (lhs.int_value(), rhs.int_value()) {
        if let Some(folded) = fold_int(op, a, b) {
            return folded;
        }
    }
    if let (Some(a), Some(b)) = (lhs.flt_value(), rhs.flt_value()) {
        if let Some(folded) = fold_flt(op, a, b) {
            return folded;
        }
    }

    // Flag-call pseudo-functions with constant arguments
    if op == FlagCall {
        if let Some(folded) = fold_flag_call(lhs, rhs) {
            return folded;
        }
    }

    // x - k  ==>  x + (-k), so constant gathering sees one operator
    if op == Minus {
        if let Some(k) = rhs.int_value() {
            if k != 0 {
                return Exp::binary(Plus, Rc::clone(lhs), Exp::int(k.wrapping_neg()));
            }
        }
    }

    // Commutative canonical form: constant on the right
    if op.is_commutative() && lhs.is_int_const() && !rhs.is_int_const() {
        return Exp::binary(op, Rc::clone(rhs), Rc::clone(lhs));
    }

    // Left-leaning associative chains: a op (b op c) ==> (a op b) op c
    if op.is_associative() {
        if let Exp::Binary {
            op: rop,
            lhs: b,
            rhs: c,
        } = &**rhs
        {
            if *rop == op {
                return Exp::binary(
                    op,
                    Exp::binary(op, Rc::clone(lhs), Rc::clone(b)),
                    Rc::clone(c),
                );
            }
        }
        // Constant gathering: (x op k1) op k2 ==> x op (k1 op k2)
        if let (
            Exp::Binary {
                op: lop,
                lhs: x,
                rhs: k1,
            },
            Some(_),
        ) = (&**lhs, rhs.int_value())
        {
            if *lop == op && k1.is_int_const() {
                if let Some(folded) = fold_int(op, k1.int_value().unwrap(), rhs.int_value().unwrap())
                {
                    return Exp::binary(op, Rc::clone(x), folded);
                }
            }
        }
    }

    match op {
        Plus => {
            if rhs.int_value() == Some(0) {
                return Rc::clone(lhs);
            }
            if lhs.int_value() == Some(0) {
                return Rc::clone(rhs);
            }
            if lhs == rhs {
                return Exp::binary(Mult, Rc::clone(lhs), Exp::int(2));
            }
        }
        Minus => {
            if rhs.int_value() == Some(0) {
                return Rc::clone(lhs);
            }
            if lhs == rhs {
                return Exp::int(0);
            }
        }
        Mult | Mults => {
            if rhs.int_value() == Some(1) {
                return Rc::clone(lhs);
            }
            if lhs.int_value() == Some(1) {
                return Rc::clone(rhs);
            }
            if rhs.int_value() == Some(0) || lhs.int_value() == Some(0) {
                return Exp::int(0);
            }
        }
        Div | Divs => {
            if rhs.int_value() == Some(1) {
                return Rc::clone(lhs);
            }
        }
        Mod | Mods => {
            if rhs.int_value() == Some(1) {
                return Exp::int(0);
            }
        }
        BitAnd => {
            if rhs.int_value() == Some(0) {
                return Exp::int(0);
            }
            if rhs.int_value() == Some(-1) {
                return Rc::clone(lhs);
            }
            if lhs == rhs {
                return Rc::clone(lhs);
            }
        }
        BitOr => {
            if rhs.int_value() == Some(0) {
                return Rc::clone(lhs);
            }
            if rhs.int_value() == Some(-1) {
                return Exp::int(-1);
            }
            if lhs == rhs {
                return Rc::clone(lhs);
            }
        }
        BitXor => {
            if rhs.int_value() == Some(0) {
                return Rc::clone(lhs);
            }
            if lhs == rhs {
                return Exp::int(0);
            }
        }
        Shl | Shr | Shra => {
            if rhs.int_value() == Some(0) {
                return Rc::clone(lhs);
            }
            if lhs.int_value() == Some(0) {
                return Exp::int(0);
            }
        }
        And => {
            if lhs.is_terminal(True) {
                return Rc::clone(rhs);
            }
            if rhs.is_terminal(True) {
                return Rc::clone(lhs);
            }
            if lhs.is_terminal(False) || rhs.is_terminal(False) {
                return bool_terminal(false);
            }
            if lhs == rhs {
                return Rc::clone(lhs);
            }
        }
        Or => {
            if lhs.is_terminal(False) {
                return Rc::clone(rhs);
            }
            if rhs.is_terminal(False) {
                return Rc::clone(lhs);
            }
            if lhs.is_terminal(True) || rhs.is_terminal(True) {
                return bool_terminal(true);
            }
            if lhs == rhs {
                return Rc::clone(lhs);
            }
        }
        Equals => {
            if lhs == rhs {
                return bool_terminal(true);
            }
        }
        NotEqual => {
            if lhs == rhs {
                return bool_terminal(false);
            }
        }
        Less | Greater | LessUns | GreaterUns => {
            if lhs == rhs {
                return bool_terminal(false);
            }
        }
        LessEq | GreaterEq | LessEqUns | GreaterEqUns => {
            if lhs == rhs {
                return bool_terminal(true);
            }
        }
        SizeCast => {
            // size(w, size(w2, x)) ==> size(w, x)
            if let Exp::Binary {
                op: SizeCast,
                rhs: inner,
                ..
            } = &**rhs
            {
                return Exp::binary(SizeCast, Rc::clone(lhs), Rc::clone(inner));
            }
            if let (Some(w), Some(v)) = (lhs.int_value(), rhs.int_value()) {
                if (1..64).contains(&w) {
                    let mask = (1i64 << w) - 1;
                    return Exp::int(v & mask);
                }
                if w >= 64 {
                    return Rc::clone(rhs);
                }
            }
        }
        _ => {}
    }

    Rc::clone(e)
}

fn fold_int(op: Operator, a: i64, b: i64) -> Option<SharedExp> {
    use Operator::*;
    let v = match op {
        Plus => a.wrapping_add(b),
        Minus => a.wrapping_sub(b),
        Mult | Mults => a.wrapping_mul(b),
        Div => {
            if b == 0 {
                return None;
            }
            ((a as u64).wrapping_div(b as u64)) as i64
        }
        Divs => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        Mod => {
            if b == 0 {
                return None;
            }
            ((a as u64).wrapping_rem(b as u64)) as i64
        }
        Mods => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        BitAnd => a & b,
        BitOr => a | b,
        BitXor => a ^ b,
        Shl => {
            if !(0..64).contains(&b) {
                return None;
            }
            a.wrapping_shl(b as u32)
        }
        Shr => {
            if !(0..64).contains(&b) {
                return None;
            }
            ((a as u64).wrapping_shr(b as u32)) as i64
        }
        Shra => {
            if !(0..64).contains(&b) {
                return None;
            }
            a.wrapping_shr(b as u32)
        }
        Equals => return Some(bool_terminal(a == b)),
        NotEqual => return Some(bool_terminal(a != b)),
        Less => return Some(bool_terminal(a < b)),
        Greater => return Some(bool_terminal(a > b)),
        LessEq => return Some(bool_terminal(a <= b)),
        GreaterEq => return Some(bool_terminal(a >= b)),
        LessUns => return Some(bool_terminal((a as u64) < b as u64)),
        GreaterUns => return Some(bool_terminal(a as u64 > b as u64)),
        LessEqUns => return Some(bool_terminal(a as u64 <= b as u64)),
        GreaterEqUns => return Some(bool_terminal(a as u64 >= b as u64)),
        _ => return None,
    };
    Some(Exp::int(v))
}

fn fold_flt(op: Operator, a: f64, b: f64) -> Option<SharedExp> {
    use Operator::*;
    let v = match op {
        Plus => a + b,
        Minus => a - b,
        Mult => a * b,
        Div => {
            if b == 0.0 {
                return None;
            }
            a / b
        }
        Equals => return Some(bool_terminal(a == b)),
        NotEqual => return Some(bool_terminal(a != b)),
        Less => return Some(bool_terminal(a < b)),
        Greater => return Some(bool_terminal(a > b)),
        LessEq => return Some(bool_terminal(a <= b)),
        GreaterEq => return Some(bool_terminal(a >= b)),
        _ => return None,
    };
    Some(Exp::flt(v))
}

/// Evaluate `plus`/`neg` pseudo-functions over constant arguments.
/// The type-directed pair (`memberAtOffset`, `offsetToMember`) needs a
/// compound type value, which only the transformer's bindings can
/// supply; it is handled there.
fn fold_flag_call(name: &SharedExp, args: &SharedExp) -> Option<SharedExp> {
    let name = name.str_value()?;
    let items = args.list_items();
    match name.as_str() {
        "plus" => {
            let (a, b) = (items.first()?.int_value()?, items.get(1)?.int_value()?);
            Some(Exp::int(a.wrapping_add(b)))
        }
        "neg" => {
            let a = items.first()?.int_value()?;
            Some(Exp::int(a.wrapping_neg()))
        }
        _ => None,
    }
}
