//! Branch condition kinds and flag-condition rewriting.
//!
//! Lifted branches and set-on-condition assignments arrive carrying a
//! [`BranchKind`] plus the raw machine flags terminal as their
//! condition. `cond_to_relational` turns that pair into a typed
//! comparison of the flag-setter's operands once propagation has made
//! the flag call visible.

use std::rc::Rc;

use crate::exp::{Exp, ExpExt, Operator, SharedExp};

/// Condition a branch or set instruction tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    /// equals
    Je,
    /// not equals
    Jne,
    /// signed less
    Jsl,
    /// signed less or equals
    Jsle,
    /// signed greater or equals
    Jsge,
    /// signed greater
    Jsg,
    /// unsigned less
    Jul,
    /// unsigned less or equals
    Jule,
    /// unsigned greater or equals
    Juge,
    /// unsigned greater
    Jug,
    /// minus (sign flag)
    Jmi,
    /// plus (sign flag clear)
    Jpos,
    /// overflow
    Jof,
    /// no overflow
    Jnof,
    /// even parity
    Jpar,
}

impl BranchKind {
    /// Human-readable name used by the compact printers.
    pub const fn name(self) -> &'static str {
        match self {
            BranchKind::Je => "equals",
            BranchKind::Jne => "not equals",
            BranchKind::Jsl => "signed less",
            BranchKind::Jsle => "signed less or equals",
            BranchKind::Jsge => "signed greater or equals",
            BranchKind::Jsg => "signed greater",
            BranchKind::Jul => "unsigned less",
            BranchKind::Jule => "unsigned less or equals",
            BranchKind::Juge => "unsigned greater or equals",
            BranchKind::Jug => "unsigned greater",
            BranchKind::Jmi => "minus",
            BranchKind::Jpos => "plus",
            BranchKind::Jof => "overflow",
            BranchKind::Jnof => "no overflow",
            BranchKind::Jpar => "ev parity",
        }
    }

    /// Signed counterpart of the four unsigned kinds; every other kind
    /// maps to itself.
    pub const fn to_signed(self) -> BranchKind {
        match self {
            BranchKind::Jul => BranchKind::Jsl,
            BranchKind::Jule => BranchKind::Jsle,
            BranchKind::Juge => BranchKind::Jsge,
            BranchKind::Jug => BranchKind::Jsg,
            other => other,
        }
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            BranchKind::Jsl | BranchKind::Jsle | BranchKind::Jsge | BranchKind::Jsg
        )
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(
            self,
            BranchKind::Jul | BranchKind::Jule | BranchKind::Juge | BranchKind::Jug
        )
    }

    /// The comparison operator for a `SUBFLAGS(a, b)` setter, when this
    /// kind has a direct relational form.
    pub fn relational_op(self) -> Option<Operator> {
        Some(match self {
            BranchKind::Je => Operator::Equals,
            BranchKind::Jne => Operator::NotEqual,
            BranchKind::Jsl => Operator::Less,
            BranchKind::Jsle => Operator::LessEq,
            BranchKind::Jsge => Operator::GreaterEq,
            BranchKind::Jsg => Operator::Greater,
            BranchKind::Jul => Operator::LessUns,
            BranchKind::Jule => Operator::LessEqUns,
            BranchKind::Juge => Operator::GreaterEqUns,
            BranchKind::Jug => Operator::GreaterUns,
            // Jmi/Jpos test the sign of the subtraction result and are
            // handled separately; the overflow and parity kinds have no
            // relational form at all.
            _ => return None,
        })
    }
}

/// Flag-setter names the front ends emit.
pub const SUBFLAGS: &str = "SUBFLAGS";
pub const SETFFLAGS: &str = "SETFFLAGS";
pub const LOGICALFLAGS: &str = "LOGICALFLAGS";

/// Rewrite a flag-based condition into a typed relational expression.
///
/// `cond` is expected to contain (or be) a flag call such as
/// `SUBFLAGS(a, b)`. Returns the relational form, or `None` for the
/// kinds without one (overflow, no-overflow, parity), for which the
/// caller keeps the raw condition and reports no synthesis.
pub fn cond_to_relational(cond: &SharedExp, kind: BranchKind) -> Option<SharedExp> {
    let call = find_flag_call(cond)?;
    let (name, args) = call.as_flag_call()?;
    let items = args.list_items();

    match name.as_str() {
        SUBFLAGS | SETFFLAGS => {
            let a = Rc::clone(items.first()?);
            let b = Rc::clone(items.get(1)?);
            if let Some(op) = kind.relational_op() {
                return Some(Exp::binary(op, a, b));
            }
            match kind {
                // sign of (a - b)
                BranchKind::Jmi => Some(Exp::binary(
                    Operator::Less,
                    Exp::binary(Operator::Minus, a, b).simplify().0,
                    Exp::int(0),
                )),
                BranchKind::Jpos => Some(Exp::binary(
                    Operator::GreaterEq,
                    Exp::binary(Operator::Minus, a, b).simplify().0,
                    Exp::int(0),
                )),
                _ => None,
            }
        }
        // Flags set by a logical operation compare the result with zero.
        LOGICALFLAGS => {
            let a = Rc::clone(items.first()?);
            let op = match kind {
                BranchKind::Je => Operator::Equals,
                BranchKind::Jne => Operator::NotEqual,
                BranchKind::Jmi => Operator::Less,
                BranchKind::Jpos => Operator::GreaterEq,
                _ => kind.relational_op()?,
            };
            Some(Exp::binary(op, a, Exp::int(0)))
        }
        _ => None,
    }
}

/// First flag call inside `cond`, the condition itself included.
fn find_flag_call(cond: &SharedExp) -> Option<SharedExp> {
    let pattern = Exp::binary(
        Operator::FlagCall,
        Exp::terminal(Operator::WildStrConst),
        Exp::wild(),
    );
    cond.search(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_signed_touches_only_unsigned_kinds() {
        assert_eq!(BranchKind::Jul.to_signed(), BranchKind::Jsl);
        assert_eq!(BranchKind::Jule.to_signed(), BranchKind::Jsle);
        assert_eq!(BranchKind::Juge.to_signed(), BranchKind::Jsge);
        assert_eq!(BranchKind::Jug.to_signed(), BranchKind::Jsg);

        for kind in [
            BranchKind::Je,
            BranchKind::Jne,
            BranchKind::Jsl,
            BranchKind::Jsle,
            BranchKind::Jsge,
            BranchKind::Jsg,
            BranchKind::Jmi,
            BranchKind::Jpos,
            BranchKind::Jof,
            BranchKind::Jnof,
            BranchKind::Jpar,
        ] {
            assert_eq!(kind.to_signed(), kind);
        }
    }

    #[test]
    fn subflags_becomes_comparison() {
        let cond = Exp::flag_call(SUBFLAGS, [Exp::reg(24), Exp::reg(25)]);
        let rel = cond_to_relational(&cond, BranchKind::Jsg).expect("has relational form");
        assert_eq!(rel.to_string(), "(r24 > r25)");
    }

    #[test]
    fn minus_kind_tests_sign_of_difference() {
        let cond = Exp::flag_call(SUBFLAGS, [Exp::reg(24), Exp::int(0)]);
        let rel = cond_to_relational(&cond, BranchKind::Jmi).expect("has relational form");
        assert_eq!(rel.to_string(), "(r24 < 0)");
    }

    #[test]
    fn overflow_kinds_have_no_relational_form() {
        let cond = Exp::flag_call(SUBFLAGS, [Exp::reg(24), Exp::reg(25)]);
        assert!(cond_to_relational(&cond, BranchKind::Jof).is_none());
        assert!(cond_to_relational(&cond, BranchKind::Jnof).is_none());
        assert!(cond_to_relational(&cond, BranchKind::Jpar).is_none());
    }

    #[test]
    fn logical_flags_compare_with_zero() {
        let cond = Exp::flag_call(LOGICALFLAGS, [Exp::reg(24)]);
        let rel = cond_to_relational(&cond, BranchKind::Jne).expect("has relational form");
        assert_eq!(rel.to_string(), "(r24 ~= 0)");
    }
}
