//! The type lattice used by local type analysis.
//!
//! Types start at [`Ty::Unknown`] and are refined by constraints the
//! statements emit. Integers form a product of width and signedness;
//! `Num` sits above both integer and float for the cases where only
//! "some arithmetic value" is known. On conflicting constraints the
//! meet keeps the widest consistent supertype and reports the conflict
//! so the solver can warn.

use crate::exp::SharedExp;
use rdc_util::FxHashMap;

/// Accumulated signedness evidence is clamped to this magnitude.
const SIGNEDNESS_CLAMP: i8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    /// No information yet.
    Unknown,
    Void,
    Bool,
    /// Integer or float, width unknown.
    Num,
    /// `signedness` counts evidence: positive means signed, negative
    /// unsigned, zero undecided. `width` in bits, 0 when unknown.
    Integer { width: u16, signedness: i8 },
    Float { width: u16 },
    Pointer(Box<Ty>),
}

/// Outcome of meeting two types.
pub struct Meet {
    pub ty: Ty,
    /// The result is more specific than the left operand.
    pub refined: bool,
    /// The operands were inconsistent; `ty` is the widest supertype
    /// consistent with both.
    pub conflict: bool,
}

impl Ty {
    pub fn int(width: u16) -> Ty {
        Ty::Integer {
            width,
            signedness: 0,
        }
    }

    pub fn signed_int(width: u16) -> Ty {
        Ty::Integer {
            width,
            signedness: 1,
        }
    }

    pub fn unsigned_int(width: u16) -> Ty {
        Ty::Integer {
            width,
            signedness: -1,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Ty::Unknown)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Ty::Integer { signedness, .. } if *signedness > 0)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Ty::Integer { signedness, .. } if *signedness < 0)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::Float { .. })
    }

    /// Width in bits, 0 when not determined.
    pub fn width(&self) -> u16 {
        match self {
            Ty::Integer { width, .. } | Ty::Float { width } => *width,
            Ty::Bool => 1,
            Ty::Pointer(_) => 0,
            _ => 0,
        }
    }

    /// Accumulate signedness evidence, as branch kinds contribute it.
    pub fn bump_signed(&mut self, delta: i8) {
        if let Ty::Integer { signedness, .. } = self {
            *signedness = (*signedness + delta).clamp(-SIGNEDNESS_CLAMP, SIGNEDNESS_CLAMP);
        }
    }

    /// Meet with `other`, preferring the more specific side.
    pub fn meet(&self, other: &Ty) -> Meet {
        use Ty::*;

        let done = |ty: Ty, conflict: bool| {
            let refined = ty != *self;
            Meet {
                ty,
                refined,
                conflict,
            }
        };

        match (self, other) {
            (Unknown, t) => done(t.clone(), false),
            (_, Unknown) => done(self.clone(), false),
            (a, b) if a == b => done(self.clone(), false),

            // Num is above both integer and float.
            (Num, t @ (Integer { .. } | Float { .. } | Bool | Pointer(_))) => {
                done(t.clone(), false)
            }
            (Integer { .. } | Float { .. } | Bool | Pointer(_), Num) => done(self.clone(), false),

            (
                Integer {
                    width: w1,
                    signedness: s1,
                },
                Integer {
                    width: w2,
                    signedness: s2,
                },
            ) => {
                let conflict = *w1 != 0 && *w2 != 0 && w1 != w2;
                let width = if *w1 == 0 {
                    *w2
                } else if *w2 == 0 || conflict {
                    // widest consistent supertype on width disagreement
                    (*w1).max(*w2)
                } else {
                    *w1
                };
                let signedness = (s1 + s2).clamp(-SIGNEDNESS_CLAMP, SIGNEDNESS_CLAMP);
                done(Integer { width, signedness }, conflict)
            }

            (Float { width: w1 }, Float { width: w2 }) => {
                let conflict = *w1 != 0 && *w2 != 0 && w1 != w2;
                let width = if *w1 == 0 {
                    *w2
                } else if *w2 == 0 || conflict {
                    (*w1).max(*w2)
                } else {
                    *w1
                };
                done(Float { width }, conflict)
            }

            // A boolean is a width-1 integer when forced to be one.
            (Bool, Integer { width, .. }) | (Integer { width, .. }, Bool) => {
                if *width <= 1 {
                    done(Bool, false)
                } else {
                    done(Ty::int(*width), true)
                }
            }

            // Pointers are more specific than same-width integers.
            (Pointer(p), Pointer(q)) => {
                let inner = p.meet(q);
                done(Pointer(Box::new(inner.ty)), inner.conflict)
            }
            (Pointer(_), Integer { signedness: s, .. }) if *s <= 0 => done(self.clone(), false),
            (Integer { signedness: s, .. }, Pointer(_)) if *s <= 0 => done(other.clone(), false),

            // Anything else disagrees; Num is the widest arithmetic
            // supertype, Unknown when not even that holds.
            (Integer { .. } | Float { .. }, Integer { .. } | Float { .. }) => done(Num, true),
            _ => done(Num, true),
        }
    }
}

impl Default for Ty {
    fn default() -> Self {
        Ty::Unknown
    }
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::Unknown => write!(f, "?"),
            Ty::Void => write!(f, "void"),
            Ty::Bool => write!(f, "bool"),
            Ty::Num => write!(f, "num"),
            Ty::Integer { width, signedness } => {
                let sign = match signedness.signum() {
                    1 => "i",
                    -1 => "u",
                    _ => "int",
                };
                if *width == 0 {
                    write!(f, "{sign}")
                } else {
                    write!(f, "{sign}{width}")
                }
            }
            Ty::Float { width } if *width == 0 => write!(f, "f"),
            Ty::Float { width } => write!(f, "f{width}"),
            Ty::Pointer(inner) => write!(f, "*{inner}"),
        }
    }
}

/// Location-to-type assignment produced by type analysis.
pub type TypeMap = FxHashMap<SharedExp, Ty>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_identity() {
        let m = Ty::Unknown.meet(&Ty::signed_int(32));
        assert_eq!(m.ty, Ty::signed_int(32));
        assert!(m.refined);
        assert!(!m.conflict);
    }

    #[test]
    fn integer_below_num() {
        let m = Ty::Num.meet(&Ty::int(32));
        assert_eq!(m.ty, Ty::int(32));
        assert!(!m.conflict);
    }

    #[test]
    fn signedness_accumulates() {
        let m = Ty::signed_int(32).meet(&Ty::signed_int(32));
        match m.ty {
            Ty::Integer { signedness, .. } => assert_eq!(signedness, 2),
            other => panic!("unexpected meet result {other:?}"),
        }
    }

    #[test]
    fn width_conflict_takes_widest() {
        let m = Ty::int(16).meet(&Ty::int(32));
        assert!(m.conflict);
        assert_eq!(m.ty.width(), 32);
    }

    #[test]
    fn int_float_conflict_is_num() {
        let m = Ty::int(32).meet(&Ty::Float { width: 32 });
        assert!(m.conflict);
        assert_eq!(m.ty, Ty::Num);
    }
}
