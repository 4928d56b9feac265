//! Expression trees.
//!
//! Expressions are immutable and structurally shared behind [`Rc`];
//! every rewrite builds a new root and leaves the old tree intact, so a
//! statement can hand subtrees to a pass without defensive copies.
//! Equality and hashing are structural, which makes expressions usable
//! directly as map keys (location sets, type maps, rename stacks).
//!
//! The tree-walking operations (search, replacement, unification,
//! simplification, type descent) live on [`ExpExt`], implemented for
//! [`SharedExp`], because they return shared subtrees and need the
//! reference-counted handle rather than a plain reference.
//!
//! The operator set is a single closed enumeration shared by the IR and
//! by the rewrite rules; the printable operator names are derived from
//! it so the two can never drift apart.

mod matching;
mod simplify;
mod typing;

pub use matching::Bindings;
pub use typing::is_location;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rdc_util::Symbol;

use crate::ty::{Ty, TypeMap};
use crate::StmtId;

pub type SharedExp = Rc<Exp>;

/// Operator tags. Arity is fixed per tag; see [`Exp`] for which node
/// shapes carry which tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    // Arithmetic. The plain forms are signedness-agnostic; the `s`
    // variants are explicitly signed where the machine distinguishes.
    Plus,
    Minus,
    Mult,
    Mults,
    Div,
    Divs,
    Mod,
    Mods,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    Shra,

    // Logical
    And,
    Or,
    LNot,

    // Relational, signed family then unsigned family
    Equals,
    NotEqual,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    LessUns,
    GreaterUns,
    LessEqUns,
    GreaterEqUns,

    // Unary constructors
    Neg,
    SizeCast,
    TypeOf,
    KindOf,
    AddrOf,
    MemOf,
    RegOf,
    LocalVar,
    Var,

    // Leaves
    IntConst,
    StrConst,
    FltConst,
    TypeVal,
    Flags,
    FFlags,
    Pc,
    True,
    False,
    Wild,
    WildIntConst,
    WildStrConst,
    Nil,

    // List/tuple constructors
    List,
    Tern,
    FlagCall,
    Subscript,
}

impl Operator {
    /// Printable operator name. Derived from the enumeration so the
    /// rewrite rules' `kindof` probes always agree with the IR.
    pub const fn name(self) -> &'static str {
        use Operator::*;
        match self {
            Plus => "+",
            Minus => "-",
            Mult => "*",
            Mults => "*!",
            Div => "/",
            Divs => "/!",
            Mod => "%",
            Mods => "%!",
            BitAnd => "&",
            BitOr => "|",
            BitXor => "^",
            BitNot => "~",
            Shl => "<<",
            Shr => ">>",
            Shra => ">>A",
            And => "and",
            Or => "or",
            LNot => "not",
            Equals => "=",
            NotEqual => "~=",
            Less => "<",
            Greater => ">",
            LessEq => "<=",
            GreaterEq => ">=",
            LessUns => "<u",
            GreaterUns => ">u",
            LessEqUns => "<=u",
            GreaterEqUns => ">=u",
            Neg => "neg",
            SizeCast => "size",
            TypeOf => "typeof",
            KindOf => "kindof",
            AddrOf => "a[",
            MemOf => "m[",
            RegOf => "r[",
            LocalVar => "local",
            Var => "var",
            IntConst => "intconst",
            StrConst => "strconst",
            FltConst => "fltconst",
            TypeVal => "typeval",
            Flags => "%flags",
            FFlags => "%fflags",
            Pc => "%pc",
            True => "true",
            False => "false",
            Wild => "WILD",
            WildIntConst => "WILDINT",
            WildStrConst => "WILDSTR",
            Nil => "nil",
            List => "list",
            Tern => "tern",
            FlagCall => "flagcall",
            Subscript => "subscript",
        }
    }

    pub fn is_relational(self) -> bool {
        use Operator::*;
        matches!(
            self,
            Equals
                | NotEqual
                | Less
                | Greater
                | LessEq
                | GreaterEq
                | LessUns
                | GreaterUns
                | LessEqUns
                | GreaterEqUns
        )
    }

    pub fn is_unsigned_relational(self) -> bool {
        use Operator::*;
        matches!(self, LessUns | GreaterUns | LessEqUns | GreaterEqUns)
    }

    /// Signed counterpart of an unsigned comparison; identity otherwise.
    pub fn to_signed(self) -> Operator {
        use Operator::*;
        match self {
            LessUns => Less,
            GreaterUns => Greater,
            LessEqUns => LessEq,
            GreaterEqUns => GreaterEq,
            other => other,
        }
    }

    /// Logical inverse of a comparison, if it is one.
    pub fn inverted(self) -> Option<Operator> {
        use Operator::*;
        Some(match self {
            Equals => NotEqual,
            NotEqual => Equals,
            Less => GreaterEq,
            GreaterEq => Less,
            Greater => LessEq,
            LessEq => Greater,
            LessUns => GreaterEqUns,
            GreaterEqUns => LessUns,
            GreaterUns => LessEqUns,
            LessEqUns => GreaterUns,
            _ => return None,
        })
    }

    pub fn is_commutative(self) -> bool {
        use Operator::*;
        matches!(
            self,
            Plus | Mult | Mults | BitAnd | BitOr | BitXor | And | Or | Equals | NotEqual
        )
    }

    pub fn is_associative(self) -> bool {
        use Operator::*;
        matches!(self, Plus | Mult | BitAnd | BitOr | BitXor | And | Or)
    }
}

/// Constant payloads for leaf nodes.
#[derive(Debug, Clone)]
pub enum Const {
    Int(i64),
    Flt(f64),
    Str(Symbol),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Flt(a), Const::Flt(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Const::Int(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            Const::Flt(v) => {
                1u8.hash(state);
                v.to_bits().hash(state);
            }
            Const::Str(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

/// Which definition an SSA-subscripted location refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsaDef {
    /// Defined on entry (no textual definition yet); the implicit
    /// placement pass later materialises a statement for it.
    Implicit,
    Stmt(StmtId),
}

/// An expression node. See the module docs for the sharing discipline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Exp {
    Const(Const),
    /// Nullary operator leaf (`%flags`, `%pc`, wildcards, `nil`, ...).
    Terminal(Operator),
    /// A type as a value, for rewrite rules and `typeof` probes.
    TypeVal(Ty),
    Unary {
        op: Operator,
        sub: SharedExp,
    },
    Binary {
        op: Operator,
        lhs: SharedExp,
        rhs: SharedExp,
    },
    Ternary {
        op: Operator,
        fst: SharedExp,
        snd: SharedExp,
        trd: SharedExp,
    },
    /// SSA reference: `base` as defined by `def`.
    Subscript {
        base: SharedExp,
        def: SsaDef,
    },
}

impl Exp {
    // ---- constructors ----------------------------------------------------

    pub fn int(value: i64) -> SharedExp {
        Rc::new(Exp::Const(Const::Int(value)))
    }

    pub fn flt(value: f64) -> SharedExp {
        Rc::new(Exp::Const(Const::Flt(value)))
    }

    pub fn str_const(value: &str) -> SharedExp {
        Rc::new(Exp::Const(Const::Str(Symbol::intern(value))))
    }

    pub fn terminal(op: Operator) -> SharedExp {
        debug_assert_eq!(arity_of(op), 0, "terminal with non-nullary operator");
        Rc::new(Exp::Terminal(op))
    }

    pub fn wild() -> SharedExp {
        Self::terminal(Operator::Wild)
    }

    pub fn nil() -> SharedExp {
        Self::terminal(Operator::Nil)
    }

    pub fn flags() -> SharedExp {
        Self::terminal(Operator::Flags)
    }

    pub fn fflags() -> SharedExp {
        Self::terminal(Operator::FFlags)
    }

    pub fn typeval(ty: Ty) -> SharedExp {
        Rc::new(Exp::TypeVal(ty))
    }

    pub fn unary(op: Operator, sub: SharedExp) -> SharedExp {
        debug_assert_eq!(arity_of(op), 1, "unary with non-unary operator");
        Rc::new(Exp::Unary { op, sub })
    }

    pub fn binary(op: Operator, lhs: SharedExp, rhs: SharedExp) -> SharedExp {
        debug_assert_eq!(arity_of(op), 2, "binary with non-binary operator");
        Rc::new(Exp::Binary { op, lhs, rhs })
    }

    pub fn ternary(op: Operator, fst: SharedExp, snd: SharedExp, trd: SharedExp) -> SharedExp {
        debug_assert_eq!(arity_of(op), 3, "ternary with non-ternary operator");
        Rc::new(Exp::Ternary { op, fst, snd, trd })
    }

    /// Register reference `r[k]`.
    pub fn reg(num: u16) -> SharedExp {
        Self::unary(Operator::RegOf, Self::int(num as i64))
    }

    pub fn mem_of(addr: SharedExp) -> SharedExp {
        Self::unary(Operator::MemOf, addr)
    }

    pub fn addr_of(sub: SharedExp) -> SharedExp {
        Self::unary(Operator::AddrOf, sub)
    }

    pub fn l_not(sub: SharedExp) -> SharedExp {
        Self::unary(Operator::LNot, sub)
    }

    pub fn neg(sub: SharedExp) -> SharedExp {
        Self::unary(Operator::Neg, sub)
    }

    /// `size(width, e)`, a width reinterpretation of `e`.
    pub fn size_cast(width: u16, sub: SharedExp) -> SharedExp {
        Self::binary(Operator::SizeCast, Self::int(width as i64), sub)
    }

    /// Pattern variable `var(name)` for the rule rewriter.
    pub fn var(name: &str) -> SharedExp {
        Self::unary(Operator::Var, Self::str_const(name))
    }

    /// A named local variable.
    pub fn local(name: Symbol) -> SharedExp {
        Self::unary(Operator::LocalVar, Rc::new(Exp::Const(Const::Str(name))))
    }

    pub fn tern(cond: SharedExp, then: SharedExp, otherwise: SharedExp) -> SharedExp {
        Self::ternary(Operator::Tern, cond, then, otherwise)
    }

    /// Right-nested `list` chain terminated by `nil`.
    pub fn list<I: IntoIterator<Item = SharedExp>>(items: I) -> SharedExp
    where
        I::IntoIter: DoubleEndedIterator,
    {
        let mut tail = Self::nil();
        for item in items.into_iter().rev() {
            tail = Self::binary(Operator::List, item, tail);
        }
        tail
    }

    /// Flag-call pseudo-function `NAME(args...)`.
    pub fn flag_call<I: IntoIterator<Item = SharedExp>>(name: &str, args: I) -> SharedExp
    where
        I::IntoIter: DoubleEndedIterator,
    {
        Self::binary(Operator::FlagCall, Self::str_const(name), Self::list(args))
    }

    pub fn subscript(base: SharedExp, def: SsaDef) -> SharedExp {
        Rc::new(Exp::Subscript { base, def })
    }

    // ---- shape accessors -------------------------------------------------

    pub fn op(&self) -> Operator {
        match self {
            Exp::Const(Const::Int(_)) => Operator::IntConst,
            Exp::Const(Const::Flt(_)) => Operator::FltConst,
            Exp::Const(Const::Str(_)) => Operator::StrConst,
            Exp::Terminal(op) => *op,
            Exp::TypeVal(_) => Operator::TypeVal,
            Exp::Unary { op, .. } => *op,
            Exp::Binary { op, .. } => *op,
            Exp::Ternary { op, .. } => *op,
            Exp::Subscript { .. } => Operator::Subscript,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Exp::Const(_) | Exp::Terminal(_) | Exp::TypeVal(_) => 0,
            Exp::Unary { .. } | Exp::Subscript { .. } => 1,
            Exp::Binary { .. } => 2,
            Exp::Ternary { .. } => 3,
        }
    }

    pub fn child(&self, i: usize) -> Option<&SharedExp> {
        match (self, i) {
            (Exp::Unary { sub, .. }, 0) => Some(sub),
            (Exp::Subscript { base, .. }, 0) => Some(base),
            (Exp::Binary { lhs, .. }, 0) => Some(lhs),
            (Exp::Binary { rhs, .. }, 1) => Some(rhs),
            (Exp::Ternary { fst, .. }, 0) => Some(fst),
            (Exp::Ternary { snd, .. }, 1) => Some(snd),
            (Exp::Ternary { trd, .. }, 2) => Some(trd),
            _ => None,
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &SharedExp> {
        (0..self.arity()).filter_map(move |i| self.child(i))
    }

    // ---- predicates ------------------------------------------------------

    pub fn int_value(&self) -> Option<i64> {
        match self {
            Exp::Const(Const::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn flt_value(&self) -> Option<f64> {
        match self {
            Exp::Const(Const::Flt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str_value(&self) -> Option<Symbol> {
        match self {
            Exp::Const(Const::Str(s)) => Some(*s),
            _ => None,
        }
    }

    pub fn is_int_const(&self) -> bool {
        matches!(self, Exp::Const(Const::Int(_)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Exp::Terminal(Operator::Nil))
    }

    pub fn is_wild(&self) -> bool {
        matches!(self, Exp::Terminal(Operator::Wild))
    }

    pub fn is_terminal(&self, op: Operator) -> bool {
        matches!(self, Exp::Terminal(t) if *t == op)
    }

    /// The machine condition-code terminal, integer or float flavour.
    pub fn is_flags(&self) -> bool {
        matches!(
            self,
            Exp::Terminal(Operator::Flags) | Exp::Terminal(Operator::FFlags)
        )
    }

    pub fn is_mem_of(&self) -> bool {
        self.op() == Operator::MemOf
    }

    pub fn is_reg_of(&self) -> bool {
        self.op() == Operator::RegOf
    }

    pub fn is_subscript(&self) -> bool {
        matches!(self, Exp::Subscript { .. })
    }

    pub fn is_var(&self) -> bool {
        self.op() == Operator::Var
    }

    /// `var(name)` leaf name, if this is one.
    pub fn var_name(&self) -> Option<Symbol> {
        match self {
            Exp::Unary {
                op: Operator::Var,
                sub,
            } => sub.str_value(),
            _ => None,
        }
    }

    /// Local variable name, if this is one.
    pub fn local_name(&self) -> Option<Symbol> {
        match self {
            Exp::Unary {
                op: Operator::LocalVar,
                sub,
            } => sub.str_value(),
            _ => None,
        }
    }

    /// Register number for `r[k]` with a constant `k`.
    pub fn reg_num(&self) -> Option<u16> {
        match self {
            Exp::Unary {
                op: Operator::RegOf,
                sub,
            } => sub.int_value().map(|v| v as u16),
            _ => None,
        }
    }

    /// Flag-call name and argument list, if this is a flag call.
    pub fn as_flag_call(&self) -> Option<(Symbol, &SharedExp)> {
        match self {
            Exp::Binary {
                op: Operator::FlagCall,
                lhs,
                rhs,
            } => lhs.str_value().map(|name| (name, rhs)),
            _ => None,
        }
    }

    /// Maximum memory-dereference nesting depth.
    pub fn mem_depth(&self) -> usize {
        let inner = self.children().map(|c| c.mem_depth()).max().unwrap_or(0);
        if self.op() == Operator::MemOf {
            inner + 1
        } else {
            inner
        }
    }

    /// True when this expression can stand on the left of an assignment.
    pub fn is_lvalue(&self) -> bool {
        match self {
            Exp::Subscript { base, .. } => base.is_lvalue(),
            _ => matches!(
                self.op(),
                Operator::RegOf
                    | Operator::MemOf
                    | Operator::LocalVar
                    | Operator::Flags
                    | Operator::FFlags
            ),
        }
    }
}

/// Tree-walking operations over shared expression handles.
///
/// These return (possibly new) roots and preserve sharing: an
/// operation that changes nothing hands back the same `Rc`.
pub trait ExpExt {
    /// Rebuild this node with children produced by `f`, preserving
    /// sharing when nothing changed.
    fn map_children<F: FnMut(&SharedExp) -> SharedExp>(&self, f: F) -> SharedExp;

    /// Deep structural copy with no shared nodes.
    fn deep_clone(&self) -> SharedExp;

    /// Strip SSA subscripts off the root.
    fn base(&self) -> SharedExp;

    /// Strip SSA subscripts everywhere in the tree.
    fn strip_subscripts(&self) -> SharedExp;

    /// Elements of a `list`/`nil` chain.
    fn list_items(&self) -> Vec<SharedExp>;

    /// First subtree matching `pattern`, in pre-order. Wildcard leaves
    /// in the pattern match any subtree of the right shape.
    fn search(&self, pattern: &SharedExp) -> Option<SharedExp>;

    /// All non-overlapping matches of `pattern`, in pre-order. A match
    /// is not searched inside.
    fn search_all(&self, pattern: &SharedExp) -> Vec<SharedExp>;

    /// Replace the first match of `pattern` with `replacement`.
    fn search_replace(&self, pattern: &SharedExp, replacement: &SharedExp) -> (SharedExp, bool);

    /// Replace every match of `pattern` with `replacement` in one
    /// pass; replacements are not re-entered.
    fn search_replace_all(
        &self,
        pattern: &SharedExp,
        replacement: &SharedExp,
    ) -> (SharedExp, bool);

    /// Unify against `template`, which may contain `var(name)` leaves.
    /// Returns the ordered binding list on success.
    fn matches(&self, template: &SharedExp) -> Option<Bindings>;

    /// Substitute every binding into this expression, in order.
    fn apply_bindings(&self, bindings: &Bindings) -> SharedExp;

    /// Simplify to a canonical form. Total and idempotent; the flag
    /// reports whether the result differs structurally from the input.
    fn simplify(&self) -> (SharedExp, bool);

    /// Push a type hint towards the leaves, recording what is learned
    /// about locations; see the type-analysis pass.
    fn descend_type(&self, hint: &Ty, types: &mut TypeMap) -> (SharedExp, bool);
}

impl ExpExt for SharedExp {
    fn map_children<F: FnMut(&SharedExp) -> SharedExp>(&self, mut f: F) -> SharedExp {
        match &**self {
            Exp::Const(_) | Exp::Terminal(_) | Exp::TypeVal(_) => Rc::clone(self),
            Exp::Unary { op, sub } => {
                let new_sub = f(sub);
                if Rc::ptr_eq(&new_sub, sub) {
                    Rc::clone(self)
                } else {
                    Rc::new(Exp::Unary {
                        op: *op,
                        sub: new_sub,
                    })
                }
            }
            Exp::Subscript { base, def } => {
                let new_base = f(base);
                if Rc::ptr_eq(&new_base, base) {
                    Rc::clone(self)
                } else {
                    Rc::new(Exp::Subscript {
                        base: new_base,
                        def: *def,
                    })
                }
            }
            Exp::Binary { op, lhs, rhs } => {
                let new_lhs = f(lhs);
                let new_rhs = f(rhs);
                if Rc::ptr_eq(&new_lhs, lhs) && Rc::ptr_eq(&new_rhs, rhs) {
                    Rc::clone(self)
                } else {
                    Rc::new(Exp::Binary {
                        op: *op,
                        lhs: new_lhs,
                        rhs: new_rhs,
                    })
                }
            }
            Exp::Ternary { op, fst, snd, trd } => {
                let new_fst = f(fst);
                let new_snd = f(snd);
                let new_trd = f(trd);
                if Rc::ptr_eq(&new_fst, fst)
                    && Rc::ptr_eq(&new_snd, snd)
                    && Rc::ptr_eq(&new_trd, trd)
                {
                    Rc::clone(self)
                } else {
                    Rc::new(Exp::Ternary {
                        op: *op,
                        fst: new_fst,
                        snd: new_snd,
                        trd: new_trd,
                    })
                }
            }
        }
    }

    fn deep_clone(&self) -> SharedExp {
        match &**self {
            Exp::Const(_) | Exp::Terminal(_) | Exp::TypeVal(_) => Rc::new((**self).clone()),
            // Children come back as fresh allocations, so map_children
            // always rebuilds the interior node too.
            _ => self.map_children(|c| c.deep_clone()),
        }
    }

    fn base(&self) -> SharedExp {
        match &**self {
            Exp::Subscript { base, .. } => base.base(),
            _ => Rc::clone(self),
        }
    }

    fn strip_subscripts(&self) -> SharedExp {
        match &**self {
            Exp::Subscript { base, .. } => base.strip_subscripts(),
            _ => self.map_children(|c| c.strip_subscripts()),
        }
    }

    fn list_items(&self) -> Vec<SharedExp> {
        let mut items = Vec::new();
        let mut cursor = Rc::clone(self);
        while let Exp::Binary {
            op: Operator::List,
            lhs,
            rhs,
        } = &*cursor
        {
            items.push(Rc::clone(lhs));
            let next = Rc::clone(rhs);
            cursor = next;
        }
        items
    }

    fn search(&self, pattern: &SharedExp) -> Option<SharedExp> {
        matching::search(self, pattern)
    }

    fn search_all(&self, pattern: &SharedExp) -> Vec<SharedExp> {
        matching::search_all(self, pattern)
    }

    fn search_replace(&self, pattern: &SharedExp, replacement: &SharedExp) -> (SharedExp, bool) {
        matching::search_replace(self, pattern, replacement)
    }

    fn search_replace_all(
        &self,
        pattern: &SharedExp,
        replacement: &SharedExp,
    ) -> (SharedExp, bool) {
        matching::search_replace_all(self, pattern, replacement)
    }

    fn matches(&self, template: &SharedExp) -> Option<Bindings> {
        matching::unify(self, template)
    }

    fn apply_bindings(&self, bindings: &Bindings) -> SharedExp {
        matching::apply_bindings(self, bindings)
    }

    fn simplify(&self) -> (SharedExp, bool) {
        simplify::simplify(self)
    }

    fn descend_type(&self, hint: &Ty, types: &mut TypeMap) -> (SharedExp, bool) {
        typing::descend_type(self, hint, types)
    }
}

/// Declared arity for each operator when used as a node tag. Leaves are
/// 0 even though their payload lives in `Const`/`TypeVal`.
pub(crate) fn arity_of(op: Operator) -> usize {
    use Operator::*;
    match op {
        IntConst | StrConst | FltConst | TypeVal | Flags | FFlags | Pc | True | False | Wild
        | WildIntConst | WildStrConst | Nil => 0,
        BitNot | LNot | Neg | TypeOf | KindOf | AddrOf | MemOf | RegOf | LocalVar | Var
        | Subscript => 1,
        Plus | Minus | Mult | Mults | Div | Divs | Mod | Mods | BitAnd | BitOr | BitXor | Shl
        | Shr | Shra | And | Or | Equals | NotEqual | Less | Greater | LessEq | GreaterEq
        | LessUns | GreaterUns | LessEqUns | GreaterEqUns | SizeCast | List | FlagCall => 2,
        Tern => 3,
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_exp(self, f)
    }
}

fn write_exp(e: &Exp, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use Operator::*;
    match e {
        Exp::Const(Const::Int(v)) => write!(f, "{v}"),
        Exp::Const(Const::Flt(v)) => write!(f, "{v}"),
        Exp::Const(Const::Str(s)) => write!(f, "\"{s}\""),
        Exp::Terminal(op) => f.write_str(op.name()),
        Exp::TypeVal(ty) => write!(f, "<{ty}>"),
        Exp::Unary { op, sub } => match op {
            RegOf => {
                if let Some(n) = sub.int_value() {
                    write!(f, "r{n}")
                } else {
                    write!(f, "r[{sub}]")
                }
            }
            MemOf => write!(f, "m[{sub}]"),
            AddrOf => write!(f, "a[{sub}]"),
            LocalVar => {
                if let Some(name) = sub.str_value() {
                    write!(f, "{name}")
                } else {
                    write!(f, "local({sub})")
                }
            }
            Var => write!(f, "var({sub})"),
            LNot => write!(f, "not({sub})"),
            Neg => write!(f, "-({sub})"),
            BitNot => write!(f, "~({sub})"),
            TypeOf => write!(f, "typeof({sub})"),
            KindOf => write!(f, "kindof({sub})"),
            _ => write!(f, "{}({sub})", op.name()),
        },
        Exp::Binary { op, lhs, rhs } => match op {
            SizeCast => write!(f, "size({lhs}, {rhs})"),
            FlagCall => {
                if let Some(name) = lhs.str_value() {
                    write!(f, "{name}(")?;
                } else {
                    write!(f, "{lhs}(")?;
                }
                let items = rhs.list_items();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            List => {
                let mut node = e;
                f.write_str("{")?;
                let mut first = true;
                while let Exp::Binary { op: List, lhs, rhs } = node {
                    if !first {
                        f.write_str(", ")?;
                    }
                    write!(f, "{lhs}")?;
                    first = false;
                    node = rhs;
                }
                f.write_str("}")
            }
            _ => write!(f, "({lhs} {} {rhs})", op.name()),
        },
        Exp::Ternary { fst, snd, trd, .. } => write!(f, "({fst} ? {snd} : {trd})"),
        Exp::Subscript { base, def } => match def {
            SsaDef::Implicit => write!(f, "{base}{{-}}"),
            SsaDef::Stmt(id) => write!(f, "{base}{{{}}}", id.0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_across_sharing() {
        let shared = Exp::reg(24);
        let a = Exp::binary(Operator::Plus, Rc::clone(&shared), Exp::int(1));
        let b = Exp::binary(Operator::Plus, Exp::reg(24), Exp::int(1));
        assert_eq!(a, b);
        assert_ne!(a, Exp::binary(Operator::Plus, Exp::reg(25), Exp::int(1)));
    }

    #[test]
    fn deep_clone_is_node_disjoint() {
        let e = Exp::mem_of(Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)));
        let c = e.deep_clone();
        assert_eq!(e, c);
        assert!(!Rc::ptr_eq(&e, &c));
        assert!(!Rc::ptr_eq(e.child(0).unwrap(), c.child(0).unwrap()));
    }

    #[test]
    fn list_roundtrip() {
        let l = Exp::list([Exp::int(1), Exp::int(2), Exp::int(3)]);
        let items = l.list_items();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].int_value(), Some(3));
    }

    #[test]
    fn display_forms() {
        assert_eq!(Exp::reg(24).to_string(), "r24");
        assert_eq!(Exp::mem_of(Exp::reg(28)).to_string(), "m[r28]");
        let fc = Exp::flag_call("SUBFLAGS", [Exp::reg(24), Exp::reg(25)]);
        assert_eq!(fc.to_string(), "SUBFLAGS(r24, r25)");
        let sub = Exp::subscript(Exp::reg(24), SsaDef::Implicit);
        assert_eq!(sub.to_string(), "r24{-}");
    }

    #[test]
    fn mem_depth_counts_nesting() {
        let e = Exp::mem_of(Exp::binary(
            Operator::Plus,
            Exp::mem_of(Exp::reg(28)),
            Exp::int(4),
        ));
        assert_eq!(e.mem_depth(), 2);
        assert_eq!(Exp::reg(24).mem_depth(), 0);
    }

    #[test]
    fn operator_names_cover_relational_families() {
        assert_eq!(Operator::LessUns.to_signed(), Operator::Less);
        assert_eq!(Operator::Equals.to_signed(), Operator::Equals);
        assert!(Operator::GreaterEqUns.is_unsigned_relational());
        assert_eq!(Operator::Less.inverted(), Some(Operator::GreaterEq));
    }

    #[test]
    fn strip_subscripts_reaches_nested_locations() {
        let inner = Exp::subscript(Exp::reg(28), SsaDef::Implicit);
        let loc = Exp::subscript(
            Exp::mem_of(Exp::binary(Operator::Plus, inner, Exp::int(4))),
            SsaDef::Implicit,
        );
        assert_eq!(loc.strip_subscripts().to_string(), "m[(r28 + 4)]");
        assert_eq!(loc.base().to_string(), "m[(r28{-} + 4)]");
    }
}
