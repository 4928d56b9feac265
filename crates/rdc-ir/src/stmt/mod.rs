//! Statements.
//!
//! A [`Statement`] lives in its procedure's arena and carries its
//! per-procedure sequence number, the id of its owning block, and the
//! variant payload. Statements own their expression roots exclusively;
//! rewrites swap in new roots and never mutate shared subtrees.

mod helper;
mod visitor;

pub use helper::{cond_to_relational, BranchKind, LOGICALFLAGS, SETFFLAGS, SUBFLAGS};
pub use visitor::{ExpRole, FnExpVisitor, FnModifier, StmtExpVisitor, StmtModifier, StmtVisitor};

use std::fmt;
use std::rc::Rc;

use rdc_util::Address;

use crate::codegen::Codegen;
use crate::exp::{Exp, ExpExt, Operator, SharedExp, SsaDef};
use crate::proc::Signature;
use crate::ty::Ty;
use crate::BlockId;

/// Ordinary assignment `lhs := rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub lhs: SharedExp,
    pub rhs: SharedExp,
    /// Declared type, when the front end or type analysis knows one.
    pub ty: Option<Ty>,
}

impl Assign {
    pub fn new(lhs: SharedExp, rhs: SharedExp) -> Self {
        Assign { lhs, rhs, ty: None }
    }
}

/// SSA join: one operand per predecessor of the owning block.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiAssign {
    pub lhs: SharedExp,
    pub args: Vec<PhiArg>,
}

/// One incoming phi operand: the defining statement of the value that
/// flows in from `pred` (implicit when live-in).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhiArg {
    pub pred: BlockId,
    pub def: SsaDef,
}

/// Placeholder definition for a location live on entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplicitAssign {
    pub lhs: SharedExp,
}

/// `lhs := (cond ? 1 : 0)` for the machine's set-on-condition forms.
#[derive(Debug, Clone, PartialEq)]
pub struct BoolAssign {
    pub lhs: SharedExp,
    pub kind: BranchKind,
    pub is_float: bool,
    /// Destination width in bits.
    pub width: u16,
    pub cond: SharedExp,
}

impl BoolAssign {
    pub fn new(lhs: SharedExp, kind: BranchKind, width: u16) -> Self {
        BoolAssign {
            lhs,
            kind,
            is_float: false,
            width,
            cond: Exp::flags(),
        }
    }

    /// Install a condition kind. The condition expression becomes the
    /// raw flags terminal; relational synthesis happens later, once
    /// propagation has exposed the flag setter.
    pub fn set_cond_type(&mut self, kind: BranchKind, is_float: bool) {
        self.kind = kind;
        self.is_float = is_float;
        self.cond = if is_float { Exp::fflags() } else { Exp::flags() };
    }

    /// Turn the unsigned comparison kinds into their signed
    /// counterparts; all other kinds are untouched.
    pub fn make_signed(&mut self) {
        self.kind = self.kind.to_signed();
    }
}

/// Unconditional jump.
#[derive(Debug, Clone, PartialEq)]
pub struct GotoStmt {
    pub dest: SharedExp,
    /// Destination computed at run time rather than a fixed address.
    pub computed: bool,
}

/// Two-way conditional jump. The owning block has exactly two
/// successors; successor 0 is the taken edge whenever its low address
/// equals the fixed destination.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchStmt {
    pub dest: SharedExp,
    pub kind: BranchKind,
    pub is_float: bool,
    pub cond: SharedExp,
    pub computed: bool,
}

impl BranchStmt {
    pub fn new(dest: Address, kind: BranchKind) -> Self {
        BranchStmt {
            dest: Exp::int(dest.value() as i64),
            kind,
            is_float: false,
            cond: Exp::flags(),
            computed: false,
        }
    }

    /// Install a condition kind; see [`BoolAssign::set_cond_type`].
    pub fn set_cond_type(&mut self, kind: BranchKind, is_float: bool) {
        self.kind = kind;
        self.is_float = is_float;
        self.cond = if is_float { Exp::fflags() } else { Exp::flags() };
    }

    pub fn make_signed(&mut self) {
        self.kind = self.kind.to_signed();
    }

    /// Fixed destination address, `Address::INVALID` when computed.
    pub fn fixed_dest(&self) -> Address {
        match self.dest.int_value() {
            Some(v) if !self.computed => Address::new(v as u64),
            _ => Address::INVALID,
        }
    }
}

/// N-way jump through a switch table.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseStmt {
    pub dest: SharedExp,
    pub table: Option<SwitchInfo>,
}

/// Switch-table descriptor recovered by the front end.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
    pub form: SwitchForm,
    pub lower: i64,
    pub upper: i64,
    pub table_addr: Address,
    pub num_cases: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchForm {
    /// Table of absolute jump targets.
    Absolute,
    /// Table of offsets relative to the table base.
    Relative,
}

/// Call. Arguments and results are modelled as assignments so the same
/// machinery (search, propagation, liveness) applies to them.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStmt {
    pub dest: SharedExp,
    /// `param_loc := actual` per argument.
    pub args: Vec<Assign>,
    /// `result_loc := result_loc` placeholders for every location the
    /// callee may define; trimmed by call-liveness removal.
    pub defines: Vec<Assign>,
    pub signature: Option<Rc<Signature>>,
}

/// Return. One assignment per returned location.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub returns: Vec<Assign>,
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign(Assign),
    PhiAssign(PhiAssign),
    ImplicitAssign(ImplicitAssign),
    BoolAssign(BoolAssign),
    Goto(GotoStmt),
    Branch(BranchStmt),
    Case(CaseStmt),
    Call(CallStmt),
    Return(ReturnStmt),
}

impl StmtKind {
    pub const fn name(&self) -> &'static str {
        match self {
            StmtKind::Assign(_) => "assign",
            StmtKind::PhiAssign(_) => "phi",
            StmtKind::ImplicitAssign(_) => "implicit",
            StmtKind::BoolAssign(_) => "bool",
            StmtKind::Goto(_) => "goto",
            StmtKind::Branch(_) => "branch",
            StmtKind::Case(_) => "case",
            StmtKind::Call(_) => "call",
            StmtKind::Return(_) => "return",
        }
    }
}

/// A statement in a procedure's arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Per-procedure sequence number; 0 until assigned.
    pub number: u32,
    /// Owning block; `BlockId::INVALID` until placed.
    pub block: BlockId,
    pub kind: StmtKind,
}

impl Statement {
    pub fn new(kind: StmtKind) -> Self {
        Statement {
            number: 0,
            block: BlockId::INVALID,
            kind,
        }
    }

    /// Deep copy: owner fields are preserved, owned expressions are
    /// node-disjoint from the original's.
    pub fn deep_clone(&self) -> Statement {
        let mut copy = self.clone();
        copy.map_exps(|e, _| e.deep_clone());
        copy
    }

    /// Left side, for the assignment-family variants.
    pub fn lhs(&self) -> Option<&SharedExp> {
        match &self.kind {
            StmtKind::Assign(a) => Some(&a.lhs),
            StmtKind::PhiAssign(p) => Some(&p.lhs),
            StmtKind::ImplicitAssign(i) => Some(&i.lhs),
            StmtKind::BoolAssign(b) => Some(&b.lhs),
            _ => None,
        }
    }

    pub fn as_assign(&self) -> Option<&Assign> {
        match &self.kind {
            StmtKind::Assign(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, StmtKind::PhiAssign(_))
    }

    /// Does this statement end a basic block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            StmtKind::Goto(_)
                | StmtKind::Branch(_)
                | StmtKind::Case(_)
                | StmtKind::Return(_)
        )
    }

    /// Lvalues this statement defines.
    pub fn definitions(&self) -> Vec<SharedExp> {
        match &self.kind {
            StmtKind::Assign(a) => vec![Rc::clone(&a.lhs)],
            StmtKind::PhiAssign(p) => vec![Rc::clone(&p.lhs)],
            StmtKind::ImplicitAssign(i) => vec![Rc::clone(&i.lhs)],
            StmtKind::BoolAssign(b) => vec![Rc::clone(&b.lhs)],
            StmtKind::Call(c) => c.defines.iter().map(|d| Rc::clone(&d.lhs)).collect(),
            _ => Vec::new(),
        }
    }

    /// Visit every owned expression root with its role.
    pub fn for_each_exp(&self, f: &mut dyn FnMut(&SharedExp, ExpRole)) {
        match &self.kind {
            StmtKind::Assign(a) => {
                f(&a.rhs, ExpRole::Use);
                f(&a.lhs, ExpRole::Def);
            }
            StmtKind::PhiAssign(p) => f(&p.lhs, ExpRole::Def),
            StmtKind::ImplicitAssign(i) => f(&i.lhs, ExpRole::Def),
            StmtKind::BoolAssign(b) => {
                f(&b.cond, ExpRole::Use);
                f(&b.lhs, ExpRole::Def);
            }
            StmtKind::Goto(g) => f(&g.dest, ExpRole::Use),
            StmtKind::Branch(b) => {
                f(&b.cond, ExpRole::Use);
                f(&b.dest, ExpRole::Use);
            }
            StmtKind::Case(c) => f(&c.dest, ExpRole::Use),
            StmtKind::Call(c) => {
                f(&c.dest, ExpRole::Use);
                for arg in &c.args {
                    f(&arg.rhs, ExpRole::Use);
                    f(&arg.lhs, ExpRole::Def);
                }
                for def in &c.defines {
                    f(&def.lhs, ExpRole::Def);
                }
            }
            StmtKind::Return(r) => {
                for ret in &r.returns {
                    f(&ret.rhs, ExpRole::Use);
                    f(&ret.lhs, ExpRole::Def);
                }
            }
        }
    }

    /// Rewrite every owned expression root in place.
    pub fn map_exps(&mut self, mut f: impl FnMut(&SharedExp, ExpRole) -> SharedExp) {
        match &mut self.kind {
            StmtKind::Assign(a) => {
                a.rhs = f(&a.rhs, ExpRole::Use);
                a.lhs = f(&a.lhs, ExpRole::Def);
            }
            StmtKind::PhiAssign(p) => p.lhs = f(&p.lhs, ExpRole::Def),
            StmtKind::ImplicitAssign(i) => i.lhs = f(&i.lhs, ExpRole::Def),
            StmtKind::BoolAssign(b) => {
                b.cond = f(&b.cond, ExpRole::Use);
                b.lhs = f(&b.lhs, ExpRole::Def);
            }
            StmtKind::Goto(g) => g.dest = f(&g.dest, ExpRole::Use),
            StmtKind::Branch(b) => {
                b.cond = f(&b.cond, ExpRole::Use);
                b.dest = f(&b.dest, ExpRole::Use);
            }
            StmtKind::Case(c) => c.dest = f(&c.dest, ExpRole::Use),
            StmtKind::Call(c) => {
                c.dest = f(&c.dest, ExpRole::Use);
                for arg in &mut c.args {
                    arg.rhs = f(&arg.rhs, ExpRole::Use);
                    arg.lhs = f(&arg.lhs, ExpRole::Def);
                }
                for def in &mut c.defines {
                    def.lhs = f(&def.lhs, ExpRole::Def);
                }
            }
            StmtKind::Return(r) => {
                for ret in &mut r.returns {
                    ret.rhs = f(&ret.rhs, ExpRole::Use);
                    ret.lhs = f(&ret.lhs, ExpRole::Def);
                }
            }
        }
    }

    /// Does `e` appear syntactically in a value position (any use root,
    /// or the address computation of a memory-destination left side)?
    pub fn uses_exp(&self, e: &SharedExp) -> bool {
        let mut found = false;
        self.for_each_exp(&mut |root, role| {
            if found {
                return;
            }
            match role {
                ExpRole::Use => found = root.search(e).is_some(),
                ExpRole::Def => {
                    // a memory destination reads its address
                    if let Exp::Unary {
                        op: Operator::MemOf,
                        sub,
                    } = &*root.base()
                    {
                        found = sub.search(e).is_some();
                    }
                }
            }
        });
        found
    }

    /// First match of `pattern` in any owned expression.
    pub fn search(&self, pattern: &SharedExp) -> Option<SharedExp> {
        let mut result = None;
        self.for_each_exp(&mut |root, _| {
            if result.is_none() {
                result = root.search(pattern);
            }
        });
        result
    }

    /// All matches of `pattern` across every owned expression.
    pub fn search_all(&self, pattern: &SharedExp) -> Vec<SharedExp> {
        let mut result = Vec::new();
        self.for_each_exp(&mut |root, _| {
            result.extend(root.search_all(pattern));
        });
        result
    }

    /// Replace every match of `pattern` in every owned expression.
    pub fn search_replace_all(&mut self, pattern: &SharedExp, replacement: &SharedExp) -> bool {
        let mut changed = false;
        self.map_exps(|root, _| {
            let (new_root, ch) = root.search_replace_all(pattern, replacement);
            changed |= ch;
            new_root
        });
        changed
    }

    /// Simplify every owned expression; conditional statements also try
    /// to turn a flag-call condition into its relational form.
    pub fn simplify_exps(&mut self) -> bool {
        let mut changed = false;
        self.map_exps(|root, _| {
            let (new_root, ch) = root.simplify();
            changed |= ch;
            new_root
        });

        match &mut self.kind {
            StmtKind::Branch(b) => {
                if let Some(rel) = cond_to_relational(&b.cond, b.kind) {
                    b.cond = rel;
                    changed = true;
                }
            }
            StmtKind::BoolAssign(b) => {
                if let Some(rel) = cond_to_relational(&b.cond, b.kind) {
                    b.cond = rel;
                    changed = true;
                }
            }
            _ => {}
        }
        changed
    }

    // ---- visitor dispatch ------------------------------------------------

    pub fn accept(&self, visitor: &mut dyn StmtVisitor) -> bool {
        visitor.visit(self)
    }

    pub fn accept_exp(&self, visitor: &mut dyn StmtExpVisitor) {
        if !visitor.visit_stmt(self) {
            return;
        }
        self.for_each_exp(&mut |root, role| visitor.visit_exp(root, role));
    }

    pub fn accept_mod(&mut self, modifier: &mut dyn StmtModifier) {
        if !modifier.visit_stmt(self) {
            return;
        }
        self.map_exps(|root, role| modifier.modify_exp(root, role));
    }

    /// Hand this statement to the back end.
    pub fn generate_code(&self, gen: &mut dyn Codegen) {
        match &self.kind {
            StmtKind::Assign(a) => gen.add_assignment(a),
            StmtKind::BoolAssign(b) => {
                // lhs := (cond ? 1 : 0)
                let rhs = Exp::tern(Rc::clone(&b.cond), Exp::int(1), Exp::int(0));
                gen.add_assignment(&Assign::new(Rc::clone(&b.lhs), rhs));
            }
            StmtKind::ImplicitAssign(_) => {
                // binding site only; nothing to emit
            }
            StmtKind::PhiAssign(_) => {
                // the pipeline guarantees none survive to code generation
                log::warn!("phi statement {} reached code generation", self.number);
            }
            StmtKind::Goto(g) => gen.add_goto(&g.dest),
            StmtKind::Branch(_) => {
                // branches are emitted by the block, from its successors
            }
            StmtKind::Case(c) => gen.add_case(&c.dest, c.table.as_ref()),
            StmtKind::Call(c) => gen.add_call(&c.dest, &c.args, &c.defines),
            StmtKind::Return(r) => gen.add_return(&r.returns),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:4} ", self.number)?;
        match &self.kind {
            StmtKind::Assign(a) => write!(f, "{} := {}", a.lhs, a.rhs),
            StmtKind::PhiAssign(p) => {
                write!(f, "{} := phi(", p.lhs)?;
                for (i, arg) in p.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match arg.def {
                        SsaDef::Implicit => write!(f, "-")?,
                        SsaDef::Stmt(id) => write!(f, "{}", id.0)?,
                    }
                }
                f.write_str(")")
            }
            StmtKind::ImplicitAssign(i) => write!(f, "{} := -", i.lhs),
            StmtKind::BoolAssign(b) => {
                write!(f, "BOOL {} := CC({})", b.lhs, b.kind.name())?;
                if b.is_float {
                    f.write_str(", float")?;
                }
                writeln!(f)?;
                write!(f, "High level: {}", b.cond)
            }
            StmtKind::Goto(g) => write!(f, "GOTO {}", g.dest),
            StmtKind::Branch(b) => {
                write!(f, "BRANCH {}, condition {}", b.dest, b.kind.name())?;
                if b.is_float {
                    f.write_str(" float")?;
                }
                writeln!(f)?;
                write!(f, "High level: {}", b.cond)
            }
            StmtKind::Case(c) => write!(f, "CASE [{}]", c.dest),
            StmtKind::Call(c) => {
                write!(f, "CALL {}(", c.dest)?;
                for (i, arg) in c.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg.rhs)?;
                }
                f.write_str(")")
            }
            StmtKind::Return(r) => {
                f.write_str("RET")?;
                for (i, ret) in r.returns.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {} := {}", ret.lhs, ret.rhs)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(lhs: SharedExp, rhs: SharedExp) -> Statement {
        Statement::new(StmtKind::Assign(Assign::new(lhs, rhs)))
    }

    #[test]
    fn deep_clone_preserves_owner_and_detaches_exps() {
        let mut s = assign(Exp::reg(24), Exp::binary(Operator::Plus, Exp::reg(25), Exp::int(1)));
        s.number = 7;
        s.block = BlockId(3);

        let c = s.deep_clone();
        assert_eq!(c.number, 7);
        assert_eq!(c.block, BlockId(3));
        assert_eq!(c, s);

        let (orig, copy) = match (&s.kind, &c.kind) {
            (StmtKind::Assign(a), StmtKind::Assign(b)) => (&a.rhs, &b.rhs),
            _ => unreachable!(),
        };
        assert!(!Rc::ptr_eq(orig, copy));
    }

    #[test]
    fn uses_exp_sees_rhs_and_memof_destination_address() {
        let s = assign(
            Exp::mem_of(Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4))),
            Exp::reg(24),
        );
        assert!(s.uses_exp(&Exp::reg(24)));
        assert!(s.uses_exp(&Exp::reg(28)));

        // a plain register destination is not a use of itself
        let t = assign(Exp::reg(25), Exp::int(0));
        assert!(!t.uses_exp(&Exp::reg(25)));
    }

    #[test]
    fn bool_assign_make_signed_prints_signed_less() {
        let mut s = Statement::new(StmtKind::BoolAssign(BoolAssign::new(
            Exp::reg(24),
            BranchKind::Jul,
            8,
        )));
        assert!(s.to_string().contains("unsigned less"));

        if let StmtKind::BoolAssign(b) = &mut s.kind {
            b.make_signed();
        }
        let text = s.to_string();
        assert!(text.contains("signed less"));
        assert!(!text.contains("unsigned"));
    }

    #[test]
    fn branch_fixed_dest() {
        let b = BranchStmt::new(Address::new(0x1000), BranchKind::Je);
        assert_eq!(b.fixed_dest(), Address::new(0x1000));

        let mut computed = b.clone();
        computed.computed = true;
        assert_eq!(computed.fixed_dest(), Address::INVALID);
    }

    #[test]
    fn search_replace_all_touches_every_root() {
        let mut s = assign(
            Exp::mem_of(Exp::reg(28)),
            Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)),
        );
        let changed = s.search_replace_all(&Exp::reg(28), &Exp::reg(29));
        assert!(changed);
        assert!(s.to_string().contains("m[r29] := (r29 + 4)"));
    }

    #[test]
    fn simplify_rewrites_flag_condition() {
        let mut b = BranchStmt::new(Address::new(0x2000), BranchKind::Jsg);
        b.cond = Exp::flag_call(SUBFLAGS, [Exp::reg(24), Exp::reg(25)]);
        let mut s = Statement::new(StmtKind::Branch(b));

        assert!(s.simplify_exps());
        if let StmtKind::Branch(b) = &s.kind {
            assert_eq!(b.cond.to_string(), "(r24 > r25)");
        } else {
            unreachable!()
        }
    }

    #[test]
    fn visitor_dispatch_covers_all_roots() {
        let s = assign(
            Exp::reg(24),
            Exp::binary(Operator::Plus, Exp::reg(25), Exp::int(1)),
        );

        struct Counting(usize);
        impl StmtVisitor for Counting {
            fn visit(&mut self, _: &Statement) -> bool {
                self.0 += 1;
                true
            }
        }
        let mut v = Counting(0);
        assert!(s.accept(&mut v));
        assert_eq!(v.0, 1);

        let mut roots = Vec::new();
        s.accept_exp(&mut FnExpVisitor(|e: &SharedExp, role| {
            roots.push((Rc::clone(e), role));
        }));
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].1, ExpRole::Use);
        assert_eq!(roots[1].1, ExpRole::Def);

        // a modifier returning fresh roots leaves structure intact
        let mut copy = s.clone();
        copy.accept_mod(&mut FnModifier(|e: &SharedExp, _| e.deep_clone()));
        assert_eq!(copy, s);
    }

    #[test]
    fn bool_assign_generates_ternary_assignment() {
        struct Capture(Vec<String>);
        impl crate::codegen::Codegen for Capture {
            fn add_assignment(&mut self, asgn: &Assign) {
                self.0.push(format!("{} := {}", asgn.lhs, asgn.rhs));
            }
            fn add_goto(&mut self, _: &SharedExp) {}
            fn add_branch(&mut self, _: &SharedExp, _: &SharedExp) {}
            fn add_case(&mut self, _: &SharedExp, _: Option<&SwitchInfo>) {}
            fn add_call(&mut self, _: &SharedExp, _: &[Assign], _: &[Assign]) {}
            fn add_return(&mut self, _: &[Assign]) {}
        }

        let mut b = BoolAssign::new(Exp::reg(26), BranchKind::Jsl, 8);
        b.cond = Exp::binary(Operator::Less, Exp::reg(24), Exp::reg(25));
        let s = Statement::new(StmtKind::BoolAssign(b));

        let mut gen = Capture(Vec::new());
        s.generate_code(&mut gen);
        assert_eq!(gen.0, vec!["r26 := ((r24 < r25) ? 1 : 0)"]);
    }

    #[test]
    fn definitions_cover_call_defines() {
        let call = CallStmt {
            dest: Exp::int(0x3000),
            args: vec![Assign::new(Exp::reg(4), Exp::int(1))],
            defines: vec![
                Assign::new(Exp::reg(24), Exp::reg(24)),
                Assign::new(Exp::flags(), Exp::flags()),
            ],
            signature: None,
        };
        let s = Statement::new(StmtKind::Call(call));
        let defs = s.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0], Exp::reg(24));
    }
}
