//! Procedures.
//!
//! A [`Procedure`] owns the statement arena, the CFG, the signature and
//! the symbol tables the late passes fill in. Blocks refer to
//! statements by id and statements back to blocks by id, so the
//! ownership graph stays a tree while the reference graph is free to
//! be cyclic.

use std::rc::Rc;

use indexmap::IndexMap;
use rdc_util::{Address, FxHashMap, Symbol};

use crate::cfg::{Cfg, DominatorInfo};
use crate::exp::{Exp, ExpExt, SharedExp};
use crate::frontend::{LiftedBlock, ProgramImage};
use crate::stmt::{Statement, StmtKind};
use crate::ty::{Ty, TypeMap};
use crate::{BlockId, IrError, StmtId};

/// A declared parameter location.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub exp: SharedExp,
    pub name: Symbol,
    pub ty: Ty,
}

/// A returned-value location.
#[derive(Debug, Clone, PartialEq)]
pub struct RetLoc {
    pub exp: SharedExp,
    pub ty: Ty,
}

/// Calling convention facts the passes rely on.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConv {
    /// Stack pointer register number.
    pub sp_reg: u16,
    /// Locations the convention requires callees to preserve.
    pub callee_saved: Vec<SharedExp>,
}

impl CallConv {
    pub fn sp(&self) -> SharedExp {
        Exp::reg(self.sp_reg)
    }
}

/// Procedure signature: parameters, returns and convention.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub name: Symbol,
    pub params: Vec<Param>,
    pub returns: Vec<RetLoc>,
    pub conv: CallConv,
}

impl Signature {
    pub fn new(name: &str, conv: CallConv) -> Self {
        Signature {
            name: Symbol::intern(name),
            params: Vec::new(),
            returns: Vec::new(),
            conv,
        }
    }

    /// Is `loc` preserved across a call under this signature?
    pub fn preserves(&self, loc: &SharedExp) -> bool {
        let base = loc.base();
        self.conv.callee_saved.iter().any(|p| *p == base)
    }
}

/// A named local variable the back end will declare.
#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    pub name: Symbol,
    pub ty: Ty,
    /// The location this local replaced.
    pub base: SharedExp,
}

/// A user procedure under decompilation.
pub struct Procedure {
    pub name: Symbol,
    pub entry_addr: Address,
    pub signature: Signature,
    pub cfg: Cfg,
    pub stmts: rdc_util::IndexVec<StmtId, Statement>,
    /// Decoded input, consumed by the statement-init pass.
    pub lifted: Vec<LiftedBlock>,
    pub image: Option<Rc<dyn ProgramImage>>,
    /// Set by the dominators pass, reused by the SSA passes.
    pub dominators: Option<DominatorInfo>,
    /// Locations proved preserved by this procedure.
    pub preserved: Vec<SharedExp>,
    /// Location types, filled by local type analysis.
    pub types: TypeMap,
    /// Declared locals by name, in declaration order.
    pub locals: IndexMap<Symbol, Local>,
    /// SSA-defined location to emitted local name.
    pub symbol_map: FxHashMap<SharedExp, Symbol>,
    next_number: u32,
}

impl Procedure {
    pub fn new(name: &str, entry_addr: Address, signature: Signature) -> Self {
        Procedure {
            name: Symbol::intern(name),
            entry_addr,
            signature,
            cfg: Cfg::new(),
            stmts: rdc_util::IndexVec::new(),
            lifted: Vec::new(),
            image: None,
            dominators: None,
            preserved: Vec::new(),
            types: TypeMap::default(),
            locals: IndexMap::new(),
            symbol_map: FxHashMap::default(),
            next_number: 0,
        }
    }

    // ---- statement arena -------------------------------------------------

    /// Add an unplaced statement, assigning the next sequence number.
    pub fn add_stmt(&mut self, kind: StmtKind) -> StmtId {
        self.next_number += 1;
        let mut stmt = Statement::new(kind);
        stmt.number = self.next_number;
        self.stmts.push(stmt)
    }

    /// Add a statement at the end of `block`.
    pub fn append_stmt(&mut self, block: BlockId, kind: StmtKind) -> StmtId {
        let id = self.add_stmt(kind);
        self.stmts[id].block = block;
        self.cfg.blocks[block].stmts.push(id);
        id
    }

    /// Add a statement at position `index` within `block`.
    pub fn insert_stmt_at(&mut self, block: BlockId, index: usize, kind: StmtKind) -> StmtId {
        let id = self.add_stmt(kind);
        self.stmts[id].block = block;
        self.cfg.blocks[block].stmts.insert(index, id);
        id
    }

    /// Unlink a statement from its block. The arena slot survives so
    /// outstanding ids stay valid; callers fix up phi operands.
    pub fn remove_stmt(&mut self, id: StmtId) {
        let block = self.stmts[id].block;
        if block != BlockId::INVALID {
            let list = &mut self.cfg.blocks[block].stmts;
            if let Some(pos) = list.iter().position(|&s| s == id) {
                list.remove(pos);
            }
        }
        self.stmts[id].block = BlockId::INVALID;
    }

    pub fn is_placed(&self, id: StmtId) -> bool {
        self.stmts[id].block != BlockId::INVALID
    }

    /// All placed statements, blocks in arena order, statements in
    /// block order. Deterministic and cheap; passes that need RPO use
    /// the dominator info instead.
    pub fn stmt_order(&self) -> Vec<StmtId> {
        let mut order = Vec::with_capacity(self.stmts.len());
        for (_, block) in self.cfg.blocks.iter_enumerated() {
            order.extend_from_slice(&block.stmts);
        }
        order
    }

    /// Renumber all placed statements in block order, compacting gaps
    /// left by removals.
    pub fn renumber(&mut self) {
        let order = self.stmt_order();
        let mut number = 0;
        for id in order {
            number += 1;
            self.stmts[id].number = number;
        }
        self.next_number = number;
    }

    /// Find a placed statement by its sequence number.
    pub fn stmt_by_number(&self, number: u32) -> Option<StmtId> {
        self.stmt_order()
            .into_iter()
            .find(|&id| self.stmts[id].number == number)
    }

    /// Locations this procedure defines, in first-definition order.
    pub fn defined_locations(&self) -> Vec<SharedExp> {
        let mut locations = Vec::new();
        for id in self.stmt_order() {
            for def in self.stmts[id].definitions() {
                let base = def.strip_subscripts();
                if !locations.contains(&base) {
                    locations.push(base);
                }
            }
        }
        locations
    }

    // ---- branch edge convention ------------------------------------------

    /// The taken successor of a branch: the successor whose low address
    /// equals the branch's fixed destination.
    pub fn branch_taken_block(&self, id: StmtId) -> Option<BlockId> {
        let (block, dest) = self.branch_parts(id)?;
        let succs = self.cfg.blocks[block].successors();
        if self.cfg.blocks[succs[0]].lo == dest {
            Some(succs[0])
        } else {
            Some(succs[1])
        }
    }

    /// The fall-through successor of a branch.
    pub fn branch_fall_block(&self, id: StmtId) -> Option<BlockId> {
        let (block, dest) = self.branch_parts(id)?;
        let succs = self.cfg.blocks[block].successors();
        if self.cfg.blocks[succs[0]].lo == dest {
            Some(succs[1])
        } else {
            Some(succs[0])
        }
    }

    fn branch_parts(&self, id: StmtId) -> Option<(BlockId, Address)> {
        let stmt = &self.stmts[id];
        let StmtKind::Branch(b) = &stmt.kind else {
            return None;
        };
        let dest = b.fixed_dest();
        if dest == Address::INVALID || stmt.block == BlockId::INVALID {
            return None;
        }
        if self.cfg.blocks[stmt.block].num_successors() != 2 {
            return None;
        }
        Some((stmt.block, dest))
    }

    /// Retarget the taken edge at `target`, atomically rewiring
    /// predecessor lists and keeping the slot-0 convention: after this,
    /// successor 0 is the taken edge and its low address equals the
    /// branch's fixed destination.
    pub fn set_branch_taken(&mut self, id: StmtId, target: BlockId) -> Result<(), IrError> {
        let (block, dest) = self.require_branch(id)?;
        let succs = self.cfg.blocks[block].successors();
        let taken_slot = usize::from(self.cfg.blocks[succs[0]].lo != dest);

        self.cfg.set_successor(block, taken_slot, target);
        if taken_slot != 0 {
            self.swap_successors(block);
        }
        let new_dest = self.cfg.blocks[target].lo;
        if let StmtKind::Branch(b) = &mut self.stmts[id].kind {
            b.dest = Exp::int(new_dest.value() as i64);
        }
        Ok(())
    }

    /// Retarget the fall-through edge at `target`; the taken edge stays
    /// in slot 0.
    pub fn set_branch_fall(&mut self, id: StmtId, target: BlockId) -> Result<(), IrError> {
        let (block, dest) = self.require_branch(id)?;
        let succs = self.cfg.blocks[block].successors();
        let taken_slot = usize::from(self.cfg.blocks[succs[0]].lo != dest);
        let fall_slot = 1 - taken_slot;

        self.cfg.set_successor(block, fall_slot, target);
        if taken_slot != 0 {
            self.swap_successors(block);
        }
        Ok(())
    }

    fn swap_successors(&mut self, block: BlockId) {
        let a = self.cfg.blocks[block].successors()[0];
        let b = self.cfg.blocks[block].successors()[1];
        // Re-point both slots; set_successor keeps predecessors right.
        self.cfg.set_successor(block, 0, b);
        self.cfg.set_successor(block, 1, a);
    }

    fn require_branch(&self, id: StmtId) -> Result<(BlockId, Address), IrError> {
        let stmt = &self.stmts[id];
        let number = stmt.number;
        let StmtKind::Branch(b) = &stmt.kind else {
            return Err(IrError::Malformed {
                stmt: number,
                reason: "edge mutation on a non-branch statement".into(),
            });
        };
        let dest = b.fixed_dest();
        if dest == Address::INVALID {
            return Err(IrError::Malformed {
                stmt: number,
                reason: "edge mutation on a branch without a fixed destination".into(),
            });
        }
        let block = stmt.block;
        if block == BlockId::INVALID || self.cfg.blocks[block].num_successors() != 2 {
            return Err(IrError::Malformed {
                stmt: number,
                reason: "branch block does not have exactly two successors".into(),
            });
        }
        Ok((block, dest))
    }

    // ---- symbols ---------------------------------------------------------

    /// Invent a fresh local for `base` and record the mapping.
    pub fn new_local(&mut self, base: &SharedExp, ty: Ty) -> Symbol {
        let name = Symbol::intern(&format!("local{}", self.locals.len()));
        self.locals.insert(
            name,
            Local {
                name,
                ty,
                base: Rc::clone(base),
            },
        );
        self.symbol_map.insert(Rc::clone(base), name);
        name
    }

    /// The stack pointer location under this procedure's convention.
    pub fn sp(&self) -> SharedExp {
        self.signature.conv.sp()
    }

    pub fn is_sp(&self, e: &SharedExp) -> bool {
        e.base().reg_num() == Some(self.signature.conv.sp_reg)
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("entry", &self.entry_addr)
            .field("blocks", &self.cfg.blocks.len())
            .field("stmts", &self.stmts.len())
            .finish()
    }
}

impl std::fmt::Display for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "proc {} @ {}", self.name, self.entry_addr)?;
        for (id, block) in self.cfg.blocks.iter_enumerated() {
            writeln!(
                f,
                "bb{} [{}..{}] succ {:?}",
                id.0,
                block.lo,
                block.hi,
                block.successors().iter().map(|s| s.0).collect::<Vec<_>>()
            )?;
            for &sid in &block.stmts {
                writeln!(f, "  {}", self.stmts[sid])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::{Assign, BranchKind, BranchStmt};

    fn test_conv() -> CallConv {
        CallConv {
            sp_reg: 28,
            callee_saved: vec![Exp::reg(28), Exp::reg(29)],
        }
    }

    fn proc_with_branch() -> (Procedure, StmtId, [BlockId; 3]) {
        let mut proc = Procedure::new(
            "test",
            Address::new(0x100),
            Signature::new("test", test_conv()),
        );
        let a = proc.cfg.new_block(Address::new(0x100), Address::new(0x104));
        let taken = proc.cfg.new_block(Address::new(0x200), Address::new(0x204));
        let fall = proc.cfg.new_block(Address::new(0x108), Address::new(0x10c));
        proc.cfg.entry = a;
        // slot 0 is the taken edge
        proc.cfg.add_edge(a, taken);
        proc.cfg.add_edge(a, fall);

        let id = proc.append_stmt(
            a,
            StmtKind::Branch(BranchStmt::new(Address::new(0x200), BranchKind::Je)),
        );
        (proc, id, [a, taken, fall])
    }

    #[test]
    fn sequence_numbers_are_unique_and_stable() {
        let mut proc = Procedure::new(
            "t",
            Address::ZERO,
            Signature::new("t", test_conv()),
        );
        let b = proc.cfg.new_block(Address::ZERO, Address::ZERO);
        let s1 = proc.append_stmt(b, StmtKind::Assign(Assign::new(Exp::reg(1), Exp::int(0))));
        let s2 = proc.append_stmt(b, StmtKind::Assign(Assign::new(Exp::reg(2), Exp::int(1))));
        assert_eq!(proc.stmts[s1].number, 1);
        assert_eq!(proc.stmts[s2].number, 2);

        proc.remove_stmt(s1);
        proc.renumber();
        assert_eq!(proc.stmts[s2].number, 1);
        assert!(!proc.is_placed(s1));
    }

    #[test]
    fn taken_and_fall_follow_address_convention() {
        let (proc, id, [_, taken, fall]) = proc_with_branch();
        assert_eq!(proc.branch_taken_block(id), Some(taken));
        assert_eq!(proc.branch_fall_block(id), Some(fall));
    }

    #[test]
    fn set_taken_keeps_slot_zero_convention() {
        let (mut proc, id, [a, _, _]) = proc_with_branch();
        let new_taken = proc.cfg.new_block(Address::new(0x300), Address::new(0x304));
        proc.set_branch_taken(id, new_taken).unwrap();

        assert!(proc.cfg.edges_consistent());
        assert_eq!(proc.branch_taken_block(id), Some(new_taken));
        let succ0 = proc.cfg.blocks[a].successors()[0];
        let dest = match &proc.stmts[id].kind {
            StmtKind::Branch(b) => b.fixed_dest(),
            _ => unreachable!(),
        };
        assert_eq!(proc.cfg.blocks[succ0].lo, dest);
    }

    #[test]
    fn set_fall_rewires_predecessors() {
        let (mut proc, id, [_, _, fall]) = proc_with_branch();
        let new_fall = proc.cfg.new_block(Address::new(0x400), Address::new(0x404));
        proc.set_branch_fall(id, new_fall).unwrap();

        assert!(proc.cfg.edges_consistent());
        assert_eq!(proc.branch_fall_block(id), Some(new_fall));
        assert!(proc.cfg.blocks[fall].predecessors().is_empty());
    }

    #[test]
    fn edge_mutation_without_two_successors_is_fatal() {
        let mut proc = Procedure::new(
            "t",
            Address::ZERO,
            Signature::new("t", test_conv()),
        );
        let b = proc.cfg.new_block(Address::ZERO, Address::ZERO);
        let id = proc.append_stmt(
            b,
            StmtKind::Branch(BranchStmt::new(Address::new(0x200), BranchKind::Je)),
        );
        let target = proc.cfg.new_block(Address::new(0x200), Address::new(0x204));
        assert!(proc.set_branch_taken(id, target).is_err());
    }

    #[test]
    fn sp_recognition() {
        let proc = Procedure::new(
            "t",
            Address::ZERO,
            Signature::new("t", test_conv()),
        );
        assert!(proc.is_sp(&Exp::reg(28)));
        assert!(proc.is_sp(&Exp::subscript(Exp::reg(28), crate::SsaDef::Implicit)));
        assert!(!proc.is_sp(&Exp::reg(24)));
    }
}
