//! rdc-ir - Statement/expression IR and procedure CFG
//!
//! The middle layer of the decompiler: immutable expression trees, the
//! statement variant set, basic blocks with dominator information, and
//! the per-procedure arenas tying them together. Passes (in `rdc-passes`)
//! rewrite this representation; the front end produces it and the back
//! end consumes it through the contracts in [`frontend`] and [`codegen`].

use rdc_util::define_idx;
use thiserror::Error;

pub mod cfg;
pub mod codegen;
pub mod exp;
pub mod frontend;
pub mod proc;
pub mod stmt;
pub mod ty;

pub use cfg::{BasicBlock, Cfg, DominatorInfo};
pub use codegen::{emit, Codegen};
pub use exp::{is_location, Bindings, Const, Exp, ExpExt, Operator, SharedExp, SsaDef};
pub use frontend::{DecodeError, LiftedBlock, Lifter, ProgramImage};
pub use proc::{CallConv, Local, Param, Procedure, RetLoc, Signature};
pub use stmt::{
    cond_to_relational, Assign, BoolAssign, BranchKind, BranchStmt, CallStmt, CaseStmt, ExpRole,
    FnExpVisitor, FnModifier, GotoStmt, ImplicitAssign, PhiArg, PhiAssign, ReturnStmt, Statement,
    StmtExpVisitor, StmtKind, StmtModifier, StmtVisitor, SwitchForm, SwitchInfo, LOGICALFLAGS,
    SETFFLAGS, SUBFLAGS,
};
pub use ty::{Ty, TypeMap};

define_idx!(
    /// Index of a basic block in its procedure's block arena.
    BlockId
);

define_idx!(
    /// Index of a statement in its procedure's statement arena.
    ///
    /// Distinct from the statement's sequence number: ids are allocation
    /// order and never reused, numbers are the printable ordering that a
    /// renumbering pass may rewrite.
    StmtId
);

impl BlockId {
    /// Owner-pointer value of a statement not yet placed in a block.
    pub const INVALID: BlockId = BlockId(u32::MAX);
}

/// Fatal IR shape violations.
///
/// Passes log and skip recoverable oddities; constructing or mutating
/// structurally impossible IR surfaces one of these and abandons the
/// procedure.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("malformed IR at statement {stmt}: {reason}")]
    Malformed { stmt: u32, reason: String },
}
