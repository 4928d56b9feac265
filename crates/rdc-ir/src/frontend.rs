//! Front-end contract.
//!
//! Instruction decoding lives outside the core. A front end hands over
//! lifted blocks whose instructions are already expressed as statement
//! kinds, with sequence numbers unassigned and owner pointers unset;
//! the statement-init pass turns them into a numbered CFG.

use rdc_util::Address;
use thiserror::Error;

use crate::stmt::StmtKind;

/// One decoded basic block, in decoding order.
#[derive(Debug, Clone)]
pub struct LiftedBlock {
    pub lo: Address,
    pub hi: Address,
    pub stmts: Vec<StmtKind>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no instruction at {addr}")]
    BadAddress { addr: Address },

    #[error("decoder failure at {addr}: {reason}")]
    Failed { addr: Address, reason: String },
}

/// A machine front end. Implementations decode from a binary image and
/// lift to IR statements.
pub trait Lifter {
    fn decode(&self, entry: Address) -> Result<Vec<LiftedBlock>, DecodeError>;
}

/// Read-only view of the loaded binary, for global-constant
/// replacement and switch-table reads.
pub trait ProgramImage {
    /// Read `width` bits at `addr` as a zero-extended word.
    fn read_word(&self, addr: Address, width: u16) -> Option<u64>;

    /// Is `addr` inside a read-only section?
    fn is_read_only(&self, addr: Address) -> bool;
}
