//! Back-end contract.
//!
//! After the pipeline runs, the back end walks blocks in a structured
//! order and calls [`crate::Statement::generate_code`] on each
//! statement, which dispatches into this trait. The core guarantees at
//! that point: no phi statements remain, every live-in location has an
//! implicit assignment at entry, every assignment destination is a
//! known local or parameter symbol, and branch conditions are
//! high-level relationals wherever synthesis succeeded.

use crate::proc::Procedure;
use crate::stmt::{Assign, SwitchInfo};
use crate::SharedExp;

/// Code emitter implemented by the back end.
pub trait Codegen {
    fn add_assignment(&mut self, asgn: &Assign);
    fn add_goto(&mut self, dest: &SharedExp);
    fn add_branch(&mut self, cond: &SharedExp, dest: &SharedExp);
    fn add_case(&mut self, dest: &SharedExp, table: Option<&SwitchInfo>);
    fn add_call(&mut self, dest: &SharedExp, args: &[Assign], results: &[Assign]);
    fn add_return(&mut self, returns: &[Assign]);
}

/// Walk the procedure's blocks in reverse post-order and hand every
/// statement to the emitter.
pub fn emit(proc: &Procedure, gen: &mut dyn Codegen) {
    for block in proc.cfg.compute_rpo() {
        for &sid in &proc.cfg.blocks[block].stmts {
            proc.stmts[sid].generate_code(gen);
        }
    }
}
