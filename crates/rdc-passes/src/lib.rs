//! rdc-passes - The procedure-level analysis pipeline
//!
//! An ordered catalogue of named passes over a single [`Procedure`],
//! composed into groups and executed for side effects. Every pass
//! reports whether it changed the procedure, which drives the driver's
//! fixed-point loops. Passes log diagnostics instead of failing;
//! only configuration errors and IR invariant violations are fatal.

use rdc_ir::{IrError, Procedure};
use thiserror::Error;

pub mod dataflow;
pub mod early;
pub mod late;
pub mod manager;
pub mod middle;
pub mod transform;
pub mod typing;

pub use manager::{Pass, PassId, PassManager};
pub use transform::{ExpRule, GenericExpTransformer, TransformError};

/// Fatal pass-pipeline errors.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("unknown pass group '{0}'")]
    UnknownGroup(String),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Run the canonical pipeline on one procedure: early simplification,
/// SSA construction, the middle analyses, type recovery, and the late
/// lowering back out of SSA form.
pub fn decompile(proc: &mut Procedure) -> Result<(), PassError> {
    let pm = PassManager::get();
    pm.execute_group("early", proc)?;
    pm.execute_group("ssa", proc)?;
    // Propagation bites hardest once uses carry their definitions.
    pm.execute_pass_fixpoint(PassId::StatementPropagation, proc)?;
    pm.execute_group("middle", proc)?;
    pm.execute_group("type", proc)?;
    pm.execute_group("late", proc)?;
    Ok(())
}
