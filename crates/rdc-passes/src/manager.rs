//! The pass registry.
//!
//! A process-wide table mapping every [`PassId`] to its single pass
//! instance, plus named groups of pass ids. Built once at first use and
//! read-only afterwards. Executing an unknown group is a configuration
//! error surfaced to the driver; everything else logs and carries on.

use std::sync::LazyLock;

use rdc_ir::Procedure;
use rdc_util::FxHashMap;

use crate::dataflow::{BlockVarRenamePass, DominatorsPass, PhiPlacementPass};
use crate::early::{
    BBSimplifyPass, GlobalConstReplacePass, StatementInitPass, StatementPropagationPass,
};
use crate::late::{
    BranchAnalysisPass, CallLivenessRemovalPass, FinalParameterSearchPass, FromSSAFormPass,
    ImplicitPlacementPass, LocalAndParamMapPass, UnusedLocalRemovalPass, UnusedParamRemovalPass,
    UnusedStatementRemovalPass,
};
use crate::middle::{
    AssignRemovalPass, CallAndPhiFixPass, DuplicateArgsRemovalPass, ParameterSymbolMapPass,
    PreservationAnalysisPass, SPPreservationPass, StrengthReductionReversalPass,
};
use crate::typing::LocalTypeAnalysisPass;
use crate::PassError;

/// Closed enumeration of every pass the pipeline knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Dominators,
    PhiPlacement,
    BlockVarRename,
    StatementInit,
    GlobalConstReplace,
    BBSimplify,
    StatementPropagation,
    CallAndPhiFix,
    SPPreservation,
    PreservationAnalysis,
    StrengthReductionReversal,
    AssignRemoval,
    DuplicateArgsRemoval,
    ParameterSymbolMap,
    LocalTypeAnalysis,
    BranchAnalysis,
    CallLivenessRemoval,
    UnusedStatementRemoval,
    FromSSAForm,
    FinalParameterSearch,
    UnusedLocalRemoval,
    UnusedParamRemoval,
    ImplicitPlacement,
    LocalAndParamMap,
}

impl PassId {
    pub const NUM_PASSES: usize = 24;

    const fn index(self) -> usize {
        self as usize
    }
}

/// A single transformation or analysis over one procedure.
pub trait Pass: Send + Sync {
    fn id(&self) -> PassId;

    fn name(&self) -> &'static str;

    /// Run over `proc`; report whether the procedure changed.
    fn execute(&self, proc: &mut Procedure) -> Result<bool, PassError>;
}

static PASS_MANAGER: LazyLock<PassManager> = LazyLock::new(PassManager::new);

/// Registry of pass instances and named groups.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    groups: FxHashMap<&'static str, Vec<PassId>>,
}

impl PassManager {
    /// The process-wide registry.
    pub fn get() -> &'static PassManager {
        &PASS_MANAGER
    }

    fn new() -> Self {
        let mut mgr = PassManager {
            passes: Vec::with_capacity(PassId::NUM_PASSES),
            groups: FxHashMap::default(),
        };

        mgr.register(Box::new(DominatorsPass));
        mgr.register(Box::new(PhiPlacementPass));
        mgr.register(Box::new(BlockVarRenamePass));
        mgr.register(Box::new(StatementInitPass));
        mgr.register(Box::new(GlobalConstReplacePass));
        mgr.register(Box::new(BBSimplifyPass));
        mgr.register(Box::new(StatementPropagationPass));
        mgr.register(Box::new(CallAndPhiFixPass));
        mgr.register(Box::new(SPPreservationPass));
        mgr.register(Box::new(PreservationAnalysisPass));
        mgr.register(Box::new(StrengthReductionReversalPass));
        mgr.register(Box::new(AssignRemovalPass));
        mgr.register(Box::new(DuplicateArgsRemovalPass));
        mgr.register(Box::new(ParameterSymbolMapPass));
        mgr.register(Box::new(LocalTypeAnalysisPass));
        mgr.register(Box::new(BranchAnalysisPass));
        mgr.register(Box::new(CallLivenessRemovalPass));
        mgr.register(Box::new(UnusedStatementRemovalPass));
        mgr.register(Box::new(FromSSAFormPass));
        mgr.register(Box::new(FinalParameterSearchPass));
        mgr.register(Box::new(UnusedLocalRemovalPass));
        mgr.register(Box::new(UnusedParamRemovalPass));
        mgr.register(Box::new(ImplicitPlacementPass));
        mgr.register(Box::new(LocalAndParamMapPass));
        debug_assert_eq!(mgr.passes.len(), PassId::NUM_PASSES);

        mgr.create_group(
            "early",
            vec![
                PassId::StatementInit,
                PassId::GlobalConstReplace,
                PassId::BBSimplify,
                PassId::StatementPropagation,
            ],
        );
        mgr.create_group(
            "ssa",
            vec![
                PassId::Dominators,
                PassId::PhiPlacement,
                PassId::BlockVarRename,
            ],
        );
        mgr.create_group(
            "middle",
            vec![
                PassId::CallAndPhiFix,
                PassId::SPPreservation,
                PassId::PreservationAnalysis,
                PassId::StrengthReductionReversal,
                PassId::AssignRemoval,
                PassId::DuplicateArgsRemoval,
                PassId::ParameterSymbolMap,
            ],
        );
        mgr.create_group("type", vec![PassId::LocalTypeAnalysis]);
        mgr.create_group(
            "late",
            vec![
                PassId::BranchAnalysis,
                PassId::CallLivenessRemoval,
                PassId::UnusedStatementRemoval,
                PassId::FromSSAForm,
                PassId::FinalParameterSearch,
                PassId::UnusedLocalRemoval,
                PassId::UnusedParamRemoval,
                PassId::ImplicitPlacement,
                PassId::LocalAndParamMap,
            ],
        );

        mgr
    }

    fn register(&mut self, pass: Box<dyn Pass>) {
        debug_assert_eq!(
            pass.id().index(),
            self.passes.len(),
            "passes must be registered in PassId order"
        );
        self.passes.push(pass);
    }

    fn create_group(&mut self, name: &'static str, passes: Vec<PassId>) {
        let existing = self.groups.insert(name, passes);
        debug_assert!(existing.is_none(), "pass group '{name}' registered twice");
    }

    pub fn pass(&self, id: PassId) -> &dyn Pass {
        self.passes[id.index()].as_ref()
    }

    /// Execute one pass, logging entry at verbose level.
    pub fn execute_pass(&self, id: PassId, proc: &mut Procedure) -> Result<bool, PassError> {
        let pass = self.pass(id);
        log::debug!("executing pass '{}' for '{}'", pass.name(), proc.name);
        let changed = pass.execute(proc)?;
        log::trace!(
            "pass '{}' {} '{}'",
            pass.name(),
            if changed { "changed" } else { "did not change" },
            proc.name
        );
        Ok(changed)
    }

    /// Execute one pass repeatedly until it reports no change.
    pub fn execute_pass_fixpoint(
        &self,
        id: PassId,
        proc: &mut Procedure,
    ) -> Result<bool, PassError> {
        let mut any = false;
        // Each productive iteration strictly reduces statement and use
        // counts; the cap is a backstop against rule bugs.
        for _ in 0..64 {
            if !self.execute_pass(id, proc)? {
                break;
            }
            any = true;
        }
        Ok(any)
    }

    /// Execute the passes of a named group in declared order.
    pub fn execute_group(&self, name: &str, proc: &mut Procedure) -> Result<bool, PassError> {
        let Some(ids) = self.groups.get(name) else {
            return Err(PassError::UnknownGroup(name.to_owned()));
        };
        log::debug!("executing pass group '{}' for '{}'", name, proc.name);

        let mut changed = false;
        for &id in ids {
            changed |= self.execute_pass(id, proc)?;
        }
        Ok(changed)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdc_ir::{CallConv, Signature};
    use rdc_util::Address;

    fn empty_proc() -> Procedure {
        let conv = CallConv {
            sp_reg: 28,
            callee_saved: vec![],
        };
        Procedure::new("p", Address::ZERO, Signature::new("p", conv))
    }

    #[test]
    fn registry_knows_every_pass() {
        let pm = PassManager::get();
        assert_eq!(pm.pass(PassId::Dominators).name(), "Dominators");
        assert_eq!(pm.pass(PassId::LocalAndParamMap).id(), PassId::LocalAndParamMap);
    }

    #[test]
    fn unknown_group_is_fatal() {
        let pm = PassManager::get();
        let mut proc = empty_proc();
        let err = pm.execute_group("no-such-group", &mut proc);
        assert!(matches!(err, Err(PassError::UnknownGroup(_))));
    }

    #[test]
    fn groups_exist() {
        let pm = PassManager::get();
        for g in ["early", "ssa", "middle", "type", "late"] {
            assert!(pm.has_group(g), "group {g} missing");
        }
    }
}
