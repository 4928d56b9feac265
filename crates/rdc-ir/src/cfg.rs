//! Basic blocks and the procedure control-flow graph.
//!
//! Blocks live in an arena indexed by [`BlockId`]; edges are id pairs
//! kept consistent in both directions by the mutation primitives here.
//! The reverse post-order is cached and invalidated by any edge or
//! block mutation. Dominator information is computed on demand with the
//! iterative algorithm over RPO and handed back as a separate value so
//! passes can hold it while mutating statements.

use rdc_util::{Address, FxHashSet, IndexVec};

use crate::{BlockId, StmtId};

/// A basic block: address range, ordered statements, and the two edge
/// vectors. Only the last statement may be a terminator.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub lo: Address,
    pub hi: Address,
    pub stmts: Vec<StmtId>,
    succs: Vec<BlockId>,
    preds: Vec<BlockId>,
}

impl BasicBlock {
    pub fn new(lo: Address, hi: Address) -> Self {
        BasicBlock {
            lo,
            hi,
            stmts: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
        }
    }

    pub fn successors(&self) -> &[BlockId] {
        &self.succs
    }

    pub fn predecessors(&self) -> &[BlockId] {
        &self.preds
    }

    pub fn num_successors(&self) -> usize {
        self.succs.len()
    }

    pub fn num_predecessors(&self) -> usize {
        self.preds.len()
    }
}

/// Control-flow graph of one procedure.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: IndexVec<BlockId, BasicBlock>,
    pub entry: BlockId,
    rpo_cache: Option<Vec<BlockId>>,
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

impl Cfg {
    pub fn new() -> Self {
        Cfg {
            blocks: IndexVec::new(),
            entry: BlockId(0),
            rpo_cache: None,
        }
    }

    pub fn new_block(&mut self, lo: Address, hi: Address) -> BlockId {
        self.rpo_cache = None;
        self.blocks.push(BasicBlock::new(lo, hi))
    }

    /// Block whose low address is `addr`, if any.
    pub fn block_at(&self, addr: Address) -> Option<BlockId> {
        self.blocks
            .iter_enumerated()
            .find(|(_, b)| b.lo == addr)
            .map(|(id, _)| id)
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.rpo_cache = None;
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) {
        self.rpo_cache = None;
        if let Some(pos) = self.blocks[from].succs.iter().position(|&s| s == to) {
            self.blocks[from].succs.remove(pos);
        }
        if let Some(pos) = self.blocks[to].preds.iter().position(|&p| p == from) {
            self.blocks[to].preds.remove(pos);
        }
    }

    /// Point successor slot `index` of `from` at `to`, rewiring the old
    /// target's predecessor list in the same step.
    pub fn set_successor(&mut self, from: BlockId, index: usize, to: BlockId) {
        self.rpo_cache = None;
        let old = self.blocks[from].succs[index];
        if let Some(pos) = self.blocks[old].preds.iter().position(|&p| p == from) {
            self.blocks[old].preds.remove(pos);
        }
        self.blocks[from].succs[index] = to;
        self.blocks[to].preds.push(from);
    }

    /// Insert a fresh empty block on the edge `from -> to`; used to
    /// create a safe site for edge copies and implicit placements.
    pub fn split_edge(&mut self, from: BlockId, to: BlockId) -> BlockId {
        let lo = self.blocks[to].lo;
        let mid = self.new_block(lo, lo);

        let slot = self.blocks[from]
            .succs
            .iter()
            .position(|&s| s == to)
            .expect("split_edge: edge does not exist");
        self.blocks[from].succs[slot] = mid;

        let back = self.blocks[to]
            .preds
            .iter()
            .position(|&p| p == from)
            .expect("split_edge: reverse edge does not exist");
        self.blocks[to].preds[back] = mid;

        self.blocks[mid].preds.push(from);
        self.blocks[mid].succs.push(to);
        mid
    }

    /// Cached reverse post-order from the entry block. Unreachable
    /// blocks do not appear.
    pub fn reverse_post_order(&mut self) -> &[BlockId] {
        if self.rpo_cache.is_none() {
            self.rpo_cache = Some(self.compute_rpo());
        }
        self.rpo_cache.as_deref().unwrap()
    }

    /// Uncached RPO computation.
    pub fn compute_rpo(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut visited = FxHashSet::default();
        if self.blocks.is_empty() {
            return order;
        }

        // Iterative postorder DFS; frame second field is the next
        // successor slot to visit.
        let mut stack = vec![(self.entry, 0usize)];
        visited.insert(self.entry);
        while let Some((block, slot)) = stack.pop() {
            let succs = &self.blocks[block].succs;
            if slot < succs.len() {
                stack.push((block, slot + 1));
                let next = succs[slot];
                if visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                order.push(block);
            }
        }
        order.reverse();
        order
    }

    /// Compute immediate dominators and dominance frontiers.
    pub fn compute_dominators(&self) -> DominatorInfo {
        let rpo = self.compute_rpo();
        let n = self.blocks.len();

        let mut rpo_index: IndexVec<BlockId, Option<usize>> =
            (0..n).map(|_| None).collect();
        for (i, &b) in rpo.iter().enumerate() {
            rpo_index[b] = Some(i);
        }

        let mut idom: IndexVec<BlockId, Option<BlockId>> = (0..n).map(|_| None).collect();
        idom[self.entry] = Some(self.entry);

        // Iterate to a fixed point in reverse post-order; intersection
        // walks idom chains towards the entry.
        let intersect = |idom: &IndexVec<BlockId, Option<BlockId>>,
                         rpo_index: &IndexVec<BlockId, Option<usize>>,
                         mut a: BlockId,
                         mut b: BlockId| {
            while a != b {
                while rpo_index[a] > rpo_index[b] {
                    a = idom[a].unwrap();
                }
                while rpo_index[b] > rpo_index[a] {
                    b = idom[b].unwrap();
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in self.blocks[b].preds.iter() {
                    if idom.get(p).copied().flatten().is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &rpo_index, cur, p),
                    });
                }
                if new_idom.is_some() && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        // Dominance frontiers over the merge blocks.
        let mut frontier: IndexVec<BlockId, Vec<BlockId>> =
            (0..n).map(|_| Vec::new()).collect();
        for &b in &rpo {
            if self.blocks[b].preds.len() < 2 {
                continue;
            }
            let Some(b_idom) = idom[b] else { continue };
            for &p in self.blocks[b].preds.iter() {
                if rpo_index[p].is_none() {
                    continue;
                }
                let mut runner = p;
                while runner != b_idom {
                    if !frontier[runner].contains(&b) {
                        frontier[runner].push(b);
                    }
                    match idom[runner] {
                        Some(next) if next != runner => runner = next,
                        _ => break,
                    }
                }
            }
        }

        // Dominator-tree children, in RPO for deterministic walks.
        let mut children: IndexVec<BlockId, Vec<BlockId>> =
            (0..n).map(|_| Vec::new()).collect();
        for &b in rpo.iter().skip(1) {
            if let Some(parent) = idom[b] {
                children[parent].push(b);
            }
        }

        DominatorInfo {
            idom,
            frontier,
            children,
            rpo,
            rpo_index,
        }
    }

    /// Both edge vectors agree: `B in succ(A)` iff `A in pred(B)`.
    pub fn edges_consistent(&self) -> bool {
        for (a, block) in self.blocks.iter_enumerated() {
            for &b in block.succs.iter() {
                if !self.blocks.contains_index(b) {
                    return false;
                }
                let forward = block.succs.iter().filter(|&&s| s == b).count();
                let backward = self.blocks[b].preds.iter().filter(|&&p| p == a).count();
                if forward != backward {
                    return false;
                }
            }
            for &p in block.preds.iter() {
                if !self.blocks.contains_index(p) {
                    return false;
                }
                if !self.blocks[p].succs.contains(&a) {
                    return false;
                }
            }
        }
        true
    }
}

/// Immediate dominators, dominance frontiers and traversal orders for
/// one snapshot of the CFG.
#[derive(Debug, Clone)]
pub struct DominatorInfo {
    pub idom: IndexVec<BlockId, Option<BlockId>>,
    pub frontier: IndexVec<BlockId, Vec<BlockId>>,
    /// Dominator-tree children of each block.
    pub children: IndexVec<BlockId, Vec<BlockId>>,
    pub rpo: Vec<BlockId>,
    pub rpo_index: IndexVec<BlockId, Option<usize>>,
}

impl DominatorInfo {
    /// Does `a` dominate `b`? Reflexive.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cursor = b;
        loop {
            if cursor == a {
                return true;
            }
            match self.idom[cursor] {
                Some(parent) if parent != cursor => cursor = parent,
                _ => return false,
            }
        }
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo_index[b].is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A -> B, A -> C, B -> D, C -> D
    fn diamond() -> (Cfg, [BlockId; 4]) {
        let mut cfg = Cfg::new();
        let a = cfg.new_block(Address::new(0x100), Address::new(0x104));
        let b = cfg.new_block(Address::new(0x108), Address::new(0x10c));
        let c = cfg.new_block(Address::new(0x110), Address::new(0x114));
        let d = cfg.new_block(Address::new(0x118), Address::new(0x11c));
        cfg.entry = a;
        cfg.add_edge(a, b);
        cfg.add_edge(a, c);
        cfg.add_edge(b, d);
        cfg.add_edge(c, d);
        (cfg, [a, b, c, d])
    }

    #[test]
    fn edges_are_mutually_consistent() {
        let (cfg, _) = diamond();
        assert!(cfg.edges_consistent());
    }

    #[test]
    fn rpo_starts_at_entry_and_covers_reachable() {
        let (mut cfg, [a, _, _, d]) = diamond();
        let rpo = cfg.reverse_post_order().to_vec();
        assert_eq!(rpo.len(), 4);
        assert_eq!(rpo[0], a);
        assert_eq!(*rpo.last().unwrap(), d);
    }

    #[test]
    fn rpo_cache_invalidated_by_edge_mutation() {
        let (mut cfg, [a, b, _, d]) = diamond();
        let before = cfg.reverse_post_order().len();
        assert_eq!(before, 4);

        cfg.remove_edge(a, b);
        cfg.remove_edge(b, d);
        let after = cfg.reverse_post_order().len();
        assert_eq!(after, 3);
    }

    #[test]
    fn diamond_dominators() {
        let (cfg, [a, b, c, d]) = diamond();
        let dom = cfg.compute_dominators();
        assert_eq!(dom.idom[b], Some(a));
        assert_eq!(dom.idom[c], Some(a));
        assert_eq!(dom.idom[d], Some(a));
        assert!(dom.dominates(a, d));
        assert!(!dom.dominates(b, d));

        // b and c each have d in their dominance frontier
        assert_eq!(dom.frontier[b], vec![d]);
        assert_eq!(dom.frontier[c], vec![d]);
        assert!(dom.frontier[a].is_empty());
    }

    #[test]
    fn loop_frontier_contains_header() {
        // entry -> header -> body -> header, header -> exit
        let mut cfg = Cfg::new();
        let entry = cfg.new_block(Address::new(0), Address::new(4));
        let header = cfg.new_block(Address::new(8), Address::new(12));
        let body = cfg.new_block(Address::new(16), Address::new(20));
        let exit = cfg.new_block(Address::new(24), Address::new(28));
        cfg.entry = entry;
        cfg.add_edge(entry, header);
        cfg.add_edge(header, body);
        cfg.add_edge(body, header);
        cfg.add_edge(header, exit);

        let dom = cfg.compute_dominators();
        assert!(dom.frontier[body].contains(&header));
        assert!(dom.frontier[header].contains(&header));
    }

    #[test]
    fn split_edge_preserves_consistency() {
        let (mut cfg, [a, b, _, _]) = diamond();
        let mid = cfg.split_edge(a, b);
        assert!(cfg.edges_consistent());
        assert_eq!(cfg.blocks[mid].successors(), &[b]);
        assert_eq!(cfg.blocks[mid].predecessors(), &[a]);
        assert!(cfg.blocks[a].successors().contains(&mid));
        assert!(!cfg.blocks[a].successors().contains(&b));
    }

    #[test]
    fn set_successor_rewires_predecessors() {
        let (mut cfg, [a, b, c, _]) = diamond();
        // point a's first successor (b) at c instead
        cfg.set_successor(a, 0, c);
        assert!(cfg.edges_consistent());
        assert!(!cfg.blocks[b].predecessors().contains(&a));
        assert_eq!(
            cfg.blocks[c].predecessors().iter().filter(|&&p| p == a).count(),
            2
        );
    }
}
