// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Distribution tree. Each rank keeps one node per depth in a symmetric
//! window, plus a flat array of dominant flags that peers mutate with
//! one-sided atomics. The tree directs steals: a worker walks its locally
//! cached root-to-leaf path and picks the topmost node currently flagged
//! dominant, tolerating stale observations.
//!
//! The meaning of a dominant flag value:
//!          0 : undetermined
//!    version : the node with this version is dominant
//!   -version : the node with this version is removed and non-dominant

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        drange::DistRange,
        flipper::Flipper,
    },
    topology::{
        window::{
            self,
            SymmetricWindow,
        },
        Rank,
        Topology,
    },
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::RefCell,
    mem,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Arena-style reference to a tree node: never a pointer, always
/// `(owner rank, depth)`. The root sentinel is `{-1, -1}`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef {
    pub owner_rank: Rank,
    pub depth: i32,
}

/// One tree node. Plain old data; the slot at a given depth is reused by
/// successive task groups, disambiguated by `version` and `tg_version`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub parent: NodeRef,
    pub drange: DistRange,
    pub tg_version: Flipper,
    pub version: i32,
    _pad: i32,
}

/// Per-worker slice of the distribution tree.
pub struct DistTree {
    max_depth: usize,
    node_win: SymmetricWindow,
    flag_win: SymmetricWindow,
    versions: Vec<i32>,
    my_rank: Rank,
    n_ranks: Rank,
    rng: RefCell<SmallRng>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Default for NodeRef {
    fn default() -> Self {
        Self {
            owner_rank: -1,
            depth: -1,
        }
    }
}

impl Node {
    pub fn depth(&self) -> i32 {
        self.parent.depth + 1
    }
}

impl DistTree {
    /// Collectively creates the tree with `max_depth` slots per rank.
    pub fn create(topo: &Topology, max_depth: usize) -> Result<Self, Fail> {
        let node_win: SymmetricWindow = SymmetricWindow::create(topo, "dtree-node", max_depth * mem::size_of::<Node>())?;
        let flag_win: SymmetricWindow = SymmetricWindow::create(topo, "dtree-flag", max_depth * mem::size_of::<i32>())?;
        let my_rank: Rank = topo.my_rank();
        Ok(Self {
            max_depth,
            node_win,
            flag_win,
            versions: vec![my_rank + 1; max_depth],
            my_rank,
            n_ranks: topo.n_ranks(),
            rng: RefCell::new(SmallRng::seed_from_u64(0x647472 + my_rank as u64)),
        })
    }

    /// Appends a node below `parent` into the local slot at the next depth
    /// and returns a reference to it.
    pub fn append(&mut self, parent: NodeRef, drange: DistRange, tg_version: Flipper) -> NodeRef {
        let depth: i32 = parent.depth + 1;
        assert!(
            (depth as usize) < self.max_depth,
            "distribution tree depth exhausted (max_depth={})",
            self.max_depth
        );

        // Versions of distinct ranks never collide modulo n_ranks; overflow
        // wraps back to this rank's residue.
        let d: usize = depth as usize;
        if self.versions[d] >= i32::MAX - self.n_ranks {
            self.versions[d] = self.my_rank + 1;
        }
        self.versions[d] += self.n_ranks;

        let node: Node = Node {
            parent,
            drange,
            tg_version,
            version: self.versions[d],
            _pad: 0,
        };
        unsafe { self.node_ptr(self.my_rank, depth).write(node) };

        NodeRef {
            owner_rank: self.my_rank,
            depth,
        }
    }

    /// Publishes the dominance of `nr`: locally, and one-sidedly at the owner
    /// when the node is remote.
    pub fn set_dominant(&self, nr: NodeRef, dominant: bool) {
        let version: i32 = self.local_node(nr.depth).version;
        let value: i32 = if dominant { version } else { -version };

        window::atomic_put_i32(self.flag_ptr(self.my_rank, nr.depth), value);

        if nr.owner_rank != self.my_rank {
            window::atomic_put_i32(self.flag_ptr(nr.owner_rank, nr.depth), value);
        }
    }

    /// Walks depths `0..=nr.depth` and returns the topmost node whose
    /// dominant flag matches its version. For remote nodes whose dominance is
    /// not yet settled locally, a *random* rank inside the node's range is
    /// queried (or informed) instead of the owner, spreading the propagation
    /// load over the range.
    pub fn get_topmost_dominant(&self, nr: NodeRef) -> Option<Node> {
        if nr.depth < 0 {
            return None;
        }

        for d in 0..=nr.depth {
            let owner_rank: Rank = if d == nr.depth {
                nr.owner_rank
            } else {
                self.local_node(d + 1).parent.owner_rank
            };

            let n: Node = self.local_node(d);
            let flag_local: *mut i32 = self.flag_ptr(self.my_rank, d);

            debug_assert_eq!(n.parent.depth, d - 1);
            debug_assert_ne!(n.version, 0);

            if owner_rank != self.my_rank && window::atomic_get_i32(flag_local) != -n.version {
                debug_assert_eq!(owner_rank, n.drange.begin_rank());
                let target_rank: Rank = self.random_rank(owner_rank, n.drange.end_rank() - 1);

                if target_rank != owner_rank && window::atomic_get_i32(flag_local) == n.version {
                    // We believe the node is dominant: propagate the flag to
                    // the informant if it still holds 0.
                    let observed: i32 = window::atomic_cas_i32(self.flag_ptr(target_rank, d), 0, n.version);
                    if observed == -n.version {
                        window::atomic_put_i32(flag_local, observed);
                    }
                } else {
                    // Read the informant's flag and adopt it if it refers to
                    // the same node generation.
                    let observed: i32 = window::atomic_get_i32(self.flag_ptr(target_rank, d));
                    if observed == n.version || observed == -n.version {
                        window::atomic_put_i32(flag_local, observed);
                    }
                }
            }

            if window::atomic_get_i32(flag_local) == n.version {
                return Some(n);
            }
        }

        None
    }

    /// Bulk-copies the owner's node path `[0, nr.depth]` into the local
    /// slots, resetting the corresponding dominant flags (this worker has not
    /// observed dominance of any of them yet).
    pub fn copy_parents(&mut self, nr: NodeRef) {
        if nr.depth < 0 {
            return;
        }
        for d in 0..=nr.depth {
            window::atomic_put_i32(self.flag_ptr(self.my_rank, d), 0);
        }
        if nr.owner_rank != self.my_rank {
            window::get_bytes(
                self.node_ptr(self.my_rank, 0) as *mut u8,
                self.node_ptr(nr.owner_rank, 0) as *const u8,
                (nr.depth as usize + 1) * mem::size_of::<Node>(),
            );
        }
    }

    /// Reads the local node referenced by `nr`. The reference must be owned
    /// by this rank.
    pub fn get_local_node(&self, nr: NodeRef) -> Node {
        debug_assert_eq!(nr.owner_rank, self.my_rank);
        self.local_node(nr.depth)
    }

    fn local_node(&self, depth: i32) -> Node {
        unsafe { self.node_ptr(self.my_rank, depth).read() }
    }

    fn node_ptr(&self, rank: Rank, depth: i32) -> *mut Node {
        debug_assert!(0 <= depth && (depth as usize) < self.max_depth);
        unsafe { (self.node_win.rank_ptr(rank) as *mut Node).add(depth as usize) }
    }

    fn flag_ptr(&self, rank: Rank, depth: i32) -> *mut i32 {
        debug_assert!(0 <= depth && (depth as usize) < self.max_depth);
        unsafe { (self.flag_win.rank_ptr(rank) as *mut i32).add(depth as usize) }
    }

    fn random_rank(&self, lo: Rank, hi: Rank) -> Rank {
        debug_assert!(lo <= hi);
        self.rng.borrow_mut().gen_range(lo..=hi)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        DistTree,
        NodeRef,
    };
    use crate::runtime::{
        scheduler::{
            drange::DistRange,
            flipper::Flipper,
        },
        topology::Topology,
    };
    use ::anyhow::Result;

    fn tree(tag: &str) -> Result<(Topology, DistTree)> {
        let session: String = format!("spindle-test-dtree-{}-{}", tag, std::process::id());
        let topo: Topology = Topology::attach(0, 1, &session)?;
        let dtree: DistTree = DistTree::create(&topo, 8)?;
        Ok((topo, dtree))
    }

    /// Appended nodes sit one depth below their parent and carry versions
    /// congruent to rank+1 modulo the world size.
    #[test]
    fn append_invariants() -> Result<()> {
        let (_topo, mut dtree): (Topology, DistTree) = tree("append")?;

        let root: NodeRef = NodeRef::default();
        crate::ensure_eq!(root.depth, -1);

        let a: NodeRef = dtree.append(root, DistRange::new(1), Flipper::default());
        crate::ensure_eq!(a.depth, 0);
        crate::ensure_eq!(a.owner_rank, 0);
        let b: NodeRef = dtree.append(a, DistRange::new(1), Flipper::default());
        crate::ensure_eq!(b.depth, 1);

        let node_a = dtree.get_local_node(a);
        crate::ensure_eq!(node_a.depth(), 0);
        crate::ensure_eq!(node_a.parent, root);
        // n_ranks == 1: every version is congruent to my_rank + 1 == 1 mod 1 == 0.
        crate::ensure_neq!(node_a.version, 0);

        // Re-appending at the same depth bumps the version.
        let a2: NodeRef = dtree.append(root, DistRange::new(1), Flipper::default());
        crate::ensure_eq!(a2.depth, 0);
        assert!(dtree.get_local_node(a2).version > node_a.version);
        Ok(())
    }

    /// Dominance set and cleared locally: set_dominant(true) then (false)
    /// leaves the flag at -version, and lookups skip the node.
    #[test]
    fn dominance_round_trip() -> Result<()> {
        let (_topo, mut dtree): (Topology, DistTree) = tree("dom")?;

        let root: NodeRef = NodeRef::default();
        let a: NodeRef = dtree.append(root, DistRange::new(1), Flipper::default());

        crate::ensure_eq!(dtree.get_topmost_dominant(a).is_none(), true);

        dtree.set_dominant(a, true);
        let found = dtree.get_topmost_dominant(a);
        crate::ensure_eq!(found.is_some(), true);
        crate::ensure_eq!(found.unwrap().depth(), 0);

        dtree.set_dominant(a, false);
        crate::ensure_eq!(dtree.get_topmost_dominant(a).is_none(), true);
        Ok(())
    }

    /// The topmost dominant node wins over deeper dominant nodes.
    #[test]
    fn topmost_wins() -> Result<()> {
        let (_topo, mut dtree): (Topology, DistTree) = tree("topmost")?;

        let root: NodeRef = NodeRef::default();
        let a: NodeRef = dtree.append(root, DistRange::from_bounds(0.0, 1.0), Flipper::default());
        let b: NodeRef = dtree.append(a, DistRange::from_bounds(0.0, 0.5), Flipper::default());

        dtree.set_dominant(b, true);
        let found = dtree.get_topmost_dominant(b).unwrap();
        crate::ensure_eq!(found.depth(), 1);

        dtree.set_dominant(a, true);
        let found = dtree.get_topmost_dominant(b).unwrap();
        crate::ensure_eq!(found.depth(), 0);
        Ok(())
    }

    /// Self copy of the parent path resets local flags.
    #[test]
    fn copy_parents_resets_flags() -> Result<()> {
        let (_topo, mut dtree): (Topology, DistTree) = tree("copy")?;

        let root: NodeRef = NodeRef::default();
        let a: NodeRef = dtree.append(root, DistRange::new(1), Flipper::default());
        dtree.set_dominant(a, true);

        dtree.copy_parents(a);
        // Flags were zeroed, so no node is dominant anymore.
        crate::ensure_eq!(dtree.get_topmost_dominant(a).is_none(), true);
        // The node contents survived the copy.
        crate::ensure_eq!(dtree.get_local_node(a).depth(), 0);
        Ok(())
    }
}
