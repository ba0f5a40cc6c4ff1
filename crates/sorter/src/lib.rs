//! Deterministic block transaction ordering.
//!
//! Every node must emit the same order for the same multiset of transactions,
//! no matter how the parser happened to enumerate them and no matter which
//! witness variant of a transaction a peer was shown. The ordering rules:
//!
//! - coinbase transactions first
//! - a transaction never precedes a present parent; when several witness
//!   variants share a txid, a child referencing that txid follows all of them
//! - selection by effective priority: a transaction inherits the highest
//!   priority fee of any present descendant (child pays for parent)
//! - ties break on SHA-256 over the wtxid, compared lexicographically; the
//!   wtxid is the only identifier that distinguishes witness variants, so a
//!   malleated variant cannot collide with the original in the queue
//!
//! Reference cycles are folded into one strongly connected component and
//! emitted together. References to txids not present in the set are treated
//! as satisfied by external state.

use opnet_types::{SortableTransaction, Txid, Wtxid};
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

/// Input invariant violations. The sorter never panics on well-formed input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedInputError {
    /// Two input records carried the same wtxid.
    #[error("duplicate wtxid {0}")]
    DuplicateWtxid(Wtxid),
}

/// Sort a block's transactions into their canonical emission order.
pub fn sort_transactions(
    transactions: Vec<SortableTransaction>,
) -> Result<Vec<SortableTransaction>, MalformedInputError> {
    if transactions.is_empty() {
        return Ok(transactions);
    }

    let graph = Graph::build(&transactions)?;
    let order = graph.emission_order();

    // reorder the owned transactions without cloning
    let mut slots: Vec<Option<SortableTransaction>> = transactions.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|i| slots[i].take().expect("emission order visits each node once"))
        .collect())
}

struct Node {
    tiebreak: [u8; 32],
    fee: u64,
    coinbase: bool,
    /// Indices of present transactions this node depends on.
    parents: Vec<usize>,
}

struct Graph {
    nodes: Vec<Node>,
    /// children[i] = nodes that depend on node i.
    children: Vec<Vec<usize>>,
}

impl Graph {
    fn build(transactions: &[SortableTransaction]) -> Result<Self, MalformedInputError> {
        let mut by_wtxid: HashMap<Wtxid, usize> = HashMap::with_capacity(transactions.len());
        let mut by_txid: HashMap<Txid, Vec<usize>> = HashMap::new();
        for (i, tx) in transactions.iter().enumerate() {
            if by_wtxid.insert(tx.wtxid, i).is_some() {
                return Err(MalformedInputError::DuplicateWtxid(tx.wtxid));
            }
            by_txid.entry(tx.txid).or_default().push(i);
        }

        let mut nodes = Vec::with_capacity(transactions.len());
        let mut children = vec![Vec::new(); transactions.len()];
        for (i, tx) in transactions.iter().enumerate() {
            let mut parents = Vec::new();
            for parent in tx.parent_txids() {
                // a child of txid X depends on every present variant of X;
                // absent parents are satisfied by external state
                if let Some(variants) = by_txid.get(&parent) {
                    for &p in variants {
                        if p != i {
                            parents.push(p);
                            children[p].push(i);
                        }
                    }
                }
            }
            parents.sort_unstable();
            parents.dedup();
            nodes.push(Node {
                tiebreak: tx.indexing_hash(),
                fee: tx.priority_fee,
                coinbase: tx.is_coinbase(),
                parents,
            });
        }
        for list in &mut children {
            list.sort_unstable();
            list.dedup();
        }
        Ok(Self { nodes, children })
    }

    fn emission_order(&self) -> Vec<usize> {
        let components = self.condense();
        let comp_count = components.assignments.iter().copied().max().map_or(0, |m| m + 1);

        // members per component, each sorted by tiebreak hash
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); comp_count];
        for (node, &comp) in components.assignments.iter().enumerate() {
            members[comp].push(node);
        }
        for list in &mut members {
            list.sort_by(|&a, &b| self.nodes[a].tiebreak.cmp(&self.nodes[b].tiebreak));
        }

        // condensation edges and indegrees
        let mut comp_children: Vec<Vec<usize>> = vec![Vec::new(); comp_count];
        let mut indegree = vec![0usize; comp_count];
        for (node, kids) in self.children.iter().enumerate() {
            let from = components.assignments[node];
            for &kid in kids {
                let to = components.assignments[kid];
                if from != to {
                    comp_children[from].push(to);
                }
            }
        }
        for kids in &mut comp_children {
            kids.sort_unstable();
            kids.dedup();
        }
        for kids in &comp_children {
            for &to in kids {
                indegree[to] += 1;
            }
        }

        // effective priority: own fees folded with every dependent component.
        // Tarjan emits components children-first, so one reverse pass suffices.
        let mut effective = vec![0u64; comp_count];
        for comp in 0..comp_count {
            let own = members[comp].iter().map(|&n| self.nodes[n].fee).max().unwrap_or(0);
            let inherited =
                comp_children[comp].iter().map(|&c| effective[c]).max().unwrap_or(0);
            effective[comp] = own.max(inherited);
        }

        let coinbase: Vec<bool> = members
            .iter()
            .map(|list| list.iter().any(|&n| self.nodes[n].coinbase))
            .collect();

        let mut ready = BinaryHeap::new();
        for comp in 0..comp_count {
            if indegree[comp] == 0 {
                ready.push(Ready {
                    coinbase: coinbase[comp],
                    effective: effective[comp],
                    tiebreak: self.nodes[members[comp][0]].tiebreak,
                    comp,
                });
            }
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Ready { comp, .. }) = ready.pop() {
            order.extend(members[comp].iter().copied());
            for &child in &comp_children[comp] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.push(Ready {
                        coinbase: coinbase[child],
                        effective: effective[child],
                        tiebreak: self.nodes[members[child][0]].tiebreak,
                        comp: child,
                    });
                }
            }
        }
        debug_assert_eq!(order.len(), self.nodes.len());
        order
    }

    /// Tarjan strongly connected components over the parent → child edges.
    ///
    /// Components come out children-first: for any edge across components the
    /// child's component index is smaller than the parent's.
    fn condense(&self) -> Condensation {
        let n = self.nodes.len();
        let mut state = TarjanState {
            index: vec![usize::MAX; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            assignments: vec![0; n],
            next_index: 0,
            next_comp: 0,
        };
        for v in 0..n {
            if state.index[v] == usize::MAX {
                self.strong_connect(v, &mut state);
            }
        }
        Condensation { assignments: state.assignments }
    }

    fn strong_connect(&self, root: usize, state: &mut TarjanState) {
        // iterative to keep deep chains off the call stack
        let mut work = vec![(root, 0usize)];
        while let Some(&mut (v, ref mut edge)) = work.last_mut() {
            if *edge == 0 {
                state.index[v] = state.next_index;
                state.lowlink[v] = state.next_index;
                state.next_index += 1;
                state.stack.push(v);
                state.on_stack[v] = true;
            }
            if *edge < self.children[v].len() {
                let w = self.children[v][*edge];
                *edge += 1;
                if state.index[w] == usize::MAX {
                    work.push((w, 0));
                } else if state.on_stack[w] {
                    state.lowlink[v] = state.lowlink[v].min(state.index[w]);
                }
            } else {
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    state.lowlink[parent] = state.lowlink[parent].min(state.lowlink[v]);
                }
                if state.lowlink[v] == state.index[v] {
                    loop {
                        let w = state.stack.pop().expect("scc stack underflow");
                        state.on_stack[w] = false;
                        state.assignments[w] = state.next_comp;
                        if w == v {
                            break;
                        }
                    }
                    state.next_comp += 1;
                }
            }
        }
    }
}

struct TarjanState {
    index: Vec<usize>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    assignments: Vec<usize>,
    next_index: usize,
    next_comp: usize,
}

struct Condensation {
    assignments: Vec<usize>,
}

/// Heap entry; `BinaryHeap` pops the greatest, so the ordering puts coinbase
/// components above everything, then higher effective priority, then the
/// lexicographically smaller tiebreak hash.
#[derive(PartialEq, Eq)]
struct Ready {
    coinbase: bool,
    effective: u64,
    tiebreak: [u8; 32],
    comp: usize,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.coinbase
            .cmp(&other.coinbase)
            .then(self.effective.cmp(&other.effective))
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
            .then_with(|| other.comp.cmp(&self.comp))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::{seq::SliceRandom, SeedableRng};

    fn id(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    /// Build a node: distinct wtxid, explicit txid, fee and parent txids.
    fn tx(wtxid: u8, txid: u8, fee: u64, parents: &[u8]) -> SortableTransaction {
        SortableTransaction::new(
            Txid(id(txid)),
            Wtxid(id(wtxid)),
            fee,
            parents.iter().map(|p| Bytes::copy_from_slice(&id(*p))).collect(),
        )
    }

    fn coinbase(wtxid: u8, txid: u8) -> SortableTransaction {
        SortableTransaction::new(
            Txid(id(txid)),
            Wtxid(id(wtxid)),
            0,
            vec![Bytes::from_static(&[0u8; 32])],
        )
    }

    fn wtxids(sorted: &[SortableTransaction]) -> Vec<Wtxid> {
        sorted.iter().map(|t| t.wtxid).collect()
    }

    #[test]
    fn cpfp_chain_outranks_higher_standalone_fee() {
        // a(1) <- b(2) <- c(3) <- d(50), plus standalone e(40):
        // the chain inherits d's fee and must be emitted before e.
        let input = vec![
            tx(0xa1, 0x0a, 1, &[]),
            tx(0xb1, 0x0b, 2, &[0x0a]),
            tx(0xc1, 0x0c, 3, &[0x0b]),
            tx(0xd1, 0x0d, 50, &[0x0c]),
            tx(0xe1, 0x0e, 40, &[]),
        ];
        let sorted = sort_transactions(input).unwrap();
        assert_eq!(
            wtxids(&sorted),
            vec![Wtxid(id(0xa1)), Wtxid(id(0xb1)), Wtxid(id(0xc1)), Wtxid(id(0xd1)), Wtxid(id(0xe1))]
        );
    }

    #[test]
    fn witness_variants_order_identically_and_precede_children() {
        // two witness variants of txid 0xaa, a sibling, and a child of 0xaa
        let nodes = vec![
            tx(0x11, 0xaa, 100, &[]),
            tx(0x22, 0xaa, 100, &[]),
            tx(0x33, 0xbb, 100, &[]),
            tx(0x44, 0xcc, 50, &[0xaa]),
        ];

        let reference = sort_transactions(nodes.clone()).unwrap();
        let child_pos = reference.iter().position(|t| t.wtxid == Wtxid(id(0x44))).unwrap();
        for variant in [0x11u8, 0x22] {
            let pos = reference.iter().position(|t| t.wtxid == Wtxid(id(variant))).unwrap();
            assert!(pos < child_pos, "child emitted before variant {variant:#x}");
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..24 {
            let mut shuffled = nodes.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(wtxids(&sort_transactions(shuffled).unwrap()), wtxids(&reference));
        }
    }

    #[test]
    fn permutation_determinism_on_random_graphs() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        // 20 nodes with txids 1..=20, random sparse parent references (some
        // of them dangling)
        let nodes: Vec<SortableTransaction> = (1u8..=20)
            .map(|i| {
                let parents: Vec<u8> = (1u8..=20)
                    .filter(|p| *p != i && rand::Rng::gen_bool(&mut rng, 0.15))
                    .collect();
                tx(i + 100, i, u64::from(i % 7) * 10, &parents)
            })
            .collect();

        let reference = wtxids(&sort_transactions(nodes.clone()).unwrap());
        for _ in 0..16 {
            let mut shuffled = nodes.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(wtxids(&sort_transactions(shuffled).unwrap()), reference);
        }
    }

    #[test]
    fn parents_always_precede_children() {
        let nodes = vec![
            tx(1, 1, 5, &[]),
            tx(2, 2, 90, &[1]),
            tx(3, 3, 1, &[1, 2]),
            tx(4, 4, 60, &[]),
            tx(5, 5, 10, &[4]),
        ];
        let sorted = sort_transactions(nodes).unwrap();
        let pos =
            |w: u8| sorted.iter().position(|t| t.wtxid == Wtxid(id(w))).expect("node present");
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(3));
        assert!(pos(4) < pos(5));
    }

    #[test]
    fn coinbase_is_emitted_first() {
        let nodes = vec![tx(2, 2, 1_000, &[]), coinbase(1, 1), tx(3, 3, 999, &[2])];
        let sorted = sort_transactions(nodes).unwrap();
        assert_eq!(sorted[0].wtxid, Wtxid(id(1)));
    }

    #[test]
    fn cycles_fold_into_one_component() {
        // 1 -> 2 -> 3 -> 1 cycle plus a child hanging off it
        let nodes = vec![
            tx(1, 1, 10, &[3]),
            tx(2, 2, 10, &[1]),
            tx(3, 3, 10, &[2]),
            tx(4, 4, 5, &[3]),
        ];
        let reference = sort_transactions(nodes.clone()).unwrap();
        // the child follows the whole cycle
        let pos =
            |w: u8| reference.iter().position(|t| t.wtxid == Wtxid(id(w))).expect("node present");
        assert!(pos(4) > pos(1) && pos(4) > pos(2) && pos(4) > pos(3));

        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for _ in 0..12 {
            let mut shuffled = nodes.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(wtxids(&sort_transactions(shuffled).unwrap()), wtxids(&reference));
        }
    }

    #[test]
    fn self_reference_does_not_loop() {
        let nodes = vec![tx(1, 1, 10, &[1]), tx(2, 2, 5, &[1])];
        let sorted = sort_transactions(nodes).unwrap();
        assert_eq!(wtxids(&sorted), vec![Wtxid(id(1)), Wtxid(id(2))]);
    }

    #[test]
    fn absent_parents_are_ignored() {
        let nodes = vec![tx(1, 1, 1, &[0x77]), tx(2, 2, 2, &[0x88])];
        let sorted = sort_transactions(nodes).unwrap();
        assert_eq!(sorted.len(), 2);
    }

    #[test]
    fn duplicate_wtxid_is_malformed() {
        let nodes = vec![tx(1, 1, 1, &[]), tx(1, 2, 2, &[])];
        assert_eq!(
            sort_transactions(nodes).unwrap_err(),
            MalformedInputError::DuplicateWtxid(Wtxid(id(1)))
        );
    }

    #[test]
    fn empty_input_is_fine() {
        assert!(sort_transactions(Vec::new()).unwrap().is_empty());
    }
}
