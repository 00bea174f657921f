//! Execution order of intra-file copies.
//!
//! Every non-identity copy is a node. There is an edge `A -> B` when `B`
//! writes the block `A` reads, so `A` must run first. A block has at most
//! one writer, so each node has at most one outgoing edge: the graph is
//! functional and every weakly connected component holds at most one cycle.
//!
//! Kahn's algorithm orders the acyclic part. When it stalls, the nodes left
//! over are exactly the cycle members. For each cycle the member with the
//! lowest destination is marked to read its source from the scratch area,
//! which removes its outgoing edge and lets the rest of the cycle drain.
//! Cycles are vertex-disjoint, so one staged read per cycle is the smallest
//! number that makes the graph acyclic.
//!
//! ```text
//!  (2→1) ──▶ (1→2)          (1→2) runs first, reading live block 1
//!    ▲          │     ⇒     (2→1) then reads block 2 from scratch
//!    └──────────┘
//! ```

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use super::LocalCopy;

/// Orders `(source, dest)` pairs so that every live read precedes the write
/// that overwrites it.
///
/// Identity pairs are placed first, in input order. Destinations must be
/// unique.
#[must_use]
pub fn order_copies(pairs: &[(usize, usize)]) -> Vec<LocalCopy> {
    let mut ordered = Vec::with_capacity(pairs.len());
    let mut nodes = Vec::new();
    for &(source, dest) in pairs {
        if source == dest {
            ordered.push(LocalCopy {
                source,
                dest,
                from_scratch: false,
            });
        } else {
            nodes.push((source, dest));
        }
    }

    let writer_of: FxHashMap<usize, usize> = nodes
        .iter()
        .enumerate()
        .map(|(node, &(_, dest))| (dest, node))
        .collect();
    debug_assert_eq!(writer_of.len(), nodes.len(), "destinations must be unique");

    let mut successor: Vec<Option<usize>> = nodes
        .iter()
        .map(|&(source, _)| writer_of.get(&source).copied())
        .collect();
    let mut in_degree = vec![0usize; nodes.len()];
    for next in successor.iter().flatten() {
        in_degree[*next] += 1;
    }

    let mut from_scratch = vec![false; nodes.len()];
    let mut done = vec![false; nodes.len()];
    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&n| in_degree[n] == 0).collect();

    // Nodes by ascending destination, consulted when Kahn stalls on a cycle.
    let mut by_dest: Vec<usize> = (0..nodes.len()).collect();
    by_dest.sort_unstable_by_key(|&node| nodes[node].1);
    let mut cursor = 0;
    let mut emitted = 0;

    while emitted < nodes.len() {
        while let Some(node) = ready.pop_front() {
            done[node] = true;
            emitted += 1;
            let (source, dest) = nodes[node];
            ordered.push(LocalCopy {
                source,
                dest,
                from_scratch: from_scratch[node],
            });
            if let Some(next) = successor[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if emitted == nodes.len() {
            break;
        }

        while done[by_dest[cursor]] {
            cursor += 1;
        }
        let breaker = by_dest[cursor];
        from_scratch[breaker] = true;
        if let Some(next) = successor[breaker].take() {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn position(order: &[LocalCopy], dest: usize) -> usize {
        order
            .iter()
            .position(|copy| copy.dest == dest)
            .expect("copy present")
    }

    fn assert_valid(order: &[LocalCopy]) {
        for reader in order.iter().filter(|copy| !copy.is_identity() && !copy.from_scratch) {
            if let Some(writer) = order
                .iter()
                .find(|copy| !copy.is_identity() && copy.dest == reader.source)
            {
                assert!(
                    position(order, reader.dest) < position(order, writer.dest),
                    "{reader:?} must run before {writer:?}"
                );
            }
        }
    }

    #[test]
    fn swap_routes_one_side_through_scratch() {
        let order = order_copies(&[(0, 0), (2, 1), (1, 2)]);
        assert_eq!(
            order,
            [
                LocalCopy {
                    source: 0,
                    dest: 0,
                    from_scratch: false,
                },
                LocalCopy {
                    source: 1,
                    dest: 2,
                    from_scratch: false,
                },
                LocalCopy {
                    source: 2,
                    dest: 1,
                    from_scratch: true,
                },
            ]
        );
        assert_valid(&order);
    }

    #[test]
    fn chain_runs_from_the_reader_end() {
        // 0 moves to 1, 1 moves to 2, 2 moves to 3: a shift right.
        let order = order_copies(&[(0, 1), (1, 2), (2, 3)]);
        let dests: Vec<usize> = order.iter().map(|copy| copy.dest).collect();
        assert_eq!(dests, [3, 2, 1]);
        assert!(order.iter().all(|copy| !copy.from_scratch));
    }

    #[test]
    fn rotation_breaks_once() {
        let order = order_copies(&[(1, 0), (2, 1), (3, 2), (0, 3)]);
        assert_eq!(order.iter().filter(|copy| copy.from_scratch).count(), 1);
        assert!(order[3].from_scratch);
        assert_valid(&order);
    }

    #[test]
    fn shared_source_readers_precede_its_writer() {
        // Block 0 is read twice and overwritten once.
        let order = order_copies(&[(0, 1), (0, 2), (3, 0)]);
        assert_valid(&order);
        assert!(order.iter().all(|copy| !copy.from_scratch));
        assert_eq!(order.last().map(|copy| copy.dest), Some(0));
    }

    #[test]
    fn disjoint_cycles_each_stage_one_read() {
        let order = order_copies(&[(1, 0), (0, 1), (3, 2), (2, 3), (5, 4)]);
        assert_eq!(order.iter().filter(|copy| copy.from_scratch).count(), 2);
        assert_valid(&order);
    }

    fn permutation_pairs() -> impl Strategy<Value = Vec<(usize, usize)>> {
        (1usize..24).prop_flat_map(|len| {
            (
                Just(len),
                prop::collection::vec(0usize..len, len),
                Just((0..len).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
        .prop_map(|(len, sources, dests)| {
            // Each destination gets a source drawn from the current blocks.
            (0..len).map(|i| (sources[i], dests[i])).collect()
        })
    }

    proptest! {
        #[test]
        fn every_copy_is_emitted_once(pairs in permutation_pairs()) {
            let order = order_copies(&pairs);
            prop_assert_eq!(order.len(), pairs.len());
            let mut dests: Vec<usize> = order.iter().map(|copy| copy.dest).collect();
            dests.sort_unstable();
            let mut expected: Vec<usize> = pairs.iter().map(|&(_, dest)| dest).collect();
            expected.sort_unstable();
            prop_assert_eq!(dests, expected);
        }

        #[test]
        fn live_reads_precede_overwrites(pairs in permutation_pairs()) {
            let order = order_copies(&pairs);
            assert_valid(&order);
        }
    }
}
