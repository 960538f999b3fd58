//! Deterministic topological ordering.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Orders `count` nodes so that for every `(before, after)` edge `before`
/// comes first.
///
/// Among nodes that are ready at the same time the one with the smallest
/// `key` is emitted first, so the result is a pure function of the edges and
/// the keys. Returns `None` if the edges contain a cycle.
pub fn stable_order<K: Ord>(
    count: usize,
    edges: &[(usize, usize)],
    key: impl Fn(usize) -> K,
) -> Option<Vec<usize>> {
    let mut in_degree = vec![0_usize; count];
    let mut successors = vec![Vec::new(); count];
    for &(before, after) in edges {
        successors[before].push(after);
        in_degree[after] += 1;
    }

    let mut ready: BinaryHeap<Reverse<(K, usize)>> = (0..count)
        .filter(|&n| in_degree[n] == 0)
        .map(|n| Reverse((key(n), n)))
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for &next in &successors[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse((key(next), next)));
            }
        }
    }

    (order.len() == count).then_some(order)
}
