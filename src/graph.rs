use std::collections::{BTreeSet, HashMap, HashSet};

/// Nodes left on a dependency cycle, as a closed path (`a -> b -> a`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle(pub Vec<usize>);

/// Kahn's algorithm over nodes `0..node_count`. Whenever several nodes are
/// ready, the one with the lowest index (earliest insertion) goes first, so the
/// order is a pure function of the graph.
pub fn topo_sort(node_count: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, Cycle> {
    let mut indeg = vec![0usize; node_count];
    let mut outgoing: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to) in edges {
        indeg[to] += 1;
        outgoing.entry(from).or_default().push(to);
    }

    let mut ready: BTreeSet<usize> = (0..node_count).filter(|&n| indeg[n] == 0).collect();
    let mut order = Vec::with_capacity(node_count);

    while let Some(n) = ready.pop_first() {
        order.push(n);
        if let Some(nexts) = outgoing.get(&n) {
            for &m in nexts {
                indeg[m] -= 1;
                if indeg[m] == 0 {
                    ready.insert(m);
                }
            }
        }
    }

    if order.len() != node_count {
        return Err(find_cycle(&indeg, edges));
    }
    Ok(order)
}

// Every node Kahn could not emit still has a predecessor that was not emitted
// either, so walking predecessors from any leftover node must revisit one.
fn find_cycle(indeg: &[usize], edges: &[(usize, usize)]) -> Cycle {
    let stuck = |n: usize| indeg[n] > 0;
    let mut pred: HashMap<usize, usize> = HashMap::new();
    for &(from, to) in edges {
        if stuck(from) && stuck(to) {
            pred.entry(to).or_insert(from);
        }
    }

    let Some(start) = (0..indeg.len()).find(|&n| stuck(n)) else {
        return Cycle(Vec::new());
    };

    let mut walk = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut at = start;
    while let Some(&p) = pred.get(&at) {
        if let Some(&first) = seen.get(&p) {
            // `walk` runs against the edges; emit it in edge direction.
            let mut path = vec![p];
            path.extend(walk[first + 1..].iter().rev());
            path.push(p);
            return Cycle(path);
        }
        seen.insert(p, walk.len());
        walk.push(p);
        at = p;
    }
    Cycle(walk)
}

/// All nodes with a path into any of `seeds`, seeds included.
pub fn upstream_reachable(
    edges: &[(usize, usize)],
    seeds: impl IntoIterator<Item = usize>,
) -> HashSet<usize> {
    let mut incoming: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(from, to) in edges {
        incoming.entry(to).or_default().push(from);
    }

    let mut visited: HashSet<usize> = HashSet::new();
    let mut stack: Vec<usize> = seeds.into_iter().collect();
    while let Some(n) = stack.pop() {
        if !visited.insert(n) {
            continue;
        }
        if let Some(prevs) = incoming.get(&n) {
            stack.extend(prevs.iter().copied());
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ties_break_by_insertion_order() {
        assert_eq!(topo_sort(3, &[]).unwrap(), vec![0, 1, 2]);
        // 2 -> 0 forces 2 first; 1 stays ahead of 0 once both are ready.
        assert_eq!(topo_sort(3, &[(2, 0)]).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn reports_the_cycle_path() {
        let Cycle(path) = topo_sort(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]).unwrap_err();
        assert_eq!(path, vec![1, 2, 1]);

        let Cycle(path) = topo_sort(1, &[(0, 0)]).unwrap_err();
        assert_eq!(path, vec![0, 0]);
    }

    #[test]
    fn upstream_follows_edges_backwards() {
        let edges = [(0, 1), (1, 3), (2, 4)];
        let up = upstream_reachable(&edges, [3]);
        assert_eq!(up, HashSet::from([0, 1, 3]));
    }

    fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1usize..12).prop_flat_map(|n| {
            let edge = (0..n, 0..n).prop_filter_map("forward edges only", |(a, b)| {
                (a < b).then_some((a, b))
            });
            (Just(n), prop::collection::vec(edge, 0..24))
        })
    }

    proptest! {
        #[test]
        fn order_respects_edges_and_is_stable((n, edges) in dag()) {
            let order = topo_sort(n, &edges).unwrap();
            prop_assert_eq!(order.len(), n);
            let pos: HashMap<usize, usize> = order.iter().enumerate().map(|(i, &u)| (u, i)).collect();
            for (a, b) in &edges {
                prop_assert!(pos[a] < pos[b]);
            }
            prop_assert_eq!(topo_sort(n, &edges).unwrap(), order);
        }
    }
}
