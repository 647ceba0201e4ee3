//! pass 之间的依赖图与拓扑排序

use std::collections::BTreeSet;

/// 依赖图
///
/// 节点是 pass 在图中的声明序号，边从 producer 指向 consumer。
pub struct DependencyGraph {
    pass_count: usize,
    /// 出边：producer -> [consumer]
    successors: Vec<Vec<usize>>,
    /// 入边：consumer -> [producer]
    predecessors: Vec<Vec<usize>>,
}

// new & init
impl DependencyGraph {
    pub fn new(pass_count: usize) -> Self {
        Self {
            pass_count,
            successors: vec![Vec::new(); pass_count],
            predecessors: vec![Vec::new(); pass_count],
        }
    }

    /// 添加依赖边，重复的边和自环被忽略
    pub fn add_edge(&mut self, producer: usize, consumer: usize) {
        if producer == consumer || self.successors[producer].contains(&consumer) {
            return;
        }
        self.successors[producer].push(consumer);
        self.predecessors[consumer].push(producer);
    }
}

// getters
impl DependencyGraph {
    #[inline]
    pub fn pass_count(&self) -> usize {
        self.pass_count
    }

    /// 直接依赖（前驱）
    #[inline]
    pub fn predecessors(&self, pass: usize) -> &[usize] {
        &self.predecessors[pass]
    }

    /// 直接后继
    #[inline]
    pub fn successors(&self, pass: usize) -> &[usize] {
        &self.successors[pass]
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }
}

// tools
impl DependencyGraph {
    /// 从 roots 出发沿入边反向遍历，返回所有被（直接或间接）依赖的 pass，包括 roots 自身
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        let mut visited = BTreeSet::new();
        let mut stack = roots.into_iter().collect::<Vec<_>>();
        while let Some(pass) = stack.pop() {
            if visited.insert(pass) {
                stack.extend(self.predecessors[pass].iter().copied().filter(|p| !visited.contains(p)));
            }
        }
        visited
    }

    /// 对 `subset` 中的 pass 做拓扑排序，忽略 subset 之外的边
    ///
    /// 同时可以执行的 pass 中总是先选择声明序号最小的，所以同一张图每次得到相同的顺序。
    ///
    /// # 返回
    /// - `Ok(order)`: 排好序的 pass
    /// - `Err(remaining)`: 存在环，返回无法排序的 pass
    pub fn topological_sort(&self, subset: &BTreeSet<usize>) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degrees = vec![0usize; self.pass_count];
        for &pass in subset {
            in_degrees[pass] = self.predecessors[pass].iter().filter(|p| subset.contains(p)).count();
        }

        let mut ready = subset.iter().copied().filter(|p| in_degrees[*p] == 0).collect::<BTreeSet<_>>();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(pass) = ready.pop_first() {
            order.push(pass);
            for &next in &self.successors[pass] {
                if !subset.contains(&next) {
                    continue;
                }
                in_degrees[next] -= 1;
                if in_degrees[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() == subset.len() {
            Ok(order)
        } else {
            Err(subset.iter().copied().filter(|p| in_degrees[*p] > 0).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(graph: &DependencyGraph) -> BTreeSet<usize> {
        (0..graph.pass_count()).collect()
    }

    #[test]
    fn test_chain_dependency() {
        // 2 -> 0 -> 1
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(2, 0);
        graph.add_edge(0, 1);

        assert_eq!(graph.topological_sort(&all(&graph)).unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn test_independent_passes_keep_declaration_order() {
        // 0 与 1 互不依赖，都在 2 之前
        let mut graph = DependencyGraph::new(4);
        graph.add_edge(1, 2);
        graph.add_edge(0, 2);
        graph.add_edge(3, 2);

        for _ in 0..8 {
            assert_eq!(graph.topological_sort(&all(&graph)).unwrap(), vec![0, 1, 3, 2]);
        }
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let mut graph = DependencyGraph::new(2);
        graph.add_edge(0, 1);
        graph.add_edge(0, 1);
        graph.add_edge(1, 1);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.predecessors(1), &[0]);
    }

    #[test]
    fn test_cycle_reported() {
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(0, 1);
        graph.add_edge(1, 0);
        graph.add_edge(1, 2);

        let remaining = graph.topological_sort(&all(&graph)).unwrap_err();
        assert_eq!(remaining, vec![0, 1, 2]);
    }

    #[test]
    fn test_reachable_excludes_unrelated() {
        // 0 -> 1 -> 3, 2 没有被 3 依赖
        let mut graph = DependencyGraph::new(4);
        graph.add_edge(0, 1);
        graph.add_edge(1, 3);
        graph.add_edge(2, 2);

        let reachable = graph.reachable_from([3]);
        assert_eq!(reachable.into_iter().collect::<Vec<_>>(), vec![0, 1, 3]);
    }

    #[test]
    fn test_sort_subset() {
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(0, 2);
        graph.add_edge(1, 2);

        let subset = BTreeSet::from([1, 2]);
        assert_eq!(graph.topological_sort(&subset).unwrap(), vec![1, 2]);
    }

    /// 4 个 pass 之间所有有向边的组合
    fn every_graph_of_four() -> impl Iterator<Item = (DependencyGraph, Vec<(usize, usize)>)> {
        let pairs = (0..4)
            .flat_map(|a| (0..4).map(move |b| (a, b)))
            .filter(|(a, b)| a != b)
            .collect::<Vec<_>>();
        (0u32..1 << pairs.len()).map(move |mask| {
            let edges = pairs
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << bit) != 0)
                .map(|(_, edge)| *edge)
                .collect::<Vec<_>>();
            let mut graph = DependencyGraph::new(4);
            edges.iter().for_each(|(a, b)| graph.add_edge(*a, *b));
            (graph, edges)
        })
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        (0..items.len())
            .flat_map(|i| {
                let mut rest = items.to_vec();
                let first = rest.remove(i);
                permutations(&rest).into_iter().map(move |mut tail| {
                    tail.insert(0, first);
                    tail
                })
            })
            .collect()
    }

    fn respects(order: &[usize], edges: &[(usize, usize)]) -> bool {
        let position = |pass: usize| order.iter().position(|p| *p == pass);
        edges.iter().all(|(a, b)| position(*a) < position(*b))
    }

    #[test]
    fn test_sort_exhaustive_small_graphs() {
        let orders = permutations(&[0, 1, 2, 3]);
        for (graph, edges) in every_graph_of_four() {
            let acyclic = orders.iter().any(|order| respects(order, &edges));
            match graph.topological_sort(&all(&graph)) {
                Ok(order) => {
                    assert!(acyclic, "sorted a cyclic graph {:?}", edges);
                    assert_eq!(order.len(), 4);
                    assert!(respects(&order, &edges), "order {:?} breaks {:?}", order, edges);
                    // 字典序最小的合法顺序
                    let smallest = orders.iter().filter(|o| respects(o, &edges)).min().unwrap();
                    assert_eq!(&order, smallest);
                    assert_eq!(graph.topological_sort(&all(&graph)).unwrap(), order);
                }
                Err(remaining) => {
                    assert!(!acyclic, "rejected an acyclic graph {:?}", edges);
                    // 剩下的 pass 都还有未排序的前驱
                    let remaining = remaining.into_iter().collect::<BTreeSet<_>>();
                    assert!(remaining.iter().all(|p| graph.predecessors(*p).iter().any(|q| remaining.contains(q))));
                }
            }
        }
    }

    #[test]
    fn test_reachable_is_closed_over_predecessors() {
        for (graph, _) in every_graph_of_four() {
            for root in 0..4 {
                let reachable = graph.reachable_from([root]);
                assert!(reachable.contains(&root));
                assert!(reachable.iter().all(|p| graph.predecessors(*p).iter().all(|q| reachable.contains(q))));
            }
        }
    }
}
